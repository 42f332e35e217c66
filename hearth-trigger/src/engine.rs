//! The async engine wrapping [`TriggerSet`].
//!
//! A single task owns the set. Other components talk to it by message:
//! the runtime sends [`TriggerCommand`]s, the hub feeds state changes
//! through its broadcast bus, and fired triggers come out of one bounded
//! channel.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use hearth_hub::HubEvent;
use hearth_store::{Signal, Store};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::set::{TriggerEvent, TriggerSet};
use crate::TriggerError;

/// Maximum sleep between polls. Keeps the cron source at roughly 1 Hz
/// and bounds how stale a wall-clock jump can get before detection.
const MAX_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// A detected wall-clock jump larger than this forces deadline
/// recomputation.
const CLOCK_JUMP_THRESHOLD: Duration = Duration::seconds(30);

/// Commands the runtime sends to the engine.
#[derive(Debug)]
pub enum TriggerCommand {
    /// Arm a freshly inserted signal.
    Add(Signal),
    /// Disarm one signal.
    Kill(i64),
    /// Disarm every signal for an automation hash.
    KillHash(String),
}

/// Handle the runtime keeps after starting the engine.
pub struct EngineHandle {
    /// Command channel into the engine task.
    pub commands: mpsc::Sender<TriggerCommand>,
    /// Fired triggers, in emission order.
    pub events: mpsc::Receiver<TriggerEvent>,
}

/// The trigger engine. Owns the [`TriggerSet`] for its lifetime; holds
/// only a read handle to the store.
pub struct TriggerEngine {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    tz: Tz,
    hub_events: Option<broadcast::Receiver<HubEvent>>,
    commands: mpsc::Receiver<TriggerCommand>,
    out: mpsc::Sender<TriggerEvent>,
}

impl TriggerEngine {
    /// Build an engine and the handle the runtime keeps.
    pub fn new(
        store: Arc<Store>,
        clock: Arc<dyn Clock>,
        tz: Tz,
        hub_events: broadcast::Receiver<HubEvent>,
    ) -> (Self, EngineHandle) {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(64);
        (
            Self {
                store,
                clock,
                tz,
                hub_events: Some(hub_events),
                commands: command_rx,
                out: event_tx,
            },
            EngineHandle {
                commands: command_tx,
                events: event_rx,
            },
        )
    }

    /// Run until cancelled.
    ///
    /// Reconstitutes the set from all alive signals, then loops: sleep to
    /// the next deadline (capped for jump detection), apply hub events
    /// and commands as they arrive, emit fired triggers. Missed one-shots
    /// fire on the first poll; missed cron ticks do not.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), TriggerError> {
        let mut set = TriggerSet::new(self.tz);
        let now = self.clock.now_utc();
        for signal in self
            .store
            .alive_signals()
            .await
            .map_err(|e| TriggerError::Store(e.to_string()))?
        {
            if let Err(err) = set.add(signal.clone(), now) {
                // A stored signal that no longer parses is dropped from
                // scheduling but left alive in the store for inspection.
                tracing::warn!(signal_id = signal.id, error = %err, "could not arm stored signal");
            }
        }
        tracing::info!(armed = set.len(), "trigger engine started");

        let mut expected_wake: Option<DateTime<Utc>> = None;

        loop {
            let now = self.clock.now_utc();
            if let Some(expected) = expected_wake.take() {
                let drift = (now - expected).abs();
                if drift > CLOCK_JUMP_THRESHOLD {
                    tracing::info!(drift_s = drift.num_seconds(), "wall-clock jump detected, recomputing deadlines");
                }
            }

            let sleep_for = match set.next_deadline(now) {
                Some(deadline) if deadline > now => {
                    let until = (deadline - now)
                        .to_std()
                        .unwrap_or(MAX_POLL_INTERVAL);
                    until.min(MAX_POLL_INTERVAL)
                }
                Some(_) => std::time::Duration::ZERO,
                None => MAX_POLL_INTERVAL,
            };
            expected_wake = Some(now + Duration::from_std(sleep_for).unwrap_or_else(|_| Duration::zero()));

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("trigger engine stopping");
                    return Ok(());
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        // Runtime dropped its handle; nothing left to do.
                        return Ok(());
                    };
                    self.apply(&mut set, command);
                }
                event = next_hub_event(&mut self.hub_events) => {
                    if let Some(change) = event.as_state_change() {
                        let fired = set.on_state_change(&change, self.clock.now_utc());
                        self.emit(fired).await;
                    }
                }
                _ = tokio::time::sleep(sleep_for) => {
                    let fired = set.poll(self.clock.now_utc());
                    self.emit(fired).await;
                }
            }
        }
    }

    fn apply(&self, set: &mut TriggerSet, command: TriggerCommand) {
        match command {
            TriggerCommand::Add(signal) => {
                let id = signal.id;
                if let Err(err) = set.add(signal, self.clock.now_utc()) {
                    tracing::warn!(signal_id = id, error = %err, "could not arm signal");
                }
            }
            TriggerCommand::Kill(id) => set.remove(id),
            TriggerCommand::KillHash(hash) => set.remove_hash(&hash),
        }
    }

    async fn emit(&self, fired: Vec<TriggerEvent>) {
        for event in fired {
            tracing::debug!(
                hash = %event.automation_hash,
                signal_id = event.signal.id,
                kind = event.signal.data.kind(),
                "trigger fired"
            );
            if self.out.send(event).await.is_err() {
                return;
            }
        }
    }
}

/// Next hub event, pending forever once the bus is gone so the select
/// arm never busy-loops. Lagged gaps are tolerated.
async fn next_hub_event(rx: &mut Option<broadcast::Receiver<HubEvent>>) -> HubEvent {
    loop {
        match rx {
            Some(receiver) => match receiver.recv().await {
                Ok(event) => return event,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "hub event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    *rx = None;
                }
            },
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use hearth_hub::{HubClient, MockHub};
    use hearth_store::SignalData;

    async fn start_engine(
        store: Arc<Store>,
        hub: &MockHub,
    ) -> (EngineHandle, CancellationToken) {
        let clock = Arc::new(SystemClock);
        let (engine, handle) =
            TriggerEngine::new(store, clock, chrono_tz::UTC, hub.events());
        let cancel = CancellationToken::new();
        let engine_cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = engine.run(engine_cancel).await;
        });
        (handle, cancel)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn absolute_time_signal_fires() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let at = Utc::now() + Duration::milliseconds(50);
        let id = store
            .insert_signal("hash-a", &SignalData::Time { at })
            .await
            .unwrap();

        let hub = MockHub::new();
        let (mut handle, cancel) = start_engine(store, &hub).await;

        let event = tokio::time::timeout(std::time::Duration::from_secs(2), handle.events.recv())
            .await
            .expect("signal should fire within two seconds")
            .expect("engine should still be running");
        assert_eq!(event.signal.id, id);
        assert_eq!(event.automation_hash, "hash-a");
        cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn state_change_fires_regex_signal() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .insert_signal(
                "hash-door",
                &SignalData::State {
                    entity_ids: vec!["binary_sensor.front_door".into()],
                    regex: "on|open".into(),
                },
            )
            .await
            .unwrap();

        let hub = MockHub::new();
        let (mut handle, cancel) = start_engine(store, &hub).await;

        // Give the engine a moment to arm before emitting.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        hub.set_state("binary_sensor.front_door", "on");

        let event = tokio::time::timeout(std::time::Duration::from_secs(2), handle.events.recv())
            .await
            .expect("state change should fire")
            .expect("engine should still be running");
        assert_eq!(event.automation_hash, "hash-door");
        cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn kill_hash_command_disarms() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let at = Utc::now() + Duration::milliseconds(200);
        store
            .insert_signal("hash-a", &SignalData::Time { at })
            .await
            .unwrap();

        let hub = MockHub::new();
        let (mut handle, cancel) = start_engine(store, &hub).await;

        handle
            .commands
            .send(TriggerCommand::KillHash("hash-a".into()))
            .await
            .unwrap();

        let fired =
            tokio::time::timeout(std::time::Duration::from_millis(600), handle.events.recv())
                .await;
        assert!(fired.is_err(), "killed hash must not fire");
        cancel.cancel();
    }
}
