//! The top-level coordinator.
//!
//! Owns the store and the trigger engine, watches the notebook, and
//! turns signals into jobs: a *scheduling* job derives triggers from an
//! automation's prose, an *execution* job carries a fired automation
//! out. Jobs for distinct automations run concurrently on a bounded
//! worker pool; jobs for the same hash are serialized, with a small
//! pending queue that coalesces to the latest event when saturated.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use hearth_hub::HubClient;
use hearth_loop::{LoopConfig, ToolLoop};
use hearth_store::{LogType, NewAutomationLog, Store};
use hearth_tool::ToolRouter;
use hearth_tools::{
    execution_server, scheduling_server, ExecContext, MemoryFile, ScheduleContext,
};
use hearth_trigger::{Clock, EngineHandle, TriggerCommand, TriggerEngine, TriggerEvent};
use hearth_types::Message;
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::factory::{parse_model_directive, LlmFactory};
use crate::notebook::{self, Automation, NotebookEvent};
use crate::prompts;
use crate::RuntimeError;

/// Per-automation pending queue depth before coalescing kicks in.
const QUEUE_DEPTH: usize = 16;

/// Grace period for in-flight jobs at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Why [`Runtime::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Clean shutdown was requested.
    Shutdown,
    /// The notebook directory itself changed; the caller should tear
    /// down and boot again.
    Restart,
}

/// A unit of model-driven work for one automation hash.
enum Job {
    Schedule(Automation),
    Execute(Box<TriggerEvent>),
}

impl Job {
    fn hash(&self) -> &str {
        match self {
            Job::Schedule(automation) => &automation.hash,
            Job::Execute(event) => &event.automation_hash,
        }
    }
}

#[derive(Default)]
struct HashQueue {
    running: bool,
    pending: VecDeque<Job>,
}

struct RuntimeInner {
    config: Config,
    tz: chrono_tz::Tz,
    store: Arc<Store>,
    hub: Arc<dyn HubClient>,
    clock: Arc<dyn Clock>,
    factory: Arc<dyn LlmFactory>,
    memory: Arc<MemoryFile>,
    automations: RwLock<HashMap<String, Automation>>,
    cues: RwLock<HashMap<String, Automation>>,
    workers: Arc<Semaphore>,
}

/// The automation runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Assemble a runtime over already-opened collaborators.
    pub fn new(
        config: Config,
        store: Arc<Store>,
        hub: Arc<dyn HubClient>,
        clock: Arc<dyn Clock>,
        factory: Arc<dyn LlmFactory>,
    ) -> Result<Self, RuntimeError> {
        let tz = config.tz()?;
        let memory = Arc::new(MemoryFile::new(notebook::memory_path(&config.notebook)));
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
            .max(2);
        Ok(Self {
            inner: Arc::new(RuntimeInner {
                config,
                tz,
                store,
                hub,
                clock,
                factory,
                memory,
                automations: RwLock::new(HashMap::new()),
                cues: RwLock::new(HashMap::new()),
                workers: Arc::new(Semaphore::new(workers)),
            }),
        })
    }

    /// The store this runtime owns.
    pub fn store(&self) -> &Arc<Store> {
        &self.inner.store
    }

    /// Scan the notebook and update the in-memory automation set.
    ///
    /// Hashes that disappeared have their signals killed; the engine is
    /// told separately by the caller when one is running.
    pub async fn load_notebook(&self) -> Result<Vec<String>, RuntimeError> {
        let scan = notebook::scan(&self.inner.config.notebook)?;

        let mut removed = Vec::new();
        {
            let mut automations = self.inner.automations.write().await;
            let fresh: HashMap<String, Automation> = scan
                .automations
                .into_iter()
                .map(|a| (a.hash.clone(), a))
                .collect();
            for hash in automations.keys() {
                if !fresh.contains_key(hash) {
                    removed.push(hash.clone());
                }
            }
            *automations = fresh;
        }
        {
            let mut cues = self.inner.cues.write().await;
            *cues = scan.cues.into_iter().map(|c| (c.file_name.clone(), c)).collect();
        }

        for hash in &removed {
            self.inner
                .store
                .kill_all_for_hash(hash)
                .await
                .map_err(RuntimeError::Store)?;
        }
        Ok(removed)
    }

    /// Hashes of loaded automations with no alive signals.
    pub async fn unscheduled_hashes(&self) -> Result<Vec<String>, RuntimeError> {
        let automations = self.inner.automations.read().await;
        let mut unscheduled = Vec::new();
        for hash in automations.keys() {
            if self
                .inner
                .store
                .alive_signals_for_hash(hash)
                .await
                .map_err(RuntimeError::Store)?
                .is_empty()
            {
                unscheduled.push(hash.clone());
            }
        }
        unscheduled.sort();
        Ok(unscheduled)
    }

    /// Run one scheduling pass for every unscheduled automation.
    ///
    /// Idempotent: an automation with any alive signal is skipped, so a
    /// second call is a no-op. Returns the hashes that were scheduled.
    pub async fn reconcile(
        &self,
        engine: Option<&mpsc::Sender<TriggerCommand>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, RuntimeError> {
        let mut scheduled = Vec::new();
        for hash in self.unscheduled_hashes().await? {
            let automation = {
                let automations = self.inner.automations.read().await;
                automations.get(&hash).cloned()
            };
            if let Some(automation) = automation {
                run_scheduling_job(&self.inner, &automation, engine, cancel).await;
                scheduled.push(hash);
            }
        }
        Ok(scheduled)
    }

    /// Fire a cue by file name, immediately.
    pub async fn run_cue(
        &self,
        file_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>, RuntimeError> {
        let cue = {
            let cues = self.inner.cues.read().await;
            cues.get(file_name).cloned()
        }
        .ok_or_else(|| RuntimeError::Notebook(format!("no cue named `{file_name}`")))?;

        let log_id = self
            .inner
            .store
            .append_automation_log(&NewAutomationLog {
                automation_hash: Some(cue.hash.clone()),
                log_type: LogType::ExecuteSignal,
                messages: vec![],
                signaled_by: None,
            })
            .await
            .map_err(RuntimeError::Store)?;

        let messages =
            run_execution_conversation(&self.inner, &cue, log_id, None, cancel, false).await;
        self.inner
            .store
            .update_automation_log(log_id, &messages)
            .await
            .map_err(RuntimeError::Store)?;
        Ok(messages)
    }

    /// The interactive chat path.
    ///
    /// Creates a `manual` log row and grows its message list in place as
    /// the transcript streams; the row is never touched after the
    /// request completes.
    pub async fn run_manual_chat(
        &self,
        prompt: &str,
        previous_messages: Vec<Message>,
        cancel: &CancellationToken,
    ) -> Result<(i64, Vec<Message>), RuntimeError> {
        let inner = &self.inner;
        let log_id = inner
            .store
            .append_automation_log(&NewAutomationLog {
                automation_hash: None,
                log_type: LogType::Manual,
                messages: previous_messages.clone(),
                signaled_by: None,
            })
            .await
            .map_err(RuntimeError::Store)?;

        let (provider, model) = match inner.factory.create(None) {
            Ok(created) => created,
            Err(err) => {
                let note = Message::assistant(format!("model call failed: {err}"));
                let messages = vec![Message::user(prompt), note];
                inner
                    .store
                    .update_automation_log(log_id, &messages)
                    .await
                    .map_err(RuntimeError::Store)?;
                return Ok((log_id, messages));
            }
        };

        let exec_ctx = Arc::new(ExecContext::new(
            inner.hub.clone(),
            inner.store.clone(),
            log_id,
            inner.config.test_mode,
            inner.memory.clone(),
            inner.factory.create_vision(),
        ));
        let router = Arc::new(ToolRouter::new(vec![execution_server(exec_ctx)]));
        let memory_text = inner.memory.read().await.unwrap_or_default();
        let system =
            prompts::execute_prompt(&memory_text, inner.clock.now_utc(), inner.tz, None);

        let tool_loop = ToolLoop::new(
            provider,
            router,
            LoopConfig {
                model,
                ..LoopConfig::default()
            },
        );
        let mut transcript =
            tool_loop.run(Some(system), prompt, previous_messages.clone(), cancel.clone());

        let mut messages = previous_messages;
        while let Some(message) = transcript.recv().await {
            messages.push(message);
            // Grow the row in place so the front-end sees progress.
            if let Err(err) = inner.store.update_automation_log(log_id, &messages).await {
                tracing::error!(error = %err, "manual chat log update failed");
                break;
            }
        }
        Ok((log_id, messages))
    }

    /// Boot, reconcile, and serve until shutdown or restart.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunOutcome, RuntimeError> {
        let inner = self.inner.clone();

        std::fs::create_dir_all(inner.config.notebook.join("automations"))
            .and_then(|()| std::fs::create_dir_all(inner.config.notebook.join("cues")))
            .map_err(|e| RuntimeError::Notebook(e.to_string()))?;

        self.load_notebook().await?;
        let _ = inner.store.append_log("info", "runtime started").await;

        // The engine holds a read handle to the store and an output
        // channel; we own it and keep the command side.
        let (engine, handle) = TriggerEngine::new(
            inner.store.clone(),
            inner.clock.clone(),
            inner.tz,
            inner.hub.events(),
        );
        let EngineHandle {
            commands: engine_tx,
            events: mut trigger_rx,
        } = handle;
        let engine_cancel = CancellationToken::new();
        let engine_task = tokio::spawn({
            let engine_cancel = engine_cancel.clone();
            async move {
                if let Err(err) = engine.run(engine_cancel).await {
                    tracing::error!(error = %err, "trigger engine failed");
                }
            }
        });

        let mut watcher = notebook::watch(&inner.config.notebook)?;

        // Jobs started before shutdown keep their own token so the grace
        // period can let them finish after intake stops.
        let job_cancel = CancellationToken::new();
        let (done_tx, mut done_rx) = mpsc::channel::<String>(64);
        let mut queues: HashMap<String, HashQueue> = HashMap::new();
        let mut jobs: JoinSet<()> = JoinSet::new();

        let scheduled = self.reconcile(Some(&engine_tx), &job_cancel).await?;
        if !scheduled.is_empty() {
            tracing::info!(count = scheduled.len(), "scheduled unscheduled automations");
        }

        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => break RunOutcome::Shutdown,
                Some(event) = trigger_rx.recv() => {
                    self.enqueue(
                        &mut queues,
                        &mut jobs,
                        Job::Execute(Box::new(event)),
                        &engine_tx,
                        &job_cancel,
                        &done_tx,
                    ).await;
                }
                Some(hash) = done_rx.recv() => {
                    let next = queues.get_mut(&hash).and_then(|queue| {
                        match queue.pending.pop_front() {
                            Some(job) => Some(job),
                            None => {
                                queue.running = false;
                                None
                            }
                        }
                    });
                    if let Some(job) = next {
                        self.spawn_job(&mut jobs, job, &engine_tx, &job_cancel, &done_tx);
                    }
                }
                event = watcher.events.recv() => {
                    match event {
                        Some(NotebookEvent::Restart) => break RunOutcome::Restart,
                        Some(NotebookEvent::Changed) => {
                            // Editors fire bursts; settle, drain, rescan once.
                            tokio::time::sleep(Duration::from_millis(150)).await;
                            while watcher.events.try_recv().is_ok() {}
                            if let Err(err) = self
                                .resync_notebook(&mut queues, &mut jobs, &engine_tx, &job_cancel, &done_tx)
                                .await
                            {
                                tracing::error!(error = %err, "notebook resync failed");
                            }
                        }
                        None => {}
                    }
                }
                Some(_) = jobs.join_next(), if !jobs.is_empty() => {}
            }
        };

        // Graceful shutdown: stop intake, give in-flight jobs a grace
        // period, then cancel the stragglers and checkpoint.
        drop(trigger_rx);
        let drain = async {
            while jobs.join_next().await.is_some() {}
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            tracing::warn!("grace period elapsed, cancelling in-flight jobs");
            job_cancel.cancel();
            while jobs.join_next().await.is_some() {}
        }
        engine_cancel.cancel();
        let _ = engine_task.await;
        let _ = inner.store.append_log("info", "runtime stopped").await;
        inner.store.checkpoint().await.map_err(RuntimeError::Store)?;
        Ok(outcome)
    }

    async fn resync_notebook(
        &self,
        queues: &mut HashMap<String, HashQueue>,
        jobs: &mut JoinSet<()>,
        engine_tx: &mpsc::Sender<TriggerCommand>,
        job_cancel: &CancellationToken,
        done_tx: &mpsc::Sender<String>,
    ) -> Result<(), RuntimeError> {
        let removed = self.load_notebook().await?;
        for hash in removed {
            let _ = engine_tx.send(TriggerCommand::KillHash(hash)).await;
        }
        for hash in self.unscheduled_hashes().await? {
            let automation = {
                let automations = self.inner.automations.read().await;
                automations.get(&hash).cloned()
            };
            if let Some(automation) = automation {
                self.enqueue(
                    queues,
                    jobs,
                    Job::Schedule(automation),
                    engine_tx,
                    job_cancel,
                    done_tx,
                )
                .await;
            }
        }
        Ok(())
    }

    async fn enqueue(
        &self,
        queues: &mut HashMap<String, HashQueue>,
        jobs: &mut JoinSet<()>,
        job: Job,
        engine_tx: &mpsc::Sender<TriggerCommand>,
        job_cancel: &CancellationToken,
        done_tx: &mpsc::Sender<String>,
    ) {
        let hash = job.hash().to_string();
        let queue = queues.entry(hash.clone()).or_default();
        if queue.running {
            if queue.pending.len() >= QUEUE_DEPTH {
                // Saturated: coalesce by keeping only the latest event.
                tracing::warn!(hash = %hash, "pending queue saturated, coalescing to latest");
                queue.pending.pop_back();
            }
            queue.pending.push_back(job);
            return;
        }
        queue.running = true;
        self.spawn_job(jobs, job, engine_tx, job_cancel, done_tx);
    }

    fn spawn_job(
        &self,
        jobs: &mut JoinSet<()>,
        job: Job,
        engine_tx: &mpsc::Sender<TriggerCommand>,
        job_cancel: &CancellationToken,
        done_tx: &mpsc::Sender<String>,
    ) {
        let inner = self.inner.clone();
        let engine_tx = engine_tx.clone();
        let job_cancel = job_cancel.clone();
        let done_tx = done_tx.clone();
        jobs.spawn(async move {
            let hash = job.hash().to_string();
            let _permit = inner.workers.clone().acquire_owned().await;
            match job {
                Job::Schedule(automation) => {
                    run_scheduling_job(&inner, &automation, Some(&engine_tx), &job_cancel).await;
                }
                Job::Execute(event) => {
                    run_execution_job(&inner, *event, &job_cancel).await;
                }
            }
            let _ = done_tx.send(hash).await;
        });
    }
}

/// One scheduling pass (`determine-signal`).
///
/// Job errors never propagate: the transcript (possibly ending in a
/// synthetic error message) is persisted and the runtime moves on.
async fn run_scheduling_job(
    inner: &Arc<RuntimeInner>,
    automation: &Automation,
    engine: Option<&mpsc::Sender<TriggerCommand>>,
    cancel: &CancellationToken,
) {
    // Idempotence check under the per-hash lock: any alive signal means
    // another pass already ran.
    match inner.store.alive_signals_for_hash(&automation.hash).await {
        Ok(alive) if !alive.is_empty() => return,
        Ok(_) => {}
        Err(err) => {
            tracing::error!(error = %err, "cannot read signals, skipping scheduling");
            return;
        }
    }

    tracing::info!(file = %automation.file_name, "scheduling automation");

    let known_entities = match inner.hub.fetch_states().await {
        Ok(states) => states.into_iter().map(|s| s.entity_id).collect(),
        Err(err) => {
            tracing::warn!(error = %err, "cannot fetch entities for validation");
            Vec::new()
        }
    };

    let (provider, model) = match inner
        .factory
        .create(parse_model_directive(&automation.contents).as_ref())
    {
        Ok(created) => created,
        Err(err) => {
            tracing::error!(error = %err, file = %automation.file_name, "no provider for scheduling job");
            return;
        }
    };

    let ctx = Arc::new(ScheduleContext {
        store: inner.store.clone(),
        automation_hash: automation.hash.clone(),
        known_entities,
        clock: inner.clock.clone(),
    });
    let router = Arc::new(ToolRouter::new(vec![scheduling_server(ctx)]));
    let memory_text = inner.memory.read().await.unwrap_or_default();
    let system = prompts::scheduler_prompt(&memory_text, inner.clock.now_utc(), inner.tz);

    let tool_loop = ToolLoop::new(
        provider,
        router,
        LoopConfig {
            model,
            ..LoopConfig::default()
        },
    );
    let messages = tool_loop
        .run(
            Some(system),
            automation.contents.clone(),
            vec![],
            cancel.clone(),
        )
        .drain()
        .await;

    if let Err(err) = inner
        .store
        .append_automation_log(&NewAutomationLog {
            automation_hash: Some(automation.hash.clone()),
            log_type: LogType::DetermineSignal,
            messages,
            signaled_by: None,
        })
        .await
    {
        tracing::error!(error = %err, "scheduling log write failed");
        let _ = inner
            .store
            .append_log("error", &format!("scheduling log write failed: {err}"))
            .await;
        return;
    }

    // Re-arm the engine from what the pass actually persisted.
    if let Some(engine) = engine {
        let _ = engine
            .send(TriggerCommand::KillHash(automation.hash.clone()))
            .await;
        if let Ok(alive) = inner.store.alive_signals_for_hash(&automation.hash).await {
            for signal in alive {
                let _ = engine.send(TriggerCommand::Add(signal)).await;
            }
        }
    }
}

/// One execution pass (`execute-signal`).
async fn run_execution_job(
    inner: &Arc<RuntimeInner>,
    event: TriggerEvent,
    cancel: &CancellationToken,
) {
    let automation = {
        let automations = inner.automations.read().await;
        automations.get(&event.automation_hash).cloned()
    };
    let Some(automation) = automation else {
        // Fired for a revision that no longer exists; retire its signals.
        tracing::warn!(hash = %event.automation_hash, "trigger fired for unknown automation");
        let _ = inner.store.kill_all_for_hash(&event.automation_hash).await;
        return;
    };

    tracing::info!(
        file = %automation.file_name,
        signal_id = event.signal.id,
        kind = event.signal.data.kind(),
        "executing automation"
    );

    // The log row is the durable record of this firing. For one-shots it
    // is inserted in the same transaction that retires the signal, so a
    // crash mid-execution cannot double-fire.
    let entry = NewAutomationLog {
        automation_hash: Some(automation.hash.clone()),
        log_type: LogType::ExecuteSignal,
        messages: vec![],
        signaled_by: Some(event.signal.data.clone()),
    };
    let log_insert = if event.signal.data.is_one_shot() {
        inner
            .store
            .append_execution_log_and_kill(event.signal.id, &entry)
            .await
    } else {
        inner.store.append_automation_log(&entry).await
    };
    let log_id = match log_insert {
        Ok(id) => id,
        Err(err) => {
            // Fail fast: the signal stays alive and fires again on its
            // next scheduled time.
            tracing::error!(error = %err, "execution log insert failed");
            let _ = inner
                .store
                .append_log("error", &format!("execution log insert failed: {err}"))
                .await;
            return;
        }
    };

    let fired_by = event.signal.data.describe();
    let messages =
        run_execution_conversation(inner, &automation, log_id, Some(&fired_by), cancel, false)
            .await;

    if let Err(err) = inner.store.update_automation_log(log_id, &messages).await {
        tracing::error!(error = %err, "execution transcript write failed");
        let _ = inner
            .store
            .append_log("error", &format!("execution transcript write failed: {err}"))
            .await;
    }
}

/// Drive one execution conversation and return the transcript.
async fn run_execution_conversation(
    inner: &Arc<RuntimeInner>,
    automation: &Automation,
    log_id: i64,
    fired_by: Option<&str>,
    cancel: &CancellationToken,
    stream_updates: bool,
) -> Vec<Message> {
    let (provider, model) = match inner
        .factory
        .create(parse_model_directive(&automation.contents).as_ref())
    {
        Ok(created) => created,
        Err(err) => {
            tracing::error!(error = %err, "no provider for execution job");
            return vec![Message::assistant(format!("model call failed: {err}"))];
        }
    };

    let exec_ctx = Arc::new(ExecContext::new(
        inner.hub.clone(),
        inner.store.clone(),
        log_id,
        inner.config.test_mode,
        inner.memory.clone(),
        inner.factory.create_vision(),
    ));
    let router = Arc::new(ToolRouter::new(vec![execution_server(exec_ctx)]));
    let memory_text = inner.memory.read().await.unwrap_or_default();
    let system = prompts::execute_prompt(&memory_text, inner.clock.now_utc(), inner.tz, fired_by);

    let tool_loop = ToolLoop::new(
        provider,
        router,
        LoopConfig {
            model,
            ..LoopConfig::default()
        },
    );
    let mut transcript = tool_loop.run(
        Some(system),
        automation.contents.clone(),
        vec![],
        cancel.clone(),
    );

    let mut messages = Vec::new();
    while let Some(message) = transcript.recv().await {
        messages.push(message);
        if stream_updates {
            let _ = inner.store.update_automation_log(log_id, &messages).await;
        }
    }
    messages
}
