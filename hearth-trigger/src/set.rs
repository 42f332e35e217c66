//! The pure trigger state machine.
//!
//! [`TriggerSet`] owns the armed form of every alive signal and is
//! stepped synchronously: [`TriggerSet::poll`] with the current time,
//! [`TriggerSet::on_state_change`] with a hub event. The async engine
//! wraps it; tests drive it directly with a stepped clock.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Duration, Timelike, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use hearth_hub::StateChange;
use hearth_store::{Signal, SignalData};
use regex::Regex;

use crate::TriggerError;

/// One fired trigger.
#[derive(Debug, Clone)]
pub struct TriggerEvent {
    /// The automation the fired signal belongs to.
    pub automation_hash: String,
    /// The fired signal.
    pub signal: Signal,
    /// When it fired.
    pub fired_at: DateTime<Utc>,
}

/// The armed, in-memory form of a signal.
enum Armed {
    Cron {
        schedule: Schedule,
        last_fired_minute: Option<DateTime<Utc>>,
    },
    Time {
        at: DateTime<Utc>,
    },
    Offset {
        next_at: DateTime<Utc>,
        period: Duration,
        repeat: bool,
    },
    State {
        entity_ids: Vec<String>,
        regex: Regex,
    },
    Range {
        entity_id: String,
        min: Option<f64>,
        max: Option<f64>,
        residency: Duration,
        in_range_since: Option<DateTime<Utc>>,
        armed: bool,
    },
}

struct Entry {
    signal: Signal,
    armed: Armed,
}

/// Convert a standard 5-field cron expression to the 6-field form the
/// parser wants, pinned to second 0.
pub fn parse_cron(expr: &str) -> Result<Schedule, TriggerError> {
    let fields = expr.split_whitespace().count();
    if fields != 5 {
        return Err(TriggerError::InvalidCron(format!(
            "expected 5 fields, got {fields}: `{expr}`"
        )));
    }
    Schedule::from_str(&format!("0 {expr}"))
        .map_err(|e| TriggerError::InvalidCron(format!("`{expr}`: {e}")))
}

/// All alive triggers, armed and steppable.
pub struct TriggerSet {
    tz: Tz,
    entries: HashMap<i64, Entry>,
}

impl TriggerSet {
    /// Create an empty set evaluating cron expressions in `tz`.
    pub fn new(tz: Tz) -> Self {
        Self {
            tz,
            entries: HashMap::new(),
        }
    }

    /// Number of armed signals.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Arm a signal.
    ///
    /// A repeating offset skips deadlines already in the past (missed
    /// repeats are not backfilled); a one-shot keeps its past deadline so
    /// the next poll catches it up.
    pub fn add(&mut self, signal: Signal, now: DateTime<Utc>) -> Result<(), TriggerError> {
        let armed = match &signal.data {
            SignalData::Cron { expr } => Armed::Cron {
                schedule: parse_cron(expr)?,
                last_fired_minute: None,
            },
            SignalData::Time { at } => Armed::Time { at: *at },
            SignalData::Offset {
                offset_seconds,
                repeat_forever,
                anchor,
            } => {
                let period = Duration::seconds(*offset_seconds);
                if period <= Duration::zero() {
                    return Err(TriggerError::InvalidOffset(*offset_seconds));
                }
                let mut next_at = *anchor + period;
                if *repeat_forever {
                    while next_at <= now {
                        next_at += period;
                    }
                }
                Armed::Offset {
                    next_at,
                    period,
                    repeat: *repeat_forever,
                }
            }
            SignalData::State { entity_ids, regex } => Armed::State {
                entity_ids: entity_ids.clone(),
                regex: Regex::new(regex)
                    .map_err(|e| TriggerError::InvalidRegex(format!("/{regex}/: {e}")))?,
            },
            SignalData::StateRange {
                entity_id,
                min,
                max,
                for_seconds,
            } => Armed::Range {
                entity_id: entity_id.clone(),
                min: *min,
                max: *max,
                residency: Duration::seconds(*for_seconds as i64),
                in_range_since: None,
                armed: true,
            },
        };
        self.entries.insert(signal.id, Entry { signal, armed });
        Ok(())
    }

    /// Disarm one signal.
    pub fn remove(&mut self, id: i64) {
        self.entries.remove(&id);
    }

    /// Disarm every signal for a hash.
    pub fn remove_hash(&mut self, hash: &str) {
        self.entries.retain(|_, e| e.signal.automation_hash != hash);
    }

    /// Whether a signal is armed.
    pub fn contains(&self, id: i64) -> bool {
        self.entries.contains_key(&id)
    }

    /// Step time forward: fire everything due at `now`.
    ///
    /// One-shots are disarmed after firing; the durable kill happens in
    /// the runtime, atomically with the execution log.
    pub fn poll(&mut self, now: DateTime<Utc>) -> Vec<TriggerEvent> {
        let mut fired = Vec::new();
        let mut disarm = Vec::new();
        let minute = truncate_to_minute(now.with_timezone(&self.tz));

        for entry in self.entries.values_mut() {
            match &mut entry.armed {
                Armed::Cron {
                    schedule,
                    last_fired_minute,
                } => {
                    let minute_utc = minute.with_timezone(&Utc);
                    if *last_fired_minute != Some(minute_utc) && schedule.includes(minute) {
                        *last_fired_minute = Some(minute_utc);
                        fired.push(event(&entry.signal, now));
                    }
                }
                Armed::Time { at } => {
                    if now >= *at {
                        fired.push(event(&entry.signal, now));
                        disarm.push(entry.signal.id);
                    }
                }
                Armed::Offset {
                    next_at,
                    period,
                    repeat,
                } => {
                    if now >= *next_at {
                        fired.push(event(&entry.signal, now));
                        if *repeat {
                            while *next_at <= now {
                                *next_at += *period;
                            }
                        } else {
                            disarm.push(entry.signal.id);
                        }
                    }
                }
                Armed::Range {
                    residency,
                    in_range_since,
                    armed,
                    ..
                } => {
                    if *armed
                        && in_range_since.is_some_and(|since| now - since >= *residency)
                    {
                        *armed = false;
                        fired.push(event(&entry.signal, now));
                    }
                }
                Armed::State { .. } => {}
            }
        }

        for id in disarm {
            self.entries.remove(&id);
        }
        fired
    }

    /// Apply one hub state change.
    pub fn on_state_change(
        &mut self,
        change: &StateChange,
        now: DateTime<Utc>,
    ) -> Vec<TriggerEvent> {
        let mut fired = Vec::new();

        for entry in self.entries.values_mut() {
            match &mut entry.armed {
                Armed::State { entity_ids, regex } => {
                    // Unanchored match: any occurrence in the new state.
                    if entity_ids.iter().any(|id| id == &change.entity_id)
                        && regex.is_match(&change.new_state)
                    {
                        fired.push(event(&entry.signal, now));
                    }
                }
                Armed::Range {
                    entity_id,
                    min,
                    max,
                    residency,
                    in_range_since,
                    armed,
                } => {
                    if entity_id != &change.entity_id {
                        continue;
                    }
                    // A non-numeric state counts as leaving the range.
                    let in_range = change
                        .new_state
                        .parse::<f64>()
                        .is_ok_and(|v| min.is_none_or(|lo| v >= lo) && max.is_none_or(|hi| v <= hi));
                    if in_range {
                        if in_range_since.is_none() {
                            *in_range_since = Some(now);
                        }
                        if *armed
                            && in_range_since.is_some_and(|since| now - since >= *residency)
                        {
                            *armed = false;
                            fired.push(event(&entry.signal, now));
                        }
                    } else {
                        *in_range_since = None;
                        *armed = true;
                    }
                }
                _ => {}
            }
        }

        fired
    }

    /// The earliest instant anything could fire, for the engine's sleep.
    pub fn next_deadline(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let now_tz = now.with_timezone(&self.tz);
        self.entries
            .values()
            .filter_map(|entry| match &entry.armed {
                Armed::Cron { schedule, .. } => schedule
                    .after(&now_tz)
                    .next()
                    .map(|dt| dt.with_timezone(&Utc)),
                Armed::Time { at } => Some(*at),
                Armed::Offset { next_at, .. } => Some(*next_at),
                Armed::Range {
                    in_range_since,
                    armed,
                    residency,
                    ..
                } => match (armed, in_range_since) {
                    (true, Some(since)) => Some(*since + *residency),
                    _ => None,
                },
                Armed::State { .. } => None,
            })
            .min()
    }
}

fn event(signal: &Signal, now: DateTime<Utc>) -> TriggerEvent {
    TriggerEvent {
        automation_hash: signal.automation_hash.clone(),
        signal: signal.clone(),
        fired_at: now,
    }
}

fn truncate_to_minute(dt: DateTime<Tz>) -> DateTime<Tz> {
    dt.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(dt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(id: i64, data: SignalData) -> Signal {
        Signal {
            id,
            automation_hash: format!("hash-{id}"),
            data,
            is_dead: false,
            created_at: "2025-06-01T00:00:00Z".parse().unwrap(),
        }
    }

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn cron_every_two_hours_over_a_day_in_la() {
        let mut set = TriggerSet::new(chrono_tz::America::Los_Angeles);
        // 2025-06-01 00:00 PDT == 07:00 UTC.
        let start = utc("2025-06-01T07:00:00Z");
        set.add(
            signal(
                1,
                SignalData::Cron {
                    expr: "0 */2 * * *".into(),
                },
            ),
            start - Duration::minutes(1),
        )
        .unwrap();

        let mut fired = Vec::new();
        for minute in 0..(24 * 60) {
            let now = start + Duration::minutes(minute);
            fired.extend(set.poll(now));
        }
        assert_eq!(fired.len(), 12);
        // First at local midnight, last at 22:00 local.
        assert_eq!(fired[0].fired_at, start);
        assert_eq!(fired[11].fired_at, start + Duration::hours(22));
    }

    #[test]
    fn cron_does_not_double_fire_within_a_minute() {
        let mut set = TriggerSet::new(chrono_tz::UTC);
        let start = utc("2025-06-01T07:00:00Z");
        set.add(
            signal(
                1,
                SignalData::Cron {
                    expr: "0 7 * * *".into(),
                },
            ),
            start - Duration::hours(1),
        )
        .unwrap();

        let mut fired = Vec::new();
        for second in 0..120 {
            fired.extend(set.poll(start + Duration::seconds(second)));
        }
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn time_signal_fires_once_and_disarms() {
        let mut set = TriggerSet::new(chrono_tz::UTC);
        let at = utc("2025-06-01T12:00:00Z");
        set.add(signal(1, SignalData::Time { at }), at - Duration::minutes(5))
            .unwrap();

        assert!(set.poll(at - Duration::seconds(1)).is_empty());
        let fired = set.poll(at + Duration::milliseconds(10));
        assert_eq!(fired.len(), 1);
        assert!(!set.contains(1));
        assert!(set.poll(at + Duration::seconds(1)).is_empty());
    }

    #[test]
    fn missed_one_shot_catches_up() {
        let mut set = TriggerSet::new(chrono_tz::UTC);
        let at = utc("2025-06-01T12:00:00Z");
        let now = at + Duration::hours(2);
        set.add(signal(1, SignalData::Time { at }), now).unwrap();
        let fired = set.poll(now);
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn repeating_offset_rearms_and_skips_missed_repeats() {
        let mut set = TriggerSet::new(chrono_tz::UTC);
        let anchor = utc("2025-06-01T00:00:00Z");
        // Armed late: deadlines at :30, :60 already passed.
        let now = anchor + Duration::seconds(70);
        set.add(
            signal(
                1,
                SignalData::Offset {
                    offset_seconds: 30,
                    repeat_forever: true,
                    anchor,
                },
            ),
            now,
        )
        .unwrap();

        assert!(set.poll(now).is_empty());
        let fired = set.poll(anchor + Duration::seconds(90));
        assert_eq!(fired.len(), 1);
        let fired = set.poll(anchor + Duration::seconds(120));
        assert_eq!(fired.len(), 1);
        assert!(set.contains(1));
    }

    #[test]
    fn non_repeating_offset_disarms_after_fire() {
        let mut set = TriggerSet::new(chrono_tz::UTC);
        let anchor = utc("2025-06-01T00:00:00Z");
        set.add(
            signal(
                1,
                SignalData::Offset {
                    offset_seconds: 30,
                    repeat_forever: false,
                    anchor,
                },
            ),
            anchor,
        )
        .unwrap();

        assert!(set.poll(anchor + Duration::seconds(29)).is_empty());
        assert_eq!(set.poll(anchor + Duration::seconds(31)).len(), 1);
        assert!(!set.contains(1));
    }

    #[test]
    fn state_regex_is_unanchored() {
        let mut set = TriggerSet::new(chrono_tz::UTC);
        let now = utc("2025-06-01T00:00:00Z");
        set.add(
            signal(
                1,
                SignalData::State {
                    entity_ids: vec!["binary_sensor.front_door".into()],
                    regex: "open".into(),
                },
            ),
            now,
        )
        .unwrap();

        // Partial match against a longer state string must fire.
        let fired = set.on_state_change(
            &StateChange {
                entity_id: "binary_sensor.front_door".into(),
                new_state: "opening".into(),
            },
            now,
        );
        assert_eq!(fired.len(), 1);

        // Other entities do not fire.
        let fired = set.on_state_change(
            &StateChange {
                entity_id: "binary_sensor.back_door".into(),
                new_state: "open".into(),
            },
            now,
        );
        assert!(fired.is_empty());

        // Alive across fires.
        let fired = set.on_state_change(
            &StateChange {
                entity_id: "binary_sensor.front_door".into(),
                new_state: "open".into(),
            },
            now,
        );
        assert_eq!(fired.len(), 1);
        assert!(set.contains(1));
    }

    #[test]
    fn range_requires_continuous_residency() {
        let mut set = TriggerSet::new(chrono_tz::UTC);
        let t0 = utc("2025-06-01T00:00:00Z");
        set.add(
            signal(
                1,
                SignalData::StateRange {
                    entity_id: "sensor.t".into(),
                    min: Some(60.0),
                    max: Some(80.0),
                    for_seconds: 60,
                },
            ),
            t0,
        )
        .unwrap();

        let change = |v: &str| StateChange {
            entity_id: "sensor.t".into(),
            new_state: v.into(),
        };

        // Enter the range; residency not yet met.
        assert!(set.on_state_change(&change("70"), t0).is_empty());
        assert!(set.poll(t0 + Duration::seconds(30)).is_empty());

        // Leave and re-enter: residency restarts.
        assert!(set
            .on_state_change(&change("90"), t0 + Duration::seconds(40))
            .is_empty());
        assert!(set
            .on_state_change(&change("75"), t0 + Duration::seconds(50))
            .is_empty());
        assert!(set.poll(t0 + Duration::seconds(100)).is_empty());

        // Residency met via time passing alone.
        let fired = set.poll(t0 + Duration::seconds(111));
        assert_eq!(fired.len(), 1);

        // No re-fire while still inside the range.
        assert!(set.poll(t0 + Duration::seconds(200)).is_empty());
        assert!(set
            .on_state_change(&change("76"), t0 + Duration::seconds(210))
            .is_empty());

        // Leaving re-arms.
        assert!(set
            .on_state_change(&change("90"), t0 + Duration::seconds(220))
            .is_empty());
        assert!(set
            .on_state_change(&change("70"), t0 + Duration::seconds(230))
            .is_empty());
        let fired = set.poll(t0 + Duration::seconds(291));
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn non_numeric_state_leaves_the_range() {
        let mut set = TriggerSet::new(chrono_tz::UTC);
        let t0 = utc("2025-06-01T00:00:00Z");
        set.add(
            signal(
                1,
                SignalData::StateRange {
                    entity_id: "sensor.t".into(),
                    min: Some(0.0),
                    max: None,
                    for_seconds: 60,
                },
            ),
            t0,
        )
        .unwrap();

        set.on_state_change(
            &StateChange {
                entity_id: "sensor.t".into(),
                new_state: "10".into(),
            },
            t0,
        );
        set.on_state_change(
            &StateChange {
                entity_id: "sensor.t".into(),
                new_state: "unavailable".into(),
            },
            t0 + Duration::seconds(30),
        );
        // Residency restarted by the unavailable gap.
        assert!(set.poll(t0 + Duration::seconds(70)).is_empty());
    }

    #[test]
    fn next_deadline_picks_earliest() {
        let mut set = TriggerSet::new(chrono_tz::UTC);
        let now = utc("2025-06-01T00:00:30Z");
        set.add(
            signal(
                1,
                SignalData::Time {
                    at: utc("2025-06-01T03:00:00Z"),
                },
            ),
            now,
        )
        .unwrap();
        set.add(
            signal(
                2,
                SignalData::Cron {
                    expr: "0 * * * *".into(),
                },
            ),
            now,
        )
        .unwrap();

        // Cron's next top-of-hour beats the absolute time.
        assert_eq!(set.next_deadline(now), Some(utc("2025-06-01T01:00:00Z")));
    }

    #[test]
    fn remove_hash_disarms_all_of_it() {
        let mut set = TriggerSet::new(chrono_tz::UTC);
        let now = utc("2025-06-01T00:00:00Z");
        let mut a = signal(1, SignalData::Time { at: now });
        a.automation_hash = "shared".into();
        let mut b = signal(2, SignalData::Time { at: now });
        b.automation_hash = "shared".into();
        set.add(a, now).unwrap();
        set.add(b, now).unwrap();
        set.remove_hash("shared");
        assert!(set.is_empty());
    }

    #[test]
    fn six_field_cron_is_rejected() {
        assert!(parse_cron("0 0 7 * * *").is_err());
        assert!(parse_cron("not a cron").is_err());
        assert!(parse_cron("0 7 * * *").is_ok());
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let mut set = TriggerSet::new(chrono_tz::UTC);
        let result = set.add(
            signal(
                1,
                SignalData::State {
                    entity_ids: vec!["a.b".into()],
                    regex: "(unclosed".into(),
                },
            ),
            utc("2025-06-01T00:00:00Z"),
        );
        assert!(result.is_err());
    }
}
