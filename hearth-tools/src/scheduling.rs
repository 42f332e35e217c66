//! The scheduling tool suite (the `determine-signal` pass).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::DateTime;
use hearth_store::{SignalData, Store};
use hearth_tool::{ToolDyn, ToolError, ToolServer};
use hearth_trigger::{parse_cron, Clock};
use serde_json::{json, Value};

type ToolFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send + 'a>>;

/// Shared context for one scheduling pass: which automation is being
/// scheduled, and what the hub currently knows about.
pub struct ScheduleContext {
    /// The store signals are written to.
    pub store: Arc<Store>,
    /// Content hash of the automation being scheduled.
    pub automation_hash: String,
    /// Entity ids known to the hub, for soft validation. Empty skips the
    /// check.
    pub known_entities: Vec<String>,
    /// Clock used for past-instant rejection and offset anchors.
    pub clock: Arc<dyn Clock>,
}

impl ScheduleContext {
    fn unknown_entities(&self, requested: &[String]) -> Vec<String> {
        if self.known_entities.is_empty() {
            return Vec::new();
        }
        requested
            .iter()
            .filter(|id| !self.known_entities.contains(id))
            .cloned()
            .collect()
    }

    async fn insert(&self, data: &SignalData) -> Result<i64, ToolError> {
        self.store
            .insert_signal(&self.automation_hash, data)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))
    }
}

/// Build the scheduling tool server.
pub fn scheduling_server(ctx: Arc<ScheduleContext>) -> ToolServer {
    ToolServer::new("scheduling")
        .with_tool(Arc::new(ListTriggers { ctx: ctx.clone() }))
        .with_tool(Arc::new(CancelTriggers { ctx: ctx.clone() }))
        .with_tool(Arc::new(CreateCron { ctx: ctx.clone() }))
        .with_tool(Arc::new(CreateStateRegex { ctx: ctx.clone() }))
        .with_tool(Arc::new(CreateStateRange { ctx: ctx.clone() }))
        .with_tool(Arc::new(CreateRelative { ctx: ctx.clone() }))
        .with_tool(Arc::new(CreateAbsolute { ctx }))
}

fn require_str<'a>(input: &'a Value, field: &str) -> Result<&'a str, ToolError> {
    input
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidInput(format!("missing string field `{field}`")))
}

struct ListTriggers {
    ctx: Arc<ScheduleContext>,
}

impl ToolDyn for ListTriggers {
    fn name(&self) -> &str {
        "list-scheduled-triggers"
    }
    fn description(&self) -> &str {
        "List every live trigger currently scheduled for this automation."
    }
    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }
    fn call(&self, _input: Value) -> ToolFuture<'_> {
        Box::pin(async move {
            let signals = self
                .ctx
                .store
                .alive_signals_for_hash(&self.ctx.automation_hash)
                .await
                .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
            if signals.is_empty() {
                return Ok(json!({"triggers": "none scheduled"}));
            }
            let lines: Vec<String> = signals
                .iter()
                .map(|s| format!("#{}: {}", s.id, s.data.describe()))
                .collect();
            Ok(json!({"triggers": lines}))
        })
    }
}

struct CancelTriggers {
    ctx: Arc<ScheduleContext>,
}

impl ToolDyn for CancelTriggers {
    fn name(&self) -> &str {
        "cancel-all-scheduled-triggers"
    }
    fn description(&self) -> &str {
        "Cancel every live trigger for this automation. Use before rescheduling from scratch."
    }
    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }
    fn call(&self, _input: Value) -> ToolFuture<'_> {
        Box::pin(async move {
            self.ctx
                .store
                .kill_all_for_hash(&self.ctx.automation_hash)
                .await
                .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
            Ok(json!({"cancelled": true}))
        })
    }
}

struct CreateCron {
    ctx: Arc<ScheduleContext>,
}

impl ToolDyn for CreateCron {
    fn name(&self) -> &str {
        "create-cron-trigger"
    }
    fn description(&self) -> &str {
        "Schedule this automation on a standard 5-field cron expression \
         (minute hour day-of-month month day-of-week), evaluated in the \
         configured timezone."
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "expr": {"type": "string", "description": "5-field cron expression, e.g. `0 7 * * *`"}
            },
            "required": ["expr"]
        })
    }
    fn call(&self, input: Value) -> ToolFuture<'_> {
        Box::pin(async move {
            let expr = require_str(&input, "expr")?;
            parse_cron(expr).map_err(|e| ToolError::InvalidInput(e.to_string()))?;
            let id = self
                .ctx
                .insert(&SignalData::Cron { expr: expr.into() })
                .await?;
            Ok(json!({"signal_id": id}))
        })
    }
}

struct CreateStateRegex {
    ctx: Arc<ScheduleContext>,
}

impl ToolDyn for CreateStateRegex {
    fn name(&self) -> &str {
        "create-state-regex-trigger"
    }
    fn description(&self) -> &str {
        "Fire this automation whenever one of the listed entities changes \
         to a state matching the regex (partial match)."
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "entity_ids": {"type": "array", "items": {"type": "string"}},
                "regex": {"type": "string"}
            },
            "required": ["entity_ids", "regex"]
        })
    }
    fn call(&self, input: Value) -> ToolFuture<'_> {
        Box::pin(async move {
            let entity_ids: Vec<String> = input
                .get("entity_ids")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .ok_or_else(|| {
                    ToolError::InvalidInput("missing array field `entity_ids`".into())
                })?;
            if entity_ids.is_empty() {
                return Err(ToolError::InvalidInput("entity_ids must not be empty".into()));
            }
            let regex = require_str(&input, "regex")?;
            regex::Regex::new(regex)
                .map_err(|e| ToolError::InvalidInput(format!("regex does not compile: {e}")))?;

            let unknown = self.ctx.unknown_entities(&entity_ids);
            let id = self
                .ctx
                .insert(&SignalData::State {
                    entity_ids,
                    regex: regex.into(),
                })
                .await?;
            if unknown.is_empty() {
                Ok(json!({"signal_id": id}))
            } else {
                // Soft warning: inserted, but the model may want to fix the ids.
                Ok(json!({
                    "signal_id": id,
                    "warning": format!("entities not currently known to the hub: {}", unknown.join(", ")),
                }))
            }
        })
    }
}

struct CreateStateRange {
    ctx: Arc<ScheduleContext>,
}

impl ToolDyn for CreateStateRange {
    fn name(&self) -> &str {
        "create-state-range-trigger"
    }
    fn description(&self) -> &str {
        "Fire this automation once an entity's numeric state has stayed \
         within [min, max] continuously for `for_seconds`. Re-arms when \
         the state leaves the range."
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "entity_id": {"type": "string"},
                "min": {"type": "number"},
                "max": {"type": "number"},
                "for_seconds": {"type": "integer", "minimum": 0}
            },
            "required": ["entity_id", "for_seconds"]
        })
    }
    fn call(&self, input: Value) -> ToolFuture<'_> {
        Box::pin(async move {
            let entity_id = require_str(&input, "entity_id")?.to_string();
            let min = input.get("min").and_then(|v| v.as_f64());
            let max = input.get("max").and_then(|v| v.as_f64());
            if min.is_none() && max.is_none() {
                return Err(ToolError::InvalidInput(
                    "at least one of `min` and `max` is required".into(),
                ));
            }
            if let (Some(lo), Some(hi)) = (min, max) {
                if lo > hi {
                    return Err(ToolError::InvalidInput(format!(
                        "min ({lo}) must not exceed max ({hi})"
                    )));
                }
            }
            let for_seconds = input
                .get("for_seconds")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| {
                    ToolError::InvalidInput("missing integer field `for_seconds`".into())
                })?;

            let unknown = self.ctx.unknown_entities(std::slice::from_ref(&entity_id));
            let id = self
                .ctx
                .insert(&SignalData::StateRange {
                    entity_id,
                    min,
                    max,
                    for_seconds,
                })
                .await?;
            if unknown.is_empty() {
                Ok(json!({"signal_id": id}))
            } else {
                Ok(json!({
                    "signal_id": id,
                    "warning": format!("entity not currently known to the hub: {}", unknown.join(", ")),
                }))
            }
        })
    }
}

struct CreateRelative {
    ctx: Arc<ScheduleContext>,
}

impl ToolDyn for CreateRelative {
    fn name(&self) -> &str {
        "create-relative-time-trigger"
    }
    fn description(&self) -> &str {
        "Fire this automation `offset_seconds` from now, and every \
         `offset_seconds` thereafter if `repeat_forever` is true."
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "offset_seconds": {"type": "integer", "minimum": 1},
                "repeat_forever": {"type": "boolean"}
            },
            "required": ["offset_seconds"]
        })
    }
    fn call(&self, input: Value) -> ToolFuture<'_> {
        Box::pin(async move {
            let offset_seconds = input
                .get("offset_seconds")
                .and_then(|v| v.as_i64())
                .ok_or_else(|| {
                    ToolError::InvalidInput("missing integer field `offset_seconds`".into())
                })?;
            if offset_seconds <= 0 {
                return Err(ToolError::InvalidInput(format!(
                    "offset_seconds must be positive, got {offset_seconds}"
                )));
            }
            let repeat_forever = input
                .get("repeat_forever")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);

            let id = self
                .ctx
                .insert(&SignalData::Offset {
                    offset_seconds,
                    repeat_forever,
                    anchor: self.ctx.clock.now_utc(),
                })
                .await?;
            Ok(json!({"signal_id": id}))
        })
    }
}

struct CreateAbsolute {
    ctx: Arc<ScheduleContext>,
}

impl ToolDyn for CreateAbsolute {
    fn name(&self) -> &str {
        "create-absolute-time-trigger"
    }
    fn description(&self) -> &str {
        "Fire this automation once at an absolute ISO-8601 instant, e.g. \
         `2026-01-15T07:00:00-08:00`."
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "iso8601": {"type": "string"}
            },
            "required": ["iso8601"]
        })
    }
    fn call(&self, input: Value) -> ToolFuture<'_> {
        Box::pin(async move {
            let raw = require_str(&input, "iso8601")?;
            let at = DateTime::parse_from_rfc3339(raw)
                .map_err(|e| ToolError::InvalidInput(format!("not a valid ISO-8601 instant: {e}")))?
                .with_timezone(&chrono::Utc);
            let now = self.ctx.clock.now_utc();
            if at <= now {
                return Err(ToolError::InvalidInput(format!(
                    "instant {raw} is in the past (now: {})",
                    now.to_rfc3339()
                )));
            }
            let id = self.ctx.insert(&SignalData::Time { at }).await?;
            Ok(json!({"signal_id": id}))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hearth_tool::ToolRouter;
    use hearth_trigger::FakeClock;

    fn context() -> (Arc<Store>, Arc<ScheduleContext>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let clock = Arc::new(FakeClock::new("2025-06-01T00:00:00Z".parse().unwrap()));
        let ctx = Arc::new(ScheduleContext {
            store: store.clone(),
            automation_hash: "hash-a".into(),
            known_entities: vec![
                "binary_sensor.front_door".into(),
                "sensor.living_room_temperature".into(),
            ],
            clock,
        });
        (store, ctx)
    }

    fn router(ctx: Arc<ScheduleContext>) -> ToolRouter {
        ToolRouter::new(vec![scheduling_server(ctx)])
    }

    #[tokio::test]
    async fn cron_create_inserts_signal() {
        let (store, ctx) = context();
        let router = router(ctx);
        let (content, is_error) = router
            .dispatch("create-cron-trigger", json!({"expr": "0 7 * * *"}))
            .await;
        assert!(!is_error, "{content}");

        let alive = store.alive_signals_for_hash("hash-a").await.unwrap();
        assert_eq!(alive.len(), 1);
        assert_eq!(
            alive[0].data,
            SignalData::Cron {
                expr: "0 7 * * *".into()
            }
        );
    }

    #[tokio::test]
    async fn bad_cron_is_rejected_without_insert() {
        let (store, ctx) = context();
        let router = router(ctx);
        let (content, is_error) = router
            .dispatch("create-cron-trigger", json!({"expr": "every morning"}))
            .await;
        assert!(is_error);
        let value: Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["error"], "invalid input");
        assert!(store.alive_signals_for_hash("hash-a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn state_regex_with_unknown_entity_warns_but_inserts() {
        let (store, ctx) = context();
        let router = router(ctx);
        let (content, is_error) = router
            .dispatch(
                "create-state-regex-trigger",
                json!({"entity_ids": ["binary_sensor.garage_door"], "regex": "open"}),
            )
            .await;
        assert!(!is_error);
        let value: Value = serde_json::from_str(&content).unwrap();
        assert!(value["warning"]
            .as_str()
            .unwrap()
            .contains("binary_sensor.garage_door"));
        assert_eq!(store.alive_signals_for_hash("hash-a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn bad_regex_is_rejected() {
        let (store, ctx) = context();
        let router = router(ctx);
        let (_, is_error) = router
            .dispatch(
                "create-state-regex-trigger",
                json!({"entity_ids": ["binary_sensor.front_door"], "regex": "(unclosed"}),
            )
            .await;
        assert!(is_error);
        assert!(store.alive_signals_for_hash("hash-a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn absolute_time_in_the_past_is_rejected() {
        let (store, ctx) = context();
        let router = router(ctx);
        let (content, is_error) = router
            .dispatch(
                "create-absolute-time-trigger",
                json!({"iso8601": "2020-01-01T00:00:00Z"}),
            )
            .await;
        assert!(is_error);
        assert!(content.contains("in the past"));
        assert!(store.alive_signals_for_hash("hash-a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn absolute_time_in_the_future_inserts() {
        let (store, ctx) = context();
        let router = router(ctx);
        let (_, is_error) = router
            .dispatch(
                "create-absolute-time-trigger",
                json!({"iso8601": "2025-06-02T07:00:00Z"}),
            )
            .await;
        assert!(!is_error);
        let alive = store.alive_signals_for_hash("hash-a").await.unwrap();
        assert!(matches!(alive[0].data, SignalData::Time { .. }));
    }

    #[tokio::test]
    async fn relative_trigger_uses_clock_anchor() {
        let (store, ctx) = context();
        let router = router(ctx);
        let (_, is_error) = router
            .dispatch(
                "create-relative-time-trigger",
                json!({"offset_seconds": 90, "repeat_forever": true}),
            )
            .await;
        assert!(!is_error);
        let alive = store.alive_signals_for_hash("hash-a").await.unwrap();
        match &alive[0].data {
            SignalData::Offset {
                offset_seconds,
                repeat_forever,
                anchor,
            } => {
                assert_eq!(*offset_seconds, 90);
                assert!(repeat_forever);
                assert_eq!(*anchor, "2025-06-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap());
            }
            other => panic!("expected offset, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn range_requires_a_bound() {
        let (_, ctx) = context();
        let router = router(ctx);
        let (content, is_error) = router
            .dispatch(
                "create-state-range-trigger",
                json!({"entity_id": "sensor.living_room_temperature", "for_seconds": 60}),
            )
            .await;
        assert!(is_error);
        assert!(content.contains("min"));
    }

    #[tokio::test]
    async fn list_and_cancel_round_trip() {
        let (store, ctx) = context();
        let router = router(ctx);
        router
            .dispatch("create-cron-trigger", json!({"expr": "0 7 * * *"}))
            .await;

        let (content, is_error) = router.dispatch("list-scheduled-triggers", json!({})).await;
        assert!(!is_error);
        assert!(content.contains("cron"));

        let (_, is_error) = router
            .dispatch("cancel-all-scheduled-triggers", json!({}))
            .await;
        assert!(!is_error);
        assert!(store.alive_signals_for_hash("hash-a").await.unwrap().is_empty());

        let (content, _) = router.dispatch("list-scheduled-triggers", json!({})).await;
        assert!(content.contains("none scheduled"));
    }
}
