//! System prompts for the two LLM passes.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

/// System prompt for the scheduling pass.
pub fn scheduler_prompt(memory: &str, now: DateTime<Utc>, tz: Tz) -> String {
    let local = now.with_timezone(&tz);
    format!(
        "You schedule home automations. The user message is the full text of one \
automation written in natural language. Derive WHEN it should run and register \
that with the trigger tools; do not execute the automation itself.\n\
\n\
Rules:\n\
- First call list-scheduled-triggers to see what is already registered.\n\
- If the existing triggers already cover the automation, stop without changes.\n\
- Otherwise cancel stale triggers and create the right ones. Prefer a cron \
trigger for anything recurring, a state-regex trigger for \"when X happens\", \
a state-range trigger for \"while a value stays ...\", and absolute/relative \
time triggers for one-offs.\n\
- Cron expressions use 5 fields and fire in the local timezone ({tz}).\n\
- The current local time is {local}.\n\
\n\
Scratchpad from previous runs:\n{memory}",
        tz = tz,
        local = local.to_rfc3339(),
        memory = if memory.is_empty() { "(empty)" } else { memory },
    )
}

/// System prompt for the execution pass.
pub fn execute_prompt(memory: &str, now: DateTime<Utc>, tz: Tz, fired_by: Option<&str>) -> String {
    let local = now.with_timezone(&tz);
    let trigger_note = match fired_by {
        Some(description) => format!("This run was triggered by: {description}.\n"),
        None => String::new(),
    };
    format!(
        "You operate a home-automation hub. The user message is the full text of \
one automation; carry out its instructions now using the hub tools.\n\
\n\
Rules:\n\
- Inspect entities before acting; never guess entity ids.\n\
- call-service is the only tool that changes anything. Target only the \
entities the automation asks for.\n\
- Use read-memory/write-memory for durable notes to future runs.\n\
- When done, reply with a short summary of what you did.\n\
{trigger_note}\
- The current local time is {local} ({tz}).\n\
\n\
Scratchpad from previous runs:\n{memory}",
        local = local.to_rfc3339(),
        tz = tz,
        memory = if memory.is_empty() { "(empty)" } else { memory },
    )
}
