//! Graders: how a finished transcript is scored.

use hearth_types::{BoxProvider, ContentPart, Message, ProviderRequest, Role};
use serde::{Deserialize, Serialize};

/// A way to score one transcript.
#[derive(Debug, Clone)]
pub enum Grader {
    /// Fraction of needles present in the final assistant text.
    ContentContains {
        /// Strings that should appear.
        needles: Vec<String>,
    },
    /// Full score iff a tool was called with all the given fragments in
    /// its input.
    ToolCalled {
        /// Tool name to look for.
        tool: String,
        /// Substrings the call input must contain.
        input_contains: Vec<String>,
    },
    /// Ask a judge model to grade 1–5 against a rubric.
    LlmJudge {
        /// What good looks like.
        rubric: String,
    },
}

/// One grader's verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradeResult {
    /// Which grader produced this.
    pub grader: String,
    /// Points earned.
    pub score: f64,
    /// Points available.
    pub possible: f64,
    /// Judge reasoning, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Judge suggestions, when there are any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<String>,
}

/// The final assistant text of a transcript.
pub fn final_assistant_text(messages: &[Message]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant && !m.text().is_empty())
        .map(|m| m.text())
        .unwrap_or_default()
}

impl Grader {
    /// Apply this grader to a transcript.
    pub async fn grade(&self, messages: &[Message], judge: Option<&BoxProvider>) -> GradeResult {
        match self {
            Grader::ContentContains { needles } => {
                let text = final_assistant_text(messages);
                let found = needles.iter().filter(|n| text.contains(n.as_str())).count();
                GradeResult {
                    grader: "content-contains".into(),
                    score: found as f64,
                    possible: needles.len() as f64,
                    reasoning: None,
                    suggestions: None,
                }
            }
            Grader::ToolCalled {
                tool,
                input_contains,
            } => {
                let hit = messages
                    .iter()
                    .flat_map(|m| m.content.iter())
                    .any(|part| match part {
                        ContentPart::ToolUse { name, input, .. } if name == tool => {
                            let rendered = input.to_string();
                            input_contains.iter().all(|frag| rendered.contains(frag))
                        }
                        _ => false,
                    });
                GradeResult {
                    grader: format!("tool-called:{tool}"),
                    score: if hit { 1.0 } else { 0.0 },
                    possible: 1.0,
                    reasoning: None,
                    suggestions: None,
                }
            }
            Grader::LlmJudge { rubric } => grade_with_judge(rubric, messages, judge).await,
        }
    }
}

/// The judge's JSON verdict.
#[derive(Debug, Deserialize)]
struct JudgeVerdict {
    grade: f64,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    suggestions: Option<String>,
}

async fn grade_with_judge(
    rubric: &str,
    messages: &[Message],
    judge: Option<&BoxProvider>,
) -> GradeResult {
    let missing = GradeResult {
        grader: "llm-judge".into(),
        score: 0.0,
        possible: 5.0,
        reasoning: Some("no judge model configured".into()),
        suggestions: None,
    };
    let Some(judge) = judge else {
        return missing;
    };

    let transcript = render_transcript(messages);
    let prompt = format!(
        "Grade this automation-assistant transcript against the rubric.\n\
\n\
Rubric: {rubric}\n\
\n\
Transcript:\n{transcript}\n\
\n\
Respond with ONLY a JSON object: {{\"grade\": 1-5, \"reasoning\": \"...\", \"suggestions\": \"...\"}}"
    );

    let response = judge
        .complete_dyn(ProviderRequest {
            model: None,
            messages: vec![Message::user(prompt)],
            tools: vec![],
            max_tokens: Some(1024),
            temperature: None,
            system: None,
        })
        .await;

    match response {
        Ok(response) => match extract_json::<JudgeVerdict>(&response.message.text()) {
            Some(verdict) => GradeResult {
                grader: "llm-judge".into(),
                score: verdict.grade.clamp(0.0, 5.0),
                possible: 5.0,
                reasoning: verdict.reasoning,
                suggestions: verdict.suggestions,
            },
            None => GradeResult {
                reasoning: Some("judge reply was not parseable JSON".into()),
                ..missing
            },
        },
        Err(err) => GradeResult {
            reasoning: Some(format!("judge call failed: {err}")),
            ..missing
        },
    }
}

/// Pull the first JSON object out of possibly-chatty judge output.
fn extract_json<T: serde::de::DeserializeOwned>(text: &str) -> Option<T> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    serde_json::from_str(&text[start..=end]).ok()
}

/// Render a transcript for the judge.
fn render_transcript(messages: &[Message]) -> String {
    let mut out = String::new();
    for message in messages {
        let role = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        for part in &message.content {
            match part {
                ContentPart::Text { text } => {
                    out.push_str(&format!("[{role}] {text}\n"));
                }
                ContentPart::ToolUse { name, input, .. } => {
                    out.push_str(&format!("[{role}] -> {name}({input})\n"));
                }
                ContentPart::ToolResult {
                    content, is_error, ..
                } => {
                    let tag = if *is_error { "tool error" } else { "tool" };
                    out.push_str(&format!("[{tag}] {content}\n"));
                }
                ContentPart::Image { .. } => out.push_str(&format!("[{role}] <image>\n")),
            }
        }
    }
    out
}
