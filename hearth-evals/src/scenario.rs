//! Scenario catalog and the harness that runs it.

use std::sync::Arc;

use hearth_hub::{HubClient, MockHub};
use hearth_loop::{LoopConfig, ToolLoop};
use hearth_runtime::{LlmFactory, ModelRef};
use hearth_store::{LogType, NewAutomationLog, Store};
use hearth_tool::ToolRouter;
use hearth_tools::{
    execution_server, scheduling_server, ExecContext, MemoryFile, ScheduleContext,
};
use hearth_trigger::SystemClock;
use hearth_types::{BoxProvider, Message};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::grade::{GradeResult, Grader};

/// Which tool suite a scenario runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolSuite {
    /// The execution suite over the mock hub.
    Execution,
    /// The scheduling suite over an in-memory store.
    Scheduling,
}

/// One canned prompt plus its graders.
#[derive(Debug, Clone)]
pub struct Scenario {
    /// Short name for reporting.
    pub name: String,
    /// The prompt fed to the loop.
    pub prompt: String,
    /// Which suite the model gets.
    pub suite: ToolSuite,
    /// How the transcript is scored.
    pub graders: Vec<Grader>,
}

/// A scored scenario run.
#[derive(Debug, Serialize)]
pub struct ScenarioResult {
    /// The scenario's prompt.
    pub prompt: String,
    /// Names of the tools that were available.
    pub tools_description: String,
    /// The full transcript.
    pub messages: Vec<Message>,
    /// Per-grader results.
    pub grade_results: Vec<GradeResult>,
    /// Points earned across graders.
    pub final_score: f64,
    /// Points available across graders.
    pub final_score_possible: f64,
}

/// Runs scenarios against a provider factory.
pub struct EvalHarness {
    factory: Arc<dyn LlmFactory>,
    model: Option<ModelRef>,
    judge: Option<BoxProvider>,
}

impl EvalHarness {
    /// Build a harness. The judge model, when present, powers
    /// [`Grader::LlmJudge`].
    pub fn new(
        factory: Arc<dyn LlmFactory>,
        model: Option<ModelRef>,
        judge: Option<BoxProvider>,
    ) -> Self {
        Self {
            factory,
            model,
            judge,
        }
    }

    /// Run one scenario in an isolated world.
    pub async fn run_scenario(&self, scenario: &Scenario) -> ScenarioResult {
        let messages = match self.run_loop(scenario).await {
            Ok(messages) => messages,
            Err(err) => vec![Message::assistant(format!("harness error: {err}"))],
        };

        let mut grade_results = Vec::new();
        for grader in &scenario.graders {
            grade_results.push(grader.grade(&messages, self.judge.as_ref()).await);
        }
        let final_score = grade_results.iter().map(|g| g.score).sum();
        let final_score_possible = grade_results.iter().map(|g| g.possible).sum();

        ScenarioResult {
            prompt: scenario.prompt.clone(),
            tools_description: match scenario.suite {
                ToolSuite::Execution => "execution".into(),
                ToolSuite::Scheduling => "scheduling".into(),
            },
            messages,
            grade_results,
            final_score,
            final_score_possible,
        }
    }

    /// Run every scenario in order.
    pub async fn run_catalog(&self, scenarios: &[Scenario]) -> Vec<ScenarioResult> {
        let mut results = Vec::with_capacity(scenarios.len());
        for scenario in scenarios {
            tracing::info!(name = %scenario.name, "running scenario");
            results.push(self.run_scenario(scenario).await);
        }
        results
    }

    async fn run_loop(&self, scenario: &Scenario) -> Result<Vec<Message>, String> {
        let hub = Arc::new(MockHub::new());
        let store = Arc::new(Store::open_in_memory().map_err(|e| e.to_string())?);
        let scratch = tempfile::tempdir().map_err(|e| e.to_string())?;
        let clock = Arc::new(SystemClock);

        let router = match scenario.suite {
            ToolSuite::Execution => {
                let log_id = store
                    .append_automation_log(&NewAutomationLog {
                        automation_hash: None,
                        log_type: LogType::Manual,
                        messages: vec![],
                        signaled_by: None,
                    })
                    .await
                    .map_err(|e| e.to_string())?;
                let ctx = Arc::new(ExecContext::new(
                    hub.clone(),
                    store.clone(),
                    log_id,
                    // Evals never touch a real hub, but test mode also
                    // exercises the domain-prefix validation.
                    true,
                    Arc::new(MemoryFile::new(scratch.path().join("memory.md"))),
                    None,
                ));
                ToolRouter::new(vec![execution_server(ctx)])
            }
            ToolSuite::Scheduling => {
                let known_entities = hub
                    .fetch_states()
                    .await
                    .map(|states| states.into_iter().map(|s| s.entity_id).collect())
                    .unwrap_or_default();
                let ctx = Arc::new(ScheduleContext {
                    store: store.clone(),
                    automation_hash: "eval".into(),
                    known_entities,
                    clock: clock.clone(),
                });
                ToolRouter::new(vec![scheduling_server(ctx)])
            }
        };

        let (provider, model) = self
            .factory
            .create(self.model.as_ref())
            .map_err(|e| e.to_string())?;
        let tool_loop = ToolLoop::new(
            provider,
            Arc::new(router),
            LoopConfig {
                model,
                ..LoopConfig::default()
            },
        );
        Ok(tool_loop
            .run(None, scenario.prompt.clone(), vec![], CancellationToken::new())
            .drain()
            .await)
    }
}

/// The seed scenario catalog.
pub fn catalog() -> Vec<Scenario> {
    vec![
        Scenario {
            name: "list-lights".into(),
            prompt: "List all the light entities in the living room. Give me their friendly names only.".into(),
            suite: ToolSuite::Execution,
            graders: vec![
                Grader::ContentContains {
                    needles: vec![
                        "Bookshelf Light".into(),
                        "Overhead Light".into(),
                        "TV Lightstrip".into(),
                    ],
                },
                Grader::LlmJudge {
                    rubric: "The answer lists exactly the three living-room lights by \
                             friendly name and never leaks raw entity ids."
                        .into(),
                },
            ],
        },
        Scenario {
            name: "bulk-off".into(),
            prompt: "Turn off all the lights in the kitchen.".into(),
            suite: ToolSuite::Execution,
            graders: vec![
                Grader::ToolCalled {
                    tool: "call-service".into(),
                    input_contains: vec![
                        "turn_off".into(),
                        "kitchen_dining_room_chandelier".into(),
                    ],
                },
                Grader::LlmJudge {
                    rubric: "Only kitchen lights are targeted; nothing outside the \
                             kitchen is turned off."
                        .into(),
                },
            ],
        },
        Scenario {
            name: "thermostat".into(),
            prompt: "Set the thermostat in the bedroom to 72 degrees".into(),
            suite: ToolSuite::Execution,
            graders: vec![Grader::ToolCalled {
                tool: "call-service".into(),
                input_contains: vec![
                    "set_temperature".into(),
                    "bedroom".into(),
                    "72".into(),
                ],
            }],
        },
        Scenario {
            name: "scheduler-happy-path".into(),
            prompt: "Every morning at 7am turn on the coffee maker".into(),
            suite: ToolSuite::Scheduling,
            graders: vec![Grader::ToolCalled {
                tool: "create-cron-trigger".into(),
                input_contains: vec!["0 7 * * *".into()],
            }],
        },
        Scenario {
            name: "state-trigger".into(),
            prompt: "When the front door opens, flash the porch light".into(),
            suite: ToolSuite::Scheduling,
            graders: vec![Grader::ToolCalled {
                tool: "create-state-regex-trigger".into(),
                input_contains: vec!["front_door".into(), "open".into()],
            }],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_runtime::RuntimeError;
    use hearth_types::{
        ContentPart, Provider, ProviderError, ProviderRequest, ProviderResponse, Role, StopReason,
        TokenUsage,
    };
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedProvider {
        script: Mutex<VecDeque<ProviderResponse>>,
    }

    impl Provider for ScriptedProvider {
        async fn complete(
            &self,
            _request: ProviderRequest,
        ) -> Result<ProviderResponse, ProviderError> {
            self.script
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front()
                .ok_or_else(|| ProviderError::InvalidResponse("script exhausted".into()))
        }

        async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
            Ok(vec![])
        }
    }

    struct OneShotFactory {
        script: Mutex<Option<Vec<ProviderResponse>>>,
    }

    impl LlmFactory for OneShotFactory {
        fn create(
            &self,
            _reference: Option<&ModelRef>,
        ) -> Result<(BoxProvider, Option<String>), RuntimeError> {
            let script = self
                .script
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
                .unwrap_or_default();
            Ok((
                Arc::new(ScriptedProvider {
                    script: Mutex::new(script.into()),
                }),
                None,
            ))
        }
    }

    fn harness(script: Vec<ProviderResponse>) -> EvalHarness {
        EvalHarness::new(
            Arc::new(OneShotFactory {
                script: Mutex::new(Some(script)),
            }),
            None,
            None,
        )
    }

    #[tokio::test]
    async fn scripted_list_lights_scores_full_marks() {
        let harness = harness(vec![ProviderResponse {
            message: Message::assistant(
                "The living room lights are Bookshelf Light, Overhead Light, and TV Lightstrip.",
            ),
            stop_reason: StopReason::EndTurn,
            usage: TokenUsage::default(),
            model: "scripted".into(),
        }]);

        let result = harness.run_scenario(&catalog()[0]).await;
        // The judge grader scores zero without a judge model; the
        // content grader is what we assert on.
        assert_eq!(result.grade_results[0].score, 3.0);
        assert_eq!(result.grade_results[0].possible, 3.0);
    }

    #[tokio::test]
    async fn scripted_bulk_off_is_detected_by_tool_grader() {
        let harness = harness(vec![
            ProviderResponse {
                message: Message {
                    role: Role::Assistant,
                    content: vec![ContentPart::ToolUse {
                        id: "tu_0".into(),
                        name: "call-service".into(),
                        input: serde_json::json!({
                            "domain": "light",
                            "service": "turn_off",
                            "target": {"entity_id": [
                                "light.kitchen_dining_room_chandelier",
                                "light.kitchen_counter"
                            ]}
                        }),
                    }],
                },
                stop_reason: StopReason::ToolUse,
                usage: TokenUsage::default(),
                model: "scripted".into(),
            },
            ProviderResponse {
                message: Message::assistant("Kitchen lights are off."),
                stop_reason: StopReason::EndTurn,
                usage: TokenUsage::default(),
                model: "scripted".into(),
            },
        ]);

        let result = harness.run_scenario(&catalog()[1]).await;
        assert_eq!(result.grade_results[0].score, 1.0);
        // Transcript keeps the tool round-trip.
        assert_eq!(result.messages.len(), 4);
    }

    #[tokio::test]
    async fn scheduling_scenario_uses_scheduling_suite() {
        let harness = harness(vec![
            ProviderResponse {
                message: Message {
                    role: Role::Assistant,
                    content: vec![ContentPart::ToolUse {
                        id: "tu_0".into(),
                        name: "create-cron-trigger".into(),
                        input: serde_json::json!({"expr": "0 7 * * *"}),
                    }],
                },
                stop_reason: StopReason::ToolUse,
                usage: TokenUsage::default(),
                model: "scripted".into(),
            },
            ProviderResponse {
                message: Message::assistant("Scheduled."),
                stop_reason: StopReason::EndTurn,
                usage: TokenUsage::default(),
                model: "scripted".into(),
            },
        ]);

        let result = harness.run_scenario(&catalog()[3]).await;
        assert_eq!(result.final_score, 1.0);
        assert_eq!(result.final_score_possible, 1.0);
    }
}
