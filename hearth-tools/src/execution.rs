//! The execution tool suite (the `execute-signal` pass and manual chat).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use hearth_hub::{CallServiceRequest, EntityState, HubClient, HubError, ServiceCatalog, ServiceTarget};
use hearth_store::Store;
use hearth_tool::{ToolDyn, ToolError, ToolServer};
use hearth_types::{BoxProvider, ContentPart, ImageSource, Message, ProviderRequest, Role};
use serde_json::{json, Value};
use tokio::sync::OnceCell;

use crate::memory::MemoryFile;

type ToolFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send + 'a>>;

/// Shared context for one execution pass.
pub struct ExecContext {
    /// The hub to read from and act on.
    pub hub: Arc<dyn HubClient>,
    /// The store service calls are logged to.
    pub store: Arc<Store>,
    /// The automation log row this run belongs to.
    pub automation_log_id: i64,
    /// When set, `call-service` validates and records but never contacts
    /// the hub.
    pub test_mode: bool,
    /// The shared scratchpad.
    pub memory: Arc<MemoryFile>,
    /// Secondary vision model for `analyze-image`, when configured.
    pub vision: Option<BoxProvider>,
    services: OnceCell<ServiceCatalog>,
}

impl ExecContext {
    /// Create a context for one run.
    pub fn new(
        hub: Arc<dyn HubClient>,
        store: Arc<Store>,
        automation_log_id: i64,
        test_mode: bool,
        memory: Arc<MemoryFile>,
        vision: Option<BoxProvider>,
    ) -> Self {
        Self {
            hub,
            store,
            automation_log_id,
            test_mode,
            memory,
            vision,
            services: OnceCell::new(),
        }
    }

    /// The service catalog, fetched once per run.
    async fn services(&self) -> Result<&ServiceCatalog, ToolError> {
        self.services
            .get_or_try_init(|| async {
                self.hub
                    .fetch_services()
                    .await
                    .map_err(|e| ToolError::ExecutionFailed(e.to_string()))
            })
            .await
    }
}

/// Build the execution tool server.
pub fn execution_server(ctx: Arc<ExecContext>) -> ToolServer {
    let mut server = ToolServer::new("execution")
        .with_tool(Arc::new(EntitiesByPrefix { ctx: ctx.clone() }))
        .with_tool(Arc::new(AllEntities { ctx: ctx.clone() }))
        .with_tool(Arc::new(ServiceDomains { ctx: ctx.clone() }))
        .with_tool(Arc::new(ServicesForDomain { ctx: ctx.clone() }))
        .with_tool(Arc::new(CallService { ctx: ctx.clone() }))
        .with_tool(Arc::new(ReadMemory { ctx: ctx.clone() }))
        .with_tool(Arc::new(WriteMemory { ctx: ctx.clone() }));
    if ctx.vision.is_some() {
        server = server.with_tool(Arc::new(AnalyzeImage { ctx }));
    }
    server
}

fn entity_summary(entity: &EntityState) -> Value {
    json!({
        "entity_id": entity.entity_id,
        "state": entity.state,
        "friendly_name": entity.friendly_name(),
    })
}

fn require_str<'a>(input: &'a Value, field: &str) -> Result<&'a str, ToolError> {
    input
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidInput(format!("missing string field `{field}`")))
}

struct EntitiesByPrefix {
    ctx: Arc<ExecContext>,
}

impl ToolDyn for EntitiesByPrefix {
    fn name(&self) -> &str {
        "get-entities-by-prefix"
    }
    fn description(&self) -> &str {
        "List entities whose id starts with the given prefix, e.g. `light.` or `light.living_room`."
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"prefix": {"type": "string"}},
            "required": ["prefix"]
        })
    }
    fn call(&self, input: Value) -> ToolFuture<'_> {
        Box::pin(async move {
            let prefix = require_str(&input, "prefix")?.to_string();
            let states = self
                .ctx
                .hub
                .fetch_states()
                .await
                .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
            let entities: Vec<Value> = states
                .iter()
                .filter(|s| s.entity_id.starts_with(&prefix))
                .map(entity_summary)
                .collect();
            Ok(json!({"entities": entities}))
        })
    }
}

struct AllEntities {
    ctx: Arc<ExecContext>,
}

impl ToolDyn for AllEntities {
    fn name(&self) -> &str {
        "get-all-entities"
    }
    fn description(&self) -> &str {
        "List every entity the hub knows, with current state and friendly name."
    }
    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }
    fn call(&self, _input: Value) -> ToolFuture<'_> {
        Box::pin(async move {
            let states = self
                .ctx
                .hub
                .fetch_states()
                .await
                .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
            let entities: Vec<Value> = states.iter().map(entity_summary).collect();
            Ok(json!({"entities": entities}))
        })
    }
}

struct ServiceDomains {
    ctx: Arc<ExecContext>,
}

impl ToolDyn for ServiceDomains {
    fn name(&self) -> &str {
        "list-service-domains"
    }
    fn description(&self) -> &str {
        "List the service domains available on the hub."
    }
    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }
    fn call(&self, _input: Value) -> ToolFuture<'_> {
        Box::pin(async move {
            let catalog = self.ctx.services().await?;
            let domains: Vec<&String> = catalog.keys().collect();
            Ok(json!({"domains": domains}))
        })
    }
}

struct ServicesForDomain {
    ctx: Arc<ExecContext>,
}

impl ToolDyn for ServicesForDomain {
    fn name(&self) -> &str {
        "get-services-for-domain"
    }
    fn description(&self) -> &str {
        "List the services of one domain, with descriptions and fields."
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"domain": {"type": "string"}},
            "required": ["domain"]
        })
    }
    fn call(&self, input: Value) -> ToolFuture<'_> {
        Box::pin(async move {
            let domain = require_str(&input, "domain")?;
            let catalog = self.ctx.services().await?;
            match catalog.get(domain) {
                Some(services) => {
                    let listed: Vec<Value> = services
                        .iter()
                        .map(|(name, def)| {
                            json!({
                                "service": name,
                                "description": def.description,
                                "fields": def.fields,
                            })
                        })
                        .collect();
                    Ok(json!({"domain": domain, "services": listed}))
                }
                None => Err(ToolError::InvalidInput(format!(
                    "unknown domain `{domain}`; use list-service-domains first"
                ))),
            }
        })
    }
}

struct CallService {
    ctx: Arc<ExecContext>,
}

impl ToolDyn for CallService {
    fn name(&self) -> &str {
        "call-service"
    }
    fn description(&self) -> &str {
        "Invoke a hub service against one or more entities. The only tool \
         that changes the world."
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "domain": {"type": "string", "description": "Service domain, e.g. `light`"},
                "service": {"type": "string", "description": "Service name, e.g. `turn_off`"},
                "target": {
                    "type": "object",
                    "properties": {
                        "entity_id": {
                            "description": "Entity id or array of entity ids",
                            "anyOf": [
                                {"type": "string"},
                                {"type": "array", "items": {"type": "string"}}
                            ]
                        }
                    },
                    "required": ["entity_id"]
                },
                "data": {"type": "object", "description": "Service-specific data"}
            },
            "required": ["domain", "service", "target"]
        })
    }
    fn call(&self, input: Value) -> ToolFuture<'_> {
        Box::pin(async move {
            let domain = require_str(&input, "domain")?.to_string();
            let service = require_str(&input, "service")?.to_string();
            let target: ServiceTarget = input
                .get("target")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .ok_or_else(|| {
                    ToolError::InvalidInput("missing or malformed `target.entity_id`".into())
                })?;
            let data = input.get("data").cloned();

            if self.ctx.test_mode {
                // Never contact the hub; reject cross-domain targets so
                // bad calls are caught in dry runs.
                for entity_id in target.entity_id.to_vec() {
                    let entity_domain = entity_id.split('.').next().unwrap_or_default();
                    if entity_domain != domain {
                        return Err(ToolError::InvalidInput(format!(
                            "entity `{entity_id}` does not belong to service domain `{domain}`"
                        )));
                    }
                }
            }

            let request = CallServiceRequest {
                domain: domain.clone(),
                service: service.clone(),
                target: Some(target.clone()),
                service_data: data.clone(),
                return_response: false,
            };

            let response = if self.ctx.test_mode {
                None
            } else {
                self.ctx.hub.call_service(request).await.map_err(|e| match e {
                    HubError::UnknownService { domain, service } => ToolError::InvalidInput(
                        format!("no such service: {domain}.{service}"),
                    ),
                    other => ToolError::ExecutionFailed(other.to_string()),
                })?
            };

            let target_json = serde_json::to_value(&target)
                .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
            self.ctx
                .store
                .record_service_call(
                    self.ctx.automation_log_id,
                    &format!("{domain}.{service}"),
                    &target_json,
                    &data.unwrap_or(Value::Null),
                )
                .await
                .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

            Ok(json!({
                "success": true,
                "test_mode": self.ctx.test_mode,
                "response": response,
            }))
        })
    }
}

struct ReadMemory {
    ctx: Arc<ExecContext>,
}

impl ToolDyn for ReadMemory {
    fn name(&self) -> &str {
        "read-memory"
    }
    fn description(&self) -> &str {
        "Read the shared scratchpad left by previous runs."
    }
    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }
    fn call(&self, _input: Value) -> ToolFuture<'_> {
        Box::pin(async move {
            let content = self
                .ctx
                .memory
                .read()
                .await
                .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
            Ok(json!({"content": content}))
        })
    }
}

struct WriteMemory {
    ctx: Arc<ExecContext>,
}

impl ToolDyn for WriteMemory {
    fn name(&self) -> &str {
        "write-memory"
    }
    fn description(&self) -> &str {
        "Overwrite the shared scratchpad. Keep it short; it is read by every future run."
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        })
    }
    fn call(&self, input: Value) -> ToolFuture<'_> {
        Box::pin(async move {
            let text = require_str(&input, "text")?;
            self.ctx
                .memory
                .write(text)
                .await
                .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
            Ok(json!({"written": text.len()}))
        })
    }
}

struct AnalyzeImage {
    ctx: Arc<ExecContext>,
}

impl ToolDyn for AnalyzeImage {
    fn name(&self) -> &str {
        "analyze-image"
    }
    fn description(&self) -> &str {
        "Describe an image with the vision model. Provide `image_url` or \
         base64 `image_data` plus `media_type`, and an optional `question`."
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "image_url": {"type": "string"},
                "image_data": {"type": "string", "description": "Base64-encoded image bytes"},
                "media_type": {"type": "string", "description": "e.g. image/jpeg"},
                "question": {"type": "string"}
            }
        })
    }
    fn call(&self, input: Value) -> ToolFuture<'_> {
        Box::pin(async move {
            let Some(vision) = &self.ctx.vision else {
                return Err(ToolError::ExecutionFailed(
                    "no vision model configured".into(),
                ));
            };

            let media_type = input
                .get("media_type")
                .and_then(|v| v.as_str())
                .unwrap_or("image/jpeg")
                .to_string();
            let source = if let Some(url) = input.get("image_url").and_then(|v| v.as_str()) {
                ImageSource::Url { url: url.into() }
            } else if let Some(data) = input.get("image_data").and_then(|v| v.as_str()) {
                self.ctx
                    .store
                    .insert_image(
                        Some(self.ctx.automation_log_id),
                        &media_type,
                        data.as_bytes(),
                    )
                    .await
                    .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
                ImageSource::Base64 { data: data.into() }
            } else {
                return Err(ToolError::InvalidInput(
                    "provide `image_url` or `image_data`".into(),
                ));
            };

            let question = input
                .get("question")
                .and_then(|v| v.as_str())
                .unwrap_or("Describe this image.");

            let response = vision
                .complete_dyn(ProviderRequest {
                    model: None,
                    messages: vec![Message {
                        role: Role::User,
                        content: vec![
                            ContentPart::Image { source, media_type },
                            ContentPart::Text {
                                text: question.into(),
                            },
                        ],
                    }],
                    tools: vec![],
                    max_tokens: Some(1024),
                    temperature: None,
                    system: None,
                })
                .await
                .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

            Ok(json!({"analysis": response.message.text()}))
        })
    }
}
