//! Canned hub fixture for tests and the eval harness.

use std::sync::Mutex;

use tokio::sync::broadcast;

use crate::types::{CallServiceRequest, EntityState, HubEvent, ServiceCatalog};
use crate::{HubClient, HubError};

/// Canned states used when no fixture is supplied.
const STATES_FIXTURE: &str = include_str!("../mocks/states.json");
/// Canned service catalog used when no fixture is supplied.
const SERVICES_FIXTURE: &str = include_str!("../mocks/services.json");

/// An in-memory hub backed by canned fixtures.
///
/// Records every service call so tests and graders can assert on what
/// the model actually did. State-change events are injected through
/// [`MockHub::emit`].
pub struct MockHub {
    states: Mutex<Vec<EntityState>>,
    services: ServiceCatalog,
    calls: Mutex<Vec<CallServiceRequest>>,
    events: broadcast::Sender<HubEvent>,
}

impl MockHub {
    /// Build a hub from the bundled fixtures.
    ///
    /// # Panics
    ///
    /// Only if the fixtures compiled into the binary are invalid, which
    /// is a build defect rather than a runtime condition.
    pub fn new() -> Self {
        Self::from_fixtures(STATES_FIXTURE, SERVICES_FIXTURE)
            .unwrap_or_else(|e| panic!("bundled fixtures must parse: {e}"))
    }

    /// Build a hub from custom fixture JSON.
    pub fn from_fixtures(states_json: &str, services_json: &str) -> Result<Self, HubError> {
        let states: Vec<EntityState> = serde_json::from_str(states_json)
            .map_err(|e| HubError::InvalidResponse(format!("states fixture: {e}")))?;
        let services: ServiceCatalog = serde_json::from_str(services_json)
            .map_err(|e| HubError::InvalidResponse(format!("services fixture: {e}")))?;
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            states: Mutex::new(states),
            services,
            calls: Mutex::new(Vec::new()),
            events,
        })
    }

    /// Every service call made so far, in order.
    pub fn recorded_calls(&self) -> Vec<CallServiceRequest> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Set an entity's state and broadcast the change.
    pub fn set_state(&self, entity_id: &str, new_state: &str) {
        {
            let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entity) = states.iter_mut().find(|s| s.entity_id == entity_id) {
                entity.state = new_state.to_string();
            }
        }
        self.emit(HubEvent::state_changed(entity_id, new_state));
    }

    /// Broadcast an arbitrary event.
    pub fn emit(&self, event: HubEvent) {
        let _ = self.events.send(event);
    }
}

impl Default for MockHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl HubClient for MockHub {
    async fn fetch_states(&self) -> Result<Vec<EntityState>, HubError> {
        Ok(self.states.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn fetch_services(&self) -> Result<ServiceCatalog, HubError> {
        Ok(self.services.clone())
    }

    async fn call_service(
        &self,
        request: CallServiceRequest,
    ) -> Result<Option<serde_json::Value>, HubError> {
        let known = self
            .services
            .get(&request.domain)
            .is_some_and(|domain| domain.contains_key(&request.service));
        if !known {
            return Err(HubError::UnknownService {
                domain: request.domain,
                service: request.service,
            });
        }
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);
        Ok(None)
    }

    fn events(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityIds, ServiceTarget};

    #[tokio::test]
    async fn fixtures_load_and_contain_living_room_lights() {
        let hub = MockHub::new();
        let states = hub.fetch_states().await.unwrap();
        let living_room: Vec<&str> = states
            .iter()
            .filter(|s| s.entity_id.starts_with("light.living_room"))
            .filter_map(|s| s.friendly_name())
            .collect();
        assert!(living_room.contains(&"Bookshelf Light"));
        assert!(living_room.contains(&"Overhead Light"));
        assert!(living_room.contains(&"TV Lightstrip"));
    }

    #[tokio::test]
    async fn calls_are_recorded() {
        let hub = MockHub::new();
        hub.call_service(CallServiceRequest {
            domain: "light".into(),
            service: "turn_off".into(),
            target: Some(ServiceTarget {
                entity_id: EntityIds::One("light.kitchen_dining_room_chandelier".into()),
            }),
            service_data: None,
            return_response: false,
        })
        .await
        .unwrap();

        let calls = hub.recorded_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].service, "turn_off");
    }

    #[tokio::test]
    async fn unknown_service_is_rejected() {
        let hub = MockHub::new();
        let err = hub
            .call_service(CallServiceRequest {
                domain: "light".into(),
                service: "explode".into(),
                target: None,
                service_data: None,
                return_response: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::UnknownService { .. }));
    }

    #[tokio::test]
    async fn set_state_broadcasts_change() {
        let hub = MockHub::new();
        let mut events = hub.events();
        hub.set_state("binary_sensor.front_door", "on");
        let event = events.recv().await.unwrap();
        let change = event.as_state_change().unwrap();
        assert_eq!(change.entity_id, "binary_sensor.front_door");
        assert_eq!(change.new_state, "on");

        let states = hub.fetch_states().await.unwrap();
        let door = states
            .iter()
            .find(|s| s.entity_id == "binary_sensor.front_door")
            .unwrap();
        assert_eq!(door.state, "on");
    }
}
