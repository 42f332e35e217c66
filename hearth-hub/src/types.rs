//! Entity, service, and event types for the hub contract.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A snapshot of one entity's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    /// Entity identifier, `<domain>.<object_id>`.
    pub entity_id: String,
    /// Current state as a string.
    pub state: String,
    /// Free-form attribute map.
    #[serde(default)]
    pub attributes: serde_json::Value,
    /// When the state last changed.
    #[serde(default)]
    pub last_changed: Option<DateTime<Utc>>,
    /// When the state was last written.
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl EntityState {
    /// The domain prefix of the entity id (`light` for `light.porch`).
    pub fn domain(&self) -> &str {
        self.entity_id.split('.').next().unwrap_or_default()
    }

    /// The `friendly_name` attribute, if present.
    pub fn friendly_name(&self) -> Option<&str> {
        self.attributes.get("friendly_name").and_then(|v| v.as_str())
    }
}

/// Definition of one service within a domain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceDef {
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Field schema (free-form).
    #[serde(default)]
    pub fields: serde_json::Value,
}

/// `domain → service → definition`, as returned by the hub.
pub type ServiceCatalog = BTreeMap<String, BTreeMap<String, ServiceDef>>;

/// One or many entity ids in a service target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityIds {
    /// A single entity id.
    One(String),
    /// A list of entity ids.
    Many(Vec<String>),
}

impl EntityIds {
    /// Flatten to a slice-friendly vector of ids.
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            EntityIds::One(id) => vec![id.clone()],
            EntityIds::Many(ids) => ids.clone(),
        }
    }
}

/// Target of a service call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceTarget {
    /// The entity or entities to act on.
    pub entity_id: EntityIds,
}

/// A request to invoke a hub service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallServiceRequest {
    /// Service domain, e.g. `light`.
    pub domain: String,
    /// Service name, e.g. `turn_off`.
    pub service: String,
    /// Entities to act on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ServiceTarget>,
    /// Service-specific data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_data: Option<serde_json::Value>,
    /// Whether to request a response payload.
    #[serde(default)]
    pub return_response: bool,
}

/// An event from the hub's event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubEvent {
    /// Event type, e.g. `state_changed`.
    pub event_type: String,
    /// Event payload.
    #[serde(default)]
    pub data: serde_json::Value,
}

/// The parsed payload of a `state_changed` event.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    /// The entity whose state changed.
    pub entity_id: String,
    /// The new state string.
    pub new_state: String,
}

impl HubEvent {
    /// Build a `state_changed` event.
    pub fn state_changed(entity_id: &str, new_state: &str) -> Self {
        Self {
            event_type: "state_changed".into(),
            data: serde_json::json!({
                "entity_id": entity_id,
                "new_state": {"entity_id": entity_id, "state": new_state},
            }),
        }
    }

    /// Parse this event as a state change, if it is one.
    pub fn as_state_change(&self) -> Option<StateChange> {
        if self.event_type != "state_changed" {
            return None;
        }
        let entity_id = self.data.get("entity_id")?.as_str()?.to_string();
        let new_state = self
            .data
            .get("new_state")?
            .get("state")?
            .as_str()?
            .to_string();
        Some(StateChange {
            entity_id,
            new_state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entity_domain_and_friendly_name() {
        let entity = EntityState {
            entity_id: "light.bookshelf".into(),
            state: "on".into(),
            attributes: json!({"friendly_name": "Bookshelf Light"}),
            last_changed: None,
            last_updated: None,
        };
        assert_eq!(entity.domain(), "light");
        assert_eq!(entity.friendly_name(), Some("Bookshelf Light"));
    }

    #[test]
    fn entity_ids_accepts_one_or_many() {
        let one: EntityIds = serde_json::from_value(json!("light.a")).unwrap();
        assert_eq!(one.to_vec(), vec!["light.a"]);
        let many: EntityIds = serde_json::from_value(json!(["light.a", "light.b"])).unwrap();
        assert_eq!(many.to_vec().len(), 2);
    }

    #[test]
    fn state_change_round_trip() {
        let event = HubEvent::state_changed("binary_sensor.front_door", "on");
        let change = event.as_state_change().unwrap();
        assert_eq!(change.entity_id, "binary_sensor.front_door");
        assert_eq!(change.new_state, "on");
    }

    #[test]
    fn non_state_events_parse_to_none() {
        let event = HubEvent {
            event_type: "service_registered".into(),
            data: json!({}),
        };
        assert!(event.as_state_change().is_none());
    }
}
