use crate::domain::AuditEntryId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Operator-facing audit record. Never carries secret material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: AuditEntryId,
    pub environment: String,
    pub resource_type: String,
    pub action: String,
    pub resource_id: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(environment: &str, resource_type: &str, action: &str) -> Self {
        Self {
            id: AuditEntryId::new(),
            environment: environment.to_string(),
            resource_type: resource_type.to_string(),
            action: action.to_string(),
            resource_id: None,
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn resource(mut self, id: impl Into<String>) -> Self {
        self.resource_id = Some(id.into());
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}
