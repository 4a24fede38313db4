//! Scheduler job shapes used by the bootstrap and rollout paths.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Secret-store-backed template rendered into the task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretTemplate {
    /// KV path read through the scheduler's secret integration
    pub path: String,
    pub destination: String,
}

/// Minimal single-group, single-task service job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: String,
    pub datacenters: Vec<String>,
    pub group: String,
    pub count: u32,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub meta: BTreeMap<String, String>,
    pub service_name: Option<String>,
    pub template: Option<SecretTemplate>,
}

impl JobSpec {
    pub fn new(id: impl Into<String>, image: impl Into<String>, datacenter: &str) -> Self {
        let id = id.into();
        Self {
            group: id.clone(),
            id,
            datacenters: vec![datacenter.to_string()],
            count: 1,
            image: image.into(),
            env: BTreeMap::new(),
            meta: BTreeMap::new(),
            service_name: None,
            template: None,
        }
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    pub fn with_meta(mut self, key: &str, value: &str) -> Self {
        self.meta.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_service(mut self, name: &str) -> Self {
        self.service_name = Some(name.to_string());
        self
    }

    pub fn with_template(mut self, template: SecretTemplate) -> Self {
        self.template = Some(template);
        self
    }
}

/// Scheduler's view of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: String,
    /// "pending", "running" or "dead"
    pub status: String,
    pub image: Option<String>,
    pub count: u32,
    pub meta: BTreeMap<String, String>,
}

/// Allocation counts of a job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub running: u32,
    pub starting: u32,
    pub queued: u32,
    pub failed: u32,
}

impl JobSummary {
    /// At least `desired` allocations are running and none are still starting
    pub fn is_running(&self, desired: u32) -> bool {
        self.running >= desired.max(1) && self.starting == 0 && self.queued == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: String,
    pub job_id: String,
    pub client_status: String,
}

impl Allocation {
    pub fn is_running(&self) -> bool {
        self.client_status == "running"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_running() {
        let summary = JobSummary { running: 2, ..Default::default() };
        assert!(summary.is_running(2));
        assert!(!summary.is_running(3));
        assert!(!JobSummary { running: 2, starting: 1, ..Default::default() }.is_running(2));
        assert!(!JobSummary::default().is_running(0));
    }
}
