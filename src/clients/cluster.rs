//! Cluster Client: the workload scheduler's HTTP API.

use crate::clients::http::{ClientSettings, HttpTransport};
use crate::clients::ClusterApi;
use crate::domain::{Allocation, JobSpec, JobStatus, JobSummary};
use crate::errors::Result;
use crate::secrets::SecretString;
use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, instrument};

const TOKEN_HEADER: &str = "X-Nomad-Token";

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JobResponse {
    #[serde(rename = "ID")]
    id: String,
    status: String,
    #[serde(default)]
    meta: Option<BTreeMap<String, String>>,
    #[serde(default)]
    task_groups: Vec<TaskGroupResponse>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TaskGroupResponse {
    #[serde(default)]
    count: u32,
    #[serde(default)]
    tasks: Vec<TaskResponse>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TaskResponse {
    #[serde(default)]
    config: Option<HashMap<String, Value>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SummaryResponse {
    #[serde(default)]
    summary: HashMap<String, GroupSummary>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct GroupSummary {
    #[serde(default)]
    running: u32,
    #[serde(default)]
    starting: u32,
    #[serde(default)]
    queued: u32,
    #[serde(default)]
    failed: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AllocationResponse {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "JobID")]
    job_id: String,
    client_status: String,
}

impl From<JobResponse> for JobStatus {
    fn from(job: JobResponse) -> Self {
        let image = job
            .task_groups
            .iter()
            .flat_map(|group| group.tasks.iter())
            .find_map(|task| {
                task.config.as_ref()?.get("image")?.as_str().map(str::to_string)
            });
        let count = job.task_groups.iter().map(|group| group.count).sum();
        JobStatus { id: job.id, status: job.status, image, count, meta: job.meta.unwrap_or_default() }
    }
}

/// Render the scheduler's job document
pub fn job_document(spec: &JobSpec) -> Value {
    let mut task = json!({
        "Name": spec.id,
        "Driver": "docker",
        "Config": { "image": spec.image },
        "Env": spec.env,
    });

    if let Some(template) = &spec.template {
        task["Templates"] = json!([{
            "EmbeddedTmpl": format!(
                "{{{{ with secret \"{}\" }}}}{{{{ .Data.data | toJSON }}}}{{{{ end }}}}",
                template.path
            ),
            "DestPath": template.destination,
            "ChangeMode": "restart",
        }]);
    }

    let mut group = json!({
        "Name": spec.group,
        "Count": spec.count,
        "Tasks": [task],
    });
    if let Some(service) = &spec.service_name {
        group["Services"] = json!([{ "Name": service, "Tags": [spec.id] }]);
    }

    json!({
        "Job": {
            "ID": spec.id,
            "Name": spec.id,
            "Type": "service",
            "Datacenters": spec.datacenters,
            "Meta": spec.meta,
            "TaskGroups": [group],
        }
    })
}

/// reqwest implementation of [`ClusterApi`]
#[derive(Debug, Clone)]
pub struct HttpCluster {
    transport: HttpTransport,
}

impl HttpCluster {
    pub fn new(address: &str, token: Option<SecretString>, settings: &ClientSettings) -> Result<Self> {
        let transport =
            HttpTransport::new("scheduler", address, settings)?.with_auth_header(TOKEN_HEADER, token);
        Ok(Self { transport })
    }
}

#[async_trait]
impl ClusterApi for HttpCluster {
    fn address(&self) -> &str {
        self.transport.base_url()
    }

    async fn leader(&self) -> Result<Option<String>> {
        let leader: String = self.transport.get_json("/v1/status/leader").await?;
        Ok(Some(leader).filter(|l| !l.is_empty()))
    }

    async fn job_status(&self, job_id: &str) -> Result<Option<JobStatus>> {
        let job: Option<JobResponse> = self.transport.get_optional(&format!("/v1/job/{job_id}")).await?;
        Ok(job.map(JobStatus::from))
    }

    async fn job_summary(&self, job_id: &str) -> Result<Option<JobSummary>> {
        let summary: Option<SummaryResponse> =
            self.transport.get_optional(&format!("/v1/job/{job_id}/summary")).await?;

        Ok(summary.map(|s| {
            s.summary.values().fold(JobSummary::default(), |acc, group| JobSummary {
                running: acc.running + group.running,
                starting: acc.starting + group.starting,
                queued: acc.queued + group.queued,
                failed: acc.failed + group.failed,
            })
        }))
    }

    #[instrument(skip(self, spec), fields(job_id = %spec.id, image = %spec.image))]
    async fn submit_job(&self, spec: &JobSpec) -> Result<()> {
        let request = self.transport.request(Method::POST, "/v1/jobs")?.json(&job_document(spec));
        self.transport.expect_success(request).await?;
        debug!("job registered");
        Ok(())
    }

    async fn stop_job(&self, job_id: &str, purge: bool) -> Result<()> {
        let request = self
            .transport
            .request(Method::DELETE, &format!("/v1/job/{job_id}?purge={purge}"))?;
        self.transport.expect_success(request).await
    }

    async fn scale_job(&self, job_id: &str, group: &str, count: u32) -> Result<()> {
        let request = self
            .transport
            .request(Method::POST, &format!("/v1/job/{job_id}/scale"))?
            .json(&json!({
                "Count": count,
                "Target": { "Group": group },
                "Message": "cutover rollout step",
            }));
        self.transport.expect_success(request).await
    }

    async fn job_allocations(&self, job_id: &str) -> Result<Vec<Allocation>> {
        let allocations: Vec<AllocationResponse> =
            self.transport.get_json(&format!("/v1/job/{job_id}/allocations")).await?;
        Ok(allocations
            .into_iter()
            .map(|a| Allocation { id: a.id, job_id: a.job_id, client_status: a.client_status })
            .collect())
    }

    async fn restart_allocation(&self, allocation_id: &str) -> Result<()> {
        let request = self
            .transport
            .request(Method::POST, &format!("/v1/client/allocation/{allocation_id}/restart"))?
            .json(&json!({}));
        self.transport.expect_success(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SecretTemplate;

    #[test]
    fn test_job_document_shape() {
        let spec = JobSpec::new("cutover-secret-probe", "busybox:1.36", "dc1")
            .with_meta("version", "v2")
            .with_service("probe")
            .with_template(SecretTemplate {
                path: "secret/data/cutover/probe".into(),
                destination: "secrets/probe.json".into(),
            });
        let doc = job_document(&spec);

        assert_eq!(doc["Job"]["ID"], "cutover-secret-probe");
        assert_eq!(doc["Job"]["Datacenters"][0], "dc1");
        assert_eq!(doc["Job"]["Meta"]["version"], "v2");
        let group = &doc["Job"]["TaskGroups"][0];
        assert_eq!(group["Count"], 1);
        assert_eq!(group["Services"][0]["Name"], "probe");
        let task = &group["Tasks"][0];
        assert_eq!(task["Config"]["image"], "busybox:1.36");
        let tmpl = task["Templates"][0]["EmbeddedTmpl"].as_str().unwrap();
        assert!(tmpl.starts_with("{{ with secret \"secret/data/cutover/probe\" }}"));
    }

    #[test]
    fn test_job_status_from_response() {
        let body = r#"{"ID":"web-v2","Status":"running","Meta":{"version":"v2"},
            "TaskGroups":[{"Name":"web","Count":3,"Tasks":[{"Config":{"image":"web:2"}}]}]}"#;
        let status: JobStatus = serde_json::from_str::<JobResponse>(body).unwrap().into();
        assert_eq!(status.count, 3);
        assert_eq!(status.image.as_deref(), Some("web:2"));
        assert_eq!(status.meta.get("version").map(String::as_str), Some("v2"));
    }
}
