//! HTTP client tests against wiremock servers.

use chrono::{TimeZone, Utc};
use cutover::clients::{
    ClientSettings, ClusterApi, DiscoveryApi, HttpCluster, HttpDiscovery, HttpMetrics, HttpRegistry,
    HttpSecretStore, MetricsApi, RegistryApi, SecretStoreApi, TokenCreateRequest,
};
use cutover::secrets::SecretString;
use cutover::CutoverError;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_json, body_partial_json, body_string, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn settings() -> ClientSettings {
    ClientSettings { timeout: Duration::from_secs(2), connect_timeout: Duration::from_secs(1) }
}

mod secret_store {
    use super::*;

    #[tokio::test]
    async fn test_sealed_node_still_reports_health() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/sys/health"))
            .and(query_param("sealedcode", "200"))
            .and(query_param("standbyok", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "initialized": true,
                "sealed": true,
                "standby": false,
                "replication_performance_mode": "primary",
                "version": "1.15.4"
            })))
            .mount(&server)
            .await;

        let store = HttpSecretStore::new(&server.uri(), &settings()).unwrap();
        let health = store.health().await.unwrap();
        assert!(health.sealed);
        assert!(!health.is_serving());
        assert_eq!(health.replication_performance_mode.as_deref(), Some("primary"));
    }

    #[tokio::test]
    async fn test_replication_status_reads_data_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/sys/replication/performance/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "mode": "secondary", "last_wal": 150, "last_remote_wal": 142, "state": "stream-wals" }
            })))
            .mount(&server)
            .await;

        let store = HttpSecretStore::new(&server.uri(), &settings()).unwrap();
        let info = store.replication_status().await.unwrap();
        assert_eq!(info.mode, "secondary");
        assert_eq!(info.last_wal, Some(150));
        assert_eq!(info.last_remote_wal, Some(142));
    }

    #[tokio::test]
    async fn test_create_token_sends_credential_and_policies() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/auth/token/create"))
            .and(header("X-Vault-Token", "s.root"))
            .and(body_partial_json(json!({ "policies": ["cutover-integration"], "ttl": "768h", "no_parent": true })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "auth": {
                    "client_token": "s.minted",
                    "accessor": "acc-1",
                    "policies": ["cutover-integration", "default"],
                    "lease_duration": 2764800
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let store = HttpSecretStore::new(&server.uri(), &settings()).unwrap();
        let request = TokenCreateRequest {
            policies: vec!["cutover-integration".to_string()],
            ttl: Some("768h".to_string()),
            display_name: None,
            no_parent: true,
        };
        let created = store.create_token(&SecretString::new("s.root"), &request).await.unwrap();
        assert_eq!(created.client_token.expose_secret(), "s.minted");
        assert_eq!(created.accessor, "acc-1");
        assert_eq!(created.lease_duration, 2_764_800);
    }

    #[tokio::test]
    async fn test_revoke_posts_target_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/auth/token/revoke"))
            .and(header("X-Vault-Token", "s.root"))
            .and(body_json(json!({ "token": "s.old" })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let store = HttpSecretStore::new(&server.uri(), &settings()).unwrap();
        store.revoke_token(&SecretString::new("s.root"), &SecretString::new("s.old")).await.unwrap();
    }

    #[tokio::test]
    async fn test_kv_read_missing_path_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/cutover/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "errors": [] })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/cutover/probe"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "data": { "probe": "abc" }, "metadata": { "version": 3 } }
            })))
            .mount(&server)
            .await;

        let store = HttpSecretStore::new(&server.uri(), &settings()).unwrap();
        let token = SecretString::new("s.root");
        assert_eq!(store.kv_read(&token, "secret/data/cutover/missing").await.unwrap(), None);
        assert_eq!(
            store.kv_read(&token, "/secret/data/cutover/probe").await.unwrap(),
            Some(json!({ "probe": "abc" }))
        );
    }

    #[tokio::test]
    async fn test_rejected_promotion_is_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/sys/replication/performance/secondary/promote"))
            .respond_with(ResponseTemplate::new(403).set_body_string("permission denied"))
            .mount(&server)
            .await;

        let store = HttpSecretStore::new(&server.uri(), &settings()).unwrap();
        let err = store.promote_secondary(&SecretString::new("s.weak")).await.unwrap_err();
        match &err {
            CutoverError::Http { status, message, .. } => {
                assert_eq!(*status, 403);
                assert_eq!(message, "permission denied");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_unreachable_store_is_transient() {
        let store = HttpSecretStore::new("http://127.0.0.1:1", &settings()).unwrap();
        let err = store.seal_status().await.unwrap_err();
        assert!(matches!(err, CutoverError::Transport { .. }));
        assert!(err.is_transient());
    }
}

mod cluster {
    use super::*;
    use cutover::domain::JobSpec;

    #[tokio::test]
    async fn test_leader_and_empty_leader() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/status/leader"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!("10.0.0.4:4647")))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/status/leader"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!("")))
            .mount(&server)
            .await;

        let cluster = HttpCluster::new(&server.uri(), None, &settings()).unwrap();
        assert_eq!(cluster.leader().await.unwrap().as_deref(), Some("10.0.0.4:4647"));
        assert_eq!(cluster.leader().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_job_status_and_missing_job() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/job/web-v1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ID": "web-v1",
                "Status": "running",
                "Meta": { "version": "v1" },
                "TaskGroups": [{ "Name": "web", "Count": 3, "Tasks": [{ "Config": { "image": "web:v1" } }] }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/job/web-v9"))
            .respond_with(ResponseTemplate::new(404).set_body_string("job not found"))
            .mount(&server)
            .await;

        let cluster = HttpCluster::new(&server.uri(), None, &settings()).unwrap();
        let job = cluster.job_status("web-v1").await.unwrap().unwrap();
        assert_eq!(job.count, 3);
        assert_eq!(job.image.as_deref(), Some("web:v1"));
        assert!(cluster.job_status("web-v9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_summary_adds_task_groups() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/job/api/summary"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "JobID": "api",
                "Summary": {
                    "api": { "Running": 2, "Starting": 1, "Queued": 0, "Failed": 0 },
                    "sidecar": { "Running": 1, "Failed": 1 }
                }
            })))
            .mount(&server)
            .await;

        let cluster = HttpCluster::new(&server.uri(), None, &settings()).unwrap();
        let summary = cluster.job_summary("api").await.unwrap().unwrap();
        assert_eq!(summary.running, 3);
        assert_eq!(summary.starting, 1);
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn test_submit_and_scale_carry_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/jobs"))
            .and(header("X-Nomad-Token", "nomad-secret"))
            .and(body_partial_json(json!({ "Job": { "ID": "web-v2", "Datacenters": ["dc1"] } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "EvalID": "e-1" })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/job/web-v2/scale"))
            .and(header("X-Nomad-Token", "nomad-secret"))
            .and(body_partial_json(json!({ "Count": 4, "Target": { "Group": "web-v2" } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "EvalID": "e-2" })))
            .expect(1)
            .mount(&server)
            .await;

        let cluster =
            HttpCluster::new(&server.uri(), Some(SecretString::new("nomad-secret")), &settings()).unwrap();
        cluster.submit_job(&JobSpec::new("web-v2", "web:v2", "dc1")).await.unwrap();
        cluster.scale_job("web-v2", "web-v2", 4).await.unwrap();
    }

    #[tokio::test]
    async fn test_allocations_and_restart() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/job/api/allocations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "ID": "a-1", "JobID": "api", "ClientStatus": "running" },
                { "ID": "a-2", "JobID": "api", "ClientStatus": "complete" }
            ])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/client/allocation/a-1/restart"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let cluster = HttpCluster::new(&server.uri(), None, &settings()).unwrap();
        let allocations = cluster.job_allocations("api").await.unwrap();
        assert_eq!(allocations.len(), 2);
        assert_eq!(allocations[1].client_status, "complete");
        cluster.restart_allocation(&allocations[0].id).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_job_purges() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/job/web-v2"))
            .and(query_param("purge", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "EvalID": "e-3" })))
            .expect(1)
            .mount(&server)
            .await;

        let cluster = HttpCluster::new(&server.uri(), None, &settings()).unwrap();
        cluster.stop_job("web-v2", true).await.unwrap();
    }
}

mod registry {
    use super::*;

    #[tokio::test]
    async fn test_kv_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/kv/cutover/traffic/web"))
            .and(header("X-Consul-Token", "consul-secret"))
            .and(body_string(r#"{"v1":100}"#))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(true)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/kv/cutover/traffic/web"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"v1":100}"#))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/kv/cutover/traffic/api"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let registry =
            HttpRegistry::new(&server.uri(), Some(SecretString::new("consul-secret")), &settings()).unwrap();
        registry.kv_put("cutover/traffic/web", r#"{"v1":100}"#).await.unwrap();
        assert_eq!(registry.kv_get("cutover/traffic/web").await.unwrap().as_deref(), Some(r#"{"v1":100}"#));
        assert_eq!(registry.kv_get("cutover/traffic/api").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_refused_kv_write_is_conflict() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/kv/cutover/traffic/web"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(false)))
            .mount(&server)
            .await;

        let registry = HttpRegistry::new(&server.uri(), None, &settings()).unwrap();
        let err = registry.kv_put("cutover/traffic/web", "{}").await.unwrap_err();
        assert!(matches!(err, CutoverError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_healthy_instances_counts_passing_entries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/health/service/web"))
            .and(query_param("passing", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "Service": { "ID": "web-v1-a" } },
                { "Service": { "ID": "web-v1-b" } }
            ])))
            .mount(&server)
            .await;

        let registry = HttpRegistry::new(&server.uri(), None, &settings()).unwrap();
        assert_eq!(registry.healthy_instances("web").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_deregister_uses_service_id() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/agent/service/deregister/web-v2"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let registry = HttpRegistry::new(&server.uri(), None, &settings()).unwrap();
        registry.deregister_service("web-v2").await.unwrap();
    }
}

mod metrics {
    use super::*;

    const QUERY: &str = "sum(rate(http_requests_total{service=\"web\",version=\"v2\",code=~\"5..\"}[1m]))";

    #[tokio::test]
    async fn test_instant_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .and(query_param("query", QUERY))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": { "resultType": "vector", "result": [{ "metric": {}, "value": [1700000000.5, "0.042"] }] }
            })))
            .mount(&server)
            .await;

        let metrics = HttpMetrics::new(&server.uri(), &settings()).unwrap();
        assert_eq!(metrics.query(QUERY).await.unwrap(), Some(0.042));
    }

    #[tokio::test]
    async fn test_empty_vector_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": { "resultType": "vector", "result": [] }
            })))
            .mount(&server)
            .await;

        let metrics = HttpMetrics::new(&server.uri(), &settings()).unwrap();
        assert_eq!(metrics.query("up").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_query_range_samples() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query_range"))
            .and(query_param("step", "15s"))
            .and(query_param("start", "1700000000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": { "resultType": "matrix", "result": [{
                    "metric": {},
                    "values": [[1700000000, "0.01"], [1700000015, "NaN"], [1700000030, "0.03"]]
                }] }
            })))
            .mount(&server)
            .await;

        let metrics = HttpMetrics::new(&server.uri(), &settings()).unwrap();
        let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let end = Utc.timestamp_opt(1_700_000_030, 0).unwrap();
        let samples = metrics.query_range("up", start, end, 15).await.unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0], (start, 0.01));
        assert!(samples[1].1.is_nan());
        assert_eq!(samples[2], (end, 0.03));
    }

    #[tokio::test]
    async fn test_failed_query_status_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "error",
                "errorType": "bad_data",
                "error": "parse error at char 4"
            })))
            .mount(&server)
            .await;

        let metrics = HttpMetrics::new(&server.uri(), &settings()).unwrap();
        let err = metrics.query("sum(").await.unwrap_err();
        assert!(err.to_string().contains("parse error"));
    }

    #[tokio::test]
    async fn test_readiness() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/-/ready"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let metrics = HttpMetrics::new(&server.uri(), &settings()).unwrap();
        assert!(!metrics.ready().await.unwrap());
    }
}

mod discovery {
    use super::*;

    #[tokio::test]
    async fn test_upsert_record() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/records/vault.service.consul"))
            .and(header("Authorization", "Bearer dns-secret"))
            .and(body_json(json!({ "target": "http://vault-b:8200/", "ttl": 30 })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let discovery =
            HttpDiscovery::new(&server.uri(), Some(SecretString::new("dns-secret")), &settings()).unwrap();
        discovery.upsert("vault.service.consul", "http://vault-b:8200/", 30).await.unwrap();
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/records/vault.service.consul"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let discovery = HttpDiscovery::new(&server.uri(), None, &settings()).unwrap();
        let err = discovery.upsert("vault.service.consul", "http://vault-b:8200/", 30).await.unwrap_err();
        assert!(matches!(err, CutoverError::Http { status: 502, .. }));
        assert!(err.is_transient());
    }
}
