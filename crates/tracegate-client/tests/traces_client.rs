//! Integration tests for TracesClient.
//!
//! Uses wiremock for HTTP mocking. Tests cover retry behavior, 409 handling,
//! session login, direct uploads and get-or-create fallbacks.

use std::collections::BTreeMap;

use serde_json::json;
use serial_test::serial;
use tracegate_client::{
    BlobRequest, ClientConfig, ClientError, NewJob, NewTraceExec, ProjectRecord, TracesClient,
};
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config(mock_server: &MockServer) -> ClientConfig {
    ClientConfig::default()
        .with_url(mock_server.uri())
        .with_token("test-token")
        .with_backoff_ms(1)
}

fn create_test_client(mock_server: &MockServer) -> TracesClient {
    TracesClient::new(test_config(mock_server)).expect("failed to create client")
}

#[tokio::test]
async fn test_retry_on_502_then_success() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v1/traces"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/v1/traces"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": 1, "filename": "game.trace", "tracing_tool": "apitrace",
             "graphics_api": "OpenGL", "frames_to_capture": [10, 20]}
        ])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let traces = client.list_traces().await.expect("list failed");

    assert_eq!(traces.len(), 1);
    assert_eq!(traces[0].filename, "game.trace");
}

#[tokio::test]
async fn test_retries_exhausted() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v1/gpus"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(3)
        .mount(&mock_server)
        .await;

    let client = TracesClient::new(test_config(&mock_server).with_max_retries(2)).unwrap();
    let result = client.list_gpus().await;

    match result {
        Err(ClientError::Server { status, message, .. }) => {
            assert_eq!(status, 500);
            assert_eq!(message, "boom");
        }
        other => panic!("expected Server error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v1/gpus"))
        .respond_with(ResponseTemplate::new(422))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let result = client.list_gpus().await;

    assert!(matches!(result, Err(ClientError::Http { status: 422, .. })));
}

#[tokio::test]
async fn test_conflict_is_success() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/jobs"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "id": 77, "name": "nightly", "metadata": {}
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let job = client
        .job_get_or_create(&NewJob {
            name: "nightly".into(),
            is_released_code: false,
            commit_version: None,
            timeline: None,
        })
        .await
        .expect("409 should be treated as success");

    assert_eq!(job.id, 77);
}

#[tokio::test]
async fn test_bearer_token_header() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v1/gpus"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": 3, "pciid": "0x1002:0x163f", "name": "Van Gogh"}
        ])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let gpu = client.gpu_by_pciid("0x1002:0x163f").await.unwrap();

    assert_eq!(gpu.map(|g| g.id), Some(3));
}

#[tokio::test]
async fn test_password_login_happens_once() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/login"))
        .and(body_json(json!({"user": {"username": "ci", "password": "hunter2"}})))
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header("set-cookie", "_traces_session=s3cr3t; path=/; HttpOnly"),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/v1/gpus"))
        .and(header("cookie", "_traces_session=s3cr3t"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(2)
        .mount(&mock_server)
        .await;

    let config = ClientConfig::default()
        .with_url(mock_server.uri())
        .with_credentials("ci", "hunter2");
    let client = TracesClient::new(config).unwrap();

    assert!(client.list_gpus().await.unwrap().is_empty());
    assert!(client.list_gpus().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_login_is_unauthorized() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/login"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&mock_server)
        .await;

    let config = ClientConfig::default()
        .with_url(mock_server.uri())
        .with_credentials("ci", "wrong");
    let client = TracesClient::new(config).unwrap();

    let err = client.list_traces().await.unwrap_err();
    assert!(matches!(err, ClientError::Unauthorized { .. }));
    assert_eq!(err.exit_code(), 2);
}

#[tokio::test]
async fn test_direct_upload_flow() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rails/active_storage/direct_uploads"))
        .and(body_json(json!({"blob": {
            "filename": "0010.png", "byte_size": 4, "checksum": "abc==",
            "image_checksum": "img=="
        }})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "signed_id": "signed-1",
            "direct_upload": {
                "url": format!("{}/bucket/0010", mock_server.uri()),
                "headers": {"Content-MD5": "abc=="}
            }
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("PUT"))
        .and(path("/bucket/0010"))
        .and(header("content-md5", "abc=="))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let upload = client
        .create_direct_upload(&BlobRequest {
            filename: "0010.png".into(),
            byte_size: 4,
            checksum: "abc==".into(),
            image_checksum: Some("img==".into()),
        })
        .await
        .unwrap();

    assert_eq!(upload.signed_id, "signed-1");
    client.upload_blob(&upload, b"\x89PNG".to_vec()).await.unwrap();
}

#[tokio::test]
async fn test_direct_upload_without_signed_id_is_invalid() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rails/active_storage/direct_uploads"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "direct_upload": {"url": "http://storage/x", "headers": {}}
        })))
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let result = client
        .create_direct_upload(&BlobRequest {
            filename: "exec.log".into(),
            byte_size: 1,
            checksum: "x".into(),
            image_checksum: None,
        })
        .await;

    assert!(matches!(result, Err(ClientError::InvalidResponse { .. })));
}

#[tokio::test]
async fn test_image_checksum_hit_and_miss() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/image_checksum"))
        .and(body_json(json!({"checksum": "known=="})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 5, "signed_id": "signed-known"
        })))
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/v1/image_checksum"))
        .and(body_json(json!({"checksum": "new=="})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    assert_eq!(
        client.find_frame_by_image_checksum("known==").await.unwrap(),
        Some("signed-known".to_string())
    );
    assert_eq!(client.find_frame_by_image_checksum("new==").await.unwrap(), None);
}

#[tokio::test]
async fn test_project_falls_back_to_listing() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/projects"))
        .respond_with(
            ResponseTemplate::new(422).set_body_json(json!({"name": ["has already been taken"]})),
        )
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let result = client.project_get_or_create("mesa").await;
    assert!(matches!(result, Err(ClientError::Http { status: 422, .. })));

    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/projects"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({"errors": "taken"})))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/projects"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": 1, "name": "dxvk"},
            {"id": 2, "name": "mesa"}
        ])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let project = client.project_get_or_create("mesa").await.unwrap();
    assert_eq!(project.id, 2);
}

#[tokio::test]
async fn test_commit_get_or_create() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/commits"))
        .and(body_json(json!({"project_id": 2, "version": "deadbeef"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": 40, "project_id": 2, "version": "deadbeef"
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let project = ProjectRecord {
        id: 2,
        name: "mesa".into(),
        repo_url: None,
        project_url: None,
        base_url_for_commits: None,
    };
    let commit = client.commit_get_or_create(&project, "deadbeef").await.unwrap();
    assert_eq!(commit.id, 40);
}

#[tokio::test]
async fn test_trace_execs_query_and_missing_frames() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v1/trace_execs"))
        .and(query_param("q[job_id_eq]", "9"))
        .and(query_param("q[gpu_pciid_eq]", "0x1002:0x163f"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": 1, "trace": {"id": 3}, "status": 0,
             "driver": {"name": "radv", "version": "23.1.0", "branch": "v23.1.y", "commit": null}},
            {"id": 2, "trace": {"id": 4}, "status": 1, "trace_frames": {
                "10": {"id": 100, "frame_outputs": {"id": 5,
                    "deduped_frame_output": {"id": 6, "is_acceptable": true, "blob_id": 7}}}
            }}
        ])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let execs = client.list_trace_execs(9, "0x1002:0x163f").await.unwrap();

    assert_eq!(execs.len(), 2);
    assert!(execs[0].trace_frames.is_empty());
    assert_eq!(execs[0].driver.as_ref().and_then(|d| d.name.as_deref()), Some("radv"));
    let frame = &execs[1].trace_frames["10"];
    assert_eq!(frame.is_acceptable(), Some(true));
    assert_eq!(frame.deduped_frame_output_id(), Some(6));
}

#[tokio::test]
async fn test_create_trace_exec_payload() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/trace_execs"))
        .and(body_json(json!({
            "trace_exec": {
                "job_id": 9, "trace_id": 3, "metadata": {"machine_tags": ["vangogh"]},
                "status": 0, "exec_log": "signed-log", "execution_time": 1.5
            },
            "frame_blobs": {"10": "signed-frame"},
            "pciid": "0x1002:0x163f"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 55, "trace": {"id": 3}
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let mut frame_blobs = BTreeMap::new();
    frame_blobs.insert("10".to_string(), "signed-frame".to_string());

    let record = client
        .create_trace_exec(&NewTraceExec {
            job_id: 9,
            trace_id: 3,
            metadata: json!({"machine_tags": ["vangogh"]}),
            status: Some(0),
            exec_log: Some("signed-log".into()),
            execution_time: 1.5,
            frame_blobs,
            gpu_pciid: "0x1002:0x163f".into(),
            driver: None,
        })
        .await
        .unwrap();

    assert_eq!(record.id, 55);
    assert!(record.trace_frames.is_empty());
}

#[tokio::test]
async fn test_trace_frame_stats_window() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v1/stats/trace_frames/100"))
        .and(query_param("q[jobs_id_gt]", "400"))
        .and(query_param("q[jobs_id_lt]", "501"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "trace_frame": {"deduped_frames": [
                {"id": 1, "is_acceptable": true, "found_in_release_code_run": true,
                 "gpus": [{"frame_outputs_count": 3}]}
            ]}
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let stats = client
        .trace_frame_stats(100, "0x1002:0x163f", 500)
        .await
        .unwrap();

    assert_eq!(stats.deduped_frames.len(), 1);
    assert_eq!(stats.deduped_frames[0].outputs_count_for_gpu(), 3);
}

#[tokio::test]
async fn test_compatibility_reports_skip_malformed() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v1/trace_compatibilities"))
        .and(query_param("pciid", "0x1002:0x163f"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": 1, "trace_id": 3, "gpu_id": 2, "is_working": true, "agreement_count": 25,
             "commit": {"id": 8, "version": "abc", "project": {"id": 1, "name": "mesa"}}},
            {"id": 2, "trace_id": 3, "gpu_id": 2, "is_working": true, "commit": null}
        ])))
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let reports = client
        .list_compatibility_reports(Some("0x1002:0x163f"))
        .await
        .unwrap();

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].agreement_count, Some(25));
}

#[tokio::test]
async fn test_update_trace_fields() {
    let mock_server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/api/v1/traces/3"))
        .and(body_json(json!({"trace": {"obsolete": true}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 3})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    client
        .update_trace_fields(3, json!({"obsolete": true}))
        .await
        .unwrap();
}

#[test]
#[serial]
fn test_config_from_env() {
    std::env::set_var("TRACEGATE_URL", "http://traces.local");
    std::env::set_var("TRACEGATE_USERNAME", "ci");
    std::env::set_var("TRACEGATE_MAX_RETRIES", "5");
    std::env::remove_var("TRACEGATE_TOKEN");

    let config = ClientConfig::from_env();

    std::env::remove_var("TRACEGATE_URL");
    std::env::remove_var("TRACEGATE_USERNAME");
    std::env::remove_var("TRACEGATE_MAX_RETRIES");

    assert_eq!(config.url, "http://traces.local");
    assert_eq!(config.username.as_deref(), Some("ci"));
    assert_eq!(config.max_retries, 5);
    assert_eq!(config.timeout_secs, 30);
}
