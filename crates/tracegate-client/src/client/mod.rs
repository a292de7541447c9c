//! Traces server client.
//!
//! Public API: no status code knowledge. All HTTP/status mapping in http.rs.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, warn};

use crate::auth::{Credentials, Session};
use crate::error::{ClientError, ClientResult};
use crate::types::{
    BlobRequest, ClientConfig, CommitRecord, CompatibilityRecord, DirectUpload,
    DirectUploadResponse, GpuRecord, ImageChecksumResponse, JobRecord, NewCompatibility, NewJob,
    NewTraceExec, ProjectRecord, TraceExecRecord, TraceFrameStats, TraceRecord,
};

mod helpers;
mod http;

use helpers::{has_id, trace_execs_path, trace_frame_stats_path};
use http::HttpBackend;

const USER_AGENT_VALUE: &str = concat!("tracegate/", env!("CARGO_PKG_VERSION"));

/// Client for the traces server REST API.
#[derive(Debug, Clone)]
pub struct TracesClient {
    http: HttpBackend,
}

impl TracesClient {
    /// Create a client, picking credentials from the config.
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        let credentials = Credentials::resolve(
            config.token.as_deref(),
            config.username.as_deref(),
            config.password.as_deref(),
        )?;

        Self::with_credentials(config, credentials)
    }

    pub fn with_credentials(config: ClientConfig, credentials: Credentials) -> ClientResult<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(default_headers)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ClientError::Config {
                message: format!("failed to create HTTP client: {}", e),
            })?;

        let base_url = config.url.trim_end_matches('/').to_string();

        Ok(Self {
            http: HttpBackend {
                client,
                base_url,
                session: Arc::new(Session::new(credentials)),
                config,
            },
        })
    }

    pub fn from_env() -> ClientResult<Self> {
        Self::new(ClientConfig::from_env())
    }

    /// Base URL of the server, without trailing slash.
    pub fn base_url(&self) -> &str {
        &self.http.base_url
    }

    pub async fn list_traces(&self) -> ClientResult<Vec<TraceRecord>> {
        debug!("listing traces");
        self.http.get_json("/api/v1/traces").await
    }

    /// Update some fields of a trace (`{"trace": fields}`).
    pub async fn update_trace_fields(
        &self,
        trace_id: u64,
        fields: serde_json::Value,
    ) -> ClientResult<()> {
        debug!(trace_id, "updating trace fields");
        self.http
            .put_json(
                &format!("/api/v1/traces/{}", trace_id),
                json!({ "trace": fields }),
            )
            .await
            .map(|_| ())
    }

    pub async fn list_gpus(&self) -> ClientResult<Vec<GpuRecord>> {
        self.http.get_json("/api/v1/gpus").await
    }

    pub async fn gpu_by_pciid(&self, pciid: &str) -> ClientResult<Option<GpuRecord>> {
        Ok(self
            .list_gpus()
            .await?
            .into_iter()
            .find(|gpu| gpu.pciid == pciid))
    }

    /// List compatibility reports, optionally restricted to one GPU.
    ///
    /// Records that cannot be understood (e.g. without a commit) are
    /// skipped with a warning.
    pub async fn list_compatibility_reports(
        &self,
        gpu_pciid: Option<&str>,
    ) -> ClientResult<Vec<CompatibilityRecord>> {
        let path = match gpu_pciid {
            Some(pciid) => format!(
                "/api/v1/trace_compatibilities?pciid={}",
                helpers::encode_query_value(pciid)
            ),
            None => "/api/v1/trace_compatibilities".to_string(),
        };

        let raw: Vec<serde_json::Value> = self.http.get_json(&path).await?;
        let mut reports = Vec::with_capacity(raw.len());
        for value in raw {
            match serde_json::from_value::<CompatibilityRecord>(value.clone()) {
                Ok(record) if record.commit.is_some() => reports.push(record),
                Ok(_) => warn!(report = %value, "ignoring compatibility report without commit"),
                Err(e) => warn!(error = %e, report = %value, "ignoring malformed compatibility report"),
            }
        }

        Ok(reports)
    }

    /// File a compatibility report. Returns whether the server acknowledged it.
    pub async fn report_compatibility(&self, report: &NewCompatibility) -> ClientResult<bool> {
        let body = serde_json::to_value(report).map_err(|e| ClientError::InvalidResponse {
            message: format!("failed to encode compatibility report: {}", e),
        })?;
        let response = self
            .http
            .post_json("/api/v1/trace_compatibilities", body)
            .await?;
        Ok(has_id(&response))
    }

    /// Create a project, or find it if it already exists.
    pub async fn project_get_or_create(&self, name: &str) -> ClientResult<ProjectRecord> {
        let response = self
            .http
            .post_json(
                "/api/v1/projects",
                json!({
                    "name": name,
                    "repo_url": null,
                    "project_url": null,
                    "base_url_for_commits": null,
                }),
            )
            .await?;
        if has_id(&response) {
            return from_json(response, "project");
        }

        let projects: Vec<ProjectRecord> = self.http.get_json("/api/v1/projects").await?;
        projects
            .into_iter()
            .find(|p| p.name == name)
            .ok_or_else(|| ClientError::InvalidResponse {
                message: format!("failed to create or find the project '{}'", name),
            })
    }

    /// Create a commit of a project, or find it if it already exists.
    pub async fn commit_get_or_create(
        &self,
        project: &ProjectRecord,
        version: &str,
    ) -> ClientResult<CommitRecord> {
        let response = self
            .http
            .post_json(
                "/api/v1/commits",
                json!({ "project_id": project.id, "version": version }),
            )
            .await?;
        if has_id(&response) {
            return from_json(response, "commit");
        }

        let commits: Vec<CommitRecord> = self.http.get_json("/api/v1/commits").await?;
        commits
            .into_iter()
            .find(|c| c.project_id == project.id && c.version == version)
            .ok_or_else(|| ClientError::InvalidResponse {
                message: format!(
                    "failed to create or find the commit '{}' of '{}'",
                    version, project.name
                ),
            })
    }

    /// Create a job, or return the existing job with the same name.
    pub async fn job_get_or_create(&self, job: &NewJob) -> ClientResult<JobRecord> {
        let response = self
            .http
            .post_json(
                "/api/v1/jobs",
                json!({
                    "job": {
                        "name": job.name,
                        "is_released_code": job.is_released_code,
                        "commit_version": job.commit_version,
                    },
                    "job_timeline": job.timeline,
                }),
            )
            .await?;
        from_json(response, "job")
    }

    /// Executions already registered for a job on a GPU.
    pub async fn list_trace_execs(
        &self,
        job_id: u64,
        gpu_pciid: &str,
    ) -> ClientResult<Vec<TraceExecRecord>> {
        self.http
            .get_json(&trace_execs_path(job_id, gpu_pciid))
            .await
    }

    /// Register an execution with its uploaded frames and log.
    pub async fn create_trace_exec(&self, exec: &NewTraceExec) -> ClientResult<TraceExecRecord> {
        let mut body = json!({
            "trace_exec": {
                "job_id": exec.job_id,
                "trace_id": exec.trace_id,
                "metadata": exec.metadata,
                "status": exec.status,
                "exec_log": exec.exec_log,
                "execution_time": exec.execution_time,
            },
            "frame_blobs": exec.frame_blobs,
            "pciid": exec.gpu_pciid,
        });
        if let (Some(driver), Some(map)) = (&exec.driver, body.as_object_mut()) {
            map.insert("driver".to_string(), json!(driver));
        }

        let response = self.http.post_json("/api/v1/trace_execs", body).await?;
        from_json(response, "trace execution")
    }

    /// Deduplicated outputs of a trace frame on a GPU over the last jobs.
    pub async fn trace_frame_stats(
        &self,
        trace_frame_id: u64,
        gpu_pciid: &str,
        job_id: u64,
    ) -> ClientResult<TraceFrameStats> {
        let mut response: serde_json::Value = self
            .http
            .get_json(&trace_frame_stats_path(trace_frame_id, gpu_pciid, job_id))
            .await?;

        match response.get_mut("trace_frame").map(serde_json::Value::take) {
            Some(frame) if !frame.is_null() => from_json(frame, "trace frame stats"),
            _ => Ok(TraceFrameStats::default()),
        }
    }

    /// Look a frame up by image checksum. Returns the signed blob id on a hit.
    pub async fn find_frame_by_image_checksum(
        &self,
        image_checksum: &str,
    ) -> ClientResult<Option<String>> {
        let response = self
            .http
            .post_json(
                "/api/v1/image_checksum",
                json!({ "checksum": image_checksum }),
            )
            .await?;
        if !has_id(&response) {
            return Ok(None);
        }

        let hit: ImageChecksumResponse = from_json(response, "image checksum")?;
        match (hit.id, hit.signed_id) {
            (Some(_), Some(signed_id)) => Ok(Some(signed_id)),
            _ => Err(ClientError::InvalidResponse {
                message: "image checksum hit without a signed_id".to_string(),
            }),
        }
    }

    /// Ask the server where to upload a blob.
    pub async fn create_direct_upload(&self, blob: &BlobRequest) -> ClientResult<DirectUpload> {
        let response = self
            .http
            .post_json(
                "/rails/active_storage/direct_uploads",
                json!({ "blob": blob }),
            )
            .await?;

        let parsed: DirectUploadResponse = from_json(response, "direct upload")?;
        let target = parsed
            .direct_upload
            .ok_or_else(|| ClientError::InvalidResponse {
                message: "the 'direct_upload' dict is missing".to_string(),
            })?;
        let url = target.url.ok_or_else(|| ClientError::InvalidResponse {
            message: "the URL is missing from the 'direct_upload' dict".to_string(),
        })?;
        let headers = target.headers.ok_or_else(|| ClientError::InvalidResponse {
            message: "the headers are missing from the 'direct_upload' dict".to_string(),
        })?;
        let signed_id = parsed
            .signed_id
            .ok_or_else(|| ClientError::InvalidResponse {
                message: "the signed_id is missing from the blob-creation response".to_string(),
            })?;

        Ok(DirectUpload {
            url,
            headers,
            signed_id,
        })
    }

    /// PUT the blob bytes to the storage location of a direct upload.
    pub async fn upload_blob(&self, upload: &DirectUpload, data: Vec<u8>) -> ClientResult<()> {
        debug!(url = %upload.url, bytes = data.len(), "uploading blob");
        self.http
            .put_bytes(&upload.url, upload.headers.iter(), data)
            .await
    }
}

fn from_json<T: DeserializeOwned>(value: serde_json::Value, what: &str) -> ClientResult<T> {
    serde_json::from_value(value).map_err(|e| ClientError::InvalidResponse {
        message: format!("failed to parse {} response: {}", what, e),
    })
}
