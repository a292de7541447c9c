//! API request/response types for the traces server.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A tracked source project as known by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub project_url: Option<String>,
    #[serde(default)]
    pub base_url_for_commits: Option<String>,
}

/// A commit of a tracked project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub id: u64,
    pub project_id: u64,
    pub version: String,
}

/// A GPU model, identified by its PCI id (`0x1002:0x163f`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuRecord {
    pub id: u64,
    pub pciid: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Raw trace record from `GET /api/v1/traces`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub id: u64,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub obsolete: bool,
    /// Either a list of frame ids or a map keyed by frame id.
    #[serde(default)]
    pub frames_to_capture: serde_json::Value,
    #[serde(default)]
    pub graphics_api: Option<String>,
    #[serde(default)]
    pub tracing_tool: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub file_size: u64,
}

/// Commit embedded in a compatibility record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityCommit {
    pub id: u64,
    pub version: String,
    pub project: ProjectRecord,
}

/// Compatibility report from `GET /api/v1/trace_compatibilities`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityRecord {
    pub id: u64,
    pub trace_id: u64,
    pub gpu_id: u64,
    #[serde(default)]
    pub bug_id: Option<u64>,
    #[serde(default)]
    pub is_working: bool,
    #[serde(default)]
    pub agreement_count: Option<u32>,
    #[serde(default)]
    pub commit: Option<CompatibilityCommit>,
}

/// Body of `POST /api/v1/trace_compatibilities`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCompatibility {
    pub commit_id: u64,
    pub trace_id: u64,
    pub gpu_id: u64,
    pub bug_id: Option<u64>,
    pub is_working: bool,
}

/// Where a job's commits live, so the server can link to them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTimeline {
    pub project: String,
    pub branch: String,
    pub project_url: String,
    pub base_url_for_commits: String,
    pub url_pattern_for_filing_issue: String,
    pub url_for_comparing_commits: String,
}

/// Parameters for `POST /api/v1/jobs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub name: String,
    pub is_released_code: bool,
    /// Commit of the project under test, appended to the timeline's commit URL.
    pub commit_version: Option<String>,
    pub timeline: Option<JobTimeline>,
}

/// A CI job on the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub is_released_code: Option<bool>,
}

/// Driver signature of a trace execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GpuDriver {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
}

impl GpuDriver {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            version: Some(version.into()),
            branch: None,
            commit: None,
        }
    }

    pub fn with_branch(mut self, branch: Option<String>) -> Self {
        self.branch = branch;
        self
    }

    pub fn with_commit(mut self, commit: Option<String>) -> Self {
        self.commit = commit;
        self
    }

    /// Merge two partial signatures of the same driver.
    ///
    /// Equal fields are kept, a missing or empty field is filled from the
    /// other side, and conflicting values keep `self`'s value.
    pub fn merge(&self, other: &GpuDriver) -> GpuDriver {
        GpuDriver {
            name: merge_field("name", &self.name, &other.name),
            version: merge_field("version", &self.version, &other.version),
            branch: merge_field("branch", &self.branch, &other.branch),
            commit: merge_field("commit", &self.commit, &other.commit),
        }
    }
}

fn merge_field(field: &str, a: &Option<String>, b: &Option<String>) -> Option<String> {
    match (a, b) {
        (Some(a), Some(b)) if a == b => Some(a.clone()),
        (None, b) => b.clone(),
        (a, None) => a.clone(),
        (Some(a), Some(b)) if b.is_empty() => Some(a.clone()),
        (Some(a), Some(b)) if a.is_empty() => Some(b.clone()),
        (Some(a), Some(b)) => {
            tracing::warn!(field, left = %a, right = %b, "conflicting driver field, keeping left");
            Some(a.clone())
        }
    }
}

/// Reference to the trace of an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRef {
    pub id: u64,
}

/// Deduplicated output as embedded in an execution's frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupedFrameRef {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub is_acceptable: Option<bool>,
    #[serde(default)]
    pub blob_id: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameOutputRecord {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub deduped_frame_output: Option<DedupedFrameRef>,
}

/// One captured frame of a registered execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceFrameRecord {
    /// Server id of the trace frame (used for history lookups).
    pub id: u64,
    #[serde(default)]
    pub frame_outputs: Option<FrameOutputRecord>,
}

impl TraceFrameRecord {
    pub fn deduped_frame_output_id(&self) -> Option<u64> {
        self.frame_outputs
            .as_ref()
            .and_then(|o| o.deduped_frame_output.as_ref())
            .and_then(|d| d.id)
    }

    pub fn is_acceptable(&self) -> Option<bool> {
        self.frame_outputs
            .as_ref()
            .and_then(|o| o.deduped_frame_output.as_ref())
            .and_then(|d| d.is_acceptable)
    }
}

/// A registered trace execution (the server's upload report).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceExecRecord {
    pub id: u64,
    pub trace: TraceRef,
    /// The server omits the field entirely when no frame was uploaded.
    #[serde(default)]
    pub trace_frames: BTreeMap<String, TraceFrameRecord>,
    #[serde(default)]
    pub execution_time: f64,
    #[serde(default)]
    pub status: serde_json::Value,
    #[serde(default)]
    pub driver: Option<GpuDriver>,
}

/// Parameters for `POST /api/v1/trace_execs`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTraceExec {
    pub job_id: u64,
    pub trace_id: u64,
    pub metadata: serde_json::Value,
    pub status: Option<i32>,
    pub exec_log: Option<String>,
    pub execution_time: f64,
    /// Frame id → signed blob id.
    pub frame_blobs: BTreeMap<String, String>,
    pub gpu_pciid: String,
    pub driver: Option<GpuDriver>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuOutputCount {
    #[serde(default)]
    pub frame_outputs_count: u32,
}

/// A deduplicated frame output with its statistics on one GPU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupedFrameRecord {
    pub id: u64,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub is_acceptable: Option<bool>,
    #[serde(default)]
    pub found_in_release_code_run: bool,
    #[serde(default)]
    pub gpus: Vec<GpuOutputCount>,
}

impl DedupedFrameRecord {
    /// How many times this output was seen on the queried GPU.
    pub fn outputs_count_for_gpu(&self) -> u32 {
        self.gpus.first().map(|g| g.frame_outputs_count).unwrap_or(0)
    }
}

/// Statistics of one trace frame on a GPU.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceFrameStats {
    #[serde(default)]
    pub deduped_frames: Vec<DedupedFrameRecord>,
}

/// Upload intent for `POST /rails/active_storage/direct_uploads`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRequest {
    pub filename: String,
    pub byte_size: u64,
    /// Base64 MD5 of the file bytes.
    pub checksum: String,
    /// Base64 MD5 of the decoded pixels, for frames.
    pub image_checksum: Option<String>,
}

/// Where and how to PUT a blob, and the id to reference it with afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectUpload {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub signed_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DirectUploadTarget {
    pub url: Option<String>,
    pub headers: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DirectUploadResponse {
    #[serde(default)]
    pub direct_upload: Option<DirectUploadTarget>,
    #[serde(default)]
    pub signed_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ImageChecksumResponse {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub signed_id: Option<String>,
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the traces server.
    #[serde(default = "default_server_url")]
    pub url: String,

    /// Username for password login.
    #[serde(default)]
    pub username: Option<String>,

    /// Password for password login.
    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Bearer token, used instead of a password login when set.
    #[serde(default, skip_serializing)]
    pub token: Option<String>,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Maximum retries for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff between retries, doubled on every attempt.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_server_url() -> String {
    "https://linux-perf.steamos.cloud".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    300
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: default_server_url(),
            username: None,
            password: None,
            token: None,
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl ClientConfig {
    /// Create config from environment variables.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `TRACEGATE_URL` | Server base URL |
    /// | `TRACEGATE_USERNAME` | Login username |
    /// | `TRACEGATE_PASSWORD` | Login password |
    /// | `TRACEGATE_TOKEN` | Bearer token (skips the login) |
    /// | `TRACEGATE_TIMEOUT` | Request timeout in seconds |
    /// | `TRACEGATE_MAX_RETRIES` | Retries for transient failures |
    pub fn from_env() -> Self {
        let non_empty = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            url: non_empty("TRACEGATE_URL").unwrap_or_else(default_server_url),
            username: non_empty("TRACEGATE_USERNAME"),
            password: non_empty("TRACEGATE_PASSWORD"),
            token: non_empty("TRACEGATE_TOKEN"),
            timeout_secs: non_empty("TRACEGATE_TIMEOUT")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_timeout),
            max_retries: non_empty("TRACEGATE_MAX_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_retries),
            backoff_ms: default_backoff_ms(),
        }
    }

    /// Set the base URL.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Set a bearer token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Set the login credentials.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.backoff_ms = backoff_ms;
        self
    }
}
