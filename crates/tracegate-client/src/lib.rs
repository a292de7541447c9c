//! REST client for the trace compatibility server.
//!
//! This crate provides:
//!
//! - a retrying HTTP transport (500/502/504 and connection errors are
//!   retried with jittered exponential backoff, 409 counts as success)
//! - session authentication (bearer token, or a password login whose
//!   cookie is reused for the lifetime of the client)
//! - typed wire records for traces, GPUs, compatibility reports, jobs,
//!   executions and blob uploads
//!
//! # Quick Start
//!
//! ```no_run
//! use tracegate_client::TracesClient;
//!
//! # async fn example() -> Result<(), tracegate_client::ClientError> {
//! let client = TracesClient::from_env()?;
//! for trace in client.list_traces().await? {
//!     println!("{} {}", trace.id, trace.filename);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! | Environment Variable | Description |
//! |---------------------|-------------|
//! | `TRACEGATE_URL` | Server base URL (default: `https://linux-perf.steamos.cloud`) |
//! | `TRACEGATE_USERNAME` | Login username |
//! | `TRACEGATE_PASSWORD` | Login password |
//! | `TRACEGATE_TOKEN` | Bearer token, used instead of the login |
//! | `TRACEGATE_TIMEOUT` | Request timeout in seconds (default: 30) |
//! | `TRACEGATE_MAX_RETRIES` | Max retries for transient failures (default: 3) |

pub mod auth;
pub mod client;
pub mod error;
pub mod types;

pub use auth::Credentials;
pub use client::TracesClient;
pub use error::{ClientError, ClientResult};
pub use types::{
    BlobRequest, ClientConfig, CommitRecord, CompatibilityCommit, CompatibilityRecord,
    DedupedFrameRecord, DirectUpload, GpuDriver, GpuRecord, JobRecord, JobTimeline,
    NewCompatibility, NewJob, NewTraceExec, ProjectRecord, TraceExecRecord, TraceFrameRecord,
    TraceFrameStats, TraceRecord,
};
