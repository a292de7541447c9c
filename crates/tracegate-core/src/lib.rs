//! Trace regression reporting.
//!
//! Given a folder of trace replays produced on one GPU, this crate:
//!
//! - decides which historical compatibility reports still apply, by
//!   walking the history of each tracked project ([`git`], [`ledger`])
//! - judges every expected frame, tolerating unstable and previously
//!   unseen output ([`acceptability`])
//! - uploads frames and logs once each and registers the executions
//!   ([`upload`]), then reports the outcomes back ([`feedback`])
//! - writes a JUnit report and computes the run's verdict ([`report`])
//!
//! [`pipeline::ReportPipeline`] ties these together.
//!
//! # Result folder layout
//!
//! ```text
//! results/
//! ├── gfxinfo.json          machine tags, Vulkan driver, memory sizes
//! ├── glxinfo               output of `glxinfo`
//! └── 12-portal2.trace/     one folder per execution: `{trace id}-{filename}`
//!     ├── .started          start timestamp
//!     ├── .done             end timestamp, then the exit code
//!     ├── replay.log
//!     └── 0000000010.png    captured frames
//! ```

pub mod acceptability;
pub mod config;
pub mod driver;
pub mod error;
pub mod feedback;
pub mod git;
pub mod ledger;
pub mod model;
pub mod pipeline;
pub mod report;
pub mod results;
pub mod server;
pub mod upload;

pub use config::{CiContext, PostMergePolicy, ProjectSpec, ReportConfig};
pub use error::{Result, TraceGateError};
pub use git::{CommitGraph, GitCommitIndex};
pub use ledger::{CompatibilityLedger, LedgerVerdict, QUORUM_THRESHOLD};
pub use model::{CompatibilityReport, FrameStatus, FrameVerdict, Trace, TracingTool};
pub use pipeline::{ReportPipeline, RunOutcome};
pub use server::TraceServer;
pub use upload::{UploadCoordinator, UploadOutcome};
