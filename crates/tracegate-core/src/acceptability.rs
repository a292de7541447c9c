//! Per-frame acceptability.
//!
//! Evaluation is pure: the remote upload record, the ledger verdict and the
//! prior-output histories are fetched beforehand and passed in.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;

use tracegate_client::{TraceExecRecord, TraceFrameStats};

use crate::ledger::{LedgerVerdict, QUORUM_THRESHOLD};
use crate::model::{DedupedFrameOutput, FrameStatus, FrameVerdict, Trace};

/// Sightings needed before a released output counts as stable.
pub const STABLE_SAMPLE_SIZE: u32 = 20;

/// Prior outputs of one trace frame on one GPU.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameHistory {
    pub outputs: Vec<DedupedFrameOutput>,
}

impl FrameHistory {
    pub fn from_stats(stats: &TraceFrameStats) -> Self {
        Self {
            outputs: stats.deduped_frames.iter().map(DedupedFrameOutput::from).collect(),
        }
    }

    /// Released outputs seen too rarely to be trusted.
    pub fn unstable_outputs(&self) -> Vec<&DedupedFrameOutput> {
        self.outputs
            .iter()
            .filter(|o| o.found_in_release_code_run && o.outputs_count < STABLE_SAMPLE_SIZE)
            .collect()
    }

    pub fn is_stable(&self) -> bool {
        self.unstable_outputs().is_empty()
    }
}

/// Context used to phrase verdict reasons.
#[derive(Debug, Clone, Default)]
pub struct EvaluationContext {
    /// Server base URL, for links to deduped outputs.
    pub server_url: String,
    /// Names of the tracked projects supplied to the run.
    pub projects: Vec<String>,
}

/// Server-side trace frame ids of the frames whose history matters:
/// frames that went missing while the trace was not expected to work.
pub fn history_requests(
    trace: &Trace,
    found: &BTreeMap<String, PathBuf>,
    upload: Option<&TraceExecRecord>,
    ledger: &LedgerVerdict,
) -> Vec<(String, u64)> {
    if ledger.expected_to_work {
        return Vec::new();
    }

    trace
        .frames
        .iter()
        .filter(|f| !found.contains_key(&f.id))
        .filter_map(|f| {
            let from_upload = upload
                .and_then(|u| u.trace_frames.get(&f.id))
                .map(|tf| tf.id);
            f.trace_frame_id
                .or(from_upload)
                .map(|id| (f.id.clone(), id))
        })
        .collect()
}

/// Evaluate every expected frame of an execution, in the trace's frame order.
pub fn evaluate_frames(
    trace: &Trace,
    found: &BTreeMap<String, PathBuf>,
    upload: Option<&TraceExecRecord>,
    ledger: &LedgerVerdict,
    histories: &BTreeMap<String, FrameHistory>,
    ctx: &EvaluationContext,
) -> Vec<FrameVerdict> {
    let empty = FrameHistory::default();

    trace
        .frames
        .iter()
        .map(|frame| {
            let path = found.get(&frame.id).cloned();
            let history = histories.get(&frame.id).unwrap_or(&empty);
            let (status, reason) = match (&path, upload) {
                (Some(_), Some(upload)) => found_frame(upload, &frame.id),
                (Some(_), None) => (
                    FrameStatus::Unacceptable,
                    "The frame did not get uploaded and thus cannot be checked for \
                     acceptability: upload missing, cannot assume acceptable"
                        .to_string(),
                ),
                (None, _) => missing_frame(&frame.id, ledger, history, ctx),
            };

            FrameVerdict {
                frame_id: frame.id.clone(),
                path,
                status,
                reason,
            }
        })
        .collect()
}

fn found_frame(upload: &TraceExecRecord, frame_id: &str) -> (FrameStatus, String) {
    match upload.trace_frames.get(frame_id) {
        None => (
            FrameStatus::Unacceptable,
            "The frame is missing from the upload record: assume the frame is unacceptable"
                .to_string(),
        ),
        Some(frame) => match frame.is_acceptable() {
            Some(true) => (
                FrameStatus::Acceptable,
                "The frame has been marked acceptable".to_string(),
            ),
            Some(false) => (
                FrameStatus::Unacceptable,
                "The frame has been marked unacceptable".to_string(),
            ),
            None => (
                FrameStatus::Unacceptable,
                format!(
                    "The acceptability of the frame could not be verified server-side \
                     (deduped frame output {:?})",
                    frame.deduped_frame_output_id()
                ),
            ),
        },
    }
}

fn missing_frame(
    frame_id: &str,
    ledger: &LedgerVerdict,
    history: &FrameHistory,
    ctx: &EvaluationContext,
) -> (FrameStatus, String) {
    if ledger.expected_to_work {
        return (
            FrameStatus::Unacceptable,
            format!(
                "The frame ID {} is missing, with the trace expected to work",
                frame_id
            ),
        );
    }

    let unstable = history.unstable_outputs();
    if !unstable.is_empty() {
        let mut reason = format!(
            "The frame ID {} is missing, but the output of the trace on this GPU is \
             unstable: Ignore!\n\nList of frames that made the output considered unstable:\n",
            frame_id
        );
        for output in unstable {
            let _ = writeln!(
                reason,
                " - {}/deduped_frame_outputs/{}: Seen {} on this GPU",
                ctx.server_url, output.id, output.outputs_count
            );
        }
        return (FrameStatus::Acceptable, reason);
    }

    let projects = if ctx.projects.is_empty() {
        "None".to_string()
    } else {
        ctx.projects.join(", ")
    };
    (
        FrameStatus::NeedsReview,
        format!(
            "The frame ID {} is missing while the output of the trace on this GPU is \
             stable: You need to review it!\n\nDebug information:\n\
             \x20   - List of provided repos: {}\n\
             \x20   - # of compatibility reports for this trace on this GPU: {}\n\
             \x20   - # of applicable reports: {}\n\
             \x20   - Lowest compatibility agreement count (needs more than {}): {}\n",
            frame_id,
            projects,
            ledger.trace_reports_count,
            ledger.applicable_count(),
            QUORUM_THRESHOLD,
            ledger.lowest_agreement_count
        ),
    )
}
