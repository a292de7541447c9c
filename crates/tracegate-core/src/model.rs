//! Domain model: traces, compatibility reports and frame verdicts.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracegate_client::{CompatibilityRecord, DedupedFrameRecord, TraceRecord};
use tracing::warn;

use crate::error::{Result, TraceGateError};

/// Replay tool a trace was recorded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TracingTool {
    Apitrace,
    Gfxrecon,
}

impl FromStr for TracingTool {
    type Err = TraceGateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "apitrace" => Ok(Self::Apitrace),
            "gfxrecon" => Ok(Self::Gfxrecon),
            other => Err(TraceGateError::UnknownTool {
                name: Some(other.to_string()),
            }),
        }
    }
}

impl fmt::Display for TracingTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Apitrace => write!(f, "apitrace"),
            Self::Gfxrecon => write!(f, "gfxrecon"),
        }
    }
}

impl TracingTool {
    /// Frame id encoded in a captured image's file stem.
    ///
    /// apitrace names snapshots by frame number (`0000000010`), gfxrecon
    /// appends it after the last underscore (`screenshot_frame_10`).
    pub fn frame_id_from_stem(&self, stem: &str) -> Result<String> {
        let digits = match self {
            Self::Apitrace => stem,
            Self::Gfxrecon => stem.rsplit('_').next().unwrap_or(stem),
        };
        digits
            .parse::<u64>()
            .map(|id| id.to_string())
            .map_err(|_| TraceGateError::InvalidFrameName {
                stem: stem.to_string(),
                tool: *self,
            })
    }

    /// Command line replaying `trace_path` and capturing `frame_ids` into `prefix`.
    pub fn replay_command(
        &self,
        graphics_api: Option<&str>,
        frame_ids: &[String],
        prefix: &str,
        trace_path: &str,
    ) -> Vec<String> {
        let ids = frame_ids.join(",");
        match self {
            Self::Apitrace => {
                let cmd = if graphics_api == Some("OpenGL") {
                    "apitrace"
                } else {
                    "apitrace.exe"
                };
                vec![
                    cmd.to_string(),
                    "replay".to_string(),
                    "--headless".to_string(),
                    format!("--snapshot={}", ids),
                    format!("--snapshot-prefix={}", prefix),
                    trace_path.to_string(),
                ]
            }
            Self::Gfxrecon => vec![
                "gfxrecon-replay".to_string(),
                "--screenshot-prefix".to_string(),
                prefix.to_string(),
                "--screenshots".to_string(),
                ids,
                "-m".to_string(),
                "rebind".to_string(),
                trace_path.to_string(),
            ],
        }
    }
}

/// A frame the trace is expected to produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameToCapture {
    pub id: String,
    /// Server-side trace frame id, when the server provides it.
    pub trace_frame_id: Option<u64>,
}

/// A replayable trace.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    pub id: u64,
    pub filename: String,
    pub graphics_api: Option<String>,
    /// `None` when the tool is missing or unsupported.
    pub tool: Option<TracingTool>,
    /// Tool name as sent by the server.
    pub tool_name: Option<String>,
    pub frames: Vec<FrameToCapture>,
    pub machine_tags: Vec<String>,
    pub obsolete: bool,
}

impl From<TraceRecord> for Trace {
    fn from(record: TraceRecord) -> Self {
        let tool = record
            .tracing_tool
            .as_deref()
            .and_then(|name| name.parse().ok());

        let machine_tags = record
            .metadata
            .get("machine_tags")
            .and_then(|v| v.as_array())
            .map(|tags| {
                tags.iter()
                    .filter_map(|t| t.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            id: record.id,
            filename: record.filename,
            graphics_api: record.graphics_api,
            tool,
            tool_name: record.tracing_tool,
            frames: frames_to_capture(&record.frames_to_capture),
            machine_tags,
            obsolete: record.obsolete,
        }
    }
}

fn frame_key(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn frames_to_capture(value: &serde_json::Value) -> Vec<FrameToCapture> {
    match value {
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(frame_key)
            .map(|id| FrameToCapture {
                id,
                trace_frame_id: None,
            })
            .collect(),
        serde_json::Value::Object(map) => {
            let mut frames: Vec<FrameToCapture> = map
                .iter()
                .map(|(id, info)| FrameToCapture {
                    id: id.clone(),
                    trace_frame_id: info
                        .as_u64()
                        .or_else(|| info.get("id").and_then(|v| v.as_u64())),
                })
                .collect();
            frames.sort_by_key(|f| (f.id.parse::<u64>().unwrap_or(u64::MAX), f.id.clone()));
            frames
        }
        _ => Vec::new(),
    }
}

impl Trace {
    /// Expected frame ids, in capture order.
    pub fn frame_ids(&self) -> Vec<String> {
        self.frames.iter().map(|f| f.id.clone()).collect()
    }

    /// Name of the result folder of this trace (`{id}-{filename}`).
    pub fn result_name(&self) -> String {
        format!("{}-{}", self.id, self.filename)
    }

    /// Every wanted tag must match the start of at least one machine tag.
    pub fn matches_tags(&self, wanted: &[Regex]) -> bool {
        wanted.iter().all(|re| {
            self.machine_tags
                .iter()
                .any(|tag| re.find(tag).is_some_and(|m| m.start() == 0))
        })
    }

    /// The replay tool, or why there is none.
    pub fn tracing_tool(&self) -> Result<TracingTool> {
        self.tool.ok_or_else(|| TraceGateError::UnknownTool {
            name: self.tool_name.clone(),
        })
    }

    /// Replay command line for this trace.
    pub fn replay_command(&self, prefix: &str, trace_path: &str) -> Result<Vec<String>> {
        let tool = self.tracing_tool()?;
        Ok(tool.replay_command(
            self.graphics_api.as_deref(),
            &self.frame_ids(),
            prefix,
            trace_path,
        ))
    }
}

/// A compatibility report for a (trace, GPU, project commit).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompatibilityReport {
    pub id: u64,
    pub trace_id: u64,
    pub gpu_id: u64,
    pub project: String,
    pub commit_id: u64,
    pub commit_version: String,
    pub is_working: bool,
    /// Always at least 1.
    pub agreement_count: u32,
    pub bug_id: Option<u64>,
}

impl CompatibilityReport {
    /// Convert a server record. Records without a commit, or claiming no
    /// agreement at all, are rejected.
    pub fn from_record(record: CompatibilityRecord) -> Option<Self> {
        let commit = record.commit?;
        let agreement_count = match record.agreement_count {
            None => 1,
            Some(0) => {
                warn!(report_id = record.id, "ignoring compatibility report with no agreement");
                return None;
            }
            Some(n) => n,
        };

        Some(Self {
            id: record.id,
            trace_id: record.trace_id,
            gpu_id: record.gpu_id,
            project: commit.project.name,
            commit_id: commit.id,
            commit_version: commit.version,
            is_working: record.is_working,
            agreement_count,
            bug_id: record.bug_id,
        })
    }
}

/// A deduplicated frame output with its history on one GPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupedFrameOutput {
    pub id: u64,
    pub is_acceptable: Option<bool>,
    pub found_in_release_code_run: bool,
    /// Times this output was seen on the GPU.
    pub outputs_count: u32,
}

impl From<&DedupedFrameRecord> for DedupedFrameOutput {
    fn from(record: &DedupedFrameRecord) -> Self {
        Self {
            id: record.id,
            is_acceptable: record.is_acceptable,
            found_in_release_code_run: record.found_in_release_code_run,
            outputs_count: record.outputs_count_for_gpu(),
        }
    }
}

/// Outcome of one expected frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameStatus {
    Acceptable,
    Unacceptable,
    /// A new output with a stable history; someone needs to look at it.
    NeedsReview,
}

impl FrameStatus {
    pub fn is_acceptable(self) -> bool {
        matches!(self, Self::Acceptable)
    }
}

/// Verdict for one expected frame of an execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameVerdict {
    pub frame_id: String,
    pub path: Option<PathBuf>,
    pub status: FrameStatus,
    pub reason: String,
}

impl FrameVerdict {
    pub fn is_acceptable(&self) -> bool {
        self.status.is_acceptable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(tool: &str, frames: serde_json::Value) -> TraceRecord {
        TraceRecord {
            id: 12,
            filename: "portal2.trace".into(),
            metadata: json!({"machine_tags": ["amdgpu:codename:VANGOGH", "amdgpu:pciid:0x1002:0x163f"]}),
            frames_to_capture: frames,
            graphics_api: Some("OpenGL".into()),
            tracing_tool: Some(tool.into()),
            ..Default::default()
        }
    }

    #[test]
    fn frame_ids_per_tool() {
        assert_eq!(
            TracingTool::Apitrace.frame_id_from_stem("0000000010").unwrap(),
            "10"
        );
        assert_eq!(
            TracingTool::Gfxrecon
                .frame_id_from_stem("screenshot_frame_250")
                .unwrap(),
            "250"
        );
        assert!(matches!(
            TracingTool::Apitrace.frame_id_from_stem("frame_10"),
            Err(TraceGateError::InvalidFrameName { tool: TracingTool::Apitrace, .. })
        ));
    }

    #[test]
    fn unknown_tool_is_kept_as_error() {
        let trace = Trace::from(record("renderdoc", json!([1])));
        assert_eq!(trace.tool, None);
        assert_eq!(trace.tool_name.as_deref(), Some("renderdoc"));
        assert!(matches!(
            trace.replay_command("$D/", "t.trace"),
            Err(TraceGateError::UnknownTool { name: Some(ref n) }) if n == "renderdoc"
        ));
    }

    #[test]
    fn frames_from_map_are_numerically_ordered() {
        let trace = Trace::from(record(
            "apitrace",
            json!({"100": {"id": 7}, "9": 3, "20": null}),
        ));
        assert_eq!(trace.frame_ids(), vec!["9", "20", "100"]);
        assert_eq!(trace.frames[0].trace_frame_id, Some(3));
        assert_eq!(trace.frames[1].trace_frame_id, None);
        assert_eq!(trace.frames[2].trace_frame_id, Some(7));
    }

    #[test]
    fn tag_matching_requires_every_wanted_tag() {
        let trace = Trace::from(record("apitrace", json!([1])));
        let vangogh = Regex::new("amdgpu:codename:VANGOGH").unwrap();
        let any_pciid = Regex::new(r"amdgpu:pciid:0x1002:.*").unwrap();
        let navi = Regex::new("amdgpu:codename:NAVI21").unwrap();
        let suffix_only = Regex::new("codename:VANGOGH").unwrap();

        assert!(trace.matches_tags(&[vangogh.clone(), any_pciid]));
        assert!(!trace.matches_tags(&[vangogh, navi]));
        assert!(!trace.matches_tags(&[suffix_only]));
        assert!(trace.matches_tags(&[]));
    }

    #[test]
    fn replay_commands() {
        let gl = Trace::from(record("apitrace", json!([10, 20])));
        assert_eq!(
            gl.replay_command("$D/", "/traces/12-portal2.trace").unwrap(),
            vec![
                "apitrace",
                "replay",
                "--headless",
                "--snapshot=10,20",
                "--snapshot-prefix=$D/",
                "/traces/12-portal2.trace"
            ]
        );

        let mut dx = record("apitrace", json!([5]));
        dx.graphics_api = Some("D3D11".into());
        assert_eq!(
            Trace::from(dx).replay_command("p", "f").unwrap()[0],
            "apitrace.exe"
        );

        let vk = Trace::from(record("gfxrecon", json!([3])));
        assert_eq!(
            vk.replay_command("p/", "f.gfxr").unwrap(),
            vec![
                "gfxrecon-replay",
                "--screenshot-prefix",
                "p/",
                "--screenshots",
                "3",
                "-m",
                "rebind",
                "f.gfxr"
            ]
        );
    }

    #[test]
    fn compatibility_agreement_defaults_and_rejects_zero() {
        let raw = |count: serde_json::Value| -> CompatibilityRecord {
            serde_json::from_value(json!({
                "id": 1, "trace_id": 12, "gpu_id": 2, "is_working": true,
                "agreement_count": count,
                "commit": {"id": 4, "version": "abc", "project": {"id": 1, "name": "mesa"}}
            }))
            .unwrap()
        };

        let report = CompatibilityReport::from_record(raw(json!(null))).unwrap();
        assert_eq!(report.agreement_count, 1);
        assert_eq!(report.project, "mesa");
        assert!(CompatibilityReport::from_record(raw(json!(0))).is_none());
        assert_eq!(
            CompatibilityReport::from_record(raw(json!(25)))
                .unwrap()
                .agreement_count,
            25
        );
    }
}
