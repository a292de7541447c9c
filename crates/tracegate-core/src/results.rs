//! Local result folder: one subdirectory per trace execution, plus the
//! machine metadata at the root.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDateTime};
use tracegate_client::GpuDriver;
use tracing::{debug, warn};

use crate::driver::{parse_glxinfo, GfxInfo};
use crate::error::{Result, TraceGateError};
use crate::model::Trace;

const STARTED_MARKER: &str = ".started";
const DONE_MARKER: &str = ".done";
const GFXINFO_FILE: &str = "gfxinfo.json";
const GLXINFO_FILE: &str = "glxinfo";

/// Parse a marker timestamp (`2023-01-25 08:14:09[.753493221]`, UTC).
pub fn parse_marker_timestamp(value: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value.trim(), "%Y-%m-%d %H:%M:%S%.f").ok()
}

/// One local replay run of a trace.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceExecutionAttempt {
    pub trace: Trace,
    pub folder: PathBuf,
    pub started_at: Option<NaiveDateTime>,
    pub finished_at: Option<NaiveDateTime>,
    pub retcode: Option<i32>,
    pub log_path: Option<PathBuf>,
    /// Frame id → captured image.
    pub found_frames: BTreeMap<String, PathBuf>,
    /// Malformed data met while reading the folder.
    pub problems: Vec<String>,
}

impl TraceExecutionAttempt {
    /// Read an execution folder. Only an unreadable folder is an error;
    /// malformed content is recorded in `problems`.
    pub fn load(trace: Trace, folder: impl Into<PathBuf>) -> Result<Self> {
        let folder = folder.into();
        let mut attempt = Self {
            trace,
            folder: folder.clone(),
            started_at: None,
            finished_at: None,
            retcode: None,
            log_path: None,
            found_frames: BTreeMap::new(),
            problems: Vec::new(),
        };

        if let Err(e) = attempt.trace.tracing_tool() {
            attempt.problems.push(e.to_string());
        }

        let mut entries: Vec<PathBuf> = std::fs::read_dir(&folder)
            .map_err(|e| TraceGateError::io(&folder, e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect();
        entries.sort();

        for path in entries {
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
                continue;
            };

            if name == STARTED_MARKER {
                attempt.started_at = attempt.read_marker(&path).and_then(|(ts, _)| ts);
            } else if name == DONE_MARKER {
                if let Some((ts, retcode)) = attempt.read_marker(&path) {
                    attempt.finished_at = ts;
                    attempt.retcode = retcode;
                }
            } else if name.ends_with(".log") {
                attempt.log_path = Some(path);
            } else if name.ends_with(".png") || name.ends_with(".bmp") {
                attempt.add_frame(path);
            }
        }

        for problem in &attempt.problems {
            warn!(trace = %attempt.trace.filename, folder = %attempt.folder.display(), problem = %problem, "malformed execution data");
        }

        Ok(attempt)
    }

    fn read_marker(&mut self, path: &Path) -> Option<(Option<NaiveDateTime>, Option<i32>)> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                self.problems
                    .push(format!("cannot read {}: {}", path.display(), e));
                return None;
            }
        };

        let mut lines = text.lines();
        let timestamp = match lines.next().map(str::trim).filter(|l| !l.is_empty()) {
            Some(line) => {
                let ts = parse_marker_timestamp(line);
                if ts.is_none() {
                    self.problems
                        .push(format!("invalid timestamp '{}' in {}", line, path.display()));
                }
                ts
            }
            None => {
                self.problems
                    .push(format!("missing timestamp in {}", path.display()));
                None
            }
        };

        let retcode = match lines.next().map(str::trim).filter(|l| !l.is_empty()) {
            Some(line) => match line.parse::<i32>() {
                Ok(code) => Some(code),
                Err(_) => {
                    self.problems
                        .push(format!("invalid exit code '{}' in {}", line, path.display()));
                    None
                }
            },
            None => None,
        };

        Some((timestamp, retcode))
    }

    fn add_frame(&mut self, path: PathBuf) {
        let Some(tool) = self.trace.tool else {
            return;
        };
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        match tool.frame_id_from_stem(stem) {
            Ok(frame_id) => {
                self.found_frames.insert(frame_id, path);
            }
            Err(e) => self.problems.push(e.to_string()),
        }
    }

    /// Wall-clock duration of the replay; zero when a marker is missing.
    pub fn runtime(&self) -> Duration {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => end - start,
            _ => Duration::zero(),
        }
    }

    pub fn execution_time_secs(&self) -> f64 {
        self.runtime()
            .num_microseconds()
            .map(|us| us as f64 / 1_000_000.0)
            .unwrap_or(0.0)
    }

    pub fn generated_all_wanted_frames(&self) -> bool {
        let wanted: BTreeSet<&String> = self.trace.frames.iter().map(|f| &f.id).collect();
        let found: BTreeSet<&String> = self.found_frames.keys().collect();
        wanted == found
    }

    /// Exit code 0, every wanted frame captured and nothing malformed.
    pub fn had_successful_execution(&self) -> bool {
        self.retcode == Some(0) && self.generated_all_wanted_frames() && self.problems.is_empty()
    }

    /// Content of the execution log, if any.
    pub fn read_log(&self) -> Option<String> {
        let path = self.log_path.as_ref()?;
        match std::fs::read(path) {
            Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read execution log");
                None
            }
        }
    }

    /// Why the execution failed, for unsuccessful executions.
    pub fn failure_message(&self) -> Option<String> {
        if self.had_successful_execution() {
            return None;
        }

        let mut reasons = Vec::new();
        match self.retcode {
            None => reasons.push("The trace execution failed to complete.".to_string()),
            Some(0) => {}
            Some(code) => reasons.push(format!("The trace execution's exit code was {}.", code)),
        }
        if !self.generated_all_wanted_frames() {
            reasons.push("Some frames are missing.".to_string());
        }
        if !self.problems.is_empty() {
            reasons.push(format!("Malformed execution data: {}.", self.problems.join("; ")));
        }
        Some(format!("ERROR: {}", reasons.join(" ")))
    }
}

/// Machine metadata shared by every execution of a result folder.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineInfo {
    pub gfxinfo: GfxInfo,
    /// OpenGL driver from `glxinfo`.
    pub glxinfo: GpuDriver,
    pub gpu_pciid: String,
    pub gpu_codename: String,
}

/// A result folder, with its machine metadata read.
#[derive(Debug, Clone)]
pub struct ResultFolder {
    path: PathBuf,
    gfxinfo: Option<GfxInfo>,
    glxinfo: Option<GpuDriver>,
}

impl ResultFolder {
    /// Read the machine metadata of a result folder. Missing or broken
    /// metadata is only reported by [`ResultFolder::errors`].
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_dir() {
            return Err(TraceGateError::config(format!(
                "the results folder {} does not exist",
                path.display()
            )));
        }

        let gfxinfo = match GfxInfo::load(&path.join(GFXINFO_FILE)) {
            Ok(info) => Some(info),
            Err(e) => {
                warn!(folder = %path.display(), error = %e, "cannot parse {}", GFXINFO_FILE);
                None
            }
        };

        let glxinfo = match std::fs::read_to_string(path.join(GLXINFO_FILE)) {
            Ok(text) => parse_glxinfo(&text),
            Err(e) => {
                warn!(folder = %path.display(), error = %e, "cannot read {}", GLXINFO_FILE);
                None
            }
        };

        Ok(Self {
            path,
            gfxinfo,
            glxinfo,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reasons why the folder cannot be reported on.
    pub fn errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        match &self.gfxinfo {
            None => errors.push(
                "No valid 'gfxinfo.json' file found or some required fields are missing".to_string(),
            ),
            Some(info) if info.gpu_pciid().is_none() => errors.push(
                "The 'gfxinfo.json' file does not contain the GPU's PCI ID".to_string(),
            ),
            Some(_) => {}
        }
        if self.glxinfo.is_none() {
            errors.push("No valid 'glxinfo' file found or couldn't parse some fields".to_string());
        }
        errors
    }

    /// Validated machine metadata.
    pub fn machine_info(&self) -> Result<MachineInfo> {
        let errors = self.errors();
        match (&self.gfxinfo, &self.glxinfo) {
            (Some(gfxinfo), Some(glxinfo)) if errors.is_empty() => Ok(MachineInfo {
                gpu_pciid: gfxinfo.gpu_pciid().unwrap_or_default().to_string(),
                gpu_codename: gfxinfo.gpu_codename().unwrap_or("unknown").to_string(),
                gfxinfo: gfxinfo.clone(),
                glxinfo: glxinfo.clone(),
            }),
            _ => Err(TraceGateError::InvalidReport { errors }),
        }
    }

    /// Find the execution folders of known traces, in folder-name order.
    ///
    /// A subdirectory belongs to a trace when the part of its name before
    /// the first `-` is the trace id and `{id}-{filename}` starts with it.
    pub fn scan(&self, traces: &[Trace]) -> Result<Vec<TraceExecutionAttempt>> {
        let by_id: HashMap<String, &Trace> = traces.iter().map(|t| (t.id.to_string(), t)).collect();

        let mut dirs: Vec<(String, PathBuf)> = std::fs::read_dir(&self.path)
            .map_err(|e| TraceGateError::io(&self.path, e))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|entry| {
                let name = entry.file_name().to_str()?.to_string();
                Some((name, entry.path()))
            })
            .collect();
        dirs.sort();

        let mut attempts = Vec::new();
        for (name, path) in dirs {
            let id = name.split('-').next().unwrap_or_default();
            match by_id.get(id) {
                Some(trace) if trace.result_name().starts_with(&name) => {
                    attempts.push(TraceExecutionAttempt::load((*trace).clone(), path)?);
                }
                _ => debug!(folder = %name, "ignoring folder without a matching trace"),
            }
        }

        Ok(attempts)
    }
}
