//! Run report: per-execution results and the aggregate verdict.

pub mod junit;

use crate::ledger::LedgerVerdict;
use crate::model::FrameVerdict;
use crate::results::TraceExecutionAttempt;

/// Outcome of one trace execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub trace_id: u64,
    pub trace_filename: String,
    pub runtime_secs: f64,
    pub retcode: Option<i32>,
    pub had_successful_execution: bool,
    pub expected_to_work: bool,
    /// Set when the execution was not successful.
    pub failure_message: Option<String>,
    /// Execution log, kept for unsuccessful executions only.
    pub log: Option<String>,
    /// Malformed data met while reading the execution folder.
    pub problems: Vec<String>,
    pub frames: Vec<FrameVerdict>,
}

impl ExecutionReport {
    pub fn new(attempt: &TraceExecutionAttempt, verdict: &LedgerVerdict, frames: Vec<FrameVerdict>) -> Self {
        let had_successful_execution = attempt.had_successful_execution();
        Self {
            trace_id: attempt.trace.id,
            trace_filename: attempt.trace.filename.clone(),
            runtime_secs: attempt.execution_time_secs(),
            retcode: attempt.retcode,
            had_successful_execution,
            expected_to_work: verdict.expected_to_work,
            failure_message: attempt.failure_message(),
            log: if had_successful_execution {
                None
            } else {
                attempt.read_log()
            },
            problems: attempt.problems.clone(),
            frames,
        }
    }

    /// A failed execution only counts when the trace was expected to work.
    pub fn is_success(&self) -> bool {
        self.had_successful_execution || !self.expected_to_work
    }

    pub fn failed_frames(&self) -> impl Iterator<Item = &FrameVerdict> {
        self.frames.iter().filter(|f| !f.is_acceptable())
    }

    /// Failed test cases: the execution itself plus unacceptable frames.
    pub fn failures(&self) -> usize {
        usize::from(!self.is_success()) + self.failed_frames().count()
    }
}

/// Report of a whole run on one GPU.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub run_name: String,
    pub gpu_codename: String,
    pub executions: Vec<ExecutionReport>,
}

impl RunReport {
    pub fn run_id(&self) -> String {
        format!("{}-{}", self.run_name, self.gpu_codename)
    }

    /// One test per execution plus one per expected frame.
    pub fn tests(&self) -> usize {
        self.executions.iter().map(|e| 1 + e.frames.len()).sum()
    }

    pub fn failures(&self) -> usize {
        self.executions.iter().map(ExecutionReport::failures).sum()
    }

    pub fn total_time_secs(&self) -> f64 {
        self.executions.iter().map(|e| e.runtime_secs).sum()
    }

    /// Every execution expected to work succeeded and every frame is
    /// acceptable.
    pub fn is_success(&self) -> bool {
        self.executions
            .iter()
            .all(|e| e.is_success() && e.failed_frames().next().is_none())
    }
}

/// Collects execution reports as they are produced.
#[derive(Debug, Clone)]
pub struct ReportAggregator {
    run_name: String,
    gpu_codename: String,
    executions: Vec<ExecutionReport>,
}

impl ReportAggregator {
    pub fn new(run_name: impl Into<String>, gpu_codename: impl Into<String>) -> Self {
        Self {
            run_name: run_name.into(),
            gpu_codename: gpu_codename.into(),
            executions: Vec::new(),
        }
    }

    pub fn add(&mut self, execution: ExecutionReport) {
        self.executions.push(execution);
    }

    pub fn finish(self) -> RunReport {
        RunReport {
            run_name: self.run_name,
            gpu_codename: self.gpu_codename,
            executions: self.executions,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::FrameStatus;
    use std::path::PathBuf;

    pub(crate) fn frame(id: &str, status: FrameStatus) -> FrameVerdict {
        FrameVerdict {
            frame_id: id.to_string(),
            path: Some(PathBuf::from(format!("/results/1-a/{}.png", id))),
            status,
            reason: format!("frame {} checked", id),
        }
    }

    pub(crate) fn execution(successful: bool, expected: bool, frames: Vec<FrameVerdict>) -> ExecutionReport {
        ExecutionReport {
            trace_id: 1,
            trace_filename: "a.trace".to_string(),
            runtime_secs: 1.5,
            retcode: Some(if successful { 0 } else { 1 }),
            had_successful_execution: successful,
            expected_to_work: expected,
            failure_message: (!successful).then(|| "ERROR: The trace execution's exit code was 1.".to_string()),
            log: (!successful).then(|| "crash\n".to_string()),
            problems: Vec::new(),
            frames,
        }
    }

    fn run(executions: Vec<ExecutionReport>) -> RunReport {
        let mut agg = ReportAggregator::new("job-42", "VANGOGH");
        for e in executions {
            agg.add(e);
        }
        agg.finish()
    }

    #[test]
    fn counts_and_success() {
        let report = run(vec![
            execution(true, true, vec![frame("1", FrameStatus::Acceptable), frame("2", FrameStatus::Acceptable)]),
            execution(false, false, vec![frame("1", FrameStatus::Acceptable)]),
        ]);
        assert_eq!(report.run_id(), "job-42-VANGOGH");
        assert_eq!(report.tests(), 5);
        assert_eq!(report.failures(), 0);
        assert_eq!(report.total_time_secs(), 3.0);
        assert!(report.is_success());
    }

    #[test]
    fn one_unacceptable_frame_flips_success_and_failures_by_one() {
        let good = run(vec![execution(true, true, vec![frame("1", FrameStatus::Acceptable)])]);
        let bad = run(vec![execution(true, true, vec![frame("1", FrameStatus::NeedsReview)])]);

        assert!(good.is_success());
        assert!(!bad.is_success());
        assert_eq!(bad.failures(), good.failures() + 1);
    }

    #[test]
    fn failed_execution_only_counts_when_expected() {
        let expected = run(vec![execution(false, true, vec![])]);
        let unexpected = run(vec![execution(false, false, vec![])]);

        assert!(!expected.is_success());
        assert_eq!(expected.failures(), 1);
        assert!(unexpected.is_success());
        assert_eq!(unexpected.failures(), 0);
    }
}
