//! Compatibility ledger: which historical reports still apply, and whether
//! a trace is expected to work.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::git::CommitGraph;
use crate::model::CompatibilityReport;

/// Agreement needed before a report may retire a regression test.
pub const QUORUM_THRESHOLD: u32 = 20;

/// Everything the ledger knows about one trace on one GPU.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerVerdict {
    /// Applicable reports, per tracked project.
    pub applicable: BTreeMap<String, Vec<CompatibilityReport>>,
    /// Reports for the trace on this GPU, applicable or not.
    pub trace_reports_count: usize,
    /// Lowest agreement among applicable reports (0 without any).
    pub lowest_agreement_count: u32,
    pub expected_to_work: bool,
}

impl LedgerVerdict {
    pub fn applicable_count(&self) -> usize {
        self.applicable.values().map(Vec::len).sum()
    }
}

/// Read-only index of compatibility reports for one GPU.
#[derive(Debug, Clone, Default)]
pub struct CompatibilityLedger {
    by_trace: HashMap<u64, Vec<CompatibilityReport>>,
}

impl CompatibilityLedger {
    pub fn new(reports: impl IntoIterator<Item = CompatibilityReport>) -> Self {
        let mut by_trace: HashMap<u64, Vec<CompatibilityReport>> = HashMap::new();
        for report in reports {
            by_trace.entry(report.trace_id).or_default().push(report);
        }
        Self { by_trace }
    }

    /// Reports for a trace on a GPU.
    pub fn reports(&self, trace_id: u64, gpu_id: u64) -> impl Iterator<Item = &CompatibilityReport> {
        self.by_trace
            .get(&trace_id)
            .into_iter()
            .flatten()
            .filter(move |r| r.gpu_id == gpu_id)
    }

    /// Reports still relevant to the current head of each tracked project.
    ///
    /// Reports for projects not in `projects` are ignored.
    pub fn applicable_reports(
        &self,
        trace_id: u64,
        gpu_id: u64,
        projects: &[&dyn CommitGraph],
    ) -> BTreeMap<String, Vec<CompatibilityReport>> {
        let mut applicable = BTreeMap::new();

        for project in projects {
            let mut by_commit: BTreeMap<String, Vec<&CompatibilityReport>> = BTreeMap::new();
            for report in self
                .reports(trace_id, gpu_id)
                .filter(|r| r.project == project.name())
            {
                by_commit
                    .entry(report.commit_version.clone())
                    .or_default()
                    .push(report);
            }
            if by_commit.is_empty() {
                continue;
            }

            let candidates: BTreeSet<String> = by_commit.keys().cloned().collect();
            let reports: Vec<CompatibilityReport> = project
                .frontier(&candidates)
                .iter()
                .filter_map(|commit| by_commit.get(commit))
                .flatten()
                .map(|r| (*r).clone())
                .collect();

            if !reports.is_empty() {
                applicable.insert(project.name().to_string(), reports);
            }
        }

        applicable
    }

    /// Whether the trace should currently work on the GPU.
    pub fn expected_to_work(&self, trace_id: u64, gpu_id: u64, projects: &[&dyn CommitGraph]) -> bool {
        self.verdict(trace_id, gpu_id, projects).expected_to_work
    }

    /// Compute the ledger's view of a trace once.
    pub fn verdict(&self, trace_id: u64, gpu_id: u64, projects: &[&dyn CommitGraph]) -> LedgerVerdict {
        let applicable = self.applicable_reports(trace_id, gpu_id, projects);
        let all: Vec<&CompatibilityReport> = applicable.values().flatten().collect();

        let lowest_agreement_count = all.iter().map(|r| r.agreement_count).min().unwrap_or(0);
        let expected_to_work = !all.is_empty()
            && all.iter().all(|r| r.is_working)
            && lowest_agreement_count > QUORUM_THRESHOLD;

        LedgerVerdict {
            trace_reports_count: self.reports(trace_id, gpu_id).count(),
            applicable,
            lowest_agreement_count,
            expected_to_work,
        }
    }
}
