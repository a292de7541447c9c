//! Compatibility feedback: report each execution's outcome back to the
//! ledger server.

use tracegate_client::NewCompatibility;
use tracing::{debug, warn};

use crate::error::Result;
use crate::git::CommitGraph;
use crate::ledger::LedgerVerdict;
use crate::server::TraceServer;

/// What was filed for one tracked project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feedback {
    /// The outcome agreed with the applicable reports; each was re-reported.
    Reinforced { project: String, reports: usize },
    /// A new report was filed at the project's head.
    Filed { project: String, commit: String },
}

/// Report the outcome of an execution of `trace_id` on `gpu_id` for every
/// tracked project.
///
/// When a project has applicable reports and the outcome matches the
/// expectation, those reports are reinforced. Otherwise a report is filed
/// against the project's current head.
pub async fn report_outcome(
    server: &dyn TraceServer,
    trace_id: u64,
    gpu_id: u64,
    success: bool,
    verdict: &LedgerVerdict,
    projects: &[&dyn CommitGraph],
) -> Result<Vec<Feedback>> {
    let mut feedback = Vec::with_capacity(projects.len());

    for project in projects {
        let applicable = verdict
            .applicable
            .get(project.name())
            .filter(|reports| !reports.is_empty());

        match applicable {
            Some(reports) if verdict.expected_to_work == success => {
                for report in reports {
                    debug!(project = %project.name(), commit = %report.commit_version, "reinforcing compatibility report");
                    server
                        .report_compatibility(&NewCompatibility {
                            commit_id: report.commit_id,
                            trace_id,
                            gpu_id,
                            bug_id: None,
                            is_working: success,
                        })
                        .await?;
                }
                feedback.push(Feedback::Reinforced {
                    project: project.name().to_string(),
                    reports: reports.len(),
                });
            }
            _ => {
                let record = server.project_get_or_create(project.name()).await?;
                let commit = server.commit_get_or_create(&record, project.head()).await?;
                let acknowledged = server
                    .report_compatibility(&NewCompatibility {
                        commit_id: commit.id,
                        trace_id,
                        gpu_id,
                        bug_id: None,
                        is_working: success,
                    })
                    .await?;
                if !acknowledged {
                    warn!(project = %project.name(), commit = %project.head(), "compatibility report not acknowledged");
                }
                feedback.push(Feedback::Filed {
                    project: project.name().to_string(),
                    commit: project.head().to_string(),
                });
            }
        }
    }

    Ok(feedback)
}
