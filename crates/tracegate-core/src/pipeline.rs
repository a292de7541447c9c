//! End-to-end report of one result folder.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracegate_client::{GpuDriver, NewJob};
use tracing::{info, warn};

use crate::acceptability::{evaluate_frames, history_requests, EvaluationContext, FrameHistory};
use crate::config::ReportConfig;
use crate::driver::detect_driver;
use crate::error::{Result, TraceGateError};
use crate::feedback::report_outcome;
use crate::git::{CommitGraph, GitCommitIndex};
use crate::ledger::CompatibilityLedger;
use crate::model::{CompatibilityReport, Trace};
use crate::report::junit::{write_junit, JUNIT_FILE};
use crate::report::{ExecutionReport, ReportAggregator, RunReport};
use crate::results::ResultFolder;
use crate::server::TraceServer;
use crate::upload::{PendingExecution, UploadCoordinator, UploadOutcome, UploadTarget};

/// Result of a report run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub report: RunReport,
    /// Upload outcome of each execution, in report order.
    pub uploads: Vec<UploadOutcome>,
    pub junit_path: PathBuf,
    pub is_post_merge: bool,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.report.is_success()
    }
}

/// Scans a result folder, uploads it, evaluates it and writes the JUnit
/// report.
pub struct ReportPipeline {
    server: Arc<dyn TraceServer>,
    config: ReportConfig,
    projects: Vec<Arc<dyn CommitGraph>>,
}

impl ReportPipeline {
    pub fn new(
        server: Arc<dyn TraceServer>,
        config: ReportConfig,
        projects: Vec<Arc<dyn CommitGraph>>,
    ) -> Self {
        Self {
            server,
            config,
            projects,
        }
    }

    /// Open the repository of every configured project. Fails on the first
    /// repository that cannot be read.
    pub fn open(server: Arc<dyn TraceServer>, config: ReportConfig) -> Result<Self> {
        let projects = config
            .projects
            .iter()
            .map(|p| GitCommitIndex::open(&p.name, &p.path).map(|g| Arc::new(g) as Arc<dyn CommitGraph>))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(server, config, projects))
    }

    pub async fn run(&self) -> Result<RunOutcome> {
        let started = Instant::now();
        let config = &self.config;

        let folder = ResultFolder::open(&config.results_dir)?;
        let machine = folder.machine_info()?;
        let is_post_merge = config.ci.is_post_merge(&config.post_merge);
        let kind = if is_post_merge { "post-merge" } else { "pre-merge" };
        info!(
            run = %config.run_name,
            gpu = %machine.gpu_codename,
            pciid = %machine.gpu_pciid,
            kind,
            "generating report"
        );

        let traces: Vec<Trace> = self
            .server
            .list_traces()
            .await?
            .into_iter()
            .map(Trace::from)
            .collect();
        let attempts = folder.scan(&traces)?;
        info!(executions = attempts.len(), traces = traces.len(), "scanned result folder");

        let gpu = self
            .server
            .gpu_by_pciid(&machine.gpu_pciid)
            .await?
            .ok_or_else(|| {
                TraceGateError::config(format!("the GPU {} is unknown to the server", machine.gpu_pciid))
            })?;

        let ledger = CompatibilityLedger::new(
            self.server
                .list_compatibility_reports(&machine.gpu_pciid)
                .await?
                .into_iter()
                .filter_map(CompatibilityReport::from_record),
        );

        let job = self
            .server
            .job_get_or_create(&NewJob {
                name: config.run_name.clone(),
                is_released_code: is_post_merge,
                commit_version: Some(config.ci.commit_short_sha.clone()),
                timeline: Some(config.ci.job_timeline()),
            })
            .await?;
        info!(job_id = job.id, job = %job.name, "using job");

        let drivers: Vec<GpuDriver> = attempts
            .iter()
            .map(|a| {
                detect_driver(
                    a.read_log().as_deref(),
                    a.trace.graphics_api.as_deref(),
                    &machine.gfxinfo,
                    &machine.glxinfo,
                )
            })
            .collect();

        let target = UploadTarget {
            job_id: job.id,
            gpu_pciid: machine.gpu_pciid.clone(),
            metadata: machine.gfxinfo.all_fields(),
        };
        let pending: Vec<PendingExecution<'_>> = attempts
            .iter()
            .zip(&drivers)
            .map(|(attempt, driver)| PendingExecution { attempt, driver })
            .collect();
        let coordinator = UploadCoordinator::new(self.server.clone(), config.upload_parallelism());
        let uploads = coordinator.upload_all(&target, &pending).await?;

        let projects: Vec<&dyn CommitGraph> = self.projects.iter().map(|p| p.as_ref()).collect();
        let ctx = EvaluationContext {
            server_url: self.server.base_url().trim_end_matches('/').to_string(),
            projects: projects.iter().map(|p| p.name().to_string()).collect(),
        };

        let mut aggregator = ReportAggregator::new(&config.run_name, &machine.gpu_codename);
        for (attempt, upload) in attempts.iter().zip(&uploads) {
            let verdict = ledger.verdict(attempt.trace.id, gpu.id, &projects);
            let record = upload.record();

            if let UploadOutcome::Uploaded(_) = upload {
                if let Err(e) = report_outcome(
                    self.server.as_ref(),
                    attempt.trace.id,
                    gpu.id,
                    attempt.had_successful_execution(),
                    &verdict,
                    &projects,
                )
                .await
                {
                    warn!(trace = %attempt.trace.filename, error = %e, "failed to report compatibility");
                }
            }

            let mut histories = BTreeMap::new();
            for (frame_id, trace_frame_id) in history_requests(&attempt.trace, &attempt.found_frames, record, &verdict) {
                match self
                    .server
                    .trace_frame_stats(trace_frame_id, &machine.gpu_pciid, job.id)
                    .await
                {
                    Ok(stats) => {
                        histories.insert(frame_id, FrameHistory::from_stats(&stats));
                    }
                    Err(e) => warn!(
                        trace = %attempt.trace.filename,
                        frame = %frame_id,
                        error = %e,
                        "failed to fetch frame history"
                    ),
                }
            }

            let frames = evaluate_frames(
                &attempt.trace,
                &attempt.found_frames,
                record,
                &verdict,
                &histories,
                &ctx,
            );
            aggregator.add(ExecutionReport::new(attempt, &verdict, frames));
        }

        let report = aggregator.finish();
        let junit_path = folder.path().join(JUNIT_FILE);
        write_junit(&report, &junit_path)?;

        info!(
            tests = report.tests(),
            failures = report.failures(),
            success = report.is_success(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            path = %junit_path.display(),
            "report written"
        );

        Ok(RunOutcome {
            report,
            uploads,
            junit_path,
            is_post_merge,
        })
    }
}
