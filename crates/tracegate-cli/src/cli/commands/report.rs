use std::sync::Arc;

use tracegate_client::{ClientConfig, TracesClient};
use tracegate_core::{CiContext, ProjectSpec, ReportConfig, ReportPipeline, TraceGateError, TraceServer};
use tracing::info;

use super::super::args::ReportArgs;
use crate::exit_codes::{SUCCESS, TEST_FAILURE};

pub async fn run(args: ReportArgs) -> anyhow::Result<i32> {
    match report(&args).await {
        Ok(code) => Ok(code),
        Err(e @ TraceGateError::InvalidReport { .. }) => {
            eprintln!("{}", fatal_report_message(&e));
            Ok(e.exit_code())
        }
        Err(e) => {
            eprintln!("error: {}", e);
            Ok(e.exit_code())
        }
    }
}

async fn report(args: &ReportArgs) -> tracegate_core::Result<i32> {
    let config = build_config(args, CiContext::from_env()?)?;

    let mut client_config = ClientConfig::from_env();
    if let Some(url) = &args.url {
        client_config = client_config.with_url(url);
    }
    let server: Arc<dyn TraceServer> = Arc::new(TracesClient::new(client_config)?);

    let outcome = ReportPipeline::open(server, config)?.run().await?;
    let report = &outcome.report;
    let kind = if outcome.is_post_merge { "post-merge" } else { "pre-merge" };

    info!(
        kind,
        tests = report.tests(),
        failures = report.failures(),
        junit = %outcome.junit_path.display(),
        "report complete"
    );

    Ok(if outcome.is_success() { SUCCESS } else { TEST_FAILURE })
}

fn build_config(args: &ReportArgs, ci: CiContext) -> tracegate_core::Result<ReportConfig> {
    let mut config = ReportConfig::new(&args.run_name, &args.results, ci).with_parallelism(args.parallel);

    if let Some(path) = &args.mesa {
        config = config.with_project(ProjectSpec::new("Mesa", path));
    }
    if let Some(path) = &args.dxvk {
        config = config.with_project(ProjectSpec::new("DXVK", path));
    }
    for project in &args.projects {
        config = config.with_project(ProjectSpec::parse(project)?);
    }

    Ok(config)
}

fn fatal_report_message(err: &TraceGateError) -> String {
    let mut msg = String::from("\nFATAL ERROR: The report is invalid due to the following errors:\n");
    if let TraceGateError::InvalidReport { errors } = err {
        for error in errors {
            msg.push_str(&format!(" - {}\n", error));
        }
    }
    msg.push_str("Aborting...");
    msg
}
