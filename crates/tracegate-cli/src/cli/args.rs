use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "tracegate",
    version,
    about = "Report graphics trace replays to the traces server and gate CI on rendering regressions"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Upload a result folder, evaluate it and write junit.xml into it
    Report(ReportArgs),
    Version,
}

#[derive(Args, Clone, Debug)]
pub struct ReportArgs {
    /// Job name on the traces server
    #[arg(short = 'r', long)]
    pub run_name: String,

    /// Traces server URL (overrides TRACEGATE_URL)
    #[arg(short = 's', long, env = "TRACEGATE_URL")]
    pub url: Option<String>,

    /// Tracked project and its local repository, as NAME=PATH (repeatable)
    #[arg(long = "project", value_name = "NAME=PATH")]
    pub projects: Vec<String>,

    /// Path to the Mesa repository (same as --project Mesa=PATH)
    #[arg(long)]
    pub mesa: Option<PathBuf>,

    /// Path to the DXVK repository (same as --project DXVK=PATH)
    #[arg(long)]
    pub dxvk: Option<PathBuf>,

    /// Concurrent upload workers (default: available CPUs)
    #[arg(long)]
    pub parallel: Option<usize>,

    /// Folder containing the results to report
    pub results: PathBuf,
}
