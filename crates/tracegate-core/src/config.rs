//! Run configuration, read once at process start.

use std::path::PathBuf;

use regex::Regex;
use tracegate_client::JobTimeline;

use crate::error::{Result, TraceGateError};

/// CI job context, taken from the GitLab CI environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiContext {
    /// `CI_PROJECT_PATH`, e.g. `mesa/mesa`.
    pub project_path: String,
    /// `CI_COMMIT_BRANCH`.
    pub branch: String,
    /// `CI_PROJECT_URL`.
    pub project_url: String,
    /// `CI_COMMIT_SHORT_SHA`.
    pub commit_short_sha: String,
    /// Whether `CI_MERGE_REQUEST_ID` is set.
    pub is_merge_request: bool,
}

impl CiContext {
    /// Read the context from the process environment.
    ///
    /// | Variable | Required |
    /// |----------|----------|
    /// | `CI_PROJECT_PATH` | yes |
    /// | `CI_COMMIT_BRANCH` | yes |
    /// | `CI_PROJECT_URL` | yes |
    /// | `CI_COMMIT_SHORT_SHA` | yes |
    /// | `CI_MERGE_REQUEST_ID` | no (presence marks a pre-merge pipeline) |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the context from any variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let require = |name: &str| {
            lookup(name).ok_or_else(|| {
                TraceGateError::config(format!("the environment variable `{}` is missing", name))
            })
        };

        Ok(Self {
            project_path: require("CI_PROJECT_PATH")?,
            branch: require("CI_COMMIT_BRANCH")?,
            project_url: require("CI_PROJECT_URL")?.trim_end_matches('/').to_string(),
            commit_short_sha: require("CI_COMMIT_SHORT_SHA")?,
            is_merge_request: lookup("CI_MERGE_REQUEST_ID").is_some(),
        })
    }

    /// Links the server uses to point back at this project (GitLab layout).
    pub fn job_timeline(&self) -> JobTimeline {
        let url = &self.project_url;
        JobTimeline {
            project: self.project_path.clone(),
            branch: self.branch.clone(),
            project_url: format!("{}/-/tree/{}", url, self.branch),
            base_url_for_commits: format!("{}/-/commit/", url),
            url_pattern_for_filing_issue: format!(
                "{}/-/issues/new?issue[title]=%{{title}}&issue[description]=%{{description}}",
                url
            ),
            url_for_comparing_commits: format!("{}/-/compare/", url),
        }
    }

    /// Whether this pipeline tests already-merged (released) code.
    pub fn is_post_merge(&self, policy: &PostMergePolicy) -> bool {
        !self.is_merge_request && policy.is_release_branch(&self.project_path, &self.branch)
    }
}

/// Which branches of which CI projects carry released code.
#[derive(Debug, Clone)]
pub struct PostMergePolicy {
    rules: Vec<(String, Regex)>,
}

impl Default for PostMergePolicy {
    fn default() -> Self {
        let mesa = r"^((staging/)?\d{2}\.\d|main)";
        Self::new()
            .with_rule("mesa/mesa", mesa)
            .with_rule("tanty/mesa-valve-ci", mesa)
            .with_rule("mupuf/dxvk-ci", r"^master$")
    }
}

impl PostMergePolicy {
    /// A policy without any release branch.
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// Add a rule. Invalid patterns are reported and ignored.
    pub fn with_rule(mut self, project_path: impl Into<String>, branch_pattern: &str) -> Self {
        let project_path = project_path.into();
        match Regex::new(branch_pattern) {
            Ok(re) => self.rules.push((project_path, re)),
            Err(e) => tracing::warn!(
                project = %project_path,
                pattern = branch_pattern,
                error = %e,
                "ignoring invalid release-branch pattern"
            ),
        }
        self
    }

    pub fn is_release_branch(&self, project_path: &str, branch: &str) -> bool {
        self.rules
            .iter()
            .any(|(project, re)| project == project_path && re.is_match(branch))
    }
}

/// A tracked source project and the path of its local working copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectSpec {
    pub name: String,
    pub path: PathBuf,
}

impl ProjectSpec {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    /// Parse a `NAME=PATH` argument.
    pub fn parse(arg: &str) -> Result<Self> {
        match arg.split_once('=') {
            Some((name, path)) if !name.is_empty() && !path.is_empty() => {
                Ok(Self::new(name, path))
            }
            _ => Err(TraceGateError::config(format!(
                "invalid project '{}', expected NAME=PATH",
                arg
            ))),
        }
    }
}

/// Everything a report run needs besides the server client.
#[derive(Debug, Clone)]
pub struct ReportConfig {
    /// Job name on the server.
    pub run_name: String,
    /// Folder holding one subdirectory per trace execution.
    pub results_dir: PathBuf,
    /// Tracked projects whose history decides which reports apply.
    pub projects: Vec<ProjectSpec>,
    /// Upload workers; defaults to the available parallelism.
    pub parallelism: Option<usize>,
    pub ci: CiContext,
    pub post_merge: PostMergePolicy,
}

impl ReportConfig {
    pub fn new(run_name: impl Into<String>, results_dir: impl Into<PathBuf>, ci: CiContext) -> Self {
        Self {
            run_name: run_name.into(),
            results_dir: results_dir.into(),
            projects: Vec::new(),
            parallelism: None,
            ci,
            post_merge: PostMergePolicy::default(),
        }
    }

    pub fn with_project(mut self, project: ProjectSpec) -> Self {
        self.projects.push(project);
        self
    }

    pub fn with_parallelism(mut self, parallelism: Option<usize>) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_post_merge_policy(mut self, policy: PostMergePolicy) -> Self {
        self.post_merge = policy;
        self
    }

    /// Number of concurrent upload workers.
    pub fn upload_parallelism(&self) -> usize {
        self.parallelism
            .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
            .unwrap_or(4)
            .max(1)
    }
}
