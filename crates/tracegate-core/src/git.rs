//! Commit reachability in the working copies of tracked projects.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use git2::{Oid, Repository, Sort};
use tracing::debug;

use crate::error::{Result, TraceGateError};

/// A tracked project's history, as needed by the compatibility ledger.
pub trait CommitGraph: Send + Sync {
    /// Project name, as known by the server.
    fn name(&self) -> &str;

    /// Full id of the commit currently checked out.
    fn head(&self) -> &str;

    /// The newest candidates still reachable from head.
    ///
    /// Returns `{head}` when head is a candidate. Otherwise, walking back
    /// from head and stopping at candidates, returns every candidate that
    /// is the parent of a visited commit. Unknown ids are ignored.
    fn frontier(&self, candidates: &BTreeSet<String>) -> BTreeSet<String>;
}

/// [`CommitGraph`] backed by a local git repository.
pub struct GitCommitIndex {
    name: String,
    path: PathBuf,
    head: String,
    /// git2's `Repository` is `Send` but not `Sync`; frontier walks take turns.
    repo: Mutex<Repository>,
}

impl std::fmt::Debug for GitCommitIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitCommitIndex")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("head", &self.head)
            .finish()
    }
}

impl GitCommitIndex {
    /// Open the repository of a project. Fails if it cannot be opened or
    /// has no commit checked out.
    pub fn open(name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let name = name.into();
        let path = path.as_ref().to_path_buf();
        let git_err = |source| TraceGateError::Git {
            project: name.clone(),
            source,
        };

        let repo = Repository::open(&path).map_err(git_err)?;
        let head = repo
            .head()
            .map_err(git_err)?
            .peel_to_commit()
            .map_err(git_err)?
            .id()
            .to_string();

        debug!(project = %name, path = %path.display(), head = %head, "opened repository");

        Ok(Self {
            name,
            path,
            head,
            repo: Mutex::new(repo),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn walk_frontier(&self, candidates: &BTreeSet<String>) -> std::result::Result<BTreeSet<String>, git2::Error> {
        let repo = match self.repo.lock() {
            Ok(repo) => repo,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut walk = repo.revwalk()?;
        walk.set_sorting(Sort::TOPOLOGICAL)?;
        walk.push(Oid::from_str(&self.head)?)?;

        for candidate in candidates {
            let hidden = Oid::from_str(candidate).and_then(|oid| walk.hide(oid));
            if let Err(e) = hidden {
                debug!(project = %self.name, commit = %candidate, error = %e, "ignoring unknown commit");
            }
        }

        let mut frontier = BTreeSet::new();
        for oid in walk {
            let commit = match oid.and_then(|oid| repo.find_commit(oid)) {
                Ok(commit) => commit,
                Err(e) => {
                    debug!(project = %self.name, error = %e, "skipping unreadable commit");
                    continue;
                }
            };
            for parent in commit.parent_ids() {
                let parent = parent.to_string();
                if candidates.contains(&parent) {
                    frontier.insert(parent);
                }
            }
        }

        Ok(frontier)
    }
}

impl CommitGraph for GitCommitIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn head(&self) -> &str {
        &self.head
    }

    fn frontier(&self, candidates: &BTreeSet<String>) -> BTreeSet<String> {
        if candidates.contains(&self.head) {
            return BTreeSet::from([self.head.clone()]);
        }

        match self.walk_frontier(candidates) {
            Ok(frontier) => frontier,
            Err(e) => {
                debug!(project = %self.name, error = %e, "commit walk failed");
                BTreeSet::new()
            }
        }
    }
}
