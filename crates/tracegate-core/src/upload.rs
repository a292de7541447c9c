//! Deduplicating, concurrent upload of frames and logs, and registration of
//! trace executions.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracegate_client::{BlobRequest, GpuDriver, NewTraceExec, TraceExecRecord};
use tracing::{debug, error, info, warn};

use crate::error::{Result, TraceGateError};
use crate::results::TraceExecutionAttempt;
use crate::server::TraceServer;

/// Base64 MD5 of raw bytes.
pub fn data_checksum(bytes: &[u8]) -> String {
    BASE64.encode(md5::compute(bytes).0)
}

/// Base64 MD5 of the decoded RGBA8 pixels, so that re-encodings of the
/// same image share a checksum.
pub fn image_checksum(bytes: &[u8], path: &Path) -> Result<String> {
    let image = image::load_from_memory(bytes).map_err(|source| TraceGateError::Image {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(data_checksum(image.to_rgba8().as_raw()))
}

/// Checksums of one local artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactChecksums {
    pub filename: String,
    pub byte_size: u64,
    pub checksum: String,
    /// Set for frames only.
    pub image_checksum: Option<String>,
}

impl ArtifactChecksums {
    /// Read and checksum an artifact. Blocking.
    pub fn compute(path: &Path, is_frame: bool) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| TraceGateError::io(path, e))?;
        let image_checksum = if is_frame {
            Some(image_checksum(&bytes, path)?)
        } else {
            None
        };

        Ok(Self {
            filename: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            byte_size: bytes.len() as u64,
            checksum: data_checksum(&bytes),
            image_checksum,
        })
    }

    /// Identity of the blob: the pixels for frames, the path for logs.
    fn blob_key(&self, path: &Path) -> String {
        match &self.image_checksum {
            Some(sum) => format!("image:{}", sum),
            None => format!("file:{}", path.display()),
        }
    }
}

/// Shared failure of one artifact; every execution referencing the blob
/// reports the same error.
pub type ArtifactResult<T> = std::result::Result<T, Arc<TraceGateError>>;

/// Result of uploading one execution.
#[derive(Debug, Clone)]
pub enum UploadOutcome {
    /// Registered by this run.
    Uploaded(TraceExecRecord),
    /// Registered by an earlier run of the same job; left untouched.
    AlreadyUploaded(TraceExecRecord),
    /// Skipped; the error names the failing artifact or request.
    Failed(Arc<TraceGateError>),
}

impl UploadOutcome {
    /// The server's record of the execution, if there is one.
    pub fn record(&self) -> Option<&TraceExecRecord> {
        match self {
            Self::Uploaded(r) | Self::AlreadyUploaded(r) => Some(r),
            Self::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&TraceGateError> {
        match self {
            Self::Failed(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// An execution ready to be uploaded.
#[derive(Debug, Clone, Copy)]
pub struct PendingExecution<'a> {
    pub attempt: &'a TraceExecutionAttempt,
    pub driver: &'a GpuDriver,
}

/// Where executions get registered.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadTarget {
    pub job_id: u64,
    pub gpu_pciid: String,
    /// Machine metadata attached to every execution.
    pub metadata: serde_json::Value,
}

/// Uploads the artifacts of executions and registers them.
pub struct UploadCoordinator {
    server: Arc<dyn TraceServer>,
    parallelism: usize,
}

impl UploadCoordinator {
    pub fn new(server: Arc<dyn TraceServer>, parallelism: usize) -> Self {
        Self {
            server,
            parallelism: parallelism.max(1),
        }
    }

    /// Upload a single execution.
    pub async fn upload(&self, target: &UploadTarget, execution: PendingExecution<'_>) -> Result<UploadOutcome> {
        self.upload_all(target, std::slice::from_ref(&execution))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| TraceGateError::Unprocessed {
                path: execution.attempt.folder.clone(),
            })
    }

    /// Upload every execution; outcomes are in input order.
    ///
    /// Only listing the already-registered executions can fail the whole
    /// call. Artifact and registration failures are per execution.
    pub async fn upload_all(
        &self,
        target: &UploadTarget,
        executions: &[PendingExecution<'_>],
    ) -> Result<Vec<UploadOutcome>> {
        let existing = self
            .server
            .list_trace_execs(target.job_id, &target.gpu_pciid)
            .await?;

        let registered: Vec<Option<TraceExecRecord>> = executions
            .iter()
            .map(|exec| {
                existing
                    .iter()
                    .find(|r| {
                        r.trace.id == exec.attempt.trace.id && r.driver.as_ref() == Some(exec.driver)
                    })
                    .cloned()
            })
            .collect();

        let already = registered.iter().filter(|r| r.is_some()).count();
        info!(already_uploaded = already, pending = executions.len() - already, "uploading trace executions");

        // Every artifact of the pending executions, with whether it is a frame.
        let mut artifacts: BTreeMap<PathBuf, bool> = BTreeMap::new();
        for (exec, record) in executions.iter().zip(&registered) {
            if record.is_some() {
                continue;
            }
            for path in exec.attempt.found_frames.values() {
                artifacts.insert(path.clone(), true);
            }
            if let Some(log) = &exec.attempt.log_path {
                artifacts.insert(log.clone(), false);
            }
        }

        let checksums = self.checksum_all(artifacts).await;
        let blobs = self.upload_blobs(&checksums).await;

        let mut outcomes = Vec::with_capacity(executions.len());
        for (exec, record) in executions.iter().zip(registered) {
            let outcome = match record {
                Some(record) => UploadOutcome::AlreadyUploaded(record),
                None => self.register(target, *exec, &checksums, &blobs).await,
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn checksum_all(&self, artifacts: BTreeMap<PathBuf, bool>) -> HashMap<PathBuf, ArtifactResult<ArtifactChecksums>> {
        let sem = Arc::new(Semaphore::new(self.parallelism));
        let mut join_set = JoinSet::new();

        for (path, is_frame) in artifacts {
            let sem = sem.clone();
            join_set.spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                let task_path = path.clone();
                let result = tokio::task::spawn_blocking(move || ArtifactChecksums::compute(&task_path, is_frame))
                    .await
                    .map_err(TraceGateError::from)
                    .and_then(|r| r)
                    .map_err(|e| Arc::new(TraceGateError::artifact(&path, e)));
                (path, result)
            });
        }

        let mut checksums = HashMap::new();
        while let Some(res) = join_set.join_next().await {
            match res {
                Ok((path, result)) => {
                    if let Err(e) = &result {
                        error!(error = %e, "failed to checksum artifact");
                    }
                    checksums.insert(path, result);
                }
                Err(e) => error!(error = %e, "checksum task panicked"),
            }
        }
        checksums
    }

    /// Upload each distinct blob once. Returns blob key → signed id.
    async fn upload_blobs(
        &self,
        checksums: &HashMap<PathBuf, ArtifactResult<ArtifactChecksums>>,
    ) -> HashMap<String, ArtifactResult<String>> {
        let mut distinct: BTreeMap<String, (PathBuf, ArtifactChecksums)> = BTreeMap::new();
        for (path, sums) in checksums {
            if let Ok(sums) = sums {
                distinct
                    .entry(sums.blob_key(path))
                    .or_insert_with(|| (path.clone(), sums.clone()));
            }
        }

        let sem = Arc::new(Semaphore::new(self.parallelism));
        let mut join_set = JoinSet::new();

        for (key, (path, sums)) in distinct {
            let sem = sem.clone();
            let server = self.server.clone();
            join_set.spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                let result = upload_blob(server.as_ref(), &path, sums)
                    .await
                    .map_err(|e| Arc::new(TraceGateError::artifact(&path, e)));
                if let Err(e) = &result {
                    error!(error = %e, "failed to upload artifact");
                }
                (key, result)
            });
        }

        let mut blobs = HashMap::new();
        while let Some(res) = join_set.join_next().await {
            match res {
                Ok((key, result)) => {
                    blobs.insert(key, result);
                }
                Err(e) => error!(error = %e, "upload task panicked"),
            }
        }
        blobs
    }

    async fn register(
        &self,
        target: &UploadTarget,
        exec: PendingExecution<'_>,
        checksums: &HashMap<PathBuf, ArtifactResult<ArtifactChecksums>>,
        blobs: &HashMap<String, ArtifactResult<String>>,
    ) -> UploadOutcome {
        let attempt = exec.attempt;
        // A missing entry means its worker panicked.
        let resolve = |path: &Path| -> ArtifactResult<String> {
            let unprocessed = || Arc::new(TraceGateError::Unprocessed { path: path.to_path_buf() });
            let sums = checksums.get(path).ok_or_else(unprocessed)?.as_ref().map_err(Arc::clone)?;
            blobs.get(&sums.blob_key(path)).ok_or_else(unprocessed)?.clone()
        };

        let mut frame_blobs = BTreeMap::new();
        for (frame_id, path) in &attempt.found_frames {
            match resolve(path) {
                Ok(signed_id) => {
                    frame_blobs.insert(frame_id.clone(), signed_id);
                }
                Err(e) => return skip(attempt, e),
            }
        }

        let exec_log = match &attempt.log_path {
            Some(path) => match resolve(path) {
                Ok(signed_id) => Some(signed_id),
                Err(e) => return skip(attempt, e),
            },
            None => None,
        };

        let new_exec = NewTraceExec {
            job_id: target.job_id,
            trace_id: attempt.trace.id,
            metadata: target.metadata.clone(),
            status: attempt.retcode,
            exec_log,
            execution_time: attempt.execution_time_secs(),
            frame_blobs,
            gpu_pciid: target.gpu_pciid.clone(),
            driver: Some(exec.driver.clone()),
        };

        match self.server.create_trace_exec(&new_exec).await {
            Ok(record) => {
                info!(trace = %attempt.trace.filename, exec_id = record.id, "registered trace execution");
                UploadOutcome::Uploaded(record)
            }
            Err(e) => {
                error!(trace = %attempt.trace.filename, error = %e, "failed to register trace execution");
                UploadOutcome::Failed(Arc::new(TraceGateError::Client(e)))
            }
        }
    }
}

fn skip(attempt: &TraceExecutionAttempt, error: Arc<TraceGateError>) -> UploadOutcome {
    warn!(
        trace = %attempt.trace.filename,
        error = %error,
        "ignoring this trace execution"
    );
    UploadOutcome::Failed(error)
}

async fn upload_blob(server: &dyn TraceServer, path: &Path, sums: ArtifactChecksums) -> Result<String> {
    if let Some(image_checksum) = &sums.image_checksum {
        if let Some(signed_id) = server.find_frame_by_image_checksum(image_checksum).await? {
            debug!(path = %path.display(), "frame already known to the server");
            return Ok(signed_id);
        }
    }

    let upload = server
        .create_direct_upload(&BlobRequest {
            filename: sums.filename,
            byte_size: sums.byte_size,
            checksum: sums.checksum,
            image_checksum: sums.image_checksum,
        })
        .await?;

    let data = tokio::fs::read(path).await.map_err(|e| TraceGateError::io(path, e))?;
    server.upload_blob(&upload, data).await?;

    Ok(upload.signed_id)
}
