//! The traces server, as seen by the reporting pipeline.

use async_trait::async_trait;
use tracegate_client::{
    BlobRequest, ClientResult, CommitRecord, CompatibilityRecord, DirectUpload, GpuRecord,
    JobRecord, NewCompatibility, NewJob, NewTraceExec, ProjectRecord, TraceExecRecord,
    TraceFrameStats, TraceRecord, TracesClient,
};

/// Server operations used by a report run.
///
/// Implemented by [`TracesClient`]; tests substitute an in-memory server.
#[async_trait]
pub trait TraceServer: Send + Sync {
    /// Base URL, used to link to server pages in reports.
    fn base_url(&self) -> &str;

    async fn list_traces(&self) -> ClientResult<Vec<TraceRecord>>;

    async fn gpu_by_pciid(&self, pciid: &str) -> ClientResult<Option<GpuRecord>>;

    /// Compatibility reports filed for a GPU.
    async fn list_compatibility_reports(&self, pciid: &str) -> ClientResult<Vec<CompatibilityRecord>>;

    /// File a report, or reinforce an identical one.
    async fn report_compatibility(&self, report: &NewCompatibility) -> ClientResult<bool>;

    async fn project_get_or_create(&self, name: &str) -> ClientResult<ProjectRecord>;

    async fn commit_get_or_create(
        &self,
        project: &ProjectRecord,
        version: &str,
    ) -> ClientResult<CommitRecord>;

    async fn job_get_or_create(&self, job: &NewJob) -> ClientResult<JobRecord>;

    /// Executions already registered for a job on a GPU.
    async fn list_trace_execs(&self, job_id: u64, pciid: &str) -> ClientResult<Vec<TraceExecRecord>>;

    async fn create_trace_exec(&self, exec: &NewTraceExec) -> ClientResult<TraceExecRecord>;

    /// Outputs of a trace frame on a GPU over the jobs preceding `job_id`.
    async fn trace_frame_stats(
        &self,
        trace_frame_id: u64,
        pciid: &str,
        job_id: u64,
    ) -> ClientResult<TraceFrameStats>;

    /// Signed id of an already-stored frame with the same pixels.
    async fn find_frame_by_image_checksum(&self, image_checksum: &str) -> ClientResult<Option<String>>;

    async fn create_direct_upload(&self, blob: &BlobRequest) -> ClientResult<DirectUpload>;

    async fn upload_blob(&self, upload: &DirectUpload, data: Vec<u8>) -> ClientResult<()>;
}

#[async_trait]
impl TraceServer for TracesClient {
    fn base_url(&self) -> &str {
        TracesClient::base_url(self)
    }

    async fn list_traces(&self) -> ClientResult<Vec<TraceRecord>> {
        TracesClient::list_traces(self).await
    }

    async fn gpu_by_pciid(&self, pciid: &str) -> ClientResult<Option<GpuRecord>> {
        TracesClient::gpu_by_pciid(self, pciid).await
    }

    async fn list_compatibility_reports(&self, pciid: &str) -> ClientResult<Vec<CompatibilityRecord>> {
        TracesClient::list_compatibility_reports(self, Some(pciid)).await
    }

    async fn report_compatibility(&self, report: &NewCompatibility) -> ClientResult<bool> {
        TracesClient::report_compatibility(self, report).await
    }

    async fn project_get_or_create(&self, name: &str) -> ClientResult<ProjectRecord> {
        TracesClient::project_get_or_create(self, name).await
    }

    async fn commit_get_or_create(
        &self,
        project: &ProjectRecord,
        version: &str,
    ) -> ClientResult<CommitRecord> {
        TracesClient::commit_get_or_create(self, project, version).await
    }

    async fn job_get_or_create(&self, job: &NewJob) -> ClientResult<JobRecord> {
        TracesClient::job_get_or_create(self, job).await
    }

    async fn list_trace_execs(&self, job_id: u64, pciid: &str) -> ClientResult<Vec<TraceExecRecord>> {
        TracesClient::list_trace_execs(self, job_id, pciid).await
    }

    async fn create_trace_exec(&self, exec: &NewTraceExec) -> ClientResult<TraceExecRecord> {
        TracesClient::create_trace_exec(self, exec).await
    }

    async fn trace_frame_stats(
        &self,
        trace_frame_id: u64,
        pciid: &str,
        job_id: u64,
    ) -> ClientResult<TraceFrameStats> {
        TracesClient::trace_frame_stats(self, trace_frame_id, pciid, job_id).await
    }

    async fn find_frame_by_image_checksum(&self, image_checksum: &str) -> ClientResult<Option<String>> {
        TracesClient::find_frame_by_image_checksum(self, image_checksum).await
    }

    async fn create_direct_upload(&self, blob: &BlobRequest) -> ClientResult<DirectUpload> {
        TracesClient::create_direct_upload(self, blob).await
    }

    async fn upload_blob(&self, upload: &DirectUpload, data: Vec<u8>) -> ClientResult<()> {
        TracesClient::upload_blob(self, upload, data).await
    }
}
