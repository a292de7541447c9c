//! In-memory traces server and result-folder fixtures.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;
use tracegate_client::{
    BlobRequest, ClientError, ClientResult, CommitRecord, CompatibilityRecord, DirectUpload,
    GpuRecord, JobRecord, NewCompatibility, NewJob, NewTraceExec, ProjectRecord, TraceExecRecord,
    TraceFrameStats, TraceRecord,
};
use tracegate_core::TraceServer;

pub const PCIID: &str = "0x1002:0x163f";
pub const GPU_ID: u64 = 2;
pub const JOB_ID: u64 = 500;

#[derive(Debug, Default)]
pub struct Calls {
    pub image_lookups: Vec<String>,
    pub direct_uploads: Vec<BlobRequest>,
    pub puts: Vec<String>,
    pub registered: Vec<NewTraceExec>,
    pub compatibility: Vec<NewCompatibility>,
    pub projects: Vec<String>,
    pub commits: Vec<(u64, String)>,
    pub jobs: Vec<NewJob>,
    pub stats: Vec<u64>,
}

#[derive(Default)]
pub struct FakeServer {
    pub traces: Vec<TraceRecord>,
    pub compatibility: Vec<CompatibilityRecord>,
    pub existing: Vec<TraceExecRecord>,
    /// Image checksum → signed id of frames the server already stores.
    pub known_images: HashMap<String, String>,
    /// Trace frame id → history.
    pub stats: HashMap<u64, TraceFrameStats>,
    /// Acceptability the server reports for freshly uploaded frames.
    pub frame_acceptability: Option<bool>,
    /// File names whose PUT fails.
    pub failing_puts: Vec<String>,
    pub calls: Mutex<Calls>,
}

impl FakeServer {
    pub fn calls(&self) -> std::sync::MutexGuard<'_, Calls> {
        self.calls.lock().unwrap()
    }
}

#[async_trait]
impl TraceServer for FakeServer {
    fn base_url(&self) -> &str {
        "https://traces.test/"
    }

    async fn list_traces(&self) -> ClientResult<Vec<TraceRecord>> {
        Ok(self.traces.clone())
    }

    async fn gpu_by_pciid(&self, pciid: &str) -> ClientResult<Option<GpuRecord>> {
        Ok((pciid == PCIID).then(|| GpuRecord {
            id: GPU_ID,
            pciid: PCIID.to_string(),
            name: Some("VANGOGH".to_string()),
            metadata: json!({}),
        }))
    }

    async fn list_compatibility_reports(&self, _pciid: &str) -> ClientResult<Vec<CompatibilityRecord>> {
        Ok(self.compatibility.clone())
    }

    async fn report_compatibility(&self, report: &NewCompatibility) -> ClientResult<bool> {
        self.calls().compatibility.push(report.clone());
        Ok(true)
    }

    async fn project_get_or_create(&self, name: &str) -> ClientResult<ProjectRecord> {
        self.calls().projects.push(name.to_string());
        Ok(ProjectRecord {
            id: 7,
            name: name.to_string(),
            repo_url: None,
            project_url: None,
            base_url_for_commits: None,
        })
    }

    async fn commit_get_or_create(
        &self,
        project: &ProjectRecord,
        version: &str,
    ) -> ClientResult<CommitRecord> {
        self.calls().commits.push((project.id, version.to_string()));
        Ok(CommitRecord {
            id: 70,
            project_id: project.id,
            version: version.to_string(),
        })
    }

    async fn job_get_or_create(&self, job: &NewJob) -> ClientResult<JobRecord> {
        self.calls().jobs.push(job.clone());
        Ok(JobRecord {
            id: JOB_ID,
            name: job.name.clone(),
            metadata: json!({}),
            is_released_code: Some(job.is_released_code),
        })
    }

    async fn list_trace_execs(&self, job_id: u64, pciid: &str) -> ClientResult<Vec<TraceExecRecord>> {
        assert_eq!((job_id, pciid), (JOB_ID, PCIID));
        Ok(self.existing.clone())
    }

    async fn create_trace_exec(&self, exec: &NewTraceExec) -> ClientResult<TraceExecRecord> {
        let id = {
            let mut calls = self.calls();
            calls.registered.push(exec.clone());
            900 + calls.registered.len() as u64
        };

        let trace_frames: BTreeMap<String, serde_json::Value> = exec
            .frame_blobs
            .keys()
            .map(|frame_id| {
                let n: u64 = frame_id.parse().unwrap_or(0);
                (
                    frame_id.clone(),
                    json!({
                        "id": 1000 + n,
                        "frame_outputs": {"deduped_frame_output": {"id": 2000 + n, "is_acceptable": self.frame_acceptability}}
                    }),
                )
            })
            .collect();

        serde_json::from_value(json!({
            "id": id,
            "trace": {"id": exec.trace_id},
            "trace_frames": trace_frames,
            "execution_time": exec.execution_time,
            "status": exec.status,
            "driver": exec.driver,
        }))
        .map_err(|e| ClientError::InvalidResponse {
            message: e.to_string(),
        })
    }

    async fn trace_frame_stats(
        &self,
        trace_frame_id: u64,
        _pciid: &str,
        _job_id: u64,
    ) -> ClientResult<TraceFrameStats> {
        self.calls().stats.push(trace_frame_id);
        Ok(self.stats.get(&trace_frame_id).cloned().unwrap_or_default())
    }

    async fn find_frame_by_image_checksum(&self, image_checksum: &str) -> ClientResult<Option<String>> {
        self.calls().image_lookups.push(image_checksum.to_string());
        Ok(self.known_images.get(image_checksum).cloned())
    }

    async fn create_direct_upload(&self, blob: &BlobRequest) -> ClientResult<DirectUpload> {
        self.calls().direct_uploads.push(blob.clone());
        Ok(DirectUpload {
            url: format!("memory://{}", blob.filename),
            headers: BTreeMap::new(),
            signed_id: format!("signed-{}", blob.checksum),
        })
    }

    async fn upload_blob(&self, upload: &DirectUpload, _data: Vec<u8>) -> ClientResult<()> {
        let filename = upload.url.trim_start_matches("memory://").to_string();
        if self.failing_puts.contains(&filename) {
            return Err(ClientError::Server {
                status: 502,
                url: upload.url.clone(),
                message: "bad gateway".to_string(),
            });
        }
        self.calls().puts.push(filename);
        Ok(())
    }
}

pub fn trace_record(id: u64, filename: &str, frames: &[u64]) -> TraceRecord {
    TraceRecord {
        id,
        filename: filename.to_string(),
        tracing_tool: Some("apitrace".to_string()),
        graphics_api: Some("Vulkan".to_string()),
        frames_to_capture: json!(frames),
        ..Default::default()
    }
}

pub fn compatibility(id: u64, trace_id: u64, project: &str, commit: &str, is_working: bool, agreement: u32) -> CompatibilityRecord {
    serde_json::from_value(json!({
        "id": id,
        "trace_id": trace_id,
        "gpu_id": GPU_ID,
        "is_working": is_working,
        "agreement_count": agreement,
        "commit": {"id": id * 10, "version": commit, "project": {"id": 7, "name": project}}
    }))
    .unwrap()
}

/// Write a small solid-color frame.
pub fn write_frame(path: &Path, pixel: [u8; 3]) {
    image::RgbImage::from_pixel(4, 4, image::Rgb(pixel))
        .save(path)
        .unwrap();
}

/// Write the machine metadata at the root of a result folder.
pub fn write_machine_info(root: &Path) {
    std::fs::write(
        root.join("gfxinfo.json"),
        json!({
            "tags": ["amdgpu:codename:VANGOGH", format!("amdgpu:pciid:{}", PCIID)],
            "vk:driver:name": "radv",
            "vk:driver:info": "Mesa 23.1.0",
            "mesa:version": "23.1.0",
            "mesa:git:version": "abcdef12",
            "vk:device:name": "AMD Custom GPU 0405 (RADV VANGOGH)",
            "vk:device:type": "integrated",
            "vk:vram_size_gib": 1.0,
            "vk:gtt_size_gib": 7.5
        })
        .to_string(),
    )
    .unwrap();
    std::fs::write(
        root.join("glxinfo"),
        "OpenGL vendor string: AMD\n\
         OpenGL renderer string: AMD Custom GPU 0405 (vangogh, LLVM 15.0.7, DRM 3.49)\n\
         OpenGL core profile version string: 4.6 (Core Profile) Mesa 23.1.0\n",
    )
    .unwrap();
}

/// Write an execution folder with markers, a log and the given frames.
pub fn write_execution(root: &Path, name: &str, retcode: Option<i32>, frames: &[(u64, [u8; 3])]) -> std::path::PathBuf {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(".started"), "2023-01-25 08:14:09\n").unwrap();
    if let Some(code) = retcode {
        std::fs::write(dir.join(".done"), format!("2023-01-25 08:14:19.250000000\n{}\n", code)).unwrap();
    }
    std::fs::write(dir.join("replay.log"), "info:  replaying\n").unwrap();
    for (frame, pixel) in frames {
        write_frame(&dir.join(format!("{:010}.png", frame)), *pixel);
    }
    dir
}
