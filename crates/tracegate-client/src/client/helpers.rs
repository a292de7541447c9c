//! Pure helpers: query paths and response probing (no HTTP, no status logic).

/// Number of most recent jobs considered by frame statistics.
pub(crate) const STATS_JOB_WINDOW: u64 = 100;

/// Percent-encode a query parameter value.
pub(crate) fn encode_query_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// Path listing the executions of a job on one GPU.
pub(crate) fn trace_execs_path(job_id: u64, gpu_pciid: &str) -> String {
    format!(
        "/api/v1/trace_execs?q[job_id_eq]={}&q[gpu_pciid_eq]={}",
        job_id,
        encode_query_value(gpu_pciid)
    )
}

/// Path of the statistics of a trace frame on one GPU, limited to the jobs
/// preceding `job_id` (inclusive).
pub(crate) fn trace_frame_stats_path(trace_frame_id: u64, gpu_pciid: &str, job_id: u64) -> String {
    let oldest_job_id = job_id.saturating_sub(STATS_JOB_WINDOW);
    format!(
        "/api/v1/stats/trace_frames/{}?q[gpus_pciid_cont]={}&q[jobs_id_gt]={}&q[jobs_id_lt]={}",
        trace_frame_id,
        encode_query_value(gpu_pciid),
        oldest_job_id,
        job_id + 1
    )
}

/// Whether a create/lookup response describes an object (has an `id`).
pub(crate) fn has_id(value: &serde_json::Value) -> bool {
    value.get("id").map(|id| !id.is_null()).unwrap_or(false)
}
