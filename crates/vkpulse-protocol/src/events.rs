use serde::{Deserialize, Serialize};

/// Top-level event envelope sent from the layer to the profiler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CaptureEvent {
    /// GPU timings for one queue submission.
    GpuQueueSubmission(GpuQueueSubmission),
    /// First sighting of a marker text; later events refer to it by key.
    InternedString { key: u64, text: String },
}

/// CPU-side context of a queue submission. The pre/post timestamps bracket
/// the driver's submit call so the consumer can match this submission to
/// its own view of the thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionMetaInfo {
    pub tid: i32,
    pub pre_submission_cpu_timestamp: u64,
    pub post_submission_cpu_timestamp: u64,
}

/// One harvested queue submission with all timestamps already converted
/// to nanoseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuQueueSubmission {
    pub meta_info: SubmissionMetaInfo,
    pub submit_infos: Vec<GpuSubmitInfo>,
    pub completed_markers: Vec<GpuDebugMarker>,
    /// Begin markers in this submission that carry a GPU timestamp.
    pub num_begin_markers: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GpuSubmitInfo {
    pub command_buffers: Vec<GpuCommandBuffer>,
}

/// Command-buffer execution bracket. The begin timestamp is absent when
/// capture started after the command buffer began recording.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GpuCommandBuffer {
    pub begin_gpu_timestamp_ns: Option<u64>,
    pub end_gpu_timestamp_ns: u64,
}

/// A debug marker whose end timestamp landed in this submission. The begin
/// half may come from an earlier submission (its meta info says which) or
/// be missing entirely if it was recorded while capture was off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuDebugMarker {
    pub text_key: u64,
    pub color: Option<MarkerColor>,
    /// Nesting depth on the queue's marker stack at begin time.
    pub depth: u32,
    pub end_gpu_timestamp_ns: u64,
    pub begin_marker: Option<GpuDebugMarkerBeginInfo>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GpuDebugMarkerBeginInfo {
    pub meta_info: SubmissionMetaInfo,
    pub gpu_timestamp_ns: u64,
}

/// Values are all in range [0.0, 1.0].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarkerColor {
    pub red: f32,
    pub green: f32,
    pub blue: f32,
    pub alpha: f32,
}
