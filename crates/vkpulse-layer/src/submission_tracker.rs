//! Command-buffer and debug-marker timing across queue submissions.
//!
//! The tracker follows every command buffer from `vkBeginCommandBuffer`
//! to the present that harvests its timestamps. While capturing it plants
//! `vkCmdWriteTimestamp` at begin/end and around debug markers, snapshots
//! the per-command-buffer state at `vkQueueSubmit` (after which the
//! command buffer handle may be reused and means something else), and on
//! every `vkQueuePresentKHR` polls the GPU for submissions whose last
//! timestamp has landed, converts ticks to nanoseconds and hands the
//! result to the producer.
//!
//! Capture can flip on or off between any two calls, so every path that
//! allocated a query slot must have a matching reclaim path even when the
//! event itself is never emitted.
//!
//! Internally synchronized; safe to call from any thread recording with
//! its own command buffer (Vulkan forbids sharing one command buffer
//! between recording threads, and the tracker relies on that).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ash::vk;
use parking_lot::RwLock;
use tracing::{debug, warn};

use vkpulse_common::time::{current_thread_id, monotonic_timestamp_ns};
use vkpulse_protocol::events::{
    CaptureEvent, GpuCommandBuffer, GpuDebugMarker, GpuDebugMarkerBeginInfo, GpuQueueSubmission,
    GpuSubmitInfo, MarkerColor, SubmissionMetaInfo,
};

/// Driver entry points the tracker records and reads timestamps with.
pub trait TimestampDispatch {
    fn cmd_write_timestamp(
        &self,
        command_buffer: vk::CommandBuffer,
        stage: vk::PipelineStageFlags,
        query_pool: vk::QueryPool,
        slot: u32,
    );

    /// `vkGetQueryPoolResults` over `results.len()` consecutive 64-bit
    /// slots starting at `first_query`.
    fn get_query_pool_results(
        &self,
        device: vk::Device,
        query_pool: vk::QueryPool,
        first_query: u32,
        results: &mut [u64],
        flags: vk::QueryResultFlags,
    ) -> vk::Result;
}

/// Physical-device lookup, for the tick-to-nanosecond conversion factor.
pub trait DeviceProperties {
    fn physical_device_of(&self, device: vk::Device) -> vk::PhysicalDevice;
    fn properties_of(&self, physical_device: vk::PhysicalDevice) -> vk::PhysicalDeviceProperties;
}

/// Timestamp slot allocation and reclamation.
///
/// Every slot handed out by `next_ready_slot` must come back exactly once:
/// through `reset_slots` if a timestamp write may have reached the GPU, or
/// through `rollback_slots` if it never did.
pub trait QuerySlots {
    fn query_pool(&self, device: vk::Device) -> vk::QueryPool;
    fn next_ready_slot(&self, device: vk::Device) -> Option<u32>;
    fn reset_slots(&self, device: vk::Device, slots: &[u32]);
    fn rollback_slots(&self, device: vk::Device, slots: &[u32]);
}

/// Capture side: the producer connection to the profiler.
pub trait CaptureSink {
    fn is_capturing(&self) -> bool;
    fn intern_string(&self, text: &str) -> u64;
    fn enqueue_capture_event(&self, event: CaptureEvent);
}

/// Debug marker color, all channels in [0.0, 1.0]. All-zero means the
/// application specified no color and the consumer picks a default.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Color {
    pub red: f32,
    pub green: f32,
    pub blue: f32,
    pub alpha: f32,
}

impl Color {
    fn is_unset(&self) -> bool {
        *self == Color::default()
    }
}

/// One `VkSubmitInfo` as seen by the tracker: just the command buffers,
/// in submission order.
#[derive(Debug, Clone)]
pub struct SubmitInfo {
    pub command_buffers: Vec<vk::CommandBuffer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkerKind {
    Begin,
    End,
}

#[derive(Debug, Clone)]
struct Marker {
    kind: MarkerKind,
    slot: Option<u32>,
    text: Option<String>,
    color: Option<Color>,
}

/// Recording state of one command buffer between `mark_command_buffer_begin`
/// and whatever ends it (submission, reset, free). Created even when not
/// capturing so the marker structure keeps matching begins to ends.
#[derive(Debug, Default)]
struct CommandBufferState {
    begin_slot: Option<u32>,
    end_slot: Option<u32>,
    markers: Vec<Marker>,
    local_marker_depth: u32,
}

impl CommandBufferState {
    fn collect_slots(&self, out: &mut Vec<u32>) {
        out.extend(self.begin_slot);
        out.extend(self.end_slot);
        for marker in &self.markers {
            out.extend(marker.slot);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct MetaInfo {
    thread_id: i32,
    pre_submission_cpu_timestamp: u64,
    post_submission_cpu_timestamp: u64,
}

#[derive(Debug, Clone)]
struct SubmittedMarker {
    meta: MetaInfo,
    slot: u32,
}

/// A marker on the queue stack: pushed at its begin, closed out by its
/// end, which may arrive submissions later.
#[derive(Debug, Clone)]
struct MarkerState {
    begin_info: Option<SubmittedMarker>,
    end_info: Option<SubmittedMarker>,
    text: String,
    color: Color,
    depth: u32,
}

#[derive(Debug, Clone)]
struct SubmittedCommandBuffer {
    begin_slot: Option<u32>,
    end_slot: u32,
}

#[derive(Debug, Clone, Default)]
struct SubmittedSubmitInfo {
    command_buffers: Vec<SubmittedCommandBuffer>,
}

/// Snapshot of one `vkQueueSubmit`, alive until its timestamps are read.
#[derive(Debug)]
struct QueueSubmission {
    id: u64,
    meta: MetaInfo,
    submit_infos: Vec<SubmittedSubmitInfo>,
    completed_markers: Vec<MarkerState>,
    /// Slots whose markers closed without producing an event (end not
    /// captured); they still have GPU writes pending and ride along to the
    /// reset batch at harvest.
    discarded_slots: Vec<u32>,
    num_begin_markers: u32,
}

impl QueueSubmission {
    /// End slot of the last command buffer in the last non-empty submit
    /// info, the one whose timestamp lands last.
    fn last_end_slot(&self) -> Option<u32> {
        self.submit_infos
            .iter()
            .rev()
            .find(|submit_info| !submit_info.command_buffers.is_empty())
            .and_then(|submit_info| submit_info.command_buffers.last())
            .map(|command_buffer| command_buffer.end_slot)
    }
}

/// Markers open across submissions on one queue. Lives as long as the
/// queue; never reset at submission boundaries.
#[derive(Debug, Default)]
struct QueueMarkerState {
    marker_stack: Vec<MarkerState>,
}

#[derive(Default)]
struct TrackerState {
    pool_to_command_buffers: HashMap<vk::CommandPool, HashSet<vk::CommandBuffer>>,
    command_buffer_to_device: HashMap<vk::CommandBuffer, vk::Device>,
    command_buffer_to_state: HashMap<vk::CommandBuffer, CommandBufferState>,
    queue_to_submissions: HashMap<vk::Queue, VecDeque<QueueSubmission>>,
    queue_to_markers: HashMap<vk::Queue, QueueMarkerState>,
}

static NEXT_SUBMISSION_ID: AtomicU64 = AtomicU64::new(0);

pub struct SubmissionTracker<D, M, Q, P> {
    /// 0 disables filtering of markers.
    max_local_marker_depth: u32,
    dispatch: Arc<D>,
    query_pool: Arc<Q>,
    device_manager: Arc<M>,
    producer: Arc<P>,
    state: RwLock<TrackerState>,
}

impl<D, M, Q, P> SubmissionTracker<D, M, Q, P>
where
    D: TimestampDispatch,
    M: DeviceProperties,
    Q: QuerySlots,
    P: CaptureSink,
{
    pub fn new(
        max_local_marker_depth: u32,
        dispatch: Arc<D>,
        query_pool: Arc<Q>,
        device_manager: Arc<M>,
        producer: Arc<P>,
    ) -> Self {
        Self {
            max_local_marker_depth,
            dispatch,
            query_pool,
            device_manager,
            producer,
            state: RwLock::new(TrackerState::default()),
        }
    }

    pub fn track_command_buffers(
        &self,
        device: vk::Device,
        pool: vk::CommandPool,
        command_buffers: &[vk::CommandBuffer],
    ) {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let associated = state.pool_to_command_buffers.entry(pool).or_default();
        for &command_buffer in command_buffers {
            assert!(
                associated.insert(command_buffer),
                "command buffer {command_buffer:?} is already tracked"
            );
            let previous = state.command_buffer_to_device.insert(command_buffer, device);
            assert!(
                previous.is_none(),
                "command buffer {command_buffer:?} already mapped to a device"
            );
        }
    }

    pub fn untrack_command_buffers(
        &self,
        device: vk::Device,
        pool: vk::CommandPool,
        command_buffers: &[vk::CommandBuffer],
    ) {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let associated = state
            .pool_to_command_buffers
            .get_mut(&pool)
            .unwrap_or_else(|| panic!("untracking from unknown command pool {pool:?}"));
        for &command_buffer in command_buffers {
            assert!(
                associated.remove(&command_buffer),
                "command buffer {command_buffer:?} is not tracked in pool {pool:?}"
            );
            match state.command_buffer_to_device.remove(&command_buffer) {
                Some(tracked) => assert_eq!(
                    tracked, device,
                    "command buffer {command_buffer:?} is tracked on a different device"
                ),
                None => panic!("command buffer {command_buffer:?} has no tracked device"),
            }
        }
        let now_empty = associated.is_empty();
        if now_empty {
            state.pool_to_command_buffers.remove(&pool);
        }
    }

    /// Called after the driver's `vkBeginCommandBuffer`. Recording state is
    /// created even when not capturing so a capture that starts later still
    /// sees consistent marker structure.
    pub fn mark_command_buffer_begin(&self, command_buffer: vk::CommandBuffer) {
        {
            let mut state = self.state.write();
            let previous = state
                .command_buffer_to_state
                .insert(command_buffer, CommandBufferState::default());
            assert!(
                previous.is_none(),
                "command buffer {command_buffer:?} began recording twice without a reset"
            );
        }
        if !self.producer.is_capturing() {
            return;
        }

        let (device, slot) =
            self.record_timestamp(command_buffer, vk::PipelineStageFlags::TOP_OF_PIPE);
        self.commit_slot(command_buffer, device, slot, |record| {
            record.begin_slot = Some(slot);
        });
    }

    /// Called before the driver's `vkEndCommandBuffer` so the timestamp
    /// lands inside the command buffer.
    pub fn mark_command_buffer_end(&self, command_buffer: vk::CommandBuffer) {
        if !self.producer.is_capturing() {
            return;
        }

        let (device, slot) =
            self.record_timestamp(command_buffer, vk::PipelineStageFlags::BOTTOM_OF_PIPE);
        self.commit_slot(command_buffer, device, slot, |record| {
            record.end_slot = Some(slot);
        });
    }

    pub fn mark_debug_marker_begin(
        &self,
        command_buffer: vk::CommandBuffer,
        text: &str,
        color: Color,
    ) {
        let too_many_markers;
        {
            let mut guard = self.state.write();
            let record = state_of_mut(&mut guard, command_buffer);
            record.markers.push(Marker {
                kind: MarkerKind::Begin,
                slot: None,
                text: Some(text.to_owned()),
                color: Some(color),
            });
            record.local_marker_depth += 1;
            too_many_markers = self.max_local_marker_depth > 0
                && record.local_marker_depth > self.max_local_marker_depth;
        }

        if !self.producer.is_capturing() || too_many_markers {
            return;
        }

        let (device, slot) =
            self.record_timestamp(command_buffer, vk::PipelineStageFlags::TOP_OF_PIPE);
        self.commit_slot(command_buffer, device, slot, |record| {
            if let Some(marker) = record.markers.last_mut() {
                marker.slot = Some(slot);
            }
        });
    }

    pub fn mark_debug_marker_end(&self, command_buffer: vk::CommandBuffer) {
        let too_many_markers;
        {
            let mut guard = self.state.write();
            let record = state_of_mut(&mut guard, command_buffer);
            record.markers.push(Marker {
                kind: MarkerKind::End,
                slot: None,
                text: None,
                color: None,
            });
            too_many_markers = self.max_local_marker_depth > 0
                && record.local_marker_depth > self.max_local_marker_depth;
            // More ends than begins can show up here, the matching begin
            // may live on an earlier command buffer.
            if record.local_marker_depth != 0 {
                record.local_marker_depth -= 1;
            }
        }

        if !self.producer.is_capturing() || too_many_markers {
            return;
        }

        let (device, slot) =
            self.record_timestamp(command_buffer, vk::PipelineStageFlags::BOTTOM_OF_PIPE);
        self.commit_slot(command_buffer, device, slot, |record| {
            if let Some(marker) = record.markers.last_mut() {
                marker.slot = Some(slot);
            }
        });
    }

    /// Drops the recording state of a command buffer that is being reset
    /// (or freed) before submission. Its slots were handed out but the GPU
    /// will never execute the writes, so they are rolled back, not reset.
    pub fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) {
        let (device, slots) = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let Some(record) = state.command_buffer_to_state.remove(&command_buffer) else {
                return;
            };
            let device = *state
                .command_buffer_to_device
                .get(&command_buffer)
                .unwrap_or_else(|| panic!("command buffer {command_buffer:?} is not tracked"));
            let mut slots = Vec::new();
            record.collect_slots(&mut slots);
            (device, slots)
        };
        self.query_pool.rollback_slots(device, &slots);
    }

    pub fn reset_command_pool(&self, pool: vk::CommandPool) {
        let command_buffers: Vec<vk::CommandBuffer> = {
            let state = self.state.read();
            match state.pool_to_command_buffers.get(&pool) {
                Some(associated) => associated.iter().copied().collect(),
                None => return,
            }
        };
        for command_buffer in command_buffers {
            self.reset_command_buffer(command_buffer);
        }
    }

    /// Called right before the driver's `vkQueueSubmit`. Returns the CPU
    /// timestamp only while capturing; `post_submission` reads the
    /// absence as "capture was off at pre time" and takes the clean-up
    /// path even if capture has started since.
    pub fn pre_submission(&self) -> Option<u64> {
        if !self.producer.is_capturing() {
            // The post-submission routine takes care of slot clean-up.
            return None;
        }
        Some(monotonic_timestamp_ns())
    }

    /// Called right after the driver's `vkQueueSubmit`. Command buffer
    /// handles become reusable after this, so everything worth keeping is
    /// snapshotted into the queue's submission ledger here.
    pub fn post_submission(
        &self,
        queue: vk::Queue,
        submits: &[SubmitInfo],
        pre_submit_timestamp: Option<u64>,
    ) {
        // Capture may have flipped since the pre call. Nothing to report
        // then, but slots that were already handed out must still be
        // reclaimed. Reset rather than rollback: the pre path may have
        // issued a GPU write before capture turned off.
        let pre_submission_cpu_timestamp = match pre_submit_timestamp {
            Some(timestamp) if self.producer.is_capturing() => timestamp,
            _ => {
                self.reclaim_submitted_slots(submits);
                return;
            }
        };

        let meta = MetaInfo {
            thread_id: current_thread_id(),
            pre_submission_cpu_timestamp,
            post_submission_cpu_timestamp: monotonic_timestamp_ns(),
        };

        let mut guard = self.state.write();
        let state = &mut *guard;
        let markers = state.queue_to_markers.entry(queue).or_default();

        let mut submission = QueueSubmission {
            id: NEXT_SUBMISSION_ID.fetch_add(1, Ordering::Relaxed),
            meta,
            submit_infos: Vec::with_capacity(submits.len()),
            completed_markers: Vec::new(),
            discarded_slots: Vec::new(),
            num_begin_markers: 0,
        };

        for submit in submits {
            let mut submitted = SubmittedSubmitInfo::default();
            for &command_buffer in &submit.command_buffers {
                let record = state
                    .command_buffer_to_state
                    .remove(&command_buffer)
                    .unwrap_or_else(|| {
                        panic!("command buffer {command_buffer:?} submitted without recording state")
                    });

                for marker in record.markers {
                    let submitted_marker = marker.slot.map(|slot| SubmittedMarker { meta, slot });
                    match marker.kind {
                        MarkerKind::Begin => {
                            if submitted_marker.is_some() {
                                submission.num_begin_markers += 1;
                            }
                            let text = marker
                                .text
                                .unwrap_or_else(|| panic!("begin marker without text"));
                            markers.marker_stack.push(MarkerState {
                                begin_info: submitted_marker,
                                end_info: None,
                                text,
                                color: marker.color.unwrap_or_default(),
                                depth: markers.marker_stack.len() as u32,
                            });
                        }
                        MarkerKind::End => match markers.marker_stack.pop() {
                            Some(mut open) => {
                                if let Some(submitted_marker) = submitted_marker {
                                    open.end_info = Some(submitted_marker);
                                    submission.completed_markers.push(open);
                                } else {
                                    // End not captured: the structure is
                                    // closed without an event, but a begin
                                    // timestamp may already be in flight
                                    // on the GPU and its slot has to be
                                    // reclaimed at harvest.
                                    if let Some(begin_info) = open.begin_info {
                                        submission.discarded_slots.push(begin_info.slot);
                                    }
                                }
                            }
                            None => {
                                // The matching begin was recorded on a
                                // command buffer that never reached
                                // submission (reset first, or the app is
                                // unbalanced). Emit the end on its own so
                                // the slot still reaches the reclaim
                                // batch.
                                if let Some(submitted_marker) = submitted_marker {
                                    submission.completed_markers.push(MarkerState {
                                        begin_info: None,
                                        end_info: Some(submitted_marker),
                                        text: String::new(),
                                        color: Color::default(),
                                        depth: 0,
                                    });
                                }
                            }
                        },
                    }
                }

                submitted.command_buffers.push(SubmittedCommandBuffer {
                    begin_slot: record.begin_slot,
                    end_slot: record.end_slot.unwrap_or_else(|| {
                        panic!("command buffer {command_buffer:?} submitted without an end timestamp")
                    }),
                });
            }
            submission.submit_infos.push(submitted);
        }

        state
            .queue_to_submissions
            .entry(queue)
            .or_default()
            .push_back(submission);
    }

    /// Called from the present hook. Pulls every submission whose last
    /// timestamp has landed, emits one event per submission and returns
    /// all their slots to the pool.
    pub fn complete_submits(&self, device: vk::Device) {
        let query_pool = self.query_pool.query_pool(device);
        let completed = self.pull_completed_submissions(device, query_pool);
        if completed.is_empty() {
            return;
        }

        let physical_device = self.device_manager.physical_device_of(device);
        let timestamp_period = self
            .device_manager
            .properties_of(physical_device)
            .limits
            .timestamp_period;

        let mut slots_to_reset: Vec<u32> = Vec::new();
        for submission in completed {
            let mut event = GpuQueueSubmission {
                meta_info: meta_info_event(submission.meta),
                submit_infos: Vec::with_capacity(submission.submit_infos.len()),
                completed_markers: Vec::new(),
                num_begin_markers: submission.num_begin_markers,
            };

            for submit_info in &submission.submit_infos {
                let mut submit_event = GpuSubmitInfo::default();
                for command_buffer in &submit_info.command_buffers {
                    let begin_gpu_timestamp_ns = command_buffer.begin_slot.map(|slot| {
                        slots_to_reset.push(slot);
                        self.query_gpu_timestamp_ns(device, query_pool, slot, timestamp_period)
                    });
                    slots_to_reset.push(command_buffer.end_slot);
                    let end_gpu_timestamp_ns = self.query_gpu_timestamp_ns(
                        device,
                        query_pool,
                        command_buffer.end_slot,
                        timestamp_period,
                    );
                    submit_event.command_buffers.push(GpuCommandBuffer {
                        begin_gpu_timestamp_ns,
                        end_gpu_timestamp_ns,
                    });
                }
                event.submit_infos.push(submit_event);
            }

            for marker in &submission.completed_markers {
                let end_info = marker
                    .end_info
                    .as_ref()
                    .unwrap_or_else(|| panic!("completed marker without end info"));
                slots_to_reset.push(end_info.slot);
                let end_gpu_timestamp_ns =
                    self.query_gpu_timestamp_ns(device, query_pool, end_info.slot, timestamp_period);

                let begin_marker = marker.begin_info.as_ref().map(|begin_info| {
                    slots_to_reset.push(begin_info.slot);
                    GpuDebugMarkerBeginInfo {
                        meta_info: meta_info_event(begin_info.meta),
                        gpu_timestamp_ns: self.query_gpu_timestamp_ns(
                            device,
                            query_pool,
                            begin_info.slot,
                            timestamp_period,
                        ),
                    }
                });

                event.completed_markers.push(GpuDebugMarker {
                    text_key: self.producer.intern_string(&marker.text),
                    color: (!marker.color.is_unset()).then(|| MarkerColor {
                        red: marker.color.red,
                        green: marker.color.green,
                        blue: marker.color.blue,
                        alpha: marker.color.alpha,
                    }),
                    depth: marker.depth,
                    end_gpu_timestamp_ns,
                    begin_marker,
                });
            }

            slots_to_reset.extend_from_slice(&submission.discarded_slots);

            debug!(
                submit_infos = event.submit_infos.len(),
                completed_markers = event.completed_markers.len(),
                "emitting queue submission"
            );
            self.producer
                .enqueue_capture_event(CaptureEvent::GpuQueueSubmission(event));
        }

        self.query_pool.reset_slots(device, &slots_to_reset);
    }

    /// Allocates a slot and plants a timestamp write; caller must commit
    /// the slot into the recording state (or roll it back) afterwards.
    /// Lock is dropped before calling into the driver.
    fn record_timestamp(
        &self,
        command_buffer: vk::CommandBuffer,
        stage: vk::PipelineStageFlags,
    ) -> (vk::Device, u32) {
        let device = {
            let state = self.state.read();
            *state
                .command_buffer_to_device
                .get(&command_buffer)
                .unwrap_or_else(|| panic!("command buffer {command_buffer:?} is not tracked"))
        };

        let query_pool = self.query_pool.query_pool(device);
        let slot = self
            .query_pool
            .next_ready_slot(device)
            .unwrap_or_else(|| panic!("timer query pool exhausted for device {device:?}"));
        self.dispatch
            .cmd_write_timestamp(command_buffer, stage, query_pool, slot);
        (device, slot)
    }

    /// Re-acquires the lock after a driver call and stores the slot in the
    /// recording state. If the state vanished in between (a racing reset
    /// on a misbehaving app), the slot is rolled back instead of leaking.
    fn commit_slot<F>(&self, command_buffer: vk::CommandBuffer, device: vk::Device, slot: u32, apply: F)
    where
        F: FnOnce(&mut CommandBufferState),
    {
        {
            let mut state = self.state.write();
            if let Some(record) = state.command_buffer_to_state.get_mut(&command_buffer) {
                apply(record);
                return;
            }
        }
        warn!(
            ?command_buffer,
            slot, "recording state vanished before timestamp commit, rolling slot back"
        );
        self.query_pool.rollback_slots(device, &[slot]);
    }

    /// The clean-up half of `post_submission`: drop the recording state of
    /// every referenced command buffer and reset its slots.
    fn reclaim_submitted_slots(&self, submits: &[SubmitInfo]) {
        {
            let state = self.state.read();
            if state.command_buffer_to_state.is_empty() {
                return;
            }
        }

        let mut reset_slots: Vec<u32> = Vec::new();
        let mut device: Option<vk::Device> = None;
        {
            let mut guard = self.state.write();
            let state = &mut *guard;
            for submit in submits {
                for &command_buffer in &submit.command_buffers {
                    if device.is_none() {
                        device = Some(
                            *state
                                .command_buffer_to_device
                                .get(&command_buffer)
                                .unwrap_or_else(|| {
                                    panic!("command buffer {command_buffer:?} is not tracked")
                                }),
                        );
                    }
                    let Some(record) = state.command_buffer_to_state.remove(&command_buffer) else {
                        continue;
                    };
                    record.collect_slots(&mut reset_slots);
                }
            }
        }

        // TODO: a submission mixing command buffers from several devices
        // resets every slot on the first command buffer's device only.
        if let Some(device) = device {
            if !reset_slots.is_empty() {
                self.query_pool.reset_slots(device, &reset_slots);
            }
        }
    }

    /// Removes and returns the completed prefix of every queue's ledger.
    ///
    /// Probing the GPU happens with no lock held: snapshot the probe
    /// candidates under the read lock, probe, then re-take the write lock
    /// and re-validate by submission id (a present on another thread may
    /// have harvested some of them in the meantime).
    fn pull_completed_submissions(
        &self,
        device: vk::Device,
        query_pool: vk::QueryPool,
    ) -> Vec<QueueSubmission> {
        // (queue, [(submission id, end slot to probe; None = no command
        // buffers at all)]), in ledger order.
        let snapshots: Vec<(vk::Queue, Vec<(u64, Option<u32>)>)> = {
            let state = self.state.read();
            state
                .queue_to_submissions
                .iter()
                .filter(|(_, submissions)| !submissions.is_empty())
                .map(|(&queue, submissions)| {
                    let entries = submissions
                        .iter()
                        .map(|submission| (submission.id, submission.last_end_slot()))
                        .collect();
                    (queue, entries)
                })
                .collect()
        };

        let mut ready: HashSet<u64> = HashSet::new();
        for (_, entries) in &snapshots {
            for &(id, end_slot) in entries {
                match end_slot {
                    // Nothing to wait for.
                    None => {
                        ready.insert(id);
                    }
                    Some(slot) => {
                        let mut result = [0u64; 1];
                        let status = self.dispatch.get_query_pool_results(
                            device,
                            query_pool,
                            slot,
                            &mut result,
                            vk::QueryResultFlags::TYPE_64,
                        );
                        if status == vk::Result::SUCCESS {
                            ready.insert(id);
                        } else {
                            // Waiting in ledger order keeps the event
                            // stream monotonic per queue, even where the
                            // GPU would let later submissions finish
                            // first.
                            break;
                        }
                    }
                }
            }
        }

        let mut completed = Vec::new();
        {
            let mut state = self.state.write();
            for (queue, entries) in &snapshots {
                let Some(submissions) = state.queue_to_submissions.get_mut(queue) else {
                    continue;
                };
                for &(id, end_slot) in entries {
                    if !ready.contains(&id) {
                        break;
                    }
                    let at_front = submissions
                        .front()
                        .is_some_and(|submission| submission.id == id);
                    if !at_front {
                        // A racing harvester already pulled it.
                        continue;
                    }
                    let submission = submissions.pop_front();
                    if end_slot.is_some() {
                        completed.extend(submission);
                    }
                    // Submissions without command buffers are dropped
                    // without an event; there is nothing to report.
                }
            }
        }

        completed
    }

    /// Reads one timestamp slot and converts GPU ticks to nanoseconds.
    /// Only called for submissions whose last slot already read back, so
    /// anything but success here is a driver contract violation.
    fn query_gpu_timestamp_ns(
        &self,
        device: vk::Device,
        query_pool: vk::QueryPool,
        slot: u32,
        timestamp_period: f32,
    ) -> u64 {
        let mut ticks = [0u64; 1];
        let result = self.dispatch.get_query_pool_results(
            device,
            query_pool,
            slot,
            &mut ticks,
            vk::QueryResultFlags::TYPE_64,
        );
        assert_eq!(
            result,
            vk::Result::SUCCESS,
            "timestamp slot {slot} unreadable after its submission completed"
        );
        (ticks[0] as f64 * timestamp_period as f64) as u64
    }
}

fn state_of_mut(
    state: &mut TrackerState,
    command_buffer: vk::CommandBuffer,
) -> &mut CommandBufferState {
    state
        .command_buffer_to_state
        .get_mut(&command_buffer)
        .unwrap_or_else(|| panic!("command buffer {command_buffer:?} has no recording state"))
}

fn meta_info_event(meta: MetaInfo) -> SubmissionMetaInfo {
    SubmissionMetaInfo {
        tid: meta.thread_id,
        pre_submission_cpu_timestamp: meta.pre_submission_cpu_timestamp,
        post_submission_cpu_timestamp: meta.post_submission_cpu_timestamp,
    }
}
