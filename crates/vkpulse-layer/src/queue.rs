//! Queue hooks: submission bracketing and the present-driven harvest.

use std::slice;

use ash::vk;

use crate::dispatch::dispatch_key;
use crate::layer;
use crate::submission_tracker;

#[no_mangle]
pub unsafe extern "system" fn vkGetDeviceQueue(
    device: vk::Device,
    queue_family_index: u32,
    queue_index: u32,
    p_queue: *mut vk::Queue,
) {
    let state = layer();
    let fns = state.dispatch.device_dispatch(dispatch_key(device));
    (fns.core.get_device_queue)(device, queue_family_index, queue_index, p_queue);
    if !p_queue.is_null() && *p_queue != vk::Queue::null() {
        state.device_manager.track_queue(*p_queue, device);
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkGetDeviceQueue2(
    device: vk::Device,
    p_queue_info: *const vk::DeviceQueueInfo2<'_>,
    p_queue: *mut vk::Queue,
) {
    let state = layer();
    let fns = state.dispatch.device_dispatch(dispatch_key(device));
    (fns.core_1_1.get_device_queue2)(device, p_queue_info, p_queue);
    if !p_queue.is_null() && *p_queue != vk::Queue::null() {
        state.device_manager.track_queue(*p_queue, device);
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkQueueSubmit(
    queue: vk::Queue,
    submit_count: u32,
    p_submits: *const vk::SubmitInfo<'_>,
    fence: vk::Fence,
) -> vk::Result {
    let state = layer();
    let pre_submit_timestamp = state.tracker.pre_submission();

    let fns = state.dispatch.device_dispatch(dispatch_key(queue));
    let result = (fns.core.queue_submit)(queue, submit_count, p_submits, fence);

    let submits = collect_submit_infos(submit_count, p_submits);
    state
        .tracker
        .post_submission(queue, &submits, pre_submit_timestamp);
    result
}

#[no_mangle]
pub unsafe extern "system" fn vkQueuePresentKHR(
    queue: vk::Queue,
    p_present_info: *const vk::PresentInfoKHR<'_>,
) -> vk::Result {
    let state = layer();
    let fns = state.dispatch.device_dispatch(dispatch_key(queue));
    let result = (fns.swapchain.queue_present_khr)(queue, p_present_info);

    // Present is the heartbeat: poll for submissions whose timestamps
    // have landed and ship them out.
    let device = state.device_manager.device_of_queue(queue);
    state.tracker.complete_submits(device);
    result
}

unsafe fn collect_submit_infos(
    submit_count: u32,
    p_submits: *const vk::SubmitInfo<'_>,
) -> Vec<submission_tracker::SubmitInfo> {
    if p_submits.is_null() {
        return Vec::new();
    }
    slice::from_raw_parts(p_submits, submit_count as usize)
        .iter()
        .map(|submit_info| {
            let command_buffers = if submit_info.p_command_buffers.is_null() {
                Vec::new()
            } else {
                slice::from_raw_parts(
                    submit_info.p_command_buffers,
                    submit_info.command_buffer_count as usize,
                )
                .to_vec()
            };
            submission_tracker::SubmitInfo { command_buffers }
        })
        .collect()
}
