//! Command pool, command buffer, and debug marker hooks.
//!
//! Ordering matters around the driver calls: the begin timestamp goes in
//! after the driver's begin (the command buffer must be recording), the
//! end timestamp before the driver's end (it must land inside the
//! command buffer), and marker timestamps inside the marker region.

use std::ffi::CStr;
use std::slice;

use ash::vk;

use crate::dispatch::dispatch_key;
use crate::layer;
use crate::submission_tracker::Color;

#[no_mangle]
pub unsafe extern "system" fn vkAllocateCommandBuffers(
    device: vk::Device,
    p_allocate_info: *const vk::CommandBufferAllocateInfo<'_>,
    p_command_buffers: *mut vk::CommandBuffer,
) -> vk::Result {
    let state = layer();
    let fns = state.dispatch.device_dispatch(dispatch_key(device));
    let result =
        (fns.core.allocate_command_buffers)(device, p_allocate_info, p_command_buffers);
    if result == vk::Result::SUCCESS && !p_allocate_info.is_null() && !p_command_buffers.is_null()
    {
        let allocate_info = &*p_allocate_info;
        let command_buffers =
            slice::from_raw_parts(p_command_buffers, allocate_info.command_buffer_count as usize);
        state
            .tracker
            .track_command_buffers(device, allocate_info.command_pool, command_buffers);
    }
    result
}

#[no_mangle]
pub unsafe extern "system" fn vkFreeCommandBuffers(
    device: vk::Device,
    command_pool: vk::CommandPool,
    command_buffer_count: u32,
    p_command_buffers: *const vk::CommandBuffer,
) {
    let state = layer();
    if !p_command_buffers.is_null() && command_buffer_count > 0 {
        let command_buffers: Vec<vk::CommandBuffer> =
            slice::from_raw_parts(p_command_buffers, command_buffer_count as usize)
                .iter()
                .copied()
                .filter(|&command_buffer| command_buffer != vk::CommandBuffer::null())
                .collect();
        // A freed command buffer may still hold recording state with live
        // slots; those roll back before the handle is forgotten.
        for &command_buffer in &command_buffers {
            state.tracker.reset_command_buffer(command_buffer);
        }
        state
            .tracker
            .untrack_command_buffers(device, command_pool, &command_buffers);
    }
    let fns = state.dispatch.device_dispatch(dispatch_key(device));
    (fns.core.free_command_buffers)(device, command_pool, command_buffer_count, p_command_buffers);
}

#[no_mangle]
pub unsafe extern "system" fn vkBeginCommandBuffer(
    command_buffer: vk::CommandBuffer,
    p_begin_info: *const vk::CommandBufferBeginInfo<'_>,
) -> vk::Result {
    let state = layer();
    let fns = state.dispatch.device_dispatch(dispatch_key(command_buffer));
    let result = (fns.core.begin_command_buffer)(command_buffer, p_begin_info);
    if result == vk::Result::SUCCESS {
        state.tracker.mark_command_buffer_begin(command_buffer);
    }
    result
}

#[no_mangle]
pub unsafe extern "system" fn vkEndCommandBuffer(command_buffer: vk::CommandBuffer) -> vk::Result {
    let state = layer();
    state.tracker.mark_command_buffer_end(command_buffer);
    let fns = state.dispatch.device_dispatch(dispatch_key(command_buffer));
    (fns.core.end_command_buffer)(command_buffer)
}

#[no_mangle]
pub unsafe extern "system" fn vkResetCommandBuffer(
    command_buffer: vk::CommandBuffer,
    flags: vk::CommandBufferResetFlags,
) -> vk::Result {
    let state = layer();
    state.tracker.reset_command_buffer(command_buffer);
    let fns = state.dispatch.device_dispatch(dispatch_key(command_buffer));
    (fns.core.reset_command_buffer)(command_buffer, flags)
}

#[no_mangle]
pub unsafe extern "system" fn vkResetCommandPool(
    device: vk::Device,
    command_pool: vk::CommandPool,
    flags: vk::CommandPoolResetFlags,
) -> vk::Result {
    let state = layer();
    let fns = state.dispatch.device_dispatch(dispatch_key(device));
    let result = (fns.core.reset_command_pool)(device, command_pool, flags);
    if result == vk::Result::SUCCESS {
        state.tracker.reset_command_pool(command_pool);
    }
    result
}

// ── Debug markers ───────────────────────────────────────────
//
// Both marker extensions feed the same tracker operations; forwarding to
// the driver is gated on the extension actually resolving below us.

unsafe fn marker_text(p_text: *const std::ffi::c_char) -> String {
    if p_text.is_null() {
        return String::new();
    }
    CStr::from_ptr(p_text).to_string_lossy().into_owned()
}

fn marker_color(color: [f32; 4]) -> Color {
    Color {
        red: color[0],
        green: color[1],
        blue: color[2],
        alpha: color[3],
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkCmdDebugMarkerBeginEXT(
    command_buffer: vk::CommandBuffer,
    p_marker_info: *const vk::DebugMarkerMarkerInfoEXT<'_>,
) {
    let state = layer();
    let fns = state.dispatch.device_dispatch(dispatch_key(command_buffer));
    if fns.debug_marker_enabled {
        (fns.debug_marker.cmd_debug_marker_begin_ext)(command_buffer, p_marker_info);
    }
    if p_marker_info.is_null() {
        return;
    }
    let marker_info = &*p_marker_info;
    let text = marker_text(marker_info.p_marker_name);
    state
        .tracker
        .mark_debug_marker_begin(command_buffer, &text, marker_color(marker_info.color));
}

#[no_mangle]
pub unsafe extern "system" fn vkCmdDebugMarkerEndEXT(command_buffer: vk::CommandBuffer) {
    let state = layer();
    state.tracker.mark_debug_marker_end(command_buffer);
    let fns = state.dispatch.device_dispatch(dispatch_key(command_buffer));
    if fns.debug_marker_enabled {
        (fns.debug_marker.cmd_debug_marker_end_ext)(command_buffer);
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkCmdBeginDebugUtilsLabelEXT(
    command_buffer: vk::CommandBuffer,
    p_label_info: *const vk::DebugUtilsLabelEXT<'_>,
) {
    let state = layer();
    let fns = state.dispatch.device_dispatch(dispatch_key(command_buffer));
    if fns.debug_utils_enabled {
        (fns.debug_utils.cmd_begin_debug_utils_label_ext)(command_buffer, p_label_info);
    }
    if p_label_info.is_null() {
        return;
    }
    let label_info = &*p_label_info;
    let text = marker_text(label_info.p_label_name);
    state
        .tracker
        .mark_debug_marker_begin(command_buffer, &text, marker_color(label_info.color));
}

#[no_mangle]
pub unsafe extern "system" fn vkCmdEndDebugUtilsLabelEXT(command_buffer: vk::CommandBuffer) {
    let state = layer();
    state.tracker.mark_debug_marker_end(command_buffer);
    let fns = state.dispatch.device_dispatch(dispatch_key(command_buffer));
    if fns.debug_utils_enabled {
        (fns.debug_utils.cmd_end_debug_utils_label_ext)(command_buffer);
    }
}
