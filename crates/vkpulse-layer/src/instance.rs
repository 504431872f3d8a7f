//! Instance and device life-cycle hooks.
//!
//! Create calls walk the loader's layer-link chain to find the next
//! link's GetProcAddr, advance the chain for the layers below, forward
//! the call, and then wire up dispatch tables and per-device state.

use std::ffi::{c_char, c_void, CStr};
use std::mem;
use std::ptr;

use ash::vk;
use tracing::{info, warn};

use crate::dispatch::dispatch_key;
use crate::layer;

pub const LAYER_NAME: &CStr = c"VK_LAYER_VKPULSE_profiler";
pub const LAYER_DESCRIPTION: &CStr = c"vkpulse GPU submission profiler";

/// `VkLayerFunction` value selecting the layer-link union member.
const LAYER_LINK_INFO: i32 = 0;

// The loader's layer negotiation structs live in vk_layer.h, which ash
// does not cover; declared by hand. Every member of the original union is
// pointer-sized, so only the link member is spelled out.

#[repr(C)]
pub struct LayerInstanceLink {
    pub p_next: *mut LayerInstanceLink,
    pub next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub next_get_physical_device_proc_addr: Option<unsafe extern "system" fn()>,
}

#[repr(C)]
pub struct LayerInstanceCreateInfo {
    pub s_type: vk::StructureType,
    pub p_next: *const c_void,
    pub function: i32,
    pub layer_info: *mut LayerInstanceLink,
}

#[repr(C)]
pub struct LayerDeviceLink {
    pub p_next: *mut LayerDeviceLink,
    pub next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub next_get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
}

#[repr(C)]
pub struct LayerDeviceCreateInfo {
    pub s_type: vk::StructureType,
    pub p_next: *const c_void,
    pub function: i32,
    pub layer_info: *mut LayerDeviceLink,
}

unsafe fn find_layer_instance_create_info(
    create_info: &vk::InstanceCreateInfo<'_>,
) -> *mut LayerInstanceCreateInfo {
    let mut chain = create_info.p_next as *mut LayerInstanceCreateInfo;
    while !chain.is_null() {
        let entry = &*chain;
        if entry.s_type == vk::StructureType::LOADER_INSTANCE_CREATE_INFO
            && entry.function == LAYER_LINK_INFO
        {
            return chain;
        }
        chain = entry.p_next as *mut LayerInstanceCreateInfo;
    }
    ptr::null_mut()
}

unsafe fn find_layer_device_create_info(
    create_info: &vk::DeviceCreateInfo<'_>,
) -> *mut LayerDeviceCreateInfo {
    let mut chain = create_info.p_next as *mut LayerDeviceCreateInfo;
    while !chain.is_null() {
        let entry = &*chain;
        if entry.s_type == vk::StructureType::LOADER_DEVICE_CREATE_INFO
            && entry.function == LAYER_LINK_INFO
        {
            return chain;
        }
        chain = entry.p_next as *mut LayerDeviceCreateInfo;
    }
    ptr::null_mut()
}

#[no_mangle]
pub unsafe extern "system" fn vkCreateInstance(
    p_create_info: *const vk::InstanceCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_instance: *mut vk::Instance,
) -> vk::Result {
    if p_create_info.is_null() || p_instance.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }

    let chain = find_layer_instance_create_info(&*p_create_info);
    if chain.is_null() || (*chain).layer_info.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    let link = (*chain).layer_info;
    let next_gipa = (*link).next_get_instance_proc_addr;
    // Advance the chain for the layers below us.
    (*chain).layer_info = (*link).p_next;

    let create_instance: vk::PFN_vkCreateInstance =
        match next_gipa(vk::Instance::null(), c"vkCreateInstance".as_ptr()) {
            Some(function) => mem::transmute(function),
            None => return vk::Result::ERROR_INITIALIZATION_FAILED,
        };
    let result = create_instance(p_create_info, p_allocator, p_instance);
    if result != vk::Result::SUCCESS {
        return result;
    }

    let state = layer();
    state.dispatch.create_instance_dispatch(*p_instance, next_gipa);
    state.ensure_producer();
    info!("instance created");
    result
}

#[no_mangle]
pub unsafe extern "system" fn vkDestroyInstance(
    instance: vk::Instance,
    p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    if instance == vk::Instance::null() {
        return;
    }
    let state = layer();
    let fns = state.dispatch.instance_dispatch(dispatch_key(instance));
    state.dispatch.remove_instance_dispatch(instance);
    (fns.core.destroy_instance)(instance, p_allocator);

    // TODO: take the producer down only when the last instance goes away.
    state.producer.take_down();
    info!("instance destroyed");
}

#[no_mangle]
pub unsafe extern "system" fn vkCreateDevice(
    physical_device: vk::PhysicalDevice,
    p_create_info: *const vk::DeviceCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_device: *mut vk::Device,
) -> vk::Result {
    if p_create_info.is_null() || p_device.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }

    let chain = find_layer_device_create_info(&*p_create_info);
    if chain.is_null() || (*chain).layer_info.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    let link = (*chain).layer_info;
    let next_gipa = (*link).next_get_instance_proc_addr;
    let next_gdpa = (*link).next_get_device_proc_addr;
    (*chain).layer_info = (*link).p_next;

    let create_device: vk::PFN_vkCreateDevice =
        match next_gipa(vk::Instance::null(), c"vkCreateDevice".as_ptr()) {
            Some(function) => mem::transmute(function),
            None => return vk::Result::ERROR_INITIALIZATION_FAILED,
        };
    let result = create_device(physical_device, p_create_info, p_allocator, p_device);
    if result != vk::Result::SUCCESS {
        return result;
    }
    let device = *p_device;

    let state = layer();
    state.dispatch.create_device_dispatch(device, next_gdpa);

    // Physical-device properties are cached now; the harvest path needs
    // limits.timestamp_period without extra driver round trips.
    let instance_fns = state
        .dispatch
        .instance_dispatch(dispatch_key(physical_device));
    let mut properties = vk::PhysicalDeviceProperties::default();
    (instance_fns.core.get_physical_device_properties)(physical_device, &mut properties);
    if properties.limits.timestamp_period <= 0.0 {
        warn!(?physical_device, "device reports no timestamp support");
    }
    state
        .device_manager
        .track_logical_device(physical_device, device, properties);
    state.query_pool.initialize(device);
    info!(?device, "device created");
    result
}

#[no_mangle]
pub unsafe extern "system" fn vkDestroyDevice(
    device: vk::Device,
    p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    if device == vk::Device::null() {
        return;
    }
    let state = layer();
    let fns = state.dispatch.device_dispatch(dispatch_key(device));
    state.query_pool.destroy(device);
    state.device_manager.untrack_logical_device(device);
    state.dispatch.remove_device_dispatch(device);
    (fns.core.destroy_device)(device, p_allocator);
    info!(?device, "device destroyed");
}

fn write_cstr(dst: &mut [c_char], text: &CStr) {
    for (slot, &byte) in dst.iter_mut().zip(text.to_bytes_with_nul()) {
        *slot = byte as c_char;
    }
}

unsafe fn write_layer_properties(
    p_property_count: *mut u32,
    p_properties: *mut vk::LayerProperties,
) -> vk::Result {
    if p_property_count.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    if p_properties.is_null() {
        *p_property_count = 1;
        return vk::Result::SUCCESS;
    }
    if *p_property_count < 1 {
        return vk::Result::INCOMPLETE;
    }
    let properties = &mut *p_properties;
    *properties = vk::LayerProperties::default();
    write_cstr(&mut properties.layer_name, LAYER_NAME);
    write_cstr(&mut properties.description, LAYER_DESCRIPTION);
    properties.spec_version = vk::make_api_version(0, 1, 1, 0);
    properties.implementation_version = 1;
    *p_property_count = 1;
    vk::Result::SUCCESS
}

#[no_mangle]
pub unsafe extern "system" fn vkEnumerateInstanceLayerProperties(
    p_property_count: *mut u32,
    p_properties: *mut vk::LayerProperties,
) -> vk::Result {
    write_layer_properties(p_property_count, p_properties)
}

#[no_mangle]
pub unsafe extern "system" fn vkEnumerateDeviceLayerProperties(
    _physical_device: vk::PhysicalDevice,
    p_property_count: *mut u32,
    p_properties: *mut vk::LayerProperties,
) -> vk::Result {
    write_layer_properties(p_property_count, p_properties)
}
