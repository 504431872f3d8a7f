//! Dispatch tables for the next layer down the chain.
//!
//! The loader hands this layer the next link's GetProcAddr during
//! create-instance/create-device; everything the layer forwards is
//! resolved once into ash function tables here. Tables are keyed by the
//! loader's dispatch key: the pointer the loader writes into the first
//! word of every dispatchable handle, shared between a device and its
//! queues and command buffers.

use std::ffi::{c_void, CStr};
use std::mem;
use std::ptr;
use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use dashmap::DashMap;

use crate::query_pool::PoolDispatch;
use crate::submission_tracker::TimestampDispatch;

/// Loader dispatch key of a dispatchable handle.
pub fn dispatch_key<T: Handle>(handle: T) -> usize {
    unsafe { *(handle.as_raw() as *const usize) }
}

pub struct InstanceDispatch {
    pub get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub core: ash::InstanceFnV1_0,
}

pub struct DeviceDispatch {
    pub get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
    pub core: ash::DeviceFnV1_0,
    pub core_1_1: ash::DeviceFnV1_1,
    pub swapchain: ash::khr::swapchain::DeviceFn,
    pub debug_utils: ash::ext::debug_utils::DeviceFn,
    pub debug_marker: ash::ext::debug_marker::DeviceFn,
    pub host_query_reset: ash::ext::host_query_reset::DeviceFn,
    pub debug_utils_enabled: bool,
    pub debug_marker_enabled: bool,
}

#[derive(Default)]
pub struct DispatchTable {
    instances: DashMap<usize, Arc<InstanceDispatch>>,
    devices: DashMap<usize, Arc<DeviceDispatch>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_instance_dispatch(
        &self,
        instance: vk::Instance,
        get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    ) {
        let load = move |name: &CStr| -> *const c_void {
            match unsafe { get_instance_proc_addr(instance, name.as_ptr()) } {
                Some(function) => function as *const c_void,
                None => ptr::null(),
            }
        };
        let core = ash::InstanceFnV1_0::load(load);
        self.instances.insert(
            dispatch_key(instance),
            Arc::new(InstanceDispatch {
                get_instance_proc_addr,
                core,
            }),
        );
    }

    pub fn remove_instance_dispatch(&self, instance: vk::Instance) {
        self.instances.remove(&dispatch_key(instance));
    }

    pub fn create_device_dispatch(
        &self,
        device: vk::Device,
        get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
    ) {
        let resolve = move |name: &CStr| -> vk::PFN_vkVoidFunction {
            unsafe { get_device_proc_addr(device, name.as_ptr()) }
        };
        let load = move |name: &CStr| -> *const c_void {
            match resolve(name) {
                Some(function) => function as *const c_void,
                None => ptr::null(),
            }
        };

        // Extension support is decided by whether the chain below resolves
        // the extension's entry points for this device.
        let debug_utils_enabled = resolve(c"vkCmdBeginDebugUtilsLabelEXT").is_some();
        let debug_marker_enabled = resolve(c"vkCmdDebugMarkerBeginEXT").is_some();

        self.devices.insert(
            dispatch_key(device),
            Arc::new(DeviceDispatch {
                get_device_proc_addr,
                core: ash::DeviceFnV1_0::load(load),
                core_1_1: ash::DeviceFnV1_1::load(load),
                swapchain: ash::khr::swapchain::DeviceFn::load(load),
                debug_utils: ash::ext::debug_utils::DeviceFn::load(load),
                debug_marker: ash::ext::debug_marker::DeviceFn::load(load),
                host_query_reset: ash::ext::host_query_reset::DeviceFn::load(load),
                debug_utils_enabled,
                debug_marker_enabled,
            }),
        );
    }

    pub fn remove_device_dispatch(&self, device: vk::Device) {
        self.devices.remove(&dispatch_key(device));
    }

    pub fn try_instance_dispatch(&self, key: usize) -> Option<Arc<InstanceDispatch>> {
        self.instances.get(&key).map(|entry| Arc::clone(&entry))
    }

    pub fn instance_dispatch(&self, key: usize) -> Arc<InstanceDispatch> {
        self.try_instance_dispatch(key)
            .unwrap_or_else(|| panic!("no instance dispatch for key {key:#x}"))
    }

    pub fn try_device_dispatch(&self, key: usize) -> Option<Arc<DeviceDispatch>> {
        self.devices.get(&key).map(|entry| Arc::clone(&entry))
    }

    pub fn device_dispatch(&self, key: usize) -> Arc<DeviceDispatch> {
        self.try_device_dispatch(key)
            .unwrap_or_else(|| panic!("no device dispatch for key {key:#x}"))
    }
}

impl TimestampDispatch for DispatchTable {
    fn cmd_write_timestamp(
        &self,
        command_buffer: vk::CommandBuffer,
        stage: vk::PipelineStageFlags,
        query_pool: vk::QueryPool,
        slot: u32,
    ) {
        let fns = self.device_dispatch(dispatch_key(command_buffer));
        unsafe { (fns.core.cmd_write_timestamp)(command_buffer, stage, query_pool, slot) };
    }

    fn get_query_pool_results(
        &self,
        device: vk::Device,
        query_pool: vk::QueryPool,
        first_query: u32,
        results: &mut [u64],
        flags: vk::QueryResultFlags,
    ) -> vk::Result {
        let fns = self.device_dispatch(dispatch_key(device));
        unsafe {
            (fns.core.get_query_pool_results)(
                device,
                query_pool,
                first_query,
                results.len() as u32,
                mem::size_of_val(results),
                results.as_mut_ptr().cast(),
                mem::size_of::<u64>() as vk::DeviceSize,
                flags,
            )
        }
    }
}

impl PoolDispatch for DispatchTable {
    fn create_query_pool(
        &self,
        device: vk::Device,
        create_info: &vk::QueryPoolCreateInfo<'_>,
    ) -> (vk::Result, vk::QueryPool) {
        let fns = self.device_dispatch(dispatch_key(device));
        let mut query_pool = vk::QueryPool::null();
        let result = unsafe {
            (fns.core.create_query_pool)(device, create_info, ptr::null(), &mut query_pool)
        };
        (result, query_pool)
    }

    fn destroy_query_pool(&self, device: vk::Device, query_pool: vk::QueryPool) {
        let fns = self.device_dispatch(dispatch_key(device));
        unsafe { (fns.core.destroy_query_pool)(device, query_pool, ptr::null()) };
    }

    fn reset_query_pool_host(
        &self,
        device: vk::Device,
        query_pool: vk::QueryPool,
        first_query: u32,
        query_count: u32,
    ) {
        let fns = self.device_dispatch(dispatch_key(device));
        unsafe {
            (fns.host_query_reset.reset_query_pool_ext)(device, query_pool, first_query, query_count)
        };
    }
}
