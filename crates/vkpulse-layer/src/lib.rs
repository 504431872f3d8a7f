//! vkpulse Vulkan layer
//!
//! This cdylib implements an implicit Vulkan layer that measures GPU
//! execution time of command buffers and debug markers with timestamp
//! queries and streams the results to an out-of-process profiler over a
//! local socket. The loader resolves the hooked entry points through
//! `vkGetInstanceProcAddr`/`vkGetDeviceProcAddr` below; everything else
//! passes straight through to the next layer.

#![allow(non_snake_case)]

use std::ffi::{c_char, c_void, CStr};
use std::mem;
use std::sync::{Arc, OnceLock};

use ash::vk;
use tracing::warn;

use vkpulse_common::config::{default_config_path, LayerConfig};
use vkpulse_common::platform::default_producer_socket_path;

pub mod command;
pub mod device_manager;
pub mod dispatch;
pub mod instance;
pub mod producer;
pub mod query_pool;
pub mod queue;
pub mod submission_tracker;

use device_manager::DeviceManager;
use dispatch::{dispatch_key, DispatchTable};
use producer::IpcProducer;
use query_pool::TimerQueryPool;
use submission_tracker::SubmissionTracker;

// ── Layer state singleton ───────────────────────────────────

pub struct LayerState {
    pub dispatch: Arc<DispatchTable>,
    pub device_manager: Arc<DeviceManager>,
    pub query_pool: Arc<TimerQueryPool<DispatchTable>>,
    pub producer: Arc<IpcProducer>,
    pub tracker:
        SubmissionTracker<DispatchTable, DeviceManager, TimerQueryPool<DispatchTable>, IpcProducer>,
}

impl LayerState {
    /// Connect to the profiler if we are not already. Failure just means
    /// capture stays off; the application must not notice.
    pub fn ensure_producer(&self) {
        if self.producer.is_connected() {
            return;
        }
        if let Err(error) = self.producer.bring_up() {
            warn!(%error, "profiler unavailable, capture disabled");
        }
    }
}

static LAYER: OnceLock<LayerState> = OnceLock::new();

pub fn layer() -> &'static LayerState {
    LAYER.get_or_init(|| {
        vkpulse_common::logging::init_logging();
        let config = LayerConfig::load_or_default(&default_config_path());

        let dispatch = Arc::new(DispatchTable::new());
        let device_manager = Arc::new(DeviceManager::new());
        let query_pool = Arc::new(TimerQueryPool::new(
            Arc::clone(&dispatch),
            config.query_pool.num_timer_query_slots,
        ));
        let socket_path = config
            .capture
            .socket_path
            .clone()
            .unwrap_or_else(default_producer_socket_path);
        let producer = Arc::new(IpcProducer::new(socket_path));
        let tracker = SubmissionTracker::new(
            config.capture.max_local_marker_depth,
            Arc::clone(&dispatch),
            Arc::clone(&query_pool),
            Arc::clone(&device_manager),
            Arc::clone(&producer),
        );
        LayerState {
            dispatch,
            device_manager,
            query_pool,
            producer,
            tracker,
        }
    })
}

// ── Loader negotiation ──────────────────────────────────────

const LAYER_NEGOTIATE_INTERFACE_STRUCT: i32 = 1;

/// `VkNegotiateLayerInterface` from vk_layer.h.
#[repr(C)]
pub struct NegotiateLayerInterface {
    pub s_type: i32,
    pub p_next: *mut c_void,
    pub loader_layer_interface_version: u32,
    pub pfn_get_instance_proc_addr:
        Option<unsafe extern "system" fn(vk::Instance, *const c_char) -> vk::PFN_vkVoidFunction>,
    pub pfn_get_device_proc_addr:
        Option<unsafe extern "system" fn(vk::Device, *const c_char) -> vk::PFN_vkVoidFunction>,
    pub pfn_get_physical_device_proc_addr: Option<unsafe extern "system" fn()>,
}

#[no_mangle]
pub unsafe extern "system" fn vkNegotiateLoaderLayerInterfaceVersion(
    p_version_struct: *mut NegotiateLayerInterface,
) -> vk::Result {
    if p_version_struct.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    let version_struct = &mut *p_version_struct;
    if version_struct.s_type != LAYER_NEGOTIATE_INTERFACE_STRUCT
        || version_struct.loader_layer_interface_version < 2
    {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    version_struct.loader_layer_interface_version = 2;
    version_struct.pfn_get_instance_proc_addr = Some(vkGetInstanceProcAddr);
    version_struct.pfn_get_device_proc_addr = Some(vkGetDeviceProcAddr);
    version_struct.pfn_get_physical_device_proc_addr = None;
    vk::Result::SUCCESS
}

// ── Entry point resolution ──────────────────────────────────

unsafe fn hooked_function(name: &[u8]) -> vk::PFN_vkVoidFunction {
    match name {
        // ── Proc addr ───────────────────────────────────────
        b"vkGetInstanceProcAddr" => {
            Some(mem::transmute(vkGetInstanceProcAddr as *const ()))
        }
        b"vkGetDeviceProcAddr" => {
            Some(mem::transmute(vkGetDeviceProcAddr as *const ()))
        }

        // ── Instance / device life cycle ────────────────────
        b"vkCreateInstance" => {
            Some(mem::transmute(instance::vkCreateInstance as *const ()))
        }
        b"vkDestroyInstance" => {
            Some(mem::transmute(instance::vkDestroyInstance as *const ()))
        }
        b"vkCreateDevice" => {
            Some(mem::transmute(instance::vkCreateDevice as *const ()))
        }
        b"vkDestroyDevice" => {
            Some(mem::transmute(instance::vkDestroyDevice as *const ()))
        }
        b"vkEnumerateInstanceLayerProperties" => {
            Some(mem::transmute(
                instance::vkEnumerateInstanceLayerProperties as *const (),
            ))
        }
        b"vkEnumerateDeviceLayerProperties" => {
            Some(mem::transmute(
                instance::vkEnumerateDeviceLayerProperties as *const (),
            ))
        }

        // ── Queues ──────────────────────────────────────────
        b"vkGetDeviceQueue" => {
            Some(mem::transmute(queue::vkGetDeviceQueue as *const ()))
        }
        b"vkGetDeviceQueue2" => {
            Some(mem::transmute(queue::vkGetDeviceQueue2 as *const ()))
        }
        b"vkQueueSubmit" => {
            Some(mem::transmute(queue::vkQueueSubmit as *const ()))
        }
        b"vkQueuePresentKHR" => {
            Some(mem::transmute(queue::vkQueuePresentKHR as *const ()))
        }

        // ── Command buffers ─────────────────────────────────
        b"vkAllocateCommandBuffers" => {
            Some(mem::transmute(command::vkAllocateCommandBuffers as *const ()))
        }
        b"vkFreeCommandBuffers" => {
            Some(mem::transmute(command::vkFreeCommandBuffers as *const ()))
        }
        b"vkBeginCommandBuffer" => {
            Some(mem::transmute(command::vkBeginCommandBuffer as *const ()))
        }
        b"vkEndCommandBuffer" => {
            Some(mem::transmute(command::vkEndCommandBuffer as *const ()))
        }
        b"vkResetCommandBuffer" => {
            Some(mem::transmute(command::vkResetCommandBuffer as *const ()))
        }
        b"vkResetCommandPool" => {
            Some(mem::transmute(command::vkResetCommandPool as *const ()))
        }

        // ── Debug markers ───────────────────────────────────
        b"vkCmdDebugMarkerBeginEXT" => {
            Some(mem::transmute(command::vkCmdDebugMarkerBeginEXT as *const ()))
        }
        b"vkCmdDebugMarkerEndEXT" => {
            Some(mem::transmute(command::vkCmdDebugMarkerEndEXT as *const ()))
        }
        b"vkCmdBeginDebugUtilsLabelEXT" => {
            Some(mem::transmute(
                command::vkCmdBeginDebugUtilsLabelEXT as *const (),
            ))
        }
        b"vkCmdEndDebugUtilsLabelEXT" => {
            Some(mem::transmute(
                command::vkCmdEndDebugUtilsLabelEXT as *const (),
            ))
        }

        // ── Not hooked: forward to the next layer ───────────
        _ => None,
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkGetInstanceProcAddr(
    instance: vk::Instance,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    if p_name.is_null() {
        return None;
    }
    let name = CStr::from_ptr(p_name).to_bytes();
    let hooked = hooked_function(name);
    if hooked.is_some() {
        return hooked;
    }
    if instance == vk::Instance::null() {
        return None;
    }
    match layer().dispatch.try_instance_dispatch(dispatch_key(instance)) {
        Some(fns) => (fns.get_instance_proc_addr)(instance, p_name),
        None => None,
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkGetDeviceProcAddr(
    device: vk::Device,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    if p_name.is_null() {
        return None;
    }
    let name = CStr::from_ptr(p_name).to_bytes();
    let hooked = hooked_function(name);
    if hooked.is_some() {
        return hooked;
    }
    if device == vk::Device::null() {
        return None;
    }
    match layer().dispatch.try_device_dispatch(dispatch_key(device)) {
        Some(fns) => (fns.get_device_proc_addr)(device, p_name),
        None => None,
    }
}
