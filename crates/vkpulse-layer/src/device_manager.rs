//! Logical-to-physical device bookkeeping.
//!
//! Physical-device properties are cached at device creation; the tracker
//! only ever asks for `limits.timestamp_period`. Queues are mapped back
//! to their owning device so the present hook knows which ledger to
//! harvest.

use ash::vk;
use dashmap::DashMap;

use crate::submission_tracker::DeviceProperties;

#[derive(Default)]
pub struct DeviceManager {
    device_to_physical: DashMap<vk::Device, vk::PhysicalDevice>,
    physical_to_properties: DashMap<vk::PhysicalDevice, vk::PhysicalDeviceProperties>,
    queue_to_device: DashMap<vk::Queue, vk::Device>,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track_logical_device(
        &self,
        physical_device: vk::PhysicalDevice,
        device: vk::Device,
        properties: vk::PhysicalDeviceProperties,
    ) {
        self.device_to_physical.insert(device, physical_device);
        self.physical_to_properties
            .insert(physical_device, properties);
    }

    pub fn untrack_logical_device(&self, device: vk::Device) {
        self.device_to_physical.remove(&device);
        self.queue_to_device
            .retain(|_, owner| *owner != device);
    }

    pub fn track_queue(&self, queue: vk::Queue, device: vk::Device) {
        self.queue_to_device.insert(queue, device);
    }

    pub fn device_of_queue(&self, queue: vk::Queue) -> vk::Device {
        self.queue_to_device
            .get(&queue)
            .map(|entry| *entry)
            .unwrap_or_else(|| panic!("queue {queue:?} is not tracked"))
    }
}

impl DeviceProperties for DeviceManager {
    fn physical_device_of(&self, device: vk::Device) -> vk::PhysicalDevice {
        self.device_to_physical
            .get(&device)
            .map(|entry| *entry)
            .unwrap_or_else(|| panic!("device {device:?} is not tracked"))
    }

    fn properties_of(&self, physical_device: vk::PhysicalDevice) -> vk::PhysicalDeviceProperties {
        self.physical_to_properties
            .get(&physical_device)
            .map(|entry| *entry)
            .unwrap_or_else(|| panic!("physical device {physical_device:?} is not tracked"))
    }
}
