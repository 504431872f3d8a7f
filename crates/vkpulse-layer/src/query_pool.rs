//! Per-device pools of timestamp query slots.
//!
//! Wraps one `VkQueryPool` per logical device and tracks which slot
//! indices are free. Slots come back either through `reset_slots` (the
//! GPU executed, or may have executed, the timestamp write, so the slot
//! content is reset driver-side too) or through `rollback_slots` (the
//! write never reached a queue, bookkeeping only).

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;
use parking_lot::RwLock;
use tracing::debug;

use crate::submission_tracker::QuerySlots;

/// Driver entry points the pool needs. Split out so tests can substitute
/// a mock driver.
pub trait PoolDispatch {
    fn create_query_pool(
        &self,
        device: vk::Device,
        create_info: &vk::QueryPoolCreateInfo<'_>,
    ) -> (vk::Result, vk::QueryPool);
    fn destroy_query_pool(&self, device: vk::Device, query_pool: vk::QueryPool);
    /// Host-side `vkResetQueryPoolEXT` over a slot range.
    fn reset_query_pool_host(
        &self,
        device: vk::Device,
        query_pool: vk::QueryPool,
        first_query: u32,
        query_count: u32,
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    ReadyForQueryIssue,
    PendingOnGpu,
}

struct DeviceSlots {
    query_pool: vk::QueryPool,
    states: Vec<SlotState>,
    free_slots: Vec<u32>,
}

pub struct TimerQueryPool<D> {
    dispatch: Arc<D>,
    num_slots: u32,
    devices: RwLock<HashMap<vk::Device, DeviceSlots>>,
}

impl<D: PoolDispatch> TimerQueryPool<D> {
    pub fn new(dispatch: Arc<D>, num_slots: u32) -> Self {
        Self {
            dispatch,
            num_slots,
            devices: RwLock::new(HashMap::new()),
        }
    }

    /// Creates and host-resets the device's `VkQueryPool`. Must run before
    /// any other operation for that device.
    pub fn initialize(&self, device: vk::Device) {
        let create_info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(self.num_slots);
        let (result, query_pool) = self.dispatch.create_query_pool(device, &create_info);
        assert_eq!(
            result,
            vk::Result::SUCCESS,
            "failed to create the timer query pool for {device:?}"
        );
        self.dispatch
            .reset_query_pool_host(device, query_pool, 0, self.num_slots);

        let previous = self.devices.write().insert(
            device,
            DeviceSlots {
                query_pool,
                states: vec![SlotState::ReadyForQueryIssue; self.num_slots as usize],
                free_slots: (0..self.num_slots).rev().collect(),
            },
        );
        assert!(
            previous.is_none(),
            "timer query pool for {device:?} initialized twice"
        );
        debug!(?device, slots = self.num_slots, "timer query pool ready");
    }

    pub fn destroy(&self, device: vk::Device) {
        let removed = self
            .devices
            .write()
            .remove(&device)
            .unwrap_or_else(|| panic!("no timer query pool for {device:?}"));
        self.dispatch.destroy_query_pool(device, removed.query_pool);
    }

    pub fn query_pool(&self, device: vk::Device) -> vk::QueryPool {
        self.devices
            .read()
            .get(&device)
            .unwrap_or_else(|| panic!("no timer query pool for {device:?}"))
            .query_pool
    }

    /// Hands out a free slot, or `None` when the pool is exhausted (the
    /// caller decides whether that is survivable).
    pub fn next_ready_slot(&self, device: vk::Device) -> Option<u32> {
        let mut devices = self.devices.write();
        let slots = devices
            .get_mut(&device)
            .unwrap_or_else(|| panic!("no timer query pool for {device:?}"));
        let slot = slots.free_slots.pop()?;
        let state = &mut slots.states[slot as usize];
        assert_eq!(
            *state,
            SlotState::ReadyForQueryIssue,
            "free-list slot {slot} is not ready"
        );
        *state = SlotState::PendingOnGpu;
        Some(slot)
    }

    /// Returns slots whose timestamp writes reached (or may have reached)
    /// the GPU; the slot contents are reset driver-side as well.
    pub fn reset_slots(&self, device: vk::Device, slots: &[u32]) {
        self.reclaim(device, slots, false);
    }

    /// Returns slots whose timestamp writes never made it to a queue.
    /// Bookkeeping only, the driver is not involved.
    pub fn rollback_slots(&self, device: vk::Device, slots: &[u32]) {
        self.reclaim(device, slots, true);
    }

    fn reclaim(&self, device: vk::Device, slot_indices: &[u32], rollback_only: bool) {
        if slot_indices.is_empty() {
            return;
        }
        let query_pool = {
            let mut devices = self.devices.write();
            let slots = devices
                .get_mut(&device)
                .unwrap_or_else(|| panic!("no timer query pool for {device:?}"));
            for &slot in slot_indices {
                assert!(slot < self.num_slots, "slot {slot} out of range");
                let state = &mut slots.states[slot as usize];
                assert_eq!(
                    *state,
                    SlotState::PendingOnGpu,
                    "slot {slot} reclaimed while not pending"
                );
                *state = SlotState::ReadyForQueryIssue;
                slots.free_slots.push(slot);
            }
            slots.query_pool
        };
        if rollback_only {
            return;
        }
        // Driver calls happen with the lock already dropped.
        for &slot in slot_indices {
            self.dispatch.reset_query_pool_host(device, query_pool, slot, 1);
        }
    }
}

impl<D: PoolDispatch> QuerySlots for TimerQueryPool<D> {
    fn query_pool(&self, device: vk::Device) -> vk::QueryPool {
        TimerQueryPool::query_pool(self, device)
    }

    fn next_ready_slot(&self, device: vk::Device) -> Option<u32> {
        TimerQueryPool::next_ready_slot(self, device)
    }

    fn reset_slots(&self, device: vk::Device, slots: &[u32]) {
        TimerQueryPool::reset_slots(self, device, slots)
    }

    fn rollback_slots(&self, device: vk::Device, slots: &[u32]) {
        TimerQueryPool::rollback_slots(self, device, slots)
    }
}
