//! Wire types shared between the vkpulse layer and the profiler: the
//! capture events the layer emits and the control messages the profiler
//! sends back.

pub mod control;
pub mod events;
