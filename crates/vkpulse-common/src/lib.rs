//! Shared plumbing for the vkpulse layer: logging bootstrap, platform
//! paths, configuration, and clock/thread-id helpers.

pub mod config;
pub mod logging;
pub mod platform;
pub mod time;
