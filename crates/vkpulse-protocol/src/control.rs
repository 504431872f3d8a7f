use serde::{Deserialize, Serialize};

/// Messages the profiler sends to the layer over the producer socket.
/// When to start and stop is entirely the profiler's call; the layer only
/// obeys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    StartCapture,
    StopCapture,
}
