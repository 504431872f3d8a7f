//! The producer side of the layer: a unix-socket client that streams
//! capture events to the profiler and obeys its start/stop commands.
//!
//! The layer never decides when to capture. A background thread reads
//! control messages from the profiler and flips the capture flag; the
//! hot paths only ever load it.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use vkpulse_protocol::control::ControlMessage;
use vkpulse_protocol::events::CaptureEvent;

use crate::submission_tracker::CaptureSink;

/// Upper bound on an incoming control frame; anything bigger means the
/// peer is not a vkpulse profiler.
const MAX_CONTROL_FRAME_SIZE: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error("failed to connect to profiler at {path}: {source}")]
    Connect {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no profiler connection")]
    NotConnected,
    #[error("failed to encode capture event: {0}")]
    Encode(#[from] bincode::Error),
    #[error("failed to write capture event: {0}")]
    Write(std::io::Error),
}

/// State the control thread shares with the hot paths.
struct ProducerShared {
    capturing: AtomicBool,
    connection: Mutex<Option<UnixStream>>,
}

pub struct IpcProducer {
    socket_path: String,
    shared: Arc<ProducerShared>,
    string_keys: DashMap<String, u64>,
    next_string_key: AtomicU64,
}

impl IpcProducer {
    pub fn new(socket_path: String) -> Self {
        Self {
            socket_path,
            shared: Arc::new(ProducerShared {
                capturing: AtomicBool::new(false),
                connection: Mutex::new(None),
            }),
            string_keys: DashMap::new(),
            next_string_key: AtomicU64::new(0),
        }
    }

    /// Connect to the profiler and start listening for capture control.
    pub fn bring_up(&self) -> Result<(), ProducerError> {
        let connect_error = |source: std::io::Error| ProducerError::Connect {
            path: self.socket_path.clone(),
            source,
        };
        let stream = UnixStream::connect(&self.socket_path).map_err(connect_error)?;
        let control_stream = stream.try_clone().map_err(connect_error)?;
        *self.shared.connection.lock() = Some(stream);

        let shared = Arc::clone(&self.shared);
        std::thread::Builder::new()
            .name("vkpulse-control".to_string())
            .spawn(move || control_loop(&shared, control_stream))
            .map_err(connect_error)?;

        info!("connected to profiler at {}", self.socket_path);
        Ok(())
    }

    /// Drop the profiler connection and stop capturing.
    pub fn take_down(&self) {
        self.shared.capturing.store(false, Ordering::Release);
        *self.shared.connection.lock() = None;
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connection.lock().is_some()
    }

    fn send_event(&self, event: &CaptureEvent) {
        if let Err(error) = self.try_send(event) {
            debug!(%error, "dropping capture event");
        }
    }

    fn try_send(&self, event: &CaptureEvent) -> Result<(), ProducerError> {
        let payload = bincode::serialize(event)?;
        let mut connection = self.shared.connection.lock();
        let stream = connection.as_mut().ok_or(ProducerError::NotConnected)?;
        stream
            .write_all(&(payload.len() as u32).to_le_bytes())
            .map_err(ProducerError::Write)?;
        stream.write_all(&payload).map_err(ProducerError::Write)?;
        Ok(())
    }
}

fn control_loop(shared: &ProducerShared, mut stream: UnixStream) {
    loop {
        let mut len_bytes = [0u8; 4];
        if stream.read_exact(&mut len_bytes).is_err() {
            break;
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_CONTROL_FRAME_SIZE {
            warn!(len, "oversized control frame, dropping profiler connection");
            break;
        }
        let mut payload = vec![0u8; len];
        if stream.read_exact(&mut payload).is_err() {
            break;
        }
        match bincode::deserialize::<ControlMessage>(&payload) {
            Ok(ControlMessage::StartCapture) => {
                info!("capture started");
                shared.capturing.store(true, Ordering::Release);
            }
            Ok(ControlMessage::StopCapture) => {
                info!("capture stopped");
                shared.capturing.store(false, Ordering::Release);
            }
            Err(error) => {
                warn!(%error, "ignoring malformed control message");
            }
        }
    }
    // Profiler went away. Stop capturing so in-flight slots drain through
    // the clean-up paths instead of accumulating.
    shared.capturing.store(false, Ordering::Release);
    *shared.connection.lock() = None;
    info!("profiler disconnected");
}

impl CaptureSink for IpcProducer {
    fn is_capturing(&self) -> bool {
        self.shared.capturing.load(Ordering::Acquire)
    }

    fn intern_string(&self, text: &str) -> u64 {
        if let Some(existing) = self.string_keys.get(text) {
            return *existing;
        }
        match self.string_keys.entry(text.to_owned()) {
            Entry::Occupied(occupied) => *occupied.get(),
            Entry::Vacant(vacant) => {
                let key = self.next_string_key.fetch_add(1, Ordering::Relaxed);
                vacant.insert(key);
                // Tell the consumer what the key means before anything
                // refers to it.
                self.send_event(&CaptureEvent::InternedString {
                    key,
                    text: text.to_owned(),
                });
                key
            }
        }
    }

    fn enqueue_capture_event(&self, event: CaptureEvent) {
        self.send_event(&event);
    }
}
