//! IPC producer tests over a real unix socket pair.

#![cfg(unix)]

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use vkpulse_layer::producer::IpcProducer;
use vkpulse_layer::submission_tracker::CaptureSink;
use vkpulse_protocol::control::ControlMessage;
use vkpulse_protocol::events::CaptureEvent;

fn socket_path(tag: &str) -> String {
    format!(
        "{}/vkpulse-test-{}-{}.sock",
        std::env::temp_dir().display(),
        std::process::id(),
        tag
    )
}

fn write_control(stream: &mut UnixStream, message: ControlMessage) {
    let payload = bincode::serialize(&message).unwrap();
    stream
        .write_all(&(payload.len() as u32).to_le_bytes())
        .unwrap();
    stream.write_all(&payload).unwrap();
}

fn read_event(stream: &mut UnixStream) -> CaptureEvent {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).unwrap();
    let mut payload = vec![0u8; u32::from_le_bytes(len_bytes) as usize];
    stream.read_exact(&mut payload).unwrap();
    bincode::deserialize(&payload).unwrap()
}

fn wait_for(predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn works_as_a_silent_stub_without_a_profiler() {
    let producer = Arc::new(IpcProducer::new(socket_path("absent")));
    assert!(!producer.is_capturing());
    assert!(!producer.is_connected());
    assert!(producer.bring_up().is_err());

    // Interning stays stable and events are dropped, not errors.
    assert_eq!(producer.intern_string("a"), 0);
    assert_eq!(producer.intern_string("b"), 1);
    assert_eq!(producer.intern_string("a"), 0);
    producer.enqueue_capture_event(CaptureEvent::InternedString {
        key: 0,
        text: "a".to_string(),
    });
}

#[test]
fn control_messages_toggle_capture() {
    let path = socket_path("control");
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();

    let producer = Arc::new(IpcProducer::new(path.clone()));
    producer.bring_up().unwrap();
    let (mut profiler, _) = listener.accept().unwrap();
    assert!(producer.is_connected());
    assert!(!producer.is_capturing());

    write_control(&mut profiler, ControlMessage::StartCapture);
    assert!(wait_for(|| producer.is_capturing()));

    write_control(&mut profiler, ControlMessage::StopCapture);
    assert!(wait_for(|| !producer.is_capturing()));

    let _ = std::fs::remove_file(&path);
}

#[test]
fn events_arrive_length_prefixed() {
    let path = socket_path("events");
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();

    let producer = Arc::new(IpcProducer::new(path.clone()));
    producer.bring_up().unwrap();
    let (mut profiler, _) = listener.accept().unwrap();

    // First interning announces the key to the consumer.
    let key = producer.intern_string("vkpulse");
    match read_event(&mut profiler) {
        CaptureEvent::InternedString {
            key: event_key,
            text,
        } => {
            assert_eq!(event_key, key);
            assert_eq!(text, "vkpulse");
        }
        other => panic!("expected InternedString, got {other:?}"),
    }

    // A repeated interning announces nothing new.
    assert_eq!(producer.intern_string("vkpulse"), key);
    producer.enqueue_capture_event(CaptureEvent::InternedString {
        key: 99,
        text: "direct".to_string(),
    });
    match read_event(&mut profiler) {
        CaptureEvent::InternedString { key, text } => {
            assert_eq!(key, 99);
            assert_eq!(text, "direct");
        }
        other => panic!("expected InternedString, got {other:?}"),
    }

    let _ = std::fs::remove_file(&path);
}

#[test]
fn profiler_disconnect_stops_capture() {
    let path = socket_path("disconnect");
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();

    let producer = Arc::new(IpcProducer::new(path.clone()));
    producer.bring_up().unwrap();
    let (mut profiler, _) = listener.accept().unwrap();

    write_control(&mut profiler, ControlMessage::StartCapture);
    assert!(wait_for(|| producer.is_capturing()));

    drop(profiler);
    drop(listener);
    assert!(wait_for(|| !producer.is_capturing()));
    assert!(wait_for(|| !producer.is_connected()));

    let _ = std::fs::remove_file(&path);
}

#[test]
fn take_down_drops_the_connection() {
    let path = socket_path("takedown");
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();

    let producer = Arc::new(IpcProducer::new(path.clone()));
    producer.bring_up().unwrap();
    let (_profiler, _) = listener.accept().unwrap();
    assert!(producer.is_connected());

    producer.take_down();
    assert!(!producer.is_connected());
    assert!(!producer.is_capturing());

    let _ = std::fs::remove_file(&path);
}
