/// Returns the default socket/pipe path the profiler listens on for
/// capture events.
pub fn default_producer_socket_path() -> String {
    #[cfg(unix)]
    {
        let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
            .unwrap_or_else(|_| "/tmp".to_string());
        format!("{}/vkpulse.sock", runtime_dir)
    }
    #[cfg(windows)]
    {
        r"\\.\pipe\vkpulse".to_string()
    }
}
