use std::time::Duration;

/// Hard cap on a declared packet body; anything larger is a fatal framing
/// error on that connection.
pub const MAX_BODY_SIZE: usize = 512 * 1024 * 1024;

#[derive(Clone)]
pub struct RpcConfig {
    pub timeout: TimeoutSetting,
    /// Read chunk size for the connection reader.
    pub read_chunk_size: usize,
    /// How long to wait for live connections to drain on graceful close.
    pub server_close_wait: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout: TimeoutSetting::default(),
            read_chunk_size: 16 * 1024,
            server_close_wait: Duration::from_secs(20),
        }
    }
}

#[derive(Clone)]
pub struct TimeoutSetting {
    /// Default deadline for one server-side invocation when the request meta
    /// does not carry its own.
    pub write_timeout: Duration,
    /// Default client-side wait for a response.
    pub read_timeout: Duration,
    /// Socket idle time before the connection is closed.
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for TimeoutSetting {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(10),
        }
    }
}
