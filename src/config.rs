use std::path::PathBuf;
use std::time::Duration;

/// Default buffer size, in chunks, of each direction of a memory-transport call.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub cert_path: PathBuf,

    pub key_path: Option<PathBuf>,

    pub server_name: String,

    pub bind_address: String,

    pub keep_alive_interval: Option<Duration>,

    /// Longest wait for the next message of a response stream.
    pub default_stream_timeout: Option<Duration>,

    pub channel_capacity: usize,
}

impl RpcConfig {
    pub fn new<P: Into<PathBuf>>(cert_path: P, bind_address: impl Into<String>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: None,
            server_name: "localhost".to_string(),
            bind_address: bind_address.into(),
            keep_alive_interval: Some(Duration::from_secs(30)),
            default_stream_timeout: Some(Duration::from_secs(30)),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Configuration for in-process use, where no certificates are involved.
    pub fn in_memory() -> Self {
        Self::new(PathBuf::new(), "memory")
    }

    pub fn with_key_path<P: Into<PathBuf>>(mut self, key_path: P) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }

    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = Some(interval);
        self
    }

    pub fn with_default_stream_timeout(mut self, timeout: Duration) -> Self {
        self.default_stream_timeout = Some(timeout);
        self
    }

    pub fn without_stream_timeout(mut self) -> Self {
        self.default_stream_timeout = None;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = RpcConfig::new("certs/cert.pem", "127.0.0.1:50051")
            .with_key_path("certs/key.pem")
            .with_server_name("greet.local")
            .with_default_stream_timeout(Duration::from_secs(5))
            .with_channel_capacity(0);

        assert_eq!(config.key_path, Some(PathBuf::from("certs/key.pem")));
        assert_eq!(config.server_name, "greet.local");
        assert_eq!(config.bind_address, "127.0.0.1:50051");
        assert_eq!(config.default_stream_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.channel_capacity, 1);
    }

    #[test]
    fn stream_timeout_can_be_disabled() {
        let config = RpcConfig::in_memory().without_stream_timeout();
        assert!(config.default_stream_timeout.is_none());
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
    }
}
