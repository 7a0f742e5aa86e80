//! Core tuning knobs. Hosts deserialize this from their own config source.

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    /// Name of the loop thread (default "ssc-loop").
    #[serde(default = "default_loop_thread_name")]
    pub loop_thread_name: String,
    /// How often expired posts are swept, in ms (default 4096).
    #[serde(default = "default_post_expiry_interval_ms")]
    pub post_expiry_interval_ms: u64,
    /// How long shutdown waits for in-flight requests, in ms (default 2000).
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Receive buffer per reading peer (default 65536).
    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,
}

fn default_loop_thread_name() -> String {
    "ssc-loop".to_string()
}
fn default_post_expiry_interval_ms() -> u64 {
    4096
}
fn default_shutdown_grace_ms() -> u64 {
    2000
}
fn default_max_datagram_size() -> usize {
    65536
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            loop_thread_name: default_loop_thread_name(),
            post_expiry_interval_ms: default_post_expiry_interval_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            max_datagram_size: default_max_datagram_size(),
        }
    }
}

impl CoreConfig {
    pub fn post_expiry_interval(&self) -> Duration {
        Duration::from_millis(self.post_expiry_interval_ms.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let c: CoreConfig = serde_json::from_str(r#"{"shutdown_grace_ms": 10}"#).unwrap();
        assert_eq!(c.shutdown_grace(), Duration::from_millis(10));
        assert_eq!(c.loop_thread_name, "ssc-loop");
        assert_eq!(c.post_expiry_interval(), Duration::from_millis(4096));
        assert_eq!(c.max_datagram_size, 65536);
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(serde_json::from_str::<CoreConfig>(r#"{"proxy_port": 1}"#).is_err());
    }

    #[test]
    fn zero_interval_is_clamped() {
        let c = CoreConfig {
            post_expiry_interval_ms: 0,
            ..CoreConfig::default()
        };
        assert_eq!(c.post_expiry_interval(), Duration::from_millis(1));
    }
}
