use std::time::Duration;

use serde::{Deserialize, Serialize};
use wiretap_net::Limits;
use wiretap_storage::BodyLimits;

use crate::error::ProxyError;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen: ListenConfig,
    pub tls: TlsMitmConfig,
    pub pool: PoolConfig,
    pub history: BodyLimits,
    pub limits: LimitsConfig,
    pub statistics: StatisticsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
}

/// `intercept = false` relays CONNECT tunnels as opaque bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TlsMitmConfig {
    pub intercept: bool,
    pub allow_legacy: bool,
    pub ca_cert_path: Option<String>,
    pub ca_key_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PoolConfig {
    pub max_idle_per_key: usize,
    pub idle_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_header_bytes: usize,
}

/// A zero interval turns the periodic statistics line off.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StatisticsConfig {
    pub log_interval_secs: u64,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl ListenConfig {
    pub fn addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl Default for TlsMitmConfig {
    fn default() -> Self {
        Self {
            intercept: true,
            allow_legacy: false,
            ca_cert_path: None,
            ca_key_path: None,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_key: 8,
            idle_timeout_secs: 90,
            connect_timeout_secs: 10,
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_header_bytes: Limits::default().max_header_bytes,
        }
    }
}

impl LimitsConfig {
    pub fn parser_limits(&self) -> Limits {
        Limits {
            max_header_bytes: self.max_header_bytes,
        }
    }
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            log_interval_secs: 1,
        }
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), ProxyError> {
        match (&self.tls.ca_cert_path, &self.tls.ca_key_path) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(ProxyError::Config(
                    "ca_cert_path and ca_key_path must be set together".to_string(),
                ));
            }
            _ => {}
        }
        if self.pool.connect_timeout_secs == 0 {
            return Err(ProxyError::Config(
                "pool.connect_timeout_secs must be positive".to_string(),
            ));
        }
        if self.limits.max_header_bytes == 0 {
            return Err(ProxyError::Config(
                "limits.max_header_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::ProxyConfig;
    use crate::error::ProxyError;

    #[test]
    fn defaults_listen_on_all_interfaces() {
        let config = ProxyConfig::default();
        assert_eq!(config.listen.addr(), "0.0.0.0:8080");
        assert!(config.tls.intercept);
        assert_eq!(config.pool.max_idle_per_key, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: ProxyConfig =
            serde_json::from_str(r#"{"listen":{"port":9090},"tls":{"intercept":false}}"#).unwrap();
        assert_eq!(config.listen.host, "0.0.0.0");
        assert_eq!(config.listen.port, 9090);
        assert!(!config.tls.intercept);
        assert_eq!(config.statistics.log_interval_secs, 1);
    }

    #[test]
    fn ipv6_listen_host_is_bracketed() {
        let mut config = ProxyConfig::default();
        config.listen.host = "::1".to_string();
        assert_eq!(config.listen.addr(), "[::1]:8080");
    }

    #[test]
    fn ca_paths_must_come_in_pairs() {
        let mut config = ProxyConfig::default();
        config.tls.ca_cert_path = Some("ca.pem".to_string());
        assert_matches!(config.validate(), Err(ProxyError::Config(_)));
    }
}
