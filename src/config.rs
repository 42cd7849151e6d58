use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Sync server configuration
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Address to bind the server to
    pub bind_address: IpAddr,
    /// Port to listen on
    pub port: u16,
    /// Simulation loop rate in Hz
    pub simulation_rate: u32,
    /// Flush loop rate in Hz
    pub flush_rate: u32,
    /// QUIC keep-alive interval in seconds (0 disables it)
    pub keep_alive_secs: u64,
    /// Port of the Prometheus endpoint
    pub metrics_port: u16,
    /// Path to TLS certificate file
    pub tls_cert_path: Option<String>,
    /// Path to TLS key file
    pub tls_key_path: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 4433,
            simulation_rate: 60,
            flush_rate: 20,
            keep_alive_secs: 30,
            metrics_port: 9090,
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

impl SyncConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("BIND_ADDRESS") {
            if let Ok(parsed) = addr.parse() {
                config.bind_address = parsed;
            } else {
                tracing::warn!("Invalid BIND_ADDRESS '{}', using default", addr);
            }
        }

        if let Ok(port) = std::env::var("PORT") {
            if let Ok(parsed) = port.parse::<u16>() {
                if parsed > 0 {
                    config.port = parsed;
                } else {
                    tracing::warn!("PORT must be > 0, using default");
                }
            } else {
                tracing::warn!("Invalid PORT '{}', using default", port);
            }
        }

        if let Some(rate) = read_rate("SIMULATION_RATE") {
            config.simulation_rate = rate;
        }

        if let Some(rate) = read_rate("FLUSH_RATE") {
            config.flush_rate = rate;
        }

        if let Ok(secs) = std::env::var("KEEP_ALIVE_SECS") {
            if let Ok(parsed) = secs.parse::<u64>() {
                config.keep_alive_secs = parsed;
            } else {
                tracing::warn!("Invalid KEEP_ALIVE_SECS '{}', using default", secs);
            }
        }

        if let Ok(port) = std::env::var("METRICS_PORT") {
            if let Ok(parsed) = port.parse::<u16>() {
                config.metrics_port = parsed;
            } else {
                tracing::warn!("Invalid METRICS_PORT '{}', using default", port);
            }
        }

        if let Ok(cert_path) = std::env::var("TLS_CERT_PATH") {
            config.tls_cert_path = Some(cert_path);
        }

        if let Ok(key_path) = std::env::var("TLS_KEY_PATH") {
            config.tls_key_path = Some(key_path);
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("Port cannot be 0".to_string());
        }
        if self.simulation_rate == 0 {
            return Err("simulation_rate must be at least 1 Hz".to_string());
        }
        if self.flush_rate == 0 {
            return Err("flush_rate must be at least 1 Hz".to_string());
        }
        if self.metrics_port != 0 && self.metrics_port == self.port {
            return Err("metrics_port cannot equal port".to_string());
        }
        if self.tls_cert_path.is_some() != self.tls_key_path.is_some() {
            return Err("TLS_CERT_PATH and TLS_KEY_PATH must be set together".to_string());
        }
        Ok(())
    }

    /// Simulation tick period
    pub fn simulation_period(&self) -> Duration {
        period(self.simulation_rate)
    }

    /// Flush tick period
    pub fn flush_period(&self) -> Duration {
        period(self.flush_rate)
    }

    /// Keep-alive interval, `None` when disabled
    pub fn keep_alive(&self) -> Option<Duration> {
        (self.keep_alive_secs > 0).then(|| Duration::from_secs(self.keep_alive_secs))
    }
}

fn read_rate(var: &str) -> Option<u32> {
    let raw = std::env::var(var).ok()?;
    match raw.parse::<u32>() {
        Ok(parsed) if (1..=1000).contains(&parsed) => Some(parsed),
        Ok(_) => {
            tracing::warn!("{} must be 1-1000 Hz, using default", var);
            None
        }
        Err(_) => {
            tracing::warn!("Invalid {} '{}', using default", var, raw);
            None
        }
    }
}

fn period(rate: u32) -> Duration {
    Duration::from_secs_f64(1.0 / f64::from(rate.max(1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.port, 4433);
        assert_eq!(config.simulation_rate, 60);
        assert_eq!(config.flush_rate, 20);
        assert_eq!(config.keep_alive(), Some(Duration::from_secs(30)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_periods() {
        let config = SyncConfig::default();
        assert_eq!(config.flush_period(), Duration::from_millis(50));
        assert!((config.simulation_period().as_secs_f64() - 1.0 / 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_validate_rejects_zero_rates() {
        let config = SyncConfig {
            flush_rate: 0,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());

        let config = SyncConfig {
            simulation_rate: 0,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_tls_pair() {
        let config = SyncConfig {
            tls_cert_path: Some("cert.pem".to_string()),
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_keep_alive_disabled() {
        let config = SyncConfig {
            keep_alive_secs: 0,
            ..SyncConfig::default()
        };
        assert_eq!(config.keep_alive(), None);
    }

    #[test]
    fn test_load_or_default() {
        let config = SyncConfig::load_or_default();
        assert!(config.port > 0);
    }
}
