//! Application configuration loaded from environment variables.

use std::time::Duration;

use saga::PaymentMode;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        }
    }
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `json` for JSON lines, anything else for human output
/// - `BUS_PARTITIONS`: partitions per topic (default: `4`)
/// - `SAGA_TTL_SECS`: saga state lifetime (default: `600`)
/// - `SAGA_PURGE_INTERVAL_SECS`: expired-saga sweep period (default: `60`)
/// - `DATABASE_URL`: PostgreSQL stores when set, in-memory otherwise
/// - `PAYMENT_MODE`: `approve`, `decline` or `manual` (default: `approve`)
/// - `LEDGER_SNAPSHOT_EVERY`: changelog records between shard snapshots,
///   `0` disables them (default: `1000`)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub bus_partitions: u32,
    pub saga_ttl: Duration,
    pub purge_interval: Duration,
    pub database_url: Option<String>,
    pub payment_mode: PaymentMode,
    pub snapshot_every: u64,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.parse::<u64>().ok());

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: lookup("LOG_FORMAT")
                .map(|v| LogFormat::parse(&v))
                .unwrap_or_default(),
            bus_partitions: lookup("BUS_PARTITIONS")
                .and_then(|p| p.parse().ok())
                .filter(|p| *p > 0)
                .unwrap_or(defaults.bus_partitions),
            saga_ttl: parsed("SAGA_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.saga_ttl),
            purge_interval: parsed("SAGA_PURGE_INTERVAL_SECS")
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.purge_interval),
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            payment_mode: lookup("PAYMENT_MODE")
                .and_then(|v| PaymentMode::parse(&v))
                .unwrap_or(defaults.payment_mode),
            snapshot_every: parsed("LEDGER_SNAPSHOT_EVERY").unwrap_or(defaults.snapshot_every),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            bus_partitions: 4,
            saga_ttl: saga::DEFAULT_SAGA_TTL,
            purge_interval: Duration::from_secs(60),
            database_url: None,
            payment_mode: PaymentMode::Approve,
            snapshot_every: inventory::LedgerConfig::default().snapshot_every,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.bus_partitions, 4);
        assert_eq!(config.saga_ttl, Duration::from_secs(600));
        assert!(config.database_url.is_none());
        assert_eq!(config.payment_mode, PaymentMode::Approve);
        assert_eq!(config.snapshot_every, 1000);
    }

    #[test]
    fn test_reads_overrides() {
        let config = from_pairs(&[
            ("HOST", "127.0.0.1"),
            ("PORT", "8080"),
            ("LOG_FORMAT", "JSON"),
            ("BUS_PARTITIONS", "8"),
            ("SAGA_TTL_SECS", "30"),
            ("DATABASE_URL", "postgres://localhost/orders"),
            ("PAYMENT_MODE", "manual"),
            ("LEDGER_SNAPSHOT_EVERY", "0"),
        ]);
        assert_eq!(config.addr(), "127.0.0.1:8080");
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.bus_partitions, 8);
        assert_eq!(config.saga_ttl, Duration::from_secs(30));
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/orders")
        );
        assert_eq!(config.payment_mode, PaymentMode::Manual);
        assert_eq!(config.snapshot_every, 0);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = from_pairs(&[
            ("PORT", "not-a-port"),
            ("BUS_PARTITIONS", "0"),
            ("SAGA_TTL_SECS", "-5"),
            ("DATABASE_URL", ""),
            ("PAYMENT_MODE", "sometimes"),
        ]);
        assert_eq!(config.port, 3000);
        assert_eq!(config.bus_partitions, 4);
        assert_eq!(config.saga_ttl, Duration::from_secs(600));
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert!(config.database_url.is_none());
        assert_eq!(config.payment_mode, PaymentMode::Approve);
    }

    #[test]
    fn test_addr_default() {
        let config = Config::default();
        assert_eq!(config.addr(), "0.0.0.0:3000");
    }
}
