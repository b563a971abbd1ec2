//! Service configuration.
//!
//! Two layers live here:
//! - [`ServiceConfig`], the validated descriptor the proxy core runs on.
//! - [`Config`], the document loader for the add-on options file
//!   (JSON, or TOML for local development).
//!
//! The loader enforces the operator-facing ranges (seconds, 30..=300 wake
//! timeout, and so on). The core only rejects values that would make a
//! service hang or spin, so embedders and tests may run on sub-second
//! timings.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use wolp_networking::{validate_wol_port, MacAddress, WOL_BROADCAST_ADDR, WOL_DEFAULT_PORT};

use crate::error::ConfigError;

/// Upper bound the core accepts for a wake timeout.
pub const MAX_WAKE_TIMEOUT: Duration = Duration::from_secs(3600);

/// Default wake timeout (seconds).
pub const DEFAULT_WAKE_TIMEOUT_SECS: u64 = 60;

/// Default health check interval (seconds).
pub const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 10;

/// Default probe timeout (seconds).
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;

/// Default target connect timeout (seconds).
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default idle timeout for datagram associations (seconds).
pub const DEFAULT_UDP_IDLE_TIMEOUT_SECS: u64 = 30;

/// Default cap on concurrent datagram clients per service.
pub const DEFAULT_MAX_UDP_CLIENTS: usize = 100;

/// Transport protocol of a proxied service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Stream (TCP).
    Tcp,
    /// Datagram (UDP).
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(format!("protocol must be 'tcp' or 'udp', got '{}'", other)),
        }
    }
}

/// A validated, immutable description of one proxied service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Service identity used in events.
    pub name: String,
    /// Host that is woken and forwarded to.
    pub target_host: String,
    /// Port on the target.
    pub target_port: u16,
    /// Local port the proxy listens on.
    pub proxy_port: u16,
    /// Local address the proxy listens on.
    pub bind_address: IpAddr,
    /// Hardware address of the target.
    pub mac_address: MacAddress,
    /// Where magic packets are sent.
    pub wake_destination: SocketAddr,
    /// How long a wake episode may take before clients are rejected.
    pub wake_timeout: Duration,
    /// Background liveness probe cadence, also the wake polling cadence.
    pub health_check_interval: Duration,
    /// Bound on a single liveness probe.
    pub probe_timeout: Duration,
    /// Bound on connecting to the target before forwarding.
    pub connect_timeout: Duration,
    /// Idle time after which a datagram association is reclaimed.
    pub udp_idle_timeout: Duration,
    /// Cap on concurrent datagram clients.
    pub max_udp_clients: usize,
    /// Transport protocol.
    pub protocol: Protocol,
}

impl ServiceConfig {
    /// Create a stream service with default timings.
    pub fn new(
        target_host: impl Into<String>,
        target_port: u16,
        proxy_port: u16,
        mac_address: MacAddress,
    ) -> Self {
        let target_host = target_host.into();
        Self {
            name: format!("{}:{}", target_host, target_port),
            target_host,
            target_port,
            proxy_port,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            mac_address,
            wake_destination: SocketAddr::new(IpAddr::V4(WOL_BROADCAST_ADDR), WOL_DEFAULT_PORT),
            wake_timeout: Duration::from_secs(DEFAULT_WAKE_TIMEOUT_SECS),
            health_check_interval: Duration::from_secs(DEFAULT_HEALTH_CHECK_INTERVAL_SECS),
            probe_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            udp_idle_timeout: Duration::from_secs(DEFAULT_UDP_IDLE_TIMEOUT_SECS),
            max_udp_clients: DEFAULT_MAX_UDP_CLIENTS,
            protocol: Protocol::Tcp,
        }
    }

    /// Address the proxy listener binds to.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.proxy_port)
    }

    /// Reject values that would stall or spin the service.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let name = self.name.as_str();

        if self.target_host.trim().is_empty() {
            return Err(ConfigError::invalid(name, "target_host", "must not be empty"));
        }
        if self.target_port == 0 {
            return Err(ConfigError::invalid(name, "target_port", "must not be 0"));
        }
        if self.proxy_port == 0 {
            return Err(ConfigError::invalid(name, "proxy_port", "must not be 0"));
        }
        if self.wake_timeout.is_zero() || self.wake_timeout > MAX_WAKE_TIMEOUT {
            return Err(ConfigError::invalid(
                name,
                "wake_timeout",
                format!("must be within (0, {}s]", MAX_WAKE_TIMEOUT.as_secs()),
            ));
        }
        if self.health_check_interval.is_zero() {
            return Err(ConfigError::invalid(
                name,
                "health_check_interval",
                "must not be zero",
            ));
        }
        if self.health_check_interval > self.wake_timeout {
            return Err(ConfigError::invalid(
                name,
                "health_check_interval",
                "must not exceed wake_timeout",
            ));
        }
        if self.probe_timeout.is_zero() {
            return Err(ConfigError::invalid(name, "probe_timeout", "must not be zero"));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::invalid(name, "connect_timeout", "must not be zero"));
        }
        if self.udp_idle_timeout.is_zero() {
            return Err(ConfigError::invalid(name, "udp_idle_timeout", "must not be zero"));
        }
        if self.max_udp_clients == 0 {
            return Err(ConfigError::invalid(name, "max_udp_clients", "must not be zero"));
        }

        Ok(())
    }
}

/// Reject a service set in which two services share a proxy port.
pub fn check_unique_ports(services: &[ServiceConfig]) -> Result<(), ConfigError> {
    let mut seen: HashMap<u16, &str> = HashMap::new();
    for service in services {
        if let Some(first) = seen.insert(service.proxy_port, &service.name) {
            return Err(ConfigError::DuplicateProxyPort {
                port: service.proxy_port,
                first: first.to_string(),
                second: service.name.clone(),
            });
        }
    }
    Ok(())
}

// ============================================================================
// Document loading
// ============================================================================

/// Add-on options document, after per-service validation.
#[derive(Debug)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Services that passed validation, in document order.
    pub services: Vec<ServiceConfig>,
    /// Services that were excluded, one error each.
    pub rejected: Vec<ConfigError>,
}

#[derive(Debug, Deserialize)]
struct Document {
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    services: Vec<serde_json::Value>,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// One service record as written by the operator. Numeric fields are wide so
/// that out-of-range values surface as range errors rather than parse errors.
#[derive(Debug, Deserialize)]
struct ServiceRecord {
    name: Option<String>,
    #[serde(default)]
    target_host: String,
    target_port: Option<i64>,
    proxy_port: Option<i64>,
    mac_address: Option<String>,
    wake_timeout: Option<i64>,
    health_check_interval: Option<i64>,
    protocol: Option<String>,
    connect_timeout: Option<i64>,
    probe_timeout: Option<i64>,
    udp_idle_timeout: Option<i64>,
    max_udp_clients: Option<i64>,
    bind_address: Option<String>,
    broadcast_address: Option<String>,
    wol_port: Option<i64>,
}

impl Config {
    /// Load the options document from a file.
    ///
    /// Files ending in `.toml` are parsed as TOML; everything else as JSON.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;

        let is_toml = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);

        if is_toml {
            Self::from_toml_str(&contents)
        } else {
            Self::from_json_str(&contents)
        }
    }

    /// Parse a JSON options document.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value =
            serde_json::from_str(s).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        Self::from_value(value)
    }

    /// Parse a TOML options document. An `[options]` wrapper table is accepted.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value =
            toml::from_str(s).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        Self::from_value(value)
    }

    fn from_value(mut value: serde_json::Value) -> Result<Self, ConfigError> {
        if let Some(options) = value.get_mut("options").map(serde_json::Value::take) {
            value = options;
        }

        let document: Document =
            serde_json::from_value(value).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;

        let mut services = Vec::new();
        let mut rejected = Vec::new();

        for (index, raw) in document.services.into_iter().enumerate() {
            let fallback = format!("services[{}]", index);
            let parsed = serde_json::from_value::<ServiceRecord>(raw)
                .map_err(|e| ConfigError::invalid(&fallback, "record", e.to_string()))
                .and_then(|record| record.into_service(&fallback));

            match parsed {
                Ok(service) => services.push(service),
                Err(e) => rejected.push(e),
            }
        }

        check_unique_ports(&services)?;

        if services.is_empty() {
            return Err(ConfigError::NoServices);
        }

        Ok(Self {
            log_level: document.log_level,
            services,
            rejected,
        })
    }
}

impl ServiceRecord {
    fn into_service(self, fallback: &str) -> Result<ServiceConfig, ConfigError> {
        let target_host = self.target_host.trim().to_string();
        let target_port = self.target_port;
        let label = match (&self.name, target_host.is_empty(), target_port) {
            (Some(name), _, _) => name.clone(),
            (None, false, Some(port)) => format!("{}:{}", target_host, port),
            _ => fallback.to_string(),
        };

        if target_host.is_empty() {
            return Err(ConfigError::invalid(&label, "target_host", "is required"));
        }

        let target_port = port_field(&label, "target_port", target_port)?;
        let proxy_port = port_field(&label, "proxy_port", self.proxy_port)?;

        let mac_address = self
            .mac_address
            .as_deref()
            .ok_or_else(|| ConfigError::invalid(&label, "mac_address", "is required"))?
            .parse::<MacAddress>()
            .map_err(|e| ConfigError::invalid(&label, "mac_address", e.to_string()))?;

        let protocol = match self.protocol.as_deref() {
            None => Protocol::Tcp,
            Some(p) => p
                .parse::<Protocol>()
                .map_err(|e| ConfigError::invalid(&label, "protocol", e))?,
        };

        let wake_timeout = seconds_field(
            &label,
            "wake_timeout",
            self.wake_timeout,
            DEFAULT_WAKE_TIMEOUT_SECS,
            30..=300,
        )?;
        let health_check_interval = seconds_field(
            &label,
            "health_check_interval",
            self.health_check_interval,
            DEFAULT_HEALTH_CHECK_INTERVAL_SECS,
            5..=60,
        )?;
        let connect_timeout = seconds_field(
            &label,
            "connect_timeout",
            self.connect_timeout,
            DEFAULT_CONNECT_TIMEOUT_SECS,
            1..=60,
        )?;
        let probe_timeout = seconds_field(
            &label,
            "probe_timeout",
            self.probe_timeout,
            DEFAULT_PROBE_TIMEOUT_SECS,
            1..=30,
        )?
        .min(health_check_interval);
        let udp_idle_timeout = seconds_field(
            &label,
            "udp_idle_timeout",
            self.udp_idle_timeout,
            DEFAULT_UDP_IDLE_TIMEOUT_SECS,
            5..=600,
        )?;

        let max_udp_clients = match self.max_udp_clients {
            None => DEFAULT_MAX_UDP_CLIENTS,
            Some(n) if (1..=10_000).contains(&n) => n as usize,
            Some(n) => {
                return Err(ConfigError::invalid(
                    &label,
                    "max_udp_clients",
                    format!("must be between 1 and 10000, got {}", n),
                ))
            }
        };

        let bind_address = ip_field(
            &label,
            "bind_address",
            self.bind_address.as_deref(),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        )?;
        let broadcast_address = ip_field(
            &label,
            "broadcast_address",
            self.broadcast_address.as_deref(),
            IpAddr::V4(WOL_BROADCAST_ADDR),
        )?;

        let wol_port = match self.wol_port {
            None => WOL_DEFAULT_PORT,
            Some(p) => u16::try_from(p)
                .map_err(|_| ConfigError::invalid(&label, "wol_port", "must be 7 or 9"))
                .and_then(|p| {
                    validate_wol_port(p)
                        .map_err(|e| ConfigError::invalid(&label, "wol_port", e.to_string()))
                })?,
        };

        let service = ServiceConfig {
            name: label,
            target_host,
            target_port,
            proxy_port,
            bind_address,
            mac_address,
            wake_destination: SocketAddr::new(broadcast_address, wol_port),
            wake_timeout,
            health_check_interval,
            probe_timeout,
            connect_timeout,
            udp_idle_timeout,
            max_udp_clients,
            protocol,
        };
        service.validate()?;
        Ok(service)
    }
}

fn port_field(service: &str, field: &'static str, value: Option<i64>) -> Result<u16, ConfigError> {
    let value = value.ok_or_else(|| ConfigError::invalid(service, field, "is required"))?;
    match u16::try_from(value) {
        Ok(port) if port >= 1 => Ok(port),
        _ => Err(ConfigError::invalid(
            service,
            field,
            format!("must be between 1 and 65535, got {}", value),
        )),
    }
}

fn seconds_field(
    service: &str,
    field: &'static str,
    value: Option<i64>,
    default: u64,
    range: std::ops::RangeInclusive<i64>,
) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(Duration::from_secs(default)),
        Some(v) if range.contains(&v) => Ok(Duration::from_secs(v as u64)),
        Some(v) => Err(ConfigError::invalid(
            service,
            field,
            format!(
                "must be between {} and {} seconds, got {}",
                range.start(),
                range.end(),
                v
            ),
        )),
    }
}

fn ip_field(
    service: &str,
    field: &'static str,
    value: Option<&str>,
    default: IpAddr,
) -> Result<IpAddr, ConfigError> {
    match value {
        None => Ok(default),
        Some(s) => s
            .trim()
            .parse()
            .map_err(|_| ConfigError::invalid(service, field, format!("invalid IP address '{}'", s))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;

    fn mac() -> MacAddress {
        "00:11:22:33:44:55".parse().unwrap()
    }

    fn record(extra: &str) -> String {
        format!(
            r#"{{"services": [{{"target_host": "192.168.1.20", "target_port": 8123,
                "proxy_port": 18123, "mac_address": "00:11:22:33:44:55"{}}}]}}"#,
            extra
        )
    }

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_json_str(&record("")).unwrap();
        assert_eq!(config.log_level, "info");
        assert!(config.rejected.is_empty());

        let service = &config.services[0];
        assert_eq!(service.name, "192.168.1.20:8123");
        assert_eq!(service.protocol, Protocol::Tcp);
        assert_eq!(service.wake_timeout, Duration::from_secs(60));
        assert_eq!(service.health_check_interval, Duration::from_secs(10));
        assert_eq!(service.probe_timeout, Duration::from_secs(5));
        assert_eq!(service.wake_destination, "255.255.255.255:9".parse().unwrap());
        assert_eq!(service.bind_addr(), "0.0.0.0:18123".parse().unwrap());
    }

    #[rstest]
    #[case(r#", "wake_timeout": 29"#, "wake_timeout")]
    #[case(r#", "wake_timeout": 301"#, "wake_timeout")]
    #[case(r#", "health_check_interval": 4"#, "health_check_interval")]
    #[case(r#", "health_check_interval": 61"#, "health_check_interval")]
    #[case(r#", "protocol": "sctp""#, "protocol")]
    #[case(r#", "wol_port": 10"#, "wol_port")]
    #[case(r#", "bind_address": "not-an-ip""#, "bind_address")]
    fn test_out_of_range_field_excludes_service(#[case] extra: &str, #[case] field: &str) {
        let doc = format!(
            r#"{{"services": [
                {{"target_host": "a", "target_port": 1, "proxy_port": 2, "mac_address": "00:11:22:33:44:55"{}}},
                {{"target_host": "b", "target_port": 1, "proxy_port": 3, "mac_address": "00:11:22:33:44:66"}}
            ]}}"#,
            extra
        );
        let config = Config::from_json_str(&doc).unwrap();

        assert_eq!(config.services.len(), 1);
        assert_eq!(config.services[0].target_host, "b");
        assert_eq!(config.rejected.len(), 1);
        match &config.rejected[0] {
            ConfigError::InvalidField { field: f, .. } => assert_eq!(*f, field),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[rstest]
    #[case(r#""target_port": 0"#)]
    #[case(r#""target_port": 70000"#)]
    #[case(r#""target_port": -1"#)]
    fn test_port_ranges(#[case] port: &str) {
        let doc = format!(
            r#"{{"services": [{{"target_host": "a", {}, "proxy_port": 2, "mac_address": "001122334455"}}]}}"#,
            port
        );
        assert!(matches!(
            Config::from_json_str(&doc),
            Err(ConfigError::NoServices)
        ));
    }

    #[test]
    fn test_invalid_mac_rejected() {
        let doc = r#"{"services": [{"target_host": "a", "target_port": 1, "proxy_port": 2, "mac_address": "00:11:22"}]}"#;
        assert!(matches!(
            Config::from_json_str(doc),
            Err(ConfigError::NoServices)
        ));
    }

    #[test]
    fn test_duplicate_proxy_port_rejects_document() {
        let doc = r#"{"services": [
            {"name": "first", "target_host": "a", "target_port": 1, "proxy_port": 8000, "mac_address": "00:11:22:33:44:55"},
            {"name": "second", "target_host": "b", "target_port": 1, "proxy_port": 8000, "mac_address": "00:11:22:33:44:66"}
        ]}"#;

        match Config::from_json_str(doc) {
            Err(ConfigError::DuplicateProxyPort { port, first, second }) => {
                assert_eq!(port, 8000);
                assert_eq!(first, "first");
                assert_eq!(second, "second");
            }
            other => panic!("expected duplicate port error, got {other:?}"),
        }
    }

    #[test]
    fn test_probe_timeout_clamped_to_interval() {
        let config = Config::from_json_str(&record(
            r#", "health_check_interval": 5, "probe_timeout": 20"#,
        ))
        .unwrap();
        assert_eq!(config.services[0].probe_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_load_toml_with_options_table() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[options]
log_level = "debug"

[[options.services]]
name = "nas-smb"
target_host = "nas.lan"
target_port = 445
proxy_port = 4445
mac_address = "AA-BB-CC-DD-EE-FF"
protocol = "udp"
wol_port = 7
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.log_level, "debug");
        let service = &config.services[0];
        assert_eq!(service.name, "nas-smb");
        assert_eq!(service.protocol, Protocol::Udp);
        assert_eq!(service.wake_destination.port(), 7);
        assert_eq!(service.mac_address.to_string(), "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn test_load_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", record(r#", "protocol": "TCP""#)).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.services.len(), 1);
    }

    #[test]
    fn test_missing_file() {
        let err = Config::load(Path::new("/nonexistent/options.json")).unwrap_err();
        assert_eq!(err.reason_code(), "config_read_failed");
    }

    #[test]
    fn test_core_validation_allows_short_timings() {
        let mut service = ServiceConfig::new("127.0.0.1", 80, 8080, mac());
        service.wake_timeout = Duration::from_millis(500);
        service.health_check_interval = Duration::from_millis(50);
        assert!(service.validate().is_ok());
    }

    #[test]
    fn test_core_validation_rejects_hangs() {
        let mut service = ServiceConfig::new("127.0.0.1", 80, 8080, mac());
        service.wake_timeout = Duration::from_secs(7200);
        assert!(service.validate().is_err());

        let mut service = ServiceConfig::new("127.0.0.1", 80, 8080, mac());
        service.health_check_interval = Duration::ZERO;
        assert!(service.validate().is_err());

        let mut service = ServiceConfig::new("127.0.0.1", 80, 8080, mac());
        service.health_check_interval = Duration::from_secs(120);
        assert!(service.validate().is_err());
    }

    #[test]
    fn test_check_unique_ports() {
        let a = ServiceConfig::new("a", 1, 9000, mac());
        let b = ServiceConfig::new("b", 1, 9001, mac());
        assert!(check_unique_ports(&[a.clone(), b]).is_ok());
        assert!(check_unique_ports(&[a.clone(), a]).is_err());
    }
}
