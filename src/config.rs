use {
    crate::session::SessionConfig,
    serde::Serialize,
    std::{collections::HashMap, fmt, time::Duration},
};

pub const ENDPOINTS_PARAM: &str = "etcd-endpoints";
pub const KEYSPACE_PARAM: &str = "etcd-keyspace";
pub const LEASE_TTL_PARAM: &str = "etcd-lease-ttl";
pub const LEASE_HEARTBEAT_PARAM: &str = "etcd-lease-heartbeat";
pub const REQUEST_DEADLINE_PARAM: &str = "etcd-request-deadline";
pub const CONNECTION_TIMEOUT_PARAM: &str = "etcd-connection-timeout";
pub const TLS_ENABLED_PARAM: &str = "etcd-tls-enabled";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigViolation {
    pub key: &'static str,
    pub reason: String,
}

impl fmt::Display for ConfigViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key, self.reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {}", join_violations(.0))]
    Invalid(Vec<ConfigViolation>),
}

impl ConfigError {
    pub fn violations(&self) -> &[ConfigViolation] {
        match self {
            ConfigError::Invalid(violations) => violations,
        }
    }
}

fn join_violations(violations: &[ConfigViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

///
/// Typed connection and timing settings of a quorum member.
///
/// Lease TTL and heartbeat are kept in whole seconds, the granularity of the etcd lease API.
///
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Config {
    endpoints: Vec<String>,
    keyspace: String,
    lease_ttl_secs: i64,
    heartbeat_secs: u64,
    request_deadline: Duration,
    connect_timeout: Duration,
    tls_enabled: bool,
}

impl Config {
    ///
    /// Checks every parameter and reports all violations at once.
    ///
    pub fn validate(params: &HashMap<String, String>) -> Result<(), ConfigError> {
        Self::from_params(params).map(|_| ())
    }

    ///
    /// Converts string parameters into a [`Config`].
    /// Unknown keys are ignored.
    ///
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut violations = Vec::new();

        let endpoints = required(params, ENDPOINTS_PARAM, &mut violations)
            .and_then(|raw| record(parse_endpoints(raw), ENDPOINTS_PARAM, &mut violations));
        let keyspace = required(params, KEYSPACE_PARAM, &mut violations).and_then(|raw| {
            let keyspace = raw.trim();
            if keyspace.is_empty() {
                violations.push(violation(KEYSPACE_PARAM, "must not be empty"));
                None
            } else {
                Some(keyspace.to_string())
            }
        });
        let lease_ttl = required(params, LEASE_TTL_PARAM, &mut violations)
            .and_then(|raw| record(parse_duration(raw), LEASE_TTL_PARAM, &mut violations));
        let heartbeat = required(params, LEASE_HEARTBEAT_PARAM, &mut violations)
            .and_then(|raw| record(parse_duration(raw), LEASE_HEARTBEAT_PARAM, &mut violations));
        let request_deadline = required(params, REQUEST_DEADLINE_PARAM, &mut violations)
            .and_then(|raw| record(parse_duration(raw), REQUEST_DEADLINE_PARAM, &mut violations));
        let connect_timeout = required(params, CONNECTION_TIMEOUT_PARAM, &mut violations)
            .and_then(|raw| {
                record(parse_duration(raw), CONNECTION_TIMEOUT_PARAM, &mut violations)
            });
        let tls_enabled = required(params, TLS_ENABLED_PARAM, &mut violations)
            .and_then(|raw| record(parse_bool(raw), TLS_ENABLED_PARAM, &mut violations));

        let lease_ttl_secs = lease_ttl.and_then(|ttl| match i64::try_from(ttl.as_secs()) {
            Ok(0) => {
                violations.push(violation(LEASE_TTL_PARAM, "must be at least one second"));
                None
            }
            Ok(secs) => Some(secs),
            Err(_) => {
                violations.push(violation(LEASE_TTL_PARAM, "is too large for an etcd lease"));
                None
            }
        });
        let heartbeat_secs = heartbeat.and_then(|heartbeat| {
            if heartbeat.as_secs() == 0 {
                violations.push(violation(LEASE_HEARTBEAT_PARAM, "must be at least one second"));
                None
            } else {
                Some(heartbeat.as_secs())
            }
        });
        if let (Some(ttl), Some(heartbeat)) = (lease_ttl_secs, heartbeat_secs) {
            if heartbeat >= ttl as u64 {
                violations.push(violation(
                    LEASE_HEARTBEAT_PARAM,
                    format!("heartbeat of {heartbeat}s must be shorter than the lease ttl of {ttl}s"),
                ));
            }
        }
        for (key, value) in [
            (REQUEST_DEADLINE_PARAM, request_deadline),
            (CONNECTION_TIMEOUT_PARAM, connect_timeout),
        ] {
            if value == Some(Duration::ZERO) {
                violations.push(violation(key, "must be greater than zero"));
            }
        }

        match (
            endpoints,
            keyspace,
            lease_ttl_secs,
            heartbeat_secs,
            request_deadline,
            connect_timeout,
            tls_enabled,
        ) {
            (
                Some(endpoints),
                Some(keyspace),
                Some(lease_ttl_secs),
                Some(heartbeat_secs),
                Some(request_deadline),
                Some(connect_timeout),
                Some(tls_enabled),
            ) if violations.is_empty() => Ok(Self {
                endpoints,
                keyspace,
                lease_ttl_secs,
                heartbeat_secs,
                request_deadline,
                connect_timeout,
                tls_enabled,
            }),
            _ => Err(ConfigError::Invalid(violations)),
        }
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    pub fn connect_string(&self) -> String {
        self.endpoints.join(",")
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    pub fn lease_ttl_secs(&self) -> i64 {
        self.lease_ttl_secs
    }

    pub fn heartbeat_secs(&self) -> u64 {
        self.heartbeat_secs
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn request_deadline(&self) -> Duration {
        self.request_deadline
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn is_tls_enabled(&self) -> bool {
        self.tls_enabled
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            lease_ttl_secs: self.lease_ttl_secs,
            heartbeat: self.heartbeat(),
            request_deadline: self.request_deadline,
        }
    }
}

fn violation(key: &'static str, reason: impl Into<String>) -> ConfigViolation {
    ConfigViolation {
        key,
        reason: reason.into(),
    }
}

fn required<'a>(
    params: &'a HashMap<String, String>,
    key: &'static str,
    violations: &mut Vec<ConfigViolation>,
) -> Option<&'a str> {
    match params.get(key) {
        Some(value) => Some(value.as_str()),
        None => {
            violations.push(violation(key, "is missing"));
            None
        }
    }
}

fn record<T>(
    result: Result<T, String>,
    key: &'static str,
    violations: &mut Vec<ConfigViolation>,
) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(reason) => {
            violations.push(violation(key, reason));
            None
        }
    }
}

fn parse_endpoints(raw: &str) -> Result<Vec<String>, String> {
    let endpoints: Vec<String> = raw.split(',').map(|s| s.trim().to_string()).collect();
    if endpoints.iter().any(String::is_empty) {
        return Err(format!("`{raw}` contains an empty endpoint"));
    }
    for endpoint in &endpoints {
        let host_port = endpoint
            .strip_prefix("https://")
            .or_else(|| endpoint.strip_prefix("http://"))
            .unwrap_or(endpoint);
        match host_port.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
            _ => return Err(format!("`{endpoint}` is not a host:port pair")),
        }
    }
    Ok(endpoints)
}

fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(format!("`{raw}` is not a boolean")),
    }
}

///
/// Parses an ISO-8601 duration (`PT5S`, `PT1M30S`, `P1DT2H`) or a humantime one (`5s`, `1m 30s`).
///
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    if raw.starts_with('P') || raw.starts_with('p') {
        parse_iso8601_duration(raw).ok_or_else(|| format!("`{raw}` is not an ISO-8601 duration"))
    } else {
        humantime::parse_duration(raw).map_err(|e| format!("`{raw}` is not a duration: {e}"))
    }
}

fn parse_iso8601_duration(raw: &str) -> Option<Duration> {
    let upper = raw.to_ascii_uppercase();
    let body = upper.strip_prefix('P')?;
    let (date_part, time_part) = match body.split_once('T') {
        Some((date, time)) => {
            if time.is_empty() {
                return None;
            }
            (date, time)
        }
        None => (body, ""),
    };
    if date_part.is_empty() && time_part.is_empty() {
        return None;
    }

    let mut total_secs = 0f64;
    for (value, unit) in iso_components(date_part)? {
        total_secs += match unit {
            'D' => value * 86_400.0,
            _ => return None,
        };
    }
    for (value, unit) in iso_components(time_part)? {
        total_secs += match unit {
            'H' => value * 3_600.0,
            'M' => value * 60.0,
            'S' => value,
            _ => return None,
        };
    }
    if !total_secs.is_finite() || total_secs < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(total_secs).ok()
}

fn iso_components(part: &str) -> Option<Vec<(f64, char)>> {
    let mut components = Vec::new();
    let mut number = String::new();
    for c in part.chars() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
        } else {
            if number.is_empty() {
                return None;
            }
            components.push((number.parse::<f64>().ok()?, c));
            number.clear();
        }
    }
    if !number.is_empty() {
        return None;
    }
    Some(components)
}
