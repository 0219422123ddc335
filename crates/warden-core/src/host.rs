//! Host header parsing.

use std::net::IpAddr;

use once_cell::sync::Lazy;
use regex::Regex;

/// Splits `host[:port]`, where host may be a bracketed IPv6 literal.
static HOST_PORT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<host>[^:]+|\[.+\])(?::(?P<port>\d+))?$").expect("valid regex"));

/// A host with an optional explicit port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: Option<u16>,
}

/// Parses a Host header or authority value.
///
/// Brackets are stripped from IPv6 literals. Returns `None` for values that
/// are empty or do not look like `host[:port]`.
///
/// ```
/// use warden_core::host::parse_host_port;
///
/// let hp = parse_host_port("[::1]:8443").unwrap();
/// assert_eq!(hp.host, "::1");
/// assert_eq!(hp.port, Some(8443));
/// ```
pub fn parse_host_port(value: &str) -> Option<HostPort> {
    let value = value.trim();
    let caps = HOST_PORT.captures(value)?;
    let host = caps
        .name("host")?
        .as_str()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_lowercase();
    if host.is_empty() {
        return None;
    }
    let port = match caps.name("port") {
        Some(p) => Some(p.as_str().parse::<u16>().ok()?),
        None => None,
    };
    Some(HostPort { host, port })
}

/// True if the host is an IP literal rather than a name.
pub fn is_ip_literal(host: &str) -> bool {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok()
}
