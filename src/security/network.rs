//! Network target validation (SSRF guard).
//!
//! Deny by default: a target is accepted only when its host can be
//! classified as public. Anything that looks local, private, ambiguous or
//! legacy-numeric is rejected unless the caller opts into private network
//! access.
//!
//! Validation here is pure string/IP classification. The transport layer
//! adds a second check on resolved addresses ([`SafeDnsResolver`] for HTTP,
//! [`resolve_target`] for WebSocket) so DNS names pointing at
//! private space are caught too.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use url::{Host, Url};

use crate::error::ScriptError;

/// Maximum accepted URL length in bytes.
pub const MAX_URL_LEN: usize = 2048;

/// Which family of schemes a caller accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkScheme {
    /// `http` / `https`.
    Http,
    /// `ws` / `wss`.
    WebSocket,
}

impl NetworkScheme {
    fn allows(self, scheme: &str) -> bool {
        match self {
            Self::Http => matches!(scheme, "http" | "https"),
            Self::WebSocket => matches!(scheme, "ws" | "wss"),
        }
    }

    fn expected(self) -> &'static str {
        match self {
            Self::Http => "http or https",
            Self::WebSocket => "ws or wss",
        }
    }
}

/// Hostname suffixes that only resolve inside private networks.
const PRIVATE_SUFFIXES: &[&str] = &[".localhost", ".local", ".internal", ".lan", ".home.arpa", ".intranet"];

/// Parse and validate a URL a script wants to reach.
pub fn validate_network_target(
    raw: &str,
    scheme: NetworkScheme,
    allow_private: bool,
) -> Result<Url, ScriptError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ScriptError::validation("URL is empty"));
    }
    if raw.len() > MAX_URL_LEN {
        return Err(ScriptError::validation(format!(
            "URL exceeds {MAX_URL_LEN} bytes"
        )));
    }

    let url =
        Url::parse(raw).map_err(|e| ScriptError::validation(format!("invalid URL '{raw}': {e}")))?;

    if !scheme.allows(url.scheme()) {
        return Err(ScriptError::validation(format!(
            "URL scheme must be {} (got '{}')",
            scheme.expected(),
            url.scheme()
        )));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(ScriptError::validation("URLs with embedded credentials are not allowed"));
    }

    let host = url
        .host()
        .ok_or_else(|| ScriptError::validation("URL must include a host"))?;

    if allow_private {
        return Ok(url);
    }

    if let Some(raw_host) = raw_authority_host(raw) {
        if is_ambiguous_numeric_host(&raw_host) {
            return Err(private_target(&raw_host));
        }
    }

    match host {
        Host::Ipv4(ip) => {
            if !is_public_ipv4(ip) {
                return Err(private_target(&ip.to_string()));
            }
        }
        Host::Ipv6(ip) => {
            if !is_public_ipv6(ip) {
                return Err(private_target(&ip.to_string()));
            }
        }
        Host::Domain(domain) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            if !is_public_domain(&domain) {
                return Err(private_target(&domain));
            }
        }
    }

    Ok(url)
}

fn private_target(host: &str) -> ScriptError {
    ScriptError::validation(format!(
        "private network target '{host}' is not allowed (set allowPrivateNetwork to opt in)"
    ))
}

/// Whether an address may be contacted without the private-network opt-in.
#[must_use]
pub fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_public_ipv4(v4),
        IpAddr::V6(v6) => is_public_ipv6(v6),
    }
}

fn is_public_ipv4(ip: Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();
    let reserved = ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast()
        || ip.is_documentation()
        || a == 0
        // CGNAT 100.64.0.0/10
        || (a == 100 && (64..=127).contains(&b))
        // IETF protocol assignments 192.0.0.0/24
        || (a == 192 && b == 0 && c == 0)
        // Benchmarking 198.18.0.0/15
        || (a == 198 && (b == 18 || b == 19))
        // Reserved 240.0.0.0/4
        || a >= 240;
    !reserved
}

fn is_public_ipv6(ip: Ipv6Addr) -> bool {
    let segments = ip.segments();
    // IPv4-mapped (::ffff:a.b.c.d) and IPv4-compatible (::a.b.c.d) forms are
    // refused outright rather than unwrapped.
    let ipv4_embedded = segments[..5].iter().all(|s| *s == 0)
        && (segments[5] == 0xffff || (segments[5] == 0 && !ip.is_loopback() && !ip.is_unspecified()));
    let reserved = ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        || ipv4_embedded
        // Unique local fc00::/7
        || (segments[0] & 0xfe00) == 0xfc00
        // Link-local fe80::/10
        || (segments[0] & 0xffc0) == 0xfe80
        // Site-local fec0::/10 (deprecated)
        || (segments[0] & 0xffc0) == 0xfec0
        // Documentation 2001:db8::/32
        || (segments[0] == 0x2001 && segments[1] == 0x0db8);
    !reserved
}

fn is_public_domain(domain: &str) -> bool {
    if domain.is_empty() || domain == "localhost" {
        return false;
    }
    if PRIVATE_SUFFIXES.iter().any(|suffix| domain.ends_with(suffix)) {
        return false;
    }
    // Single-label names resolve through search domains, i.e. the LAN.
    if !domain.contains('.') {
        return false;
    }
    // A dotted name made only of digits/hex would have been parsed as an IP;
    // if it wasn't, it is something odd.
    let last = domain.rsplit('.').next().unwrap_or_default();
    !last.chars().all(|c| c.is_ascii_digit())
}

/// Extract the host exactly as written (before WHATWG normalization).
fn raw_authority_host(raw: &str) -> Option<String> {
    let after_scheme = raw.split_once("://")?.1;
    let authority = after_scheme
        .split(['/', '?', '#', '\\'])
        .next()
        .unwrap_or_default();
    let host_port = authority.rsplit('@').next().unwrap_or_default();
    if host_port.starts_with('[') {
        // IPv6 literal, classified after parsing.
        return None;
    }
    let host = host_port.split(':').next().unwrap_or_default();
    Some(host.to_ascii_lowercase())
}

/// Hosts like `0x7f.0.0.1`, `0177.0.0.1`, `2130706433` or `127.1`.
///
/// URL parsers fold these into dotted-quad addresses, but other components
/// (proxies, logs, allowlists) may read them differently, so they are refused.
fn is_ambiguous_numeric_host(host: &str) -> bool {
    let host = host.trim_end_matches('.');
    if host.is_empty() {
        return false;
    }
    let labels: Vec<&str> = host.split('.').collect();
    let numeric_like = |label: &str| {
        !label.is_empty()
            && (label.chars().all(|c| c.is_ascii_digit())
                || ((label.starts_with("0x") || label.starts_with("0X"))
                    && label[2..].chars().all(|c| c.is_ascii_hexdigit())))
    };
    if !labels.iter().all(|l| numeric_like(l)) {
        return false;
    }
    if labels.len() != 4 {
        return true;
    }
    labels.iter().any(|label| {
        label.starts_with("0x")
            || label.starts_with("0X")
            || (label.len() > 1 && label.starts_with('0'))
            || label.parse::<u32>().map_or(true, |n| n > 255)
    })
}

/// Resolve `host:port` to the addresses a connection may use.
///
/// Unless `allow_private` is set, fails when any address is not public.
/// Callers connect to the returned addresses instead of resolving again, so
/// a second lookup can't hand back a different answer.
pub async fn resolve_target(
    host: &str,
    port: u16,
    allow_private: bool,
) -> Result<Vec<SocketAddr>, ScriptError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ScriptError::transport(format!("failed to resolve {host}: {e}")))?
        .collect();
    if addrs.is_empty() {
        return Err(ScriptError::transport(format!("{host} did not resolve")));
    }
    if !allow_private {
        if let Some(addr) = addrs.iter().find(|a| !is_public_ip(a.ip())) {
            return Err(ScriptError::validation(format!(
                "{host} resolves to private address {}",
                addr.ip()
            )));
        }
    }
    Ok(addrs)
}

/// DNS resolver for `reqwest` that drops non-public addresses.
#[derive(Debug, Clone, Default)]
pub struct SafeDnsResolver;

impl reqwest::dns::Resolve for SafeDnsResolver {
    fn resolve(&self, name: reqwest::dns::Name) -> reqwest::dns::Resolving {
        let name = name.as_str().to_string();
        Box::pin(async move {
            let addrs = tokio::net::lookup_host((name.as_str(), 0))
                .await
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?;

            let public: Vec<_> = addrs.filter(|a| is_public_ip(a.ip())).collect();
            if public.is_empty() {
                return Err(Box::new(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    format!("{name} resolved only to private or local addresses"),
                )) as Box<dyn std::error::Error + Send + Sync>);
            }
            let addrs: reqwest::dns::Addrs = Box::new(public.into_iter());
            Ok(addrs)
        })
    }
}
