//! Host address utilities - parsing, normalization and local-address detection

use std::collections::HashSet;
use std::net::{IpAddr, ToSocketAddrs, UdpSocket};

/// Default SSH port when an address carries none.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Split a `host[:port]` form into its parts, defaulting the port.
pub fn split_host_port(addr: &str) -> (String, u16) {
    match addr.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(p) => (host.to_string(), p),
            Err(_) => (addr.to_string(), DEFAULT_SSH_PORT),
        },
        None => (addr.to_string(), DEFAULT_SSH_PORT),
    }
}

/// The host part of a `host[:port]` form.
pub fn host_of(addr: &str) -> String {
    split_host_port(addr).0
}

/// Normalize an address to `host:port` with the port made explicit.
pub fn normalize(addr: &str, default_port: u16) -> String {
    match addr.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => format!("{}:{}", host, port),
        _ => format!("{}:{}", addr, default_port),
    }
}

/// Deduplicate addresses by their normalized form, preserving declaration order.
pub fn dedup(addrs: &[String], default_port: u16) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(addrs.len());
    for addr in addrs {
        if seen.insert(normalize(addr, default_port)) {
            out.push(addr.clone());
        }
    }
    out
}

/// Best-effort primary outbound address of this machine.
///
/// Opens a UDP socket towards a public address without sending anything;
/// the kernel picks the local interface address for us.
fn primary_local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}

/// Whether an address refers to this machine.
///
/// Loopback addresses, `localhost`, the machine's hostname and the primary
/// outbound interface address all count as local.
pub fn is_local(addr: &str) -> bool {
    let host = host_of(addr);
    if host == "localhost" {
        return true;
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        if ip.is_loopback() {
            return true;
        }
        return primary_local_ip() == Some(ip);
    }
    // Hostname form: compare with our own hostname, then resolve.
    if let Ok(ours) = hostname::get() {
        if ours.to_string_lossy() == host {
            return true;
        }
    }
    if let Ok(addrs) = format!("{}:0", host).to_socket_addrs() {
        let local = primary_local_ip();
        for a in addrs {
            if a.ip().is_loopback() || local == Some(a.ip()) {
                return true;
            }
        }
    }
    false
}

/// Whether the current process runs without root privileges.
///
/// Local command bypass is disabled in that case because control-plane
/// setup mutates system state.
pub fn is_unprivileged() -> bool {
    unsafe { libc::geteuid() != 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("10.0.0.1:2222"), ("10.0.0.1".into(), 2222));
        assert_eq!(split_host_port("10.0.0.1"), ("10.0.0.1".into(), 22));
        assert_eq!(split_host_port("node-1"), ("node-1".into(), 22));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("10.0.0.1", 22), "10.0.0.1:22");
        assert_eq!(normalize("10.0.0.1:2022", 22), "10.0.0.1:2022");
    }

    #[test]
    fn test_dedup_keeps_declaration_order() {
        let addrs = vec![
            "10.0.0.2".to_string(),
            "10.0.0.1:22".to_string(),
            "10.0.0.2:22".to_string(),
        ];
        assert_eq!(dedup(&addrs, 22), vec!["10.0.0.2", "10.0.0.1:22"]);
    }

    #[test]
    fn test_loopback_is_local() {
        assert!(is_local("127.0.0.1"));
        assert!(is_local("127.0.0.1:22"));
        assert!(is_local("localhost"));
        assert!(!is_local("10.255.254.253"));
    }
}
