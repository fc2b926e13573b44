//! Small address helpers shared by discovery and the CLI.

use anyhow::{anyhow, Result};
use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// Best-effort local network IP, via the routing trick of connecting a
/// UDP socket to a public address (no packets are sent). Falls back to
/// loopback when the host has no route.
pub fn local_ip() -> IpAddr {
    let fallback = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let Ok(socket) = UdpSocket::bind("0.0.0.0:0") else {
        return fallback;
    };
    if socket.connect("8.8.8.8:80").is_err() {
        return fallback;
    }
    socket.local_addr().map(|addr| addr.ip()).unwrap_or(fallback)
}

/// Extract the port from a listen address like `:3000` or `0.0.0.0:3000`.
pub fn parse_listen_port(listen_addr: &str) -> Result<u16> {
    let port = listen_addr
        .rsplit(':')
        .next()
        .ok_or_else(|| anyhow!("invalid listen address: {listen_addr}"))?;
    port.parse()
        .map_err(|_| anyhow!("invalid listen address: {listen_addr}"))
}

/// Combine an IP with the port of a listen address.
pub fn build_advertise_addr(ip: &IpAddr, listen_addr: &str) -> Result<String> {
    let port = parse_listen_port(listen_addr)?;
    Ok(match ip {
        IpAddr::V4(v4) => format!("{v4}:{port}"),
        IpAddr::V6(v6) => format!("[{v6}]:{port}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listen_ports() {
        assert_eq!(parse_listen_port(":3000").unwrap(), 3000);
        assert_eq!(parse_listen_port("0.0.0.0:4000").unwrap(), 4000);
        assert_eq!(parse_listen_port("localhost:5000").unwrap(), 5000);
        assert!(parse_listen_port("nonsense").is_err());
        assert!(parse_listen_port(":").is_err());
    }

    #[test]
    fn builds_advertise_addrs() {
        let v4: IpAddr = "192.168.1.5".parse().unwrap();
        assert_eq!(build_advertise_addr(&v4, ":3000").unwrap(), "192.168.1.5:3000");

        let v6: IpAddr = "fe80::1".parse().unwrap();
        assert_eq!(build_advertise_addr(&v6, ":3000").unwrap(), "[fe80::1]:3000");
    }

    #[test]
    fn local_ip_is_usable() {
        // Whatever the host routes through, the helper must yield an IP.
        let _ = local_ip();
    }
}
