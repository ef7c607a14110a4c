use std::net::{IpAddr, Ipv4Addr, TcpListener};

use crate::{Error, Result};

// Parses `docker port` / `podman port` output. Accepts `host:port`,
// `[v6]:port` or a bare `port`; only the first line is used.
pub fn parse_port_output(output: &str) -> Option<(String, u16)> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;

    let (host, port) = match line.rfind(':') {
        Some(idx) => (&line[..idx], &line[idx + 1..]),
        None => ("", line),
    };
    let port: u16 = port.trim().parse().ok()?;
    let host = host.trim().trim_start_matches('[').trim_end_matches(']');
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    Some((host.to_string(), port))
}

// Reserves a free host port by binding an ephemeral listener and closing it
// again. Another process may grab the port before the container starts.
pub fn allocate_host_port(host_ip: &str) -> Result<u16> {
    let ip: IpAddr = if host_ip.trim().is_empty() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        host_ip
            .trim()
            .parse()
            .map_err(|e| Error::staging("host port", format!("invalid host IP {}: {}", host_ip, e)))?
    };
    let listener = TcpListener::bind((ip, 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

// One `ip:public->private/proto` entry of the human-readable port summary.
pub fn format_port(host_ip: &str, host_port: u16, container_port: u16, proto: &str) -> String {
    let host_ip = if host_ip.is_empty() { "0.0.0.0" } else { host_ip };
    let host_port = if host_port == 0 { container_port } else { host_port };
    let proto = if proto.is_empty() { "tcp" } else { proto };
    format!("{}:{}->{}/{}", host_ip, host_port, container_port, proto)
}
