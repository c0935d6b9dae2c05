//! DNS check using raw UDP packets.
//!
//! Sends a single A query for the target name to a recursive resolver and
//! reads the A records out of the answer section.

use std::fs;
use std::net::{Ipv4Addr, UdpSocket};
use std::time::{Duration, Instant};

use serde_json::Value;

use super::{elapsed_ms, CheckOutcome, Diagnostics, LatencyLimits, ProbeError};

/// Resolver used when none is configured and `/etc/resolv.conf` has none.
pub const FALLBACK_RESOLVER: &str = "8.8.8.8";

const RESOLV_CONF: &str = "/etc/resolv.conf";

const TYPE_A: u16 = 1;
const CLASS_IN: u16 = 1;

/// Resolve `name` to its A records within `timeout`, then grade latency.
pub async fn check_dns(
    name: &str,
    server: Option<&str>,
    timeout: Duration,
    limits: LatencyLimits,
) -> CheckOutcome {
    let server = server
        .map(str::to_string)
        .or_else(system_resolver)
        .unwrap_or_else(|| FALLBACK_RESOLVER.to_string());
    let query_name = name.to_string();

    let start = Instant::now();
    let result = tokio::task::spawn_blocking(move || resolve_a(&query_name, &server, timeout))
        .await
        .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))
        .and_then(|r| r);
    let latency_ms = elapsed_ms(start);

    match result {
        Ok(addrs) => {
            let mut meta = Diagnostics::new();
            meta.insert(
                "answers".into(),
                Value::Array(addrs.iter().map(|a| Value::String(a.to_string())).collect()),
            );
            limits.grade(latency_ms, meta, "slow_dns")
        }
        Err(e) => CheckOutcome::from_error(latency_ms, Diagnostics::new(), &e),
    }
}

/// First `nameserver` entry from `/etc/resolv.conf`.
fn system_resolver() -> Option<String> {
    let contents = fs::read_to_string(RESOLV_CONF).ok()?;
    parse_resolv_conf(&contents)
}

fn parse_resolv_conf(contents: &str) -> Option<String> {
    contents.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("nameserver"), Some(addr)) => Some(addr.to_string()),
            _ => None,
        }
    })
}

/// Turn `host`, `host:port`, `v6` or `[v6]:port` into a socket address string.
fn server_address(server: &str) -> String {
    if server.starts_with('[') {
        return server.to_string();
    }
    match server.matches(':').count() {
        0 => format!("{}:53", server),
        1 => server.to_string(),
        _ => format!("[{}]:53", server),
    }
}

/// Blocking A lookup. Runs on the blocking pool.
fn resolve_a(name: &str, server: &str, timeout: Duration) -> Result<Vec<Ipv4Addr>, ProbeError> {
    let target_addr = server_address(server);
    let bind_addr = if target_addr.starts_with('[') {
        "[::]:0"
    } else {
        "0.0.0.0:0"
    };

    let tx_id: u16 = rand::random();
    let packet = build_dns_query(tx_id, name)?;

    let socket = UdpSocket::bind(bind_addr)
        .map_err(|e| ProbeError::Network(format!("failed to bind socket: {}", e)))?;

    socket
        .connect(&target_addr)
        .map_err(|e| ProbeError::Network(format!("failed to connect: {}", e)))?;

    let deadline = Instant::now() + timeout;

    socket
        .send(&packet)
        .map_err(|e| ProbeError::Network(format!("failed to send: {}", e)))?;

    let mut response = [0u8; 1232];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ProbeError::Timeout(timeout));
        }
        socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| ProbeError::Network(format!("failed to set timeout: {}", e)))?;

        let n = socket.recv(&mut response).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut || e.kind() == std::io::ErrorKind::WouldBlock
            {
                ProbeError::Timeout(timeout)
            } else {
                ProbeError::Network(format!("failed to recv: {}", e))
            }
        })?;

        // Stale or spoofed replies are ignored
        if n >= 2 && u16::from_be_bytes([response[0], response[1]]) == tx_id {
            return parse_a_records(&response[..n], name);
        }
    }
}

/// Build a DNS query packet for the A record of `name`.
fn build_dns_query(tx_id: u16, name: &str) -> Result<Vec<u8>, ProbeError> {
    let flags: u16 = 0x0100; // Standard query, recursion desired

    let mut packet = Vec::with_capacity(32 + name.len());
    packet.extend_from_slice(&tx_id.to_be_bytes());
    packet.extend_from_slice(&flags.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // ANCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT

    // Length-prefixed labels
    for label in name.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(ProbeError::Config(format!("invalid DNS name: {}", name)));
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);

    packet.extend_from_slice(&TYPE_A.to_be_bytes());
    packet.extend_from_slice(&CLASS_IN.to_be_bytes());

    Ok(packet)
}

/// Advance past a (possibly compressed) domain name starting at `pos`.
fn skip_name(msg: &[u8], mut pos: usize) -> Result<usize, ProbeError> {
    loop {
        let len = *msg
            .get(pos)
            .ok_or_else(|| ProbeError::Network("truncated DNS response".to_string()))?;
        match len {
            0 => return Ok(pos + 1),
            l if l & 0xC0 == 0xC0 => return Ok(pos + 2),
            l => pos += 1 + l as usize,
        }
    }
}

fn read_u16(msg: &[u8], pos: usize) -> Result<u16, ProbeError> {
    msg.get(pos..pos + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| ProbeError::Network("truncated DNS response".to_string()))
}

/// Extract A records from a response. Non-zero RCODE or an answer with no
/// A records is an error.
fn parse_a_records(msg: &[u8], name: &str) -> Result<Vec<Ipv4Addr>, ProbeError> {
    if msg.len() < 12 {
        return Err(ProbeError::Network(format!(
            "response too short: {} bytes",
            msg.len()
        )));
    }

    // RCODE is the lower 4 bits of byte 3
    let rcode = msg[3] & 0x0F;
    if rcode != 0 {
        let label = match rcode {
            2 => "SERVFAIL",
            3 => "NXDOMAIN",
            5 => "REFUSED",
            _ => "error",
        };
        return Err(ProbeError::Network(format!(
            "DNS {} for {} (RCODE {})",
            label, name, rcode
        )));
    }

    let qd_count = read_u16(msg, 4)?;
    let an_count = read_u16(msg, 6)?;

    let mut pos = 12;
    for _ in 0..qd_count {
        pos = skip_name(msg, pos)? + 4;
    }

    let mut addrs = Vec::new();
    for _ in 0..an_count {
        pos = skip_name(msg, pos)?;
        let rtype = read_u16(msg, pos)?;
        let rclass = read_u16(msg, pos + 2)?;
        let rdlen = read_u16(msg, pos + 8)? as usize;
        let rdata = msg
            .get(pos + 10..pos + 10 + rdlen)
            .ok_or_else(|| ProbeError::Network("truncated DNS response".to_string()))?;

        if rtype == TYPE_A && rclass == CLASS_IN && rdlen == 4 {
            addrs.push(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]));
        }
        pos += 10 + rdlen;
    }

    if addrs.is_empty() {
        return Err(ProbeError::Network(format!("no A records for {}", name)));
    }

    Ok(addrs)
}
