//! Ping check with native ICMP and command fallback.
//!
//! Native ICMP runs on blocking sockets inside `spawn_blocking`.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use regex::Regex;
use serde_json::{json, Value};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::{elapsed_ms, CheckOutcome, Diagnostics, LatencyLimits, ProbeError};

/// ICMP capability state
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    /// Native ICMP sockets are available
    Native,
    /// Only command fallback is available
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

/// Ping sequence counter for unique identification
static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// How a reply was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingMethod {
    Icmp,
    Command,
}

impl PingMethod {
    fn as_str(self) -> &'static str {
        match self {
            PingMethod::Icmp => "icmp",
            PingMethod::Command => "command",
        }
    }
}

/// A successful echo reply.
#[derive(Debug, Clone, Copy)]
pub struct PingReply {
    pub rtt: Duration,
    pub method: PingMethod,
}

/// Check reachability of `host` with a single echo request.
///
/// No reply, an unreachable host or a failing command are hard failures;
/// a reply at or above the warn limit is WARN.
pub async fn check_ping(host: &str, timeout: Duration, limits: LatencyLimits) -> CheckOutcome {
    let start = Instant::now();
    let result = ping_once(host, timeout).await;
    let latency_ms = elapsed_ms(start);

    match result {
        Ok(reply) => {
            let mut meta = Diagnostics::new();
            meta.insert(
                "rtt_ms".into(),
                json!((reply.rtt.as_secs_f64() * 1000.0 * 1000.0).round() / 1000.0),
            );
            meta.insert("method".into(), Value::String(reply.method.as_str().into()));
            limits.grade(latency_ms, meta, "slow_ping")
        }
        Err(e) => CheckOutcome::from_error(latency_ms, Diagnostics::new(), &e),
    }
}

/// Generate a unique identifier for each ping request.
/// This ensures concurrent pings can be distinguished even to the same destination.
fn generate_ping_id() -> (u16, u16) {
    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

/// Detect ICMP capability by attempting to create a socket.
fn detect_icmp_capability() -> IcmpCapability {
    // Try RAW socket first (requires CAP_NET_RAW or root)
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping check: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Native;
    }

    // DGRAM works unprivileged on Linux with ping_group_range set, or macOS
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping check: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }

    tracing::info!("Ping check: native ICMP unavailable, using command fallback");
    IcmpCapability::CommandOnly
}

/// Send one echo request to `address` and wait for the matching reply.
pub async fn ping_once(address: &str, timeout: Duration) -> Result<PingReply, ProbeError> {
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

    if capability == IcmpCapability::Native {
        let ip = resolve_address(address).await?;

        let result = tokio::task::spawn_blocking(move || run_blocking_ping(ip, timeout))
            .await
            .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?;

        match result {
            Ok(rtt) => {
                return Ok(PingReply {
                    rtt,
                    method: PingMethod::Icmp,
                })
            }
            Err(ProbeError::Network(msg)) if is_permission_error(&msg) => {
                tracing::warn!(
                    "Native ping failed with permission error for {}, falling back to command: {}",
                    address,
                    msg
                );
            }
            Err(e) => return Err(e),
        }
    }

    let rtt = run_ping_command(address, timeout).await?;
    Ok(PingReply {
        rtt,
        method: PingMethod::Command,
    })
}

fn is_permission_error(msg: &str) -> bool {
    msg.contains("Permission") || msg.contains("Operation not permitted") || msg.contains("denied")
}

/// Resolve hostname to IP address.
async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    let mut addrs = tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?;

    addrs
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Network(format!("No addresses found for {}", address)))
}

/// Run blocking ICMP ping with precise timing.
/// This runs in a dedicated thread via spawn_blocking.
fn run_blocking_ping(ip: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
    let (domain, protocol, request_type, reply_type) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4, 8u8, 0u8),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6, 128u8, 129u8),
    };

    // Try RAW first (privileged), then DGRAM (unprivileged)
    let (socket, is_dgram) = match Socket::new(domain, Type::RAW, Some(protocol)) {
        Ok(socket) => (socket, false),
        Err(_) => {
            let socket = Socket::new(domain, Type::DGRAM, Some(protocol)).map_err(|e| {
                ProbeError::Network(format!("Failed to create ICMP socket: {}", e))
            })?;
            (socket, true)
        }
    };

    socket
        .set_read_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;
    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;

    let dest = SocketAddr::new(ip, 0);
    socket
        .connect(&dest.into())
        .map_err(|e| ProbeError::Network(format!("Failed to connect: {}", e)))?;

    let (identifier, sequence) = generate_ping_id();
    let packet = build_echo_request(request_type, identifier, sequence);

    let start = Instant::now();

    socket.send(&packet).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ProbeError::Network(format!("Permission denied: {}", e))
        } else {
            ProbeError::Network(format!("Failed to send: {}", e))
        }
    })?;

    // Loop until we get OUR reply or time out
    loop {
        let mut buf = [MaybeUninit::<u8>::uninit(); 1500];
        let len = socket.recv(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut
            {
                ProbeError::Timeout(timeout)
            } else {
                ProbeError::Network(format!("Failed to receive: {}", e))
            }
        })?;
        // SAFETY: recv initialized `len` bytes
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        if matches_echo_reply(buf, reply_type, identifier, sequence, is_dgram) {
            return Ok(elapsed);
        }
        // Someone else's packet, keep waiting
    }
}

/// Check whether `buf` is the echo reply for (`identifier`, `sequence`).
///
/// RAW IPv4 sockets deliver the IP header in front of the ICMP message;
/// DGRAM and ICMPv6 sockets deliver the ICMP message alone.
fn matches_echo_reply(
    buf: &[u8],
    reply_type: u8,
    identifier: u16,
    sequence: u16,
    is_dgram: bool,
) -> bool {
    let offset = if !is_dgram && reply_type == 0 && !buf.is_empty() && buf[0] >> 4 == 4 {
        usize::from(buf[0] & 0x0F) * 4
    } else {
        0
    };
    if buf.len() < offset + 8 {
        return false;
    }
    let icmp = &buf[offset..];
    let id = u16::from_be_bytes([icmp[4], icmp[5]]);
    let seq = u16::from_be_bytes([icmp[6], icmp[7]]);

    // DGRAM sockets on Linux rewrite the identifier and only deliver
    // replies for this socket, so only the sequence is trusted there.
    icmp[0] == reply_type && seq == sequence && (is_dgram || id == identifier)
}

/// Build an ICMP/ICMPv6 Echo Request packet.
fn build_echo_request(request_type: u8, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64]; // 8 byte header + 56 byte payload

    packet[0] = request_type;
    packet[1] = 0; // Code
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    packet[8..16].copy_from_slice(&timestamp.to_be_bytes());

    // The kernel fills in the ICMPv6 checksum
    if request_type == 8 {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }

    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);

    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

/// Run ping via the system command.
async fn run_ping_command(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let timeout_secs = timeout.as_secs().max(1);

    let output = Command::new("ping")
        .args(["-c", "1", "-W", &timeout_secs.to_string(), address])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("timeout")
            || stdout.contains("100% packet loss")
            || stdout.contains("100.0% packet loss")
        {
            return Err(ProbeError::Timeout(timeout));
        }
        let detail = if stderr.trim().is_empty() {
            format!("ping_failed (exit {})", output.status.code().unwrap_or(-1))
        } else {
            stderr.trim().to_string()
        };
        return Err(ProbeError::Command(detail));
    }

    parse_ping_output(&stdout)
}

/// Parse ping command output for latency.
fn parse_ping_output(output: &str) -> Result<Duration, ProbeError> {
    // Per-packet response "time=X.XXX ms" (Linux, some macOS)
    static PER_PACKET: OnceLock<Option<Regex>> = OnceLock::new();
    // Summary line, "round-trip min/avg/max/stddev" (macOS) or "rtt min/avg/max/mdev" (Linux)
    static SUMMARY: OnceLock<Option<Regex>> = OnceLock::new();

    let per_packet = PER_PACKET
        .get_or_init(|| Regex::new(r"time[=<](?P<val>[0-9.]+)\s*ms").ok())
        .as_ref();
    let summary = SUMMARY
        .get_or_init(|| {
            Regex::new(
                r"(?:round-trip|rtt)\s+min/avg/max/(?:stddev|mdev)\s*=\s*[0-9.]+/(?P<val>[0-9.]+)/[0-9.]+",
            )
            .ok()
        })
        .as_ref();

    [per_packet, summary]
        .into_iter()
        .flatten()
        .find_map(|re| {
            re.captures(output)
                .and_then(|caps| caps.name("val"))
                .and_then(|m| m.as_str().parse::<f64>().ok())
        })
        .map(|ms| Duration::from_micros((ms * 1000.0).round() as u64))
        .ok_or_else(|| {
            ProbeError::Command(format!("failed to parse ping output: {}", output.trim()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_icmp_checksum_verifies() {
        let packet = build_echo_request(8, 0x1234, 0x0001);
        // A packet including its own checksum sums to zero
        assert_eq!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn test_icmp_checksum_odd_length() {
        assert_eq!(icmp_checksum(&[0xFF]), 0x00FF);
    }

    #[test]
    fn test_build_icmp_packet() {
        let packet = build_echo_request(8, 0x1234, 0x0001);
        assert_eq!(packet.len(), 64);
        assert_eq!(packet[0], 8);
        assert_eq!(packet[1], 0);
        assert_eq!(packet[4..6], [0x12, 0x34]);
        assert_eq!(packet[6..8], [0x00, 0x01]);
    }

    #[test]
    fn test_icmpv6_packet_leaves_checksum_to_kernel() {
        let packet = build_echo_request(128, 0xBEEF, 7);
        assert_eq!(packet[0], 128);
        assert_eq!(packet[2..4], [0, 0]);
    }

    #[test]
    fn test_matches_echo_reply_dgram() {
        let mut reply = vec![0u8; 16];
        reply[0] = 0;
        reply[4..6].copy_from_slice(&0x9999u16.to_be_bytes());
        reply[6..8].copy_from_slice(&5u16.to_be_bytes());
        assert!(matches_echo_reply(&reply, 0, 0x1234, 5, true));
        assert!(!matches_echo_reply(&reply, 0, 0x1234, 6, true));
    }

    #[test]
    fn test_raw_icmpv6_rejects_foreign_identifier() {
        let mut reply = vec![0u8; 16];
        reply[0] = 129;
        reply[4..6].copy_from_slice(&0x9999u16.to_be_bytes());
        reply[6..8].copy_from_slice(&5u16.to_be_bytes());
        assert!(!matches_echo_reply(&reply, 129, 0x1234, 5, false));

        reply[4..6].copy_from_slice(&0x1234u16.to_be_bytes());
        assert!(matches_echo_reply(&reply, 129, 0x1234, 5, false));
    }

    #[test]
    fn test_matches_echo_reply_raw_with_ip_header() {
        let mut reply = vec![0u8; 28];
        reply[0] = 0x45; // IPv4, 20-byte header
        reply[20] = 0;
        reply[24..26].copy_from_slice(&0x1234u16.to_be_bytes());
        reply[26..28].copy_from_slice(&9u16.to_be_bytes());
        assert!(matches_echo_reply(&reply, 0, 0x1234, 9, false));
        assert!(!matches_echo_reply(&reply, 0, 0x4321, 9, false));
        assert!(!matches_echo_reply(&reply[..24], 0, 0x1234, 9, false));
    }

    #[test]
    fn test_parse_ping_output_linux() {
        let output = "64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.345 ms";
        let rtt = parse_ping_output(output).unwrap();
        assert_eq!(rtt.as_micros(), 12_345);
    }

    #[test]
    fn test_parse_ping_output_macos_summary() {
        let output = r#"PING google.com (142.250.69.174): 56 data bytes

--- google.com ping statistics ---
1 packets transmitted, 1 packets received, 0.0% packet loss
round-trip min/avg/max/stddev = 17.906/17.906/17.906/0.000 ms"#;
        let rtt = parse_ping_output(output).unwrap();
        assert_eq!(rtt.as_micros(), 17_906);
    }

    #[test]
    fn test_parse_ping_output_linux_summary() {
        let output = r#"PING 8.8.8.8 (8.8.8.8) 56(84) bytes of data.
64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.3 ms

--- 8.8.8.8 ping statistics ---
1 packets transmitted, 1 received, 0% packet loss, time 0ms
rtt min/avg/max/mdev = 12.300/12.300/12.300/0.000 ms"#;
        let rtt = parse_ping_output(output).unwrap();
        // The per-packet time wins
        assert_eq!(rtt.as_micros(), 12_300);
    }

    #[test]
    fn test_parse_ping_output_garbage() {
        assert!(matches!(
            parse_ping_output("ping: unknown host"),
            Err(ProbeError::Command(_))
        ));
    }

    #[tokio::test]
    async fn test_unresolvable_host_is_hard_failure() {
        let outcome = check_ping(
            "host.invalid",
            Duration::from_secs(1),
            LatencyLimits {
                warn_ms: 500,
                very_slow_ms: 1500,
            },
        )
        .await;
        assert!(outcome.hard_down);
        assert!(outcome.meta.contains_key("error"));
    }
}
