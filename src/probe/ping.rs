//! ICMP echo check with native sockets and a `ping` command fallback.
//!
//! Native sockets run inside `spawn_blocking`; a RAW socket is tried first and an
//! unprivileged DGRAM socket second. When neither can be opened the system `ping`
//! binary is used instead.

use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::ProbeError;

const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    Native,
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Identifier/sequence pair so concurrent pings to one host can be told apart.
fn next_echo_id() -> (u16, u16) {
    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

fn detect_icmp_capability() -> IcmpCapability {
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket)");
        return IcmpCapability::Native;
    }
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket)");
        return IcmpCapability::Native;
    }
    tracing::info!("Ping probe: native ICMP unavailable, using ping command");
    IcmpCapability::CommandOnly
}

/// Ping `host` once and return the round-trip time.
pub async fn run_ping_probe(host: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);
    if capability == IcmpCapability::CommandOnly {
        return run_ping_command(host, timeout).await;
    }

    let ip = resolve_host(host).await?;
    let result = tokio::task::spawn_blocking(move || ping_blocking(ip, timeout))
        .await
        .map_err(|e| ProbeError::Network(format!("ping task failed: {}", e)))?;

    match result {
        Err(ProbeError::Network(msg)) if is_permission_error(&msg) => {
            tracing::warn!("Native ping to {} not permitted, falling back to command: {}", host, msg);
            run_ping_command(host, timeout).await
        }
        other => other,
    }
}

fn is_permission_error(msg: &str) -> bool {
    msg.contains("Permission") || msg.contains("Operation not permitted") || msg.contains("denied")
}

async fn resolve_host(host: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host(format!("{}:0", host))
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed for {}: {}", host, e)))?
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Network(format!("no addresses found for {}", host)))
}

fn ping_blocking(ip: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
    let (domain, protocol, request_type, reply_type) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4, ICMP_ECHO_REQUEST, ICMP_ECHO_REPLY),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6, ICMPV6_ECHO_REQUEST, ICMPV6_ECHO_REPLY),
    };

    // Unprivileged DGRAM ping sockets have the echo id rewritten by the kernel.
    let (mut socket, kernel_assigns_id) = match Socket::new(domain, Type::RAW, Some(protocol)) {
        Ok(socket) => (socket, false),
        Err(_) => Socket::new(domain, Type::DGRAM, Some(protocol))
            .map(|socket| (socket, true))
            .map_err(|e| ProbeError::Network(format!("failed to create ICMP socket: {}", e)))?,
    };
    socket
        .set_read_timeout(Some(timeout))
        .and_then(|_| socket.set_write_timeout(Some(timeout)))
        .map_err(|e| ProbeError::Network(format!("socket timeout: {}", e)))?;
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| ProbeError::Network(format!("cannot reach {}: {}", ip, e)))?;

    let (identifier, sequence) = next_echo_id();
    let packet = build_echo_request(request_type, identifier, sequence, ip.is_ipv4());
    let expected_id = (!kernel_assigns_id).then_some(identifier);

    let start = Instant::now();
    socket.send(&packet).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ProbeError::Network(format!("Permission denied: {}", e))
        } else {
            ProbeError::Network(format!("failed to send: {}", e))
        }
    })?;

    let mut buf = [0u8; 1500];
    loop {
        let len = socket.read(&mut buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => ProbeError::Timeout(timeout),
            _ => ProbeError::Network(format!("failed to receive: {}", e)),
        })?;
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }
        if is_our_reply(&buf[..len], reply_type, expected_id, sequence) {
            return Ok(elapsed);
        }
    }
}

/// Check an incoming datagram against the echo we sent.
///
/// RAW IPv4 sockets deliver the IP header too; DGRAM sockets and ICMPv6 do not.
/// `identifier` is `None` when the kernel owns the echo id.
fn is_our_reply(packet: &[u8], reply_type: u8, identifier: Option<u16>, sequence: u16) -> bool {
    let offset = if reply_type == ICMP_ECHO_REPLY && packet.first().map(|b| b >> 4) == Some(4) {
        usize::from(packet[0] & 0x0F) * 4
    } else {
        0
    };
    let Some(icmp) = packet.get(offset..offset + 8) else {
        return false;
    };
    icmp[0] == reply_type
        && identifier.map_or(true, |id| u16::from_be_bytes([icmp[4], icmp[5]]) == id)
        && u16::from_be_bytes([icmp[6], icmp[7]]) == sequence
}

/// Echo request: 8-byte header plus a 56-byte payload carrying a timestamp.
///
/// ICMPv6 checksums are filled in by the kernel, so only v4 computes one.
fn build_echo_request(request_type: u8, identifier: u16, sequence: u16, with_checksum: bool) -> Vec<u8> {
    let mut packet = vec![0u8; 64];
    packet[0] = request_type;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    packet[8..16].copy_from_slice(&timestamp.to_be_bytes());

    if with_checksum {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }
    packet
}

/// RFC 1071 internet checksum.
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u32::from(u16::from_be_bytes([*hi, *lo])),
            [hi] => u32::from(*hi) << 8,
            _ => 0,
        })
        .sum();
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

async fn run_ping_command(host: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    #[cfg(windows)]
    let args = ["-n".to_string(), "1".to_string(), "-w".to_string(), timeout.as_millis().max(1000).to_string(), host.to_string()];
    #[cfg(not(windows))]
    let args = ["-c".to_string(), "1".to_string(), "-W".to_string(), timeout.as_secs().max(1).to_string(), host.to_string()];

    let output = Command::new("ping")
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("ping unavailable: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("timeout") || stdout.contains("100% packet loss") || stdout.contains("100.0% packet loss") {
            return Err(ProbeError::Timeout(timeout));
        }
        return Err(ProbeError::Command(format!("ping {} failed: {}", host, stdout.trim())));
    }

    parse_ping_output(&stdout)
}

/// Extract the round-trip time from `ping` output.
fn parse_ping_output(output: &str) -> Result<Duration, ProbeError> {
    static PER_PACKET: OnceLock<Option<Regex>> = OnceLock::new();
    static SUMMARY: OnceLock<Option<Regex>> = OnceLock::new();

    // "time=12.3 ms" / "time<1ms"
    let per_packet = PER_PACKET.get_or_init(|| Regex::new(r"time[=<](?P<ms>[0-9.]+)\s*ms").ok());
    // "rtt min/avg/max/mdev = a/b/c/d" (Linux) or "round-trip min/avg/max/stddev = ..." (macOS)
    let summary = SUMMARY.get_or_init(|| {
        Regex::new(r"(?:rtt|round-trip)\s+min/avg/max/(?:mdev|stddev)\s*=\s*[0-9.]+/(?P<ms>[0-9.]+)/").ok()
    });

    [per_packet, summary]
        .into_iter()
        .flatten()
        .find_map(|re| re.captures(output)?.name("ms")?.as_str().parse::<f64>().ok())
        .map(|ms| Duration::from_secs_f64(ms / 1000.0))
        .ok_or_else(|| ProbeError::Command(format!("failed to parse ping output: {}", output)))
}
