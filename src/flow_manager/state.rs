use super::*;
use std::collections::VecDeque;

pub(super) const TCP_SOCKET_COUNT: usize = 128;
pub(super) const UDP_SOCKET_COUNT: usize = 128;
pub(super) const TCP_RX_BUFFER_SIZE: usize = 16 * 1024;
pub(super) const TCP_TX_BUFFER_SIZE: usize = 16 * 1024;
pub(super) const UDP_PACKET_METADATA: usize = 64;
pub(super) const UDP_BUFFER_SIZE: usize = 32 * 1024;
pub(super) const MAX_DIAL_ATTEMPTS: u8 = 3;
pub(super) const DIAL_BACKOFF_BASE_MS: u64 = 50;
/// Default idle window before an established UDP session is reclaimed.
pub(super) const DEFAULT_UDP_IDLE_TIMEOUT: StdDuration = StdDuration::from_secs(300);
pub(super) const MAX_BUFFERED_PAYLOADS: usize = 8;
pub(super) const MAX_BUFFERED_BYTES: usize = 64 * 1024;
/// Cooldown before the first retry after a TCP socket reports backpressure.
pub(super) const TCP_BACKPRESSURE_RETRY_MS: u64 = 20;
/// Ceiling the exponential backpressure cooldown backs off to.
pub(super) const TCP_BACKPRESSURE_MAX_COOLDOWN_MS: u64 = 2_000;

#[derive(Debug, Clone)]
pub(super) struct FlowEntry {
    pub(super) socket: SocketHandle,
    pub(super) kind: FlowKind,
    pub(super) handle: u64,
    pub(super) uid: u32,
    pub(super) ready: bool,
    pub(super) pending_dial: bool,
    pub(super) dial_attempts: u8,
    pub(super) dial_started_at: Option<StdInstant>,
    pub(super) next_redial_at: Option<StdInstant>,
    pub(super) last_activity: StdInstant,
    pub(super) buffered: VecDeque<Vec<u8>>,
    pub(super) buffered_bytes: usize,
    pub(super) client_closed: bool,
    pub(super) backpressure_cooldown_ms: u64,
    pub(super) backpressure_retry_at: Option<StdInstant>,
    /// Set once a UDP flow has been identified as carrying DNS traffic; once
    /// latched this flow is exempt from idle eviction for its lifetime even
    /// if a later datagram on the same 5-tuple is not itself a DNS message.
    pub(super) dns_hijack: bool,
    /// Hostname recovered by protocol sniffing (QUIC SNI today), used in
    /// place of the destination IP when dialing if override is enabled.
    pub(super) sniffed_host: Option<String>,
    /// Set when this flow was dialed in-process through the protected
    /// dialer; outbound host payloads go through this channel instead of
    /// `BridgeCallbacks::tcp_send`/`udp_send`.
    pub(super) protected_writer: Option<tokio::sync::mpsc::UnboundedSender<Vec<u8>>>,
}

#[derive(Clone, Copy, Hash, Eq, PartialEq, Debug)]
pub enum FlowKind {
    Tcp,
    Udp,
}

pub enum FlowStatus {
    Ok,
    Backpressure(&'static str),
    Closed(&'static str),
}

#[derive(Hash, Eq, PartialEq, Clone, Copy)]
pub(super) struct FlowKey {
    pub(super) src_ip: IpAddress,
    pub(super) src_port: u16,
    pub(super) dst_ip: IpAddress,
    pub(super) dst_port: u16,
    pub(super) kind: FlowKind,
}

impl FlowKey {
    pub(super) fn from_tcp(packet: &TcpPacket<'_>) -> Self {
        FlowKey {
            src_ip: ip_address_from_std(packet.src),
            src_port: packet.src_port,
            dst_ip: ip_address_from_std(packet.dst),
            dst_port: packet.dst_port,
            kind: FlowKind::Tcp,
        }
    }

    pub(super) fn from_udp(packet: &UdpPacket<'_>) -> Self {
        FlowKey {
            src_ip: ip_address_from_std(packet.src),
            src_port: packet.src_port,
            dst_ip: ip_address_from_std(packet.dst),
            dst_port: packet.dst_port,
            kind: FlowKind::Udp,
        }
    }
}

pub(super) fn ip_string(ip: IpAddress) -> String {
    match ip {
        IpAddress::Ipv4(addr) => addr.to_string(),
        IpAddress::Ipv6(addr) => addr.to_string(),
    }
}

fn ip_address_from_std(addr: std::net::IpAddr) -> IpAddress {
    match addr {
        std::net::IpAddr::V4(v4) => IpAddress::Ipv4(Ipv4Address::from_bytes(&v4.octets())),
        std::net::IpAddr::V6(v6) => IpAddress::Ipv6(Ipv6Address::from_bytes(&v6.octets())),
    }
}

pub(super) fn dial_backoff_delay(attempt: u8) -> StdDuration {
    let shift = attempt.saturating_sub(1).min(4) as u32;
    let multiplier = 1u64 << shift;
    StdDuration::from_millis(DIAL_BACKOFF_BASE_MS * multiplier)
}

pub(super) fn buffer_payload(entry: &mut FlowEntry, payload: &[u8]) -> bool {
    if payload.is_empty() {
        return true;
    }
    if payload.len() > MAX_BUFFERED_BYTES {
        return false;
    }

    while entry.buffered.len() >= MAX_BUFFERED_PAYLOADS
        || entry.buffered_bytes + payload.len() > MAX_BUFFERED_BYTES
    {
        if let Some(evicted) = entry.buffered.pop_front() {
            entry.buffered_bytes = entry.buffered_bytes.saturating_sub(evicted.len());
        } else {
            break;
        }
    }

    if entry.buffered.len() >= MAX_BUFFERED_PAYLOADS
        || entry.buffered_bytes + payload.len() > MAX_BUFFERED_BYTES
    {
        return false;
    }

    entry.buffered.push_back(payload.to_vec());
    entry.buffered_bytes += payload.len();
    true
}

/// True if `key` carries DNS traffic: either endpoint uses port 53, or the
/// datagram is addressed to the engine's virtual router address (the
/// DNS-hijack target the host points the system resolver at).
pub(super) fn is_dns_port(key: &FlowKey, router_v4: IpAddress, router_v6: IpAddress) -> bool {
    key.src_port == 53 || key.dst_port == 53 || key.dst_ip == router_v4 || key.dst_ip == router_v6
}
