//! Tracks TCP/UDP flows owned by the engine.

mod dial;
mod dns;
mod interface;
mod packet_builder;
mod protect;
mod state;
mod transport;

use crate::device::{IcmpPacket, ParsedPacket, TcpPacket, TunDevice, UdpPacket};
use crate::ffi::{BridgeCallbacks, BridgePlatformCallbacks, FlowCounters, FlowStats};
use crate::logger::{self, BreadcrumbFlags};
use crate::stats::{ConnKind, StatsTable};
use smoltcp::iface::{Config as IfaceConfig, Interface, SocketHandle, SocketSet};
use smoltcp::socket::{
    tcp::{Socket as TcpSocket, SocketBuffer as TcpSocketBuffer, SendError as TcpSendError},
    udp::{PacketBuffer, PacketMetadata, Socket as UdpSocket, UdpMetadata},
};
use smoltcp::time::Instant;
use smoltcp::wire::{
    HardwareAddress, IpAddress, IpCidr, IpEndpoint, IpListenEndpoint, Ipv4Address, Ipv6Address,
};
use std::collections::{HashMap, VecDeque};
use std::ffi::CString;
use std::num::NonZeroU64;
use std::ptr;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant as StdInstant};
use tokio::sync::Notify;

pub use state::FlowKind;

use interface::{build_icmp_reply, build_interface_and_sockets, emit_frames};
use packet_builder::build_udp_response;
use state::{is_dns_port, FlowEntry, FlowKey, FlowStatus, DEFAULT_UDP_IDLE_TIMEOUT};

pub struct FlowManager {
    callbacks: Option<BridgeCallbacks>,
    platform: Option<BridgePlatformCallbacks>,
    interface: Interface,
    sockets: SocketSet<'static>,
    device: TunDevice,
    tcp_pool: Vec<SocketHandle>,
    udp_pool: Vec<SocketHandle>,
    flow_keys: HashMap<FlowKey, FlowEntry>,
    handle_map: HashMap<u64, FlowKey>,
    next_flow_id: NonZeroU64,
    counters: FlowCounters,
    wake: Arc<Notify>,
    flow_stats: FlowStats,
    stats: Arc<StatsTable>,
    udp_idle_timeout: std::time::Duration,
    dump_uid_enabled: bool,
    sniffing_enabled: bool,
    override_destination: bool,
    pending_dial_scratch: Vec<FlowKey>,
    flush_buffer: Vec<u8>,
    router_address_v4: IpAddress,
    router_address_v6: IpAddress,
    protected_events_tx: tokio::sync::mpsc::UnboundedSender<protect::ProtectedEvent>,
    protected_events_rx: tokio::sync::mpsc::UnboundedReceiver<protect::ProtectedEvent>,
}

/// UDP destination port QUIC SNI sniffing is attempted against. 443 covers
/// HTTP/3 and the overwhelming majority of QUIC deployments seen on a TUN.
const QUIC_SNI_PORT: u16 = 443;

impl FlowManager {
    pub fn new(device: TunDevice, wake: Arc<Notify>, stats: Arc<StatsTable>) -> Self {
        let (device, interface, sockets, tcp_pool, udp_pool) = build_interface_and_sockets(device);
        let (protected_events_tx, protected_events_rx) = tokio::sync::mpsc::unbounded_channel();
        Self {
            callbacks: None,
            platform: None,
            interface,
            sockets,
            device,
            tcp_pool,
            udp_pool,
            flow_keys: HashMap::new(),
            handle_map: HashMap::new(),
            next_flow_id: NonZeroU64::new(1).unwrap(),
            counters: FlowCounters::default(),
            wake,
            flow_stats: FlowStats::default(),
            stats,
            udp_idle_timeout: DEFAULT_UDP_IDLE_TIMEOUT,
            dump_uid_enabled: false,
            sniffing_enabled: false,
            override_destination: false,
            pending_dial_scratch: Vec::new(),
            flush_buffer: Vec::new(),
            router_address_v4: IpAddress::Ipv4(Ipv4Address::new(172, 19, 0, 1)),
            router_address_v6: IpAddress::Ipv6(Ipv6Address::new(0xfd, 0xfedc, 0xba98, 0x7600, 0, 0, 0, 1)),
            protected_events_tx,
            protected_events_rx,
        }
    }

    pub fn counters(&self) -> FlowCounters {
        self.counters
    }

    pub fn stats(&self) -> FlowStats {
        self.flow_stats
    }

    pub fn set_udp_idle_timeout(&mut self, timeout: std::time::Duration) {
        self.udp_idle_timeout = timeout;
    }

    pub fn set_dump_uid_enabled(&mut self, enabled: bool) {
        self.dump_uid_enabled = enabled;
    }

    pub fn set_sniffing(&mut self, sniffing: bool, override_destination: bool) {
        self.sniffing_enabled = sniffing;
        self.override_destination = override_destination;
    }

    /// Sets the virtual router addresses DNS-hijack traffic is matched
    /// against, in addition to plain port-53 traffic.
    pub fn set_router_addresses(&mut self, v4: std::net::Ipv4Addr, v6: std::net::Ipv6Addr) {
        self.router_address_v4 = IpAddress::Ipv4(Ipv4Address::from_bytes(&v4.octets()));
        self.router_address_v6 = IpAddress::Ipv6(Ipv6Address::from_bytes(&v6.octets()));
    }

    /// True when a platform `protect` callback is installed, meaning the
    /// engine dials upstream sockets itself instead of delegating to the
    /// host's async dial surface.
    fn protected_dial_enabled(&self) -> bool {
        self.platform.and_then(|platform| platform.protect).is_some()
    }

    pub fn install_callbacks(&mut self, callbacks: BridgeCallbacks) {
        self.callbacks = Some(callbacks);
        self.wake.notify_one();
    }

    pub fn install_platform_callbacks(&mut self, platform: BridgePlatformCallbacks) {
        self.platform = Some(platform);
    }

    /// Resolves the owning UID for a freshly admitted flow via the `dump_uid`
    /// platform callback. Returns 0 (unknown) when UID resolution is
    /// disabled, no callback is installed, or the host declines to answer,
    /// so the flow still proceeds without per-UID stats.
    fn resolve_uid(&self, is_udp: bool, src: IpAddress, src_port: u16, dst: IpAddress, dst_port: u16) -> u32 {
        if !self.dump_uid_enabled {
            return 0;
        }
        let Some(platform) = self.platform else {
            return 0;
        };
        let Some(dump_uid) = platform.dump_uid else {
            return 0;
        };
        let is_ipv6 = matches!(src, IpAddress::Ipv6(_));
        let Ok(src_c) = CString::new(state::ip_string(src)) else {
            return 0;
        };
        let Ok(dst_c) = CString::new(state::ip_string(dst)) else {
            return 0;
        };
        let uid = unsafe {
            dump_uid(
                is_ipv6,
                is_udp,
                src_c.as_ptr(),
                src_port,
                dst_c.as_ptr(),
                dst_port,
                platform.context,
            )
        };
        if uid < 0 {
            0
        } else {
            uid as u32
        }
    }

    fn finalize_closed_flows(&mut self, callbacks: BridgeCallbacks) {
        let closures: Vec<(u64, String)> = self
            .flow_keys
            .values()
            .filter_map(|entry| {
                if entry.kind != FlowKind::Tcp || entry.pending_dial {
                    return None;
                }
                let socket = self.sockets.get::<TcpSocket>(entry.socket);
                let state = socket.state();
                let remote_closed = matches!(
                    state,
                    smoltcp::socket::tcp::State::CloseWait
                        | smoltcp::socket::tcp::State::LastAck
                        | smoltcp::socket::tcp::State::TimeWait
                ) && entry.client_closed;
                let terminal = matches!(state, smoltcp::socket::tcp::State::Closed);
                if entry.ready && (remote_closed || terminal) {
                    let reason = if remote_closed {
                        "remote_fin".to_string()
                    } else {
                        format!("tcp_closed ({state})")
                    };
                    Some((entry.handle, reason))
                } else {
                    None
                }
            })
            .collect();

        for (handle, reason) in closures {
            self.notify_close(handle, FlowKind::Tcp, &reason, callbacks);
            self.flow_stats.tcp_flush_events = self.flow_stats.tcp_flush_events.saturating_add(1);
        }
    }

    pub fn process_packet(&mut self, packet: &ParsedPacket<'_>) {
        match packet {
            ParsedPacket::Tcp(tcp) => self.handle_tcp_packet(tcp),
            ParsedPacket::Udp(udp) => self.handle_udp_packet(udp),
            ParsedPacket::Icmp(icmp) => self.handle_icmp_packet(icmp),
            ParsedPacket::Other => {}
        }
    }

    fn handle_icmp_packet(&mut self, icmp: &IcmpPacket<'_>) {
        let Some(callbacks) = self.callbacks else {
            return;
        };
        if let Some(reply) = build_icmp_reply(icmp) {
            emit_frames(callbacks, vec![reply]);
        }
    }

    pub fn on_tcp_receive(&mut self, handle: u64, payload: &[u8]) -> bool {
        self.forward_remote_payload(handle, payload, FlowKind::Tcp)
    }

    pub fn on_udp_receive(&mut self, handle: u64, payload: &[u8]) -> bool {
        self.forward_remote_payload(handle, payload, FlowKind::Udp)
    }

    pub fn on_tcp_close(&mut self, handle: u64) {
        self.remove_flow(handle);
        self.wake.notify_one();
    }

    pub fn on_udp_close(&mut self, handle: u64) {
        self.remove_flow(handle);
        self.wake.notify_one();
    }

    pub fn set_uid_for_handle(&mut self, handle: u64, uid: u32) {
        if let Some(key) = self.handle_map.get(&handle).cloned() {
            if let Some(entry) = self.flow_keys.get_mut(&key) {
                entry.uid = uid;
            }
        }
    }

    fn handle_tcp_packet(&mut self, packet: &TcpPacket<'_>) {
        let key = FlowKey::from_tcp(packet);
        if let Some(entry) = self.flow_keys.get_mut(&key) {
            entry.last_activity = StdInstant::now();
            if packet.flags.fin || packet.flags.rst {
                entry.client_closed = true;
            }
            return;
        }
        let Some(socket) = self.tcp_pool.pop() else {
            self.counters.tcp_admission_fail += 1;
            logger::warn("FlowManager: TCP admission failed (pool exhausted)");
            if let Some(callbacks) = self.callbacks {
                if let Some(reset) = packet_builder::build_tcp_reset(packet) {
                    emit_frames(callbacks, vec![reset]);
                }
            }
            return;
        };
        let flow_id = self.new_flow_id();
        let tcp_socket = self.sockets.get_mut::<TcpSocket>(socket);
        let endpoint = IpListenEndpoint {
            addr: Some(key.dst_ip),
            port: key.dst_port,
        };
        let _ = tcp_socket.listen(endpoint);
        let uid = self.resolve_uid(false, key.src_ip, key.src_port, key.dst_ip, key.dst_port);
        self.flow_keys.insert(
            key,
            FlowEntry {
                socket,
                kind: FlowKind::Tcp,
                handle: flow_id,
                uid,
                ready: false,
                pending_dial: false,
                dial_attempts: 0,
                dial_started_at: None,
                next_redial_at: Some(StdInstant::now()),
                last_activity: StdInstant::now(),
                buffered: VecDeque::new(),
                buffered_bytes: 0,
                client_closed: packet.flags.fin || packet.flags.rst,
                backpressure_cooldown_ms: state::TCP_BACKPRESSURE_RETRY_MS,
                backpressure_retry_at: None,
                dns_hijack: false,
                sniffed_host: None,
                protected_writer: None,
            },
        );
        self.handle_map.insert(flow_id, key);
        self.stats.conn_opened(uid, ConnKind::Tcp);
        logger::breadcrumb(
            BreadcrumbFlags::FLOW,
            format!(
                "TCP flow {}:{} -> {}:{} admitted (handle {})",
                state::ip_string(key.src_ip),
                key.src_port,
                state::ip_string(key.dst_ip),
                key.dst_port,
                flow_id
            ),
        );
        self.dispatch_pending_dials(StdInstant::now());
    }

    fn handle_udp_packet(&mut self, packet: &UdpPacket<'_>) {
        let key = FlowKey::from_udp(packet);
        // `dns_hijack` is decided once, below, from this flow's first
        // datagram, and never revisited for the flow's lifetime — a later
        // packet that happens to parse as a DNS query must not flip an
        // already-admitted non-DNS flow's eviction exemption on.
        if let Some(entry) = self.flow_keys.get_mut(&key) {
            entry.last_activity = StdInstant::now();
            return;
        }
        let Some(socket) = self.udp_pool.pop() else {
            self.counters.udp_admission_fail += 1;
            logger::warn("FlowManager: UDP admission failed (pool exhausted)");
            if let Some(callbacks) = self.callbacks {
                if let Some(unreachable) = packet_builder::build_icmp_block(packet) {
                    emit_frames(callbacks, vec![unreachable]);
                }
            }
            return;
        };
        let flow_id = self.new_flow_id();
        let udp_socket = self.sockets.get_mut::<UdpSocket>(socket);
        let endpoint = IpListenEndpoint {
            addr: Some(key.dst_ip),
            port: key.dst_port,
        };
        let _ = udp_socket.bind(endpoint);
        let dns_hijack = is_dns_port(&key, self.router_address_v4, self.router_address_v6)
            && crate::dns::is_dns_query(packet.payload);
        let uid = self.resolve_uid(true, key.src_ip, key.src_port, key.dst_ip, key.dst_port);
        let sniffed_host = if self.sniffing_enabled && key.dst_port == QUIC_SNI_PORT {
            crate::quic::extract_sni(packet.payload)
        } else {
            None
        };
        if let Some(host) = &sniffed_host {
            logger::breadcrumb(
                BreadcrumbFlags::FLOW,
                format!("QUIC SNI sniffed for handle {} -> {}", flow_id, host),
            );
        }
        self.flow_keys.insert(
            key,
            FlowEntry {
                socket,
                kind: FlowKind::Udp,
                handle: flow_id,
                uid,
                ready: false,
                pending_dial: false,
                dial_attempts: 0,
                dial_started_at: None,
                next_redial_at: Some(StdInstant::now()),
                last_activity: StdInstant::now(),
                buffered: VecDeque::new(),
                buffered_bytes: 0,
                client_closed: false,
                backpressure_cooldown_ms: state::TCP_BACKPRESSURE_RETRY_MS,
                backpressure_retry_at: None,
                dns_hijack,
                sniffed_host,
                protected_writer: None,
            },
        );
        self.handle_map.insert(flow_id, key);
        self.stats.conn_opened(uid, ConnKind::Udp);
        logger::breadcrumb(
            BreadcrumbFlags::FLOW,
            format!(
                "UDP flow {}:{} -> {}:{} admitted (handle {})",
                state::ip_string(key.src_ip),
                key.src_port,
                state::ip_string(key.dst_ip),
                key.dst_port,
                flow_id
            ),
        );
        self.dispatch_pending_dials(StdInstant::now());
    }

    /// Returns a flow's socket to its pool. TCP sockets are aborted first
    /// regardless of which path triggered the close (explicit host close,
    /// dial failure, backpressure, idle timeout) so a socket recycled into
    /// a new flow is always `Closed` before that flow calls `listen()` on
    /// it — an abort on an already-closed socket is a no-op.
    fn remove_flow(&mut self, handle: u64) {
        if let Some(key) = self.handle_map.remove(&handle) {
            if let Some(entry) = self.flow_keys.remove(&key) {
                let kind = match entry.kind {
                    FlowKind::Tcp => {
                        self.sockets.get_mut::<TcpSocket>(entry.socket).abort();
                        self.tcp_pool.push(entry.socket);
                        ConnKind::Tcp
                    }
                    FlowKind::Udp => {
                        self.udp_pool.push(entry.socket);
                        ConnKind::Udp
                    }
                };
                self.stats.conn_closed(entry.uid, kind);
            }
        }
    }

    fn notify_close(&mut self, handle: u64, kind: FlowKind, reason: &str, callbacks: BridgeCallbacks) {
        if let Some(key) = self.handle_map.get(&handle).cloned() {
            logger::breadcrumb(
                BreadcrumbFlags::FLOW,
                format!(
                    "{:?} handle {} closing reason={} dst={} port={}",
                    kind,
                    handle,
                    reason,
                    state::ip_string(key.dst_ip),
                    key.dst_port
                ),
            );
        }
        if !self.protected_dial_enabled() {
            let c_string = CString::new(reason).ok();
            let ptr = c_string.as_ref().map_or(ptr::null(), |value| value.as_ptr());
            unsafe {
                match kind {
                    FlowKind::Tcp => (callbacks.tcp_close)(handle, ptr, callbacks.context),
                    FlowKind::Udp => (callbacks.udp_close)(handle, ptr, callbacks.context),
                }
            }
        }
        self.remove_flow(handle);
        self.wake.notify_one();
    }

    /// Closes every tracked flow, as if each one had reported a remote close.
    /// Used when the engine itself is shutting down. Idempotent: an empty
    /// flow table is a no-op.
    pub fn close_all(&mut self) {
        let Some(callbacks) = self.callbacks else {
            self.flow_keys.clear();
            self.handle_map.clear();
            return;
        };
        let flows: Vec<(u64, FlowKind)> = self
            .flow_keys
            .values()
            .map(|entry| (entry.handle, entry.kind))
            .collect();
        for (handle, kind) in flows {
            self.notify_close(handle, kind, "engine_stopped", callbacks);
        }
    }

    fn new_flow_id(&mut self) -> u64 {
        let id = self.next_flow_id.get();
        let next = self.next_flow_id.get().wrapping_add(1);
        self.next_flow_id = NonZeroU64::new(next).unwrap_or(NonZeroU64::new(1).unwrap());
        id
    }

    /// Drains protected-dial events emitted by in-process dial/copy tasks
    /// and folds them into the same ready/payload/close paths a host-
    /// delegated flow goes through. Returns true if any event was applied.
    fn drain_protected_events(&mut self) -> bool {
        let mut did_work = false;
        while let Ok(event) = self.protected_events_rx.try_recv() {
            did_work = true;
            match event {
                protect::ProtectedEvent::Connected { handle, writer, .. } => {
                    if let Some(key) = self.handle_map.get(&handle).copied() {
                        if let Some(entry) = self.flow_keys.get_mut(&key) {
                            entry.protected_writer = Some(writer);
                        }
                    }
                    self.on_dial_result(handle, true, None);
                }
                protect::ProtectedEvent::Data { handle, kind, payload } => {
                    self.forward_remote_payload(handle, &payload, kind);
                }
                protect::ProtectedEvent::Closed { handle, kind, reason } => {
                    let was_ready = self
                        .handle_map
                        .get(&handle)
                        .and_then(|key| self.flow_keys.get(key))
                        .map(|entry| entry.ready)
                        .unwrap_or(false);
                    if was_ready {
                        if let Some(callbacks) = self.callbacks {
                            self.notify_close(handle, kind, reason, callbacks);
                        } else {
                            self.remove_flow(handle);
                        }
                    } else {
                        self.on_dial_result(handle, false, Some(reason));
                    }
                }
            }
        }
        did_work
    }

    pub fn poll(&mut self, now: Instant) -> bool {
        let callbacks = match self.callbacks {
            Some(cb) => cb,
            None => return false,
        };
        let mut did_work = false;
        self.flow_stats.poll_iterations = self.flow_stats.poll_iterations.saturating_add(1);
        if self.drain_protected_events() {
            did_work = true;
        }
        if self.interface.poll(now, &mut self.device, &mut self.sockets) {
            did_work = true;
        }
        let frames = self.device.handle().drain_outbound();
        if !frames.is_empty() {
            did_work = true;
            let bytes: usize = frames.iter().map(|frame| frame.len()).sum();
            let frame_count = frames.len() as u64;
            emit_frames(callbacks, frames);
            self.flow_stats.frames_emitted = self.flow_stats.frames_emitted.saturating_add(frame_count);
            self.flow_stats.bytes_emitted = self.flow_stats.bytes_emitted.saturating_add(bytes as u64);
        }
        self.flush_outbound(callbacks);
        self.finalize_closed_flows(callbacks);
        if self.dispatch_pending_dials(StdInstant::now()) {
            did_work = true;
        }
        if self.prune_idle_udp_flows(StdInstant::now(), callbacks) {
            did_work = true;
        }
        did_work
    }

    fn prune_idle_udp_flows(&mut self, now: StdInstant, callbacks: BridgeCallbacks) -> bool {
        let mut pruned = false;
        let timeout = self.udp_idle_timeout;
        let idle_keys: Vec<FlowKey> = self
            .flow_keys
            .iter()
            .filter_map(|(key, entry)| {
                if entry.kind != FlowKind::Udp || !entry.ready || entry.dns_hijack {
                    return None;
                }
                if now
                    .checked_duration_since(entry.last_activity)
                    .map(|elapsed| elapsed >= timeout)
                    .unwrap_or(false)
                {
                    Some(*key)
                } else {
                    None
                }
            })
            .collect();
        for key in idle_keys {
            if let Some(entry) = self.flow_keys.get(&key) {
                logger::breadcrumb(
                    BreadcrumbFlags::FLOW,
                    format!(
                        "UDP idle timeout for handle {} dst={} port={}",
                        entry.handle,
                        state::ip_string(key.dst_ip),
                        key.dst_port
                    ),
                );
                self.notify_close(entry.handle, FlowKind::Udp, "udp_idle_timeout", callbacks);
                pruned = true;
            }
        }
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{TcpFlags, TunDevice, DEFAULT_MTU, RING_CAPACITY};
    use std::ffi::{c_void, CStr};
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct TestHarness {
        dns: Mutex<Vec<(String, Vec<String>, u32)>>,
        dials: Mutex<Vec<(FlowKind, String, u16, u64)>>,
        closes: Mutex<Vec<(FlowKind, u64, String)>>,
    }

    impl TestHarness {
        fn record_dns(&self, host: String, addresses: Vec<String>, ttl: u32) {
            self.dns.lock().unwrap().push((host, addresses, ttl));
        }
        fn record_dial(&self, kind: FlowKind, host: String, port: u16, handle: u64) {
            self.dials.lock().unwrap().push((kind, host, port, handle));
        }
        fn record_close(&self, kind: FlowKind, handle: u64, message: String) {
            self.closes.lock().unwrap().push((kind, handle, message));
        }
        fn dns(&self) -> Vec<(String, Vec<String>, u32)> {
            self.dns.lock().unwrap().clone()
        }
        fn dials(&self) -> Vec<(FlowKind, String, u16, u64)> {
            self.dials.lock().unwrap().clone()
        }
        fn closes(&self) -> Vec<(FlowKind, u64, String)> {
            self.closes.lock().unwrap().clone()
        }
    }

    unsafe extern "C" fn noop_emit(
        _packets: *const *const u8,
        _sizes: *const usize,
        _protocols: *const u32,
        _count: usize,
        _context: *mut c_void,
    ) {
    }

    unsafe extern "C" fn test_request_tcp_dial(host: *const i8, port: u16, handle: u64, context: *mut c_void) {
        record_dial_callback(host, port, handle, context, FlowKind::Tcp);
    }

    unsafe extern "C" fn test_request_udp_dial(host: *const i8, port: u16, handle: u64, context: *mut c_void) {
        record_dial_callback(host, port, handle, context, FlowKind::Udp);
    }

    unsafe extern "C" fn noop_send(_handle: u64, _payload: *const u8, _length: usize, _context: *mut c_void) {}

    unsafe extern "C" fn test_udp_send(handle: u64, _payload: *const u8, length: usize, context: *mut c_void) {
        if context.is_null() {
            return;
        }
        let harness = unsafe { &*(context as *const TestHarness) };
        harness.record_close(FlowKind::Udp, handle, format!("udp_send size {}", length));
    }

    unsafe extern "C" fn test_record_dns(
        host: *const i8,
        addresses: *const *const i8,
        count: usize,
        ttl_seconds: u32,
        context: *mut c_void,
    ) {
        if host.is_null() || addresses.is_null() || context.is_null() {
            return;
        }
        let harness = unsafe { &*(context as *const TestHarness) };
        let host_str = unsafe { CStr::from_ptr(host) }.to_string_lossy().to_string();
        let mut results = Vec::with_capacity(count);
        for index in 0..count {
            let ptr = unsafe { *addresses.add(index) };
            if ptr.is_null() {
                continue;
            }
            results.push(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().to_string());
        }
        if results.is_empty() {
            return;
        }
        harness.record_dns(host_str, results, ttl_seconds);
    }

    fn record_dial_callback(host: *const i8, port: u16, handle: u64, context: *mut c_void, kind: FlowKind) {
        if host.is_null() || context.is_null() {
            return;
        }
        let harness = unsafe { &*(context as *const TestHarness) };
        let host_str = unsafe { CStr::from_ptr(host) }.to_string_lossy().to_string();
        harness.record_dial(kind, host_str, port, handle);
    }

    fn record_close_callback(handle: u64, message: *const i8, context: *mut c_void, kind: FlowKind) {
        if context.is_null() {
            return;
        }
        let harness = unsafe { &*(context as *const TestHarness) };
        let reason = if message.is_null() {
            String::new()
        } else {
            unsafe { CStr::from_ptr(message) }.to_string_lossy().to_string()
        };
        harness.record_close(kind, handle, reason);
    }

    fn test_callbacks(context: *mut c_void) -> BridgeCallbacks {
        BridgeCallbacks {
            emit_packets: noop_emit,
            request_tcp_dial: test_request_tcp_dial,
            request_udp_dial: test_request_udp_dial,
            tcp_send: noop_send,
            udp_send: test_udp_send,
            tcp_close: test_tcp_close,
            udp_close: test_udp_close,
            record_dns: test_record_dns,
            context,
        }
    }

    unsafe extern "C" fn test_tcp_close(handle: u64, message: *const i8, context: *mut c_void) {
        record_close_callback(handle, message, context, FlowKind::Tcp);
    }

    unsafe extern "C" fn test_udp_close(handle: u64, message: *const i8, context: *mut c_void) {
        record_close_callback(handle, message, context, FlowKind::Udp);
    }

    fn new_manager(wake: &Arc<Notify>) -> FlowManager {
        let device = TunDevice::new(DEFAULT_MTU, Arc::clone(wake), RING_CAPACITY);
        let stats = Arc::new(StatsTable::new());
        FlowManager::new(device, Arc::clone(wake), stats)
    }

    #[test]
    fn dns_packets_emit_mappings() {
        let wake = Arc::new(Notify::new());
        let mut manager = new_manager(&wake);
        let harness = Box::new(TestHarness::default());
        let context = Box::into_raw(harness);
        manager.install_callbacks(test_callbacks(context as *mut c_void));

        let payload = build_dns_response("example.com", [203, 0, 113, 5], 120);
        let udp_packet = UdpPacket {
            src: IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            dst: IpAddr::V4(Ipv4Addr::new(172, 19, 0, 2)),
            src_port: 53,
            dst_port: 1000,
            payload: payload.as_slice(),
        };
        manager.process_packet(&ParsedPacket::Udp(udp_packet));

        let harness = unsafe { Box::from_raw(context) };
        let entries = harness.dns();
        assert_eq!(entries.len(), 1);
        let (host, addresses, ttl) = &entries[0];
        assert_eq!(host, "example.com");
        assert_eq!(addresses, &["203.0.113.5".to_string()]);
        assert_eq!(*ttl, 120);
    }

    #[test]
    fn tcp_dial_retries_eventually_close_flow() {
        let wake = Arc::new(Notify::new());
        let mut manager = new_manager(&wake);
        let harness = Box::new(TestHarness::default());
        let context = Box::into_raw(harness);
        manager.install_callbacks(test_callbacks(context as *mut c_void));

        let tcp_packet = TcpPacket {
            src: IpAddr::V4(Ipv4Addr::new(172, 19, 0, 2)),
            dst: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)),
            src_port: 1000,
            dst_port: 443,
            seq_number: 0,
            ack_number: 0,
            payload: &[],
            flags: TcpFlags::default(),
        };
        manager.process_packet(&ParsedPacket::Tcp(tcp_packet));
        thread::sleep(Duration::from_millis(10));
        manager.poll(Instant::from_millis(0));

        let harness_ref = unsafe { &*context };
        wait_for(&mut manager, harness_ref, Duration::from_millis(200), |h| h.dials().len() >= 1);
        let recorded_handle = harness_ref.dials()[0].3;
        let (&handle, _) = manager.handle_map.iter().next().expect("expected flow handle");
        assert_eq!(handle, recorded_handle);

        for attempt in 0..state::MAX_DIAL_ATTEMPTS {
            manager.on_dial_result(handle, false, Some("network_down"));
            if attempt < state::MAX_DIAL_ATTEMPTS - 1 {
                let expected = (attempt as usize) + 2;
                wait_for(&mut manager, harness_ref, Duration::from_millis(500), |h| h.dials().len() >= expected);
            }
        }

        wait_for(&mut manager, harness_ref, Duration::from_millis(500), |h| h.closes().len() >= 1);
        let closes = harness_ref.closes();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].0, FlowKind::Tcp);
        assert_eq!(closes[0].1, handle);

        unsafe {
            drop(Box::from_raw(context));
        }
    }

    #[test]
    fn remote_payloads_buffer_until_dial_ready() {
        let wake = Arc::new(Notify::new());
        let mut manager = new_manager(&wake);

        let tcp_packet = TcpPacket {
            src: IpAddr::V4(Ipv4Addr::new(172, 19, 0, 2)),
            dst: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)),
            src_port: 5000,
            dst_port: 443,
            seq_number: 0,
            ack_number: 0,
            payload: &[],
            flags: TcpFlags::default(),
        };
        let key = FlowKey::from_tcp(&tcp_packet);
        manager.process_packet(&ParsedPacket::Tcp(tcp_packet));

        let (&handle, _) = manager.handle_map.iter().next().expect("expected flow handle");

        let payload = vec![1u8, 2, 3, 4];
        {
            let entry = manager.flow_keys.get_mut(&key).expect("flow entry missing");
            assert!(state::buffer_payload(entry, &payload));
            assert_eq!(entry.buffered.len(), 1);
            assert_eq!(entry.buffered_bytes, payload.len());
            assert!(!entry.ready);
        }

        manager.on_dial_result(handle, true, None);
        if let Some(entry) = manager.flow_keys.get(&key) {
            assert!(entry.ready);
            assert_eq!(entry.buffered.len(), 0);
            assert_eq!(entry.buffered_bytes, 0);
        }
    }

    #[test]
    fn dns_query_latches_flow_against_idle_eviction() {
        let wake = Arc::new(Notify::new());
        let mut manager = new_manager(&wake);
        manager.set_udp_idle_timeout(Duration::from_millis(0));

        let query = build_dns_query("example.com");
        let udp_packet = UdpPacket {
            src: IpAddr::V4(Ipv4Addr::new(172, 19, 0, 2)),
            dst: IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            src_port: 40000,
            dst_port: 53,
            payload: query.as_slice(),
        };
        let key = FlowKey::from_udp(&udp_packet);
        manager.process_packet(&ParsedPacket::Udp(udp_packet));
        assert!(manager.flow_keys.get(&key).unwrap().dns_hijack);
    }

    #[test]
    fn dump_uid_callback_tags_new_flows() {
        unsafe extern "C" fn fixed_uid(
            _is_ipv6: bool,
            _is_udp: bool,
            _src_ip: *const i8,
            _src_port: u16,
            _dst_ip: *const i8,
            _dst_port: u16,
            _context: *mut c_void,
        ) -> i32 {
            20_123
        }

        let wake = Arc::new(Notify::new());
        let mut manager = new_manager(&wake);
        manager.set_dump_uid_enabled(true);
        manager.install_platform_callbacks(crate::ffi::BridgePlatformCallbacks {
            protect: None,
            dump_uid: Some(fixed_uid),
            error_handler: None,
            update_stats: None,
            context: ptr::null_mut(),
        });

        let tcp_packet = TcpPacket {
            src: IpAddr::V4(Ipv4Addr::new(172, 19, 0, 2)),
            dst: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 11)),
            src_port: 6000,
            dst_port: 443,
            seq_number: 0,
            ack_number: 0,
            payload: &[],
            flags: TcpFlags::default(),
        };
        let key = FlowKey::from_tcp(&tcp_packet);
        manager.process_packet(&ParsedPacket::Tcp(tcp_packet));
        assert_eq!(manager.flow_keys.get(&key).unwrap().uid, 20_123);
    }

    #[test]
    fn dump_uid_disabled_keeps_uid_zero() {
        unsafe extern "C" fn fixed_uid(
            _is_ipv6: bool,
            _is_udp: bool,
            _src_ip: *const i8,
            _src_port: u16,
            _dst_ip: *const i8,
            _dst_port: u16,
            _context: *mut c_void,
        ) -> i32 {
            20_123
        }

        let wake = Arc::new(Notify::new());
        let mut manager = new_manager(&wake);
        manager.install_platform_callbacks(crate::ffi::BridgePlatformCallbacks {
            protect: None,
            dump_uid: Some(fixed_uid),
            error_handler: None,
            update_stats: None,
            context: ptr::null_mut(),
        });

        let tcp_packet = TcpPacket {
            src: IpAddr::V4(Ipv4Addr::new(172, 19, 0, 2)),
            dst: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 11)),
            src_port: 6000,
            dst_port: 443,
            seq_number: 0,
            ack_number: 0,
            payload: &[],
            flags: TcpFlags::default(),
        };
        let key = FlowKey::from_tcp(&tcp_packet);
        manager.process_packet(&ParsedPacket::Tcp(tcp_packet));
        assert_eq!(manager.flow_keys.get(&key).unwrap().uid, 0);
    }

    fn quic_client_hello_with_sni(host: &str) -> Vec<u8> {
        let name = host.as_bytes();
        let mut server_name_list = vec![0u8];
        server_name_list.extend_from_slice(&(name.len() as u16).to_be_bytes());
        server_name_list.extend_from_slice(name);

        let mut sni_ext = (server_name_list.len() as u16).to_be_bytes().to_vec();
        sni_ext.extend_from_slice(&server_name_list);

        let mut extensions = 0x0000u16.to_be_bytes().to_vec();
        extensions.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&sni_ext);

        let mut body = vec![0x03, 0x03];
        body.extend_from_slice(&[0u8; 32]);
        body.push(0);
        body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]);
        body.push(1);
        body.push(0);
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = vec![0x01];
        let handshake_len = body.len() as u32;
        handshake.push((handshake_len >> 16) as u8);
        handshake.push((handshake_len >> 8) as u8);
        handshake.push(handshake_len as u8);
        handshake.extend_from_slice(&body);

        let mut record = vec![0x16, 0x03, 0x03];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn quic_sni_overrides_dial_destination() {
        let wake = Arc::new(Notify::new());
        let mut manager = new_manager(&wake);
        manager.set_sniffing(true, true);
        let harness = Box::new(TestHarness::default());
        let context = Box::into_raw(harness);
        manager.install_callbacks(test_callbacks(context as *mut c_void));

        let payload = quic_client_hello_with_sni("media.example.net");
        let udp_packet = UdpPacket {
            src: IpAddr::V4(Ipv4Addr::new(172, 19, 0, 2)),
            dst: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)),
            src_port: 5000,
            dst_port: 443,
            payload: payload.as_slice(),
        };
        manager.process_packet(&ParsedPacket::Udp(udp_packet));

        let harness = unsafe { Box::from_raw(context) };
        let dials = harness.dials();
        assert_eq!(dials.len(), 1);
        assert_eq!(dials[0].1, "media.example.net");
    }

    #[test]
    fn quic_sni_sniffed_but_not_applied_without_override() {
        let wake = Arc::new(Notify::new());
        let mut manager = new_manager(&wake);
        manager.set_sniffing(true, false);
        let harness = Box::new(TestHarness::default());
        let context = Box::into_raw(harness);
        manager.install_callbacks(test_callbacks(context as *mut c_void));

        let payload = quic_client_hello_with_sni("media.example.net");
        let udp_packet = UdpPacket {
            src: IpAddr::V4(Ipv4Addr::new(172, 19, 0, 2)),
            dst: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)),
            src_port: 5000,
            dst_port: 443,
            payload: payload.as_slice(),
        };
        let key = FlowKey::from_udp(&udp_packet);
        manager.process_packet(&ParsedPacket::Udp(udp_packet));

        assert_eq!(
            manager.flow_keys.get(&key).unwrap().sniffed_host.as_deref(),
            Some("media.example.net")
        );
        let harness = unsafe { Box::from_raw(context) };
        let dials = harness.dials();
        assert_eq!(dials.len(), 1);
        assert_eq!(dials[0].1, "203.0.113.9");
    }

    #[test]
    fn udp_backpressure_closes_flow() {
        let wake = Arc::new(Notify::new());
        let mut manager = new_manager(&wake);
        let harness = Box::new(TestHarness::default());
        let context = Box::into_raw(harness);
        manager.install_callbacks(test_callbacks(context as *mut c_void));

        let udp_packet = UdpPacket {
            src: IpAddr::V4(Ipv4Addr::new(172, 19, 0, 5)),
            dst: IpAddr::V4(Ipv4Addr::new(198, 51, 100, 9)),
            src_port: 2000,
            dst_port: 5353,
            payload: &[0u8; 0],
        };
        manager.process_packet(&ParsedPacket::Udp(udp_packet));
        manager.poll(Instant::from_millis(0));

        let harness_ref = unsafe { &*context };
        wait_for(&mut manager, harness_ref, Duration::from_millis(200), |h| h.dials().len() >= 1);
        let (kind, _, _, handle) = harness_ref.dials()[0];
        assert_eq!(kind, FlowKind::Udp);

        manager.on_dial_result(handle, true, None);

        let key = manager.handle_map.get(&handle).copied().unwrap();
        if let Some(entry) = manager.flow_keys.get(&key) {
            let socket_handle = entry.socket;
            let meta = UdpMetadata::from(IpEndpoint::new(key.dst_ip, key.dst_port));
            let socket = manager.sockets.get_mut::<UdpSocket>(socket_handle);
            for _ in 0..(state::UDP_PACKET_METADATA * 2) {
                let _ = socket.send_slice(&[0u8; 64], meta);
            }
        }

        let payload = vec![1u8; 128];
        manager.on_udp_receive(handle, &payload);

        wait_for(&mut manager, harness_ref, Duration::from_millis(200), |h| h.closes().len() >= 1);
        let closes = harness_ref.closes();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].0, FlowKind::Udp);
        assert_eq!(closes[0].1, handle);

        unsafe {
            drop(Box::from_raw(context));
        }
    }

    fn wait_for<F>(manager: &mut FlowManager, harness: &TestHarness, timeout: Duration, mut predicate: F)
    where
        F: FnMut(&TestHarness) -> bool,
    {
        let deadline = StdInstant::now() + timeout;
        while !predicate(harness) {
            if StdInstant::now() >= deadline {
                break;
            }
            manager.poll(Instant::from_millis(0));
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn build_dns_response(host: &str, addr: [u8; 4], ttl: u32) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&[0x00, 0x01]);
        payload.extend_from_slice(&[0x81, 0x80]);
        payload.extend_from_slice(&[0x00, 0x01]);
        payload.extend_from_slice(&[0x00, 0x01]);
        payload.extend_from_slice(&[0x00, 0x00]);
        payload.extend_from_slice(&[0x00, 0x00]);
        for label in host.split('.') {
            payload.push(label.len() as u8);
            payload.extend_from_slice(label.as_bytes());
        }
        payload.push(0);
        payload.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        payload.extend_from_slice(&[0xC0, 0x0C]);
        payload.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        payload.extend_from_slice(&ttl.to_be_bytes());
        payload.extend_from_slice(&[0x00, 0x04]);
        payload.extend_from_slice(&addr);
        payload
    }

    #[test]
    fn tcp_socket_is_aborted_before_returning_to_pool() {
        let wake = Arc::new(Notify::new());
        let mut manager = new_manager(&wake);
        let harness = Box::new(TestHarness::default());
        let context = Box::into_raw(harness);
        manager.install_callbacks(test_callbacks(context as *mut c_void));

        let tcp_packet = TcpPacket {
            src: IpAddr::V4(Ipv4Addr::new(172, 19, 0, 2)),
            dst: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 30)),
            src_port: 8000,
            dst_port: 443,
            seq_number: 0,
            ack_number: 0,
            payload: &[],
            flags: TcpFlags::default(),
        };
        let key = FlowKey::from_tcp(&tcp_packet);
        manager.process_packet(&ParsedPacket::Tcp(tcp_packet));
        let socket_handle = manager.flow_keys.get(&key).unwrap().socket;
        let (&handle, _) = manager.handle_map.iter().next().expect("expected flow handle");

        // Listening (not yet connected) counts as a non-Closed state a
        // recycled socket must not be handed out in.
        assert_ne!(
            manager.sockets.get::<TcpSocket>(socket_handle).state(),
            smoltcp::socket::tcp::State::Closed
        );

        manager.notify_close(handle, FlowKind::Tcp, "dial_failed", test_callbacks(context as *mut c_void));

        assert_eq!(
            manager.sockets.get::<TcpSocket>(socket_handle).state(),
            smoltcp::socket::tcp::State::Closed
        );
        assert!(manager.tcp_pool.contains(&socket_handle));

        unsafe {
            drop(Box::from_raw(context));
        }
    }

    #[test]
    fn close_all_notifies_every_tracked_flow() {
        let wake = Arc::new(Notify::new());
        let mut manager = new_manager(&wake);
        let harness = Box::new(TestHarness::default());
        let context = Box::into_raw(harness);
        manager.install_callbacks(test_callbacks(context as *mut c_void));

        let tcp_packet = TcpPacket {
            src: IpAddr::V4(Ipv4Addr::new(172, 19, 0, 2)),
            dst: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 20)),
            src_port: 7000,
            dst_port: 443,
            seq_number: 0,
            ack_number: 0,
            payload: &[],
            flags: TcpFlags::default(),
        };
        manager.process_packet(&ParsedPacket::Tcp(tcp_packet));
        let (&handle, _) = manager.handle_map.iter().next().expect("expected flow handle");

        manager.close_all();

        assert!(manager.flow_keys.is_empty());
        assert!(manager.handle_map.is_empty());
        let harness = unsafe { Box::from_raw(context) };
        let closes = harness.closes();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].0, FlowKind::Tcp);
        assert_eq!(closes[0].1, handle);
        assert_eq!(closes[0].2, "engine_stopped");
    }

    #[test]
    fn close_all_without_callbacks_still_clears_flow_table() {
        let wake = Arc::new(Notify::new());
        let mut manager = new_manager(&wake);

        let tcp_packet = TcpPacket {
            src: IpAddr::V4(Ipv4Addr::new(172, 19, 0, 2)),
            dst: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 21)),
            src_port: 7001,
            dst_port: 443,
            seq_number: 0,
            ack_number: 0,
            payload: &[],
            flags: TcpFlags::default(),
        };
        manager.process_packet(&ParsedPacket::Tcp(tcp_packet));
        assert!(!manager.flow_keys.is_empty());

        manager.close_all();

        assert!(manager.flow_keys.is_empty());
        assert!(manager.handle_map.is_empty());
    }

    #[test]
    fn traffic_to_router_address_on_any_port_is_flagged_as_dns_hijack() {
        let wake = Arc::new(Notify::new());
        let mut manager = new_manager(&wake);

        let query = build_dns_query("router.example");
        let udp_packet = UdpPacket {
            src: IpAddr::V4(Ipv4Addr::new(172, 19, 0, 2)),
            dst: IpAddr::V4(Ipv4Addr::new(172, 19, 0, 1)),
            src_port: 40001,
            dst_port: 8553,
            payload: query.as_slice(),
        };
        let key = FlowKey::from_udp(&udp_packet);
        manager.process_packet(&ParsedPacket::Udp(udp_packet));
        assert!(manager.flow_keys.get(&key).unwrap().dns_hijack);
    }

    #[test]
    fn traffic_to_non_router_address_on_non_dns_port_is_not_hijacked() {
        let wake = Arc::new(Notify::new());
        let mut manager = new_manager(&wake);

        let query = build_dns_query("not-router.example");
        let udp_packet = UdpPacket {
            src: IpAddr::V4(Ipv4Addr::new(172, 19, 0, 2)),
            dst: IpAddr::V4(Ipv4Addr::new(198, 51, 100, 44)),
            src_port: 40002,
            dst_port: 8553,
            payload: query.as_slice(),
        };
        let key = FlowKey::from_udp(&udp_packet);
        manager.process_packet(&ParsedPacket::Udp(udp_packet));
        assert!(!manager.flow_keys.get(&key).unwrap().dns_hijack);
    }

    #[test]
    fn dns_hijack_latch_is_not_reopened_by_later_packets() {
        let wake = Arc::new(Notify::new());
        let mut manager = new_manager(&wake);

        let first_packet = UdpPacket {
            src: IpAddr::V4(Ipv4Addr::new(172, 19, 0, 2)),
            dst: IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            src_port: 40003,
            dst_port: 53,
            payload: &[0u8; 4],
        };
        let key = FlowKey::from_udp(&first_packet);
        manager.process_packet(&ParsedPacket::Udp(first_packet));
        assert!(!manager.flow_keys.get(&key).unwrap().dns_hijack);

        let query = build_dns_query("example.com");
        let later_packet = UdpPacket {
            src: IpAddr::V4(Ipv4Addr::new(172, 19, 0, 2)),
            dst: IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            src_port: 40003,
            dst_port: 53,
            payload: query.as_slice(),
        };
        manager.process_packet(&ParsedPacket::Udp(later_packet));
        assert!(!manager.flow_keys.get(&key).unwrap().dns_hijack);
    }

    fn build_dns_query(host: &str) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&[0x00, 0x02]);
        payload.extend_from_slice(&[0x01, 0x00]);
        payload.extend_from_slice(&[0x00, 0x01]);
        payload.extend_from_slice(&[0x00, 0x00]);
        payload.extend_from_slice(&[0x00, 0x00]);
        payload.extend_from_slice(&[0x00, 0x00]);
        for label in host.split('.') {
            payload.push(label.len() as u8);
            payload.extend_from_slice(label.as_bytes());
        }
        payload.push(0);
        payload.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        payload
    }
}
