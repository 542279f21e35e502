use std::ffi::{c_char, c_void, CString};
use std::ptr;
use std::slice;

pub type EmitPacketsFn = unsafe extern "C" fn(
    packets: *const *const u8,
    sizes: *const usize,
    protocols: *const u32,
    count: usize,
    context: *mut c_void,
);
pub type DialFn =
    unsafe extern "C" fn(host: *const i8, port: u16, handle: u64, context: *mut c_void);
pub type SendFn =
    unsafe extern "C" fn(handle: u64, payload: *const u8, length: usize, context: *mut c_void);
pub type CloseFn = unsafe extern "C" fn(handle: u64, message: *const i8, context: *mut c_void);
pub type RecordDnsFn = unsafe extern "C" fn(
    host: *const i8,
    addresses: *const *const i8,
    count: usize,
    ttl_seconds: u32,
    context: *mut c_void,
);

/// Marks an OS socket as excluded from the VPN's own routing so a dialed
/// upstream connection reaches the real network instead of looping back
/// through the TUN. Returning `false` fails the dial with a protection error.
pub type ProtectFn = unsafe extern "C" fn(fd: i32, context: *mut c_void) -> bool;

/// Resolves the owning application UID of a local flow. Lookup is
/// synchronous; the engine treats a negative return as "unknown" and keeps
/// accounting against uid 0.
pub type DumpUidFn = unsafe extern "C" fn(
    is_ipv6: bool,
    is_udp: bool,
    src_ip: *const c_char,
    src_port: u16,
    dst_ip: *const c_char,
    dst_port: u16,
    context: *mut c_void,
) -> i32;

/// Fatal-path notification for unrecoverable dispatch-loop failures.
pub type ErrorHandlerFn = unsafe extern "C" fn(message: *const c_char, context: *mut c_void);

/// Per-UID stats sink, invoked once per tracked UID each time the host polls
/// `BridgeEngineReadAppStats`.
pub type UpdateStatsFn = unsafe extern "C" fn(snapshot: BridgeAppStats, context: *mut c_void);

/// Platform-supplied callbacks the engine calls directly rather than routing
/// through the async dial/send/close surface (`BridgeCallbacks`): UID
/// resolution and fatal-error notification both need a synchronous answer
/// at the point a flow is admitted, not a round-trip through the host's
/// event loop.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct BridgePlatformCallbacks {
    pub protect: Option<ProtectFn>,
    pub dump_uid: Option<DumpUidFn>,
    pub error_handler: Option<ErrorHandlerFn>,
    pub update_stats: Option<UpdateStatsFn>,
    pub context: *mut c_void,
}

unsafe impl Send for BridgePlatformCallbacks {}
unsafe impl Sync for BridgePlatformCallbacks {}

/// Mirror of the `BridgeConfig` struct defined in `include/bridge.h`.
/// Optimized defaults for iOS Network Extensions (50MB jetsam limit).
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct BridgeConfig {
    pub mtu: u32,
    pub packet_pool_bytes: u32,
    pub per_flow_bytes: u32,
    pub poll_min_interval_ms: u32,
    pub poll_max_interval_ms: u32,
    /// Memory budget for socket buffers in bytes. Default: 16MB.
    /// Sockets are allocated dynamically up to this limit.
    pub socket_memory_budget: u32,
    /// TCP receive buffer size per socket in bytes. Default: 16384 (16KB).
    pub tcp_rx_buffer_size: u32,
    /// TCP transmit buffer size per socket in bytes. Default: 16384 (16KB).
    pub tcp_tx_buffer_size: u32,
    /// UDP buffer size per socket in bytes. Default: 16384 (16KB).
    pub udp_buffer_size: u32,
    /// Ring buffer capacity for inbound/outbound packets. Default: 512.
    pub ring_capacity: u32,
    /// 0=disabled, 1=enabled, 2=prefer-v6, 3=v6-only. Unrecognized values
    /// normalize to `enabled`.
    pub ipv6_mode: u8,
    /// Enable protocol sniffing (TLS/HTTP for TCP, QUIC for UDP).
    pub sniffing: bool,
    /// When sniffing is on, route using the sniffed hostname instead of
    /// only classifying for routing.
    pub override_destination: bool,
    /// Resolve the owning UID via the `dump_uid` platform callback.
    pub dump_uid_enabled: bool,
    /// Track per-UID uplink/downlink byte and connection counters.
    pub traffic_stats_enabled: bool,
    /// Idle timeout for UDP sessions, in seconds. Default: 300 (5 minutes).
    pub udp_idle_timeout_secs: u32,
    /// IPv4 virtual router address DNS-hijack traffic is matched against.
    /// Defaults to 172.19.0.1.
    pub router_address_v4: [u8; 4],
    /// IPv6 virtual router address. Defaults to fd:fedc:ba98:7600::1.
    pub router_address_v6: [u8; 16],
    /// Maximum number of resolved hostnames the system resolver keeps
    /// cached at once. Default: 512.
    pub dns_cache_capacity: u32,
    /// Cache TTL applied to resolver answers, in seconds. Default: 60.
    pub dns_cache_ttl_secs: u32,
}

pub const DEFAULT_ROUTER_ADDRESS_V4: [u8; 4] = [172, 19, 0, 1];
pub const DEFAULT_ROUTER_ADDRESS_V6: [u8; 16] = [
    0x00, 0xfd, 0xfe, 0xdc, 0xba, 0x98, 0x76, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01,
];

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            mtu: 1280,
            packet_pool_bytes: 4 * 1_048_576,   // 4MB
            per_flow_bytes: 64 * 1_024,          // 64KB
            poll_min_interval_ms: 10,
            poll_max_interval_ms: 250,
            socket_memory_budget: 16 * 1_048_576, // 16MB for socket buffers
            tcp_rx_buffer_size: 16 * 1024,        // 16KB per socket
            tcp_tx_buffer_size: 16 * 1024,        // 16KB per socket
            udp_buffer_size: 16 * 1024,           // 16KB per socket
            ring_capacity: 512,
            ipv6_mode: 1,
            sniffing: false,
            override_destination: false,
            dump_uid_enabled: false,
            traffic_stats_enabled: false,
            udp_idle_timeout_secs: 300,
            router_address_v4: DEFAULT_ROUTER_ADDRESS_V4,
            router_address_v6: DEFAULT_ROUTER_ADDRESS_V6,
            dns_cache_capacity: 512,
            dns_cache_ttl_secs: 60,
        }
    }
}

impl BridgeConfig {
    /// Clamps out-of-range values to safe defaults rather than rejecting the
    /// whole config, mirroring `normalize_mtu`'s existing degrade-gracefully
    /// behavior at the `lib.rs` boundary.
    pub fn normalize(&mut self) {
        if self.ipv6_mode > 3 {
            self.ipv6_mode = 1;
        }
        if self.udp_idle_timeout_secs == 0 {
            self.udp_idle_timeout_secs = 300;
        }
        if self.ring_capacity == 0 {
            self.ring_capacity = 512;
        }
        if self.dns_cache_capacity == 0 {
            self.dns_cache_capacity = 512;
        }
        if self.dns_cache_ttl_secs == 0 {
            self.dns_cache_ttl_secs = 60;
        }
    }
}

/// Callbacks installed by Swift so the engine can interact with the adapter.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct BridgeCallbacks {
    pub emit_packets: EmitPacketsFn,
    pub request_tcp_dial: DialFn,
    pub request_udp_dial: DialFn,
    pub tcp_send: SendFn,
    pub udp_send: SendFn,
    pub tcp_close: CloseFn,
    pub udp_close: CloseFn,
    pub record_dns: RecordDnsFn,
    pub context: *mut c_void,
}

unsafe impl Send for BridgeCallbacks {}
unsafe impl Sync for BridgeCallbacks {}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct FlowStats {
    pub poll_iterations: u64,
    pub frames_emitted: u64,
    pub bytes_emitted: u64,
    pub tcp_flush_events: u64,
    pub udp_flush_events: u64,
}

#[repr(C)]
#[derive(Debug)]
pub struct BridgeResolveResult {
    pub addresses: *mut *mut c_char,
    pub count: usize,
    pub storage: *mut c_void,
    pub ttl_seconds: u32,
}

impl Default for BridgeResolveResult {
    fn default() -> Self {
        Self {
            addresses: ptr::null_mut(),
            count: 0,
            storage: ptr::null_mut(),
            ttl_seconds: 0,
        }
    }
}

#[repr(C)]
pub struct BridgeLogSink {
    pub log: Option<
        unsafe extern "C" fn(
            level: *const c_char,
            message: *const c_char,
            breadcrumbs: u32,
            context: *mut c_void,
        ),
    >,
    pub context: *mut c_void,
    pub enabled_breadcrumbs: u32,
}

impl BridgeResolveResult {
    pub fn reset(&mut self) {
        unsafe {
            if !self.storage.is_null() {
                let mut vec = Box::from_raw(self.storage as *mut Vec<*mut c_char>);
                for entry in vec.drain(..) {
                    if !entry.is_null() {
                        drop(CString::from_raw(entry));
                    }
                }
            } else if !self.addresses.is_null() && self.count > 0 {
                let slice = slice::from_raw_parts_mut(self.addresses, self.count);
                for entry in slice.iter_mut() {
                    if !entry.is_null() {
                        drop(CString::from_raw(*entry));
                        *entry = ptr::null_mut();
                    }
                }
            }
        }
        self.addresses = ptr::null_mut();
        self.count = 0;
        self.storage = ptr::null_mut();
        self.ttl_seconds = 0;
    }

    #[allow(clippy::result_unit_err)]
    pub fn populate(&mut self, values: &[String], ttl_seconds: u32) -> Result<(), ()> {
        self.reset();
        if values.is_empty() {
            return Ok(());
        }
        let mut pointers: Vec<*mut c_char> = Vec::with_capacity(values.len());
        for value in values {
            let c_string = CString::new(value.as_str()).map_err(|_| ())?;
            pointers.push(c_string.into_raw());
        }
        let mut boxed_vec = Box::new(pointers);
        self.count = boxed_vec.len();
        self.addresses = boxed_vec.as_mut_ptr();
        self.storage = Box::into_raw(boxed_vec) as *mut c_void;
        self.ttl_seconds = ttl_seconds;
        Ok(())
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct FlowCounters {
    pub tcp_admission_fail: u64,
    pub udp_admission_fail: u64,
    pub tcp_backpressure_drops: u64,
    pub udp_backpressure_drops: u64,
    /// Count of invalid IP packets (malformed headers, bad version, etc.)
    pub invalid_ip_packets: u64,
    /// Count of invalid TCP packets (bad checksums, truncated, etc.)
    pub invalid_tcp_packets: u64,
    /// Count of invalid UDP packets (bad checksums, truncated, etc.)
    pub invalid_udp_packets: u64,
}

/// Mirror of `crate::stats::AppStatsSnapshot` at the FFI boundary.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct BridgeAppStats {
    pub uid: u32,
    pub tcp_conn: i32,
    pub udp_conn: i32,
    pub tcp_conn_total: u32,
    pub udp_conn_total: u32,
    pub uplink: u64,
    pub downlink: u64,
    pub uplink_total: u64,
    pub downlink_total: u64,
    pub deactivate_at: i64,
}

impl From<crate::stats::AppStatsSnapshot> for BridgeAppStats {
    fn from(snapshot: crate::stats::AppStatsSnapshot) -> Self {
        Self {
            uid: snapshot.uid,
            tcp_conn: snapshot.tcp_conn,
            udp_conn: snapshot.udp_conn,
            tcp_conn_total: snapshot.tcp_conn_total,
            udp_conn_total: snapshot.udp_conn_total,
            uplink: snapshot.uplink,
            downlink: snapshot.downlink,
            uplink_total: snapshot.uplink_total,
            downlink_total: snapshot.downlink_total,
            deactivate_at: snapshot.deactivate_at,
        }
    }
}

#[cfg(test)]
mod tests;
