use super::*;

#[test]
fn populate_sets_addresses_and_ttl() {
    let mut result = BridgeResolveResult::default();
    let values = vec!["1.1.1.1".to_string(), "2606:4700:4700::1111".to_string()];
    assert!(result.populate(&values, 42).is_ok());
    assert_eq!(result.count, 2);
    assert_eq!(result.ttl_seconds, 42);
    unsafe {
        let slice = std::slice::from_raw_parts(result.addresses, result.count);
        for ptr in slice {
            assert!(!ptr.is_null());
            let text = std::ffi::CStr::from_ptr(*ptr);
            assert!(!text.to_string_lossy().is_empty());
        }
    }
    result.reset();
    assert_eq!(result.count, 0);
    assert!(result.addresses.is_null());
    assert_eq!(result.ttl_seconds, 0);
}

#[test]
fn normalize_clamps_invalid_fields() {
    let mut config = BridgeConfig {
        ipv6_mode: 9,
        udp_idle_timeout_secs: 0,
        ring_capacity: 0,
        ..BridgeConfig::default()
    };
    config.normalize();
    assert_eq!(config.ipv6_mode, 1);
    assert_eq!(config.udp_idle_timeout_secs, 300);
    assert_eq!(config.ring_capacity, 512);
}

#[test]
fn default_router_addresses_match_virtual_anchors() {
    let config = BridgeConfig::default();
    assert_eq!(config.router_address_v4, DEFAULT_ROUTER_ADDRESS_V4);
    assert_eq!(config.router_address_v6, DEFAULT_ROUTER_ADDRESS_V6);
}

#[test]
fn app_stats_conversion_preserves_fields() {
    let snapshot = crate::stats::AppStatsSnapshot {
        uid: 20_000,
        tcp_conn: 1,
        udp_conn: 0,
        tcp_conn_total: 3,
        udp_conn_total: 1,
        uplink: 128,
        downlink: 256,
        uplink_total: 512,
        downlink_total: 1024,
        deactivate_at: 0,
    };
    let mirrored: BridgeAppStats = snapshot.into();
    assert_eq!(mirrored.uid, 20_000);
    assert_eq!(mirrored.uplink_total, 512);
    assert_eq!(mirrored.downlink_total, 1024);
}
