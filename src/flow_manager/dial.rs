//! Dial management for flow connections.
//!
//! Handles connection dial requests, retries, and backoff.

use super::*;
use state::{dial_backoff_delay, ip_string, MAX_DIAL_ATTEMPTS, TCP_BACKPRESSURE_RETRY_MS};
use std::ffi::CString;
use std::time::Instant as StdInstant;

impl FlowManager {
    pub fn on_dial_result(&mut self, handle: u64, success: bool, reason: Option<&str>) {
        let Some(key) = self.handle_map.get(&handle).cloned() else {
            logger::warn(format!(
                "FlowManager: dial result for unknown handle {}",
                handle
            ));
            return;
        };

        let mut close_params = None;
        if let Some(entry) = self.flow_keys.get_mut(&key) {
            entry.pending_dial = false;
            entry.dial_started_at = None;
            if success {
                entry.ready = true;
                entry.next_redial_at = None;
                entry.last_activity = StdInstant::now();
                entry.backpressure_cooldown_ms = TCP_BACKPRESSURE_RETRY_MS;
                entry.backpressure_retry_at = None;
                logger::breadcrumb(
                    BreadcrumbFlags::FLOW,
                    format!("{:?} dial ready for handle {}", entry.kind, entry.handle),
                );
                self.wake.notify_one();
                self.flush_buffered_payloads(key);
                return;
            }

            if entry.dial_attempts < MAX_DIAL_ATTEMPTS {
                let delay = dial_backoff_delay(entry.dial_attempts);
                entry.next_redial_at = Some(StdInstant::now() + delay);
                let message = reason.unwrap_or("dial_failed");
                logger::warn(format!(
                    "FlowManager: {:?} dial attempt {} failed for handle {} ({message}), retrying in {:?}",
                    entry.kind, entry.dial_attempts, entry.handle, delay
                ));
                logger::breadcrumb(
                    BreadcrumbFlags::FLOW,
                    format!(
                        "{:?} dial retry {} for handle {} ({message})",
                        entry.kind, entry.dial_attempts, entry.handle
                    ),
                );
                self.wake.notify_one();
                return;
            }

            close_params = Some((entry.handle, entry.kind));
        }

        if let Some((flow_handle, flow_kind)) = close_params {
            if let Some(callbacks) = self.callbacks {
                let message = reason.unwrap_or("dial_failed");
                logger::breadcrumb(
                    BreadcrumbFlags::FLOW,
                    format!("{:?} dial failed for handle {} ({message})", flow_kind, flow_handle),
                );
                self.notify_close(flow_handle, flow_kind, message, callbacks);
            }
        }
    }

    pub(super) fn request_dial(
        &self,
        handle: u64,
        ip: IpAddress,
        port: u16,
        kind: FlowKind,
        sniffed_host: Option<&str>,
    ) {
        if let Some(platform) = self.platform {
            if platform.protect.is_some() {
                logger::breadcrumb(
                    BreadcrumbFlags::FLOW,
                    format!(
                        "request_dial (protected) kind={:?} handle={} dst={}:{}",
                        kind,
                        handle,
                        ip_string(ip),
                        port
                    ),
                );
                super::protect::spawn_protected_dial(
                    platform,
                    handle,
                    kind,
                    ip,
                    port,
                    self.protected_events_tx.clone(),
                );
                return;
            }
        }
        let callbacks = match self.callbacks {
            Some(cb) => cb,
            None => {
                logger::warn(format!(
                    "request_dial skipped - no callbacks (handle={} kind={:?})",
                    handle, kind
                ));
                return;
            }
        };
        let host = match sniffed_host {
            Some(sniffed) if self.override_destination => sniffed.to_string(),
            _ => ip_string(ip),
        };
        logger::breadcrumb(
            BreadcrumbFlags::FLOW,
            format!(
                "request_dial kind={:?} handle={} host={} port={}",
                kind, handle, host, port
            ),
        );
        if let Ok(c_host) = CString::new(host) {
            unsafe {
                match kind {
                    FlowKind::Tcp => {
                        (callbacks.request_tcp_dial)(c_host.as_ptr(), port, handle, callbacks.context)
                    }
                    FlowKind::Udp => {
                        (callbacks.request_udp_dial)(c_host.as_ptr(), port, handle, callbacks.context)
                    }
                }
            }
        }
    }

    pub(super) fn dispatch_pending_dials(&mut self, now: StdInstant) -> bool {
        if self.callbacks.is_none() {
            return false;
        }
        self.pending_dial_scratch.clear();
        for (key, entry) in self.flow_keys.iter() {
            if let Some(deadline) = entry.next_redial_at {
                if !entry.ready
                    && !entry.pending_dial
                    && entry.dial_attempts < MAX_DIAL_ATTEMPTS
                    && deadline <= now
                {
                    self.pending_dial_scratch.push(*key);
                }
            }
        }

        let mut dispatched = false;
        for i in 0..self.pending_dial_scratch.len() {
            let key = self.pending_dial_scratch[i];
            let dispatch = if let Some(entry) = self.flow_keys.get_mut(&key) {
                if entry.ready || entry.pending_dial || entry.dial_attempts >= MAX_DIAL_ATTEMPTS {
                    None
                } else {
                    entry.pending_dial = true;
                    entry.dial_attempts = entry.dial_attempts.saturating_add(1);
                    entry.next_redial_at = None;
                    entry.dial_started_at = Some(now);
                    Some((entry.handle, entry.kind, entry.sniffed_host.clone()))
                }
            } else {
                None
            };

            if let Some((handle, kind, sniffed_host)) = dispatch {
                logger::breadcrumb(
                    BreadcrumbFlags::FLOW,
                    format!(
                        "Requesting {:?} dial to {}:{} (handle {})",
                        kind,
                        ip_string(key.dst_ip),
                        key.dst_port,
                        handle
                    ),
                );
                self.request_dial(handle, key.dst_ip, key.dst_port, kind, sniffed_host.as_deref());
                dispatched = true;
            }
        }

        dispatched
    }
}
