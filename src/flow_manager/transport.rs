use super::*;
use crate::dns::parse_response;
use crate::stats::Direction;
use state::{buffer_payload, TCP_BACKPRESSURE_MAX_COOLDOWN_MS, TCP_BACKPRESSURE_RETRY_MS};
use std::collections::VecDeque;
use std::time::{Duration as StdDuration, Instant as StdInstant};

impl FlowManager {
    #[inline]
    pub(super) fn forward_remote_payload(
        &mut self,
        handle: u64,
        payload: &[u8],
        kind: FlowKind,
    ) -> bool {
        if payload.is_empty() {
            return true;
        }
        let Some(key) = self.handle_map.get(&handle).copied() else {
            return false;
        };
        if kind == FlowKind::Udp && (key.src_port == 53 || key.dst_port == 53) {
            self.record_dns_response(&key, payload);
        }

        let uid = self.flow_keys.get(&key).map(|entry| entry.uid);
        if let Some(uid) = uid {
            self.stats.record(uid, Direction::Downlink, payload.len() as u64);
        }

        let socket;
        let handle_id;
        {
            let Some(entry) = self.flow_keys.get_mut(&key) else {
                return false;
            };
            if !entry.ready {
                if buffer_payload(entry, payload) {
                    entry.last_activity = StdInstant::now();
                    return true;
                }
                return false;
            }
            socket = entry.socket;
            handle_id = entry.handle;
        }

        let status = match kind {
            FlowKind::Tcp => self.enqueue_remote_tcp(socket, payload),
            FlowKind::Udp => self.enqueue_remote_udp(&key, payload),
        };
        match status {
            FlowStatus::Ok => {
                if let Some(entry_mut) = self.flow_keys.get_mut(&key) {
                    entry_mut.backpressure_retry_at = None;
                    entry_mut.backpressure_cooldown_ms = TCP_BACKPRESSURE_RETRY_MS;
                    entry_mut.last_activity = StdInstant::now();
                }
                self.wake.notify_one();
                true
            }
            FlowStatus::Backpressure(reason) => {
                match kind {
                    FlowKind::Tcp => self.counters.tcp_backpressure_drops += 1,
                    FlowKind::Udp => self.counters.udp_backpressure_drops += 1,
                }
                self.wake.notify_one();
                if kind == FlowKind::Tcp {
                    if let Some(entry) = self.flow_keys.get_mut(&key) {
                        if buffer_payload(entry, payload) {
                            let cooldown = entry
                                .backpressure_cooldown_ms
                                .min(TCP_BACKPRESSURE_MAX_COOLDOWN_MS);
                            entry.backpressure_retry_at =
                                Some(StdInstant::now() + StdDuration::from_millis(cooldown));
                            entry.backpressure_cooldown_ms =
                                (entry.backpressure_cooldown_ms * 2).min(TCP_BACKPRESSURE_MAX_COOLDOWN_MS);
                            entry.last_activity = StdInstant::now();
                            self.wake.notify_one();
                            return true;
                        }
                    }
                } else if let Some(callbacks) = self.callbacks {
                    self.notify_close(handle_id, kind, reason, callbacks);
                }
                false
            }
            FlowStatus::Closed(reason) => {
                self.wake.notify_one();
                if let Some(callbacks) = self.callbacks {
                    self.notify_close(handle_id, kind, reason, callbacks);
                }
                false
            }
        }
    }

    fn enqueue_remote_tcp(&mut self, socket: SocketHandle, payload: &[u8]) -> FlowStatus {
        if payload.is_empty() {
            return FlowStatus::Ok;
        }
        let socket = self.sockets.get_mut::<TcpSocket>(socket);
        if !socket.can_send() {
            return FlowStatus::Backpressure("tcp_send_buffer_full");
        }
        match socket.send_slice(payload) {
            Ok(written) => {
                if written == payload.len() {
                    FlowStatus::Ok
                } else {
                    FlowStatus::Backpressure("tcp_send_buffer_full")
                }
            }
            Err(TcpSendError::InvalidState) => FlowStatus::Closed("tcp_invalid_state"),
        }
    }

    /// Builds a UDP response directly against the flow's 5-tuple instead of
    /// routing through the smoltcp socket, since every UDP flow to the same
    /// bound endpoint would otherwise collide on delivery.
    fn enqueue_remote_udp(&mut self, key: &FlowKey, payload: &[u8]) -> FlowStatus {
        if payload.is_empty() {
            return FlowStatus::Ok;
        }
        if let Some(packet) = super::build_udp_response(key, payload) {
            if let Some(callbacks) = self.callbacks {
                super::interface::emit_frames(callbacks, vec![packet]);
                FlowStatus::Ok
            } else {
                FlowStatus::Closed("no_callbacks")
            }
        } else {
            FlowStatus::Closed("udp_build_failed")
        }
    }

    fn record_dns_response(&self, _key: &FlowKey, payload: &[u8]) {
        let mappings = parse_response(payload);
        if mappings.is_empty() {
            return;
        }
        if let Some(callbacks) = self.callbacks {
            for mapping in &mappings {
                self.emit_dns_mapping(callbacks, mapping);
            }
        }
    }

    #[inline]
    pub(super) fn flush_outbound(&mut self, callbacks: BridgeCallbacks) {
        let mut tcp_handles: smallvec::SmallVec<[(SocketHandle, u64); 32]> = smallvec::SmallVec::new();
        let mut udp_handles: smallvec::SmallVec<[(SocketHandle, u64); 32]> = smallvec::SmallVec::new();

        for entry in self.flow_keys.values() {
            if !entry.ready {
                continue;
            }
            match entry.kind {
                FlowKind::Tcp => tcp_handles.push((entry.socket, entry.handle)),
                FlowKind::Udp => udp_handles.push((entry.socket, entry.handle)),
            }
        }

        for (socket, handle) in tcp_handles {
            self.flush_tcp(socket, handle, callbacks);
        }
        for (socket, handle) in udp_handles {
            self.flush_udp(socket, handle, callbacks);
        }
    }

    pub(super) fn flush_buffered_payloads(&mut self, key: FlowKey) {
        let Some(entry) = self.flow_keys.get_mut(&key) else {
            return;
        };
        if entry.buffered.is_empty() {
            return;
        }
        let handle = entry.handle;
        let kind = entry.kind;
        let protected_writer = entry.protected_writer.clone();
        let mut buffered = VecDeque::new();
        std::mem::swap(&mut buffered, &mut entry.buffered);
        entry.buffered_bytes = 0;

        if let Some(writer) = protected_writer {
            for payload in buffered {
                if !payload.is_empty() {
                    let _ = writer.send(payload);
                }
            }
            return;
        }

        let callbacks = match self.callbacks {
            Some(cb) => cb,
            None => return,
        };

        for payload in buffered {
            if payload.is_empty() {
                continue;
            }
            match kind {
                FlowKind::Tcp => unsafe {
                    (callbacks.tcp_send)(handle, payload.as_ptr(), payload.len(), callbacks.context);
                },
                FlowKind::Udp => unsafe {
                    (callbacks.udp_send)(handle, payload.as_ptr(), payload.len(), callbacks.context);
                },
            }
        }
    }

    #[inline]
    fn flush_tcp(&mut self, socket_handle: SocketHandle, handle: u64, callbacks: BridgeCallbacks) {
        let entry = self.handle_map.get(&handle).and_then(|key| self.flow_keys.get(key));
        let uid = entry.map(|e| e.uid);
        let protected_writer = entry.and_then(|e| e.protected_writer.clone());
        let socket = self.sockets.get_mut::<TcpSocket>(socket_handle);
        while socket.can_recv() {
            self.flush_buffer.clear();
            match socket.recv(|payload| {
                self.flush_buffer.extend_from_slice(payload);
                (payload.len(), ())
            }) {
                Ok(()) => {
                    if self.flush_buffer.is_empty() {
                        break;
                    }
                    match &protected_writer {
                        Some(writer) => {
                            let _ = writer.send(self.flush_buffer.clone());
                        }
                        None => unsafe {
                            (callbacks.tcp_send)(
                                handle,
                                self.flush_buffer.as_ptr(),
                                self.flush_buffer.len(),
                                callbacks.context,
                            );
                        },
                    }
                    self.flow_stats.tcp_flush_events =
                        self.flow_stats.tcp_flush_events.saturating_add(1);
                    self.flow_stats.bytes_emitted = self
                        .flow_stats
                        .bytes_emitted
                        .saturating_add(self.flush_buffer.len() as u64);
                    if let Some(uid) = uid {
                        self.stats
                            .record(uid, Direction::Uplink, self.flush_buffer.len() as u64);
                    }
                }
                Err(_) => break,
            }
        }
    }

    #[inline]
    fn flush_udp(&mut self, socket_handle: SocketHandle, handle: u64, callbacks: BridgeCallbacks) {
        let entry = self.handle_map.get(&handle).and_then(|key| self.flow_keys.get(key));
        let uid = entry.map(|e| e.uid);
        let protected_writer = entry.and_then(|e| e.protected_writer.clone());
        let socket = self.sockets.get_mut::<UdpSocket>(socket_handle);
        while let Ok((payload, _meta)) = socket.recv() {
            match &protected_writer {
                Some(writer) => {
                    let _ = writer.send(payload.to_vec());
                }
                None => unsafe {
                    (callbacks.udp_send)(handle, payload.as_ptr(), payload.len(), callbacks.context);
                },
            }
            self.flow_stats.udp_flush_events =
                self.flow_stats.udp_flush_events.saturating_add(1);
            self.flow_stats.bytes_emitted =
                self.flow_stats.bytes_emitted.saturating_add(payload.len() as u64);
            if let Some(uid) = uid {
                self.stats.record(uid, Direction::Uplink, payload.len() as u64);
            }
        }
    }
}
