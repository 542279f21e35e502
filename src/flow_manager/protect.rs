//! In-process protected dialing.
//!
//! When the host installs a `protect` platform callback, upstream sockets
//! are opened, marked, and connected here instead of being handed off to
//! `BridgeCallbacks::request_tcp_dial`/`request_udp_dial`. This mirrors how
//! a VPN client keeps its own outbound connections from looping back
//! through the tunnel it just created.

use super::packet_builder::smolt_to_std_ip;
use super::FlowKind;
use crate::ffi::BridgePlatformCallbacks;
use smoltcp::wire::IpAddress;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tokio::sync::mpsc;

const TCP_READ_BUFFER: usize = 16 * 1024;
const UDP_READ_BUFFER: usize = 64 * 1024;

pub(super) enum ProtectedEvent {
    Connected {
        handle: u64,
        kind: FlowKind,
        writer: mpsc::UnboundedSender<Vec<u8>>,
    },
    Data {
        handle: u64,
        kind: FlowKind,
        payload: Vec<u8>,
    },
    Closed {
        handle: u64,
        kind: FlowKind,
        reason: &'static str,
    },
}

/// Invokes the platform `protect` callback against `fd`. No-op (always
/// succeeds) when the host didn't install one.
fn protect_fd(platform: &BridgePlatformCallbacks, fd: i32) -> bool {
    match platform.protect {
        Some(protect) => unsafe { protect(fd, platform.context) },
        None => true,
    }
}

pub(super) fn spawn_protected_dial(
    platform: BridgePlatformCallbacks,
    handle: u64,
    kind: FlowKind,
    ip: IpAddress,
    port: u16,
    events: mpsc::UnboundedSender<ProtectedEvent>,
) {
    let addr = SocketAddr::new(smolt_to_std_ip(ip), port);
    tokio::spawn(async move {
        match kind {
            FlowKind::Tcp => dial_tcp(platform, handle, addr, events).await,
            FlowKind::Udp => dial_udp(platform, handle, addr, events).await,
        }
    });
}

async fn dial_tcp(
    platform: BridgePlatformCallbacks,
    handle: u64,
    addr: SocketAddr,
    events: mpsc::UnboundedSender<ProtectedEvent>,
) {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    };
    let socket = match socket {
        Ok(socket) => socket,
        Err(_) => {
            let _ = events.send(ProtectedEvent::Closed {
                handle,
                kind: FlowKind::Tcp,
                reason: "socket_create_failed",
            });
            return;
        }
    };
    if !protect_fd(&platform, socket.as_raw_fd()) {
        let _ = events.send(ProtectedEvent::Closed {
            handle,
            kind: FlowKind::Tcp,
            reason: "protect_rejected",
        });
        return;
    }
    let stream = match socket.connect(addr).await {
        Ok(stream) => stream,
        Err(_) => {
            let _ = events.send(ProtectedEvent::Closed {
                handle,
                kind: FlowKind::Tcp,
                reason: "connect_failed",
            });
            return;
        }
    };
    run_tcp(handle, stream, events).await;
}

async fn run_tcp(handle: u64, stream: TcpStream, events: mpsc::UnboundedSender<ProtectedEvent>) {
    let (mut reader, mut writer_half) = stream.into_split();
    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    if events
        .send(ProtectedEvent::Connected {
            handle,
            kind: FlowKind::Tcp,
            writer: writer_tx,
        })
        .is_err()
    {
        return;
    }

    let mut buf = vec![0u8; TCP_READ_BUFFER];
    loop {
        tokio::select! {
            result = reader.read(&mut buf) => {
                match result {
                    Ok(0) | Err(_) => {
                        let _ = events.send(ProtectedEvent::Closed { handle, kind: FlowKind::Tcp, reason: "remote_closed" });
                        return;
                    }
                    Ok(n) => {
                        if events.send(ProtectedEvent::Data { handle, kind: FlowKind::Tcp, payload: buf[..n].to_vec() }).is_err() {
                            return;
                        }
                    }
                }
            }
            payload = writer_rx.recv() => {
                match payload {
                    Some(bytes) => {
                        if writer_half.write_all(&bytes).await.is_err() {
                            let _ = events.send(ProtectedEvent::Closed { handle, kind: FlowKind::Tcp, reason: "write_failed" });
                            return;
                        }
                    }
                    None => {
                        let _ = events.send(ProtectedEvent::Closed { handle, kind: FlowKind::Tcp, reason: "local_closed" });
                        return;
                    }
                }
            }
        }
    }
}

async fn dial_udp(
    platform: BridgePlatformCallbacks,
    handle: u64,
    addr: SocketAddr,
    events: mpsc::UnboundedSender<ProtectedEvent>,
) {
    let bind_addr: SocketAddr = match addr {
        SocketAddr::V4(_) => ([0, 0, 0, 0], 0).into(),
        SocketAddr::V6(_) => ([0u16; 8], 0).into(),
    };
    let std_socket = match std::net::UdpSocket::bind(bind_addr) {
        Ok(socket) => socket,
        Err(_) => {
            let _ = events.send(ProtectedEvent::Closed {
                handle,
                kind: FlowKind::Udp,
                reason: "socket_create_failed",
            });
            return;
        }
    };
    if !protect_fd(&platform, std_socket.as_raw_fd()) {
        let _ = events.send(ProtectedEvent::Closed {
            handle,
            kind: FlowKind::Udp,
            reason: "protect_rejected",
        });
        return;
    }
    if std_socket.connect(addr).is_err() {
        let _ = events.send(ProtectedEvent::Closed {
            handle,
            kind: FlowKind::Udp,
            reason: "connect_failed",
        });
        return;
    }
    if std_socket.set_nonblocking(true).is_err() {
        let _ = events.send(ProtectedEvent::Closed {
            handle,
            kind: FlowKind::Udp,
            reason: "nonblocking_failed",
        });
        return;
    }
    let socket = match UdpSocket::from_std(std_socket) {
        Ok(socket) => socket,
        Err(_) => {
            let _ = events.send(ProtectedEvent::Closed {
                handle,
                kind: FlowKind::Udp,
                reason: "socket_create_failed",
            });
            return;
        }
    };
    run_udp(handle, socket, events).await;
}

async fn run_udp(handle: u64, socket: UdpSocket, events: mpsc::UnboundedSender<ProtectedEvent>) {
    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    if events
        .send(ProtectedEvent::Connected {
            handle,
            kind: FlowKind::Udp,
            writer: writer_tx,
        })
        .is_err()
    {
        return;
    }

    let mut buf = vec![0u8; UDP_READ_BUFFER];
    loop {
        tokio::select! {
            result = socket.recv(&mut buf) => {
                match result {
                    Ok(n) => {
                        if events.send(ProtectedEvent::Data { handle, kind: FlowKind::Udp, payload: buf[..n].to_vec() }).is_err() {
                            return;
                        }
                    }
                    Err(_) => {
                        let _ = events.send(ProtectedEvent::Closed { handle, kind: FlowKind::Udp, reason: "recv_failed" });
                        return;
                    }
                }
            }
            payload = writer_rx.recv() => {
                match payload {
                    Some(bytes) => {
                        let _ = socket.send(&bytes).await;
                    }
        None => {
                        let _ = events.send(ProtectedEvent::Closed { handle, kind: FlowKind::Udp, reason: "local_closed" });
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::BridgePlatformCallbacks;
    use std::ptr;
    use tokio::net::TcpListener;

    fn platform_without_protect() -> BridgePlatformCallbacks {
        BridgePlatformCallbacks {
            protect: None,
            dump_uid: None,
            error_handler: None,
            update_stats: None,
            context: ptr::null_mut(),
        }
    }

    #[test]
    fn protect_fd_without_callback_always_succeeds() {
        let platform = platform_without_protect();
        assert!(protect_fd(&platform, 3));
    }

    #[tokio::test]
    async fn protected_tcp_dial_connects_and_relays_data() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"hello").await.unwrap();
        });

        let std::net::IpAddr::V4(ip_v4) = addr.ip() else {
            unreachable!("TcpListener bound to an IPv4 loopback address")
        };
        let ip = smoltcp::wire::IpAddress::Ipv4(smoltcp::wire::Ipv4Address::from(ip_v4));

        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_protected_dial(platform_without_protect(), 7, FlowKind::Tcp, ip, addr.port(), tx);

        let connected = rx.recv().await.expect("expected connected event");
        assert!(matches!(connected, ProtectedEvent::Connected { handle: 7, kind: FlowKind::Tcp, .. }));

        let data = rx.recv().await.expect("expected data event");
        match data {
            ProtectedEvent::Data { handle, kind, payload } => {
                assert_eq!(handle, 7);
                assert_eq!(kind, FlowKind::Tcp);
                assert_eq!(payload, b"hello");
            }
            other => panic!("unexpected event after connect: {:?}", std::mem::discriminant(&other)),
        }
    }
}
