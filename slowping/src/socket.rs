use anyhow::{Context, Result};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use crate::listener::PacketSource;
use crate::reply::Transport;

/// Open the raw ICMPv4 socket, bound to every interface.
///
/// Reads time out after `read_timeout` so the receive loop can notice a
/// shutdown request.
pub fn open_raw_icmp_socket(read_timeout: Duration) -> Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).context(
        "failed to open raw ICMP socket; run as root or grant CAP_NET_RAW \
         (cargo xtask setcap)",
    )?;

    socket.set_nonblocking(false)?;
    socket.set_read_timeout(Some(read_timeout))?;
    socket
        .bind(&SockAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)))
        .context("failed to bind raw ICMP socket to 0.0.0.0")?;

    Ok(socket)
}

// Each send_to is a single datagram syscall, so concurrent senders never
// interleave bytes and no write lock is needed.
impl Transport for Socket {
    fn send_to(&self, packet: &[u8], dest: Ipv4Addr) -> io::Result<usize> {
        Socket::send_to(self, packet, &SockAddr::from(SocketAddrV4::new(dest, 0)))
    }
}

impl PacketSource for Socket {
    fn recv_packet(&self, buf: &mut [u8]) -> io::Result<(usize, SockAddr)> {
        // SAFETY: recv_from never writes uninitialised bytes, so viewing an
        // initialised buffer as `MaybeUninit<u8>` is sound.
        let buf = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
        self.recv_from(buf)
    }
}
