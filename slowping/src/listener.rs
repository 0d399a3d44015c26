use etherparse::Ipv4HeaderSlice;
use socket2::SockAddr;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::{Datagram, Dispatcher};
use crate::reply::Transport;

/// Inbound side of the responder. Implemented by the raw socket and by
/// test doubles.
pub trait PacketSource: Send + Sync + 'static {
    /// Read one packet into `buf`, returning its length and sender.
    fn recv_packet(&self, buf: &mut [u8]) -> io::Result<(usize, SockAddr)>;
}

/// Receive loop: reads raw ICMP packets and feeds the dispatcher.
pub struct Listener<S: PacketSource, T: Transport> {
    source: Arc<S>,
    dispatcher: Arc<Dispatcher<T>>,
    cancel: CancellationToken,
    max_datagram: usize,
}

impl<S: PacketSource, T: Transport> Listener<S, T> {
    pub fn new(
        source: Arc<S>,
        dispatcher: Arc<Dispatcher<T>>,
        cancel: CancellationToken,
        max_datagram: usize,
    ) -> Self {
        Self {
            source,
            dispatcher,
            cancel,
            max_datagram,
        }
    }

    /// Run until `cancel` fires. Blocking; call from a dedicated thread.
    ///
    /// Dispatch is driven through `handle`, so a full per-source queue under
    /// the `block` policy, or an inline delay, stalls this loop. Both are cut
    /// short by cancellation so nothing outlives the runtime.
    pub fn run(self, handle: Handle) {
        let mut buffer = vec![0u8; self.max_datagram];

        while !self.cancel.is_cancelled() {
            let (len, from) = match self.source.recv_packet(&mut buffer) {
                Ok(received) => received,
                Err(_) if self.cancel.is_cancelled() => break,
                Err(e) if is_poll_tick(&e) => continue,
                Err(e) => {
                    tracing::warn!("I/O error on ICMP socket: {}", e);
                    continue;
                }
            };
            // A socket shut down mid-read returns an empty packet.
            if self.cancel.is_cancelled() {
                break;
            }

            let Some(source) = from.as_socket_ipv4().map(|addr| *addr.ip()) else {
                tracing::debug!("Ignoring packet from non-IPv4 address {:?}", from);
                continue;
            };

            match extract_datagram(&buffer[..len], source) {
                Some(datagram) => handle.block_on(async {
                    tokio::select! {
                        _ = self.dispatcher.dispatch(datagram) => {}
                        _ = self.cancel.cancelled() => {}
                    }
                }),
                None => tracing::warn!("Discarding packet from {}: bad IPv4 header", source),
            }
        }

        tracing::info!("Listener stopped");
    }
}

/// Read timeouts and signal interruptions just give the loop a chance to
/// check for cancellation.
fn is_poll_tick(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// Strip the IPv4 header (options included) that raw sockets deliver and copy
/// the ICMP message out of the shared receive buffer.
pub fn extract_datagram(packet: &[u8], source: Ipv4Addr) -> Option<Datagram> {
    let header = Ipv4HeaderSlice::from_slice(packet).ok()?;
    let icmp = packet.get(header.slice().len()..)?;
    Some(Datagram {
        source,
        bytes: icmp.to_vec(),
    })
}
