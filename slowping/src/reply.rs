use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use slowping_common::{echo_reply_for, IcmpHeader, ICMP_HEADER_LEN};

/// Outbound side of the responder. Implemented by the raw socket and by
/// test doubles.
pub trait Transport: Send + Sync + 'static {
    fn send_to(&self, packet: &[u8], dest: Ipv4Addr) -> io::Result<usize>;
}

/// What happened to a single datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Echo Reply sent after holding the request for `delay`.
    Replied { delay: Duration },
    /// Not an Echo Request; no reply and no delay consumed.
    Ignored { icmp_type: u8 },
    /// Shorter than an ICMP header.
    Malformed,
    /// Reply built but the socket write failed.
    SendFailed { delay: Duration },
}

/// Turns Echo Requests into delayed Echo Replies.
pub struct ReplyEngine<T: Transport> {
    transport: Arc<T>,
}

impl<T: Transport> ReplyEngine<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }

    /// Handle one datagram from `source`.
    ///
    /// `next_delay` is called at most once, and only for a well-formed Echo
    /// Request, so ignored and malformed datagrams never advance a source's
    /// delay. The sleep suspends only the calling task.
    pub async fn process<F>(&self, source: Ipv4Addr, datagram: &[u8], next_delay: F) -> Outcome
    where
        F: FnOnce() -> Duration,
    {
        let header = match IcmpHeader::decode(datagram) {
            Ok(header) => header,
            Err(e) => {
                tracing::warn!("Discarding datagram from {}: {}", source, e);
                return Outcome::Malformed;
            }
        };

        if !header.is_echo_request() {
            tracing::debug!(
                "Ignoring ICMP type {} from {}",
                header.icmp_type,
                source
            );
            return Outcome::Ignored {
                icmp_type: header.icmp_type,
            };
        }

        let delay = next_delay();
        tracing::info!(
            "Idle {} ms before replying to {} (id={}, seq={})",
            delay.as_millis(),
            source,
            header.identifier,
            header.sequence
        );
        tokio::time::sleep(delay).await;

        let reply = echo_reply_for(header, &datagram[ICMP_HEADER_LEN..]);

        match self.transport.send_to(&reply, source) {
            Ok(_) => {
                tracing::info!("Echo reply sent to {} (seq={})", source, header.sequence);
                Outcome::Replied { delay }
            }
            Err(e) => {
                tracing::error!("Failed to send echo reply to {}: {}", source, e);
                Outcome::SendFailed { delay }
            }
        }
    }
}
