#![no_std]

//! ICMPv4 echo wire layer shared by the slowping responder and its tests.
//!
//! Everything here is pure: no sockets, no clocks, no allocation except for
//! building a reply buffer.

extern crate alloc;

use alloc::vec::Vec;
use core::fmt;

/// ICMP type for Echo Reply.
pub const ICMP_ECHO_REPLY: u8 = 0;
/// ICMP type for Echo Request.
pub const ICMP_ECHO_REQUEST: u8 = 8;
/// Size of the fixed ICMP header.
pub const ICMP_HEADER_LEN: usize = 8;

/// Internet checksum (RFC 1071) over `data`.
///
/// Words are summed big-endian; an odd trailing byte is padded as the high
/// byte of a final word. Carries are folded twice, which is enough for any
/// buffer a 32-bit accumulator can hold without overflowing.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([word[0], word[1]])));
    }
    if let [last] = words.remainder() {
        sum = sum.wrapping_add(u32::from(*last) << 8);
    }

    sum = (sum >> 16) + (sum & 0xffff);
    sum += sum >> 16;
    !(sum as u16)
}

/// True when `message` (with its checksum field filled in) sums to zero.
pub fn verify(message: &[u8]) -> bool {
    checksum(message) == 0
}

/// Returned when a buffer is too short to hold an ICMP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MalformedHeader {
    /// Number of bytes that were available.
    pub len: usize,
}

impl fmt::Display for MalformedHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ICMP header needs {} bytes, got {}",
            ICMP_HEADER_LEN, self.len
        )
    }
}

/// The fixed 8-byte ICMP echo header. Multi-byte fields are host order here
/// and big-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpHeader {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    pub identifier: u16,
    pub sequence: u16,
}

impl IcmpHeader {
    /// Parse the header from the front of `data`. Trailing bytes are payload
    /// and are ignored.
    pub fn decode(data: &[u8]) -> Result<Self, MalformedHeader> {
        let Some(h) = data.get(..ICMP_HEADER_LEN) else {
            return Err(MalformedHeader { len: data.len() });
        };
        Ok(Self {
            icmp_type: h[0],
            code: h[1],
            checksum: u16::from_be_bytes([h[2], h[3]]),
            identifier: u16::from_be_bytes([h[4], h[5]]),
            sequence: u16::from_be_bytes([h[6], h[7]]),
        })
    }

    /// Serialize in wire order. No validation of type or code.
    pub fn encode(&self) -> [u8; ICMP_HEADER_LEN] {
        let mut out = [0u8; ICMP_HEADER_LEN];
        out[0] = self.icmp_type;
        out[1] = self.code;
        out[2..4].copy_from_slice(&self.checksum.to_be_bytes());
        out[4..6].copy_from_slice(&self.identifier.to_be_bytes());
        out[6..8].copy_from_slice(&self.sequence.to_be_bytes());
        out
    }

    pub fn is_echo_request(&self) -> bool {
        self.icmp_type == ICMP_ECHO_REQUEST
    }

    /// The Echo Reply header answering this request: type 0 and a zeroed
    /// checksum placeholder. Code, identifier and sequence carry over.
    pub fn into_reply(self) -> Self {
        Self {
            icmp_type: ICMP_ECHO_REPLY,
            checksum: 0,
            ..self
        }
    }
}

/// Build the checksummed Echo Reply answering `request`, carrying `payload`
/// verbatim.
pub fn echo_reply_for(request: IcmpHeader, payload: &[u8]) -> Vec<u8> {
    let mut reply = Vec::with_capacity(ICMP_HEADER_LEN + payload.len());
    reply.extend_from_slice(&request.into_reply().encode());
    reply.extend_from_slice(payload);

    let sum = checksum(&reply);
    reply[2..4].copy_from_slice(&sum.to_be_bytes());
    reply
}

/// Build the checksummed Echo Reply for a raw Echo Request message.
///
/// The caller is expected to have checked the request type already.
pub fn build_echo_reply(request: &[u8]) -> Result<Vec<u8>, MalformedHeader> {
    let header = IcmpHeader::decode(request)?;
    Ok(echo_reply_for(header, &request[ICMP_HEADER_LEN..]))
}
