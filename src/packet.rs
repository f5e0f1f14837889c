use std::time::{Duration, SystemTime, UNIX_EPOCH};

use pnet::packet::icmp::{self, echo_reply, echo_request, time_exceeded, IcmpCode, IcmpPacket, IcmpTypes};
use pnet::packet::icmpv6::{self, Icmpv6Code, Icmpv6Packet, Icmpv6Types};
use pnet::packet::Packet;
use thiserror::Error as ThisError;

use crate::constants::{ECHO_HEADER_LEN, IPV4_HEADER_LEN, IPV6_HEADER_LEN, PAYLOAD_LEN};

/// The ICMP flavor spoken on the wire, matching the target address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Icmpv4,
    Icmpv6,
}

#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DecodeError {
    #[error("truncated ICMP message ({0} bytes)")]
    Truncated(usize),
    #[error("echo payload too short: {got} bytes out of 16")]
    ShortPayload { got: usize },
    #[error("truncated embedded datagram in time-exceeded message ({0} bytes)")]
    TruncatedEmbedded(usize),
}

/// What an inbound ICMP message turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// An echo reply carrying this crate's 16 byte payload. `rtt` is the
    /// receive time minus the echoed send timestamp.
    EchoReply {
        id: u16,
        sequence: u16,
        big_id: u64,
        len: usize,
        rtt: Duration,
    },
    /// A time-exceeded notification; `id` and `sequence` are re-extracted
    /// from the embedded original datagram.
    TimeExceeded { id: u16, sequence: u16 },
    /// Any other type or code; not this session's traffic.
    Ignored,
}

/// A single outbound echo request before encoding.
///
/// The wire payload is exactly `big_id` (8 bytes, big-endian) followed by
/// `timestamp` (8 bytes, big-endian nanoseconds since the Unix epoch), so a
/// reply can be attributed to its session and timed without any per-request
/// bookkeeping surviving a process restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoRequest {
    pub id: u16,
    pub sequence: u16,
    pub big_id: u64,
    pub timestamp: i64,
}

impl EchoRequest {
    pub fn new(id: u16, sequence: u16, big_id: u64) -> Self {
        Self {
            id,
            sequence,
            big_id,
            timestamp: unix_nanos_now(),
        }
    }

    pub fn encode(&self, protocol: Protocol) -> Vec<u8> {
        let mut payload = [0u8; PAYLOAD_LEN];
        payload[..8].copy_from_slice(&self.big_id.to_be_bytes());
        payload[8..].copy_from_slice(&self.timestamp.to_be_bytes());

        let mut buf = vec![0u8; ECHO_HEADER_LEN + PAYLOAD_LEN];
        match protocol {
            Protocol::Icmpv4 => {
                let mut packet = echo_request::MutableEchoRequestPacket::new(&mut buf).unwrap();
                packet.set_icmp_type(IcmpTypes::EchoRequest);
                packet.set_icmp_code(IcmpCode::new(0));
                packet.set_identifier(self.id);
                packet.set_sequence_number(self.sequence);
                packet.set_payload(&payload);
                let checksum = icmp::checksum(&IcmpPacket::new(&buf).unwrap());
                let mut packet = echo_request::MutableEchoRequestPacket::new(&mut buf).unwrap();
                packet.set_checksum(checksum);
            }
            Protocol::Icmpv6 => {
                // The checksum covers an IPv6 pseudo header and is filled in
                // by the kernel on ICMPv6 sockets.
                let mut packet =
                    icmpv6::echo_request::MutableEchoRequestPacket::new(&mut buf).unwrap();
                packet.set_icmpv6_type(Icmpv6Types::EchoRequest);
                packet.set_icmpv6_code(Icmpv6Code::new(0));
                packet.set_identifier(self.id);
                packet.set_sequence_number(self.sequence);
                packet.set_payload(&payload);
            }
        }
        buf
    }
}

/// Parses and classifies an inbound ICMP message. `received_at` is the
/// receive timestamp in Unix nanoseconds, used to derive the round-trip time
/// from the echoed send timestamp.
pub fn decode(
    bytes: &[u8],
    protocol: Protocol,
    received_at: i64,
) -> Result<Classification, DecodeError> {
    match protocol {
        Protocol::Icmpv4 => decode_v4(bytes, received_at),
        Protocol::Icmpv6 => decode_v6(bytes, received_at),
    }
}

fn decode_v4(bytes: &[u8], received_at: i64) -> Result<Classification, DecodeError> {
    let packet = IcmpPacket::new(bytes).ok_or(DecodeError::Truncated(bytes.len()))?;
    match packet.get_icmp_type() {
        IcmpTypes::EchoReply => {
            if packet.get_icmp_code() != IcmpCode::new(0) {
                return Ok(Classification::Ignored);
            }
            let reply =
                echo_reply::EchoReplyPacket::new(bytes).ok_or(DecodeError::Truncated(bytes.len()))?;
            classify_echo(
                reply.get_identifier(),
                reply.get_sequence_number(),
                reply.payload(),
                received_at,
            )
        }
        IcmpTypes::TimeExceeded => {
            let exceeded = time_exceeded::TimeExceededPacket::new(bytes)
                .ok_or(DecodeError::Truncated(bytes.len()))?;
            if exceeded.get_icmp_code() != IcmpCode::new(0) {
                // Only the TTL-exceeded-in-transit case concerns a probe.
                return Ok(Classification::Ignored);
            }
            embedded_echo_v4(exceeded.payload())
        }
        _ => Ok(Classification::Ignored),
    }
}

fn decode_v6(bytes: &[u8], received_at: i64) -> Result<Classification, DecodeError> {
    let packet = Icmpv6Packet::new(bytes).ok_or(DecodeError::Truncated(bytes.len()))?;
    match packet.get_icmpv6_type() {
        Icmpv6Types::EchoReply => {
            if packet.get_icmpv6_code() != Icmpv6Code::new(0) {
                return Ok(Classification::Ignored);
            }
            let reply = icmpv6::echo_reply::EchoReplyPacket::new(bytes)
                .ok_or(DecodeError::Truncated(bytes.len()))?;
            classify_echo(
                reply.get_identifier(),
                reply.get_sequence_number(),
                reply.payload(),
                received_at,
            )
        }
        Icmpv6Types::TimeExceeded => {
            if packet.get_icmpv6_code() != Icmpv6Code::new(0) {
                return Ok(Classification::Ignored);
            }
            embedded_echo_v6(packet.payload())
        }
        _ => Ok(Classification::Ignored),
    }
}

fn classify_echo(
    id: u16,
    sequence: u16,
    payload: &[u8],
    received_at: i64,
) -> Result<Classification, DecodeError> {
    if payload.len() < PAYLOAD_LEN {
        return Err(DecodeError::ShortPayload { got: payload.len() });
    }
    let big_id = u64::from_be_bytes(payload[..8].try_into().unwrap());
    let sent_at = i64::from_be_bytes(payload[8..16].try_into().unwrap());
    let rtt = Duration::from_nanos(received_at.saturating_sub(sent_at).max(0) as u64);
    Ok(Classification::EchoReply {
        id,
        sequence,
        big_id,
        len: payload.len(),
        rtt,
    })
}

/// The original datagram follows the time-exceeded header; the echo header
/// sits past the fixed 20 byte embedded IPv4 header.
fn embedded_echo_v4(embedded: &[u8]) -> Result<Classification, DecodeError> {
    if embedded.len() < IPV4_HEADER_LEN + ECHO_HEADER_LEN {
        return Err(DecodeError::TruncatedEmbedded(embedded.len()));
    }
    let echo = echo_request::EchoRequestPacket::new(&embedded[IPV4_HEADER_LEN..])
        .ok_or(DecodeError::TruncatedEmbedded(embedded.len()))?;
    Ok(Classification::TimeExceeded {
        id: echo.get_identifier(),
        sequence: echo.get_sequence_number(),
    })
}

/// The ICMPv6 time-exceeded body starts with 4 unused bytes, then the
/// original datagram with its fixed 40 byte IPv6 header.
fn embedded_echo_v6(body: &[u8]) -> Result<Classification, DecodeError> {
    const UNUSED_LEN: usize = 4;
    if body.len() < UNUSED_LEN + IPV6_HEADER_LEN + ECHO_HEADER_LEN {
        return Err(DecodeError::TruncatedEmbedded(body.len()));
    }
    let echo = icmpv6::echo_request::EchoRequestPacket::new(&body[UNUSED_LEN + IPV6_HEADER_LEN..])
        .ok_or(DecodeError::TruncatedEmbedded(body.len()))?;
    Ok(Classification::TimeExceeded {
        id: echo.get_identifier(),
        sequence: echo.get_sequence_number(),
    })
}

pub(crate) fn unix_nanos_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_nanos() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: u16 = 0x0102;
    const SEQ: u16 = 77;
    const BIG_ID: u64 = 0xdead_beef_cafe_f00d;
    const SENT_AT: i64 = 1_700_000_000_000_000_000;

    fn request(protocol: Protocol) -> Vec<u8> {
        EchoRequest {
            id: ID,
            sequence: SEQ,
            big_id: BIG_ID,
            timestamp: SENT_AT,
        }
        .encode(protocol)
    }

    /// Turns an encoded request into the reply a target host would send.
    fn into_reply(mut bytes: Vec<u8>, protocol: Protocol) -> Vec<u8> {
        bytes[0] = match protocol {
            Protocol::Icmpv4 => 0,
            Protocol::Icmpv6 => 129,
        };
        bytes
    }

    /// Builds the time-exceeded notification a router would emit for the
    /// given encoded request.
    fn time_exceeded_for(request: &[u8], protocol: Protocol) -> Vec<u8> {
        match protocol {
            Protocol::Icmpv4 => {
                // type, code, checksum, unused, embedded IPv4 header, echo.
                let mut bytes = vec![0u8; 8 + IPV4_HEADER_LEN + request.len()];
                bytes[0] = 11;
                bytes[8 + IPV4_HEADER_LEN..].copy_from_slice(request);
                bytes
            }
            Protocol::Icmpv6 => {
                // type, code, checksum, unused, embedded IPv6 header, echo.
                let mut bytes = vec![0u8; 8 + IPV6_HEADER_LEN + request.len()];
                bytes[0] = 3;
                bytes[8 + IPV6_HEADER_LEN..].copy_from_slice(request);
                bytes
            }
        }
    }

    #[test]
    fn encoded_request_has_fixed_layout() {
        let bytes = request(Protocol::Icmpv4);
        assert_eq!(bytes.len(), ECHO_HEADER_LEN + PAYLOAD_LEN);
        assert_eq!(bytes[0], 8);
        assert_eq!(bytes[1], 0);
        assert_eq!(&bytes[8..16], &BIG_ID.to_be_bytes());
        assert_eq!(&bytes[16..24], &SENT_AT.to_be_bytes());
        // Marshalling fills in the ICMPv4 checksum.
        assert_ne!(bytes[2..4], [0, 0]);
    }

    #[test]
    fn reply_round_trips_byte_exact() {
        for protocol in [Protocol::Icmpv4, Protocol::Icmpv6] {
            let reply = into_reply(request(protocol), protocol);
            let classification = decode(&reply, protocol, SENT_AT + 1_500_000).unwrap();
            assert_eq!(
                classification,
                Classification::EchoReply {
                    id: ID,
                    sequence: SEQ,
                    big_id: BIG_ID,
                    len: PAYLOAD_LEN,
                    rtt: Duration::from_nanos(1_500_000),
                }
            );
        }
    }

    #[test]
    fn clock_skew_clamps_rtt_to_zero() {
        let reply = into_reply(request(Protocol::Icmpv4), Protocol::Icmpv4);
        match decode(&reply, Protocol::Icmpv4, SENT_AT - 5).unwrap() {
            Classification::EchoReply { rtt, .. } => assert_eq!(rtt, Duration::ZERO),
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn short_payload_is_an_error() {
        let mut reply = into_reply(request(Protocol::Icmpv4), Protocol::Icmpv4);
        reply.truncate(ECHO_HEADER_LEN + 8);
        assert_eq!(
            decode(&reply, Protocol::Icmpv4, SENT_AT).unwrap_err(),
            DecodeError::ShortPayload { got: 8 }
        );
    }

    #[test]
    fn unrelated_types_are_ignored() {
        // Destination unreachable, and an echo reply with a nonzero code.
        let mut unreachable = into_reply(request(Protocol::Icmpv4), Protocol::Icmpv4);
        unreachable[0] = 3;
        assert_eq!(
            decode(&unreachable, Protocol::Icmpv4, SENT_AT).unwrap(),
            Classification::Ignored
        );

        let mut bad_code = into_reply(request(Protocol::Icmpv4), Protocol::Icmpv4);
        bad_code[1] = 1;
        assert_eq!(
            decode(&bad_code, Protocol::Icmpv4, SENT_AT).unwrap(),
            Classification::Ignored
        );
    }

    #[test]
    fn echo_requests_are_not_replies() {
        // Our own outbound request looping back must not classify as a reply.
        let bytes = request(Protocol::Icmpv4);
        assert_eq!(
            decode(&bytes, Protocol::Icmpv4, SENT_AT).unwrap(),
            Classification::Ignored
        );
    }

    #[test]
    fn time_exceeded_recovers_id_and_sequence() {
        for protocol in [Protocol::Icmpv4, Protocol::Icmpv6] {
            let notification = time_exceeded_for(&request(protocol), protocol);
            assert_eq!(
                decode(&notification, protocol, SENT_AT).unwrap(),
                Classification::TimeExceeded {
                    id: ID,
                    sequence: SEQ,
                }
            );
        }
    }

    #[test]
    fn truncated_time_exceeded_is_an_error() {
        let mut notification = time_exceeded_for(&request(Protocol::Icmpv4), Protocol::Icmpv4);
        notification.truncate(8 + IPV4_HEADER_LEN + 4);
        assert!(matches!(
            decode(&notification, Protocol::Icmpv4, SENT_AT),
            Err(DecodeError::TruncatedEmbedded(_))
        ));
    }

    #[test]
    fn truncated_message_is_an_error() {
        assert!(matches!(
            decode(&[8, 0], Protocol::Icmpv4, SENT_AT),
            Err(DecodeError::Truncated(2))
        ));
    }
}
