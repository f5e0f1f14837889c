use std::time::Duration;

/// Length of the data carried by every echo request: an 8 byte session
/// identifier followed by an 8 byte send timestamp.
pub(crate) const PAYLOAD_LEN: usize = 16;

/// Length of an ICMP/ICMPv6 echo header (type, code, checksum, id, seq).
pub(crate) const ECHO_HEADER_LEN: usize = 8;

pub(crate) const IPV4_HEADER_LEN: usize = 20;
pub(crate) const IPV6_HEADER_LEN: usize = 40;

/// Size of the buffer handed to the transport for each read.
pub(crate) const RECV_BUFFER_LEN: usize = 1024;

/// Capacity of the queue between the receive loop and the event loop.
pub(crate) const RAW_QUEUE_DEPTH: usize = 5;

/// Upper bound on a single transport read, so the receive loop can observe
/// a cancellation request without blocking indefinitely.
pub(crate) const READ_DEADLINE: Duration = Duration::from_secs(1);

/// Lowest pacing interval allowed over unprivileged datagram transports,
/// mirroring the floor the system ping applies to non-root users.
pub(crate) const MIN_UNPRIVILEGED_INTERVAL: Duration = Duration::from_millis(200);
