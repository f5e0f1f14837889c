use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use log::{error, trace};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::constants::{READ_DEADLINE, RECV_BUFFER_LEN};
use crate::error::Error;
use crate::transport::Transport;

/// A datagram read off the transport, before any parsing.
pub(crate) struct RawPacket {
    pub(crate) bytes: Vec<u8>,
    pub(crate) ttl: u8,
    pub(crate) source: IpAddr,
}

/// The background receive loop. Reads are bounded by a short deadline so
/// the loop can observe cancellation; everything read is pushed into the
/// session's packet queue untouched.
pub(crate) struct Receiver {
    transport: Arc<dyn Transport>,
    packets: mpsc::Sender<RawPacket>,
    finish: mpsc::Sender<Option<Error>>,
    token: CancellationToken,
}

impl Receiver {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        packets: mpsc::Sender<RawPacket>,
        finish: mpsc::Sender<Option<Error>>,
        token: CancellationToken,
    ) -> Self {
        Self {
            transport,
            packets,
            finish,
            token,
        }
    }

    /// Blocks until cancelled or the transport fails; run on the blocking
    /// pool.
    pub(crate) fn run(self) {
        let mut buf = [0u8; RECV_BUFFER_LEN];
        while !self.token.is_cancelled() {
            match self.transport.recv(&mut buf, READ_DEADLINE) {
                Ok(inbound) => {
                    trace!("received {} bytes from {}", inbound.len, inbound.source);
                    let packet = RawPacket {
                        bytes: buf[..inbound.len].to_vec(),
                        ttl: inbound.ttl,
                        source: inbound.source,
                    };
                    if self.packets.blocking_send(packet).is_err() {
                        // The session dropped the queue; it is tearing down.
                        break;
                    }
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    continue
                }
                Err(err) => {
                    if self.token.is_cancelled() {
                        break;
                    }
                    error!("receive loop failed: {err}");
                    let _ = self.finish.blocking_send(Some(Error::Transport(err)));
                    break;
                }
            }
        }
    }
}
