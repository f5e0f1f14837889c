//! An asynchronous ICMP echo ("ping") probing engine.
//!
//! The crate revolves around [`Session`]: a paced run of echo requests
//! against one target where every request resolves to exactly one
//! [`RoundTrip`]: a matching reply, a time-exceeded notification from an
//! intermediate router, or a timeout. Outcomes feed live [`Statistics`]
//! (loss rate, rtt min/avg/max/mdev) and are fanned out to registered
//! [`SessionObserver`]s.
//!
//! The network is reached through the [`Transport`] capability;
//! [`IcmpTransport`] implements it over a raw or unprivileged datagram ICMP
//! socket, and tests substitute in-process doubles.
//!
//! ## Example
//! A minimal `ping`-style program:
//! ```no_run
#![doc = include_str!("../demos/ping.rs")]
//! ```

pub mod config;
pub mod error;
pub mod observer;
pub mod packet;
pub mod round_trip;
pub mod session;
pub mod stats;
pub mod transport;

pub(crate) mod constants;
pub(crate) mod correlation;
pub(crate) mod receiver;

pub use config::{ConfigError, SessionConfig, SessionConfigBuilder};
pub use error::{Error, Result};
pub use observer::SessionObserver;
pub use packet::{Classification, DecodeError, EchoRequest, Protocol};
pub use round_trip::{RoundTrip, RoundTripOutcome};
pub use session::{Session, SessionState};
pub use stats::{Statistics, StatsSnapshot};
pub use transport::{IcmpTransport, Inbound, Network, Transport};
