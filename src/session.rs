use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, info, trace, warn};
use rand::Rng;
use tokio::net::lookup_host;
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::constants::RAW_QUEUE_DEPTH;
use crate::correlation::CorrelationTable;
use crate::error::{Error, Result};
use crate::observer::SessionObserver;
use crate::packet::{self, Classification, EchoRequest, Protocol};
use crate::receiver::{RawPacket, Receiver};
use crate::round_trip::{RoundTrip, RoundTripOutcome};
use crate::stats::Statistics;
use crate::transport::{Network, Transport};

const CREATED: u8 = 0;
const RUNNING: u8 = 1;
const FINISHED: u8 = 2;

/// Lifecycle of a [`Session`]: `Created → Running → Finished`, with
/// `Finished` terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Running,
    Finished,
}

/// A ping session: a paced sequence of ICMP echo requests against one
/// target, with per-request timeout handling and live statistics.
///
/// A session is created with [`Session::new`], observers are registered
/// with [`Session::add_observer`], and [`Session::run`] drives it to
/// completion over a [`Transport`]. [`Session::request_stop`] ends the run
/// early from another task.
///
/// # Example
/// ```no_run
/// use std::sync::Arc;
/// use async_ping::{IcmpTransport, Session, SessionConfig};
///
/// tokio_test::block_on(async {
///     let config = SessionConfig::builder().with_max_count(4).build().unwrap();
///     let session = Session::new("example.com", config).await.unwrap();
///     let transport = IcmpTransport::open(session.network(), session.config().ttl).unwrap();
///     session.run(Arc::new(transport)).await.unwrap();
///     println!("{:#?}", session.statistics().snapshot());
/// })
/// ```
pub struct Session {
    config: SessionConfig,
    address: SocketAddr,
    network: Network,
    protocol: Protocol,

    /// Identifier carried in the ICMP echo header. Only meaningful end to
    /// end over privileged transports.
    id: u16,
    /// Identifier carried in the payload to attribute replies to this
    /// session regardless of transport privileges. Immutable once created.
    big_id: u64,
    last_sequence: AtomicU16,

    state: AtomicU8,
    stats: Statistics,
    correlation: Arc<CorrelationTable>,
    observers: Vec<Box<dyn SessionObserver>>,

    finish_tx: mpsc::Sender<Option<Error>>,
    finish_rx: Mutex<Option<mpsc::Receiver<Option<Error>>>>,
}

impl Session {
    /// Validates `config`, resolves `host` and creates a session with fresh
    /// identifiers. No socket is opened here; the transport is supplied to
    /// [`Session::run`] already open.
    pub async fn new(host: &str, config: SessionConfig) -> Result<Self> {
        debug!("validating session configuration");
        config.validate()?;

        info!("resolving address {host}");
        let address = lookup_host((host, 0))
            .await
            .map_err(|source| Error::Resolve {
                host: host.to_string(),
                source,
            })?
            .next()
            .ok_or_else(|| Error::NoAddress(host.to_string()))?;

        let ipv4 = address.is_ipv4();
        let network = Network::for_target(ipv4, config.privileged);
        let protocol = if ipv4 {
            Protocol::Icmpv4
        } else {
            Protocol::Icmpv6
        };

        let mut rng = rand::rng();
        let id = rng.random::<u16>();
        let big_id = rng.random::<u64>();
        let (finish_tx, finish_rx) = mpsc::channel(1);

        info!(
            "created session id={id} big_id={big_id} addr={} network={network}",
            address.ip()
        );
        Ok(Self {
            config,
            address,
            network,
            protocol,
            id,
            big_id,
            last_sequence: AtomicU16::new(0),
            state: AtomicU8::new(CREATED),
            stats: Statistics::new(),
            correlation: Arc::new(CorrelationTable::new()),
            observers: Vec::new(),
            finish_tx,
            finish_rx: Mutex::new(Some(finish_rx)),
        })
    }

    /// Registers an observer. Observers must be registered before the
    /// session runs; they are invoked in registration order.
    pub fn add_observer(&mut self, observer: Box<dyn SessionObserver>) {
        self.observers.push(observer);
    }

    /// Runs the session to completion: paces echo requests, matches
    /// replies, and resolves every request to a [`RoundTrip`]. Returns once
    /// the request limit is drained, the deadline expires, a stop is
    /// requested, or the transport fails fatally.
    pub async fn run(&self, transport: Arc<dyn Transport>) -> Result<()> {
        match self
            .state
            .compare_exchange(CREATED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(FINISHED) => return Err(Error::AlreadyFinished),
            Err(_) => return Err(Error::AlreadyStarted),
        }
        let Some(mut finish_rx) = self.finish_rx.lock().await.take() else {
            return Err(Error::AlreadyStarted);
        };

        if !self.config.privileged {
            warn!(
                "running unprivileged: time-exceeded messages cannot be received, requests \
                 beyond a ttl of {} will be reported as timed out",
                self.config.ttl
            );
        }

        self.stats.session_started();
        let sample = EchoRequest::new(self.id, self.peek_sequence(), self.big_id);
        debug!("invoking start observers");
        for observer in &self.observers {
            observer.on_start(self, &sample);
        }

        info!("starting receive loop");
        let token = CancellationToken::new();
        let (raw_tx, mut raw_rx) = mpsc::channel(RAW_QUEUE_DEPTH);
        let receiver = Receiver::new(
            Arc::clone(&transport),
            raw_tx,
            self.finish_tx.clone(),
            token.clone(),
        );
        let mut receiver_handle = tokio::task::spawn_blocking(move || receiver.run());

        let mut pacing = tokio::time::interval(self.config.interval);
        pacing.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let deadline_active = self.config.deadline.is_some();
        let deadline = tokio::time::sleep(self.config.deadline.unwrap_or(Duration::ZERO));
        tokio::pin!(deadline);
        let mut in_flight: FuturesUnordered<BoxFuture<'static, RoundTrip>> =
            FuturesUnordered::new();

        let terminal = loop {
            tokio::select! {
                () = &mut deadline, if deadline_active => {
                    info!("deadline reached, finishing session");
                    break None;
                }
                _ = pacing.tick(), if !self.reached_request_limit() => {
                    self.dispatch_request(transport.as_ref(), &mut in_flight).await;
                    // A failed transmit leaves nothing in flight, so the
                    // limit has to be checked here as well.
                    if self.reached_request_limit() && in_flight.is_empty() {
                        info!("request limit reached and all requests resolved, finishing session");
                        break None;
                    }
                }
                Some(round_trip) = in_flight.next() => {
                    self.complete_round_trip(&round_trip);
                    if self.reached_request_limit() && in_flight.is_empty() {
                        info!("request limit reached and all requests resolved, finishing session");
                        break None;
                    }
                }
                Some(raw) = raw_rx.recv() => {
                    self.handle_inbound(&raw).await;
                }
                Some(reason) = finish_rx.recv() => {
                    info!("finish requested");
                    break reason;
                }
            }
        };

        // Stop is cooperative: every request still in flight resolves to a
        // reply, a TTL expiry or its timeout before the session finishes.
        if !in_flight.is_empty() {
            debug!("draining {} in-flight requests", in_flight.len());
        }
        while !in_flight.is_empty() {
            tokio::select! {
                Some(round_trip) = in_flight.next() => self.complete_round_trip(&round_trip),
                Some(raw) = raw_rx.recv() => self.handle_inbound(&raw).await,
            }
        }

        debug!("stopping receive loop");
        token.cancel();
        loop {
            // Keep both queues flowing until the receive loop exits so it
            // cannot sit blocked on a full channel, blind to cancellation.
            tokio::select! {
                result = &mut receiver_handle => {
                    if result.is_err() {
                        warn!("receive loop terminated abnormally");
                    }
                    break;
                }
                Some(_) = raw_rx.recv() => {}
                Some(_) = finish_rx.recv() => {}
            }
        }

        self.stats.session_ended();
        debug!("invoking finish observers");
        for observer in &self.observers {
            observer.on_finish(self);
        }
        self.state.store(FINISHED, Ordering::Release);
        info!("session finished");

        match terminal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Asks a running session to finish. In-flight requests are still
    /// resolved before the session reports [`SessionState::Finished`].
    /// Safe to call repeatedly and on a finished session.
    pub fn request_stop(&self) {
        if self.is_finished() {
            return;
        }
        info!("requesting session stop");
        let _ = self.finish_tx.try_send(None);
    }

    pub fn state(&self) -> SessionState {
        match self.state.load(Ordering::Acquire) {
            CREATED => SessionState::Created,
            RUNNING => SessionState::Running,
            _ => SessionState::Finished,
        }
    }

    pub fn is_started(&self) -> bool {
        self.state() != SessionState::Created
    }

    pub fn is_finished(&self) -> bool {
        self.state() == SessionState::Finished
    }

    /// The resolved address probed by this session.
    pub fn address(&self) -> IpAddr {
        self.address.ip()
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn big_id(&self) -> u64 {
        self.big_id
    }

    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }

    /// Reserves a delivery slot, sends the next echo request and arms the
    /// race between the slot and the per-request timeout. A transmit
    /// failure is recorded and produces no round trip.
    async fn dispatch_request(
        &self,
        transport: &dyn Transport,
        in_flight: &mut FuturesUnordered<BoxFuture<'static, RoundTrip>>,
    ) {
        let sequence = self.next_sequence();
        let mut slot = self.correlation.reserve(sequence).await;
        self.stats.echo_requested();

        let request = EchoRequest::new(self.id, sequence, self.big_id);
        let bytes = request.encode(self.protocol);
        match transport.send(&bytes, &self.address) {
            Ok(_) => {
                trace!("sent echo request seq={sequence}");
                for observer in &self.observers {
                    observer.on_send(self);
                }

                let timeout = self.timeout_duration();
                let correlation = Arc::clone(&self.correlation);
                in_flight.push(Box::pin(async move {
                    let round_trip = match tokio::time::timeout(timeout, slot.recv()).await {
                        Ok(Some(round_trip)) => round_trip,
                        _ => RoundTrip::timed_out(sequence, timeout),
                    };
                    correlation.erase(sequence).await;
                    round_trip
                }));
            }
            Err(err) => {
                warn!("could not send echo request seq={sequence}: {err}");
                self.stats.echo_errored();
                self.correlation.erase(sequence).await;
            }
        }
    }

    /// Classifies an inbound packet and, if it belongs to this session,
    /// delivers the outcome into the matching slot.
    async fn handle_inbound(&self, raw: &RawPacket) {
        let received_at = packet::unix_nanos_now();
        let classification = match packet::decode(&raw.bytes, self.protocol, received_at) {
            Ok(classification) => classification,
            Err(err) => {
                warn!("could not parse inbound packet: {err}");
                return;
            }
        };

        match classification {
            Classification::EchoReply {
                id,
                sequence,
                big_id,
                len,
                rtt,
            } => {
                if big_id != self.big_id {
                    trace!("discarding echo reply of a foreign session (seq={sequence})");
                    return;
                }
                if self.config.privileged && id != self.id {
                    trace!("discarding echo reply with foreign identifier {id}");
                    return;
                }
                self.deliver(
                    sequence,
                    RoundTrip::replied(sequence, len, raw.ttl, raw.source, rtt),
                )
                .await;
            }
            Classification::TimeExceeded { id, sequence } => {
                if self.config.privileged && id != self.id {
                    trace!("discarding time-exceeded with foreign identifier {id}");
                    return;
                }
                self.deliver(
                    sequence,
                    RoundTrip::ttl_expired(sequence, raw.bytes.len(), raw.ttl, raw.source),
                )
                .await;
            }
            Classification::Ignored => trace!("ignoring unrelated inbound packet"),
        }
    }

    async fn deliver(&self, sequence: u16, round_trip: RoundTrip) {
        match self.correlation.lookup(sequence).await {
            Some(slot) => {
                if slot.try_send(round_trip).is_err() {
                    debug!("delivery slot for sequence {sequence} already resolved");
                }
            }
            None => debug!("no outstanding request for sequence {sequence}, discarding stale reply"),
        }
    }

    /// Records a resolved round trip and fans it out to the observers.
    fn complete_round_trip(&self, round_trip: &RoundTrip) {
        match round_trip.outcome {
            RoundTripOutcome::Replied => self.stats.echo_replied(round_trip.elapsed),
            RoundTripOutcome::TtlExpired => self.stats.echo_ttl_expired(),
            RoundTripOutcome::TimedOut => self.stats.echo_timed_out(),
        }
        for observer in &self.observers {
            observer.on_receive(self, round_trip);
        }
    }

    /// The configured timeout until a first reply has been observed, then
    /// twice the largest round-trip time seen, as the original ping does.
    fn timeout_duration(&self) -> Duration {
        match self.stats.rtt_max() {
            Some(max) => max * 2,
            None => self.config.timeout,
        }
    }

    fn reached_request_limit(&self) -> bool {
        self.config
            .max_count
            .is_some_and(|max| self.stats.sent() >= max)
    }

    fn next_sequence(&self) -> u16 {
        self.last_sequence
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
    }

    fn peek_sequence(&self) -> u16 {
        self.last_sequence.load(Ordering::Relaxed).wrapping_add(1)
    }
}
