use std::sync::Arc;
use std::time::Duration;

use async_ping::{
    IcmpTransport, RoundTrip, RoundTripOutcome, Session, SessionConfig, SessionObserver,
};
use clap::Parser;

/// Simple example exercising the full ping session lifecycle
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Target host name or IP address
    host: String,
    /// Stop after this many echo requests
    #[arg(short, long)]
    count: Option<u64>,
    /// Seconds between consecutive requests
    #[arg(short, long, default_value_t = 1.0)]
    interval: f64,
    /// Give up on the whole run after this many seconds
    #[arg(short = 'w', long)]
    deadline: Option<f64>,
    /// Time to live of outbound requests
    #[arg(short, long, default_value_t = 64)]
    ttl: u32,
    /// Use a privileged raw socket instead of a datagram socket
    #[arg(long)]
    privileged: bool,
}

struct Printer;

impl SessionObserver for Printer {
    fn on_start(&self, session: &Session, _sample: &async_ping::EchoRequest) {
        println!("PING {} over {}", session.address(), session.network());
    }

    fn on_receive(&self, _session: &Session, round_trip: &RoundTrip) {
        match round_trip.outcome {
            RoundTripOutcome::Replied => println!(
                "{} bytes from {}: icmp_seq={} ttl={} time={:.3} ms",
                round_trip.len,
                round_trip.source.expect("replies carry a source"),
                round_trip.sequence,
                round_trip.ttl,
                round_trip.elapsed.as_secs_f64() * 1e3,
            ),
            RoundTripOutcome::TtlExpired => println!(
                "From {}: icmp_seq={} Time to live exceeded",
                round_trip.source.expect("notifications carry a source"),
                round_trip.sequence,
            ),
            RoundTripOutcome::TimedOut => println!(
                "icmp_seq={} timed out after {:.1} s",
                round_trip.sequence,
                round_trip.elapsed.as_secs_f64(),
            ),
        }
    }

    fn on_finish(&self, session: &Session) {
        let snapshot = session.statistics().snapshot();
        println!("--- {} ping statistics ---", session.address());
        println!(
            "{} packets transmitted, {} received, {:.1}% packet loss",
            snapshot.sent,
            snapshot.received,
            snapshot.loss_rate * 100.0,
        );
        if snapshot.received > 0 {
            println!(
                "rtt min/avg/max/mdev = {:.3}/{:.3}/{:.3}/{:.3} ms",
                snapshot.rtt_min.as_secs_f64() * 1e3,
                snapshot.rtt_avg.as_secs_f64() * 1e3,
                snapshot.rtt_max.as_secs_f64() * 1e3,
                snapshot.rtt_mdev.as_secs_f64() * 1e3,
            );
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut builder = SessionConfig::builder()
        .with_ttl(args.ttl)
        .with_interval(Duration::from_secs_f64(args.interval))
        .with_privileged(args.privileged);
    if let Some(count) = args.count {
        builder = builder.with_max_count(count);
    }
    if let Some(deadline) = args.deadline {
        builder = builder.with_deadline(Duration::from_secs_f64(deadline));
    }
    let config = builder.build()?;

    let mut session = Session::new(&args.host, config).await?;
    session.add_observer(Box::new(Printer));

    let transport = IcmpTransport::open(session.network(), session.config().ttl)?;
    let session = Arc::new(session);
    let mut runner = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.run(Arc::new(transport)).await })
    };

    tokio::select! {
        result = &mut runner => result??,
        _ = tokio::signal::ctrl_c() => {
            session.request_stop();
            runner.await??;
        }
    }
    Ok(())
}
