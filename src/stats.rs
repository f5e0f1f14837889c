use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime};

/// Running moments of the observed round-trip times, in nanoseconds.
#[derive(Debug, Default)]
struct RttMoments {
    count: u64,
    min: u64,
    max: u64,
    sum: u64,
    // Squared nanosecond RTTs overflow u64 past ~4.3s, so the sum of
    // squares is kept wide.
    sq_sum: u128,
}

#[derive(Debug, Default)]
struct Timeline {
    started_at: Option<SystemTime>,
    ended_at: Option<SystemTime>,
}

/// Live counters and round-trip-time moments of a session.
///
/// Counters are independent atomics and only ever increase; a reader may see
/// a torn view across fields while the session is running, but no single
/// counter is ever corrupted. The invariant
/// `sent >= received + timed_out + ttl_expired + errored` holds at all
/// times, with equality once the session has drained.
#[derive(Debug, Default)]
pub struct Statistics {
    sent: AtomicU64,
    received: AtomicU64,
    timed_out: AtomicU64,
    ttl_expired: AtomicU64,
    errored: AtomicU64,
    rtt: Mutex<RttMoments>,
    timeline: Mutex<Timeline>,
}

/// A point-in-time view of [`Statistics`] with the derived values filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub sent: u64,
    pub received: u64,
    pub timed_out: u64,
    pub ttl_expired: u64,
    pub errored: u64,
    /// Requests sent whose outcome has not been resolved yet.
    pub pending: u64,
    /// `1 - received / sent`, or 0 before anything was sent.
    pub loss_rate: f64,
    pub rtt_min: Duration,
    pub rtt_max: Duration,
    pub rtt_avg: Duration,
    /// Mean deviation, the conventional ping jitter statistic.
    pub rtt_mdev: Duration,
}

impl Statistics {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn session_started(&self) {
        self.timeline().started_at = Some(SystemTime::now());
    }

    pub(crate) fn session_ended(&self) {
        self.timeline().ended_at = Some(SystemTime::now());
    }

    pub(crate) fn echo_requested(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn echo_replied(&self, rtt: Duration) {
        self.received.fetch_add(1, Ordering::Relaxed);
        let nanos = rtt.as_nanos() as u64;
        let mut moments = self.rtt.lock().unwrap_or_else(PoisonError::into_inner);
        if moments.count == 0 {
            moments.min = nanos;
            moments.max = nanos;
        } else {
            moments.min = moments.min.min(nanos);
            moments.max = moments.max.max(nanos);
        }
        moments.count += 1;
        moments.sum += nanos;
        moments.sq_sum += u128::from(nanos) * u128::from(nanos);
    }

    pub(crate) fn echo_timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn echo_ttl_expired(&self) {
        self.ttl_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn echo_errored(&self) {
        self.errored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn timed_out(&self) -> u64 {
        self.timed_out.load(Ordering::Relaxed)
    }

    pub fn ttl_expired(&self) -> u64 {
        self.ttl_expired.load(Ordering::Relaxed)
    }

    pub fn errored(&self) -> u64 {
        self.errored.load(Ordering::Relaxed)
    }

    /// The largest round-trip time observed so far, if any reply arrived.
    pub fn rtt_max(&self) -> Option<Duration> {
        let moments = self.rtt.lock().unwrap_or_else(PoisonError::into_inner);
        (moments.count > 0).then(|| Duration::from_nanos(moments.max))
    }

    /// Wall-clock time at which the session started running, `None` until
    /// then.
    pub fn start_time(&self) -> Option<SystemTime> {
        self.timeline().started_at
    }

    /// Wall-clock time at which the session finished, `None` until then.
    pub fn end_time(&self) -> Option<SystemTime> {
        self.timeline().ended_at
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let sent = self.sent();
        let received = self.received();
        let timed_out = self.timed_out();
        let ttl_expired = self.ttl_expired();
        let errored = self.errored();

        let (rtt_min, rtt_max, rtt_avg, rtt_mdev) = {
            let moments = self.rtt.lock().unwrap_or_else(PoisonError::into_inner);
            if moments.count == 0 {
                (
                    Duration::ZERO,
                    Duration::ZERO,
                    Duration::ZERO,
                    Duration::ZERO,
                )
            } else {
                let count = moments.count as f64;
                let avg = moments.sum as f64 / count;
                let mean_sq = moments.sq_sum as f64 / count;
                let mdev = (mean_sq - avg * avg).max(0.0).sqrt();
                (
                    Duration::from_nanos(moments.min),
                    Duration::from_nanos(moments.max),
                    Duration::from_nanos(moments.sum / moments.count),
                    Duration::from_nanos(mdev as u64),
                )
            }
        };

        StatsSnapshot {
            sent,
            received,
            timed_out,
            ttl_expired,
            errored,
            pending: sent
                .saturating_sub(received)
                .saturating_sub(timed_out)
                .saturating_sub(ttl_expired)
                .saturating_sub(errored),
            loss_rate: if sent == 0 {
                0.0
            } else {
                1.0 - received as f64 / sent as f64
            },
            rtt_min,
            rtt_max,
            rtt_avg,
            rtt_mdev,
        }
    }

    fn timeline(&self) -> std::sync::MutexGuard<'_, Timeline> {
        self.timeline.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn pristine_statistics_report_nothing() {
        let stats = Statistics::new();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.sent, 0);
        assert_eq!(snapshot.pending, 0);
        assert_eq!(snapshot.loss_rate, 0.0);
        assert_eq!(snapshot.rtt_min, Duration::ZERO);
        assert_eq!(snapshot.rtt_avg, Duration::ZERO);
        assert_eq!(snapshot.rtt_mdev, Duration::ZERO);
        assert!(stats.rtt_max().is_none());
        assert!(stats.start_time().is_none());
        assert!(stats.end_time().is_none());
    }

    #[test]
    fn pending_tracks_unresolved_requests() {
        let stats = Statistics::new();
        for _ in 0..5 {
            stats.echo_requested();
        }
        stats.echo_replied(ms(1));
        stats.echo_timed_out();
        stats.echo_ttl_expired();
        stats.echo_errored();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.sent, 5);
        assert_eq!(snapshot.pending, 1);
        assert!(snapshot.sent >= snapshot.received + snapshot.timed_out + snapshot.ttl_expired + snapshot.errored);
    }

    #[test]
    fn loss_rate_stays_within_bounds() {
        let stats = Statistics::new();
        stats.echo_requested();
        stats.echo_requested();
        stats.echo_replied(ms(2));
        let loss = stats.snapshot().loss_rate;
        assert_eq!(loss, 0.5);
        assert!((0.0..=1.0).contains(&loss));
    }

    #[test]
    fn rtt_moments_are_ordered() {
        let stats = Statistics::new();
        for rtt in [ms(3), ms(1), ms(2)] {
            stats.echo_requested();
            stats.echo_replied(rtt);
        }
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.rtt_min, ms(1));
        assert_eq!(snapshot.rtt_max, ms(3));
        assert_eq!(snapshot.rtt_avg, ms(2));
        assert!(snapshot.rtt_min <= snapshot.rtt_avg && snapshot.rtt_avg <= snapshot.rtt_max);
        assert_eq!(stats.rtt_max(), Some(ms(3)));
    }

    #[test]
    fn mdev_matches_known_distribution() {
        let stats = Statistics::new();
        // avg = 2ms, E[x^2] = 5ms^2, variance = 1ms^2, mdev = 1ms.
        stats.echo_replied(ms(1));
        stats.echo_replied(ms(3));
        assert_eq!(stats.snapshot().rtt_mdev, ms(1));
    }

    #[test]
    fn timeline_is_recorded_once_set() {
        let stats = Statistics::new();
        stats.session_started();
        let started = stats.start_time().expect("start time must be set");
        assert!(stats.end_time().is_none());
        stats.session_ended();
        let ended = stats.end_time().expect("end time must be set");
        assert!(ended >= started);
    }
}
