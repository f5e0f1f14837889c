use crate::packet::EchoRequest;
use crate::round_trip::RoundTrip;
use crate::session::Session;

/// Hooks into the lifecycle of a [`Session`].
///
/// Observers are registered with [`Session::add_observer`] before the
/// session runs and are invoked synchronously by the engine, in
/// registration order. All methods default to no-ops so an implementation
/// only overrides the events it cares about.
pub trait SessionObserver: Send + Sync {
    /// Called once before the first request is sent, with a sample of the
    /// requests the session is about to emit.
    fn on_start(&self, _session: &Session, _sample: &EchoRequest) {}

    /// Called after each successful transmit.
    fn on_send(&self, _session: &Session) {}

    /// Called with every resolved round trip, after statistics have been
    /// updated.
    fn on_receive(&self, _session: &Session, _round_trip: &RoundTrip) {}

    /// Called once when the session finishes.
    fn on_finish(&self, _session: &Session) {}
}
