//! Bandwidth measurement: a [`PeerProvider`] decorator that counts bytes and
//! datagrams in both directions without altering behaviour.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::{Handle, NetError, PeerProvider};

const WINDOW: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// NetworkCounters
// ---------------------------------------------------------------------------

/// Live counters bumped by the provider.
///
/// Atomics so another thread can read them through [`MeasureProvider::counters`]
/// while the session owns the provider.
#[derive(Debug, Default)]
pub struct NetworkCounters {
    /// Bytes handed to the inner provider.
    pub bytes_sent: AtomicU64,
    /// Bytes received from the inner provider.
    pub bytes_received: AtomicU64,
    /// Datagrams successfully sent.
    pub messages_sent: AtomicU64,
    /// Datagrams received.
    pub messages_received: AtomicU64,
    /// Sends rejected by the inner provider.
    pub send_failures: AtomicU64,
}

impl NetworkCounters {
    /// Record an outgoing datagram.
    pub fn record_send(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an incoming datagram.
    pub fn record_receive(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }
}

/// Totals at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Bytes handed to the inner provider.
    pub bytes_sent: u64,
    /// Bytes received from the inner provider.
    pub bytes_received: u64,
    /// Datagrams successfully sent.
    pub messages_sent: u64,
    /// Datagrams received.
    pub messages_received: u64,
    /// Sends rejected by the inner provider.
    pub send_failures: u64,
}

// ---------------------------------------------------------------------------
// MeasureProvider
// ---------------------------------------------------------------------------

/// Wraps another provider and measures its traffic.
pub struct MeasureProvider<P> {
    inner: P,
    counters: Arc<NetworkCounters>,
    window_start: Instant,
    window_base: StatsSnapshot,
    send_bps: f64,
    recv_bps: f64,
}

impl<P: PeerProvider> MeasureProvider<P> {
    /// Start measuring `inner`.
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            counters: Arc::new(NetworkCounters::default()),
            window_start: Instant::now(),
            window_base: StatsSnapshot::default(),
            send_bps: 0.0,
            recv_bps: 0.0,
        }
    }

    /// Shared counters, readable from other threads.
    pub fn counters(&self) -> Arc<NetworkCounters> {
        Arc::clone(&self.counters)
    }

    /// Totals since creation.
    pub fn snapshot(&self) -> StatsSnapshot {
        self.counters.snapshot()
    }

    /// Outgoing bit rate over the last completed one-second window.
    pub fn send_bits_per_second(&self) -> f64 {
        self.send_bps
    }

    /// Incoming bit rate over the last completed one-second window.
    pub fn recv_bits_per_second(&self) -> f64 {
        self.recv_bps
    }

    /// The wrapped provider.
    pub fn inner(&self) -> &P {
        &self.inner
    }

    /// Close the measurement window if it has run for a full second.
    fn roll_window(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.window_start);
        if elapsed < WINDOW {
            return;
        }
        let current = self.counters.snapshot();
        let secs = elapsed.as_secs_f64();
        self.send_bps = (current.bytes_sent - self.window_base.bytes_sent) as f64 * 8.0 / secs;
        self.recv_bps =
            (current.bytes_received - self.window_base.bytes_received) as f64 * 8.0 / secs;
        self.window_base = current;
        self.window_start = now;
    }
}

impl<P: PeerProvider> PeerProvider for MeasureProvider<P> {
    fn update(&mut self) -> Result<(), NetError> {
        self.roll_window(Instant::now());
        self.inner.update()
    }

    fn local_handle(&self) -> Handle {
        self.inner.local_handle()
    }

    fn set_primary_peer_handle(&mut self, handle: Handle) -> bool {
        self.inner.set_primary_peer_handle(handle)
    }

    fn primary_peer_handle(&self) -> Handle {
        self.inner.primary_peer_handle()
    }

    fn peer_count(&self) -> usize {
        self.inner.peer_count()
    }

    fn peer_handle(&self, index: usize) -> Option<Handle> {
        self.inner.peer_handle(index)
    }

    fn peer_name(&self, index: usize) -> Option<String> {
        self.inner.peer_name(index)
    }

    fn send(&mut self, to: Handle, data: &[u8]) -> Result<(), NetError> {
        match self.inner.send(to, data) {
            Ok(()) => {
                self.counters.record_send(data.len() as u64);
                Ok(())
            }
            Err(err) => {
                self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> Option<(usize, Handle)> {
        let received = self.inner.recv(buf);
        if let Some((size, _)) = received {
            self.counters.record_receive(size as u64);
        }
        received
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{LinkSettings, SimNetwork};

    #[test]
    fn test_counts_both_directions() {
        let net = SimNetwork::new(LinkSettings::default(), 1);
        let mut a = MeasureProvider::new(net.add_peer("a"));
        let mut b = MeasureProvider::new(net.add_peer("b"));

        a.send(b.local_handle(), &[0u8; 100]).unwrap();
        a.send(b.local_handle(), &[0u8; 20]).unwrap();

        let mut buf = [0u8; 256];
        while b.recv(&mut buf).is_some() {}

        let sent = a.snapshot();
        assert_eq!(sent.bytes_sent, 120);
        assert_eq!(sent.messages_sent, 2);
        let received = b.snapshot();
        assert_eq!(received.bytes_received, 120);
        assert_eq!(received.messages_received, 2);
    }

    #[test]
    fn test_failed_send_not_counted_as_bytes() {
        let net = SimNetwork::new(LinkSettings::default(), 1);
        let mut a = MeasureProvider::new(net.add_peer("a"));
        assert!(a.send(Handle(404), &[1, 2, 3]).is_err());
        let snapshot = a.snapshot();
        assert_eq!(snapshot.bytes_sent, 0);
        assert_eq!(snapshot.send_failures, 1);
    }

    #[test]
    fn test_window_computes_bit_rate() {
        let net = SimNetwork::new(LinkSettings::default(), 1);
        let mut a = MeasureProvider::new(net.add_peer("a"));
        let b = net.add_peer("b");
        a.send(b.local_handle(), &[0u8; 125]).unwrap();

        let start = a.window_start;
        a.roll_window(start + Duration::from_millis(500));
        assert_eq!(a.send_bits_per_second(), 0.0);

        a.roll_window(start + Duration::from_secs(2));
        assert!((a.send_bits_per_second() - 500.0).abs() < 1e-9);
        assert_eq!(a.recv_bits_per_second(), 0.0);
    }

    #[test]
    fn test_forwards_listing() {
        let net = SimNetwork::new(LinkSettings::default(), 1);
        let a = MeasureProvider::new(net.add_peer("a"));
        let _b = net.add_peer("b");
        assert_eq!(a.peer_count(), 2);
        assert_eq!(a.inner().local_handle(), a.local_handle());
    }
}
