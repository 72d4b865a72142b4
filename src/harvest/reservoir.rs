use serde::Serialize;
use serde_json::value::RawValue;
use tracing::warn;

use super::heap::{self, HeapOrd};

/// Maximum consecutive failed delivery attempts before an event container
/// is dropped instead of being merged back for retry.
pub const MAX_FAILED_EVENT_ATTEMPTS: u32 = 10;

/// Priority at or above which an event is guaranteed retention against any
/// organically sampled event. Sampled priorities live in ~[0, 2).
pub const SYNTHETIC_PRIORITY: f32 = 2.0;

/// One sampled event: a priority and the raw JSON body.
#[derive(Debug, Clone)]
pub struct SampledEvent {
    pub priority: f32,
    seq: u64,
    pub data: Box<RawValue>,
}

impl HeapOrd for SampledEvent {
    fn weaker_than(&self, other: &Self) -> bool {
        // Equal priorities: the later insertion is evicted first, so the
        // first-retained event wins ties for the last slot.
        if self.priority != other.priority {
            self.priority < other.priority
        } else {
            self.seq > other.seq
        }
    }
}

/// Bounded priority reservoir over a stream of events.
///
/// While under capacity, events are kept in arrival order; the min-heap
/// property is established exactly when capacity is first reached. Once
/// full, an incoming event replaces the current weakest only when its
/// priority is strictly greater. After N > C observations the reservoir
/// holds the C highest-priority events seen, ties favoring the
/// earlier-retained event (insertion sequence tie-break).
#[derive(Debug)]
pub struct SamplingReservoir {
    capacity: usize,
    events_seen: u64,
    failed_attempts: u32,
    next_seq: u64,
    events: Vec<SampledEvent>,
}

#[derive(Serialize)]
struct ReservoirProperties {
    reservoir_size: usize,
    events_seen: u64,
}

impl SamplingReservoir {
    /// Creates an empty reservoir. Capacity 0 is legal: nothing is retained
    /// but the seen-count still advances.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events_seen: 0,
            failed_attempts: 0,
            next_seq: 0,
            events: Vec::with_capacity(capacity.min(1024)),
        }
    }

    /// Offers one event for retention.
    pub fn observe(&mut self, data: Box<RawValue>, priority: f32) {
        self.events_seen += 1;
        self.insert(data, priority);
    }

    fn insert(&mut self, data: Box<RawValue>, priority: f32) {
        if self.capacity == 0 {
            return;
        }

        let event = SampledEvent {
            priority,
            seq: self.next_seq,
            data,
        };
        self.next_seq += 1;

        if self.events.len() < self.capacity {
            self.events.push(event);
            if self.events.len() == self.capacity {
                heap::heapify(&mut self.events);
            }
            return;
        }

        if event.priority > self.events[0].priority {
            self.events[0] = event;
            heap::sift_down(&mut self.events, 0);
        }
    }

    /// Folds every retained event of `other` into this reservoir and sums
    /// the seen-counts.
    pub fn merge(&mut self, other: SamplingReservoir) {
        self.events_seen += other.events_seen;
        for event in other.events {
            self.insert(event.data, event.priority);
        }
    }

    /// Merges back a container whose delivery failed.
    ///
    /// Returns false (and keeps `self` untouched) when `other` has already
    /// exhausted its retry budget; otherwise the incremented attempt counter
    /// propagates to this reservoir and the contents merge normally.
    pub fn merge_failed(&mut self, other: SamplingReservoir) -> bool {
        if other.failed_attempts >= MAX_FAILED_EVENT_ATTEMPTS {
            warn!(
                attempts = other.failed_attempts,
                events = other.events.len(),
                "event container exceeded retry budget, dropping",
            );
            return false;
        }

        self.failed_attempts = other.failed_attempts + 1;
        self.merge(other);
        true
    }

    /// Splits the retained events into two halves for payload-size-limited
    /// serialization. The seen-count is conserved across the halves. The
    /// heap invariant does not survive a split; neither half may be observed
    /// into afterwards.
    pub fn split(self) -> (SamplingReservoir, SamplingReservoir) {
        let mut first_events = self.events;
        let half = first_events.len() / 2;
        let second_events = first_events.split_off(half);

        let first_seen = half as u64;
        let first = SamplingReservoir {
            capacity: self.capacity,
            events_seen: first_seen,
            failed_attempts: self.failed_attempts,
            next_seq: 0,
            events: first_events,
        };
        let second = SamplingReservoir {
            capacity: self.capacity,
            events_seen: self.events_seen - first_seen,
            failed_attempts: self.failed_attempts,
            next_seq: 0,
            events: second_events,
        };

        (first, second)
    }

    /// Number of retained events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// True when nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Total events offered, retained or not.
    pub fn events_seen(&self) -> u64 {
        self.events_seen
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Consecutive failed delivery attempts carried by this container.
    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    /// Retained event priorities, unordered. Test and diagnostics helper.
    pub fn priorities(&self) -> Vec<f32> {
        self.events.iter().map(|e| e.priority).collect()
    }

    /// Builds the harvest envelope:
    /// `[run_id, {"reservoir_size": C, "events_seen": N}, [event, ...]]`.
    ///
    /// Returns None when nothing was retained.
    pub fn payload(&self, run_id: &str) -> Option<Vec<u8>> {
        if self.events.is_empty() {
            return None;
        }

        let properties = ReservoirProperties {
            reservoir_size: self.capacity,
            events_seen: self.events_seen,
        };
        let bodies: Vec<&RawValue> = self.events.iter().map(|e| e.data.as_ref()).collect();

        match serde_json::to_vec(&(run_id, properties, bodies)) {
            Ok(body) => Some(body),
            Err(e) => {
                warn!(error = %e, "serializing event payload failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(s: &str) -> Box<RawValue> {
        RawValue::from_string(s.to_string()).expect("valid json")
    }

    fn sorted_priorities(r: &SamplingReservoir) -> Vec<f32> {
        let mut p = r.priorities();
        p.sort_by(|a, b| a.partial_cmp(b).expect("no NaN priorities"));
        p
    }

    #[test]
    fn test_under_capacity_keeps_arrival_order() {
        let mut r = SamplingReservoir::new(4);
        r.observe(raw("1"), 0.5);
        r.observe(raw("2"), 0.1);
        r.observe(raw("3"), 0.9);

        assert_eq!(r.len(), 3);
        assert_eq!(r.priorities(), vec![0.5, 0.1, 0.9]);
    }

    #[test]
    fn test_capacity_two_scenario() {
        let mut r = SamplingReservoir::new(2);
        r.observe(raw("1"), 0.99999);
        r.observe(raw("2"), 0.9);
        r.observe(raw("3"), 0.1);
        r.observe(raw("4"), 0.5);

        assert_eq!(r.events_seen(), 4);
        assert_eq!(sorted_priorities(&r), vec![0.9, 0.99999]);
    }

    #[test]
    fn test_tie_keeps_first_retained() {
        let mut r = SamplingReservoir::new(1);
        r.observe(raw("\"first\""), 0.7);
        r.observe(raw("\"second\""), 0.7);

        assert_eq!(r.len(), 1);
        assert_eq!(r.events[0].data.get(), "\"first\"");
    }

    #[test]
    fn test_capacity_zero_counts_only() {
        let mut r = SamplingReservoir::new(0);
        r.observe(raw("1"), 0.5);
        r.observe(raw("2"), 1.5);

        assert!(r.is_empty());
        assert_eq!(r.events_seen(), 2);
    }

    #[test]
    fn test_synthetic_priority_always_retained() {
        let mut r = SamplingReservoir::new(2);
        r.observe(raw("1"), 1.9);
        r.observe(raw("2"), 1.8);
        r.observe(raw("\"synthetic\""), SYNTHETIC_PRIORITY);

        let p = sorted_priorities(&r);
        assert_eq!(p, vec![1.9, SYNTHETIC_PRIORITY]);
    }

    #[test]
    fn test_matches_reference_max_selection() {
        // Deterministic pseudo-random priorities via an LCG.
        let mut state = 0x9e37_79b9u64;
        let mut next = move || {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            ((state >> 33) % 100_000) as f32 / 50_000.0
        };

        for capacity in [1usize, 3, 16, 50] {
            let mut r = SamplingReservoir::new(capacity);
            let mut all = Vec::new();
            for _ in 0..300 {
                let p = next();
                all.push(p);
                r.observe(raw("0"), p);
            }

            assert!(r.len() <= capacity);

            all.sort_by(|a, b| b.partial_cmp(a).expect("no NaN"));
            all.truncate(capacity);
            all.sort_by(|a, b| a.partial_cmp(b).expect("no NaN"));

            assert_eq!(sorted_priorities(&r), all, "capacity {capacity}");
        }
    }

    #[test]
    fn test_merge_sums_events_seen() {
        let mut a = SamplingReservoir::new(3);
        a.observe(raw("1"), 0.1);
        a.observe(raw("2"), 0.2);

        let mut b = SamplingReservoir::new(3);
        b.observe(raw("3"), 0.9);
        b.observe(raw("4"), 0.8);
        b.observe(raw("5"), 0.7);
        b.observe(raw("6"), 0.6);

        a.merge(b);

        assert_eq!(a.events_seen(), 6);
        assert_eq!(a.len(), 3);
        // The three strongest of {0.1, 0.2, 0.9, 0.8, 0.7} survive.
        assert_eq!(sorted_priorities(&a), vec![0.7, 0.8, 0.9]);
    }

    #[test]
    fn test_merge_failed_propagates_counter() {
        let mut current = SamplingReservoir::new(4);
        current.observe(raw("1"), 0.5);

        let mut failed = SamplingReservoir::new(4);
        failed.observe(raw("2"), 0.6);

        assert!(current.merge_failed(failed));
        assert_eq!(current.failed_attempts(), 1);
        assert_eq!(current.len(), 2);
        assert_eq!(current.events_seen(), 2);
    }

    #[test]
    fn test_merge_failed_at_ceiling_discards() {
        let mut current = SamplingReservoir::new(4);
        current.observe(raw("1"), 0.5);

        let mut failed = SamplingReservoir::new(4);
        failed.observe(raw("2"), 0.6);
        failed.failed_attempts = MAX_FAILED_EVENT_ATTEMPTS;

        assert!(!current.merge_failed(failed));
        assert_eq!(current.len(), 1);
        assert_eq!(current.events_seen(), 1);
        assert_eq!(current.failed_attempts(), 0);
    }

    #[test]
    fn test_split_conserves_events_seen() {
        let mut r = SamplingReservoir::new(10);
        for i in 0..7 {
            r.observe(raw("0"), i as f32 / 10.0);
        }
        r.events_seen = 100;

        let (first, second) = r.split();
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 4);
        assert_eq!(first.events_seen() + second.events_seen(), 100);
    }

    #[test]
    fn test_payload_envelope_shape() {
        let mut r = SamplingReservoir::new(2);
        r.observe(raw(r#"{"type":"Transaction"}"#), 0.5);
        r.observe(raw("{}"), 0.25);
        r.observe(raw("{}"), 0.125);

        let body = r.payload("R1").expect("payload present");
        let parsed: serde_json::Value = serde_json::from_slice(&body).expect("valid json");

        assert_eq!(parsed[0], "R1");
        assert_eq!(parsed[1]["reservoir_size"], 2);
        assert_eq!(parsed[1]["events_seen"], 3);
        assert_eq!(parsed[2].as_array().expect("event array").len(), 2);
    }

    #[test]
    fn test_empty_payload_is_none() {
        let r = SamplingReservoir::new(8);
        assert!(r.payload("R1").is_none());
    }
}
