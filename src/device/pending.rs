//! FIFO bookkeeping for sends awaiting an acknowledgement and receives awaiting
//! their statistics line.
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Timestamps of sent messages per destination, oldest first.
///
/// The device confirms sends to one destination strictly in order, so an ack
/// always belongs to the front of that destination's queue. A destination with
/// nothing outstanding has no queue at all.
#[derive(Debug, Default)]
pub struct PendingSends {
    acks: HashMap<String, VecDeque<DateTime<Utc>>>,
    /// Sends that have not been given a device sequence number yet
    unsequenced: HashMap<String, VecDeque<DateTime<Utc>>>,
    /// Last sequence number seen per destination; retransmissions repeat it.
    /// Dropped once the destination has nothing outstanding.
    last_seq: HashMap<String, u32>,
}

impl PendingSends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, destination: &str, timestamp: DateTime<Utc>) {
        self.acks
            .entry(destination.to_string())
            .or_default()
            .push_back(timestamp);
        self.unsequenced
            .entry(destination.to_string())
            .or_default()
            .push_back(timestamp);
    }

    /// Undo a [`push`](Self::push) whose write failed.
    pub fn retract(&mut self, destination: &str, timestamp: DateTime<Utc>) -> bool {
        let removed = remove_last(&mut self.acks, destination, timestamp);
        remove_last(&mut self.unsequenced, destination, timestamp);
        self.forget_if_idle(destination);
        removed
    }

    /// Oldest outstanding send to `destination`.
    pub fn pop_ack(&mut self, destination: &str) -> Option<DateTime<Utc>> {
        let queue = self.acks.get_mut(destination)?;
        let timestamp = queue.pop_front();
        if queue.is_empty() {
            self.acks.remove(destination);
        }
        if let Some(ts) = timestamp {
            // an acknowledged send no longer waits for a sequence number
            remove_first(&mut self.unsequenced, destination, ts);
        }
        self.forget_if_idle(destination);
        timestamp
    }

    /// Give `seq` to the oldest unsequenced send to `destination`. A repeat of
    /// the previous sequence number for that destination is a retransmission and
    /// yields `None`.
    pub fn assign_sequence(&mut self, destination: &str, seq: u32) -> Option<DateTime<Utc>> {
        if self.last_seq.get(destination) == Some(&seq) {
            return None;
        }
        let queue = self.unsequenced.get_mut(destination)?;
        let timestamp = queue.pop_front()?;
        if queue.is_empty() {
            self.unsequenced.remove(destination);
        }
        self.last_seq.insert(destination.to_string(), seq);
        Some(timestamp)
    }

    pub fn outstanding(&self, destination: &str) -> usize {
        self.acks.get(destination).map(VecDeque::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.acks.is_empty()
    }

    pub fn clear(&mut self) {
        self.acks.clear();
        self.unsequenced.clear();
        self.last_seq.clear();
    }

    /// Destinations with any per-destination state left.
    pub fn tracked_destinations(&self) -> usize {
        let mut destinations: Vec<&String> = self
            .acks
            .keys()
            .chain(self.unsequenced.keys())
            .chain(self.last_seq.keys())
            .collect();
        destinations.sort();
        destinations.dedup();
        destinations.len()
    }

    fn forget_if_idle(&mut self, destination: &str) {
        if !self.acks.contains_key(destination) {
            self.last_seq.remove(destination);
        }
    }
}

fn remove_last(
    map: &mut HashMap<String, VecDeque<DateTime<Utc>>>,
    destination: &str,
    timestamp: DateTime<Utc>,
) -> bool {
    let Some(queue) = map.get_mut(destination) else {
        return false;
    };
    let removed = match queue.iter().rposition(|ts| *ts == timestamp) {
        Some(pos) => queue.remove(pos).is_some(),
        None => false,
    };
    if queue.is_empty() {
        map.remove(destination);
    }
    removed
}

fn remove_first(
    map: &mut HashMap<String, VecDeque<DateTime<Utc>>>,
    destination: &str,
    timestamp: DateTime<Utc>,
) {
    if let Some(queue) = map.get_mut(destination) {
        if let Some(pos) = queue.iter().position(|ts| *ts == timestamp) {
            queue.remove(pos);
        }
        if queue.is_empty() {
            map.remove(destination);
        }
    }
}

/// A received message waiting for the statistics line that describes it
#[derive(Debug, Clone)]
pub struct PendingReceive {
    pub source: String,
    pub payload: String,
    pub arrived: Instant,
}

#[derive(Debug, Default)]
pub struct PendingReceives {
    queue: VecDeque<PendingReceive>,
}

impl PendingReceives {
    pub fn push(&mut self, source: String, payload: String, arrived: Instant) {
        self.queue.push_back(PendingReceive {
            source,
            payload,
            arrived,
        });
    }

    pub fn pop_oldest(&mut self) -> Option<PendingReceive> {
        self.queue.pop_front()
    }

    /// Remove every receive that has waited at least `grace`.
    pub fn take_expired(&mut self, now: Instant, grace: Duration) -> Vec<PendingReceive> {
        let mut expired = Vec::new();
        while let Some(front) = self.queue.front() {
            if now.saturating_duration_since(front.arrived) < grace {
                break;
            }
            if let Some(receive) = self.queue.pop_front() {
                expired.push(receive);
            }
        }
        expired
    }

    pub fn drain(&mut self) -> Vec<PendingReceive> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn acks_pop_in_send_order_per_destination() {
        let mut pending = PendingSends::new();
        pending.push("AB", ts(1));
        pending.push("CD", ts(2));
        pending.push("AB", ts(3));
        assert_eq!(pending.pop_ack("AB"), Some(ts(1)));
        assert_eq!(pending.pop_ack("CD"), Some(ts(2)));
        assert_eq!(pending.outstanding("CD"), 0);
        assert_eq!(pending.pop_ack("CD"), None);
        assert_eq!(pending.pop_ack("AB"), Some(ts(3)));
        assert!(pending.is_empty());
    }

    #[test]
    fn retract_removes_the_failed_send() {
        let mut pending = PendingSends::new();
        pending.push("AB", ts(1));
        pending.push("AB", ts(2));
        assert!(pending.retract("AB", ts(2)));
        assert!(!pending.retract("AB", ts(2)));
        assert_eq!(pending.assign_sequence("AB", 9), Some(ts(1)));
        assert_eq!(pending.assign_sequence("AB", 10), None);
        assert_eq!(pending.outstanding("AB"), 1);
    }

    #[test]
    fn sequence_goes_to_oldest_unsequenced_and_ignores_repeats() {
        let mut pending = PendingSends::new();
        pending.push("AB", ts(1));
        pending.push("AB", ts(2));
        assert_eq!(pending.assign_sequence("AB", 4), Some(ts(1)));
        assert_eq!(pending.assign_sequence("AB", 4), None);
        assert_eq!(pending.assign_sequence("AB", 5), Some(ts(2)));
        assert_eq!(pending.assign_sequence("AB", 6), None);
        // sequencing does not consume the ack queue
        assert_eq!(pending.outstanding("AB"), 2);
    }

    #[test]
    fn acked_send_is_no_longer_sequenced() {
        let mut pending = PendingSends::new();
        pending.push("AB", ts(1));
        pending.push("AB", ts(2));
        assert_eq!(pending.pop_ack("AB"), Some(ts(1)));
        assert_eq!(pending.assign_sequence("AB", 1), Some(ts(2)));
    }

    #[test]
    fn settled_destinations_leave_no_state() {
        let mut pending = PendingSends::new();
        pending.push("AB", ts(1));
        assert_eq!(pending.assign_sequence("AB", 4), Some(ts(1)));
        // still waiting for the ack, so a retransmission of 4 is recognised
        pending.push("AB", ts(2));
        assert_eq!(pending.assign_sequence("AB", 4), None);
        assert_eq!(pending.assign_sequence("AB", 5), Some(ts(2)));

        assert_eq!(pending.pop_ack("AB"), Some(ts(1)));
        assert_eq!(pending.pop_ack("AB"), Some(ts(2)));
        pending.push("CD", ts(3));
        assert_eq!(pending.assign_sequence("CD", 1), Some(ts(3)));
        assert!(pending.retract("CD", ts(3)));
        assert_eq!(pending.tracked_destinations(), 0);

        // the device counter may legitimately repeat a value for a new send
        pending.push("AB", ts(4));
        assert_eq!(pending.assign_sequence("AB", 5), Some(ts(4)));
    }

    #[test]
    fn receives_expire_after_grace() {
        let start = Instant::now();
        let mut receives = PendingReceives::default();
        receives.push("AB".into(), "one".into(), start);
        receives.push("CD".into(), "two".into(), start + Duration::from_millis(500));
        let expired = receives.take_expired(start + Duration::from_millis(1000), Duration::from_millis(800));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].payload, "one");
        assert_eq!(receives.len(), 1);
        assert_eq!(receives.pop_oldest().map(|r| r.source), Some("CD".to_string()));
    }
}
