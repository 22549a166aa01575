use std::collections::{HashMap, HashSet};
use std::time::Duration;

use keel_server::transport::Endpoint;
use log::{debug, warn};
use tokio::time::Instant;

use crate::codec::Message;
use crate::error::SchedulerResult;
use crate::id::{IdGenerator, MessageId};

#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Delay before the first retransmission.
    pub initial_delay: Duration,
    /// Ceiling for the delay between retransmissions.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each retransmission.
    /// A factor of 1 retransmits at a fixed interval.
    pub factor: u32,
    /// Total time before an unacknowledged send is given up on.
    pub deadline: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(16),
            factor: 2,
            deadline: Duration::from_secs(30),
        }
    }
}

impl RelayOptions {
    /// Delay between transmission number `attempts` and the next one.
    fn backoff(&self, attempts: u32) -> Duration {
        // The exponent is clamped; the cap below takes over long before it.
        let exponent = attempts.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(self.factor.saturating_pow(exponent))
            .min(self.max_delay)
    }
}

struct Outstanding<T> {
    message: Message,
    next_attempt_at: Instant,
    deadline_at: Instant,
    attempts: u32,
    on_timeout: T,
}

pub struct Expired<T> {
    pub message_id: MessageId,
    pub on_timeout: T,
}

pub struct RelayTick<T> {
    pub retransmits: Vec<(Endpoint, Message)>,
    pub expired: Vec<Expired<T>>,
}

/// Reliable delivery overlay: retries outstanding sends until they are
/// acknowledged or their deadline passes, and deduplicates inbound
/// messages by `(message id, origin)`.
///
/// This is pure state owned and stepped by the scheduler actor; it never
/// touches the transport itself, it only tells the caller what to send.
pub struct ReliableRelay<T> {
    options: RelayOptions,
    master: Option<Endpoint>,
    outstanding: HashMap<MessageId, Outstanding<T>>,
    seen: HashSet<(MessageId, Endpoint)>,
    ids: IdGenerator<MessageId>,
}

impl<T> ReliableRelay<T> {
    pub fn new(options: RelayOptions) -> Self {
        Self {
            options,
            master: None,
            outstanding: HashMap::new(),
            seen: HashSet::new(),
            ids: IdGenerator::new(),
        }
    }

    /// Point retransmissions at a new master.
    pub fn set_master(&mut self, master: Endpoint) {
        self.master = Some(master);
    }

    pub fn next_id(&mut self) -> SchedulerResult<MessageId> {
        self.ids.next()
    }

    /// Record an outstanding send and return its first transmission.
    /// When no master is known yet the entry is queued and the first
    /// transmission happens on a later tick.
    pub fn send(
        &mut self,
        message_id: MessageId,
        message: Message,
        on_timeout: T,
        now: Instant,
    ) -> Option<(Endpoint, Message)> {
        let (transmit, next_attempt_at, attempts) = match self.master.clone() {
            Some(master) => (
                Some((master, message.clone())),
                now + self.options.backoff(1),
                1,
            ),
            None => {
                warn!("no master known; reliable message {message_id} is queued");
                (None, now, 0)
            }
        };
        self.outstanding.insert(
            message_id,
            Outstanding {
                message,
                next_attempt_at,
                deadline_at: now + self.options.deadline,
                attempts,
                on_timeout,
            },
        );
        transmit
    }

    /// Record an inbound reliable message.
    /// Returns true the first time a given `(message id, origin)` pair is
    /// seen and false for every duplicate. The caller acknowledges the
    /// message in either case.
    pub fn accept(&mut self, message_id: MessageId, origin: &Endpoint) -> bool {
        self.seen.insert((message_id, origin.clone()))
    }

    pub fn ack(&mut self, message_id: MessageId) {
        if self.outstanding.remove(&message_id).is_some() {
            debug!("reliable message {message_id} acknowledged");
        } else {
            warn!("acknowledgment for unknown message {message_id}");
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Advance the overlay: retransmit everything due and expire everything
    /// past its deadline. Each expired entry is returned exactly once.
    pub fn tick(&mut self, now: Instant) -> RelayTick<T> {
        let mut retransmits = Vec::new();
        let mut dead = Vec::new();
        for (&message_id, entry) in self.outstanding.iter_mut() {
            if now >= entry.deadline_at {
                dead.push(message_id);
                continue;
            }
            if now >= entry.next_attempt_at {
                // With no master there is nowhere to transmit; the entry
                // stays due so it goes out as soon as a master appears.
                if let Some(master) = &self.master {
                    entry.attempts += 1;
                    debug!(
                        "retransmitting reliable message {message_id} (attempt {})",
                        entry.attempts
                    );
                    retransmits.push((master.clone(), entry.message.clone()));
                    entry.next_attempt_at = now + self.options.backoff(entry.attempts);
                }
            }
        }
        dead.sort();
        let expired = dead
            .into_iter()
            .filter_map(|message_id| {
                self.outstanding.remove(&message_id).map(|entry| Expired {
                    message_id,
                    on_timeout: entry.on_timeout,
                })
            })
            .collect();
        RelayTick {
            retransmits,
            expired,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::TaskId;

    fn options(delay_ms: u64, deadline_ms: u64) -> RelayOptions {
        RelayOptions {
            initial_delay: Duration::from_millis(delay_ms),
            max_delay: Duration::from_millis(delay_ms),
            factor: 1,
            deadline: Duration::from_millis(deadline_ms),
        }
    }

    fn probe(id: MessageId) -> Message {
        Message::ReviveOffers {
            framework_id: format!("fw-{id}").into(),
        }
    }

    #[test]
    fn test_backoff_schedule() {
        let options = RelayOptions {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            factor: 2,
            deadline: Duration::from_secs(30),
        };
        assert_eq!(options.backoff(1), Duration::from_secs(1));
        assert_eq!(options.backoff(2), Duration::from_secs(2));
        assert_eq!(options.backoff(3), Duration::from_secs(4));
        assert_eq!(options.backoff(4), Duration::from_secs(4));
        assert_eq!(options.backoff(100), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_send_transmits_immediately_when_master_known() {
        let mut relay = ReliableRelay::<Vec<TaskId>>::new(options(100, 1000));
        let master = Endpoint::anonymous("10.0.0.1", 5050);
        relay.set_master(master.clone());
        let id = relay.next_id().unwrap();
        let transmit = relay.send(id, probe(id), vec![], Instant::now());
        assert_eq!(transmit.map(|(peer, _)| peer), Some(master));
        assert_eq!(relay.outstanding(), 1);
    }

    #[tokio::test]
    async fn test_send_without_master_transmits_on_tick() {
        let mut relay = ReliableRelay::<Vec<TaskId>>::new(options(100, 1000));
        let id = relay.next_id().unwrap();
        let now = Instant::now();
        assert!(relay.send(id, probe(id), vec![], now).is_none());

        // Still no master: nothing to transmit, nothing expired.
        let tick = relay.tick(now + Duration::from_millis(10));
        assert!(tick.retransmits.is_empty());
        assert!(tick.expired.is_empty());

        let master = Endpoint::anonymous("10.0.0.2", 5050);
        relay.set_master(master.clone());
        let tick = relay.tick(now + Duration::from_millis(20));
        assert_eq!(tick.retransmits.len(), 1);
        assert_eq!(tick.retransmits[0].0, master);
    }

    #[tokio::test]
    async fn test_ack_cancels_expiry() {
        let mut relay = ReliableRelay::<Vec<TaskId>>::new(options(100, 500));
        relay.set_master(Endpoint::anonymous("10.0.0.1", 5050));
        let id = relay.next_id().unwrap();
        let now = Instant::now();
        relay.send(id, probe(id), vec![TaskId::from(1)], now);
        relay.ack(id);
        assert_eq!(relay.outstanding(), 0);
        let tick = relay.tick(now + Duration::from_secs(10));
        assert!(tick.expired.is_empty());
    }

    #[tokio::test]
    async fn test_expiry_fires_exactly_once_with_payload() {
        let mut relay = ReliableRelay::<Vec<TaskId>>::new(options(100, 500));
        relay.set_master(Endpoint::anonymous("10.0.0.1", 5050));
        let id = relay.next_id().unwrap();
        let now = Instant::now();
        relay.send(id, probe(id), vec![TaskId::from(7), TaskId::from(8)], now);

        let tick = relay.tick(now + Duration::from_secs(1));
        assert_eq!(tick.expired.len(), 1);
        assert_eq!(tick.expired[0].message_id, id);
        assert_eq!(
            tick.expired[0].on_timeout,
            vec![TaskId::from(7), TaskId::from(8)]
        );

        let tick = relay.tick(now + Duration::from_secs(2));
        assert!(tick.expired.is_empty());
    }

    #[tokio::test]
    async fn test_retransmits_follow_cadence_and_new_master() {
        let mut relay = ReliableRelay::<Vec<TaskId>>::new(RelayOptions {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            factor: 2,
            deadline: Duration::from_secs(10),
        });
        let first = Endpoint::anonymous("10.0.0.1", 5050);
        let second = Endpoint::anonymous("10.0.0.2", 5050);
        relay.set_master(first.clone());
        let id = relay.next_id().unwrap();
        let now = Instant::now();
        relay.send(id, probe(id), vec![], now);

        // Not yet due.
        let tick = relay.tick(now + Duration::from_millis(50));
        assert!(tick.retransmits.is_empty());

        let tick = relay.tick(now + Duration::from_millis(150));
        assert_eq!(tick.retransmits.len(), 1);
        assert_eq!(tick.retransmits[0].0, first);

        // The delay has doubled, so nothing is due yet.
        let tick = relay.tick(now + Duration::from_millis(250));
        assert!(tick.retransmits.is_empty());

        relay.set_master(second.clone());
        let tick = relay.tick(now + Duration::from_millis(400));
        assert_eq!(tick.retransmits.len(), 1);
        assert_eq!(tick.retransmits[0].0, second);
    }

    #[tokio::test]
    async fn test_accept_deduplicates_by_id_and_origin() {
        let mut relay = ReliableRelay::<Vec<TaskId>>::new(RelayOptions::default());
        let origin = Endpoint::anonymous("10.0.0.1", 5050);
        let other = Endpoint::anonymous("10.0.0.2", 5050);
        let id = MessageId::from(42);

        assert!(relay.accept(id, &origin));
        assert!(!relay.accept(id, &origin));
        assert!(!relay.accept(id, &origin));
        // The same id from a different origin is a different message.
        assert!(relay.accept(id, &other));
    }
}
