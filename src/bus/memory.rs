/***************************************/
/*        3rd party libraries          */
/***************************************/
use crossbeam_channel as cbc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/***************************************/
/*           Local modules             */
/***************************************/
use crate::bus::{Delivery, MessageBus, StateStore, Subscription};
use crate::shared::{BusError, ElevatorId, ElevatorState};

/**
 * In-process bus and state store.
 *
 * Mirrors the broker semantics the components rely on: append-only streams with
 * consumer groups, a pending list per group that is reclaimed after the redelivery
 * window, and lossy fan-out channels. Clones share the same underlying data so each
 * component can own its own handle, like it would own its own connection.
 *
 * Faults can be injected to make the next N state reads/writes or publishes fail
 * with a transient error.
 */
#[derive(Clone)]
pub struct InMemoryBus {
    shared: Arc<Shared>,
    redelivery_idle: Duration,
}

struct Shared {
    inner: Mutex<Inner>,
    appended: Condvar,
}

#[derive(Default)]
struct Inner {
    streams: HashMap<String, Stream>,
    channels: HashMap<String, Vec<Subscriber>>,
    states: HashMap<ElevatorId, ElevatorState>,
    faults: Faults,
}

#[derive(Default)]
struct Stream {
    next_seq: u64,
    entries: Vec<(u64, String)>,
    groups: HashMap<String, Group>,
}

#[derive(Default)]
struct Group {
    cursor: usize,
    pending: BTreeMap<u64, Pending>,
}

struct Pending {
    payload: String,
    delivered_at: Instant,
    deliveries: u32,
}

struct Subscriber {
    tx: cbc::Sender<String>,
    closed: Arc<AtomicBool>,
}

#[derive(Default)]
struct Faults {
    state_reads: u32,
    state_writes: u32,
    publishes: u32,
}

fn message_id(seq: u64) -> String {
    format!("{}-0", seq)
}

fn parse_message_id(token: &str) -> Result<u64, BusError> {
    token
        .split('-')
        .next()
        .and_then(|seq| seq.parse().ok())
        .ok_or_else(|| BusError::Protocol(format!("invalid ack token {:?}", token)))
}

fn take_fault(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

impl InMemoryBus {
    pub fn new(redelivery_idle: Duration) -> InMemoryBus {
        InMemoryBus {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                appended: Condvar::new(),
            }),
            redelivery_idle,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, BusError> {
        self.shared
            .inner
            .lock()
            .map_err(|_| BusError::Transient("in-memory bus lock poisoned".to_string()))
    }

    pub fn fail_next_state_reads(&self, n: u32) {
        if let Ok(mut inner) = self.lock() {
            inner.faults.state_reads = n;
        }
    }

    pub fn fail_next_state_writes(&self, n: u32) {
        if let Ok(mut inner) = self.lock() {
            inner.faults.state_writes = n;
        }
    }

    pub fn fail_next_publishes(&self, n: u32) {
        if let Ok(mut inner) = self.lock() {
            inner.faults.publishes = n;
        }
    }

    /// Number of delivered but unacknowledged entries of `group`.
    pub fn pending_count(&self, queue: &str, group: &str) -> usize {
        self.lock()
            .ok()
            .and_then(|inner| {
                inner
                    .streams
                    .get(queue)
                    .and_then(|stream| stream.groups.get(group))
                    .map(|group| group.pending.len())
            })
            .unwrap_or(0)
    }

    /// How often the entry behind `ack_token` has been handed out.
    pub fn delivery_count(&self, queue: &str, group: &str, ack_token: &str) -> u32 {
        let seq = match parse_message_id(ack_token) {
            Ok(seq) => seq,
            Err(_) => return 0,
        };
        self.lock()
            .ok()
            .and_then(|inner| {
                inner
                    .streams
                    .get(queue)
                    .and_then(|stream| stream.groups.get(group))
                    .and_then(|group| group.pending.get(&seq))
                    .map(|pending| pending.deliveries)
            })
            .unwrap_or(0)
    }
}

impl MessageBus for InMemoryBus {
    fn ensure_group(&mut self, queue: &str, group: &str) -> Result<(), BusError> {
        let mut inner = self.lock()?;
        let stream = inner.streams.entry(queue.to_string()).or_default();
        stream.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    fn enqueue(&mut self, queue: &str, message: &str) -> Result<String, BusError> {
        let mut inner = self.lock()?;
        let stream = inner.streams.entry(queue.to_string()).or_default();
        stream.next_seq += 1;
        let seq = stream.next_seq;
        stream.entries.push((seq, message.to_string()));
        drop(inner);

        self.shared.appended.notify_all();
        Ok(message_id(seq))
    }

    fn consume(
        &mut self,
        queue: &str,
        group: &str,
        _consumer: &str,
        block_timeout: Duration,
    ) -> Result<Option<Delivery>, BusError> {
        let deadline = Instant::now() + block_timeout;
        let mut inner = self.lock()?;

        loop {
            let now = Instant::now();
            let Stream { entries, groups, .. } = inner
                .streams
                .get_mut(queue)
                .ok_or_else(|| BusError::Protocol(format!("no such queue {:?}", queue)))?;
            let state = groups
                .get_mut(group)
                .ok_or_else(|| BusError::Protocol(format!("no such consumer group {:?}", group)))?;

            // Reclaim stale pending entries before handing out new ones
            let idle = self.redelivery_idle;
            if let Some((seq, pending)) = state
                .pending
                .iter_mut()
                .find(|(_, pending)| now.duration_since(pending.delivered_at) >= idle)
            {
                pending.delivered_at = now;
                pending.deliveries += 1;
                return Ok(Some(Delivery {
                    message_id: message_id(*seq),
                    payload: pending.payload.clone(),
                }));
            }

            if let Some((seq, payload)) = entries.get(state.cursor).cloned() {
                state.cursor += 1;
                state.pending.insert(
                    seq,
                    Pending {
                        payload: payload.clone(),
                        delivered_at: now,
                        deliveries: 1,
                    },
                );
                return Ok(Some(Delivery {
                    message_id: message_id(seq),
                    payload,
                }));
            }

            if now >= deadline {
                return Ok(None);
            }

            inner = self
                .shared
                .appended
                .wait_timeout(inner, deadline - now)
                .map_err(|_| BusError::Transient("in-memory bus lock poisoned".to_string()))?
                .0;
        }
    }

    fn ack(&mut self, queue: &str, group: &str, ack_token: &str) -> Result<(), BusError> {
        let seq = parse_message_id(ack_token)?;
        let mut inner = self.lock()?;
        if let Some(state) = inner
            .streams
            .get_mut(queue)
            .and_then(|stream| stream.groups.get_mut(group))
        {
            state.pending.remove(&seq);
        }
        Ok(())
    }

    fn publish(&mut self, channel: &str, message: &str) -> Result<(), BusError> {
        let mut inner = self.lock()?;
        if take_fault(&mut inner.faults.publishes) {
            return Err(BusError::Transient(format!("injected publish failure on {}", channel)));
        }

        if let Some(subscribers) = inner.channels.get_mut(channel) {
            subscribers.retain(|s| {
                !s.closed.load(Ordering::SeqCst) && s.tx.send(message.to_string()).is_ok()
            });
        }
        Ok(())
    }

    fn subscribe(&mut self, channel: &str) -> Result<Subscription, BusError> {
        let (tx, rx) = cbc::unbounded::<String>();
        let closed = Arc::new(AtomicBool::new(false));

        let mut inner = self.lock()?;
        inner
            .channels
            .entry(channel.to_string())
            .or_default()
            .push(Subscriber {
                tx,
                closed: closed.clone(),
            });

        Ok(Subscription::new(rx, closed))
    }
}

impl StateStore for InMemoryBus {
    fn get_state(&mut self, id: ElevatorId) -> Result<Option<ElevatorState>, BusError> {
        let mut inner = self.lock()?;
        if take_fault(&mut inner.faults.state_reads) {
            return Err(BusError::StateStoreUnavailable(format!(
                "injected read failure for elevator {}",
                id
            )));
        }
        Ok(inner.states.get(&id).cloned())
    }

    fn put_state(&mut self, id: ElevatorId, state: &ElevatorState) -> Result<(), BusError> {
        let mut inner = self.lock()?;
        if take_fault(&mut inner.faults.state_writes) {
            return Err(BusError::StateStoreUnavailable(format!(
                "injected write failure for elevator {}",
                id
            )));
        }
        inner.states.insert(id, state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::InMemoryBus;
    use crate::bus::{MessageBus, StateStore};
    use crate::shared::{BusError, ElevatorState};
    use std::thread::sleep;
    use std::time::Duration;

    const QUEUE: &str = "elevator:requests:stream";
    const GROUP: &str = "scheduler-group";

    #[test]
    fn test_consume_acks_and_drains() {
        // Arrange
        let mut bus = InMemoryBus::new(Duration::from_secs(60));
        bus.ensure_group(QUEUE, GROUP).unwrap();
        bus.enqueue(QUEUE, "a").unwrap();
        bus.enqueue(QUEUE, "b").unwrap();

        // Act
        let first = bus.consume(QUEUE, GROUP, "c1", Duration::ZERO).unwrap().unwrap();
        bus.ack(QUEUE, GROUP, &first.message_id).unwrap();
        let second = bus.consume(QUEUE, GROUP, "c1", Duration::ZERO).unwrap().unwrap();
        let third = bus.consume(QUEUE, GROUP, "c1", Duration::from_millis(10)).unwrap();

        // Assert
        assert_eq!(first.payload, "a");
        assert_eq!(second.payload, "b");
        assert_eq!(third, None);
        assert_eq!(bus.pending_count(QUEUE, GROUP), 1);
    }

    #[test]
    fn test_unacked_entry_is_redelivered_after_idle() {
        // Arrange
        let mut bus = InMemoryBus::new(Duration::from_millis(20));
        bus.ensure_group(QUEUE, GROUP).unwrap();
        bus.enqueue(QUEUE, "request").unwrap();

        // Act
        let first = bus.consume(QUEUE, GROUP, "c1", Duration::ZERO).unwrap().unwrap();
        let early = bus.consume(QUEUE, GROUP, "c2", Duration::ZERO).unwrap();
        sleep(Duration::from_millis(30));
        let again = bus.consume(QUEUE, GROUP, "c2", Duration::ZERO).unwrap().unwrap();

        // Assert
        assert_eq!(early, None);
        assert_eq!(again, first);
        assert_eq!(bus.delivery_count(QUEUE, GROUP, &again.message_id), 2);
    }

    #[test]
    fn test_consume_wakes_on_enqueue() {
        // Arrange
        let mut consumer = InMemoryBus::new(Duration::from_secs(60));
        let mut producer = consumer.clone();
        consumer.ensure_group(QUEUE, GROUP).unwrap();

        // Act
        let handle = std::thread::spawn(move || {
            sleep(Duration::from_millis(20));
            producer.enqueue(QUEUE, "late").unwrap();
        });
        let delivery = consumer.consume(QUEUE, GROUP, "c1", Duration::from_secs(3)).unwrap();
        handle.join().unwrap();

        // Assert
        assert_eq!(delivery.map(|d| d.payload), Some("late".to_string()));
    }

    #[test]
    fn test_consume_without_group_is_protocol_error() {
        let mut bus = InMemoryBus::new(Duration::from_secs(60));
        bus.enqueue(QUEUE, "x").unwrap();

        let result = bus.consume(QUEUE, "missing", "c1", Duration::ZERO);

        assert!(matches!(result, Err(BusError::Protocol(_))));
    }

    #[test]
    fn test_publish_is_lossy_for_late_subscribers() {
        // Arrange
        let mut bus = InMemoryBus::new(Duration::from_secs(60));

        // Act
        bus.publish("elevator:status:1", "before").unwrap();
        let subscription = bus.subscribe("elevator:status:1").unwrap();
        bus.publish("elevator:status:1", "after").unwrap();

        // Assert
        assert_eq!(subscription.receiver().try_recv(), Ok("after".to_string()));
        assert!(subscription.receiver().try_recv().is_err());
    }

    #[test]
    fn test_dropped_subscription_is_pruned() {
        let mut bus = InMemoryBus::new(Duration::from_secs(60));
        let subscription = bus.subscribe("elevator:commands:1").unwrap();
        drop(subscription);

        assert!(bus.publish("elevator:commands:1", "cmd").is_ok());
    }

    #[test]
    fn test_state_faults_are_consumed() {
        // Arrange
        let mut bus = InMemoryBus::new(Duration::from_secs(60));
        bus.put_state(1, &ElevatorState::new(1, 4)).unwrap();
        bus.fail_next_state_reads(1);
        bus.fail_next_state_writes(1);

        // Act
        let failed_read = bus.get_state(1);
        let read = bus.get_state(1).unwrap();
        let failed_write = bus.put_state(1, &ElevatorState::new(1, 5));

        // Assert
        assert!(matches!(failed_read, Err(BusError::StateStoreUnavailable(_))));
        assert_eq!(read.map(|s| s.current_floor), Some(4));
        assert!(matches!(failed_write, Err(BusError::StateStoreUnavailable(_))));
        assert_eq!(bus.get_state(1).unwrap().map(|s| s.current_floor), Some(4));
    }
}
