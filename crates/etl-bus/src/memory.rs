use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use etl_core::{AckHandle, Delivery, Event, EtlResult, KvBucket, StreamBus, Subscription};
use tokio::sync::{Mutex, Notify};

const DEFAULT_REDELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

struct StoredEvent {
    seq: u64,
    event: Event,
}

/// An append-only per-subject log. Every durable consumer of the subject
/// keeps its own cursor into this log rather than the log itself being
/// drained on read, so two consumers of the same subject never starve
/// each other.
struct SubjectLog {
    entries: Mutex<VecDeque<Arc<StoredEvent>>>,
    next_seq: Mutex<u64>,
    notify: Notify,
}

impl SubjectLog {
    fn new() -> Self {
        Self { entries: Mutex::new(VecDeque::new()), next_seq: Mutex::new(0), notify: Notify::new() }
    }

    async fn append(&self, event: Event) {
        let mut next_seq = self.next_seq.lock().await;
        let seq = *next_seq;
        *next_seq += 1;
        drop(next_seq);
        self.entries.lock().await.push_back(Arc::new(StoredEvent { seq, event }));
        self.notify.notify_waiters();
    }

    async fn get(&self, seq: u64) -> Option<Arc<StoredEvent>> {
        self.entries.lock().await.iter().find(|e| e.seq == seq).cloned()
    }
}

struct InFlight {
    stored: Arc<StoredEvent>,
    deadline: Instant,
}

/// One durable consumer's cursor and in-flight (unacknowledged) deliveries.
struct ConsumerState {
    next_seq: u64,
    in_flight: BTreeMap<u64, InFlight>,
}

/// An in-process, single-binary bus backed by `DashMap`s. This is the
/// default backend for tests and single-node deployments; `JetStreamBus`
/// is the real multi-process backend.
///
/// Redelivery works by deadline: a delivery not acked within
/// `redelivery_timeout` is handed out again the next time the consumer
/// polls, exactly like a NATS JetStream pull consumer's ack wait.
pub struct MemoryBus {
    subjects: DashMap<String, Arc<SubjectLog>>,
    consumers: DashMap<(String, String), Arc<Mutex<ConsumerState>>>,
    kv: Arc<MemoryKvBucket>,
    redelivery_timeout: Duration,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        Self::with_redelivery_timeout(DEFAULT_REDELIVERY_TIMEOUT)
    }

    pub fn with_redelivery_timeout(redelivery_timeout: Duration) -> Arc<Self> {
        let bus = Arc::new(Self {
            subjects: DashMap::new(),
            consumers: DashMap::new(),
            kv: MemoryKvBucket::new(),
            redelivery_timeout,
        });
        bus.kv.clone().spawn_reaper();
        bus
    }

    fn subject_log(&self, subject: &str) -> Arc<SubjectLog> {
        self.subjects.entry(subject.to_string()).or_insert_with(|| Arc::new(SubjectLog::new())).clone()
    }
}

#[async_trait]
impl StreamBus for MemoryBus {
    async fn publish(&self, subject: &str, event: Event) -> EtlResult<()> {
        self.subject_log(subject).append(event).await;
        Ok(())
    }

    async fn subscribe(&self, subject: &str, durable_name: &str) -> EtlResult<Box<dyn Subscription>> {
        let log = self.subject_log(subject);
        let key = (subject.to_string(), durable_name.to_string());
        let consumer = self
            .consumers
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(ConsumerState { next_seq: 0, in_flight: BTreeMap::new() })))
            .clone();
        Ok(Box::new(MemorySubscription { log, consumer, redelivery_timeout: self.redelivery_timeout }))
    }

    fn kv(&self) -> &dyn KvBucket {
        self.kv.as_ref()
    }
}

struct MemorySubscription {
    log: Arc<SubjectLog>,
    consumer: Arc<Mutex<ConsumerState>>,
    redelivery_timeout: Duration,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> EtlResult<Option<Delivery>> {
        loop {
            {
                let mut state = self.consumer.lock().await;

                // Redeliver the earliest timed-out in-flight entry first,
                // so a stuck consumer doesn't starve the rest of the log.
                if let Some((&seq, in_flight)) = state.in_flight.iter().find(|(_, f)| f.deadline <= Instant::now())
                {
                    let stored = in_flight.stored.clone();
                    state.in_flight.get_mut(&seq).unwrap().deadline = Instant::now() + self.redelivery_timeout;
                    let event = stored.event.clone();
                    drop(state);
                    return Ok(Some(self.make_delivery(seq, event)));
                }

                let seq = state.next_seq;
                if let Some(stored) = self.log.get(seq).await {
                    state.next_seq += 1;
                    state.in_flight.insert(
                        seq,
                        InFlight { stored: stored.clone(), deadline: Instant::now() + self.redelivery_timeout },
                    );
                    let event = stored.event.clone();
                    drop(state);
                    return Ok(Some(self.make_delivery(seq, event)));
                }
            }
            self.log.notify.notified().await;
        }
    }
}

impl MemorySubscription {
    fn make_delivery(&self, seq: u64, event: Event) -> Delivery {
        Delivery {
            event,
            ack: Box::new(MemoryAckHandle { consumer: self.consumer.clone(), seq }),
        }
    }
}

struct MemoryAckHandle {
    consumer: Arc<Mutex<ConsumerState>>,
    seq: u64,
}

#[async_trait]
impl AckHandle for MemoryAckHandle {
    async fn ack(self: Box<Self>) -> EtlResult<()> {
        self.consumer.lock().await.in_flight.remove(&self.seq);
        Ok(())
    }

    async fn nak(self: Box<Self>) -> EtlResult<()> {
        let mut state = self.consumer.lock().await;
        if let Some(in_flight) = state.in_flight.get_mut(&self.seq) {
            in_flight.deadline = Instant::now();
        }
        Ok(())
    }
}

struct KvEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// A flat, TTL-bearing key-value store. Expired entries are both filtered
/// out on read and periodically swept by a background reaper task so the
/// map doesn't grow unbounded under a workload that never re-reads old
/// keys (spec.md §4.2's dedup/join windows are exactly that workload).
pub struct MemoryKvBucket {
    entries: DashMap<String, KvEntry>,
}

impl MemoryKvBucket {
    fn new() -> Arc<Self> {
        Arc::new(Self { entries: DashMap::new() })
    }

    fn spawn_reaper(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                let now = Instant::now();
                self.entries.retain(|_, entry| entry.expires_at > now);
            }
        });
    }

    fn is_live(entry: &KvEntry) -> bool {
        entry.expires_at > Instant::now()
    }
}

#[async_trait]
impl KvBucket for MemoryKvBucket {
    async fn put_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> EtlResult<bool> {
        let expires_at = Instant::now() + ttl;
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if Self::is_live(occupied.get()) {
                    Ok(false)
                } else {
                    occupied.insert(KvEntry { value, expires_at });
                    Ok(true)
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(KvEntry { value, expires_at });
                Ok(true)
            }
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> EtlResult<()> {
        self.entries.insert(key.to_string(), KvEntry { value, expires_at: Instant::now() + ttl });
        Ok(())
    }

    async fn get(&self, key: &str) -> EtlResult<Option<Vec<u8>>> {
        Ok(self.entries.get(key).filter(|e| Self::is_live(e)).map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str) -> EtlResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> EtlResult<Vec<String>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && Self::is_live(e.value()))
            .map(|e| e.key().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_subscribe_delivers_in_order() {
        let bus = MemoryBus::new();
        bus.publish("t", Event::new("orders", None, b"1".to_vec())).await.unwrap();
        bus.publish("t", Event::new("orders", None, b"2".to_vec())).await.unwrap();

        let mut sub = bus.subscribe("t", "consumer-a").await.unwrap();
        let first = sub.next().await.unwrap().unwrap();
        assert_eq!(first.event.payload, b"1");
        first.ack.ack().await.unwrap();

        let second = sub.next().await.unwrap().unwrap();
        assert_eq!(second.event.payload, b"2");
    }

    #[tokio::test]
    async fn unacked_delivery_is_redelivered_after_timeout() {
        let bus = MemoryBus::with_redelivery_timeout(Duration::from_millis(20));
        bus.publish("t", Event::new("orders", None, b"1".to_vec())).await.unwrap();

        let mut sub = bus.subscribe("t", "consumer-a").await.unwrap();
        let first = sub.next().await.unwrap().unwrap();
        drop(first.ack); // never acked

        tokio::time::sleep(Duration::from_millis(30)).await;
        let redelivered = sub.next().await.unwrap().unwrap();
        assert_eq!(redelivered.event.payload, b"1");
    }

    #[tokio::test]
    async fn kv_put_if_absent_respects_ttl() {
        let kv = MemoryKvBucket::new();
        assert!(kv.put_if_absent("k", b"a".to_vec(), Duration::from_millis(20)).await.unwrap());
        assert!(!kv.put_if_absent("k", b"b".to_vec(), Duration::from_secs(5)).await.unwrap());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(kv.put_if_absent("k", b"c".to_vec(), Duration::from_secs(5)).await.unwrap());
    }
}
