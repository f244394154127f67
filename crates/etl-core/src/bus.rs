use std::time::Duration;

use async_trait::async_trait;

use crate::error::EtlResult;
use crate::message::Event;

/// A single delivered message plus the handle used to acknowledge it.
///
/// An unacknowledged delivery is eligible for redelivery after its
/// consumer's redelivery timeout elapses — the at-least-once guarantee the
/// whole pipeline is built on. An operator must never forward an event's
/// downstream effects before it has durably recorded whatever state makes
/// those effects idempotent on redelivery (dedup's KV put, the join
/// window's KV put, the sink's committed batch).
pub struct Delivery {
    pub event: Event,
    pub ack: Box<dyn AckHandle>,
}

/// Acknowledges or abandons a single delivery. Implementations must be
/// `Send` so a delivery can be acked from a different task than the one
/// that received it (the sink's flush task acks after a batch commits).
#[async_trait]
pub trait AckHandle: Send + Sync {
    async fn ack(self: Box<Self>) -> EtlResult<()>;

    /// Signals that this delivery could not be processed and should be
    /// redelivered. Used for `Transient` failures; an `EventLevel` failure
    /// is instead acked after logging the drop, since redelivery would
    /// never change a deterministic decode failure's outcome.
    async fn nak(self: Box<Self>) -> EtlResult<()>;
}

/// The durable, subject-addressed bus every operator communicates through.
///
/// No operator ever holds a direct channel or reference to another
/// operator; all coordination is publish/subscribe against named subjects,
/// each with a durable consumer so a crashed operator resumes exactly
/// where it left off rather than dropping in-flight work.
#[async_trait]
pub trait StreamBus: Send + Sync {
    async fn publish(&self, subject: &str, event: Event) -> EtlResult<()>;

    /// Subscribes as the named durable consumer on `subject`. Re-calling
    /// this with the same `durable_name` after a crash resumes delivery
    /// from the last unacknowledged message rather than the subject head.
    async fn subscribe(&self, subject: &str, durable_name: &str) -> EtlResult<Box<dyn Subscription>>;

    fn kv(&self) -> &dyn KvBucket;
}

/// A handle to an open durable subscription.
#[async_trait]
pub trait Subscription: Send + Sync {
    async fn next(&mut self) -> EtlResult<Option<Delivery>>;
}

/// The bus's key-value store, used by dedup and join for windowed state.
///
/// Every write is namespaced by the caller into keys like
/// `"<topic>:<key_bytes>"` or `"<side>:<key>:<sequence_id>"`; the bucket
/// itself is a flat, TTL-bearing map.
#[async_trait]
pub trait KvBucket: Send + Sync {
    /// Writes `value` under `key` only if absent, returning `true` if the
    /// write happened. This is the primitive dedup's suppression check and
    /// the join's probe-then-store algorithm are both built on.
    async fn put_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> EtlResult<bool>;

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> EtlResult<()>;

    async fn get(&self, key: &str) -> EtlResult<Option<Vec<u8>>>;

    async fn delete(&self, key: &str) -> EtlResult<()>;

    /// Returns every live (non-expired) key carrying `prefix`, for the
    /// join operator's per-key window scan.
    async fn keys_with_prefix(&self, prefix: &str) -> EtlResult<Vec<String>>;
}
