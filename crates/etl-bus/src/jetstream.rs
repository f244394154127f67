use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_nats::jetstream::consumer::{pull::Config as PullConfig, AckPolicy, DeliverPolicy};
use async_nats::jetstream::kv::Store as KvStore;
use async_nats::jetstream::stream::Config as StreamConfig;
use async_nats::jetstream::Context as JetStreamContext;
use async_trait::async_trait;
use etl_core::{AckHandle, Delivery, Event, EtlError, EtlResult, KvBucket, StreamBus, Subscription};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Real multi-process backend: every subject is a NATS JetStream stream
/// and every durable consumer a JetStream pull consumer, so two instances
/// of this bus pointed at the same NATS deployment share state exactly
/// the way `MemoryBus` shares it within one process.
pub struct JetStreamBus {
    jetstream: JetStreamContext,
    kv: JetStreamKvBucket,
}

impl JetStreamBus {
    pub async fn connect(url: &str, kv_bucket: &str) -> EtlResult<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| EtlError::Transient(anyhow::anyhow!("nats connect failed: {e}")))?;
        let jetstream = async_nats::jetstream::new(client);

        let kv = jetstream
            .create_key_value(async_nats::jetstream::kv::Config {
                bucket: kv_bucket.to_string(),
                ..Default::default()
            })
            .await
            .map_err(|e| EtlError::Configuration(format!("failed to create/bind kv bucket '{kv_bucket}': {e}")))?;

        Ok(Self { jetstream, kv: JetStreamKvBucket { store: kv } })
    }

    async fn ensure_stream(&self, subject: &str) -> EtlResult<()> {
        let stream_name = subject.replace('.', "_");
        let config =
            StreamConfig { name: stream_name, subjects: vec![subject.to_string()], ..Default::default() };
        match self.jetstream.get_stream(&config.name).await {
            Ok(_) => Ok(()),
            Err(_) => self
                .jetstream
                .create_stream(config)
                .await
                .map(|_| ())
                .map_err(|e| EtlError::Transient(anyhow::anyhow!("create stream failed: {e}"))),
        }
    }
}

#[async_trait]
impl StreamBus for JetStreamBus {
    async fn publish(&self, subject: &str, event: Event) -> EtlResult<()> {
        self.ensure_stream(subject).await?;
        let payload = serde_json::to_vec(&WireEvent::from(&event))
            .map_err(|e| EtlError::Fatal(format!("event envelope did not serialize: {e}")))?;
        let ack = self
            .jetstream
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| EtlError::Transient(anyhow::anyhow!("publish failed: {e}")))?;
        ack.await.map_err(|e| EtlError::Transient(anyhow::anyhow!("publish ack failed: {e}")))?;
        Ok(())
    }

    async fn subscribe(&self, subject: &str, durable_name: &str) -> EtlResult<Box<dyn Subscription>> {
        self.ensure_stream(subject).await?;
        let stream_name = subject.replace('.', "_");
        let stream = self
            .jetstream
            .get_stream(&stream_name)
            .await
            .map_err(|e| EtlError::Transient(anyhow::anyhow!("get stream failed: {e}")))?;

        let consumer = stream
            .get_or_create_consumer(
                durable_name,
                PullConfig {
                    durable_name: Some(durable_name.to_string()),
                    ack_policy: AckPolicy::Explicit,
                    deliver_policy: DeliverPolicy::All,
                    ack_wait: Duration::from_secs(30),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| EtlError::Transient(anyhow::anyhow!("create consumer failed: {e}")))?;

        Ok(Box::new(JetStreamSubscription { consumer }))
    }

    fn kv(&self) -> &dyn KvBucket {
        &self.kv
    }
}

struct JetStreamSubscription {
    consumer: async_nats::jetstream::consumer::Consumer<PullConfig>,
}

#[async_trait]
impl Subscription for JetStreamSubscription {
    async fn next(&mut self) -> EtlResult<Option<Delivery>> {
        let mut messages = self
            .consumer
            .fetch()
            .max_messages(1)
            .messages()
            .await
            .map_err(|e| EtlError::Transient(anyhow::anyhow!("fetch failed: {e}")))?;

        match messages.next().await {
            Some(Ok(msg)) => {
                let wire: WireEvent = match serde_json::from_slice(&msg.payload) {
                    Ok(w) => w,
                    Err(e) => {
                        warn!(error = %e, "dropping message with unparseable envelope");
                        let _ = msg.ack_with(async_nats::jetstream::AckKind::Term).await;
                        return Ok(None);
                    }
                };
                let event = wire.into();
                Ok(Some(Delivery { event, ack: Box::new(JetStreamAckHandle { msg }) }))
            }
            Some(Err(e)) => Err(EtlError::Transient(anyhow::anyhow!("message delivery error: {e}"))),
            None => Ok(None),
        }
    }
}

struct JetStreamAckHandle {
    msg: async_nats::jetstream::Message,
}

#[async_trait]
impl AckHandle for JetStreamAckHandle {
    async fn ack(self: Box<Self>) -> EtlResult<()> {
        self.msg.ack().await.map_err(|e| EtlError::Transient(anyhow::anyhow!("ack failed: {e}")))
    }

    async fn nak(self: Box<Self>) -> EtlResult<()> {
        self.msg
            .ack_with(async_nats::jetstream::AckKind::Nak(None))
            .await
            .map_err(|e| EtlError::Transient(anyhow::anyhow!("nak failed: {e}")))
    }
}

/// Wire envelope for an `Event` published to JetStream.
#[derive(Debug, Serialize, Deserialize)]
struct WireEvent {
    topic: String,
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
    published_at_millis: i64,
}

impl From<&Event> for WireEvent {
    fn from(e: &Event) -> Self {
        Self { topic: e.topic.clone(), key: e.key.clone(), payload: e.payload.clone(), published_at_millis: e.published_at.timestamp_millis() }
    }
}

impl From<WireEvent> for Event {
    fn from(w: WireEvent) -> Self {
        use chrono::TimeZone;
        Event {
            topic: w.topic,
            key: w.key,
            payload: w.payload,
            published_at: chrono::Utc.timestamp_millis_opt(w.published_at_millis).single().unwrap_or_else(chrono::Utc::now),
        }
    }
}

/// Approximates per-key TTL on top of a NATS KV bucket, whose `max_age` is
/// bucket-wide. Every value is wrapped with its own expiry timestamp; a
/// read past that timestamp treats the entry as absent even though NATS
/// has not yet physically removed it. Readers may briefly observe an
/// entry that outlived its logical TTL if this check races a concurrent
/// write — acceptable since dedup/join windows only need approximate,
/// not exact, expiry (spec.md §4.2).
struct JetStreamKvBucket {
    store: KvStore,
}

#[derive(Debug, Serialize, Deserialize)]
struct KvEnvelope {
    value: Vec<u8>,
    expires_at_millis: i64,
}

fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

#[async_trait]
impl KvBucket for JetStreamKvBucket {
    /// Atomic create-or-replace-if-expired, so two dedup/join workers racing
    /// on the same key can't both observe "absent" (spec.md §5's
    /// compare-and-swap requirement for the dedup put-if-absent primitive).
    /// `store.create` already fails if the key has never been written or was
    /// last purged; a logically-expired-but-not-yet-physically-purged entry
    /// still holds a live JetStream revision, so that case is instead
    /// replaced via `store.update` with the observed revision, which only
    /// succeeds if no other writer has touched the key since.
    async fn put_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> EtlResult<bool> {
        let envelope = KvEnvelope { value, expires_at_millis: now_millis() + ttl.as_millis() as i64 };
        let bytes = serde_json::to_vec(&envelope)
            .map_err(|e| EtlError::Fatal(format!("kv envelope did not serialize: {e}")))?;

        match self.store.entry(key).await.map_err(|e| EtlError::Transient(anyhow::anyhow!("kv entry failed: {e}")))? {
            None => match self.store.create(key, bytes.into()).await {
                Ok(_) => Ok(true),
                Err(_) => Ok(false), // another writer created it between entry() and create()
            },
            Some(entry) => {
                let existing: KvEnvelope = match serde_json::from_slice(&entry.value) {
                    Ok(e) => e,
                    Err(_) => return Ok(false), // unrecognized payload, treat as occupied
                };
                if existing.expires_at_millis > now_millis() {
                    return Ok(false); // still live
                }
                match self.store.update(key, bytes.into(), entry.revision).await {
                    Ok(_) => Ok(true),
                    Err(_) => Ok(false), // lost the CAS race on the expired entry
                }
            }
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> EtlResult<()> {
        let envelope =
            KvEnvelope { value, expires_at_millis: now_millis() + ttl.as_millis() as i64 };
        let bytes = serde_json::to_vec(&envelope)
            .map_err(|e| EtlError::Fatal(format!("kv envelope did not serialize: {e}")))?;
        self.store
            .put(key, bytes.into())
            .await
            .map_err(|e| EtlError::Transient(anyhow::anyhow!("kv put failed: {e}")))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> EtlResult<Option<Vec<u8>>> {
        let entry = self.store.get(key).await.map_err(|e| EtlError::Transient(anyhow::anyhow!("kv get failed: {e}")))?;
        let Some(bytes) = entry else { return Ok(None) };
        let envelope: KvEnvelope =
            serde_json::from_slice(&bytes).map_err(|e| EtlError::Fatal(format!("kv envelope corrupt: {e}")))?;
        if envelope.expires_at_millis <= now_millis() {
            return Ok(None);
        }
        Ok(Some(envelope.value))
    }

    async fn delete(&self, key: &str) -> EtlResult<()> {
        self.store.delete(key).await.map_err(|e| EtlError::Transient(anyhow::anyhow!("kv delete failed: {e}")))?;
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> EtlResult<Vec<String>> {
        let mut keys = self
            .store
            .keys()
            .await
            .map_err(|e| EtlError::Transient(anyhow::anyhow!("kv keys failed: {e}")))?;
        let mut out = Vec::new();
        while let Some(key) = keys.next().await {
            let key = key.map_err(|e| EtlError::Transient(anyhow::anyhow!("kv key iteration failed: {e}")))?;
            if key.starts_with(prefix) && self.get(&key).await?.is_some() {
                out.push(key);
            }
        }
        Ok(out)
    }
}
