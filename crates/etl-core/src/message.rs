use chrono::{DateTime, Utc};

/// A single event as it travels across the bus.
///
/// `topic` is the originating Kafka topic (kept on the envelope even after
/// the event is re-published to a downstream subject, since the schema
/// mapper needs it to look up the right field/type declarations), `key` is
/// the raw join/dedup key bytes if the source record carried one, and
/// `payload` is the JSON event body as received.
#[derive(Debug, Clone)]
pub struct Event {
    pub topic: String,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub published_at: DateTime<Utc>,
}

impl Event {
    pub fn new(topic: impl Into<String>, key: Option<Vec<u8>>, payload: Vec<u8>) -> Self {
        Self { topic: topic.into(), key, payload, published_at: Utc::now() }
    }
}
