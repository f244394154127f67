//! Durable, subject-addressed message bus implementations.
//!
//! [`MemoryBus`] is an in-process backend (the default for tests and
//! single-node runs); [`JetStreamBus`] is backed by a real NATS JetStream
//! deployment for multi-process production use. Both implement
//! `etl_core::StreamBus`, so operators never know which one they're
//! talking to.

mod jetstream;
mod memory;

pub use jetstream::JetStreamBus;
pub use memory::{MemoryBus, MemoryKvBucket};
