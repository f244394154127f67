//! Core traits, message/bus interfaces and the pipeline-definition model
//! shared by every other ETL crate. Defines the *shape* of the bus
//! protocol (`StreamBus`/`KvBucket`) without depending on a concrete
//! transport — `etl-bus` provides the implementations.

mod bus;
mod error;
mod message;
pub mod naming;
mod operator;
mod pipeline_def;
mod state;

pub use bus::{AckHandle, Delivery, KvBucket, StreamBus, Subscription};
pub use error::{EtlError, EtlResult};
pub use message::Event;
pub use naming::{dedup_subject, durable_consumer_name, ingestor_subject, join_subject, operator_subject};
pub use operator::{Operator, Sink, Source, Transform};
pub use pipeline_def::{
    DedupDef, FieldDefDef, InitialOffsetDef, JoinDef, JoinSourceDef, MappingEntryDef, PipelineDefinition, SchemaDef,
    SinkDef, TopicDef,
};
pub use state::{IngestorState, OperatorMetrics, OperatorMetricsSnapshot, SinkState};
