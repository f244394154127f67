//! Kafka ingestor and ClickHouse sink: the only two operators in the
//! pipeline that talk to the outside world. Everything between them is
//! bus traffic (`etl-bus`) shaped by `etl-schema`.

mod ingestor;
mod sink;

pub use ingestor::{InitialOffset, KafkaIngestor};
pub use sink::ClickHouseSink;
