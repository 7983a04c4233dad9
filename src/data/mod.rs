pub mod sink;

#[cfg(test)]
pub use sink::MemorySink;
pub use sink::{CsvSink, MeasurementSink, SharedSink, SinkError};
