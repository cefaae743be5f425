//! Stream API client implementations.

pub mod kinesis;

pub use kinesis::KinesisStreamClient;
