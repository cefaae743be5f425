//! Contracts between the consumer core and its collaborators: the
//! application handler, the checkpoint store and the stream API client.

pub mod checkpoint;
pub mod client;
pub mod handler;
