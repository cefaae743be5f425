//! Checkpoint store backends. Only the in-memory store ships with the
//! crate; durable backends implement [`Checkpoint`](crate::Checkpoint)
//! out of tree.

pub mod memory;
