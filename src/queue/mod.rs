//! Durable FIFO channels of task references: main, processing and deadletter.

pub mod transport;


pub use transport::{Channel, QueueDepths, QueueEntry, QueueTransport};
