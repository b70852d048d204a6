//! Dead-letter channel management and consecutive-failure alerting.

pub mod alert;
pub mod handler;


pub use alert::AlertTracker;
pub use handler::{DeadLetterFilter, DeadLetterHandler};
