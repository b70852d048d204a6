//! Task lifecycle notifications: created, started, completed, failed,
//! dead_lettered, retried and alert.

pub mod bus;
pub mod types;


pub use bus::{EventBus, EventStream};
pub use types::{EventKind, TaskEvent};
