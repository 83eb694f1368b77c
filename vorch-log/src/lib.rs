//! Append-only event store for vorch managers.
//!
//! Every lifecycle action a manager performs is recorded as an [`Event`]
//! attached to the object it touched. Recording never blocks or fails the
//! caller: events are mirrored to the `audit` tracing target and handed to a
//! background batcher that flushes them into a redb file.
//!
//! # Example
//! ```ignore
//! use vorch_log::{EventLog, EventLogger};
//!
//! let log = Arc::new(EventLog::open(&data_dir)?);
//! let events = EventLogger::new(log, "volume");
//! events.add_event(&volume_id, &user_id, "create_volume", "Volume successfully inserted into db.");
//! ```

mod audit;
mod batcher;
mod event;
pub mod storage;

pub use audit::EventLogger;
pub use batcher::Batcher;
pub use event::Event;
pub use storage::EventLog;
