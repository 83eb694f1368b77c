//! vorch: lifecycle orchestration for storages, volumes, images, VMs and
//! virtual networks on a single host.
//!
//! Requests enter through the [`manager`] types, which persist state through
//! the [`store`] and reach the host only through the typed [`executor`]
//! queues of the [`bus`]. [`reconcile`] keeps the records in line with what
//! the host reports.

pub mod bus;
pub mod config;
pub mod error;
pub mod executor;
pub mod manager;
pub mod model;
pub mod reconcile;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
