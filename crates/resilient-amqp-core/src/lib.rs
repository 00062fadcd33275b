//! Core infrastructure for resilient-amqp.
//!
//! This crate provides the pieces shared by the connection supervisor and any
//! code observing it:
//! - Lifecycle event trait and listener collection
//! - Function-based listeners for quick callbacks

pub mod events;

pub use events::{EventListener, EventListeners, FnListener, LifecycleEvent};
