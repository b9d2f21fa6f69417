//! Outcome notifications for finished tasks.

pub mod dispatcher;
pub mod format;

pub use dispatcher::{Delivery, DeliveryOutcome, NotificationDispatcher};
