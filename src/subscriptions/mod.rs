//! Subscription registry and change notification fan-out.

mod registry;
mod types;

pub use registry::{Notifier, NotifierConfig, SubscriptionRegistry};
pub use types::{DeliveryHandle, DropReason, Notification};
