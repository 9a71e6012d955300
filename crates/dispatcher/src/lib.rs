//! Global subscription dispatcher.
//!
//! Maps (client, instrument) requests onto concrete upstream sessions:
//! ref-counted sharing so one upstream subscription serves any number of
//! clients, round-robin placement over the available sessions, migration
//! off failed sessions, and a bounded retry queue drained by a maintenance
//! thread.

mod dispatch;
mod subscription;

pub use dispatch::Dispatcher;
pub use subscription::{ClientId, SubscriptionInfo, SubscriptionStatus};
