pub mod clock;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, RuntimeClock, SharedClock};
pub use error::{LifecycleError, Result};
pub use types::{ContainerId, IdleAction, LifecycleState, SubscriptionTier};
