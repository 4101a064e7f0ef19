pub mod config;
pub mod record;
pub mod state;
pub mod status;

pub use config::LifecycleConfig;
pub use record::LifecycleRecord;
pub use state::{
    Admission, LifecycleCommand, LifecycleEvent, LifecycleStateMachine, TransitionGuards,
    TransitionRecord,
};
pub use status::{
    HeartbeatResponse, HibernationAction, HibernationResponse, KeepAliveResponse,
    LifecycleStatus, TimeoutExtensionResponse,
};
