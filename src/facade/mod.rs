pub mod controller;

pub use controller::{LifecycleController, LifecycleControllerBuilder};
