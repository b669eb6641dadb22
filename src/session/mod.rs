//! Per-identity session lifecycle: the instance state machine and the
//! pieces it drives.

pub mod backoff;
pub mod bypass;
pub mod drift;
pub mod hooks;
pub mod instance;
pub mod menu;
pub mod signals;
pub mod task_loop;
pub mod timers;

pub use hooks::{Carry, FleetEvent, FleetHooks, Generation};
pub use instance::{InstanceContext, InstanceFlags, InstanceHandle, SessionInstance, SessionPhase};
