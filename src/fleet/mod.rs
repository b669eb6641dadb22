//! Fleet-wide coordination: the manager actor, its error windows and the
//! snapshot sink.

pub mod manager;
pub mod snapshot;
pub mod window;

pub use manager::{FleetCommand, FleetControl, FleetManager};
pub use snapshot::SnapshotWriter;
pub use window::ErrorWindow;
