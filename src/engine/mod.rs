pub mod coordinator;
pub mod directory;
pub mod lifecycle;
pub mod preorder;
pub mod queue;
pub mod ranking;
pub mod timeouts;

pub use coordinator::{DispatchOutcome, Dispatcher, DriverCancelOutcome, RejectOutcome};
pub use directory::{Directory, DriverProfile, LocationUpdate};
