pub mod outbound_manager;
pub mod tracker;

pub use outbound_manager::OutboundManager;
pub use tracker::{Manager, TrackedStream};
