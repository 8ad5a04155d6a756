//! # Utility Modules
//!
//! Helpers shared by the codec, the transport and the coordinator.

pub mod logging;

pub use logging::{log_frame_hex, LogThrottle, ThrottleManager};
