//! The coordinator module decides which registers get polled and when.
//!
//! Consumers attach the registers they observe to a [`CommandRegistry`];
//! [`MeterCoordinator`] polls the union of them on an interval, with
//! [`Backoff`] stretching that interval while the meter is unreachable.

pub mod backoff;
pub mod poller;
pub mod registry;

pub use backoff::{Backoff, BackoffPolicy};
pub use poller::{
    build_batches, CoordinatorConfig, CoordinatorState, MeterCoordinator, PollCycle,
    UpdateCallback,
};
pub use registry::CommandRegistry;
