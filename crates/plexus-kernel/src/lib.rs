// identifier service
pub mod ids;

// event model
pub mod event;

// event bus
pub mod bus;

// plan data model
pub mod plan;

// dependency extractor
pub mod extract;

// planner (strategies, registry, replan)
pub mod planner;

// step executor / scheduler
pub mod executor;

// timeline manager
pub mod timeline;

// external collaborator traits
pub mod runtime;

// retry/timeout/validation composition around tool runners
pub mod observe;

// unified configuration
pub mod config;

// error module
pub mod error;
pub use error::{KernelError, KernelResult};
