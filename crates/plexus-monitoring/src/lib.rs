// span tracing (contexts, tracer, propagation, domain helpers)
pub mod trace;

// resource tracking and leak detection
pub mod resource;

// structured-logging installation
pub mod logging;

pub use resource::{LeakDetector, ResourceManager, TaskTracker};
pub use trace::{Tracer, TracerConfig, TracingStepObserver};
