pub mod chart;
pub mod registry;

pub use chart::{Chart, ChartSet, Trace, TracePoint};
pub use registry::{Signal, SignalRegistry, UpdateOutcome};
