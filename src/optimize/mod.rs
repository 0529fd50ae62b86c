pub mod protocol;
pub mod schedule;
pub mod scoring;

pub use protocol::{
    optimize_protocol, AdjustmentEvent, ChartPayload, ProtocolResult, ProtocolSettings,
};
pub use schedule::{ProtocolSchedule, ScheduleRow};
pub use scoring::PerformanceMetrics;
