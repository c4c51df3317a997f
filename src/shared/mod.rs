pub mod clock;
pub mod ids;
pub mod logging;
pub mod serde_ext;

pub use clock::{format_timestamp_ms, Clock, ManualClock, SystemClock};
pub use ids::{
    generate_thread_id, validate_identifier_value, CapabilityId, StepId, ThreadId, UserId,
    WorkflowType,
};
pub use logging::EventLog;
