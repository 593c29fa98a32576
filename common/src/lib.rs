pub mod job;
pub mod results;
pub mod slave;
pub mod statistics;

pub use job::{FailureReason, JobId, JobInfo, JobState, JobSubmitRequest, JobSubmitResponse};
pub use results::{Ack, CleanupResponse, JobOutcome, JobResultReport, JobResultView};
pub use slave::{
    JobDispatchRequest, JobDispatchResponse, SlaveHeartbeatRequest, SlaveHeartbeatResponse,
    SlaveId, SlaveInfo, SlaveRegisterRequest, SlaveRegisterResponse, SlaveState,
};
pub use statistics::{percent, SlaveUtilization, StatisticsSnapshot};
