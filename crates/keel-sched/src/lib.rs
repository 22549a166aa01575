pub mod codec;
pub mod detector;
pub mod driver;
pub mod error;
pub mod id;
pub mod local;
mod relay;
mod scheduler;
pub mod validation;

pub use codec::{
    ExecutorInfo, FrameworkMessage, Params, SlaveOffer, TaskDescriptor, TaskState, TaskStatus,
};
pub use driver::{Scheduler, SchedulerDriver};
pub use error::{SchedulerError, SchedulerResult};
pub use id::{FrameworkId, MessageId, OfferId, SlaveId, TaskId};
pub use scheduler::SchedulerOptions;
