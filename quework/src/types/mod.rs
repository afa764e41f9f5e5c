pub mod ids;
pub mod message;
pub mod record;
pub mod priority;

pub use ids::JobId;
pub use message::{JobMessage, NewJob, DEFAULT_QUEUE};
pub use record::{Job, JobState, Resolution};
pub use priority::JobPriority;
