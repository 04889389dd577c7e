// Scheduler module: live timer engine, its clock and task administration

pub mod admin;
pub mod clock;
pub mod engine;

pub use admin::{NewTask, TaskAdmin, TaskPatch};
pub use clock::{Clock, SystemClock, TokioClock};
pub use engine::{SchedulerConfig, SchedulerCore, SchedulerView};
