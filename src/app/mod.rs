//! # 应用装配
//!
//! 共享上下文、指标与后台任务。

pub mod context;
pub mod metrics;
pub mod task_scheduler;
pub mod tasks;

pub use context::{AppContext, default_providers};
pub use metrics::{Gauges, Metrics};
pub use task_scheduler::{ScheduledTask, TaskScheduler};
pub use tasks::{AppTasks, PeriodicLoop, TaskType};
