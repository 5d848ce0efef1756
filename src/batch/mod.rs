//! # 批量任务引擎
//!
//! 管理端的批量操作（刷新 token、开启 NSFW、清理在线缓存）异步执行：
//! 立即返回 `task_id`，进度通过 SSE 订阅，可随时取消。

pub mod pool;
pub mod registry;
pub mod stream;
pub mod task;

pub use pool::{
    DEFAULT_BATCH_CONCURRENCY, ItemOutcome, MAX_BATCH_CONCURRENCY, mask_token,
    normalize_concurrency, run_pool,
};
pub use registry::{BatchRegistry, DEFAULT_TASK_TTL};
pub use stream::{PROGRESS_TICK, progress_payloads, progress_sse};
pub use task::{BatchSnapshot, BatchSummary, BatchTask, TaskStatus};
