//! # 通用工具模块

pub mod event_stream;
pub mod jwt;
pub mod parallel;
pub mod pool;
pub mod secure;

pub use event_stream::{EventStream, EventStreamData, JsonLinesData};
pub use parallel::parallel_map;
pub use pool::{BufferPool, PooledBuffer};
pub use secure::{constant_time_eq, mask_secret, matches_any, random_hex, sha256_hex};
