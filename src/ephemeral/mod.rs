//! # 短期状态
//!
//! 请求去重、会话记忆与审计日志。每类都有内存与 KV 两种实现，
//! 启用 Redis 时走 KV 以便多实例共享。

pub mod audit;
pub mod conversation;
pub mod dedup;

pub use audit::{AuditEvent, AuditLogger, AuditQuery, KvAuditLogger, NopAuditLogger};
pub use conversation::{
    ConversationState, ConversationStore, KvConversationStore, MemoryConversationStore,
};
pub use dedup::{
    DedupGuard, DedupStore, KvDedupStore, MemoryDedupStore, build_dedup_store, duplicate_response,
    fingerprint,
};
