//! # Redis KV 后端

use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, Client, Script, aio::ConnectionManager};

use super::backend::{DedupOutcome, KvBackend};
use super::scripts;
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::utils::parallel_map;
use crate::{ldebug, linfo, lwarn};

/// SCAN 每批数量
const SCAN_BATCH: usize = 200;

/// Redis 实现
#[derive(Clone)]
pub struct RedisKv {
    connection_manager: ConnectionManager,
    decr_floor_script: Script,
    set_default_script: Script,
    dedup_register_script: Script,
    dedup_finish_script: Script,
}

impl std::fmt::Debug for RedisKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKv").finish_non_exhaustive()
    }
}

impl RedisKv {
    /// 连接 Redis，`timeout` 内未建立连接视为失败
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::Store,
            "connect_to_redis",
            "正在连接 Redis 服务器"
        );

        let client = Client::open(url)
            .map_err(|e| ProxyError::store_with_source("创建 Redis 客户端失败", e))?;

        let connection_manager = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| ProxyError::store(format!("连接 Redis 超时 ({}s)", timeout.as_secs())))?
            .map_err(|e| ProxyError::store_with_source("建立 Redis 连接失败", e))?;

        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::Store,
            "redis_connected",
            "Redis 连接建立成功"
        );

        Ok(Self {
            connection_manager,
            decr_floor_script: Script::new(scripts::DECR_FLOOR_ZERO),
            set_default_script: Script::new(scripts::SET_DEFAULT_MODEL),
            dedup_register_script: Script::new(scripts::DEDUP_REGISTER),
            dedup_finish_script: Script::new(scripts::DEDUP_FINISH),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.connection_manager.clone()
    }
}

#[async_trait]
impl KvBackend for RedisKv {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| ProxyError::store_with_source("Redis PING 失败", e))?;
        if pong != "PONG" {
            return Err(ProxyError::store(format!("Redis PING 返回异常: {pong}")));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        conn.get(key)
            .await
            .map_err(|e| ProxyError::store_with_source(format!("读取失败: {key}"), e))
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn();
        match redis::cmd("MGET")
            .arg(keys)
            .query_async::<Vec<Option<String>>>(&mut conn)
            .await
        {
            Ok(values) => Ok(values),
            Err(e) => {
                lwarn!(
                    "system",
                    LogStage::Cache,
                    LogComponent::Store,
                    "mget_fallback",
                    "MGET 失败，逐个读取",
                    error = %e,
                    keys = keys.len()
                );
                let values = parallel_map(keys.to_vec(), 8, |key| async move {
                    self.get(&key).await.ok().flatten()
                })
                .await;
                Ok(values)
            }
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn();
        let result = match ttl {
            Some(ttl) => {
                let ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
                conn.pset_ex::<_, _, ()>(key, value, ms).await
            }
            None => conn.set::<_, _, ()>(key, value).await,
        };
        result.map_err(|e| ProxyError::store_with_source(format!("写入失败: {key}"), e))
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        conn.del(keys)
            .await
            .map_err(|e| ProxyError::store_with_source("删除失败", e))
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn();
        conn.incr(key, delta)
            .await
            .map_err(|e| ProxyError::store_with_source(format!("计数器递增失败: {key}"), e))
    }

    async fn decr_floor_zero(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn();
        self.decr_floor_script
            .key(key)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| ProxyError::store_with_source(format!("计数器递减失败: {key}"), e))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn();
        conn.sadd::<_, _, ()>(key, member)
            .await
            .map_err(|e| ProxyError::store_with_source(format!("SADD 失败: {key}"), e))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn();
        conn.srem::<_, _, ()>(key, member)
            .await
            .map_err(|e| ProxyError::store_with_source(format!("SREM 失败: {key}"), e))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        conn.smembers(key)
            .await
            .map_err(|e| ProxyError::store_with_source(format!("SMEMBERS 失败: {key}"), e))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|e| ProxyError::store_with_source(format!("SCAN 失败: {pattern}"), e))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        ldebug!(
            "system",
            LogStage::Cache,
            LogComponent::Store,
            "scan_prefix",
            &format!("扫描前缀 {prefix} 得到 {} 个键", keys.len())
        );
        Ok(keys)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn();
        let ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1);
        conn.pexpire::<_, ()>(key, ms)
            .await
            .map_err(|e| ProxyError::store_with_source(format!("设置过期失败: {key}"), e))
    }

    async fn list_push_capped(&self, key: &str, value: &str, max_len: usize) -> Result<()> {
        let mut conn = self.conn();
        let stop = isize::try_from(max_len.max(1)).unwrap_or(isize::MAX) - 1;
        redis::pipe()
            .atomic()
            .lpush(key, value)
            .ignore()
            .ltrim(key, 0, stop)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| ProxyError::store_with_source(format!("写入列表失败: {key}"), e))
    }

    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn();
        let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
        conn.lrange(key, 0, stop)
            .await
            .map_err(|e| ProxyError::store_with_source(format!("读取列表失败: {key}"), e))
    }

    async fn set_default_model(
        &self,
        index_key: &str,
        record_prefix: &str,
        channel: &str,
        target_id: &str,
    ) -> Result<bool> {
        let mut conn = self.conn();
        let found: i64 = self
            .set_default_script
            .key(index_key)
            .arg(record_prefix)
            .arg(channel)
            .arg(target_id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| ProxyError::store_with_source("设置默认模型失败", e))?;
        Ok(found == 1)
    }

    async fn dedup_register(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        ttl_ms: u64,
    ) -> Result<DedupOutcome> {
        let mut conn = self.conn();
        let (duplicate, in_flight): (i64, i64) = self
            .dedup_register_script
            .key(key)
            .arg(now_ms)
            .arg(window_ms)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| ProxyError::store_with_source("去重登记失败", e))?;
        Ok(DedupOutcome {
            duplicate: duplicate == 1,
            in_flight: in_flight == 1,
        })
    }

    async fn dedup_finish(&self, key: &str, now_ms: i64, ttl_ms: u64) -> Result<()> {
        let mut conn = self.conn();
        self.dedup_finish_script
            .key(key)
            .arg(now_ms)
            .arg(ttl_ms)
            .invoke_async::<i64>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| ProxyError::store_with_source("去重完成失败", e))
    }
}
