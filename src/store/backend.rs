//! # KV 后端抽象
//!
//! `KvBackend` 是存储层唯一依赖的原语：字符串、集合、列表、计数器，
//! 外加几个需要原子执行的脚本操作。`RedisKv` 面向生产环境，
//! `MemoryKv` 用于单实例部署和测试，两者语义一致。

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{ProxyError, Result};

/// 去重登记结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupOutcome {
    /// 窗口内的重复请求
    pub duplicate: bool,
    /// 存在尚未完成的同指纹请求
    pub in_flight: bool,
}

/// KV 原语
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// 后端名称，用于日志
    fn name(&self) -> &'static str;

    async fn ping(&self) -> Result<()>;

    /// 清理已过期的键，返回清理数量；服务端自带过期的后端无需实现
    fn sweep_expired(&self) -> usize {
        0
    }

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// 批量读取，结果与键一一对应
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// 返回实际删除的键数
    async fn del(&self, keys: &[String]) -> Result<u64>;

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64>;

    /// 原子递减，下限为 0；对不存在的键或 0 值是空操作
    async fn decr_floor_zero(&self, key: &str) -> Result<i64>;

    async fn sadd(&self, key: &str, member: &str) -> Result<()>;

    async fn srem(&self, key: &str, member: &str) -> Result<()>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// 列出以 `prefix` 开头的所有键
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// 删除以 `prefix` 开头的所有键，返回删除数量
    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let keys = self.scan_prefix(prefix).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let mut deleted = 0;
        for chunk in keys.chunks(200) {
            deleted += self.del(chunk).await?;
        }
        Ok(deleted)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// 头插并裁剪到 `max_len`
    async fn list_push_capped(&self, key: &str, value: &str, max_len: usize) -> Result<()>;

    /// 读取前 `limit` 个元素（最新的在前）
    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>>;

    /// 原子设置渠道默认模型，返回目标是否存在于该渠道
    async fn set_default_model(
        &self,
        index_key: &str,
        record_prefix: &str,
        channel: &str,
        target_id: &str,
    ) -> Result<bool>;

    /// 原子去重登记
    async fn dedup_register(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        ttl_ms: u64,
    ) -> Result<DedupOutcome>;

    /// 原子去重完成
    async fn dedup_finish(&self, key: &str, now_ms: i64, ttl_ms: u64) -> Result<()>;
}

#[derive(Debug, Clone)]
enum Slot {
    Str(String),
    Set(BTreeSet<String>),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(slot: Slot, ttl: Option<Duration>) -> Self {
        Self {
            slot,
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// 进程内 KV 实现
///
/// 所有操作在同一把互斥锁内完成，因此脚本类操作天然原子。
/// 过期采用访问时惰性删除，另有 `sweep_expired` 供后台周期清理。
#[derive(Debug, Default)]
pub struct MemoryKv {
    data: Mutex<HashMap<String, Entry>>,
}

fn wrong_type(key: &str) -> ProxyError {
    ProxyError::store(format!("WRONGTYPE 键类型不匹配: {key}"))
}

impl MemoryKv {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 当前键数量（含未清理的过期键）
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live<'a>(data: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
        let now = Instant::now();
        if data.get(key).is_some_and(|e| e.is_expired(now)) {
            data.remove(key);
            return None;
        }
        data.get_mut(key)
    }

    fn read_str(data: &mut HashMap<String, Entry>, key: &str) -> Result<Option<String>> {
        match Self::live(data, key) {
            None => Ok(None),
            Some(Entry {
                slot: Slot::Str(value),
                ..
            }) => Ok(Some(value.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn read_int(data: &mut HashMap<String, Entry>, key: &str) -> Result<i64> {
        Self::read_str(data, key)?.map_or(Ok(0), |raw| {
            raw.trim()
                .parse::<i64>()
                .map_err(|_| ProxyError::store(format!("值不是整数: {key}")))
        })
    }

    /// 写入整数并保留原有 TTL
    fn write_int(data: &mut HashMap<String, Entry>, key: &str, value: i64) {
        let expires_at = Self::live(data, key).and_then(|e| e.expires_at);
        data.insert(
            key.to_string(),
            Entry {
                slot: Slot::Str(value.to_string()),
                expires_at,
            },
        );
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut data = self.lock();
        let before = data.len();
        data.retain(|_, entry| !entry.is_expired(now));
        before - data.len()
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Self::read_str(&mut self.lock(), key)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let mut data = self.lock();
        // MGET 对非字符串键返回 nil
        Ok(keys
            .iter()
            .map(|key| Self::read_str(&mut data, key).ok().flatten())
            .collect())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.lock()
            .insert(key.to_string(), Entry::new(Slot::Str(value.to_string()), ttl));
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        let now = Instant::now();
        let mut data = self.lock();
        let mut deleted = 0;
        for key in keys {
            if let Some(entry) = data.remove(key) {
                if !entry.is_expired(now) {
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut data = self.lock();
        let next = Self::read_int(&mut data, key)?
            .checked_add(delta)
            .ok_or_else(|| ProxyError::store(format!("计数器溢出: {key}")))?;
        Self::write_int(&mut data, key, next);
        Ok(next)
    }

    async fn decr_floor_zero(&self, key: &str) -> Result<i64> {
        let mut data = self.lock();
        let current = Self::read_int(&mut data, key)?;
        if current <= 0 {
            return Ok(0);
        }
        Self::write_int(&mut data, key, current - 1);
        Ok(current - 1)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut data = self.lock();
        match Self::live(&mut data, key) {
            Some(Entry {
                slot: Slot::Set(set),
                ..
            }) => {
                set.insert(member.to_string());
            }
            Some(_) => return Err(wrong_type(key)),
            None => {
                let set = BTreeSet::from([member.to_string()]);
                data.insert(key.to_string(), Entry::new(Slot::Set(set), None));
            }
        }
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut data = self.lock();
        let now_empty = match Self::live(&mut data, key) {
            Some(Entry {
                slot: Slot::Set(set),
                ..
            }) => {
                set.remove(member);
                set.is_empty()
            }
            Some(_) => return Err(wrong_type(key)),
            None => false,
        };
        if now_empty {
            data.remove(key);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        match Self::live(&mut self.lock(), key) {
            None => Ok(Vec::new()),
            Some(Entry {
                slot: Slot::Set(set),
                ..
            }) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .lock()
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        if let Some(entry) = Self::live(&mut self.lock(), key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn list_push_capped(&self, key: &str, value: &str, max_len: usize) -> Result<()> {
        let mut data = self.lock();
        match Self::live(&mut data, key) {
            Some(Entry {
                slot: Slot::List(list),
                ..
            }) => {
                list.push_front(value.to_string());
                list.truncate(max_len.max(1));
            }
            Some(_) => return Err(wrong_type(key)),
            None => {
                let list = VecDeque::from([value.to_string()]);
                data.insert(key.to_string(), Entry::new(Slot::List(list), None));
            }
        }
        Ok(())
    }

    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>> {
        match Self::live(&mut self.lock(), key) {
            None => Ok(Vec::new()),
            Some(Entry {
                slot: Slot::List(list),
                ..
            }) => Ok(list.iter().take(limit).cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set_default_model(
        &self,
        index_key: &str,
        record_prefix: &str,
        channel: &str,
        target_id: &str,
    ) -> Result<bool> {
        let mut data = self.lock();
        let ids: Vec<String> = match Self::live(&mut data, index_key) {
            Some(Entry {
                slot: Slot::Set(set),
                ..
            }) => set.iter().cloned().collect(),
            Some(_) => return Err(wrong_type(index_key)),
            None => Vec::new(),
        };

        let mut found = false;
        for id in ids {
            let key = format!("{record_prefix}{id}");
            let Ok(Some(raw)) = Self::read_str(&mut data, &key) else {
                continue;
            };
            let Ok(Value::Object(mut record)) = serde_json::from_str::<Value>(&raw) else {
                continue;
            };
            let record_channel = record
                .get("channel")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if !record_channel.eq_ignore_ascii_case(channel) {
                continue;
            }
            let is_target = record.get("id").and_then(Value::as_str) == Some(target_id);
            found |= is_target;
            if record.get("is_default").and_then(Value::as_bool) != Some(is_target) {
                record.insert("is_default".to_string(), Value::Bool(is_target));
                let encoded = serde_json::to_string(&record)?;
                data.insert(key, Entry::new(Slot::Str(encoded), None));
            }
        }
        Ok(found)
    }

    async fn dedup_register(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        ttl_ms: u64,
    ) -> Result<DedupOutcome> {
        let mut data = self.lock();
        let ttl = Some(Duration::from_millis(ttl_ms));
        let record = Self::read_str(&mut data, key)?
            .and_then(|raw| serde_json::from_str::<DedupRecord>(&raw).ok());
        let next = match record {
            Some(record) if now_ms - record.last <= window_ms => {
                return Ok(DedupOutcome {
                    duplicate: true,
                    in_flight: record.inflight > 0,
                });
            }
            Some(record) => DedupRecord {
                last: now_ms,
                inflight: record.inflight + 1,
            },
            None => DedupRecord {
                last: now_ms,
                inflight: 1,
            },
        };
        data.insert(
            key.to_string(),
            Entry::new(Slot::Str(serde_json::to_string(&next)?), ttl),
        );
        Ok(DedupOutcome::default())
    }

    async fn dedup_finish(&self, key: &str, now_ms: i64, ttl_ms: u64) -> Result<()> {
        let mut data = self.lock();
        let Some(mut record) = Self::read_str(&mut data, key)?
            .and_then(|raw| serde_json::from_str::<DedupRecord>(&raw).ok())
        else {
            return Ok(());
        };
        record.inflight = (record.inflight - 1).max(0);
        record.last = now_ms;
        data.insert(
            key.to_string(),
            Entry::new(
                Slot::Str(serde_json::to_string(&record)?),
                Some(Duration::from_millis(ttl_ms)),
            ),
        );
        Ok(())
    }
}

/// 去重记录，字段名与 Lua 脚本中的 cjson 结构一致
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
struct DedupRecord {
    last: i64,
    inflight: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_string_set_get_and_ttl() {
        let kv = MemoryKv::new();
        kv.set("a", "1", None).await.unwrap();
        kv.set("b", "2", Some(Duration::from_millis(10))).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap().as_deref(), Some("1"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(kv.get("b").await.unwrap(), None);
        assert_eq!(
            kv.mget(&["a".into(), "b".into(), "c".into()]).await.unwrap(),
            vec![Some("1".to_string()), None, None]
        );
    }

    #[tokio::test]
    async fn test_decr_floor_zero_is_noop_at_zero() {
        let kv = MemoryKv::new();
        assert_eq!(kv.decr_floor_zero("c").await.unwrap(), 0);
        assert_eq!(kv.incr_by("c", 2).await.unwrap(), 2);
        assert_eq!(kv.decr_floor_zero("c").await.unwrap(), 1);
        assert_eq!(kv.decr_floor_zero("c").await.unwrap(), 0);
        assert_eq!(kv.decr_floor_zero("c").await.unwrap(), 0);
        assert_eq!(kv.get("c").await.unwrap().as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn test_sets_and_wrong_type() {
        let kv = MemoryKv::new();
        kv.sadd("s", "1").await.unwrap();
        kv.sadd("s", "2").await.unwrap();
        kv.sadd("s", "1").await.unwrap();
        assert_eq!(kv.smembers("s").await.unwrap(), vec!["1", "2"]);
        kv.srem("s", "1").await.unwrap();
        assert_eq!(kv.smembers("s").await.unwrap(), vec!["2"]);
        assert!(kv.get("s").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let kv = MemoryKv::new();
        kv.set("p:conns:1", "3", None).await.unwrap();
        kv.set("p:conns:2", "1", None).await.unwrap();
        kv.set("p:other", "x", None).await.unwrap();
        assert_eq!(kv.delete_prefix("p:conns:").await.unwrap(), 2);
        assert_eq!(kv.len(), 1);
    }

    #[tokio::test]
    async fn test_list_capped() {
        let kv = MemoryKv::new();
        for i in 0..5 {
            kv.list_push_capped("l", &i.to_string(), 3).await.unwrap();
        }
        assert_eq!(kv.list_range("l", 10).await.unwrap(), vec!["4", "3", "2"]);
        assert_eq!(kv.list_range("l", 1).await.unwrap(), vec!["4"]);
    }

    #[tokio::test]
    async fn test_set_default_model_clears_siblings() {
        let kv = MemoryKv::new();
        let records = [
            json!({"id": "1", "channel": "Warp", "is_default": true}),
            json!({"id": "2", "channel": "warp", "is_default": false}),
            json!({"id": "3", "channel": "grok", "is_default": true}),
        ];
        for record in &records {
            let id = record["id"].as_str().unwrap();
            kv.sadd("idx", id).await.unwrap();
            kv.set(&format!("m:{id}"), &record.to_string(), None)
                .await
                .unwrap();
        }

        assert!(kv.set_default_model("idx", "m:", "WARP", "2").await.unwrap());
        let read = |raw: Option<String>| -> bool {
            serde_json::from_str::<Value>(&raw.unwrap()).unwrap()["is_default"]
                .as_bool()
                .unwrap()
        };
        assert!(!read(kv.get("m:1").await.unwrap()));
        assert!(read(kv.get("m:2").await.unwrap()));
        assert!(read(kv.get("m:3").await.unwrap()));
        assert!(!kv.set_default_model("idx", "m:", "warp", "3").await.unwrap());
    }

    #[tokio::test]
    async fn test_dedup_register_and_finish() {
        let kv = MemoryKv::new();
        let first = kv.dedup_register("d", 1_000, 2_000, 10_000).await.unwrap();
        assert_eq!(first, DedupOutcome::default());
        let second = kv.dedup_register("d", 1_500, 2_000, 10_000).await.unwrap();
        assert!(second.duplicate);
        assert!(second.in_flight);

        kv.dedup_finish("d", 1_600, 10_000).await.unwrap();
        let third = kv.dedup_register("d", 2_000, 2_000, 10_000).await.unwrap();
        assert!(third.duplicate);
        assert!(!third.in_flight);

        let after_window = kv.dedup_register("d", 5_000, 2_000, 10_000).await.unwrap();
        assert!(!after_window.duplicate);
    }

    #[test]
    fn test_sweep_expired() {
        let kv = MemoryKv::new();
        kv.lock().insert(
            "gone".into(),
            Entry {
                slot: Slot::Str("x".into()),
                expires_at: Some(Instant::now()),
            },
        );
        assert_eq!(kv.sweep_expired(), 1);
        assert!(kv.is_empty());
    }
}
