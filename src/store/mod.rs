//! # 存储层
//!
//! 账号、模型、配置项、API Key 的增删改查，全部建立在 `KvBackend` 之上。
//! 列表类读取走短 TTL 的进程内缓存，写操作失效对应实体族的缓存。

pub mod backend;
pub mod keys;
pub mod models;
pub mod redis_backend;
pub mod scripts;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use moka::future::Cache;

pub use backend::{DedupOutcome, KvBackend, MemoryKv};
pub use keys::KeySpace;
pub use models::{
    Account, ApiKey, ImportSummary, Model, ModelStatus, RateLimitInfo, STATUS_QUOTA_EXCEEDED,
    STATUS_RATE_LIMITED,
};
pub use redis_backend::RedisKv;

use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::utils::{random_hex, sha256_hex};
use crate::{ldebug, linfo, lwarn};

/// 列表缓存的固定键
const LIST_KEY: u8 = 0;

/// API Key 明文前缀
pub const API_KEY_PREFIX: &str = "sk-";

/// 存储门面
#[derive(Clone)]
pub struct Store {
    kv: Arc<dyn KvBackend>,
    keys: KeySpace,
    /// TTL 为零时不缓存
    accounts_cache: Option<Cache<u8, Arc<Vec<Account>>>>,
    models_cache: Option<Cache<u8, Arc<Vec<Model>>>>,
    settings_cache: Option<Cache<String, Option<String>>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("backend", &self.kv.name())
            .field("prefix", &self.keys.prefix())
            .finish_non_exhaustive()
    }
}

fn shared_err(e: Arc<ProxyError>) -> ProxyError {
    ProxyError::store(e.to_string())
}

impl Store {
    /// 创建存储门面；`cache_ttl` 为零时关闭读缓存
    #[must_use]
    pub fn new(kv: Arc<dyn KvBackend>, prefix: &str, cache_ttl: Duration) -> Self {
        let enabled = !cache_ttl.is_zero();
        Self {
            kv,
            keys: KeySpace::new(prefix),
            accounts_cache: enabled.then(|| {
                Cache::builder()
                    .max_capacity(1)
                    .time_to_live(cache_ttl)
                    .build()
            }),
            models_cache: enabled.then(|| {
                Cache::builder()
                    .max_capacity(1)
                    .time_to_live(cache_ttl)
                    .build()
            }),
            settings_cache: enabled.then(|| {
                Cache::builder()
                    .max_capacity(256)
                    .time_to_live(cache_ttl)
                    .build()
            }),
        }
    }

    /// 基于内存后端的存储，单实例部署与测试使用
    #[must_use]
    pub fn in_memory(prefix: &str) -> Self {
        Self::new(Arc::new(MemoryKv::new()), prefix, Duration::from_secs(2))
    }

    #[must_use]
    pub fn kv(&self) -> Arc<dyn KvBackend> {
        Arc::clone(&self.kv)
    }

    #[must_use]
    pub const fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub async fn ping(&self) -> Result<()> {
        self.kv.ping().await
    }

    /// 关闭前清空缓存
    pub fn close(&self) {
        self.invalidate_accounts();
        self.invalidate_models();
        if let Some(cache) = &self.settings_cache {
            cache.invalidate_all();
        }
    }

    fn invalidate_accounts(&self) {
        if let Some(cache) = &self.accounts_cache {
            cache.invalidate_all();
        }
    }

    fn invalidate_models(&self) {
        if let Some(cache) = &self.models_cache {
            cache.invalidate_all();
        }
    }

    // ---------------------------------------------------------------- 账号

    /// 新建账号，分配递增 id
    pub async fn create_account(&self, account: &mut Account) -> Result<()> {
        account.id = self.kv.incr_by(&self.keys.accounts_seq(), 1).await?;
        account.created_at = Utc::now();
        self.insert_account(account).await?;
        linfo!(
            "system",
            LogStage::Cache,
            LogComponent::Store,
            "create_account",
            "账号已创建",
            account_id = account.id,
            account_type = %account.channel()
        );
        Ok(())
    }

    async fn insert_account(&self, account: &mut Account) -> Result<()> {
        account.weight = account.effective_weight();
        account.updated_at = Utc::now();
        let encoded = serde_json::to_string(&account)?;
        self.kv.set(&self.keys.account(account.id), &encoded, None).await?;
        self.kv
            .set(
                &self.keys.account_requests(account.id),
                &account.request_count.to_string(),
                None,
            )
            .await?;
        self.kv
            .sadd(&self.keys.accounts_index(), &account.id.to_string())
            .await?;
        self.invalidate_accounts();
        Ok(())
    }

    /// 更新账号；`request_count` 由计数器维护，不随记录写入变化
    pub async fn update_account(&self, account: &Account) -> Result<()> {
        let key = self.keys.account(account.id);
        if self.kv.get(&key).await?.is_none() {
            return Err(ProxyError::not_found(format!("账号不存在: {}", account.id)));
        }
        let mut record = account.clone();
        record.weight = record.effective_weight();
        record.updated_at = Utc::now();
        self.kv.set(&key, &serde_json::to_string(&record)?, None).await?;
        self.invalidate_accounts();
        Ok(())
    }

    pub async fn delete_account(&self, id: i64) -> Result<()> {
        let removed = self
            .kv
            .del(&[self.keys.account(id), self.keys.account_requests(id)])
            .await?;
        self.kv
            .srem(&self.keys.accounts_index(), &id.to_string())
            .await?;
        self.invalidate_accounts();
        if removed == 0 {
            return Err(ProxyError::not_found(format!("账号不存在: {id}")));
        }
        Ok(())
    }

    /// 读取单个账号（不走缓存）；解码失败按不存在处理
    pub async fn get_account(&self, id: i64) -> Result<Account> {
        let keys = [self.keys.account(id), self.keys.account_requests(id)];
        let mut values = self.kv.mget(&keys).await?.into_iter();
        let raw = values.next().flatten();
        let count = values.next().flatten();
        let Some(raw) = raw else {
            return Err(ProxyError::not_found(format!("账号不存在: {id}")));
        };
        let mut account = decode_account(id, &raw)?;
        account.request_count = parse_count(count.as_deref()).unwrap_or(account.request_count);
        Ok(account)
    }

    /// 全部账号快照（按 id 排序）
    ///
    /// 返回的是缓存内容的深拷贝，调用方的修改不会影响其他读者。
    pub async fn list_accounts(&self) -> Result<Vec<Account>> {
        let snapshot = match &self.accounts_cache {
            Some(cache) => cache
                .try_get_with(LIST_KEY, self.load_accounts())
                .await
                .map_err(shared_err)?,
            None => self.load_accounts().await?,
        };
        Ok(snapshot.as_ref().clone())
    }

    /// 启用的账号
    pub async fn get_enabled_accounts(&self) -> Result<Vec<Account>> {
        let mut accounts = self.list_accounts().await?;
        accounts.retain(|a| a.enabled);
        Ok(accounts)
    }

    async fn load_accounts(&self) -> Result<Arc<Vec<Account>>> {
        let mut ids: Vec<i64> = self
            .kv
            .smembers(&self.keys.accounts_index())
            .await?
            .iter()
            .filter_map(|id| id.parse().ok())
            .collect();
        ids.sort_unstable();
        if ids.is_empty() {
            return Ok(Arc::new(Vec::new()));
        }

        let mut keys: Vec<String> = ids.iter().map(|id| self.keys.account(*id)).collect();
        keys.extend(ids.iter().map(|id| self.keys.account_requests(*id)));
        let values = self.kv.mget(&keys).await?;
        let (records, counts) = values.split_at(ids.len());

        let mut accounts = Vec::with_capacity(ids.len());
        for ((id, raw), count) in ids.iter().zip(records).zip(counts) {
            let Some(raw) = raw else { continue };
            match decode_account(*id, raw) {
                Ok(mut account) => {
                    if let Some(n) = parse_count(count.as_deref()) {
                        account.request_count = n;
                    }
                    accounts.push(account);
                }
                Err(e) => {
                    lwarn!(
                        "system",
                        LogStage::Cache,
                        LogComponent::Store,
                        "decode_account",
                        "跳过无法解析的账号记录",
                        account_id = *id,
                        error = %e
                    );
                }
            }
        }
        ldebug!(
            "system",
            LogStage::Cache,
            LogComponent::Store,
            "load_accounts",
            &format!("加载账号 {} 个", accounts.len())
        );
        Ok(Arc::new(accounts))
    }

    /// 原子递增请求计数
    pub async fn increment_request_count(&self, id: i64) -> Result<i64> {
        self.kv.incr_by(&self.keys.account_requests(id), 1).await
    }

    /// 根据上游限额头更新用量字段
    pub async fn update_account_usage(&self, id: i64, info: &RateLimitInfo) -> Result<()> {
        if info.is_empty() {
            return Ok(());
        }
        let mut account = self.get_account(id).await?;
        if let Some(limit) = info.limit {
            account.usage_limit = limit;
        }
        if let (Some(limit), Some(remaining)) = (info.limit, info.remaining) {
            account.usage_current = (limit - remaining).max(0.0);
        }
        if let Some(reset_at) = info.reset_at {
            account.quota_reset_at = Some(reset_at);
        }
        self.update_account(&account).await
    }

    /// 导出全部账号
    pub async fn export_accounts(&self) -> Result<Vec<Account>> {
        self.invalidate_accounts();
        self.list_accounts().await
    }

    /// 导入账号；id 已存在时除非 `overwrite` 否则跳过，id 为 0 时分配新 id
    pub async fn import_accounts(
        &self,
        accounts: Vec<Account>,
        overwrite: bool,
    ) -> Result<ImportSummary> {
        let mut summary = ImportSummary::default();
        let mut max_id = 0;
        for mut account in accounts {
            if account.id <= 0 {
                self.create_account(&mut account).await?;
                summary.imported += 1;
                continue;
            }
            let exists = self.kv.get(&self.keys.account(account.id)).await?.is_some();
            if exists && !overwrite {
                summary.skipped += 1;
                continue;
            }
            max_id = max_id.max(account.id);
            // 保留原始创建时间
            self.insert_account(&mut account).await?;
            summary.imported += 1;
        }

        // 序列号不能落后于导入的最大 id
        let seq_key = self.keys.accounts_seq();
        let current = parse_count(self.kv.get(&seq_key).await?.as_deref()).unwrap_or(0);
        if max_id > current {
            self.kv.incr_by(&seq_key, max_id - current).await?;
        }
        self.invalidate_accounts();
        linfo!(
            "system",
            LogStage::Cache,
            LogComponent::Store,
            "import_accounts",
            "账号导入完成",
            imported = summary.imported,
            skipped = summary.skipped
        );
        Ok(summary)
    }

    // ---------------------------------------------------------------- 模型

    pub async fn create_model(&self, model: &mut Model) -> Result<()> {
        if model.id.trim().is_empty() {
            model.id = self.kv.incr_by(&self.keys.models_seq(), 1).await?.to_string();
        }
        let now = Utc::now();
        model.created_at = now;
        model.updated_at = now;
        let wants_default = model.is_default;
        model.is_default = false;
        self.kv
            .set(&self.keys.model(&model.id), &serde_json::to_string(&model)?, None)
            .await?;
        self.kv.sadd(&self.keys.models_index(), &model.id).await?;
        self.invalidate_models();
        if wants_default {
            self.set_default_model(&model.id).await?;
            model.is_default = true;
        }
        Ok(())
    }

    pub async fn update_model(&self, model: &Model) -> Result<()> {
        let key = self.keys.model(&model.id);
        let existing = self
            .kv
            .get(&key)
            .await?
            .ok_or_else(|| ProxyError::not_found(format!("模型不存在: {}", model.id)))?;
        let was_default = serde_json::from_str::<Model>(&existing).is_ok_and(|m| m.is_default);

        let mut record = model.clone();
        record.updated_at = Utc::now();
        // 设为默认只通过脚本完成；取消默认可以直接写入
        record.is_default = model.is_default && was_default;
        self.kv.set(&key, &serde_json::to_string(&record)?, None).await?;
        self.invalidate_models();
        if model.is_default && !was_default {
            self.set_default_model(&model.id).await?;
        }
        Ok(())
    }

    /// 原子设置渠道默认模型
    pub async fn set_default_model(&self, id: &str) -> Result<()> {
        let model = self.get_model(id).await?;
        let found = self
            .kv
            .set_default_model(
                &self.keys.models_index(),
                &self.keys.model_record_prefix(),
                &model.channel,
                id,
            )
            .await?;
        self.invalidate_models();
        if !found {
            return Err(ProxyError::not_found(format!("模型不存在: {id}")));
        }
        Ok(())
    }

    pub async fn delete_model(&self, id: &str) -> Result<()> {
        let removed = self.kv.del(&[self.keys.model(id)]).await?;
        self.kv.srem(&self.keys.models_index(), id).await?;
        self.invalidate_models();
        if removed == 0 {
            return Err(ProxyError::not_found(format!("模型不存在: {id}")));
        }
        Ok(())
    }

    pub async fn get_model(&self, id: &str) -> Result<Model> {
        let raw = self
            .kv
            .get(&self.keys.model(id))
            .await?
            .ok_or_else(|| ProxyError::not_found(format!("模型不存在: {id}")))?;
        serde_json::from_str(&raw).map_err(|_| ProxyError::not_found(format!("模型不存在: {id}")))
    }

    /// 按对外别名查找
    pub async fn get_model_by_model_id(&self, model_id: &str) -> Result<Model> {
        self.list_models()
            .await?
            .into_iter()
            .find(|m| m.model_id == model_id)
            .ok_or_else(|| ProxyError::not_found(format!("模型不存在: {model_id}")))
    }

    /// 全部模型，按 (渠道, 排序号, id) 排序
    pub async fn list_models(&self) -> Result<Vec<Model>> {
        let snapshot = match &self.models_cache {
            Some(cache) => cache
                .try_get_with(LIST_KEY, self.load_models())
                .await
                .map_err(shared_err)?,
            None => self.load_models().await?,
        };
        Ok(snapshot.as_ref().clone())
    }

    async fn load_models(&self) -> Result<Arc<Vec<Model>>> {
        let ids = self.kv.smembers(&self.keys.models_index()).await?;
        let keys: Vec<String> = ids.iter().map(|id| self.keys.model(id)).collect();
        let values = self.kv.mget(&keys).await?;
        let mut models: Vec<Model> = values
            .into_iter()
            .flatten()
            .filter_map(|raw| serde_json::from_str(&raw).ok())
            .collect();
        models.sort_by(|a, b| {
            a.channel
                .to_lowercase()
                .cmp(&b.channel.to_lowercase())
                .then(a.sort_order.cmp(&b.sort_order))
                .then(a.id.cmp(&b.id))
        });
        Ok(Arc::new(models))
    }

    /// 某渠道启用的模型
    pub async fn list_channel_models(&self, channel: &str) -> Result<Vec<Model>> {
        let mut models = self.list_models().await?;
        models.retain(|m| m.in_channel(channel) && m.status.is_enabled());
        Ok(models)
    }

    /// 首次启动时写入各渠道的默认模型；已有模型时不做任何事
    pub async fn seed_default_models(&self) -> Result<usize> {
        if !self.list_models().await?.is_empty() {
            return Ok(0);
        }
        let seeds = [
            Model::new("Orchids", "claude-sonnet-4-5", "Claude Sonnet 4.5", true, 0),
            Model::new("Orchids", "claude-opus-4-5", "Claude Opus 4.5", false, 1),
            Model::new(
                "Orchids",
                "claude-sonnet-4-5-thinking",
                "Claude Sonnet 4.5 Thinking",
                false,
                2,
            ),
            Model::new("Warp", "auto", "Warp Auto", true, 0),
            Model::new("Warp", "claude-4-sonnet", "Claude 4 Sonnet", false, 1),
            Model::new("Warp", "gpt-5", "GPT-5", false, 2),
            Model::new("Grok", "grok-4", "Grok 4", true, 0),
            Model::new("Grok", "grok-4-fast", "Grok 4 Fast", false, 1),
            Model::new("Grok", "grok-imagine", "Grok Imagine", false, 2),
        ];
        let mut created = 0;
        for mut model in seeds {
            match self.create_model(&mut model).await {
                Ok(()) => created += 1,
                Err(e) => lwarn!(
                    "system",
                    LogStage::Startup,
                    LogComponent::Store,
                    "seed_model",
                    "写入默认模型失败",
                    model_id = %model.model_id,
                    error = %e
                ),
            }
        }
        Ok(created)
    }

    // ---------------------------------------------------------------- 配置项

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let full_key = self.keys.setting(key);
        match &self.settings_cache {
            Some(cache) => cache
                .try_get_with(key.to_string(), self.kv.get(&full_key))
                .await
                .map_err(shared_err),
            None => self.kv.get(&full_key).await,
        }
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.kv.set(&self.keys.setting(key), value, None).await?;
        if let Some(cache) = &self.settings_cache {
            cache.invalidate(key).await;
        }
        Ok(())
    }

    // ---------------------------------------------------------------- API Key

    /// 生成新 Key，返回记录与明文（明文不落库）
    pub async fn create_api_key(&self, name: &str) -> Result<(ApiKey, String)> {
        let plaintext = format!("{API_KEY_PREFIX}{}", random_hex(24));
        let hash = sha256_hex(plaintext.as_bytes());
        let id = self.kv.incr_by(&self.keys.api_keys_seq(), 1).await?;
        let record = ApiKey {
            id,
            name: name.trim().to_string(),
            key_hash: hash.clone(),
            key_prefix: plaintext.chars().take(7).collect(),
            key_suffix: plaintext[plaintext.len() - 4..].to_string(),
            enabled: true,
            last_used_at: None,
            created_at: Utc::now(),
        };
        self.kv
            .set(&self.keys.api_key(id), &serde_json::to_string(&record)?, None)
            .await?;
        self.kv
            .set(&self.keys.api_key_by_hash(&hash), &id.to_string(), None)
            .await?;
        self.kv.sadd(&self.keys.api_keys_index(), &id.to_string()).await?;
        Ok((record, plaintext))
    }

    pub async fn get_api_key(&self, id: i64) -> Result<ApiKey> {
        let raw = self
            .kv
            .get(&self.keys.api_key(id))
            .await?
            .ok_or_else(|| ProxyError::not_found(format!("API Key 不存在: {id}")))?;
        serde_json::from_str(&raw)
            .map_err(|_| ProxyError::not_found(format!("API Key 不存在: {id}")))
    }

    pub async fn list_api_keys(&self) -> Result<Vec<ApiKey>> {
        let mut ids: Vec<i64> = self
            .kv
            .smembers(&self.keys.api_keys_index())
            .await?
            .iter()
            .filter_map(|id| id.parse().ok())
            .collect();
        ids.sort_unstable();
        let keys: Vec<String> = ids.iter().map(|id| self.keys.api_key(*id)).collect();
        Ok(self
            .kv
            .mget(&keys)
            .await?
            .into_iter()
            .flatten()
            .filter_map(|raw| serde_json::from_str(&raw).ok())
            .collect())
    }

    pub async fn set_api_key_enabled(&self, id: i64, enabled: bool) -> Result<ApiKey> {
        let mut key = self.get_api_key(id).await?;
        key.enabled = enabled;
        self.kv
            .set(&self.keys.api_key(id), &serde_json::to_string(&key)?, None)
            .await?;
        Ok(key)
    }

    pub async fn delete_api_key(&self, id: i64) -> Result<()> {
        let key = self.get_api_key(id).await?;
        self.kv
            .del(&[self.keys.api_key(id), self.keys.api_key_by_hash(&key.key_hash)])
            .await?;
        self.kv.srem(&self.keys.api_keys_index(), &id.to_string()).await?;
        Ok(())
    }

    /// 校验明文 Key；存在且启用时记录最后使用时间
    pub async fn validate_api_key(&self, plaintext: &str) -> Result<Option<ApiKey>> {
        let plaintext = plaintext.trim();
        if !plaintext.starts_with(API_KEY_PREFIX) {
            return Ok(None);
        }
        let hash = sha256_hex(plaintext.as_bytes());
        let Some(id) = self.kv.get(&self.keys.api_key_by_hash(&hash)).await? else {
            return Ok(None);
        };
        let Ok(id) = id.parse::<i64>() else {
            return Ok(None);
        };
        let mut key = match self.get_api_key(id).await {
            Ok(key) => key,
            Err(ProxyError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        if !key.enabled {
            return Ok(None);
        }
        key.last_used_at = Some(Utc::now());
        if let Err(e) = self
            .kv
            .set(&self.keys.api_key(id), &serde_json::to_string(&key)?, None)
            .await
        {
            lwarn!(
                "system",
                LogStage::Authentication,
                LogComponent::Store,
                "touch_api_key",
                "更新 API Key 使用时间失败",
                key_id = id,
                error = %e
            );
        }
        Ok(Some(key))
    }
}

fn decode_account(id: i64, raw: &str) -> Result<Account> {
    serde_json::from_str(raw).map_err(|_| ProxyError::not_found(format!("账号不存在: {id}")))
}

fn parse_count(raw: Option<&str>) -> Option<i64> {
    raw.and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store() -> Store {
        Store::new(Arc::new(MemoryKv::new()), "test", Duration::ZERO)
    }

    #[tokio::test]
    async fn test_account_crud_round_trip() {
        let store = store();
        let mut acc = Account {
            name: "a".into(),
            account_type: "warp".into(),
            refresh_token: "rt".into(),
            weight: 0,
            ..Account::default()
        };
        store.create_account(&mut acc).await.unwrap();
        assert_eq!(acc.id, 1);
        assert_eq!(acc.weight, 1);

        let read = store.get_account(1).await.unwrap();
        assert_eq!(read, acc);

        let mut second = Account::default();
        store.create_account(&mut second).await.unwrap();
        assert_eq!(second.id, 2);
        let ids: Vec<i64> = store.list_accounts().await.unwrap().iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![1, 2]);

        store.delete_account(1).await.unwrap();
        assert!(matches!(
            store.get_account(1).await,
            Err(ProxyError::NotFound { .. })
        ));
        assert!(matches!(
            store.delete_account(1).await,
            Err(ProxyError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_corrupt_record_is_not_found_and_skipped() {
        let store = store();
        let mut acc = Account::default();
        store.create_account(&mut acc).await.unwrap();
        store
            .kv()
            .set(&store.keys().account(acc.id), "{broken", None)
            .await
            .unwrap();
        assert!(matches!(
            store.get_account(acc.id).await,
            Err(ProxyError::NotFound { .. })
        ));
        assert!(store.list_accounts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_request_count_is_merged_on_read() {
        let store = store();
        let mut acc = Account::default();
        store.create_account(&mut acc).await.unwrap();
        store.increment_request_count(acc.id).await.unwrap();
        store.increment_request_count(acc.id).await.unwrap();
        assert_eq!(store.get_account(acc.id).await.unwrap().request_count, 2);
        assert_eq!(store.list_accounts().await.unwrap()[0].request_count, 2);
    }

    #[tokio::test]
    async fn test_cached_list_is_a_snapshot() {
        let store = Store::in_memory("test");
        let mut acc = Account::default();
        store.create_account(&mut acc).await.unwrap();
        let mut first = store.list_accounts().await.unwrap();
        first[0].name = "mutated".into();
        assert_eq!(store.list_accounts().await.unwrap()[0].name, "");
    }

    #[tokio::test]
    async fn test_mutation_invalidates_cached_list() {
        let store = Store::in_memory("test");
        let mut acc = Account::default();
        store.create_account(&mut acc).await.unwrap();
        assert_eq!(store.list_accounts().await.unwrap().len(), 1);
        acc.enabled = false;
        store.update_account(&acc).await.unwrap();
        assert!(store.get_enabled_accounts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_single_default_model_per_channel() {
        let store = store();
        assert_eq!(store.seed_default_models().await.unwrap(), 9);
        assert_eq!(store.seed_default_models().await.unwrap(), 0);

        let opus = store.get_model_by_model_id("claude-opus-4-5").await.unwrap();
        store.set_default_model(&opus.id).await.unwrap();

        let defaults: Vec<Model> = store
            .list_models()
            .await
            .unwrap()
            .into_iter()
            .filter(|m| m.in_channel("orchids") && m.is_default)
            .collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].model_id, "claude-opus-4-5");
        // 其他渠道不受影响
        assert!(store.get_model_by_model_id("grok-4").await.unwrap().is_default);
    }

    #[tokio::test]
    async fn test_concurrent_default_writers_leave_one_default() {
        let store = store();
        store.seed_default_models().await.unwrap();
        let warp: Vec<Model> = store.list_channel_models("warp").await.unwrap();
        let handles: Vec<_> = warp
            .iter()
            .map(|m| {
                let store = store.clone();
                let id = m.id.clone();
                tokio::spawn(async move { store.set_default_model(&id).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let defaults = store
            .list_channel_models("warp")
            .await
            .unwrap()
            .into_iter()
            .filter(|m| m.is_default)
            .count();
        assert_eq!(defaults, 1);
    }

    #[tokio::test]
    async fn test_api_key_lifecycle() {
        let store = store();
        let (key, plaintext) = store.create_api_key("ci").await.unwrap();
        assert!(plaintext.starts_with("sk-"));
        assert_eq!(plaintext.len(), 51);
        assert_eq!(key.key_prefix, &plaintext[..7]);
        assert_eq!(key.key_suffix, &plaintext[47..]);

        let validated = store.validate_api_key(&plaintext).await.unwrap().unwrap();
        assert!(validated.last_used_at.is_some());
        assert!(store.validate_api_key("sk-unknown").await.unwrap().is_none());

        store.set_api_key_enabled(key.id, false).await.unwrap();
        assert!(store.validate_api_key(&plaintext).await.unwrap().is_none());

        store.delete_api_key(key.id).await.unwrap();
        assert!(store.list_api_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_import_skips_existing_unless_overwrite() {
        let store = store();
        let mut acc = Account {
            name: "orig".into(),
            ..Account::default()
        };
        store.create_account(&mut acc).await.unwrap();

        let incoming = vec![
            Account {
                id: acc.id,
                name: "replaced".into(),
                ..Account::default()
            },
            Account {
                id: 10,
                name: "ten".into(),
                ..Account::default()
            },
        ];
        let summary = store.import_accounts(incoming.clone(), false).await.unwrap();
        assert_eq!(summary, ImportSummary { imported: 1, skipped: 1 });
        assert_eq!(store.get_account(acc.id).await.unwrap().name, "orig");

        let summary = store.import_accounts(incoming, true).await.unwrap();
        assert_eq!(summary.imported, 2);
        assert_eq!(store.get_account(acc.id).await.unwrap().name, "replaced");

        let mut next = Account::default();
        store.create_account(&mut next).await.unwrap();
        assert_eq!(next.id, 11);
    }

    #[tokio::test]
    async fn test_update_usage_from_rate_limit() {
        let store = store();
        let mut acc = Account::default();
        store.create_account(&mut acc).await.unwrap();
        store
            .update_account_usage(
                acc.id,
                &RateLimitInfo {
                    limit: Some(100.0),
                    remaining: Some(40.0),
                    reset_at: None,
                },
            )
            .await
            .unwrap();
        let read = store.get_account(acc.id).await.unwrap();
        assert!((read.usage_limit - 100.0).abs() < f64::EPSILON);
        assert!((read.usage_current - 60.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_settings() {
        let store = Store::in_memory("test");
        assert_eq!(store.get_setting("config").await.unwrap(), None);
        store.set_setting("config", "{}").await.unwrap();
        assert_eq!(store.get_setting("config").await.unwrap().as_deref(), Some("{}"));
    }
}
