//! 账号类型 → 上游工厂

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ProxyError, Result};
use crate::store::Account;

use super::{Provider, UpstreamClient};

/// 上游工厂注册表，名称不区分大小写
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
    default_provider: Option<String>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.providers.keys().collect();
        names.sort();
        f.debug_struct("ProviderRegistry")
            .field("providers", &names)
            .field("default", &self.default_provider)
            .finish()
    }
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册；第一个注册的工厂成为默认回退
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        let name = provider.name().trim().to_lowercase();
        if self.default_provider.is_none() {
            self.default_provider = Some(name.clone());
        }
        self.providers.insert(name, provider);
    }

    /// 指定默认回退
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        let name = name.trim().to_lowercase();
        if !self.providers.contains_key(&name) {
            return Err(ProxyError::config(format!("unknown provider: {name}")));
        }
        self.default_provider = Some(name);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(&name.trim().to_lowercase()).cloned()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(&name.trim().to_lowercase())
    }

    /// 按账号类型解析工厂，未知类型回退到默认工厂
    pub fn resolve(&self, account: &Account) -> Result<Arc<dyn Provider>> {
        self.get(&account.channel())
            .or_else(|| self.default_provider.as_deref().and_then(|name| self.get(name)))
            .ok_or_else(|| ProxyError::internal("no provider registered"))
    }

    /// 为账号创建上游客户端
    pub fn client_for(&self, account: &Account) -> Result<Arc<dyn UpstreamClient>> {
        Ok(self.resolve(account)?.new_client(account))
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}
