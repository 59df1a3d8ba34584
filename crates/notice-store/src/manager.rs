//! 租户库管理器
//!
//! 按租户哈希缓存已打开的库。读锁查找、写锁双重检查后再打开，
//! 不同租户的写入互不阻塞。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;

use notice_core::config::StorageConfig;
use notice_core::{token::tenant_hash, PushMessage, Result, StoredMessage};

use crate::store::{CursorResult, TenantStore};

pub struct StoreManager {
    base: PathBuf,
    enabled: bool,
    stores: RwLock<HashMap<String, Arc<TenantStore>>>,
}

impl StoreManager {
    pub fn new(cfg: &StorageConfig) -> Self {
        Self {
            base: PathBuf::from(&cfg.path).join("store"),
            enabled: cfg.enabled,
            stores: RwLock::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    fn store_for(&self, credential: &str) -> Result<Arc<TenantStore>> {
        let hash = tenant_hash(credential);
        if let Some(store) = self.stores.read().get(&hash) {
            return Ok(store.clone());
        }
        let mut stores = self.stores.write();
        // 拿到写锁后重查，避免并发重复打开
        if let Some(store) = stores.get(&hash) {
            return Ok(store.clone());
        }
        let store = Arc::new(TenantStore::open(&self.base, credential)?);
        stores.insert(hash, store.clone());
        Ok(store)
    }

    /// 写入消息；存储停用时返回 None 且不报错
    pub fn save(
        &self,
        credential: &str,
        topic: &str,
        title: Option<String>,
        content: String,
        extra: Option<serde_json::Value>,
    ) -> Result<Option<StoredMessage>> {
        if !self.enabled {
            return Ok(None);
        }
        let store = self.store_for(credential)?;
        let msg = PushMessage {
            title,
            content,
            extra,
            timestamp: None,
            client: None,
        };
        Ok(Some(store.save(topic, &msg)?))
    }

    /// 倒序分页；存储停用时返回空页
    pub fn list(&self, credential: &str, before_id: u64, page_size: i64) -> Result<CursorResult> {
        if !self.enabled {
            return Ok(CursorResult::empty(page_size));
        }
        let store = self.store_for(credential)?;
        store.list(before_id, page_size)
    }

    /// 当前消息总数；存储停用时为 0
    pub fn count(&self, credential: &str) -> Result<u64> {
        if !self.enabled {
            return Ok(0);
        }
        Ok(self.store_for(credential)?.count())
    }

    /// 关闭全部租户库，可重复调用
    pub fn close(&self) {
        let stores: Vec<(String, Arc<TenantStore>)> = self.stores.write().drain().collect();
        for (hash, store) in stores {
            if let Err(e) = store.close() {
                tracing::warn!("关闭租户库 {} 失败: {}", hash, e);
            }
        }
    }
}

impl Drop for StoreManager {
    fn drop(&mut self) {
        self.close();
    }
}
