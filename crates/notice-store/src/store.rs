//! 单租户消息库
//!
//! 键布局:
//!   meta:token  绑定本目录的凭证原文
//!   meta:count  消息总数（8 字节大端）
//!   seq:msg     序列分配器上界
//!   msg:<id8>   消息体 JSON，id 为 8 字节大端

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;

use notice_core::{token::tenant_hash, NoticeError, PushMessage, Result, StoredMessage};

use crate::seq::{decode_u64, Sequence};

const META_TOKEN: &[u8] = b"meta:token";
const META_COUNT: &[u8] = b"meta:count";
const MSG_PREFIX: &[u8] = b"msg:";

/// 每多少次写入异步落一次 meta:count
const COUNT_CHECKPOINT: u64 = 100;

/// 默认分页大小
const DEFAULT_PAGE_SIZE: i64 = 20;
/// 分页大小上限
const MAX_PAGE_SIZE: i64 = 100;

/// 倒序分页结果
#[derive(Debug, Clone, Serialize)]
pub struct CursorResult {
    pub messages: Vec<StoredMessage>,
    pub total: u64,
    pub page_size: i64,
    pub has_more: bool,
    pub next_id: u64,
}

impl CursorResult {
    pub fn empty(page_size: i64) -> Self {
        Self {
            messages: Vec::new(),
            total: 0,
            page_size: clamp_page_size(page_size),
            has_more: false,
            next_id: 0,
        }
    }
}

/// 单租户消息库
#[derive(Debug)]
pub struct TenantStore {
    hash: String,
    db: sled::Db,
    seq: Mutex<Sequence>,
    count: AtomicU64,
    dirty: AtomicU64,
}

impl TenantStore {
    /// 打开租户库: 路径 <base>/<hash[0:2]>/<hash>
    pub fn open(base: &Path, credential: &str) -> Result<Self> {
        let hash = tenant_hash(credential);
        let dir = base.join(&hash[..2]).join(&hash);
        std::fs::create_dir_all(&dir)?;
        Self::open_at(&dir, credential, hash)
    }

    fn open_at(dir: &Path, credential: &str, hash: String) -> Result<Self> {
        let db = sled::open(dir)?;

        // 目录终生绑定首个凭证，哈希碰撞但凭证不同时拒绝打开
        match db.get(META_TOKEN)? {
            None => {
                db.insert(META_TOKEN, credential.as_bytes())?;
            }
            Some(v) if v.as_ref() == credential.as_bytes() => {}
            Some(_) => {
                return Err(NoticeError::TokenCollision(hash));
            }
        }

        let seq = Sequence::load(&db)?;
        let count = match db.get(META_COUNT)? {
            Some(v) => decode_u64(&v),
            None => {
                // 计数缺失时全量扫描重建
                let n = db.scan_prefix(MSG_PREFIX).count() as u64;
                db.insert(META_COUNT, n.to_be_bytes().to_vec())?;
                n
            }
        };

        Ok(Self {
            hash,
            db,
            seq: Mutex::new(seq),
            count: AtomicU64::new(count),
            dirty: AtomicU64::new(0),
        })
    }

    /// 租户哈希
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// 写入一条消息并返回落盘形态
    pub fn save(&self, topic: &str, msg: &PushMessage) -> Result<StoredMessage> {
        let id = self.seq.lock().allocate(&self.db)?;
        let stored = StoredMessage {
            id,
            topic: topic.to_string(),
            title: msg.title.clone(),
            content: msg.content.clone(),
            extra: msg.extra.clone(),
            timestamp: msg.timestamp.unwrap_or_else(Utc::now),
        };
        let body = serde_json::to_vec(&stored)?;
        self.db.insert(msg_key(id), body)?;

        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        if self.dirty.fetch_add(1, Ordering::SeqCst) + 1 >= COUNT_CHECKPOINT {
            self.dirty.store(0, Ordering::SeqCst);
            self.db.insert(META_COUNT, count.to_be_bytes().to_vec())?;
        }
        Ok(stored)
    }

    /// 倒序分页读取，before_id 为排他上界，0 表示从最新开始
    pub fn list(&self, before_id: u64, page_size: i64) -> Result<CursorResult> {
        let page_size = clamp_page_size(page_size);
        let mut messages = Vec::with_capacity(page_size as usize);
        let mut has_more = false;
        // before_id 是排他上界；0 表示从最大的 msg: 键开始
        let iter: Box<dyn Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>> =
            if before_id > 0 {
                Box::new(
                    self.db
                        .range(msg_key(0).to_vec()..msg_key(before_id).to_vec())
                        .rev(),
                )
            } else {
                Box::new(
                    self.db
                        .range(msg_key(0).to_vec()..=msg_key(u64::MAX).to_vec())
                        .rev(),
                )
            };
        for entry in iter {
            let (_, value) = entry?;
            if messages.len() as i64 == page_size {
                has_more = true;
                break;
            }
            let msg: StoredMessage = serde_json::from_slice(&value)?;
            messages.push(msg);
        }

        let next_id = if has_more {
            messages.last().map(|m| m.id).unwrap_or(0)
        } else {
            0
        };
        Ok(CursorResult {
            messages,
            total: self.count.load(Ordering::SeqCst),
            page_size,
            has_more,
            next_id,
        })
    }

    /// 当前消息总数（内存计数，检查点之间允许偏差）
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    /// 归还序列、落计数并刷盘
    pub fn close(&self) -> Result<()> {
        self.seq.lock().release(&self.db)?;
        let count = self.count.load(Ordering::SeqCst);
        self.db.insert(META_COUNT, count.to_be_bytes().to_vec())?;
        self.db.flush()?;
        Ok(())
    }
}

fn msg_key(id: u64) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[..4].copy_from_slice(MSG_PREFIX);
    key[4..].copy_from_slice(&id.to_be_bytes());
    key
}

fn clamp_page_size(page_size: i64) -> i64 {
    if page_size <= 0 {
        DEFAULT_PAGE_SIZE
    } else if page_size > MAX_PAGE_SIZE {
        MAX_PAGE_SIZE
    } else {
        page_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notice_core::PushMessage;

    fn open_store(dir: &Path, credential: &str) -> TenantStore {
        TenantStore::open(dir, credential).unwrap()
    }

    fn push(content: &str) -> PushMessage {
        PushMessage::now(None, content, None, None)
    }

    #[test]
    fn test_save_assigns_increasing_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), "t1");
        let a = store.save("notice", &push("a")).unwrap();
        let b = store.save("notice", &push("b")).unwrap();
        assert_eq!(a.id, 1);
        assert!(b.id > a.id);
        assert_eq!(store.count(), 2);
    }

    #[test]
    fn test_list_descending_pagination() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), "t1");
        for i in 0..25 {
            store.save("notice", &push(&format!("m{}", i))).unwrap();
        }

        let first = store.list(0, 10).unwrap();
        assert_eq!(first.messages.len(), 10);
        assert_eq!(first.total, 25);
        assert!(first.has_more);
        assert_eq!(first.messages[0].id, 25);
        assert_eq!(first.messages[9].id, 16);
        assert_eq!(first.next_id, 16);

        let second = store.list(first.next_id, 10).unwrap();
        assert_eq!(second.messages[0].id, 15);
        assert_eq!(second.messages[9].id, 6);
        assert!(second.has_more);

        let third = store.list(second.next_id, 10).unwrap();
        assert_eq!(third.messages.len(), 5);
        assert!(!third.has_more);
        assert_eq!(third.next_id, 0);

        // 三页拼起来恰好是全部 id，降序无重复
        let mut ids: Vec<u64> = first
            .messages
            .iter()
            .chain(second.messages.iter())
            .chain(third.messages.iter())
            .map(|m| m.id)
            .collect();
        assert_eq!(ids.len(), 25);
        let sorted = {
            let mut s = ids.clone();
            s.sort_unstable_by(|a, b| b.cmp(a));
            s.dedup();
            s
        };
        assert_eq!(ids, sorted);
        ids.dedup();
        assert_eq!(ids.len(), 25);
    }

    #[test]
    fn test_page_size_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), "t1");
        store.save("notice", &push("x")).unwrap();

        assert_eq!(store.list(0, 0).unwrap().page_size, 20);
        assert_eq!(store.list(0, -3).unwrap().page_size, 20);
        assert_eq!(store.list(0, 500).unwrap().page_size, 100);
        assert_eq!(store.list(0, 7).unwrap().page_size, 7);
    }

    #[test]
    fn test_before_id_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), "t1");
        for i in 0..5 {
            store.save("notice", &push(&format!("m{}", i))).unwrap();
        }
        let page = store.list(3, 10).unwrap();
        let ids: Vec<u64> = page.messages.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn test_count_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(dir.path(), "t1");
            for i in 0..5 {
                store.save("notice", &push(&format!("m{}", i))).unwrap();
            }
            store.close().unwrap();
        }
        let store = open_store(dir.path(), "t1");
        assert_eq!(store.count(), 5);
    }

    #[test]
    fn test_count_rebuilt_from_scan() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(dir.path(), "t1");
            for i in 0..7 {
                store.save("notice", &push(&format!("m{}", i))).unwrap();
            }
            // 删掉计数键，模拟缺失
            store.db.remove(META_COUNT).unwrap();
            store.db.flush().unwrap();
        }
        let store = open_store(dir.path(), "t1");
        assert_eq!(store.count(), 7);
    }

    #[test]
    fn test_token_collision_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let hash = notice_core::token::tenant_hash("t1");
        let path = dir.path().join(&hash[..2]).join(&hash);
        std::fs::create_dir_all(&path).unwrap();
        {
            let store = TenantStore::open_at(&path, "t1", hash.clone()).unwrap();
            store.close().unwrap();
        }
        // 同一目录换一个凭证打开必须失败
        let err = TenantStore::open_at(&path, "t2", hash).unwrap_err();
        assert!(matches!(err, NoticeError::TokenCollision(_)));
    }

    #[test]
    fn test_raw_content_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), "t1");
        let msg = PushMessage::now(Some("标题".into()), "line1\nline2", None, Some("cli".into()));
        store.save("notice", &msg).unwrap();
        let page = store.list(0, 1).unwrap();
        assert_eq!(page.messages[0].content, "line1\nline2");
        assert_eq!(page.messages[0].title.as_deref(), Some("标题"));
    }
}
