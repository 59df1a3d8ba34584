//! 批量预留的序列分配器
//!
//! 每次向磁盘预留一批 id 以摊销 fsync 成本。进程崩溃最多跳过
//! 一批未用的 id，只保证单调，不保证连续。

use notice_core::Result;

/// 每批预留的 id 数量
pub(crate) const SEQ_BATCH: u64 = 100;

const KEY_SEQ: &[u8] = b"seq:msg";

#[derive(Debug)]
pub(crate) struct Sequence {
    next: u64,
    limit: u64,
}

impl Sequence {
    /// 从数据库恢复分配器，id 从 1 开始
    pub(crate) fn load(db: &sled::Db) -> Result<Self> {
        let limit = match db.get(KEY_SEQ)? {
            Some(v) => decode_u64(&v).max(1),
            None => 1,
        };
        Ok(Self { next: limit, limit })
    }

    /// 分配下一个 id，批次耗尽时先持久化新的上界
    pub(crate) fn allocate(&mut self, db: &sled::Db) -> Result<u64> {
        if self.next >= self.limit {
            self.limit = self.next + SEQ_BATCH;
            db.insert(KEY_SEQ, self.limit.to_be_bytes().to_vec())?;
            db.flush()?;
        }
        let id = self.next;
        self.next += 1;
        Ok(id)
    }

    /// 归还未用完的批次，干净关闭后重启不产生空洞
    pub(crate) fn release(&self, db: &sled::Db) -> Result<()> {
        db.insert(KEY_SEQ, self.next.to_be_bytes().to_vec())?;
        Ok(())
    }
}

pub(crate) fn decode_u64(raw: &[u8]) -> u64 {
    match <[u8; 8]>::try_from(raw) {
        Ok(bytes) => u64::from_be_bytes(bytes),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_db() -> (tempfile::TempDir, sled::Db) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        (dir, db)
    }

    #[test]
    fn test_sequence_starts_at_one() {
        let (_dir, db) = open_db();
        let mut seq = Sequence::load(&db).unwrap();
        assert_eq!(seq.allocate(&db).unwrap(), 1);
        assert_eq!(seq.allocate(&db).unwrap(), 2);
    }

    #[test]
    fn test_sequence_monotonic_after_crash() {
        let dir = tempfile::tempdir().unwrap();
        let last = {
            let db = sled::open(dir.path()).unwrap();
            let mut seq = Sequence::load(&db).unwrap();
            let mut last = 0;
            for _ in 0..5 {
                last = seq.allocate(&db).unwrap();
            }
            // 不调用 release，模拟崩溃
            last
        };
        let db = sled::open(dir.path()).unwrap();
        let mut seq = Sequence::load(&db).unwrap();
        let next = seq.allocate(&db).unwrap();
        assert!(next > last);
    }

    #[test]
    fn test_sequence_release_leaves_no_gap() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = sled::open(dir.path()).unwrap();
            let mut seq = Sequence::load(&db).unwrap();
            for _ in 0..3 {
                seq.allocate(&db).unwrap();
            }
            seq.release(&db).unwrap();
            db.flush().unwrap();
        }
        let db = sled::open(dir.path()).unwrap();
        let mut seq = Sequence::load(&db).unwrap();
        assert_eq!(seq.allocate(&db).unwrap(), 4);
    }
}
