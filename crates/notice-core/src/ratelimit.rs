//! IP 失败限流
//!
//! 滑动窗口计数, 达到上限即封禁一段时间。认证成功立即清除
//! 记录; 周期性驱逐过期条目由调用方调度。

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::RateLimitConfig;

const DEFAULT_MAX_FAILURES: u32 = 5;
const DEFAULT_BLOCK_TIME: Duration = Duration::from_secs(900);
const DEFAULT_WINDOW_TIME: Duration = Duration::from_secs(300);

/// 建议的后台驱逐间隔
pub const EVICT_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct FailureRecord {
    count: u32,
    first_fail: Instant,
    blocked_at: Option<Instant>,
}

pub struct RateLimiter {
    max_failures: u32,
    block_time: Duration,
    window_time: Duration,
    records: Mutex<HashMap<String, FailureRecord>>,
}

impl RateLimiter {
    /// 零值或负值回退到默认参数
    pub fn new(cfg: &RateLimitConfig) -> Self {
        Self {
            max_failures: if cfg.max_failures > 0 {
                cfg.max_failures as u32
            } else {
                DEFAULT_MAX_FAILURES
            },
            block_time: positive_secs(cfg.block_time).unwrap_or(DEFAULT_BLOCK_TIME),
            window_time: positive_secs(cfg.window_time).unwrap_or(DEFAULT_WINDOW_TIME),
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_blocked(&self, ip: &str) -> bool {
        self.is_blocked_at(ip, Instant::now())
    }

    fn is_blocked_at(&self, ip: &str, now: Instant) -> bool {
        let records = self.records.lock();
        match records.get(ip) {
            Some(rec) => match rec.blocked_at {
                Some(blocked_at) => now.duration_since(blocked_at) < self.block_time,
                None => false,
            },
            None => false,
        }
    }

    /// 记录一次失败, 返回该 IP 当前是否处于封禁状态
    pub fn record_failure(&self, ip: &str) -> bool {
        self.record_failure_at(ip, Instant::now())
    }

    fn record_failure_at(&self, ip: &str, now: Instant) -> bool {
        let mut records = self.records.lock();
        let rec = match records.get_mut(ip) {
            None => {
                records.insert(
                    ip.to_string(),
                    FailureRecord {
                        count: 1,
                        first_fail: now,
                        blocked_at: None,
                    },
                );
                return false;
            }
            Some(rec) => rec,
        };

        if let Some(blocked_at) = rec.blocked_at {
            if now.duration_since(blocked_at) < self.block_time {
                // 封禁期内不再计数
                return true;
            }
        }

        if now.duration_since(rec.first_fail) > self.window_time {
            // 窗口过期, 重新开始计数
            rec.count = 1;
            rec.first_fail = now;
            rec.blocked_at = None;
            return false;
        }

        rec.count += 1;
        if rec.count >= self.max_failures {
            rec.blocked_at = Some(now);
            let count = rec.count;
            let blocked = blocked_in(&records, self.block_time, now);
            tracing::warn!(
                "blocked {} after {} auth failures (block {}s), currently blocked: {:?}",
                ip,
                count,
                self.block_time.as_secs(),
                blocked
            );
            return true;
        }
        false
    }

    /// 认证成功, 清除该 IP 的全部记录; 幂等
    pub fn record_success(&self, ip: &str) {
        self.records.lock().remove(ip);
    }

    /// 当前处于封禁状态的 IP 列表, 诊断用
    pub fn blocked_ips(&self) -> Vec<String> {
        blocked_in(&self.records.lock(), self.block_time, Instant::now())
    }

    /// 驱逐过期记录: 封禁已结束的, 以及无封禁且首次失败早于
    /// 两倍窗口的
    pub fn evict(&self) {
        self.evict_at(Instant::now());
    }

    fn evict_at(&self, now: Instant) {
        self.records.lock().retain(|_, rec| match rec.blocked_at {
            Some(blocked_at) => now.duration_since(blocked_at) <= self.block_time,
            None => now.duration_since(rec.first_fail) <= self.window_time * 2,
        });
    }
}

fn blocked_in(
    records: &HashMap<String, FailureRecord>,
    block_time: Duration,
    now: Instant,
) -> Vec<String> {
    records
        .iter()
        .filter(|(_, rec)| match rec.blocked_at {
            Some(blocked_at) => now.duration_since(blocked_at) < block_time,
            None => false,
        })
        .map(|(ip, _)| ip.clone())
        .collect()
}

fn positive_secs(secs: i64) -> Option<Duration> {
    if secs > 0 {
        Some(Duration::from_secs(secs as u64))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_failures: i64, block_time: i64, window_time: i64) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            max_failures,
            block_time,
            window_time,
        })
    }

    #[test]
    fn test_defaults_on_invalid_config() {
        let rl = limiter(0, -1, 0);
        assert_eq!(rl.max_failures, 5);
        assert_eq!(rl.block_time, DEFAULT_BLOCK_TIME);
        assert_eq!(rl.window_time, DEFAULT_WINDOW_TIME);
    }

    #[test]
    fn test_blocks_at_exactly_max_failures() {
        let rl = limiter(3, 900, 300);
        let now = Instant::now();
        assert!(!rl.record_failure_at("1.2.3.4", now));
        assert!(!rl.record_failure_at("1.2.3.4", now));
        assert!(!rl.is_blocked_at("1.2.3.4", now));
        // 第 3 次触发封禁
        assert!(rl.record_failure_at("1.2.3.4", now));
        assert!(rl.is_blocked_at("1.2.3.4", now));
        // 其他 IP 不受影响
        assert!(!rl.is_blocked_at("5.6.7.8", now));
    }

    #[test]
    fn test_block_expires_after_block_time() {
        let rl = limiter(1, 900, 300);
        let now = Instant::now();
        assert!(rl.record_failure_at("1.2.3.4", now));
        // 恰好 blockTime 后不再封禁
        assert!(!rl.is_blocked_at("1.2.3.4", now + Duration::from_secs(900)));
        assert!(rl.is_blocked_at("1.2.3.4", now + Duration::from_secs(899)));
    }

    #[test]
    fn test_window_reset() {
        let rl = limiter(3, 900, 300);
        let now = Instant::now();
        rl.record_failure_at("1.2.3.4", now);
        rl.record_failure_at("1.2.3.4", now);
        // 窗口过期后重新计数, 不会累计到封禁
        let later = now + Duration::from_secs(301);
        assert!(!rl.record_failure_at("1.2.3.4", later));
        assert!(!rl.record_failure_at("1.2.3.4", later));
        assert!(rl.record_failure_at("1.2.3.4", later));
    }

    #[test]
    fn test_blocked_does_not_increment() {
        let rl = limiter(2, 900, 300);
        let now = Instant::now();
        rl.record_failure_at("1.2.3.4", now);
        assert!(rl.record_failure_at("1.2.3.4", now));
        // 封禁期内的失败保持计数不变
        assert!(rl.record_failure_at("1.2.3.4", now + Duration::from_secs(10)));
        assert_eq!(rl.records.lock().get("1.2.3.4").unwrap().count, 2);
    }

    #[test]
    fn test_success_clears_record() {
        let rl = limiter(2, 900, 300);
        let now = Instant::now();
        rl.record_failure_at("1.2.3.4", now);
        assert!(rl.record_failure_at("1.2.3.4", now));
        rl.record_success("1.2.3.4");
        assert!(!rl.is_blocked_at("1.2.3.4", now));
        // 幂等
        rl.record_success("1.2.3.4");
        assert!(!rl.record_failure_at("1.2.3.4", now));
    }

    #[test]
    fn test_evict() {
        let rl = limiter(1, 900, 300);
        let now = Instant::now();
        rl.record_failure_at("blocked-expired", now);
        rl.record_failure_at("still-blocked", now + Duration::from_secs(1000));
        {
            let mut records = rl.records.lock();
            records.insert(
                "stale".into(),
                FailureRecord {
                    count: 1,
                    first_fail: now,
                    blocked_at: None,
                },
            );
        }
        // blocked-expired 的封禁已超时 901s; stale 的首败超过两倍窗口
        rl.evict_at(now + Duration::from_secs(1802));
        let records = rl.records.lock();
        assert!(!records.contains_key("blocked-expired"));
        assert!(!records.contains_key("stale"));
        assert!(records.contains_key("still-blocked"));
    }

    #[test]
    fn test_blocked_ips_listing() {
        let rl = limiter(1, 900, 300);
        rl.record_failure("1.2.3.4");
        rl.record_failure("5.6.7.8");
        let mut blocked = rl.blocked_ips();
        blocked.sort();
        assert_eq!(blocked, vec!["1.2.3.4".to_string(), "5.6.7.8".to_string()]);
    }
}
