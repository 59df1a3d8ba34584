//! 主题过滤器匹配
//!
//! 支持单层通配 `+` 与多层通配 `#`。以 `$` 开头的系统主题
//! 不会被根部的通配符匹配到。

/// 发布主题是否合法: 非空、无通配符、长度受限
pub fn valid_topic(topic: &str) -> bool {
    !topic.is_empty() && topic.len() <= 65535 && !topic.contains(['+', '#'])
}

/// 订阅过滤器是否合法
pub fn valid_filter(filter: &str) -> bool {
    if filter.is_empty() || filter.len() > 65535 {
        return false;
    }
    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('+') && *level != "+" {
            return false;
        }
        if level.contains('#') && (*level != "#" || i != levels.len() - 1) {
            return false;
        }
    }
    true
}

/// 主题是否匹配过滤器
pub fn matches(topic: &str, filter: &str) -> bool {
    // 系统主题只能被显式的 $ 前缀过滤器匹配
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            // "#" 覆盖剩余所有层，"a/#" 也匹配父层 "a"
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
