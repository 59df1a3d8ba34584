//! 订阅表
//!
//! 过滤器 -> 订阅者集合。路由时对每个客户端取其命中过滤器中
//! 最高的授予 QoS。

use std::collections::HashMap;

use mqttbytes::QoS;
use parking_lot::RwLock;

use super::topic;

#[derive(Default)]
pub struct SubscriptionStore {
    filters: RwLock<HashMap<String, HashMap<String, QoS>>>,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self {
            filters: RwLock::new(HashMap::new()),
        }
    }

    pub fn add(&self, filter: &str, client_id: &str, qos: QoS) {
        self.filters
            .write()
            .entry(filter.to_string())
            .or_default()
            .insert(client_id.to_string(), qos);
    }

    pub fn remove(&self, filter: &str, client_id: &str) {
        let mut filters = self.filters.write();
        if let Some(subs) = filters.get_mut(filter) {
            subs.remove(client_id);
            if subs.is_empty() {
                filters.remove(filter);
            }
        }
    }

    pub fn remove_client(&self, client_id: &str) {
        let mut filters = self.filters.write();
        filters.retain(|_, subs| {
            subs.remove(client_id);
            !subs.is_empty()
        });
    }

    /// 命中主题的订阅者, 每个客户端返回其最高授予 QoS
    pub fn matches(&self, topic_name: &str) -> Vec<(String, QoS)> {
        let filters = self.filters.read();
        let mut best: HashMap<&str, QoS> = HashMap::new();
        for (filter, subs) in filters.iter() {
            if !topic::matches(topic_name, filter) {
                continue;
            }
            for (client_id, qos) in subs {
                let entry = best.entry(client_id.as_str()).or_insert(QoS::AtMostOnce);
                if (*qos as u8) > (*entry as u8) {
                    *entry = *qos;
                }
            }
        }
        best.into_iter()
            .map(|(id, qos)| (id.to_string(), qos))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_picks_highest_qos() {
        let store = SubscriptionStore::new();
        store.add("notice/#", "c1", QoS::AtMostOnce);
        store.add("notice/alert", "c1", QoS::ExactlyOnce);
        store.add("notice/+", "c2", QoS::AtLeastOnce);

        let mut hits = store.matches("notice/alert");
        hits.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            hits,
            vec![
                ("c1".to_string(), QoS::ExactlyOnce),
                ("c2".to_string(), QoS::AtLeastOnce)
            ]
        );
    }

    #[test]
    fn test_remove_client_clears_all_filters() {
        let store = SubscriptionStore::new();
        store.add("a/#", "c1", QoS::AtMostOnce);
        store.add("b/#", "c1", QoS::AtMostOnce);
        store.add("a/#", "c2", QoS::AtMostOnce);

        store.remove_client("c1");
        assert_eq!(store.matches("a/x"), vec![("c2".to_string(), QoS::AtMostOnce)]);
        assert!(store.matches("b/x").is_empty());
    }
}
