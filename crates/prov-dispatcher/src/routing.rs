//! Realm/topic routing table.
//!
//! Built in one go from the full subscription list and never mutated
//! afterwards; the dispatcher swaps in a new table instead.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use prov_core::{Subscription, topic_regex};
use regex::Regex;
use tracing::warn;

struct TopicRoute {
    regex: Regex,
    subscribers: BTreeSet<String>,
}

#[derive(Default)]
pub struct RoutingTable {
    realms: HashMap<String, Vec<TopicRoute>>,
}

impl RoutingTable {
    pub fn from_subscriptions<'a>(subscriptions: impl IntoIterator<Item = &'a Subscription>) -> Self {
        // realm -> pattern -> subscribers
        let mut grouped: BTreeMap<&str, BTreeMap<&str, BTreeSet<String>>> = BTreeMap::new();
        for subscription in subscriptions {
            for rt in &subscription.realms_topics {
                grouped
                    .entry(rt.realm.as_str())
                    .or_default()
                    .entry(rt.topic.as_str())
                    .or_default()
                    .insert(subscription.name.clone());
            }
        }

        let mut realms = HashMap::new();
        for (realm, patterns) in grouped {
            let mut routes = Vec::with_capacity(patterns.len());
            for (pattern, subscribers) in patterns {
                match topic_regex(pattern) {
                    Ok(regex) => routes.push(TopicRoute { regex, subscribers }),
                    Err(e) => warn!(realm, pattern, error = %e, ?subscribers, "skipping unusable topic pattern"),
                }
            }
            realms.insert(realm.to_string(), routes);
        }
        Self { realms }
    }

    /// Subscribers with a pattern in `realm` that matches all of `topic`.
    pub fn lookup(&self, realm: &str, topic: &str) -> BTreeSet<String> {
        let Some(routes) = self.realms.get(realm) else {
            return BTreeSet::new();
        };
        routes
            .iter()
            .filter(|route| route.regex.is_match(topic))
            .flat_map(|route| route.subscribers.iter().cloned())
            .collect()
    }

    /// Number of distinct (realm, pattern) routes.
    pub fn len(&self) -> usize {
        self.realms.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prov_core::{FillQueueStatus, RealmTopic};

    fn sub(name: &str, rts: &[(&str, &str)]) -> Subscription {
        Subscription {
            name: name.into(),
            realms_topics: rts.iter().map(|(r, t)| RealmTopic::new(*r, *t)).collect(),
            request_prefill: false,
            prefill_queue_status: FillQueueStatus::Done,
        }
    }

    #[test]
    fn test_full_match_only() {
        let subs = [sub("a", &[("udm", "users/user")])];
        let table = RoutingTable::from_subscriptions(&subs);
        assert_eq!(table.lookup("udm", "users/user").len(), 1);
        assert!(table.lookup("udm", "users/user2").is_empty());
        assert!(table.lookup("udm", "xusers/user").is_empty());
        assert!(table.lookup("ldap", "users/user").is_empty());
    }

    #[test]
    fn test_union_over_patterns() {
        let subs = [
            sub("a", &[("udm", "users/.*")]),
            sub("b", &[("udm", "users/user"), ("udm", "groups/group")]),
            sub("c", &[("udm", "users/user")]),
        ];
        let table = RoutingTable::from_subscriptions(&subs);
        assert_eq!(table.len(), 3);
        let hits: Vec<_> = table.lookup("udm", "users/user").into_iter().collect();
        assert_eq!(hits, ["a", "b", "c"]);
        let hits: Vec<_> = table.lookup("udm", "groups/group").into_iter().collect();
        assert_eq!(hits, ["b"]);
    }

    #[test]
    fn test_bad_pattern_is_skipped() {
        let subs = [sub("a", &[("udm", "users/(")]), sub("b", &[("udm", ".*")])];
        let table = RoutingTable::from_subscriptions(&subs);
        assert_eq!(table.len(), 1);
        let hits: Vec<_> = table.lookup("udm", "users/(").into_iter().collect();
        assert_eq!(hits, ["b"]);
    }

    #[test]
    fn empty_table() {
        let table = RoutingTable::default();
        assert!(table.is_empty());
        assert!(table.lookup("udm", "x").is_empty());
    }
}
