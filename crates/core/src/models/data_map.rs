use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 作业/触发器携带的键值数据
///
/// 以有序映射保存，结构相等即视为未变更。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobDataMap(BTreeMap<String, Value>);

impl JobDataMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(Value::as_i64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// 合并另一份数据，同名键以 `other` 为准
    pub fn merge(&mut self, other: &JobDataMap) {
        for (key, value) in other.iter() {
            self.0.insert(key.clone(), value.clone());
        }
    }
}

impl From<BTreeMap<String, Value>> for JobDataMap {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, Value)> for JobDataMap {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_prefers_other() {
        let mut job = JobDataMap::new();
        job.put("a", 1);
        job.put("b", "job");
        let mut trigger = JobDataMap::new();
        trigger.put("b", "trigger");

        job.merge(&trigger);
        assert_eq!(job.get_i64("a"), Some(1));
        assert_eq!(job.get_str("b"), Some("trigger"));
    }

    #[test]
    fn test_structural_equality() {
        let mut a = JobDataMap::new();
        a.put("x", json!({"k": [1, 2]}));
        let mut b = JobDataMap::new();
        b.put("x", json!({"k": [1, 2]}));
        assert_eq!(a, b);
        b.put("y", true);
        assert_ne!(a, b);
    }
}
