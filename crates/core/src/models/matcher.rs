use serde::{Deserialize, Serialize};

use crate::models::Keyed;

/// 字符串比较方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StringOperator {
    Equals,
    StartsWith,
    EndsWith,
    Contains,
    Anything,
}

/// 对分组名或键名做字符串匹配
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StringMatcher {
    pub operator: StringOperator,
    pub value: String,
}

/// 按分组匹配时使用的别名
pub type GroupMatcher = StringMatcher;

impl StringMatcher {
    pub fn equals(value: impl Into<String>) -> Self {
        Self::with(StringOperator::Equals, value)
    }

    pub fn starts_with(value: impl Into<String>) -> Self {
        Self::with(StringOperator::StartsWith, value)
    }

    pub fn ends_with(value: impl Into<String>) -> Self {
        Self::with(StringOperator::EndsWith, value)
    }

    pub fn contains(value: impl Into<String>) -> Self {
        Self::with(StringOperator::Contains, value)
    }

    pub fn any() -> Self {
        Self::with(StringOperator::Anything, "")
    }

    fn with(operator: StringOperator, value: impl Into<String>) -> Self {
        Self {
            operator,
            value: value.into(),
        }
    }

    pub fn is_match(&self, candidate: &str) -> bool {
        match self.operator {
            StringOperator::Equals => candidate == self.value,
            StringOperator::StartsWith => candidate.starts_with(&self.value),
            StringOperator::EndsWith => candidate.ends_with(&self.value),
            StringOperator::Contains => candidate.contains(&self.value),
            StringOperator::Anything => true,
        }
    }

    /// 精确匹配时返回被匹配的值
    pub fn exact_value(&self) -> Option<&str> {
        match self.operator {
            StringOperator::Equals => Some(&self.value),
            _ => None,
        }
    }
}

/// 监听器使用的键匹配器
#[derive(Debug, Clone, PartialEq)]
pub enum Matcher<K> {
    Everything,
    Key(K),
    Group(StringMatcher),
    Name(StringMatcher),
    And(Box<Matcher<K>>, Box<Matcher<K>>),
    Or(Box<Matcher<K>>, Box<Matcher<K>>),
    Not(Box<Matcher<K>>),
}

impl<K: Keyed + PartialEq> Matcher<K> {
    pub fn is_match(&self, key: &K) -> bool {
        match self {
            Matcher::Everything => true,
            Matcher::Key(expected) => expected == key,
            Matcher::Group(m) => m.is_match(key.group()),
            Matcher::Name(m) => m.is_match(key.name()),
            Matcher::And(a, b) => a.is_match(key) && b.is_match(key),
            Matcher::Or(a, b) => a.is_match(key) || b.is_match(key),
            Matcher::Not(inner) => !inner.is_match(key),
        }
    }

    pub fn and(self, other: Matcher<K>) -> Matcher<K> {
        Matcher::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Matcher<K>) -> Matcher<K> {
        Matcher::Or(Box::new(self), Box::new(other))
    }

    pub fn negate(self) -> Matcher<K> {
        Matcher::Not(Box::new(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobKey;

    #[test]
    fn test_string_operators() {
        assert!(GroupMatcher::equals("reports").is_match("reports"));
        assert!(!GroupMatcher::equals("reports").is_match("reports-daily"));
        assert!(GroupMatcher::starts_with("rep").is_match("reports"));
        assert!(GroupMatcher::ends_with("ly").is_match("daily"));
        assert!(GroupMatcher::contains("ai").is_match("daily"));
        assert!(GroupMatcher::any().is_match(""));
    }

    #[test]
    fn test_composite_matchers() {
        let key = JobKey::new("cleanup", "maintenance");
        let matcher = Matcher::Group(GroupMatcher::equals("maintenance"))
            .and(Matcher::Name(StringMatcher::starts_with("clean")));
        assert!(matcher.is_match(&key));
        assert!(!matcher.clone().negate().is_match(&key));

        let other = Matcher::Key(JobKey::new("x", "y")).or(Matcher::Everything);
        assert!(other.is_match(&key));
    }
}
