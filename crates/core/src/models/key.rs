use std::fmt;

use serde::{Deserialize, Serialize};

/// 未指定分组时使用的默认分组名
pub const DEFAULT_GROUP: &str = "DEFAULT";

/// 作业键与触发器键的公共访问接口，供匹配器使用
pub trait Keyed {
    fn name(&self) -> &str;
    fn group(&self) -> &str;
}

macro_rules! define_key {
    ($(#[$meta:meta])* $ty:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $ty {
            // 字段顺序即排序顺序：先分组，后名称
            group: String,
            name: String,
        }

        impl $ty {
            /// 创建键，空分组归入默认分组
            pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
                let group = group.into();
                Self {
                    name: name.into(),
                    group: if group.is_empty() {
                        DEFAULT_GROUP.to_string()
                    } else {
                        group
                    },
                }
            }

            pub fn with_default_group(name: impl Into<String>) -> Self {
                Self::new(name, DEFAULT_GROUP)
            }

            /// 在给定分组中生成一个唯一名称的键
            pub fn unique(group: impl Into<String>) -> Self {
                Self::new(uuid::Uuid::new_v4().simple().to_string(), group)
            }

            pub fn name(&self) -> &str {
                &self.name
            }

            pub fn group(&self) -> &str {
                &self.group
            }
        }

        impl Keyed for $ty {
            fn name(&self) -> &str {
                &self.name
            }

            fn group(&self) -> &str {
                &self.group
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}.{}", self.group, self.name)
            }
        }
    };
}

define_key!(
    /// 作业标识 (名称, 分组)
    JobKey
);

define_key!(
    /// 触发器标识 (名称, 分组)
    TriggerKey
);
