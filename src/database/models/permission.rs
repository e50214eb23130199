// 用户权限与配额实体

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 权限标签
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PermissionTag {
    /// 管理后台
    AdminPanel,
    /// 允许签发自己的访问码
    AccessCode,
    /// 允许发起对话
    Chat,
}

impl PermissionTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionTag::AdminPanel => "admin_panel",
            PermissionTag::AccessCode => "access_code",
            PermissionTag::Chat => "chat",
        }
    }
}

impl FromStr for PermissionTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin_panel" => Ok(PermissionTag::AdminPanel),
            "access_code" => Ok(PermissionTag::AccessCode),
            "chat" => Ok(PermissionTag::Chat),
            other => Err(format!("unknown permission: {other}")),
        }
    }
}

impl fmt::Display for PermissionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 配额限制类型，token 与费用二选一
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LimitType {
    #[default]
    None,
    Token,
    Cost,
}

impl LimitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitType::None => "none",
            LimitType::Token => "token",
            LimitType::Cost => "cost",
        }
    }
}

impl FromStr for LimitType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(LimitType::None),
            "token" => Ok(LimitType::Token),
            "cost" => Ok(LimitType::Cost),
            other => Err(format!("unknown limit type: {other}")),
        }
    }
}

/// 配额重置周期
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LimitPeriod {
    #[default]
    Daily,
    Monthly,
    Quarterly,
    Yearly,
}

impl LimitPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitPeriod::Daily => "daily",
            LimitPeriod::Monthly => "monthly",
            LimitPeriod::Quarterly => "quarterly",
            LimitPeriod::Yearly => "yearly",
        }
    }
}

impl FromStr for LimitPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(LimitPeriod::Daily),
            "monthly" => Ok(LimitPeriod::Monthly),
            "quarterly" => Ok(LimitPeriod::Quarterly),
            "yearly" => Ok(LimitPeriod::Yearly),
            other => Err(format!("unknown limit period: {other}")),
        }
    }
}

/// 用户权限记录，与用户一一对应
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserPermission {
    pub user_id: Uuid,
    pub permissions: BTreeSet<PermissionTag>,
    pub limit_type: LimitType,
    pub limit_period: LimitPeriod,
    pub token_limit: Option<i64>,
    pub cost_limit: Option<f64>,
    pub token_used: i64,
    pub cost_used: f64,
    pub last_reset_at: DateTime<Utc>,
    /// 允许使用的模型；None 表示不限制
    pub allowed_models: Option<Vec<String>>,
    pub updated_at: DateTime<Utc>,
}

impl UserPermission {
    /// 不限额的默认权限
    pub fn unrestricted(user_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            permissions: BTreeSet::from([PermissionTag::Chat]),
            limit_type: LimitType::None,
            limit_period: LimitPeriod::default(),
            token_limit: None,
            cost_limit: None,
            token_used: 0,
            cost_used: 0.0,
            last_reset_at: now,
            allowed_models: None,
            updated_at: now,
        }
    }

    pub fn has(&self, tag: PermissionTag) -> bool {
        self.permissions.contains(&tag)
    }

    pub fn allows_model(&self, model_id: &str) -> bool {
        self.allowed_models
            .as_ref()
            .is_none_or(|models| models.iter().any(|m| m == model_id))
    }
}

/// 把数据库中的标签解析为权限集合，忽略无法识别的标签
pub fn parse_permission_tags<I, S>(tags: I) -> BTreeSet<PermissionTag>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tags.into_iter()
        .filter_map(|tag| match tag.as_ref().parse() {
            Ok(tag) => Some(tag),
            Err(e) => {
                tracing::warn!("Ignoring stored permission tag: {}", e);
                None
            }
        })
        .collect()
}
