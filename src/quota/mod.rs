//! 配额记账
//!
//! 周期重置、额度检查、用量估算与费用计算。这里只有纯函数，
//! 存储层在自己的事务内调用它们来更新计数器。

use chrono::{DateTime, Duration, Months, Utc};
use serde::Serialize;

use crate::database::models::{ChatModel, LimitPeriod, LimitType, UserPermission};

/// 单次调用可上报的最大 token 数
pub const MAX_REPORTED_TOKENS: i64 = 10_000_000;

/// 一个周期的结束时间
pub fn period_end(last_reset_at: DateTime<Utc>, period: LimitPeriod) -> DateTime<Utc> {
    let months = match period {
        LimitPeriod::Daily => return last_reset_at + Duration::hours(24),
        LimitPeriod::Monthly => 1,
        LimitPeriod::Quarterly => 3,
        LimitPeriod::Yearly => 12,
    };
    last_reset_at
        .checked_add_months(Months::new(months))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// 超过周期时清零计数器并把重置时间推进到 now。返回是否发生了重置。
pub fn apply_due_reset(permission: &mut UserPermission, now: DateTime<Utc>) -> bool {
    if now <= period_end(permission.last_reset_at, permission.limit_period) {
        return false;
    }
    permission.token_used = 0;
    permission.cost_used = 0.0;
    permission.last_reset_at = now;
    permission.updated_at = now;
    true
}

pub fn is_exhausted(permission: &UserPermission) -> bool {
    match permission.limit_type {
        LimitType::None => false,
        LimitType::Token => permission
            .token_limit
            .is_some_and(|limit| permission.token_used >= limit),
        LimitType::Cost => permission
            .cost_limit
            .is_some_and(|limit| permission.cost_used >= limit),
    }
}

/// 先处理到期重置，再累加本次用量
pub fn charge(permission: &mut UserPermission, tokens: i64, cost: Option<f64>, now: DateTime<Utc>) {
    apply_due_reset(permission, now);
    permission.token_used = permission.token_used.saturating_add(tokens.max(0));
    if let Some(cost) = cost.filter(|c| c.is_finite() && *c > 0.0) {
        permission.cost_used += cost;
    }
    permission.updated_at = now;
}

/// 粗略估算：每 4 个字符约 1 个 token
pub fn estimate_tokens(text: &str) -> i64 {
    let chars = text.chars().count() as i64;
    chars.saturating_add(3) / 4
}

/// 上报的 token 数必须在 0..=MAX_REPORTED_TOKENS 内
pub fn reported_tokens_valid(tokens: Option<i64>) -> bool {
    tokens.is_none_or(|t| (0..=MAX_REPORTED_TOKENS).contains(&t))
}

pub fn derive_cost(model: &ChatModel, prompt_tokens: i64, completion_tokens: i64) -> Option<f64> {
    if model.input_price_per_1k.is_none() && model.output_price_per_1k.is_none() {
        return None;
    }
    let input = model.input_price_per_1k.unwrap_or(0.0) * prompt_tokens as f64 / 1000.0;
    let output = model.output_price_per_1k.unwrap_or(0.0) * completion_tokens as f64 / 1000.0;
    Some(input + output)
}

/// 一次调用的 token 数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub is_estimated: bool,
}

impl ResolvedUsage {
    pub fn total(&self) -> i64 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

/// 上游给出用量时直接使用，否则按文本估算并标记
pub fn resolve_usage(
    reported_prompt: Option<i64>,
    reported_completion: Option<i64>,
    prompt_text: &str,
    completion_text: &str,
) -> ResolvedUsage {
    match (reported_prompt, reported_completion) {
        (Some(prompt_tokens), Some(completion_tokens)) => ResolvedUsage {
            prompt_tokens,
            completion_tokens,
            is_estimated: false,
        },
        (prompt, completion) => ResolvedUsage {
            prompt_tokens: prompt.unwrap_or_else(|| estimate_tokens(prompt_text)),
            completion_tokens: completion.unwrap_or_else(|| estimate_tokens(completion_text)),
            is_estimated: true,
        },
    }
}

/// 配额状态（响应）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaStatus {
    pub limit_type: LimitType,
    pub limit_period: LimitPeriod,
    pub token_limit: Option<i64>,
    pub cost_limit: Option<f64>,
    pub token_used: i64,
    pub cost_used: f64,
    pub last_reset_at: DateTime<Utc>,
    pub next_reset_at: DateTime<Utc>,
    pub exhausted: bool,
}

impl From<&UserPermission> for QuotaStatus {
    fn from(permission: &UserPermission) -> Self {
        Self {
            limit_type: permission.limit_type,
            limit_period: permission.limit_period,
            token_limit: permission.token_limit,
            cost_limit: permission.cost_limit,
            token_used: permission.token_used,
            cost_used: permission.cost_used,
            last_reset_at: permission.last_reset_at,
            next_reset_at: period_end(permission.last_reset_at, permission.limit_period),
            exhausted: is_exhausted(permission),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn permission_at(last_reset_at: DateTime<Utc>, period: LimitPeriod) -> UserPermission {
        let mut permission = UserPermission::unrestricted(Uuid::new_v4(), last_reset_at);
        permission.limit_type = LimitType::Token;
        permission.limit_period = period;
        permission.token_limit = Some(1_000);
        permission.token_used = 600;
        permission.cost_used = 1.5;
        permission
    }

    #[test]
    fn test_daily_reset_only_after_boundary() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let mut permission = permission_at(start, LimitPeriod::Daily);

        assert!(!apply_due_reset(&mut permission, start + Duration::hours(23)));
        assert!(!apply_due_reset(&mut permission, start + Duration::hours(24)));
        assert_eq!(permission.token_used, 600);

        let later = start + Duration::hours(24) + Duration::seconds(1);
        assert!(apply_due_reset(&mut permission, later));
        assert_eq!(permission.token_used, 0);
        assert_eq!(permission.cost_used, 0.0);
        assert_eq!(permission.last_reset_at, later);
    }

    #[test]
    fn test_monthly_period_uses_calendar_months() {
        let start = Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap();
        // 2024 是闰年，1 月 31 日加一个月落在 2 月 29 日
        assert_eq!(
            period_end(start, LimitPeriod::Monthly),
            Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap()
        );
        assert_eq!(
            period_end(start, LimitPeriod::Quarterly),
            Utc.with_ymd_and_hms(2024, 4, 30, 0, 0, 0).unwrap()
        );
        assert_eq!(
            period_end(start, LimitPeriod::Yearly),
            Utc.with_ymd_and_hms(2025, 1, 31, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_monthly_reset() {
        let start = Utc.with_ymd_and_hms(2024, 5, 10, 0, 0, 0).unwrap();
        let mut permission = permission_at(start, LimitPeriod::Monthly);
        assert!(!apply_due_reset(
            &mut permission,
            Utc.with_ymd_and_hms(2024, 6, 9, 23, 59, 59).unwrap()
        ));
        assert!(apply_due_reset(
            &mut permission,
            Utc.with_ymd_and_hms(2024, 6, 10, 0, 0, 1).unwrap()
        ));
        assert_eq!(permission.token_used, 0);
    }

    #[test]
    fn test_charge_resets_before_applying_usage() {
        let start = Utc.with_ymd_and_hms(2024, 5, 10, 0, 0, 0).unwrap();
        let mut permission = permission_at(start, LimitPeriod::Daily);
        charge(&mut permission, 50, Some(0.25), start + Duration::days(2));
        assert_eq!(permission.token_used, 50);
        assert_eq!(permission.cost_used, 0.25);

        charge(&mut permission, 25, None, start + Duration::days(2));
        assert_eq!(permission.token_used, 75);
    }

    #[test]
    fn test_charge_saturates_instead_of_wrapping() {
        let now = Utc::now();
        let mut permission = permission_at(now, LimitPeriod::Daily);
        permission.token_used = i64::MAX - 1;
        charge(&mut permission, 10, Some(f64::NAN), now);
        assert_eq!(permission.token_used, i64::MAX);
        assert_eq!(permission.cost_used, 1.5);
        assert!(is_exhausted(&permission));

        let usage = ResolvedUsage {
            prompt_tokens: i64::MAX,
            completion_tokens: 1,
            is_estimated: false,
        };
        assert_eq!(usage.total(), i64::MAX);
    }

    #[test]
    fn test_reported_token_bounds() {
        assert!(reported_tokens_valid(None));
        assert!(reported_tokens_valid(Some(0)));
        assert!(reported_tokens_valid(Some(MAX_REPORTED_TOKENS)));
        assert!(!reported_tokens_valid(Some(MAX_REPORTED_TOKENS + 1)));
        assert!(!reported_tokens_valid(Some(-1)));
        assert!(!reported_tokens_valid(Some(i64::MAX)));
    }

    #[test]
    fn test_exhaustion_by_limit_type() {
        let now = Utc::now();
        let mut permission = permission_at(now, LimitPeriod::Daily);
        assert!(!is_exhausted(&permission));
        permission.token_used = 1_000;
        assert!(is_exhausted(&permission));

        permission.limit_type = LimitType::Cost;
        permission.cost_limit = Some(2.0);
        assert!(!is_exhausted(&permission));
        permission.cost_used = 2.0;
        assert!(is_exhausted(&permission));

        permission.limit_type = LimitType::None;
        assert!(!is_exhausted(&permission));
    }

    #[test]
    fn test_usage_estimation() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);

        let reported = resolve_usage(Some(10), Some(20), "", "");
        assert!(!reported.is_estimated);
        assert_eq!(reported.total(), 30);

        let estimated = resolve_usage(None, None, "hello world!", "ok");
        assert!(estimated.is_estimated);
        assert_eq!(estimated.prompt_tokens, 3);
        assert_eq!(estimated.completion_tokens, 1);
    }

    #[test]
    fn test_cost_derivation() {
        let mut model = ChatModel {
            id: "m".into(),
            provider_id: "p".into(),
            name: "m".into(),
            display_name: "M".into(),
            input_price_per_1k: Some(0.5),
            output_price_per_1k: Some(1.5),
        };
        let cost = derive_cost(&model, 2_000, 1_000).unwrap();
        assert!((cost - 2.5).abs() < f64::EPSILON);

        model.input_price_per_1k = None;
        model.output_price_per_1k = None;
        assert_eq!(derive_cost(&model, 2_000, 1_000), None);
    }
}
