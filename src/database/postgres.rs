// PostgreSQL 存储实现

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::models::permission::parse_permission_tags;
use super::models::{
    AccessCode, ChatModel, CodeRedemption, Conversation, InviteCode, Message, Provider,
    TokenUsage, User, UserFilter, UserPermission, UserSettings, UserStats,
};
use super::{CascadeStep, NewAccount, SeedData, Store, StoreError, StoreResult, TableCount};
use crate::quota;

const SCHEMA_SQL: &str = include_str!("../../migrations/0001_schema.sql");
const DROP_SQL: &str = include_str!("../../migrations/drop_all.sql");

const TABLES: [&str; 10] = [
    "users",
    "user_settings",
    "user_permissions",
    "invite_codes",
    "access_codes",
    "providers",
    "models",
    "conversations",
    "messages",
    "token_usage",
];

const USER_COLUMNS: &str = "id, username, email, password_hash, role, is_active, host_user_id, \
     invite_code_id, access_code_id, created_at, updated_at";
const PERMISSION_COLUMNS: &str = "user_id, permissions, limit_type, limit_period, token_limit, \
     cost_limit, token_used, cost_used, last_reset_at, allowed_models, updated_at";
const INVITE_COLUMNS: &str =
    "id, code, created_by, max_uses, current_uses, is_used, expires_at, created_at";
const ACCESS_COLUMNS: &str = "id, code, created_by, is_active, expires_at, max_uses, \
     current_uses, allowed_models, created_at";
const USAGE_COLUMNS: &str = "id, user_id, conversation_id, message_id, provider_id, model_id, \
     prompt_tokens, completion_tokens, total_tokens, is_estimated, cost, created_at";

#[derive(FromRow)]
struct UserRow {
    id: Uuid,
    username: String,
    email: Option<String>,
    password_hash: Option<String>,
    role: String,
    is_active: bool,
    host_user_id: Option<Uuid>,
    invite_code_id: Option<Uuid>,
    access_code_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(User {
            id: row.id,
            username: row.username,
            email: row.email,
            password_hash: row.password_hash,
            role: row.role.parse().map_err(StoreError::Corrupt)?,
            is_active: row.is_active,
            host_user_id: row.host_user_id,
            invite_code_id: row.invite_code_id,
            access_code_id: row.access_code_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct SettingsRow {
    user_id: Uuid,
    theme: String,
    model_group_order: Vec<String>,
    default_model_id: Option<String>,
}

impl TryFrom<SettingsRow> for UserSettings {
    type Error = StoreError;

    fn try_from(row: SettingsRow) -> Result<Self, Self::Error> {
        Ok(UserSettings {
            user_id: row.user_id,
            theme: row.theme.parse().map_err(StoreError::Corrupt)?,
            model_group_order: row.model_group_order,
            default_model_id: row.default_model_id,
        })
    }
}

#[derive(FromRow)]
struct PermissionRow {
    user_id: Uuid,
    permissions: Vec<String>,
    limit_type: String,
    limit_period: String,
    token_limit: Option<i64>,
    cost_limit: Option<f64>,
    token_used: i64,
    cost_used: f64,
    last_reset_at: DateTime<Utc>,
    allowed_models: Option<Vec<String>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PermissionRow> for UserPermission {
    type Error = StoreError;

    fn try_from(row: PermissionRow) -> Result<Self, Self::Error> {
        Ok(UserPermission {
            user_id: row.user_id,
            permissions: parse_permission_tags(&row.permissions),
            limit_type: row.limit_type.parse().map_err(StoreError::Corrupt)?,
            limit_period: row.limit_period.parse().map_err(StoreError::Corrupt)?,
            token_limit: row.token_limit,
            cost_limit: row.cost_limit,
            token_used: row.token_used,
            cost_used: row.cost_used,
            last_reset_at: row.last_reset_at,
            allowed_models: row.allowed_models,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct InviteCodeRow {
    id: Uuid,
    code: String,
    created_by: Uuid,
    max_uses: i32,
    current_uses: i32,
    is_used: bool,
    expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<InviteCodeRow> for InviteCode {
    fn from(row: InviteCodeRow) -> Self {
        InviteCode {
            id: row.id,
            code: row.code,
            created_by: row.created_by,
            max_uses: row.max_uses,
            current_uses: row.current_uses,
            is_used: row.is_used,
            expires_at: row.expires_at,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct AccessCodeRow {
    id: Uuid,
    code: String,
    created_by: Uuid,
    is_active: bool,
    expires_at: Option<DateTime<Utc>>,
    max_uses: Option<i32>,
    current_uses: i32,
    allowed_models: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<AccessCodeRow> for AccessCode {
    fn from(row: AccessCodeRow) -> Self {
        AccessCode {
            id: row.id,
            code: row.code,
            created_by: row.created_by,
            is_active: row.is_active,
            expires_at: row.expires_at,
            max_uses: row.max_uses,
            current_uses: row.current_uses,
            allowed_models: row.allowed_models,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct ProviderRow {
    id: String,
    name: String,
    display_name: String,
}

#[derive(FromRow)]
struct ModelRow {
    id: String,
    provider_id: String,
    name: String,
    display_name: String,
    input_price_per_1k: Option<f64>,
    output_price_per_1k: Option<f64>,
}

impl From<ModelRow> for ChatModel {
    fn from(row: ModelRow) -> Self {
        ChatModel {
            id: row.id,
            provider_id: row.provider_id,
            name: row.name,
            display_name: row.display_name,
            input_price_per_1k: row.input_price_per_1k,
            output_price_per_1k: row.output_price_per_1k,
        }
    }
}

#[derive(FromRow)]
struct ConversationRow {
    id: Uuid,
    user_id: Uuid,
    title: String,
    provider_id: String,
    model_id: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ConversationRow> for Conversation {
    fn from(row: ConversationRow) -> Self {
        Conversation {
            id: row.id,
            user_id: row.user_id,
            title: row.title,
            provider_id: row.provider_id,
            model_id: row.model_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct MessageRow {
    id: Uuid,
    conversation_id: Uuid,
    user_id: Uuid,
    role: String,
    content: String,
    provider_id: String,
    model_id: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for Message {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Message {
            id: row.id,
            conversation_id: row.conversation_id,
            user_id: row.user_id,
            role: row.role.parse().map_err(StoreError::Corrupt)?,
            content: row.content,
            provider_id: row.provider_id,
            model_id: row.model_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct UsageRow {
    id: Uuid,
    user_id: Uuid,
    conversation_id: Option<Uuid>,
    message_id: Option<Uuid>,
    provider_id: String,
    model_id: String,
    prompt_tokens: i64,
    completion_tokens: i64,
    total_tokens: i64,
    is_estimated: bool,
    cost: Option<f64>,
    created_at: DateTime<Utc>,
}

impl From<UsageRow> for TokenUsage {
    fn from(row: UsageRow) -> Self {
        TokenUsage {
            id: row.id,
            user_id: row.user_id,
            conversation_id: row.conversation_id,
            message_id: row.message_id,
            provider_id: row.provider_id,
            model_id: row.model_id,
            prompt_tokens: row.prompt_tokens,
            completion_tokens: row.completion_tokens,
            total_tokens: row.total_tokens,
            is_estimated: row.is_estimated,
            cost: row.cost,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct StatsRow {
    user_id: Uuid,
    conversation_count: i64,
    message_count: i64,
    total_tokens: i64,
}

fn convert_all<R, T>(rows: Vec<R>) -> StoreResult<Vec<T>>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// 级联删除每一步执行的语句，参数 $1 为用户 ID
fn cascade_statements(step: CascadeStep) -> &'static [&'static str] {
    match step {
        CascadeStep::Messages => &[
            "DELETE FROM messages WHERE user_id = $1 \
             OR conversation_id IN (SELECT id FROM conversations WHERE user_id = $1)",
        ],
        CascadeStep::Conversations => &["DELETE FROM conversations WHERE user_id = $1"],
        CascadeStep::TokenUsage => &["DELETE FROM token_usage WHERE user_id = $1"],
        CascadeStep::Settings => &["DELETE FROM user_settings WHERE user_id = $1"],
        CascadeStep::Permissions => &["DELETE FROM user_permissions WHERE user_id = $1"],
        CascadeStep::DetachReferences => &[
            "UPDATE users SET is_active = FALSE, host_user_id = NULL, updated_at = NOW() \
             WHERE host_user_id = $1",
            "UPDATE users SET invite_code_id = NULL \
             WHERE invite_code_id IN (SELECT id FROM invite_codes WHERE created_by = $1)",
            "UPDATE users SET access_code_id = NULL \
             WHERE access_code_id IN (SELECT id FROM access_codes WHERE created_by = $1)",
        ],
        CascadeStep::InviteCodes => &["DELETE FROM invite_codes WHERE created_by = $1"],
        CascadeStep::AccessCodes => &["DELETE FROM access_codes WHERE created_by = $1"],
        CascadeStep::User => &["DELETE FROM users WHERE id = $1"],
    }
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 连接数据库并确保表结构存在
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    conn.execute("SET application_name = 'chat_admin';").await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;

        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        tracing::info!("Database schema is up to date");
        Ok(())
    }

    async fn lock_permission(
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
    ) -> StoreResult<Option<UserPermission>> {
        let row = sqlx::query_as::<_, PermissionRow>(&format!(
            "SELECT {PERMISSION_COLUMNS} FROM user_permissions WHERE user_id = $1 FOR UPDATE"
        ))
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await?;
        row.map(UserPermission::try_from).transpose()
    }

    async fn write_counters(
        tx: &mut Transaction<'_, Postgres>,
        permission: &UserPermission,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE user_permissions
            SET token_used = $2, cost_used = $3, last_reset_at = $4, updated_at = $5
            WHERE user_id = $1
            "#,
        )
        .bind(permission.user_id)
        .bind(permission.token_used)
        .bind(permission.cost_used)
        .bind(permission.last_reset_at)
        .bind(permission.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn redeem(
        tx: &mut Transaction<'_, Postgres>,
        redemption: CodeRedemption,
    ) -> StoreResult<()> {
        // 条件更新保证并发兑换不会超过上限
        let result = match redemption {
            CodeRedemption::Invite(id) => {
                sqlx::query(
                    r#"
                    UPDATE invite_codes
                    SET current_uses = current_uses + 1,
                        is_used = (current_uses + 1 >= max_uses)
                    WHERE id = $1
                      AND NOT is_used
                      AND current_uses < max_uses
                      AND (expires_at IS NULL OR expires_at > NOW())
                    "#,
                )
                .bind(id)
                .execute(&mut **tx)
                .await?
            }
            CodeRedemption::Access(id) => {
                sqlx::query(
                    r#"
                    UPDATE access_codes
                    SET current_uses = current_uses + 1
                    WHERE id = $1
                      AND is_active
                      AND (max_uses IS NULL OR current_uses < max_uses)
                      AND (expires_at IS NULL OR expires_at > NOW())
                    "#,
                )
                .bind(id)
                .execute(&mut **tx)
                .await?
            }
        };
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict("code is no longer usable".into()));
        }
        Ok(())
    }

    async fn insert_user(tx: &mut Transaction<'_, Postgres>, user: &User) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO users ({USER_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
        ))
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.role.as_str())
        .bind(user.is_active)
        .bind(user.host_user_id)
        .bind(user.invite_code_id)
        .bind(user.access_code_id)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| StoreError::from_unique_violation(e, "username or email"))?;
        Ok(())
    }

    async fn upsert_settings<'e, E>(executor: E, settings: &UserSettings) -> StoreResult<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            r#"
            INSERT INTO user_settings (user_id, theme, model_group_order, default_model_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id) DO UPDATE
            SET theme = EXCLUDED.theme,
                model_group_order = EXCLUDED.model_group_order,
                default_model_id = EXCLUDED.default_model_id
            "#,
        )
        .bind(settings.user_id)
        .bind(settings.theme.as_str())
        .bind(&settings.model_group_order)
        .bind(&settings.default_model_id)
        .execute(executor)
        .await?;
        Ok(())
    }

    async fn upsert_permission<'e, E>(executor: E, permission: &UserPermission) -> StoreResult<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let tags: Vec<&str> = permission.permissions.iter().map(|t| t.as_str()).collect();
        sqlx::query(&format!(
            r#"
            INSERT INTO user_permissions ({PERMISSION_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (user_id) DO UPDATE
            SET permissions = EXCLUDED.permissions,
                limit_type = EXCLUDED.limit_type,
                limit_period = EXCLUDED.limit_period,
                token_limit = EXCLUDED.token_limit,
                cost_limit = EXCLUDED.cost_limit,
                token_used = EXCLUDED.token_used,
                cost_used = EXCLUDED.cost_used,
                last_reset_at = EXCLUDED.last_reset_at,
                allowed_models = EXCLUDED.allowed_models,
                updated_at = EXCLUDED.updated_at
            "#
        ))
        .bind(permission.user_id)
        .bind(tags)
        .bind(permission.limit_type.as_str())
        .bind(permission.limit_period.as_str())
        .bind(permission.token_limit)
        .bind(permission.cost_limit)
        .bind(permission.token_used)
        .bind(permission.cost_used)
        .bind(permission.last_reset_at)
        .bind(&permission.allowed_models)
        .bind(permission.updated_at)
        .execute(executor)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn find_user(&self, id: Uuid) -> StoreResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(User::try_from).transpose()
    }

    async fn find_user_by_username(&self, username: &str) -> StoreResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE LOWER(username) = LOWER($1)"
        ))
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        row.map(User::try_from).transpose()
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE LOWER(email) = LOWER($1)"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        row.map(User::try_from).transpose()
    }

    async fn list_users(&self, filter: &UserFilter) -> StoreResult<(Vec<User>, i64)> {
        let role = filter.role.map(|r| r.as_str());
        let rows = sqlx::query_as::<_, UserRow>(&format!(
            r#"
            SELECT {USER_COLUMNS} FROM users
            WHERE ($1::TEXT IS NULL OR role = $1)
              AND ($2::BOOLEAN IS NULL OR is_active = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(role)
        .bind(filter.active)
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM users
            WHERE ($1::TEXT IS NULL OR role = $1)
              AND ($2::BOOLEAN IS NULL OR is_active = $2)
            "#,
        )
        .bind(role)
        .bind(filter.active)
        .fetch_one(&self.pool)
        .await?;

        Ok((convert_all(rows)?, total))
    }

    async fn user_stats(&self, ids: &[Uuid]) -> StoreResult<Vec<UserStats>> {
        let rows = sqlx::query_as::<_, StatsRow>(
            r#"
            SELECT
                u.id AS user_id,
                (SELECT COUNT(*) FROM conversations c WHERE c.user_id = u.id) AS conversation_count,
                (SELECT COUNT(*) FROM messages m WHERE m.user_id = u.id) AS message_count,
                (SELECT COALESCE(SUM(t.total_tokens), 0)::BIGINT
                   FROM token_usage t WHERE t.user_id = u.id) AS total_tokens
            FROM users u
            WHERE u.id = ANY($1)
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| UserStats {
                user_id: row.user_id,
                conversation_count: row.conversation_count,
                message_count: row.message_count,
                total_tokens: row.total_tokens,
            })
            .collect())
    }

    async fn create_account(&self, account: NewAccount) -> StoreResult<User> {
        let mut tx = self.pool.begin().await?;

        if let Some(redemption) = account.redeem {
            Self::redeem(&mut tx, redemption).await?;
        }
        Self::insert_user(&mut tx, &account.user).await?;
        Self::upsert_settings(&mut *tx, &account.settings).await?;
        if let Some(permission) = &account.permission {
            Self::upsert_permission(&mut *tx, permission).await?;
        }

        tx.commit().await?;
        tracing::info!("Created {} account {}", account.user.role, account.user.id);
        Ok(account.user)
    }

    async fn set_user_active(
        &self,
        id: Uuid,
        active: bool,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "UPDATE users SET is_active = $2, updated_at = $3 WHERE id = $1 RETURNING {USER_COLUMNS}"
        ))
        .bind(id)
        .bind(active)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(User::try_from).transpose()
    }

    async fn delete_user_cascade(&self, id: Uuid) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<Uuid> = sqlx::query_scalar("SELECT id FROM users WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Ok(false);
        }

        for step in CascadeStep::ORDER {
            for statement in cascade_statements(step) {
                let result = sqlx::query(statement).bind(id).execute(&mut *tx).await?;
                tracing::debug!("Cascade {:?} affected {} rows", step, result.rows_affected());
            }
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn find_settings(&self, user_id: Uuid) -> StoreResult<Option<UserSettings>> {
        let row = sqlx::query_as::<_, SettingsRow>(
            "SELECT user_id, theme, model_group_order, default_model_id FROM user_settings WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(UserSettings::try_from).transpose()
    }

    async fn save_settings(&self, settings: &UserSettings) -> StoreResult<()> {
        Self::upsert_settings(&self.pool, settings).await
    }

    async fn find_permission(&self, user_id: Uuid) -> StoreResult<Option<UserPermission>> {
        let row = sqlx::query_as::<_, PermissionRow>(&format!(
            "SELECT {PERMISSION_COLUMNS} FROM user_permissions WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(UserPermission::try_from).transpose()
    }

    async fn save_permission(&self, permission: &UserPermission) -> StoreResult<()> {
        Self::upsert_permission(&self.pool, permission).await
    }

    async fn refresh_quota(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<UserPermission>> {
        let mut tx = self.pool.begin().await?;
        let Some(mut permission) = Self::lock_permission(&mut tx, user_id).await? else {
            return Ok(None);
        };
        if quota::apply_due_reset(&mut permission, now) {
            Self::write_counters(&mut tx, &permission).await?;
            tracing::info!("Quota period elapsed, counters reset for {}", user_id);
        }
        tx.commit().await?;
        Ok(Some(permission))
    }

    async fn record_usage(
        &self,
        usage: &TokenUsage,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<UserPermission>> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO token_usage ({USAGE_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        ))
        .bind(usage.id)
        .bind(usage.user_id)
        .bind(usage.conversation_id)
        .bind(usage.message_id)
        .bind(&usage.provider_id)
        .bind(&usage.model_id)
        .bind(usage.prompt_tokens)
        .bind(usage.completion_tokens)
        .bind(usage.total_tokens)
        .bind(usage.is_estimated)
        .bind(usage.cost)
        .bind(usage.created_at)
        .execute(&mut *tx)
        .await?;

        let permission = match Self::lock_permission(&mut tx, usage.user_id).await? {
            Some(mut permission) => {
                quota::charge(&mut permission, usage.total_tokens, usage.cost, now);
                Self::write_counters(&mut tx, &permission).await?;
                Some(permission)
            }
            None => None,
        };

        tx.commit().await?;
        Ok(permission)
    }

    async fn list_usage(&self, user_id: Uuid, limit: i64) -> StoreResult<Vec<TokenUsage>> {
        let rows = sqlx::query_as::<_, UsageRow>(&format!(
            "SELECT {USAGE_COLUMNS} FROM token_usage WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2"
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(TokenUsage::from).collect())
    }

    async fn list_invite_codes(&self) -> StoreResult<Vec<InviteCode>> {
        let rows = sqlx::query_as::<_, InviteCodeRow>(&format!(
            "SELECT {INVITE_COLUMNS} FROM invite_codes ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(InviteCode::from).collect())
    }

    async fn find_invite_code(&self, id: Uuid) -> StoreResult<Option<InviteCode>> {
        let row = sqlx::query_as::<_, InviteCodeRow>(&format!(
            "SELECT {INVITE_COLUMNS} FROM invite_codes WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(InviteCode::from))
    }

    async fn find_invite_code_by_code(&self, code: &str) -> StoreResult<Option<InviteCode>> {
        let row = sqlx::query_as::<_, InviteCodeRow>(&format!(
            "SELECT {INVITE_COLUMNS} FROM invite_codes WHERE code = $1"
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(InviteCode::from))
    }

    async fn insert_invite_code(&self, code: &InviteCode) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO invite_codes ({INVITE_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
        ))
        .bind(code.id)
        .bind(&code.code)
        .bind(code.created_by)
        .bind(code.max_uses)
        .bind(code.current_uses)
        .bind(code.is_used)
        .bind(code.expires_at)
        .bind(code.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_unique_violation(e, "invite code"))?;
        Ok(())
    }

    async fn toggle_invite_code(&self, id: Uuid) -> StoreResult<Option<InviteCode>> {
        let row = sqlx::query_as::<_, InviteCodeRow>(&format!(
            "UPDATE invite_codes SET is_used = NOT is_used WHERE id = $1 RETURNING {INVITE_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(InviteCode::from))
    }

    async fn delete_invite_code(&self, id: Uuid) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE users SET invite_code_id = NULL WHERE invite_code_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM invite_codes WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_access_codes(&self, created_by: Option<Uuid>) -> StoreResult<Vec<AccessCode>> {
        let rows = sqlx::query_as::<_, AccessCodeRow>(&format!(
            r#"
            SELECT {ACCESS_COLUMNS} FROM access_codes
            WHERE ($1::UUID IS NULL OR created_by = $1)
            ORDER BY created_at DESC
            "#
        ))
        .bind(created_by)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(AccessCode::from).collect())
    }

    async fn find_access_code(&self, id: Uuid) -> StoreResult<Option<AccessCode>> {
        let row = sqlx::query_as::<_, AccessCodeRow>(&format!(
            "SELECT {ACCESS_COLUMNS} FROM access_codes WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(AccessCode::from))
    }

    async fn find_access_code_by_code(&self, code: &str) -> StoreResult<Option<AccessCode>> {
        let row = sqlx::query_as::<_, AccessCodeRow>(&format!(
            "SELECT {ACCESS_COLUMNS} FROM access_codes WHERE code = $1"
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(AccessCode::from))
    }

    async fn insert_access_code(&self, code: &AccessCode) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO access_codes ({ACCESS_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        ))
        .bind(code.id)
        .bind(&code.code)
        .bind(code.created_by)
        .bind(code.is_active)
        .bind(code.expires_at)
        .bind(code.max_uses)
        .bind(code.current_uses)
        .bind(&code.allowed_models)
        .bind(code.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_unique_violation(e, "access code"))?;
        Ok(())
    }

    async fn toggle_access_code(&self, id: Uuid) -> StoreResult<Option<AccessCode>> {
        let row = sqlx::query_as::<_, AccessCodeRow>(&format!(
            "UPDATE access_codes SET is_active = NOT is_active WHERE id = $1 RETURNING {ACCESS_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(AccessCode::from))
    }

    async fn delete_access_code(&self, id: Uuid) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE users SET access_code_id = NULL WHERE access_code_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM access_codes WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_providers(&self) -> StoreResult<Vec<Provider>> {
        let rows = sqlx::query_as::<_, ProviderRow>(
            "SELECT id, name, display_name FROM providers ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| Provider {
                id: row.id,
                name: row.name,
                display_name: row.display_name,
            })
            .collect())
    }

    async fn list_models(&self) -> StoreResult<Vec<ChatModel>> {
        let rows = sqlx::query_as::<_, ModelRow>(
            r#"
            SELECT id, provider_id, name, display_name, input_price_per_1k, output_price_per_1k
            FROM models ORDER BY provider_id, display_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ChatModel::from).collect())
    }

    async fn find_model(&self, id: &str) -> StoreResult<Option<ChatModel>> {
        let row = sqlx::query_as::<_, ModelRow>(
            r#"
            SELECT id, provider_id, name, display_name, input_price_per_1k, output_price_per_1k
            FROM models WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ChatModel::from))
    }

    async fn list_conversations(&self, user_id: Uuid) -> StoreResult<Vec<Conversation>> {
        let rows = sqlx::query_as::<_, ConversationRow>(
            r#"
            SELECT id, user_id, title, provider_id, model_id, created_at, updated_at
            FROM conversations WHERE user_id = $1
            ORDER BY updated_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Conversation::from).collect())
    }

    async fn find_conversation(&self, id: Uuid) -> StoreResult<Option<Conversation>> {
        let row = sqlx::query_as::<_, ConversationRow>(
            r#"
            SELECT id, user_id, title, provider_id, model_id, created_at, updated_at
            FROM conversations WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Conversation::from))
    }

    async fn insert_conversation(&self, conversation: &Conversation) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO conversations (id, user_id, title, provider_id, model_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(conversation.id)
        .bind(conversation.user_id)
        .bind(&conversation.title)
        .bind(&conversation.provider_id)
        .bind(&conversation.model_id)
        .bind(conversation.created_at)
        .bind(conversation.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn rename_conversation(
        &self,
        id: Uuid,
        title: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Conversation>> {
        let row = sqlx::query_as::<_, ConversationRow>(
            r#"
            UPDATE conversations SET title = $2, updated_at = $3 WHERE id = $1
            RETURNING id, user_id, title, provider_id, model_id, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(title)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Conversation::from))
    }

    async fn delete_conversation(&self, id: Uuid) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE conversation_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        // 用量流水保留，只断开关联
        sqlx::query(
            "UPDATE token_usage SET conversation_id = NULL, message_id = NULL WHERE conversation_id = $1",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query("DELETE FROM conversations WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_messages(&self, conversation_id: Uuid) -> StoreResult<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, conversation_id, user_id, role, content, provider_id, model_id, created_at, updated_at
            FROM messages WHERE conversation_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn find_message(&self, id: Uuid) -> StoreResult<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, conversation_id, user_id, role, content, provider_id, model_id, created_at, updated_at
            FROM messages WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Message::try_from).transpose()
    }

    async fn insert_message(&self, message: &Message) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, user_id, role, content, provider_id, model_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(message.id)
        .bind(message.conversation_id)
        .bind(message.user_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(&message.provider_id)
        .bind(&message.model_id)
        .bind(message.created_at)
        .bind(message.updated_at)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE conversations SET updated_at = $2 WHERE id = $1")
            .bind(message.conversation_id)
            .bind(message.created_at)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_message_content(
        &self,
        id: Uuid,
        content: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            UPDATE messages SET content = $2, updated_at = $3 WHERE id = $1
            RETURNING id, conversation_id, user_id, role, content, provider_id, model_id, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(content)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Message::try_from).transpose()
    }

    async fn delete_message(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM messages WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn table_counts(&self) -> StoreResult<Vec<TableCount>> {
        let mut counts = Vec::with_capacity(TABLES.len());
        for table in TABLES {
            let rows: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(&self.pool)
                .await?;
            counts.push(TableCount {
                table: table.to_string(),
                rows,
            });
        }
        Ok(counts)
    }

    async fn reset(&self) -> StoreResult<String> {
        let mut tx = self.pool.begin().await?;
        (&mut *tx).execute(sqlx::raw_sql(DROP_SQL)).await?;
        (&mut *tx).execute(sqlx::raw_sql(SCHEMA_SQL)).await?;
        tx.commit().await?;
        Ok(format!("dropped and recreated {} tables", TABLES.len()))
    }

    async fn seed(&self, seed: &SeedData) -> StoreResult<String> {
        let mut tx = self.pool.begin().await?;

        let mut providers = 0;
        for provider in &seed.providers {
            providers += sqlx::query(
                "INSERT INTO providers (id, name, display_name) VALUES ($1, $2, $3) ON CONFLICT (id) DO NOTHING",
            )
            .bind(&provider.id)
            .bind(&provider.name)
            .bind(&provider.display_name)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        let mut models = 0;
        for model in &seed.models {
            models += sqlx::query(
                r#"
                INSERT INTO models (id, provider_id, name, display_name, input_price_per_1k, output_price_per_1k)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(&model.id)
            .bind(&model.provider_id)
            .bind(&model.name)
            .bind(&model.display_name)
            .bind(model.input_price_per_1k)
            .bind(model.output_price_per_1k)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        let admin_exists: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM users WHERE LOWER(username) = LOWER($1)")
                .bind(&seed.admin.username)
                .fetch_optional(&mut *tx)
                .await?;
        let admin = if admin_exists.is_none() {
            Self::insert_user(&mut tx, &seed.admin).await?;
            Self::upsert_settings(&mut *tx, &seed.admin_settings).await?;
            format!("created admin '{}'", seed.admin.username)
        } else {
            format!("admin '{}' already present", seed.admin.username)
        };

        tx.commit().await?;
        Ok(format!(
            "seeded {providers} providers, {models} models; {admin}"
        ))
    }
}
