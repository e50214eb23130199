// 数据库模块
// 存储接口定义，以及 PostgreSQL 与内存两种实现

pub mod error;
pub mod maintenance;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod seed;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use seed::SeedData;

use models::{
    AccessCode, ChatModel, CodeRedemption, Conversation, InviteCode, Message, Provider,
    TokenUsage, User, UserFilter, UserPermission, UserSettings, UserStats,
};

pub type StoreResult<T> = Result<T, StoreError>;

/// 新建账号所需的全部记录，在一个事务中写入
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub user: User,
    pub settings: UserSettings,
    pub permission: Option<UserPermission>,
    pub redeem: Option<CodeRedemption>,
}

/// 删除用户时按此顺序清理依赖数据
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeStep {
    Messages,
    Conversations,
    TokenUsage,
    Settings,
    Permissions,
    /// 停用该用户的访客并解除主用户链接，账号来源的兑换码链接置空
    DetachReferences,
    InviteCodes,
    AccessCodes,
    User,
}

impl CascadeStep {
    pub const ORDER: [CascadeStep; 9] = [
        CascadeStep::Messages,
        CascadeStep::Conversations,
        CascadeStep::TokenUsage,
        CascadeStep::Settings,
        CascadeStep::Permissions,
        CascadeStep::DetachReferences,
        CascadeStep::InviteCodes,
        CascadeStep::AccessCodes,
        CascadeStep::User,
    ];
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TableCount {
    pub table: String,
    pub rows: i64,
}

/// 应用的持久化接口，通过 AppState 显式传入各处理器
#[async_trait]
pub trait Store: Send + Sync {
    // 用户
    async fn find_user(&self, id: Uuid) -> StoreResult<Option<User>>;
    /// 用户名不区分大小写
    async fn find_user_by_username(&self, username: &str) -> StoreResult<Option<User>>;
    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>>;
    /// 返回当前页和过滤后的总数
    async fn list_users(&self, filter: &UserFilter) -> StoreResult<(Vec<User>, i64)>;
    async fn user_stats(&self, ids: &[Uuid]) -> StoreResult<Vec<UserStats>>;
    async fn create_account(&self, account: NewAccount) -> StoreResult<User>;
    async fn set_user_active(&self, id: Uuid, active: bool, now: DateTime<Utc>)
    -> StoreResult<Option<User>>;
    /// 事务内级联删除，返回用户是否存在
    async fn delete_user_cascade(&self, id: Uuid) -> StoreResult<bool>;

    // 设置与权限
    async fn find_settings(&self, user_id: Uuid) -> StoreResult<Option<UserSettings>>;
    async fn save_settings(&self, settings: &UserSettings) -> StoreResult<()>;
    async fn find_permission(&self, user_id: Uuid) -> StoreResult<Option<UserPermission>>;
    async fn save_permission(&self, permission: &UserPermission) -> StoreResult<()>;
    /// 应用到期的周期重置并持久化
    async fn refresh_quota(&self, user_id: Uuid, now: DateTime<Utc>)
    -> StoreResult<Option<UserPermission>>;
    /// 写入用量流水并在同一事务中累加计费账号的计数器
    async fn record_usage(&self, usage: &TokenUsage, now: DateTime<Utc>)
    -> StoreResult<Option<UserPermission>>;
    async fn list_usage(&self, user_id: Uuid, limit: i64) -> StoreResult<Vec<TokenUsage>>;

    // 邀请码
    async fn list_invite_codes(&self) -> StoreResult<Vec<InviteCode>>;
    async fn find_invite_code(&self, id: Uuid) -> StoreResult<Option<InviteCode>>;
    async fn find_invite_code_by_code(&self, code: &str) -> StoreResult<Option<InviteCode>>;
    async fn insert_invite_code(&self, code: &InviteCode) -> StoreResult<()>;
    async fn toggle_invite_code(&self, id: Uuid) -> StoreResult<Option<InviteCode>>;
    async fn delete_invite_code(&self, id: Uuid) -> StoreResult<bool>;

    // 访问码
    async fn list_access_codes(&self, created_by: Option<Uuid>) -> StoreResult<Vec<AccessCode>>;
    async fn find_access_code(&self, id: Uuid) -> StoreResult<Option<AccessCode>>;
    async fn find_access_code_by_code(&self, code: &str) -> StoreResult<Option<AccessCode>>;
    async fn insert_access_code(&self, code: &AccessCode) -> StoreResult<()>;
    async fn toggle_access_code(&self, id: Uuid) -> StoreResult<Option<AccessCode>>;
    async fn delete_access_code(&self, id: Uuid) -> StoreResult<bool>;

    // 参考数据
    async fn list_providers(&self) -> StoreResult<Vec<Provider>>;
    async fn list_models(&self) -> StoreResult<Vec<ChatModel>>;
    async fn find_model(&self, id: &str) -> StoreResult<Option<ChatModel>>;

    // 对话与消息
    async fn list_conversations(&self, user_id: Uuid) -> StoreResult<Vec<Conversation>>;
    async fn find_conversation(&self, id: Uuid) -> StoreResult<Option<Conversation>>;
    async fn insert_conversation(&self, conversation: &Conversation) -> StoreResult<()>;
    async fn rename_conversation(&self, id: Uuid, title: &str, now: DateTime<Utc>)
    -> StoreResult<Option<Conversation>>;
    async fn delete_conversation(&self, id: Uuid) -> StoreResult<bool>;
    async fn list_messages(&self, conversation_id: Uuid) -> StoreResult<Vec<Message>>;
    async fn find_message(&self, id: Uuid) -> StoreResult<Option<Message>>;
    /// 同时刷新所属对话的更新时间
    async fn insert_message(&self, message: &Message) -> StoreResult<()>;
    async fn update_message_content(&self, id: Uuid, content: &str, now: DateTime<Utc>)
    -> StoreResult<Option<Message>>;
    async fn delete_message(&self, id: Uuid) -> StoreResult<bool>;

    // 维护
    async fn table_counts(&self) -> StoreResult<Vec<TableCount>>;
    /// 清空全部数据并重建结构，返回执行摘要
    async fn reset(&self) -> StoreResult<String>;
    /// 写入初始数据，可重复执行
    async fn seed(&self, seed: &SeedData) -> StoreResult<String>;
}
