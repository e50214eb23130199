// 数据库实体定义

pub mod chat;
pub mod code;
pub mod permission;
pub mod user;

pub use chat::{ChatModel, Conversation, Message, MessageRole, Provider, TokenUsage};
pub use code::{AccessCode, CodeRedemption, InviteCode};
pub use permission::{LimitPeriod, LimitType, PermissionTag, UserPermission};
pub use user::{Role, Theme, User, UserFilter, UserSettings, UserStats};
