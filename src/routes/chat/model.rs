use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chat::view::ThreadItem;
use crate::database::models::{MessageRole, Theme, TokenUsage};
use crate::quota::QuotaStatus;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationRequest {
    pub title: Option<String>,
    pub model_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RenameConversationRequest {
    pub title: String,
}

/// 客户端完成一次模型调用后回报的消息；用量缺失时由服务端估算
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendMessageRequest {
    pub role: MessageRole,
    pub content: String,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendMessageResponse {
    pub message: ThreadItem,
    pub usage: Option<TokenUsage>,
    pub quota: Option<QuotaStatus>,
}

#[derive(Debug, Deserialize)]
pub struct EditMessageRequest {
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    pub limit: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatViewQuery {
    pub conversation_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaResponse {
    /// 实际计费的账号，访客为其主用户
    pub charged_user_id: Uuid,
    pub unrestricted: bool,
    pub quota: Option<QuotaStatus>,
}

/// defaultModelId 传空字符串表示清除
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSettingsRequest {
    pub theme: Option<Theme>,
    pub model_group_order: Option<Vec<String>>,
    pub default_model_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    pub id: Uuid,
    pub deleted: bool,
}
