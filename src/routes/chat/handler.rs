use axum::{
    extract::{Extension, Json, Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use uuid::Uuid;

use crate::{
    AppState,
    chat::{
        ChatView, normalize_title,
        view::{MessageAction, ModelGroup, ThreadItem, group_models, message_actions, sidebar, thread},
    },
    database::models::{
        Conversation, LimitType, Message, MessageRole, PermissionTag, TokenUsage, User,
        UserPermission, UserSettings,
    },
    error::{AppError, AppResult},
    middleware::CurrentUser,
    quota::{
        MAX_REPORTED_TOKENS, QuotaStatus, derive_cost, is_exhausted, reported_tokens_valid,
        resolve_usage,
    },
    routes::{parse_id, parse_opt},
    utils::success_to_api_response,
};

use super::model::{
    AppendMessageRequest, AppendMessageResponse, ChatViewQuery, CreateConversationRequest,
    DeletedResponse, EditMessageRequest, QuotaResponse, RenameConversationRequest,
    UpdateSettingsRequest, UsageQuery,
};

const DEFAULT_TITLE: &str = "新对话";
const DEFAULT_USAGE_LIMIT: i64 = 50;
const MAX_USAGE_LIMIT: i64 = 200;

/// 只返回调用者自己的对话，其他人的对话按不存在处理
async fn own_conversation(state: &AppState, user: &User, id: Uuid) -> AppResult<Conversation> {
    state
        .store
        .find_conversation(id)
        .await?
        .filter(|c| c.user_id == user.id)
        .ok_or_else(|| AppError::not_found("对话不存在"))
}

async fn own_message(state: &AppState, user: &User, id: Uuid) -> AppResult<Message> {
    let message = state
        .store
        .find_message(id)
        .await?
        .ok_or_else(|| AppError::not_found("消息不存在"))?;
    own_conversation(state, user, message.conversation_id)
        .await
        .map_err(|_| AppError::not_found("消息不存在"))?;
    Ok(message)
}

/// 需要 chat 权限，返回调用者的权限记录用于模型白名单检查
async fn chat_permission(state: &AppState, user: &User) -> AppResult<Option<UserPermission>> {
    let permission = state.store.find_permission(user.id).await?;
    if !user.is_admin()
        && !permission
            .as_ref()
            .is_some_and(|p| p.has(PermissionTag::Chat))
    {
        return Err(AppError::forbidden("没有聊天权限"));
    }
    Ok(permission)
}

fn ensure_model_allowed(permission: Option<&UserPermission>, model_id: &str) -> AppResult<()> {
    if permission.is_some_and(|p| !p.allows_model(model_id)) {
        return Err(AppError::forbidden(format!("无权使用模型 {model_id}")));
    }
    Ok(())
}

async fn load_settings(state: &AppState, user: &User) -> AppResult<UserSettings> {
    Ok(state
        .store
        .find_settings(user.id)
        .await?
        .unwrap_or_else(|| UserSettings::default_for(user.id)))
}

/// 模型选择器：按白名单过滤后按用户的分组顺序排列
async fn model_groups(
    state: &AppState,
    user: &User,
    settings: &UserSettings,
) -> AppResult<Vec<ModelGroup>> {
    let permission = state.store.find_permission(user.id).await?;
    let providers = state.store.list_providers().await?;
    let models = state
        .store
        .list_models()
        .await?
        .into_iter()
        .filter(|m| permission.as_ref().is_none_or(|p| p.allows_model(&m.id)))
        .collect();
    Ok(group_models(&providers, models, &settings.model_group_order))
}

fn thread_item(message: Message) -> ThreadItem {
    ThreadItem {
        actions: message_actions(message.role).to_vec(),
        message,
    }
}

#[axum::debug_handler]
pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> AppResult<impl IntoResponse> {
    let conversations = state.store.list_conversations(user.id).await?;
    Ok(success_to_api_response(conversations))
}

#[axum::debug_handler]
pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    payload: Result<Json<CreateConversationRequest>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(req) = payload?;
    let permission = chat_permission(&state, &user).await?;
    let model = state
        .store
        .find_model(req.model_id.trim())
        .await?
        .ok_or_else(|| AppError::validation(format!("未知模型: {}", req.model_id)))?;
    ensure_model_allowed(permission.as_ref(), &model.id)?;

    let title = req
        .title
        .as_deref()
        .and_then(normalize_title)
        .unwrap_or_else(|| DEFAULT_TITLE.to_string());
    let now = Utc::now();
    let conversation = Conversation {
        id: Uuid::new_v4(),
        user_id: user.id,
        title,
        provider_id: model.provider_id,
        model_id: model.id,
        created_at: now,
        updated_at: now,
    };
    state.store.insert_conversation(&conversation).await?;
    tracing::debug!("User {} created conversation {}", user.id, conversation.id);

    Ok((StatusCode::CREATED, success_to_api_response(conversation)))
}

/// 标题去空白后截断到 8 个字符，结果为空时拒绝
#[axum::debug_handler]
pub async fn rename_conversation(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<String>,
    payload: Result<Json<RenameConversationRequest>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let id = parse_id("id", Some(&id))?;
    let Json(req) = payload?;
    let title = normalize_title(&req.title).ok_or_else(|| AppError::validation("标题不能为空"))?;
    own_conversation(&state, &user, id).await?;

    let conversation = state
        .store
        .rename_conversation(id, &title, Utc::now())
        .await?
        .ok_or_else(|| AppError::not_found("对话不存在"))?;
    Ok(success_to_api_response(conversation))
}

#[axum::debug_handler]
pub async fn delete_conversation(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let id = parse_id("id", Some(&id))?;
    own_conversation(&state, &user, id).await?;
    let deleted = state.store.delete_conversation(id).await?;
    Ok(success_to_api_response(DeletedResponse { id, deleted }))
}

#[axum::debug_handler]
pub async fn list_messages(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let id = parse_id("id", Some(&id))?;
    own_conversation(&state, &user, id).await?;
    let messages = state.store.list_messages(id).await?;
    Ok(success_to_api_response(thread(messages)))
}

/// 所有消息都要求 chat 权限和模型白名单，用户消息另外检查配额；助手消息记录本次调用的用量
#[axum::debug_handler]
pub async fn append_message(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<String>,
    payload: Result<Json<AppendMessageRequest>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let id = parse_id("id", Some(&id))?;
    let Json(req) = payload?;
    if req.content.trim().is_empty() {
        return Err(AppError::validation("消息内容不能为空"));
    }
    if !reported_tokens_valid(req.prompt_tokens) || !reported_tokens_valid(req.completion_tokens) {
        return Err(AppError::validation(format!(
            "token 数必须在 0 到 {MAX_REPORTED_TOKENS} 之间"
        )));
    }
    let conversation = own_conversation(&state, &user, id).await?;
    let now = Utc::now();

    let permission = chat_permission(&state, &user).await?;
    ensure_model_allowed(permission.as_ref(), &conversation.model_id)?;
    if req.role == MessageRole::User {
        if let Some(quota) = state.store.refresh_quota(user.quota_owner(), now).await? {
            if is_exhausted(&quota) {
                tracing::info!("Quota exhausted for {}", user.quota_owner());
                return Err(AppError::QuotaExceeded("配额已用尽，请等待下个周期".into()));
            }
        }
    }

    let message = Message {
        id: Uuid::new_v4(),
        conversation_id: conversation.id,
        user_id: user.id,
        role: req.role,
        content: req.content,
        provider_id: conversation.provider_id.clone(),
        model_id: conversation.model_id.clone(),
        created_at: now,
        updated_at: now,
    };
    state.store.insert_message(&message).await?;

    let (usage, quota) = if message.role == MessageRole::Assistant {
        let history = state.store.list_messages(conversation.id).await?;
        let prompt_text = history
            .iter()
            .rev()
            .filter(|m| m.id != message.id)
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.as_str())
            .unwrap_or("");
        let resolved = resolve_usage(
            req.prompt_tokens,
            req.completion_tokens,
            prompt_text,
            &message.content,
        );
        let cost = state
            .store
            .find_model(&conversation.model_id)
            .await?
            .and_then(|model| {
                derive_cost(&model, resolved.prompt_tokens, resolved.completion_tokens)
            });

        let usage = TokenUsage {
            id: Uuid::new_v4(),
            user_id: user.quota_owner(),
            conversation_id: Some(conversation.id),
            message_id: Some(message.id),
            provider_id: conversation.provider_id.clone(),
            model_id: conversation.model_id.clone(),
            prompt_tokens: resolved.prompt_tokens,
            completion_tokens: resolved.completion_tokens,
            total_tokens: resolved.total(),
            is_estimated: resolved.is_estimated,
            cost,
            created_at: now,
        };
        let permission = state.store.record_usage(&usage, now).await?;
        (Some(usage), permission.as_ref().map(QuotaStatus::from))
    } else {
        (None, None)
    };

    Ok((
        StatusCode::CREATED,
        success_to_api_response(AppendMessageResponse {
            message: thread_item(message),
            usage,
            quota,
        }),
    ))
}

#[axum::debug_handler]
pub async fn edit_message(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<String>,
    payload: Result<Json<EditMessageRequest>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let id = parse_id("id", Some(&id))?;
    let Json(req) = payload?;
    let message = own_message(&state, &user, id).await?;
    if !message_actions(message.role).contains(&MessageAction::Edit) {
        return Err(AppError::validation("该消息不支持编辑"));
    }
    if req.content.trim().is_empty() {
        return Err(AppError::validation("消息内容不能为空"));
    }

    let message = state
        .store
        .update_message_content(id, &req.content, Utc::now())
        .await?
        .ok_or_else(|| AppError::not_found("消息不存在"))?;
    Ok(success_to_api_response(thread_item(message)))
}

#[axum::debug_handler]
pub async fn delete_message(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let id = parse_id("id", Some(&id))?;
    own_message(&state, &user, id).await?;
    let deleted = state.store.delete_message(id).await?;
    Ok(success_to_api_response(DeletedResponse { id, deleted }))
}

/// 先应用到期的周期重置，再返回当前配额
#[axum::debug_handler]
pub async fn get_quota(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> AppResult<impl IntoResponse> {
    let charged_user_id = user.quota_owner();
    let permission = state
        .store
        .refresh_quota(charged_user_id, Utc::now())
        .await?;
    let unrestricted = permission
        .as_ref()
        .is_none_or(|p| p.limit_type == LimitType::None);

    Ok(success_to_api_response(QuotaResponse {
        charged_user_id,
        unrestricted,
        quota: permission.as_ref().map(QuotaStatus::from),
    }))
}

#[axum::debug_handler]
pub async fn list_usage(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(query): Query<UsageQuery>,
) -> AppResult<impl IntoResponse> {
    let limit = parse_opt::<i64>("limit", query.limit.as_deref())?.unwrap_or(DEFAULT_USAGE_LIMIT);
    if !(1..=MAX_USAGE_LIMIT).contains(&limit) {
        return Err(AppError::validation(format!(
            "limit 必须在 1 到 {MAX_USAGE_LIMIT} 之间"
        )));
    }
    let rows = state.store.list_usage(user.quota_owner(), limit).await?;
    Ok(success_to_api_response(rows))
}

#[axum::debug_handler]
pub async fn list_models(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> AppResult<impl IntoResponse> {
    let settings = load_settings(&state, &user).await?;
    let groups = model_groups(&state, &user, &settings).await?;
    Ok(success_to_api_response(groups))
}

#[axum::debug_handler]
pub async fn get_settings(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> AppResult<impl IntoResponse> {
    Ok(success_to_api_response(load_settings(&state, &user).await?))
}

#[axum::debug_handler]
pub async fn update_settings(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    payload: Result<Json<UpdateSettingsRequest>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(req) = payload?;
    let mut settings = load_settings(&state, &user).await?;

    if let Some(theme) = req.theme {
        settings.theme = theme;
    }
    if let Some(order) = req.model_group_order {
        let mut cleaned: Vec<String> = Vec::with_capacity(order.len());
        for name in order {
            let name = name.trim().to_string();
            if !name.is_empty() && !cleaned.contains(&name) {
                cleaned.push(name);
            }
        }
        settings.model_group_order = cleaned;
    }
    if let Some(model_id) = req.default_model_id {
        let model_id = model_id.trim();
        if model_id.is_empty() {
            settings.default_model_id = None;
        } else {
            let model = state
                .store
                .find_model(model_id)
                .await?
                .ok_or_else(|| AppError::validation(format!("未知模型: {model_id}")))?;
            let permission = state.store.find_permission(user.id).await?;
            ensure_model_allowed(permission.as_ref(), &model.id)?;
            settings.default_model_id = Some(model.id);
        }
    }

    state.store.save_settings(&settings).await?;
    Ok(success_to_api_response(settings))
}

/// 聊天页面投影：侧边栏、选中对话的消息、模型分组
#[axum::debug_handler]
pub async fn chat_view(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(query): Query<ChatViewQuery>,
) -> AppResult<impl IntoResponse> {
    let selected = match query.conversation_id.as_deref() {
        Some(raw) if !raw.trim().is_empty() => {
            Some(own_conversation(&state, &user, parse_id("conversationId", Some(raw))?).await?)
        }
        _ => None,
    };

    let settings = load_settings(&state, &user).await?;
    let conversations = state.store.list_conversations(user.id).await?;
    let thread_items = match &selected {
        Some(conversation) => thread(state.store.list_messages(conversation.id).await?),
        None => Vec::new(),
    };
    let model_groups = model_groups(&state, &user, &settings).await?;
    let selected_id = selected.as_ref().map(|c| c.id);
    let selected_model_id = selected
        .map(|c| c.model_id)
        .or_else(|| settings.default_model_id.clone());

    Ok(success_to_api_response(ChatView {
        sidebar: sidebar(conversations, selected_id),
        selected_conversation_id: selected_id,
        thread: thread_items,
        model_groups,
        selected_model_id,
    }))
}
