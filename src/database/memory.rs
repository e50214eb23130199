// 内存存储实现
// 用于本地开发（DATABASE_URL=memory://）和测试。
// 多步写操作在状态副本上执行，全部成功后才替换原状态。

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::{
    AccessCode, ChatModel, CodeRedemption, Conversation, InviteCode, Message, Provider,
    TokenUsage, User, UserFilter, UserPermission, UserSettings, UserStats,
};
use super::{CascadeStep, NewAccount, SeedData, Store, StoreError, StoreResult, TableCount};
use crate::quota;

#[derive(Debug, Clone, Default)]
struct MemoryState {
    users: Vec<User>,
    settings: HashMap<Uuid, UserSettings>,
    permissions: HashMap<Uuid, UserPermission>,
    invite_codes: Vec<InviteCode>,
    access_codes: Vec<AccessCode>,
    providers: Vec<Provider>,
    models: Vec<ChatModel>,
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
    token_usage: Vec<TokenUsage>,
}

impl MemoryState {
    fn username_taken(&self, username: &str) -> bool {
        self.users
            .iter()
            .any(|u| u.username.eq_ignore_ascii_case(username))
    }

    fn email_taken(&self, email: &str) -> bool {
        self.users.iter().any(|u| {
            u.email
                .as_deref()
                .is_some_and(|e| e.eq_ignore_ascii_case(email))
        })
    }

    fn redeem(&mut self, redemption: CodeRedemption, now: DateTime<Utc>) -> StoreResult<()> {
        let usable = match redemption {
            CodeRedemption::Invite(id) => self
                .invite_codes
                .iter_mut()
                .find(|c| c.id == id)
                .filter(|c| c.is_usable(now))
                .map(InviteCode::redeem),
            CodeRedemption::Access(id) => self
                .access_codes
                .iter_mut()
                .find(|c| c.id == id)
                .filter(|c| c.is_usable(now))
                .map(AccessCode::redeem),
        };
        usable.ok_or_else(|| StoreError::Conflict("code is no longer usable".into()))
    }

    fn apply_cascade_step(&mut self, step: CascadeStep, user_id: Uuid, now: DateTime<Utc>) {
        match step {
            CascadeStep::Messages => {
                let owned: Vec<Uuid> = self
                    .conversations
                    .iter()
                    .filter(|c| c.user_id == user_id)
                    .map(|c| c.id)
                    .collect();
                self.messages
                    .retain(|m| m.user_id != user_id && !owned.contains(&m.conversation_id));
            }
            CascadeStep::Conversations => self.conversations.retain(|c| c.user_id != user_id),
            CascadeStep::TokenUsage => self.token_usage.retain(|t| t.user_id != user_id),
            CascadeStep::Settings => {
                self.settings.remove(&user_id);
            }
            CascadeStep::Permissions => {
                self.permissions.remove(&user_id);
            }
            CascadeStep::DetachReferences => {
                let invites: Vec<Uuid> = self
                    .invite_codes
                    .iter()
                    .filter(|c| c.created_by == user_id)
                    .map(|c| c.id)
                    .collect();
                let access: Vec<Uuid> = self
                    .access_codes
                    .iter()
                    .filter(|c| c.created_by == user_id)
                    .map(|c| c.id)
                    .collect();
                for user in &mut self.users {
                    if user.host_user_id == Some(user_id) {
                        user.host_user_id = None;
                        user.is_active = false;
                        user.updated_at = now;
                    }
                    if user.invite_code_id.is_some_and(|id| invites.contains(&id)) {
                        user.invite_code_id = None;
                    }
                    if user.access_code_id.is_some_and(|id| access.contains(&id)) {
                        user.access_code_id = None;
                    }
                }
            }
            CascadeStep::InviteCodes => self.invite_codes.retain(|c| c.created_by != user_id),
            CascadeStep::AccessCodes => self.access_codes.retain(|c| c.created_by != user_id),
            CascadeStep::User => self.users.retain(|u| u.id != user_id),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    /// 测试用：级联删除执行到该步骤时失败
    fail_cascade_at: Mutex<Option<CascadeStep>>,
    /// 测试用：reset 返回错误且不改动数据
    fail_reset: Mutex<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    /// 在副本上执行多步修改，成功后整体替换
    fn transaction<T>(
        &self,
        f: impl FnOnce(&mut MemoryState) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut guard = self.lock()?;
        let mut draft = guard.clone();
        let value = f(&mut draft)?;
        *guard = draft;
        Ok(value)
    }

    #[cfg(test)]
    pub fn fail_cascade_at(&self, step: Option<CascadeStep>) {
        if let Ok(mut slot) = self.fail_cascade_at.lock() {
            *slot = step;
        }
    }

    #[cfg(test)]
    pub fn fail_reset(&self, fail: bool) {
        if let Ok(mut slot) = self.fail_reset.lock() {
            *slot = fail;
        }
    }

    fn injected_failure(&self) -> Option<CascadeStep> {
        self.fail_cascade_at.lock().ok().and_then(|slot| *slot)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_user(&self, id: Uuid) -> StoreResult<Option<User>> {
        Ok(self.lock()?.users.iter().find(|u| u.id == id).cloned())
    }

    async fn find_user_by_username(&self, username: &str) -> StoreResult<Option<User>> {
        Ok(self
            .lock()?
            .users
            .iter()
            .find(|u| u.username.eq_ignore_ascii_case(username))
            .cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        Ok(self
            .lock()?
            .users
            .iter()
            .find(|u| {
                u.email
                    .as_deref()
                    .is_some_and(|e| e.eq_ignore_ascii_case(email))
            })
            .cloned())
    }

    async fn list_users(&self, filter: &UserFilter) -> StoreResult<(Vec<User>, i64)> {
        let state = self.lock()?;
        let mut matched: Vec<&User> = state.users.iter().filter(|u| filter.matches(u)).collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = matched.len() as i64;
        let page = matched
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn user_stats(&self, ids: &[Uuid]) -> StoreResult<Vec<UserStats>> {
        let state = self.lock()?;
        Ok(ids
            .iter()
            .filter(|id| state.users.iter().any(|u| u.id == **id))
            .map(|id| UserStats {
                user_id: *id,
                conversation_count: state
                    .conversations
                    .iter()
                    .filter(|c| c.user_id == *id)
                    .count() as i64,
                message_count: state.messages.iter().filter(|m| m.user_id == *id).count() as i64,
                total_tokens: state
                    .token_usage
                    .iter()
                    .filter(|t| t.user_id == *id)
                    .map(|t| t.total_tokens)
                    .sum(),
            })
            .collect())
    }

    async fn create_account(&self, account: NewAccount) -> StoreResult<User> {
        let now = Utc::now();
        self.transaction(|state| {
            if let Some(redemption) = account.redeem {
                state.redeem(redemption, now)?;
            }
            if state.username_taken(&account.user.username)
                || account
                    .user
                    .email
                    .as_deref()
                    .is_some_and(|email| state.email_taken(email))
            {
                return Err(StoreError::Conflict(
                    "username or email already exists".into(),
                ));
            }
            state.users.push(account.user.clone());
            state
                .settings
                .insert(account.user.id, account.settings.clone());
            if let Some(permission) = &account.permission {
                state.permissions.insert(account.user.id, permission.clone());
            }
            Ok(account.user.clone())
        })
    }

    async fn set_user_active(
        &self,
        id: Uuid,
        active: bool,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<User>> {
        let mut state = self.lock()?;
        Ok(state.users.iter_mut().find(|u| u.id == id).map(|user| {
            user.is_active = active;
            user.updated_at = now;
            user.clone()
        }))
    }

    async fn delete_user_cascade(&self, id: Uuid) -> StoreResult<bool> {
        let fail_at = self.injected_failure();
        let now = Utc::now();
        self.transaction(|state| {
            if !state.users.iter().any(|u| u.id == id) {
                return Ok(false);
            }
            for step in CascadeStep::ORDER {
                if fail_at == Some(step) {
                    return Err(StoreError::Unavailable(format!(
                        "cascade step {step:?} failed"
                    )));
                }
                state.apply_cascade_step(step, id, now);
            }
            Ok(true)
        })
    }

    async fn find_settings(&self, user_id: Uuid) -> StoreResult<Option<UserSettings>> {
        Ok(self.lock()?.settings.get(&user_id).cloned())
    }

    async fn save_settings(&self, settings: &UserSettings) -> StoreResult<()> {
        self.lock()?
            .settings
            .insert(settings.user_id, settings.clone());
        Ok(())
    }

    async fn find_permission(&self, user_id: Uuid) -> StoreResult<Option<UserPermission>> {
        Ok(self.lock()?.permissions.get(&user_id).cloned())
    }

    async fn save_permission(&self, permission: &UserPermission) -> StoreResult<()> {
        self.lock()?
            .permissions
            .insert(permission.user_id, permission.clone());
        Ok(())
    }

    async fn refresh_quota(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<UserPermission>> {
        let mut state = self.lock()?;
        Ok(state.permissions.get_mut(&user_id).map(|permission| {
            quota::apply_due_reset(permission, now);
            permission.clone()
        }))
    }

    async fn record_usage(
        &self,
        usage: &TokenUsage,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<UserPermission>> {
        self.transaction(|state| {
            state.token_usage.push(usage.clone());
            Ok(state.permissions.get_mut(&usage.user_id).map(|permission| {
                quota::charge(permission, usage.total_tokens, usage.cost, now);
                permission.clone()
            }))
        })
    }

    async fn list_usage(&self, user_id: Uuid, limit: i64) -> StoreResult<Vec<TokenUsage>> {
        let state = self.lock()?;
        let mut rows: Vec<TokenUsage> = state
            .token_usage
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn list_invite_codes(&self) -> StoreResult<Vec<InviteCode>> {
        let mut codes = self.lock()?.invite_codes.clone();
        codes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(codes)
    }

    async fn find_invite_code(&self, id: Uuid) -> StoreResult<Option<InviteCode>> {
        Ok(self.lock()?.invite_codes.iter().find(|c| c.id == id).cloned())
    }

    async fn find_invite_code_by_code(&self, code: &str) -> StoreResult<Option<InviteCode>> {
        Ok(self
            .lock()?
            .invite_codes
            .iter()
            .find(|c| c.code == code)
            .cloned())
    }

    async fn insert_invite_code(&self, code: &InviteCode) -> StoreResult<()> {
        let mut state = self.lock()?;
        if state.invite_codes.iter().any(|c| c.code == code.code) {
            return Err(StoreError::Conflict("invite code already exists".into()));
        }
        state.invite_codes.push(code.clone());
        Ok(())
    }

    async fn toggle_invite_code(&self, id: Uuid) -> StoreResult<Option<InviteCode>> {
        let mut state = self.lock()?;
        Ok(state.invite_codes.iter_mut().find(|c| c.id == id).map(|code| {
            code.is_used = !code.is_used;
            code.clone()
        }))
    }

    async fn delete_invite_code(&self, id: Uuid) -> StoreResult<bool> {
        self.transaction(|state| {
            let before = state.invite_codes.len();
            state.invite_codes.retain(|c| c.id != id);
            for user in &mut state.users {
                if user.invite_code_id == Some(id) {
                    user.invite_code_id = None;
                }
            }
            Ok(state.invite_codes.len() < before)
        })
    }

    async fn list_access_codes(&self, created_by: Option<Uuid>) -> StoreResult<Vec<AccessCode>> {
        let mut codes: Vec<AccessCode> = self
            .lock()?
            .access_codes
            .iter()
            .filter(|c| created_by.is_none_or(|owner| c.created_by == owner))
            .cloned()
            .collect();
        codes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(codes)
    }

    async fn find_access_code(&self, id: Uuid) -> StoreResult<Option<AccessCode>> {
        Ok(self.lock()?.access_codes.iter().find(|c| c.id == id).cloned())
    }

    async fn find_access_code_by_code(&self, code: &str) -> StoreResult<Option<AccessCode>> {
        Ok(self
            .lock()?
            .access_codes
            .iter()
            .find(|c| c.code == code)
            .cloned())
    }

    async fn insert_access_code(&self, code: &AccessCode) -> StoreResult<()> {
        let mut state = self.lock()?;
        if state.access_codes.iter().any(|c| c.code == code.code) {
            return Err(StoreError::Conflict("access code already exists".into()));
        }
        state.access_codes.push(code.clone());
        Ok(())
    }

    async fn toggle_access_code(&self, id: Uuid) -> StoreResult<Option<AccessCode>> {
        let mut state = self.lock()?;
        Ok(state.access_codes.iter_mut().find(|c| c.id == id).map(|code| {
            code.is_active = !code.is_active;
            code.clone()
        }))
    }

    async fn delete_access_code(&self, id: Uuid) -> StoreResult<bool> {
        self.transaction(|state| {
            let before = state.access_codes.len();
            state.access_codes.retain(|c| c.id != id);
            for user in &mut state.users {
                if user.access_code_id == Some(id) {
                    user.access_code_id = None;
                }
            }
            Ok(state.access_codes.len() < before)
        })
    }

    async fn list_providers(&self) -> StoreResult<Vec<Provider>> {
        let mut providers = self.lock()?.providers.clone();
        providers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(providers)
    }

    async fn list_models(&self) -> StoreResult<Vec<ChatModel>> {
        let mut models = self.lock()?.models.clone();
        models.sort_by(|a, b| {
            a.provider_id
                .cmp(&b.provider_id)
                .then_with(|| a.display_name.cmp(&b.display_name))
        });
        Ok(models)
    }

    async fn find_model(&self, id: &str) -> StoreResult<Option<ChatModel>> {
        Ok(self.lock()?.models.iter().find(|m| m.id == id).cloned())
    }

    async fn list_conversations(&self, user_id: Uuid) -> StoreResult<Vec<Conversation>> {
        let mut conversations: Vec<Conversation> = self
            .lock()?
            .conversations
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }

    async fn find_conversation(&self, id: Uuid) -> StoreResult<Option<Conversation>> {
        Ok(self
            .lock()?
            .conversations
            .iter()
            .find(|c| c.id == id)
            .cloned())
    }

    async fn insert_conversation(&self, conversation: &Conversation) -> StoreResult<()> {
        self.lock()?.conversations.push(conversation.clone());
        Ok(())
    }

    async fn rename_conversation(
        &self,
        id: Uuid,
        title: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Conversation>> {
        let mut state = self.lock()?;
        Ok(state
            .conversations
            .iter_mut()
            .find(|c| c.id == id)
            .map(|conversation| {
                conversation.title = title.to_string();
                conversation.updated_at = now;
                conversation.clone()
            }))
    }

    async fn delete_conversation(&self, id: Uuid) -> StoreResult<bool> {
        self.transaction(|state| {
            state.messages.retain(|m| m.conversation_id != id);
            for usage in &mut state.token_usage {
                if usage.conversation_id == Some(id) {
                    usage.conversation_id = None;
                    usage.message_id = None;
                }
            }
            let before = state.conversations.len();
            state.conversations.retain(|c| c.id != id);
            Ok(state.conversations.len() < before)
        })
    }

    async fn list_messages(&self, conversation_id: Uuid) -> StoreResult<Vec<Message>> {
        let mut messages: Vec<Message> = self
            .lock()?
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(messages)
    }

    async fn find_message(&self, id: Uuid) -> StoreResult<Option<Message>> {
        Ok(self.lock()?.messages.iter().find(|m| m.id == id).cloned())
    }

    async fn insert_message(&self, message: &Message) -> StoreResult<()> {
        let mut state = self.lock()?;
        if let Some(conversation) = state
            .conversations
            .iter_mut()
            .find(|c| c.id == message.conversation_id)
        {
            conversation.updated_at = message.created_at;
        }
        state.messages.push(message.clone());
        Ok(())
    }

    async fn update_message_content(
        &self,
        id: Uuid,
        content: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Message>> {
        let mut state = self.lock()?;
        Ok(state.messages.iter_mut().find(|m| m.id == id).map(|message| {
            message.content = content.to_string();
            message.updated_at = now;
            message.clone()
        }))
    }

    async fn delete_message(&self, id: Uuid) -> StoreResult<bool> {
        let mut state = self.lock()?;
        let before = state.messages.len();
        state.messages.retain(|m| m.id != id);
        Ok(state.messages.len() < before)
    }

    async fn table_counts(&self) -> StoreResult<Vec<TableCount>> {
        let state = self.lock()?;
        let counts = [
            ("users", state.users.len()),
            ("user_settings", state.settings.len()),
            ("user_permissions", state.permissions.len()),
            ("invite_codes", state.invite_codes.len()),
            ("access_codes", state.access_codes.len()),
            ("providers", state.providers.len()),
            ("models", state.models.len()),
            ("conversations", state.conversations.len()),
            ("messages", state.messages.len()),
            ("token_usage", state.token_usage.len()),
        ];
        Ok(counts
            .into_iter()
            .map(|(table, rows)| TableCount {
                table: table.to_string(),
                rows: rows as i64,
            })
            .collect())
    }

    async fn reset(&self) -> StoreResult<String> {
        if self.fail_reset.lock().is_ok_and(|slot| *slot) {
            return Err(StoreError::Unavailable("reset failed".into()));
        }
        *self.lock()? = MemoryState::default();
        Ok("cleared in-memory state".to_string())
    }

    async fn seed(&self, seed: &SeedData) -> StoreResult<String> {
        self.transaction(|state| {
            let mut providers = 0;
            for provider in &seed.providers {
                if !state.providers.iter().any(|p| p.id == provider.id) {
                    state.providers.push(provider.clone());
                    providers += 1;
                }
            }
            let mut models = 0;
            for model in &seed.models {
                if !state.models.iter().any(|m| m.id == model.id) {
                    state.models.push(model.clone());
                    models += 1;
                }
            }
            let admin = if state.username_taken(&seed.admin.username) {
                format!("admin '{}' already present", seed.admin.username)
            } else {
                state.users.push(seed.admin.clone());
                state
                    .settings
                    .insert(seed.admin.id, seed.admin_settings.clone());
                format!("created admin '{}'", seed.admin.username)
            };
            Ok(format!(
                "seeded {providers} providers, {models} models; {admin}"
            ))
        })
    }
}
