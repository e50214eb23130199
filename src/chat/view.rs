//! 聊天界面的视图模型
//!
//! 侧边栏、消息列表、模型选择器和标题编辑的纯逻辑。数据与回调都由调用方提供，
//! 这里只保存抽屉开关、正在编辑的标题、打开的菜单这类临时状态。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::database::models::{ChatModel, Conversation, Message, MessageRole, Provider};

/// 对话标题最多 8 个字符
pub const TITLE_MAX_CHARS: usize = 8;

/// 去掉首尾空白并截断到 8 个字符；结果为空时不保存
pub fn normalize_title(raw: &str) -> Option<String> {
    let title: String = raw.trim().chars().take(TITLE_MAX_CHARS).collect();
    let title = title.trim_end().to_string();
    if title.is_empty() { None } else { Some(title) }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageAction {
    Copy,
    Edit,
    Delete,
    Retry,
}

pub fn message_actions(role: MessageRole) -> &'static [MessageAction] {
    match role {
        MessageRole::User => &[MessageAction::Copy, MessageAction::Edit, MessageAction::Delete],
        MessageRole::Assistant => &[
            MessageAction::Copy,
            MessageAction::Delete,
            MessageAction::Retry,
        ],
        MessageRole::System => &[MessageAction::Copy],
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SidebarItem {
    pub id: Uuid,
    pub title: String,
    pub model_id: String,
    pub updated_at: DateTime<Utc>,
    pub selected: bool,
}

/// 最近更新的对话排在前面
pub fn sidebar(mut conversations: Vec<Conversation>, selected: Option<Uuid>) -> Vec<SidebarItem> {
    conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    conversations
        .into_iter()
        .map(|c| SidebarItem {
            selected: selected == Some(c.id),
            id: c.id,
            title: c.title,
            model_id: c.model_id,
            updated_at: c.updated_at,
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadItem {
    #[serde(flatten)]
    pub message: Message,
    pub actions: Vec<MessageAction>,
}

pub fn thread(mut messages: Vec<Message>) -> Vec<ThreadItem> {
    messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    messages
        .into_iter()
        .map(|message| ThreadItem {
            actions: message_actions(message.role).to_vec(),
            message,
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelGroup {
    pub name: String,
    pub display_name: String,
    pub models: Vec<ChatModel>,
}

/// 按提供商分组。用户配置的顺序优先，未配置的分组按名称排在后面，空分组不显示。
pub fn group_models(
    providers: &[Provider],
    models: Vec<ChatModel>,
    group_order: &[String],
) -> Vec<ModelGroup> {
    let mut by_provider: HashMap<&str, Vec<ChatModel>> = HashMap::new();
    for model in models {
        if let Some(provider) = providers.iter().find(|p| p.id == model.provider_id) {
            by_provider.entry(provider.id.as_str()).or_default().push(model);
        }
    }

    let mut groups: Vec<ModelGroup> = providers
        .iter()
        .filter_map(|provider| {
            let mut models = by_provider.remove(provider.id.as_str())?;
            models.sort_by(|a, b| a.display_name.cmp(&b.display_name));
            Some(ModelGroup {
                name: provider.name.clone(),
                display_name: provider.display_name.clone(),
                models,
            })
        })
        .collect();

    let rank = |name: &str| {
        group_order
            .iter()
            .position(|g| g == name)
            .unwrap_or(usize::MAX)
    };
    groups.sort_by(|a, b| {
        rank(&a.name)
            .cmp(&rank(&b.name))
            .then_with(|| a.name.cmp(&b.name))
    });
    groups
}

/// 聊天页面的完整投影
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatView {
    pub sidebar: Vec<SidebarItem>,
    pub selected_conversation_id: Option<Uuid>,
    pub thread: Vec<ThreadItem>,
    pub model_groups: Vec<ModelGroup>,
    pub selected_model_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TitleKey {
    Enter,
    Escape,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TitleEditOutcome {
    /// 仍在编辑
    Editing,
    Save { conversation_id: Uuid, title: String },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleDraft {
    pub conversation_id: Uuid,
    pub text: String,
}

/// 界面临时状态
#[derive(Debug, Clone, Default)]
pub struct ChatUiState {
    pub drawer_open: bool,
    pub editing: Option<TitleDraft>,
    /// 当前打开操作菜单的消息
    pub menu_anchor: Option<Uuid>,
}

impl ChatUiState {
    pub fn toggle_drawer(&mut self) {
        self.drawer_open = !self.drawer_open;
    }

    pub fn begin_title_edit(&mut self, conversation_id: Uuid, current: &str) {
        self.editing = Some(TitleDraft {
            conversation_id,
            text: current.to_string(),
        });
    }

    pub fn update_draft(&mut self, text: &str) {
        if let Some(draft) = &mut self.editing {
            draft.text = text.to_string();
        }
    }

    pub fn key(&mut self, key: TitleKey) -> TitleEditOutcome {
        match key {
            TitleKey::Enter => self.commit(),
            TitleKey::Escape => {
                self.editing = None;
                TitleEditOutcome::Cancelled
            }
            TitleKey::Other => TitleEditOutcome::Editing,
        }
    }

    pub fn blur(&mut self) -> TitleEditOutcome {
        self.commit()
    }

    fn commit(&mut self) -> TitleEditOutcome {
        let Some(draft) = self.editing.take() else {
            return TitleEditOutcome::Cancelled;
        };
        match normalize_title(&draft.text) {
            Some(title) => TitleEditOutcome::Save {
                conversation_id: draft.conversation_id,
                title,
            },
            None => TitleEditOutcome::Cancelled,
        }
    }

    pub fn open_menu(&mut self, message_id: Uuid) {
        self.menu_anchor = Some(message_id);
    }

    pub fn close_menu(&mut self) {
        self.menu_anchor = None;
    }
}
