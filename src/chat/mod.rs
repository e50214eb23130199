// 聊天展示层

pub mod view;

pub use view::{ChatUiState, ChatView, TitleEditOutcome, TitleKey, normalize_title};
