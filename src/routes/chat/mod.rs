mod handler;
mod model;

pub use handler::{
    append_message, chat_view, create_conversation, delete_conversation, delete_message,
    edit_message, get_quota, get_settings, list_conversations, list_messages, list_models,
    list_usage, rename_conversation, update_settings,
};
