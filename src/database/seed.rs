// 初始数据：提供商、模型和管理员账号

use chrono::{DateTime, Utc};

use super::models::{ChatModel, Provider, Role, User, UserSettings};

#[derive(Debug, Clone)]
pub struct SeedData {
    pub providers: Vec<Provider>,
    pub models: Vec<ChatModel>,
    pub admin: User,
    pub admin_settings: UserSettings,
}

impl SeedData {
    pub fn standard(admin_username: &str, admin_password_hash: String, now: DateTime<Utc>) -> Self {
        let providers = vec![
            provider("openai", "OpenAI"),
            provider("anthropic", "Anthropic"),
            provider("google", "Google"),
        ];
        let models = vec![
            model("gpt-4o", "openai", "GPT-4o", Some(0.0025), Some(0.01)),
            model("gpt-4o-mini", "openai", "GPT-4o mini", Some(0.00015), Some(0.0006)),
            model(
                "claude-3-5-sonnet",
                "anthropic",
                "Claude 3.5 Sonnet",
                Some(0.003),
                Some(0.015),
            ),
            model(
                "claude-3-5-haiku",
                "anthropic",
                "Claude 3.5 Haiku",
                Some(0.0008),
                Some(0.004),
            ),
            model("gemini-1.5-pro", "google", "Gemini 1.5 Pro", None, None),
        ];
        let admin = User::new(admin_username, None, Some(admin_password_hash), Role::Admin, now);
        let admin_settings = UserSettings::default_for(admin.id);
        Self {
            providers,
            models,
            admin,
            admin_settings,
        }
    }
}

fn provider(id: &str, display_name: &str) -> Provider {
    Provider {
        id: id.to_string(),
        name: id.to_string(),
        display_name: display_name.to_string(),
    }
}

fn model(
    id: &str,
    provider_id: &str,
    display_name: &str,
    input_price_per_1k: Option<f64>,
    output_price_per_1k: Option<f64>,
) -> ChatModel {
    ChatModel {
        id: id.to_string(),
        provider_id: provider_id.to_string(),
        name: id.to_string(),
        display_name: display_name.to_string(),
        input_price_per_1k,
        output_price_per_1k,
    }
}
