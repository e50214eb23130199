use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccessCodeRequest {
    pub max_uses: Option<i32>,
    pub expires_in_days: Option<i64>,
    pub allowed_models: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct DeleteAccessCodeResponse {
    pub id: Uuid,
    pub deleted: bool,
}
