use crate::core::Restriction;
use crate::forms::FormDescriptor;
use crate::storage::Tier;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use std::collections::BTreeMap;

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub data: T,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiMessage {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub username: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct DeclareRequest {
    pub name: String,
    pub tier: Tier,
    pub definition: String,
}

#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    pub tables: Vec<String>,
    #[serde(default)]
    pub restriction: Map<String, Json>,
}

#[derive(Debug, Serialize)]
pub struct TableForms {
    pub form: FormDescriptor,
    pub settings_forms: BTreeMap<String, FormDescriptor>,
}

/// Primary key of a stored row, as listed under `_id`.
#[derive(Debug, Deserialize)]
pub struct RowId {
    #[serde(rename = "_id")]
    pub id: Json,
}

#[derive(Debug, Deserialize)]
pub struct RowEdit {
    #[serde(rename = "_id")]
    pub id: Json,
    pub values: Json,
}

#[derive(Debug, Serialize)]
pub struct SavedRow {
    #[serde(rename = "_id")]
    pub id: Map<String, Json>,
}

impl From<Restriction> for SavedRow {
    fn from(key: Restriction) -> Self {
        Self {
            id: key.into_iter().map(|(attr, value)| (attr, value.to_json())).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SaveSettingsRequest {
    pub name: String,
    #[serde(default)]
    pub experiment_form: Json,
    #[serde(default)]
    pub forms: Map<String, Json>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DiagramQuery {
    pub schema: Option<String>,
    #[serde(default)]
    pub essential: bool,
}
