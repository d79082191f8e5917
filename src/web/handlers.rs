use axum::{
    Json,
    async_trait,
    body::Bytes,
    extract::{FromRequestParts, Path, Query, State},
    http::{StatusCode, header::AUTHORIZATION, request::Parts},
};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use super::models::{
    ApiMessage, ApiResponse, ChangePasswordRequest, CreateUserRequest, DeclareRequest, DiagramQuery, JoinRequest,
    LoginRequest, LoginResponse, RowEdit, RowId, SaveSettingsRequest, SavedRow, TableForms,
};
use super::{Result, WebError};
use crate::context::AppContext;
use crate::schema::TableSummary;
use crate::settings::SettingsBundle;

pub type SharedContext = Arc<AppContext>;

/// User of the session named by the `Authorization: Bearer <token>` header.
pub struct AuthUser {
    pub username: String,
    pub token: Uuid,
}

#[async_trait]
impl FromRequestParts<SharedContext> for AuthUser {
    type Rejection = WebError;

    async fn from_request_parts(parts: &mut Parts, ctx: &SharedContext) -> Result<Self> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(|| WebError::Unauthorized("missing bearer token".to_string()))?;
        let token = Uuid::parse_str(token.trim())
            .map_err(|_| WebError::Unauthorized("malformed bearer token".to_string()))?;
        let username = ctx.auth().session_user(token).await?;
        Ok(Self { username, token })
    }
}

pub async fn healthcheck() -> Json<ApiResponse<ApiMessage>> {
    Json(ApiResponse {
        data: ApiMessage {
            message: "ok".to_string(),
        },
    })
}

pub async fn login(
    State(ctx): State<SharedContext>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<ApiResponse<LoginResponse>>> {
    let token = ctx.login(&payload.username, &payload.password).await?;
    Ok(Json(ApiResponse {
        data: LoginResponse {
            token: token.to_string(),
            username: payload.username,
        },
    }))
}

pub async fn logout(State(ctx): State<SharedContext>, user: AuthUser) -> StatusCode {
    ctx.auth().logout(user.token).await;
    StatusCode::NO_CONTENT
}

pub async fn create_user(
    State(ctx): State<SharedContext>,
    user: AuthUser,
    Json(payload): Json<CreateUserRequest>,
) -> Result<StatusCode> {
    ctx.create_user(&user.username, &payload.username, &payload.password)
        .await?;
    Ok(StatusCode::CREATED)
}

pub async fn list_users(State(ctx): State<SharedContext>, user: AuthUser) -> Result<Json<ApiResponse<Vec<String>>>> {
    Ok(Json(ApiResponse {
        data: ctx.list_users(&user.username).await?,
    }))
}

pub async fn delete_user(
    State(ctx): State<SharedContext>,
    user: AuthUser,
    Path(username): Path<String>,
) -> Result<StatusCode> {
    ctx.delete_user(&user.username, &username).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn change_password(
    State(ctx): State<SharedContext>,
    user: AuthUser,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<StatusCode> {
    ctx.change_password(&user.username, &payload.old_password, &payload.new_password)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_groups(
    State(ctx): State<SharedContext>,
    _user: AuthUser,
) -> Result<Json<ApiResponse<Vec<JsonValue>>>> {
    Ok(Json(ApiResponse {
        data: ctx.groups().await?,
    }))
}

pub async fn register_group(
    State(ctx): State<SharedContext>,
    user: AuthUser,
    Json(payload): Json<JsonValue>,
) -> Result<(StatusCode, Json<ApiResponse<SavedRow>>)> {
    let key = ctx.register_group(&user.username, &payload).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse { data: key.into() })))
}

pub async fn declare_table(
    State(ctx): State<SharedContext>,
    user: AuthUser,
    Json(payload): Json<DeclareRequest>,
) -> Result<(StatusCode, Json<ApiResponse<ApiMessage>>)> {
    ctx.declare_table(&user.username, &payload.name, payload.tier, &payload.definition)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse {
            data: ApiMessage {
                message: format!("declared {}", payload.name),
            },
        }),
    ))
}

pub async fn join_tables(
    State(ctx): State<SharedContext>,
    _user: AuthUser,
    Json(payload): Json<JoinRequest>,
) -> Result<Json<ApiResponse<Vec<JsonValue>>>> {
    Ok(Json(ApiResponse {
        data: ctx.join(&payload.tables, &payload.restriction).await?,
    }))
}

pub async fn list_tables(
    State(ctx): State<SharedContext>,
    _user: AuthUser,
) -> Json<ApiResponse<Vec<TableSummary>>> {
    Json(ApiResponse {
        data: ctx.tables().await,
    })
}

pub async fn refresh(State(ctx): State<SharedContext>, _user: AuthUser) -> Result<Json<ApiResponse<ApiMessage>>> {
    ctx.refresh().await?;
    Ok(Json(ApiResponse {
        data: ApiMessage {
            message: "schema refreshed".to_string(),
        },
    }))
}

pub async fn schema_diagram(
    State(ctx): State<SharedContext>,
    _user: AuthUser,
    Query(query): Query<DiagramQuery>,
) -> Result<String> {
    Ok(ctx
        .schema_diagram(query.schema.as_deref(), query.essential)
        .await?)
}

pub async fn get_form(
    State(ctx): State<SharedContext>,
    _user: AuthUser,
    Path(table): Path<String>,
) -> Result<Json<ApiResponse<TableForms>>> {
    let form = ctx.form_for(&table).await?;
    let settings_forms = ctx.settings_form_descriptors(&table).await?;
    Ok(Json(ApiResponse {
        data: TableForms { form, settings_forms },
    }))
}

pub async fn list_rows(
    State(ctx): State<SharedContext>,
    _user: AuthUser,
    Path(table): Path<String>,
) -> Result<Json<ApiResponse<Vec<JsonValue>>>> {
    Ok(Json(ApiResponse {
        data: ctx.rows(&table).await?,
    }))
}

pub async fn load_row(
    State(ctx): State<SharedContext>,
    _user: AuthUser,
    Path(table): Path<String>,
    Json(payload): Json<RowId>,
) -> Result<Json<ApiResponse<JsonValue>>> {
    Ok(Json(ApiResponse {
        data: ctx.load_row(&table, &payload.id).await?,
    }))
}

pub async fn insert_row(
    State(ctx): State<SharedContext>,
    _user: AuthUser,
    Path(table): Path<String>,
    Json(payload): Json<JsonValue>,
) -> Result<(StatusCode, Json<ApiResponse<SavedRow>>)> {
    let key = ctx.insert(&table, &payload).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse { data: key.into() })))
}

pub async fn update_row(
    State(ctx): State<SharedContext>,
    user: AuthUser,
    Path(table): Path<String>,
    Json(payload): Json<RowEdit>,
) -> Result<Json<ApiResponse<SavedRow>>> {
    let key = ctx
        .update(&table, &payload.id, &payload.values, &user.username)
        .await?;
    Ok(Json(ApiResponse { data: key.into() }))
}

pub async fn delete_row(
    State(ctx): State<SharedContext>,
    user: AuthUser,
    Path(table): Path<String>,
    Json(payload): Json<RowId>,
) -> Result<Json<ApiResponse<BTreeMap<String, usize>>>> {
    Ok(Json(ApiResponse {
        data: ctx.delete(&table, &payload.id, &user.username).await?,
    }))
}

pub async fn table_diagram(
    State(ctx): State<SharedContext>,
    _user: AuthUser,
    Path(table): Path<String>,
) -> Result<String> {
    Ok(ctx.table_diagram(&table).await?)
}

pub async fn upload(
    State(ctx): State<SharedContext>,
    _user: AuthUser,
    Path(filename): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<ApiResponse<ApiMessage>>)> {
    let path = ctx.store_upload(&filename, &body).await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse {
            data: ApiMessage {
                message: path.display().to_string(),
            },
        }),
    ))
}

pub async fn list_settings(
    State(ctx): State<SharedContext>,
    _user: AuthUser,
    Path(table): Path<String>,
) -> Result<Json<ApiResponse<Vec<SettingsBundle>>>> {
    Ok(Json(ApiResponse {
        data: ctx.list_settings(&table).await?,
    }))
}

pub async fn save_settings(
    State(ctx): State<SharedContext>,
    _user: AuthUser,
    Path(table): Path<String>,
    Json(payload): Json<SaveSettingsRequest>,
) -> Result<(StatusCode, Json<ApiResponse<SettingsBundle>>)> {
    let bundle = ctx
        .save_settings(&table, &payload.name, &payload.experiment_form, &payload.forms)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse { data: bundle })))
}

pub async fn get_settings(
    State(ctx): State<SharedContext>,
    _user: AuthUser,
    Path((table, id)): Path<(String, Uuid)>,
) -> Result<Json<ApiResponse<SettingsBundle>>> {
    Ok(Json(ApiResponse {
        data: ctx.load_settings(&table, id).await?,
    }))
}

pub async fn delete_settings(
    State(ctx): State<SharedContext>,
    _user: AuthUser,
    Path((table, id)): Path<(String, Uuid)>,
) -> Result<Json<ApiResponse<SettingsBundle>>> {
    Ok(Json(ApiResponse {
        data: ctx.delete_settings(&table, id).await?,
    }))
}

pub async fn settings_values(
    State(ctx): State<SharedContext>,
    _user: AuthUser,
    Path((table, id)): Path<(String, Uuid)>,
) -> Result<Json<ApiResponse<Map<String, JsonValue>>>> {
    Ok(Json(ApiResponse {
        data: ctx.settings_values(&table, id).await?,
    }))
}
