//! JSON API over [`AppContext`](crate::context::AppContext).

pub mod app;
pub mod handlers;
pub mod models;

pub use app::build_router;

use crate::auth::AuthError;
use crate::context::ContextError;
use crate::core::DbError;
use crate::forms::ValidationErrors;
use crate::pipeline::InsertError;
use crate::settings::SettingsError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::error;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<BTreeMap<String, Vec<String>>>,
}

#[derive(Debug)]
pub enum WebError {
    Database(DbError),
    Validation(ValidationErrors),
    Input(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl From<DbError> for WebError {
    fn from(err: DbError) -> Self {
        WebError::Database(err)
    }
}

impl From<InsertError> for WebError {
    fn from(err: InsertError) -> Self {
        match err {
            InsertError::Validation(errors) => Self::Validation(errors),
            InsertError::Database(err) => Self::Database(err),
            InsertError::NothingUpdated(table) => Self::NotFound(format!("no entry of '{}' was updated", table)),
            InsertError::PartInsert { .. } => Self::Conflict(err.to_string()),
            InsertError::Field { .. } | InsertError::Parent { .. } => Self::Input(err.to_string()),
        }
    }
}

impl From<AuthError> for WebError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredentials | AuthError::InvalidSession => Self::Unauthorized(err.to_string()),
            AuthError::Inactive(_) => Self::Forbidden(err.to_string()),
            AuthError::UserExists(_) | AuthError::LastAdmin => Self::Conflict(err.to_string()),
            AuthError::UserNotFound(_) => Self::NotFound(err.to_string()),
            AuthError::InvalidInput(msg) => Self::Input(msg),
            AuthError::Hash(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<SettingsError> for WebError {
    fn from(err: SettingsError) -> Self {
        match err {
            SettingsError::NotFound(_) => Self::NotFound(err.to_string()),
            SettingsError::InvalidName(_) => Self::Input(err.to_string()),
            SettingsError::Io { .. } | SettingsError::Json { .. } | SettingsError::Lock => {
                Self::Internal(err.to_string())
            }
        }
    }
}

impl From<ContextError> for WebError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Database(err) => Self::Database(err),
            ContextError::Insert(err) => Self::from(err),
            ContextError::Validation(errors) => Self::Validation(errors),
            ContextError::Settings(err) => Self::from(err),
            ContextError::Auth(err) => Self::from(err),
            ContextError::PermissionDenied { .. } | ContextError::AdminOnly(_) => Self::Forbidden(err.to_string()),
            ContextError::Field(_)
            | ContextError::UnknownForm { .. }
            | ContextError::InvalidRowId(_)
            | ContextError::InvalidUpload(_)
            | ContextError::EmptyJoin => Self::Input(err.to_string()),
            ContextError::NoGroupTable => Self::NotFound(err.to_string()),
            ContextError::Io { .. } => Self::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let mut fields = None;
        let (status, message, code) = match self {
            WebError::Database(err @ (DbError::TableExists(_) | DbError::DuplicateEntry { .. })) => {
                (StatusCode::CONFLICT, err.to_string(), "conflict")
            }
            WebError::Database(err @ (DbError::ForeignKeyViolation(_) | DbError::ConstraintViolation(_))) => {
                (StatusCode::CONFLICT, err.to_string(), "constraint_violation")
            }
            WebError::Database(
                err @ (DbError::TableNotFound(_) | DbError::AttributeNotFound(..) | DbError::MissingRow(_)),
            ) => (StatusCode::NOT_FOUND, err.to_string(), "not_found"),
            WebError::Database(err @ (DbError::ParseError(_) | DbError::TypeMismatch(_))) => {
                (StatusCode::BAD_REQUEST, err.to_string(), "type_mismatch")
            }
            WebError::Database(err) => {
                error!(error = %err, "database error");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string(), "database_error")
            }

            WebError::Validation(errors) => {
                let message = errors.to_string();
                fields = Some(errors.errors);
                (StatusCode::UNPROCESSABLE_ENTITY, message, "validation_error")
            }
            WebError::Input(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg, "input_error"),
            WebError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg, "unauthorized"),
            WebError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg, "forbidden"),
            WebError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, "not_found"),
            WebError::Conflict(msg) => (StatusCode::CONFLICT, msg, "conflict"),
            WebError::Internal(msg) => {
                error!(error = %msg, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg, "internal_error")
            }
        };

        let body = Json(ErrorResponse {
            error: message,
            code: code.to_string(),
            fields,
        });

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, WebError>;
