use axum::{
    Json,
    extract::{
        Path,
        rejection::{JsonRejection, PathRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use tracing::error;
use validator::ValidationErrors;

use crate::responses::RequestMeta;
use crate::store::StoreError;

pub const E_UNAUTHENTICATED: &str = "UNAUTHENTICATED";
pub const E_FORBIDDEN: &str = "FORBIDDEN";
pub const E_INVALID_BODY: &str = "INVALID_BODY";
pub const E_INVALID_ID: &str = "INVALID_ID";
pub const E_VALIDATION: &str = "VALIDATION_FAILED";
pub const E_INVALID_STATUS: &str = "INVALID_STATUS";
pub const E_INVALID_TRANSITION: &str = "INVALID_TRANSITION";
pub const E_NOT_FOUND: &str = "NOT_FOUND";
pub const E_EMAIL_TAKEN: &str = "EMAIL_TAKEN";
pub const E_DUPLICATE: &str = "DUPLICATE";
pub const E_ALREADY_PAID: &str = "ALREADY_PAID";
pub const E_BAD_CREDENTIALS: &str = "BAD_CREDENTIALS";
pub const E_DB_FAILURE: &str = "DB_FAILURE";

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Flattens validator output into per-field errors named the way clients
/// send them, ordered by field.
pub fn field_errors(errors: &ValidationErrors) -> Vec<FieldError> {
    let mut out: Vec<FieldError> = errors
        .field_errors()
        .into_iter()
        .flat_map(|(field, errs)| {
            let field = camel_case(&field);
            errs.iter().map(move |e| FieldError {
                field: field.clone(),
                message: e
                    .message
                    .as_deref()
                    .map_or_else(|| e.code.to_string(), str::to_string),
            })
        })
        .collect();
    out.sort_by(|a, b| a.field.cmp(&b.field));
    out
}

fn camel_case(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut upper = false;
    for c in field.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Forbidden,
    BadRequest(String),
    Validation(Vec<FieldError>),
    NotFound(String),
    Conflict(String),
    Internal(anyhow::Error),
}

#[derive(Debug)]
pub struct ApiErrorWithMeta {
    error: ApiError,
    meta: RequestMeta,
    code: Option<String>,
}

impl ApiError {
    pub fn with_meta(self, meta: RequestMeta) -> ApiErrorWithMeta {
        ApiErrorWithMeta {
            error: self,
            meta,
            code: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::BadRequest(_) | ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::UniqueViolation { constraint } => ApiError::Conflict(match constraint {
                Some(c) => format!("record already exists ({c})"),
                None => "record already exists".to_string(),
            }),
            other => ApiError::Internal(other.into()),
        }
    }
}

impl ApiErrorWithMeta {
    pub fn with_code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }
}

/// Maps a storage failure to a response, keeping uniqueness violations
/// distinguishable from generic database failures.
pub fn store_failure(e: StoreError, meta: &RequestMeta) -> ApiErrorWithMeta {
    let code = if e.is_unique_violation() {
        E_DUPLICATE
    } else {
        E_DB_FAILURE
    };
    ApiError::from(e).with_meta(meta.clone()).with_code(code)
}

/// Unwraps a JSON body, turning malformed input into a 400 with our own body.
pub fn json_body<T>(
    body: Result<Json<T>, JsonRejection>,
    meta: &RequestMeta,
) -> Result<T, ApiErrorWithMeta> {
    body.map(|Json(v)| v).map_err(|rejection| {
        ApiError::BadRequest(rejection.body_text())
            .with_meta(meta.clone())
            .with_code(E_INVALID_BODY)
    })
}

/// Unwraps a numeric path id, answering a malformed one with our own body.
pub fn path_id(
    path: Result<Path<i64>, PathRejection>,
    meta: &RequestMeta,
) -> Result<i64, ApiErrorWithMeta> {
    path.map(|Path(id)| id).map_err(|rejection| {
        ApiError::BadRequest(rejection.body_text())
            .with_meta(meta.clone())
            .with_code(E_INVALID_ID)
    })
}

/// Wraps field errors from a request validator.
pub fn invalid(errors: Vec<FieldError>, meta: &RequestMeta) -> ApiErrorWithMeta {
    ApiError::Validation(errors)
        .with_meta(meta.clone())
        .with_code(E_VALIDATION)
}

impl IntoResponse for ApiErrorWithMeta {
    fn into_response(self) -> Response {
        let status = self.error.status();
        let mut field_errors = None;
        let error_message = match self.error {
            ApiError::Unauthorized => "authentication required".to_string(),
            ApiError::Forbidden => "permission denied".to_string(),
            ApiError::BadRequest(msg) | ApiError::NotFound(msg) | ApiError::Conflict(msg) => msg,
            ApiError::Validation(errors) => {
                field_errors = Some(errors);
                "invalid data".to_string()
            }
            ApiError::Internal(e) => {
                error!("internal error: {:?}", e);
                "internal server error".to_string()
            }
        };

        let mut body = json!({
            "request_id": self.meta.request_id,
            "error": error_message,
        });
        if let Some(code) = self.code {
            body["code"] = json!(code);
        }
        if let Some(errors) = field_errors {
            body["errors"] = json!(errors);
        }

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_names_follow_the_wire_format() {
        assert_eq!(camel_case("account_holder_name"), "accountHolderName");
        assert_eq!(camel_case("email"), "email");
    }
}
