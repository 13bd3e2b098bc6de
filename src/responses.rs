use axum::{
    Json,
    body::Body,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Clone, Debug, Serialize)]
pub struct RequestMeta {
    pub request_id: String,
    pub request_at: String, // RFC3339
    pub timestamp: i64,     // unix seconds
}

impl RequestMeta {
    pub(crate) fn new() -> Self {
        let now: DateTime<Utc> = Utc::now();
        RequestMeta {
            request_id: Uuid::new_v4().to_string(),
            request_at: now.to_rfc3339(),
            timestamp: now.timestamp(),
        }
    }
}

// Middleware: attaches RequestMeta into request extensions
pub async fn meta_middleware(mut req: Request<Body>, next: Next) -> Response {
    req.extensions_mut().insert(RequestMeta::new());
    next.run(req).await
}

#[derive(Serialize)]
pub struct SuccessEnvelope<T> {
    pub message: String,
    pub data: T,
    pub meta: RequestMeta,
}

pub struct ApiOk<T> {
    status: StatusCode,
    body: SuccessEnvelope<T>,
    headers: Vec<(axum::http::HeaderName, axum::http::HeaderValue)>,
}

impl<T> ApiOk<T> {
    fn with_status(
        status: StatusCode,
        message: impl Into<String>,
        data: T,
        meta: RequestMeta,
    ) -> Self {
        Self {
            status,
            body: SuccessEnvelope {
                message: message.into(),
                data,
                meta,
            },
            headers: Vec::new(),
        }
    }

    pub fn ok(message: impl Into<String>, data: T, meta: RequestMeta) -> Self {
        Self::with_status(StatusCode::OK, message, data, meta)
    }

    pub fn created(message: impl Into<String>, data: T, meta: RequestMeta) -> Self {
        Self::with_status(StatusCode::CREATED, message, data, meta)
    }

    /// Attaches an extra response header, e.g. `Set-Cookie`.
    pub fn with_header(
        mut self,
        name: axum::http::HeaderName,
        value: axum::http::HeaderValue,
    ) -> Self {
        self.headers.push((name, value));
        self
    }
}

impl<T: Serialize> IntoResponse for ApiOk<T> {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.body)).into_response();
        for (name, value) in self.headers {
            response.headers_mut().append(name, value);
        }
        response
    }
}
