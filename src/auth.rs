//! Accounts, sessions and the per-request access gate.

use std::sync::Arc;

use anyhow::anyhow;
use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{
    Extension, Json,
    extract::{FromRequestParts, State, rejection::JsonRejection},
    http::{HeaderValue, header, request::Parts},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::Utc;
use dashmap::DashMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{
    ApiError, ApiErrorWithMeta, E_BAD_CREDENTIALS, E_EMAIL_TAKEN, E_FORBIDDEN, E_UNAUTHENTICATED,
    invalid, json_body, store_failure,
};
use crate::referral_code;
use crate::responses::{ApiOk, RequestMeta};
use crate::types::{AppState, LoginRequest, NewUser, RegisterRequest, User};

/// Maps opaque session tokens to user ids.
#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<DashMap<String, i64>>,
}

impl SessionStore {
    /// Opens a session for `user_id` and returns its token.
    pub fn create(&self, user_id: i64) -> String {
        let token = Uuid::new_v4().simple().to_string();
        self.sessions.insert(token.clone(), user_id);
        token
    }

    pub fn user_id(&self, token: &str) -> Option<i64> {
        self.sessions.get(token).map(|entry| *entry)
    }

    pub fn remove(&self, token: &str) -> Option<i64> {
        self.sessions.remove(token).map(|(_, user_id)| user_id)
    }
}

pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow!("hashing password: {e}"))?;
    Ok(hash.to_string())
}

/// False for a wrong password and for an unparseable stored hash.
pub fn verify_password(password: &str, stored: &str) -> bool {
    PasswordHash::new(stored)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

fn request_meta(parts: &Parts) -> RequestMeta {
    parts
        .extensions
        .get::<RequestMeta>()
        .cloned()
        .unwrap_or_else(RequestMeta::new)
}

fn session_token(headers: &axum::http::HeaderMap, cookie_name: &str) -> Option<String> {
    CookieJar::from_headers(headers)
        .get(cookie_name)
        .map(|c| c.value().to_string())
}

fn session_cookie(name: &str, token: String) -> Cookie<'static> {
    Cookie::build((name.to_string(), token))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .build()
}

fn cookie_header(
    cookie: &Cookie<'_>,
    meta: &RequestMeta,
) -> Result<HeaderValue, ApiErrorWithMeta> {
    HeaderValue::from_str(&cookie.to_string())
        .map_err(|e| ApiError::Internal(e.into()).with_meta(meta.clone()))
}

/// An authenticated caller. Rejects with 401 when there is no live session.
pub struct CurrentUser(pub User);

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiErrorWithMeta;

    async fn from_request_parts(
        parts: &mut Parts,
        st: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let meta = request_meta(parts);
        let unauthenticated = || {
            ApiError::Unauthorized
                .with_meta(meta.clone())
                .with_code(E_UNAUTHENTICATED)
        };

        let user_id = session_token(&parts.headers, &st.config.session_cookie)
            .and_then(|token| st.sessions.user_id(&token))
            .ok_or_else(unauthenticated)?;

        let user = st
            .storage
            .get_user(user_id)
            .await
            .map_err(|e| store_failure(e, &meta))?
            .ok_or_else(unauthenticated)?;

        Ok(CurrentUser(user))
    }
}

/// An authenticated administrator. Rejects with 401 without a session and
/// 403 for non-admin users. The session check runs first, so an anonymous
/// caller on an admin route sees 401, not 403.
pub struct AdminUser(pub User);

impl FromRequestParts<AppState> for AdminUser {
    type Rejection = ApiErrorWithMeta;

    async fn from_request_parts(
        parts: &mut Parts,
        st: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let CurrentUser(user) = CurrentUser::from_request_parts(parts, st).await?;
        if !user.is_admin {
            warn!(user_id = user.id, "admin operation refused");
            return Err(ApiError::Forbidden
                .with_meta(request_meta(parts))
                .with_code(E_FORBIDDEN));
        }
        Ok(AdminUser(user))
    }
}

pub async fn register_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<ApiOk<User>, ApiErrorWithMeta> {
    let reg = json_body(body, &meta)?
        .into_registration()
        .map_err(|errors| invalid(errors, &meta))?;

    let existing = st
        .storage
        .get_user_by_email(&reg.email)
        .await
        .map_err(|e| store_failure(e, &meta))?;
    if existing.is_some() {
        return Err(ApiError::Conflict("email already registered".into())
            .with_meta(meta)
            .with_code(E_EMAIL_TAKEN));
    }

    let password_hash = hash_password(&reg.password)
        .map_err(|e| ApiError::Internal(e).with_meta(meta.clone()))?;
    let referral_code = referral_code::generate(&reg.name, Utc::now());
    let is_admin = st.config.is_admin_email(&reg.email);

    let user = st
        .storage
        .create_user(NewUser {
            name: reg.name,
            email: reg.email,
            phone: reg.phone,
            password_hash,
            referral_code,
            is_admin,
        })
        .await
        .map_err(|e| store_failure(e, &meta))?;

    let linked = st
        .storage
        .link_referred_user(&user.email, user.id)
        .await
        .map_err(|e| store_failure(e, &meta))?;
    info!(user_id = user.id, referral_code = %user.referral_code, linked, "user registered");

    let token = st.sessions.create(user.id);
    let cookie = cookie_header(&session_cookie(&st.config.session_cookie, token), &meta)?;
    Ok(ApiOk::created("user registered", user, meta).with_header(header::SET_COOKIE, cookie))
}

pub async fn login_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<ApiOk<User>, ApiErrorWithMeta> {
    let req = json_body(body, &meta)?;
    let user = st
        .storage
        .get_user_by_email(req.email.trim())
        .await
        .map_err(|e| store_failure(e, &meta))?
        .filter(|u| verify_password(&req.password, &u.password))
        .ok_or_else(|| {
            ApiError::Unauthorized
                .with_meta(meta.clone())
                .with_code(E_BAD_CREDENTIALS)
        })?;

    let token = st.sessions.create(user.id);
    let cookie = cookie_header(&session_cookie(&st.config.session_cookie, token), &meta)?;
    info!(user_id = user.id, "user logged in");
    Ok(ApiOk::ok("logged in", user, meta).with_header(header::SET_COOKIE, cookie))
}

pub async fn logout_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    jar: CookieJar,
) -> Result<ApiOk<()>, ApiErrorWithMeta> {
    if let Some(user_id) = jar
        .get(&st.config.session_cookie)
        .and_then(|c| st.sessions.remove(c.value()))
    {
        info!(user_id, "user logged out");
    }

    let mut removal = session_cookie(&st.config.session_cookie, String::new());
    removal.make_removal();
    let cookie = cookie_header(&removal, &meta)?;
    Ok(ApiOk::ok("logged out", (), meta).with_header(header::SET_COOKIE, cookie))
}

pub async fn current_user_handler(
    CurrentUser(user): CurrentUser,
    Extension(meta): Extension<RequestMeta>,
) -> ApiOk<User> {
    ApiOk::ok("user fetched", user, meta)
}
