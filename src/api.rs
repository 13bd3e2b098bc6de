use axum::{
    Extension, Json, Router,
    extract::{
        Path, State,
        rejection::{JsonRejection, PathRejection},
    },
    middleware,
    routing::{get, patch, post},
};
use chrono::Utc;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info};

use crate::auth::{
    AdminUser, CurrentUser, current_user_handler, login_handler, logout_handler, register_handler,
};
use crate::error::{
    ApiError, ApiErrorWithMeta, E_ALREADY_PAID, E_INVALID_STATUS, E_INVALID_TRANSITION,
    E_NOT_FOUND, FieldError, invalid, json_body, path_id, store_failure,
};
use crate::responses::{ApiOk, RequestMeta, meta_middleware};
use crate::stats::{AdminStats, UserStats};
use crate::status::{self, Lifecycle, PayoutStatus, ReferralStatus};
use crate::types::{
    AppState, BankDetails, BankDetailsRequest, CreatePayoutRequest, CreateReferralRequest, Payout,
    Referral, StatusUpdateRequest,
};

/// Builds the application router.
///
/// Admin routes check the session before the role, so a caller without a
/// live session gets 401 and not the 403 a signed-in non-admin gets.
pub fn init_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/register", post(register_handler))
        .route("/api/login", post(login_handler))
        .route("/api/logout", post(logout_handler))
        .route("/api/user", get(current_user_handler))
        .route(
            "/api/bank-details",
            get(get_bank_details_handler)
                .post(create_bank_details_handler)
                .put(update_bank_details_handler),
        )
        .route(
            "/api/referrals",
            get(list_referrals_handler).post(create_referral_handler),
        )
        .route("/api/user-stats", get(user_stats_handler))
        .route("/api/payouts", get(list_payouts_handler))
        .route("/api/admin/stats", get(admin_stats_handler))
        .route("/api/admin/referrals", get(admin_list_referrals_handler))
        .route(
            "/api/admin/referrals/{id}",
            patch(admin_update_referral_handler),
        )
        .route(
            "/api/admin/payouts",
            get(admin_list_payouts_handler).post(admin_create_payout_handler),
        )
        .route("/api/admin/payouts/{id}", patch(admin_update_payout_handler))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(middleware::from_fn(meta_middleware))
}

fn not_found(what: &str, meta: &RequestMeta) -> ApiErrorWithMeta {
    ApiError::NotFound(format!("{what} not found"))
        .with_meta(meta.clone())
        .with_code(E_NOT_FOUND)
}

/// Parses the requested status, rejecting anything outside the lifecycle.
fn requested_status<S>(
    req: &StatusUpdateRequest,
    meta: &RequestMeta,
) -> Result<S, ApiErrorWithMeta>
where
    S: Lifecycle + std::str::FromStr,
{
    req.status_str()
        .and_then(|s| s.parse::<S>().ok())
        .ok_or_else(|| {
            ApiError::BadRequest("invalid status".into())
                .with_meta(meta.clone())
                .with_code(E_INVALID_STATUS)
        })
}

fn invalid_transition(e: status::TransitionError, meta: &RequestMeta) -> ApiErrorWithMeta {
    ApiError::Conflict(e.to_string())
        .with_meta(meta.clone())
        .with_code(E_INVALID_TRANSITION)
}

async fn get_bank_details_handler(
    State(st): State<AppState>,
    CurrentUser(user): CurrentUser,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<Option<BankDetails>>, ApiErrorWithMeta> {
    let details = st
        .storage
        .get_bank_details(user.id)
        .await
        .map_err(|e| store_failure(e, &meta))?;

    Ok(ApiOk::ok("bank details fetched", details, meta))
}

async fn create_bank_details_handler(
    State(st): State<AppState>,
    CurrentUser(user): CurrentUser,
    Extension(meta): Extension<RequestMeta>,
    body: Result<Json<BankDetailsRequest>, JsonRejection>,
) -> Result<ApiOk<BankDetails>, ApiErrorWithMeta> {
    let input = json_body(body, &meta)?
        .into_input()
        .map_err(|errors| invalid(errors, &meta))?;

    let details = st
        .storage
        .upsert_bank_details(user.id, input)
        .await
        .map_err(|e| store_failure(e, &meta))?;

    info!(user_id = user.id, "bank details saved");
    Ok(ApiOk::created("bank details saved", details, meta))
}

async fn update_bank_details_handler(
    State(st): State<AppState>,
    CurrentUser(user): CurrentUser,
    Extension(meta): Extension<RequestMeta>,
    body: Result<Json<BankDetailsRequest>, JsonRejection>,
) -> Result<ApiOk<BankDetails>, ApiErrorWithMeta> {
    let input = json_body(body, &meta)?
        .into_input()
        .map_err(|errors| invalid(errors, &meta))?;

    let details = st
        .storage
        .update_bank_details(user.id, input)
        .await
        .map_err(|e| store_failure(e, &meta))?
        .ok_or_else(|| not_found("bank details", &meta))?;

    info!(user_id = user.id, "bank details updated");
    Ok(ApiOk::ok("bank details updated", details, meta))
}

async fn list_referrals_handler(
    State(st): State<AppState>,
    CurrentUser(user): CurrentUser,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<Vec<Referral>>, ApiErrorWithMeta> {
    let referrals = st
        .storage
        .get_referrals(user.id)
        .await
        .map_err(|e| store_failure(e, &meta))?;

    Ok(ApiOk::ok("referrals fetched", referrals, meta))
}

async fn create_referral_handler(
    State(st): State<AppState>,
    CurrentUser(user): CurrentUser,
    Extension(meta): Extension<RequestMeta>,
    body: Result<Json<CreateReferralRequest>, JsonRejection>,
) -> Result<ApiOk<Referral>, ApiErrorWithMeta> {
    let new = json_body(body, &meta)?
        .into_new_referral(user.id, st.config.reward_amount)
        .map_err(|errors| invalid(errors, &meta))?;

    let referral = st
        .storage
        .create_referral(new)
        .await
        .map_err(|e| store_failure(e, &meta))?;

    info!(referral_id = referral.id, referrer_id = user.id, "referral created");
    Ok(ApiOk::created("referral created", referral, meta))
}

async fn user_stats_handler(
    State(st): State<AppState>,
    CurrentUser(user): CurrentUser,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<UserStats>, ApiErrorWithMeta> {
    let stats = st
        .storage
        .get_user_stats(user.id)
        .await
        .map_err(|e| store_failure(e, &meta))?;

    Ok(ApiOk::ok("user stats fetched", stats, meta))
}

async fn list_payouts_handler(
    State(st): State<AppState>,
    CurrentUser(user): CurrentUser,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<Vec<Payout>>, ApiErrorWithMeta> {
    let payouts = st
        .storage
        .get_payouts(user.id)
        .await
        .map_err(|e| store_failure(e, &meta))?;

    Ok(ApiOk::ok("payouts fetched", payouts, meta))
}

async fn admin_stats_handler(
    State(st): State<AppState>,
    AdminUser(_): AdminUser,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<AdminStats>, ApiErrorWithMeta> {
    let stats = st
        .storage
        .get_admin_stats()
        .await
        .map_err(|e| store_failure(e, &meta))?;

    Ok(ApiOk::ok("admin stats fetched", stats, meta))
}

async fn admin_list_referrals_handler(
    State(st): State<AppState>,
    AdminUser(_): AdminUser,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<Vec<Referral>>, ApiErrorWithMeta> {
    let referrals = st
        .storage
        .get_all_referrals()
        .await
        .map_err(|e| store_failure(e, &meta))?;

    Ok(ApiOk::ok("referrals fetched", referrals, meta))
}

async fn admin_update_referral_handler(
    State(st): State<AppState>,
    AdminUser(admin): AdminUser,
    Extension(meta): Extension<RequestMeta>,
    path: Result<Path<i64>, PathRejection>,
    body: Result<Json<StatusUpdateRequest>, JsonRejection>,
) -> Result<ApiOk<Referral>, ApiErrorWithMeta> {
    let id = path_id(path, &meta)?;
    let req = json_body(body, &meta)?;
    let target: ReferralStatus = requested_status(&req, &meta)?;

    let referral = st
        .storage
        .get_referral(id)
        .await
        .map_err(|e| store_failure(e, &meta))?
        .ok_or_else(|| not_found("referral", &meta))?;

    let completed_at = status::transition(referral.status, target, Utc::now())
        .map_err(|e| invalid_transition(e, &meta))?;
    if target == referral.status {
        return Ok(ApiOk::ok("referral unchanged", referral, meta));
    }

    let updated = st
        .storage
        .update_referral_status(id, target, completed_at)
        .await
        .map_err(|e| store_failure(e, &meta))?
        .ok_or_else(|| not_found("referral", &meta))?;

    info!(admin_id = admin.id, referral_id = id, status = %target, "referral status updated");
    Ok(ApiOk::ok("referral updated", updated, meta))
}

async fn admin_list_payouts_handler(
    State(st): State<AppState>,
    AdminUser(_): AdminUser,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<Vec<Payout>>, ApiErrorWithMeta> {
    let payouts = st
        .storage
        .get_all_payouts()
        .await
        .map_err(|e| store_failure(e, &meta))?;

    Ok(ApiOk::ok("payouts fetched", payouts, meta))
}

async fn admin_create_payout_handler(
    State(st): State<AppState>,
    AdminUser(admin): AdminUser,
    Extension(meta): Extension<RequestMeta>,
    body: Result<Json<CreatePayoutRequest>, JsonRejection>,
) -> Result<ApiOk<Payout>, ApiErrorWithMeta> {
    let new = json_body(body, &meta)?
        .into_new_payout()
        .map_err(|errors| invalid(errors, &meta))?;

    st.storage
        .get_user(new.user_id)
        .await
        .map_err(|e| store_failure(e, &meta))?
        .ok_or_else(|| not_found("user", &meta))?;

    // Every referral must be a completed referral of the payee.
    let mut errors = Vec::new();
    for &referral_id in &new.referral_ids {
        let referral = st
            .storage
            .get_referral(referral_id)
            .await
            .map_err(|e| store_failure(e, &meta))?;
        match referral {
            Some(r) if r.referrer_id == new.user_id && r.status == ReferralStatus::Completed => {}
            _ => errors.push(FieldError::new(
                "referralIds",
                format!(
                    "referral {referral_id} is not a completed referral of user {}",
                    new.user_id
                ),
            )),
        }
    }
    if !errors.is_empty() {
        return Err(invalid(errors, &meta));
    }

    // A referral is paid at most once unless its payout failed.
    let covered = st
        .storage
        .covered_referral_ids(&new.referral_ids)
        .await
        .map_err(|e| store_failure(e, &meta))?;
    if !covered.is_empty() {
        let ids: Vec<String> = covered.iter().map(i64::to_string).collect();
        return Err(ApiError::Conflict(format!(
            "referrals already paid out: {}",
            ids.join(", ")
        ))
        .with_meta(meta)
        .with_code(E_ALREADY_PAID));
    }

    let payout = st
        .storage
        .create_payout(new)
        .await
        .map_err(|e| store_failure(e, &meta))?;

    info!(
        admin_id = admin.id,
        payout_id = payout.id,
        user_id = payout.user_id,
        amount = %payout.amount,
        "payout created"
    );
    Ok(ApiOk::created("payout created", payout, meta))
}

async fn admin_update_payout_handler(
    State(st): State<AppState>,
    AdminUser(admin): AdminUser,
    Extension(meta): Extension<RequestMeta>,
    path: Result<Path<i64>, PathRejection>,
    body: Result<Json<StatusUpdateRequest>, JsonRejection>,
) -> Result<ApiOk<Payout>, ApiErrorWithMeta> {
    let id = path_id(path, &meta)?;
    let req = json_body(body, &meta)?;
    let target: PayoutStatus = requested_status(&req, &meta)?;

    let payout = st
        .storage
        .get_payout(id)
        .await
        .map_err(|e| store_failure(e, &meta))?
        .ok_or_else(|| not_found("payout", &meta))?;

    let completed_at = status::transition(payout.status, target, Utc::now())
        .map_err(|e| invalid_transition(e, &meta))?;
    if target == payout.status {
        return Ok(ApiOk::ok("payout unchanged", payout, meta));
    }

    let updated = st
        .storage
        .update_payout_status(id, target, completed_at)
        .await
        .map_err(|e| store_failure(e, &meta))?
        .ok_or_else(|| not_found("payout", &meta))?;

    info!(admin_id = admin.id, payout_id = id, status = %target, "payout status updated");
    Ok(ApiOk::ok("payout updated", updated, meta))
}
