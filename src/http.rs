//! HTTP surface: the gated operation endpoint plus the token-protected
//! ledger admin API.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::{PrincipalConfig, ServiceConfig};
use crate::gate::{CreditGate, GateError, Principal, RequestContext};
use crate::ledger::{CreditProfile, CreditTransaction, LedgerStore};

#[derive(Clone)]
pub struct GateHttpState {
    gate: CreditGate,
    principals: Arc<Vec<PrincipalConfig>>,
    default_cost: i64,
    costs: Arc<BTreeMap<String, i64>>,
    admin_token: Option<String>,
}

impl GateHttpState {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            gate: CreditGate::new(store),
            principals: Arc::new(Vec::new()),
            default_cost: 5,
            costs: Arc::new(BTreeMap::new()),
            admin_token: None,
        }
    }

    pub fn from_config(store: Arc<dyn LedgerStore>, config: &ServiceConfig) -> Self {
        Self::new(store)
            .with_principals(config.principals.clone())
            .with_costs(config.default_cost, config.costs.clone())
            .with_admin_token_opt(config.admin_token.clone())
    }

    pub fn with_principals(mut self, principals: Vec<PrincipalConfig>) -> Self {
        self.principals = Arc::new(principals);
        self
    }

    pub fn with_costs(mut self, default_cost: i64, costs: BTreeMap<String, i64>) -> Self {
        self.default_cost = default_cost;
        self.costs = Arc::new(costs);
        self
    }

    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.admin_token = Some(token.into());
        self
    }

    fn with_admin_token_opt(mut self, token: Option<String>) -> Self {
        self.admin_token = token;
        self
    }

    pub fn gate(&self) -> &CreditGate {
        &self.gate
    }

    fn cost_for(&self, operation: &str) -> i64 {
        self.costs
            .get(operation)
            .copied()
            .unwrap_or(self.default_cost)
    }
}

pub fn router(state: GateHttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/run/:operation", post(run_operation))
        .route("/admin/ledgers", get(list_ledgers))
        .route("/admin/ledgers/:user_id/transactions", get(list_ledger_transactions))
        .route("/admin/ledgers/:user_id/topup", post(topup_ledger))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

/// Flat 402 body: the caller learns exactly how short they are. The values
/// are the caller's own balance, so this is intended disclosure.
#[derive(Debug, Serialize)]
struct InsufficientCreditsBody {
    error: &'static str,
    required: i64,
    available: i64,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn run_operation(
    State(state): State<GateHttpState>,
    Path(operation): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, Response> {
    let principal = resolve_principal(&state, &headers);
    // A body that is not valid JSON is treated as no body at all, so the
    // override path only ever sees parsed JSON.
    let parsed_body = (!body.is_empty())
        .then(|| serde_json::from_slice::<Value>(&body).ok())
        .flatten();

    let path = format!("/v1/run/{operation}");
    let cost = state.cost_for(&operation);
    let mut ctx = RequestContext::new(path);
    if let Some(body) = parsed_body {
        ctx = ctx.with_body(body);
    }

    let result = match operation.as_str() {
        "echo" => {
            state
                .gate
                .call_with_credits(ctx, principal, cost, |ctx, principal| async move {
                    Ok::<_, Infallible>(json!({
                        "operation": "echo",
                        "user_id": principal.user_id,
                        "echo": ctx.body,
                    }))
                })
                .await
        }
        _ => {
            return Err(error_response(
                StatusCode::NOT_FOUND,
                "unknown_operation",
                format!("unknown operation: {operation}"),
            ));
        }
    };

    result.map(Json).map_err(gate_error_response)
}

#[derive(Debug, Deserialize)]
struct TransactionsQuery {
    #[serde(default = "default_transactions_limit")]
    limit: usize,
}

fn default_transactions_limit() -> usize {
    100
}

async fn list_ledgers(
    State(state): State<GateHttpState>,
    headers: HeaderMap,
) -> Result<Json<Vec<CreditProfile>>, Response> {
    ensure_admin(&state, &headers)?;
    let profiles = state
        .gate
        .store()
        .list_profiles()
        .await
        .map_err(storage_error)?;
    Ok(Json(profiles))
}

async fn list_ledger_transactions(
    State(state): State<GateHttpState>,
    Path(user_id): Path<String>,
    Query(query): Query<TransactionsQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<CreditTransaction>>, Response> {
    ensure_admin(&state, &headers)?;
    let profile = find_profile(&state, &user_id).await?;
    let transactions = state
        .gate
        .store()
        .list_transactions(profile.id, query.limit)
        .await
        .map_err(storage_error)?;
    Ok(Json(transactions))
}

#[derive(Debug, Deserialize)]
struct TopupRequest {
    amount: i64,
    #[serde(default)]
    description: Option<String>,
}

async fn topup_ledger(
    State(state): State<GateHttpState>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CreditProfile>, Response> {
    ensure_admin(&state, &headers)?;
    let payload: TopupRequest = serde_json::from_slice(&body).map_err(|err| {
        error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            format!("invalid topup payload: {err}"),
        )
    })?;
    if payload.amount <= 0 {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "invalid_amount",
            "top-up amount must be a positive integer",
        ));
    }

    let store = state.gate.store();
    let profile = store
        .get_or_create_profile(&user_id)
        .await
        .map_err(storage_error)?;
    let description = payload
        .description
        .unwrap_or_else(|| format!("Added {} credits", payload.amount));
    let profile = store
        .credit(&profile, payload.amount, &description)
        .await
        .map_err(storage_error)?;
    tracing::info!(
        user_id = %user_id,
        amount = payload.amount,
        balance = profile.credits_balance,
        "ledger topped up"
    );
    Ok(Json(profile))
}

async fn find_profile(state: &GateHttpState, user_id: &str) -> Result<CreditProfile, Response> {
    let profiles = state
        .gate
        .store()
        .list_profiles()
        .await
        .map_err(storage_error)?;
    profiles
        .into_iter()
        .find(|profile| profile.user_id == user_id)
        .ok_or_else(|| {
            error_response(
                StatusCode::NOT_FOUND,
                "unknown_user",
                format!("no ledger for user: {user_id}"),
            )
        })
}

fn resolve_principal(state: &GateHttpState, headers: &HeaderMap) -> Option<Principal> {
    let token = extract_bearer(headers).or_else(|| extract_header(headers, "x-api-key"))?;
    state
        .principals
        .iter()
        .find(|candidate| candidate.enabled && candidate.token == token)
        .map(PrincipalConfig::principal)
}

fn ensure_admin(state: &GateHttpState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "not_configured",
            "admin auth not configured",
        ));
    };
    let provided = extract_bearer(headers)
        .or_else(|| extract_header(headers, "x-admin-token"))
        .unwrap_or_default();
    if provided == expected {
        Ok(())
    } else {
        Err(error_response(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "invalid admin token",
        ))
    }
}

fn gate_error_response(err: GateError<Infallible>) -> Response {
    match err {
        GateError::Unauthenticated => error_response(
            StatusCode::UNAUTHORIZED,
            "authentication_required",
            "authentication required",
        ),
        GateError::InvalidOverride { reason } => {
            error_response(StatusCode::BAD_REQUEST, "invalid_override", reason)
        }
        GateError::InsufficientCredits {
            required,
            available,
        } => (
            StatusCode::PAYMENT_REQUIRED,
            Json(InsufficientCreditsBody {
                error: "Insufficient credits",
                required,
                available,
            }),
        )
            .into_response(),
        GateError::Ledger { message } => {
            tracing::warn!(%message, "ledger backend failure");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "ledger_error",
                format!("failed to deduct credits: {message}"),
            )
        }
        GateError::Operation(err) => match err {},
    }
}

fn storage_error(err: crate::ledger::LedgerError) -> Response {
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "storage_error",
        err.to_string(),
    )
}

fn error_response(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                code,
                message: message.into(),
            },
        }),
    )
        .into_response()
}

fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let auth = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())?
        .trim()
        .to_string();
    let rest = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?;
    let token = rest.trim();
    (!token.is_empty()).then(|| token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryLedger;

    fn test_state() -> GateHttpState {
        GateHttpState::new(Arc::new(MemoryLedger::new())).with_principals(vec![
            PrincipalConfig::new("alice", "tok-alice"),
            PrincipalConfig::new("mallory", "tok-mallory").disabled(),
        ])
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", format!("Bearer {token}").parse().unwrap());
        headers
    }

    #[test]
    fn resolve_principal_matches_enabled_tokens_only() {
        let state = test_state();
        let principal = resolve_principal(&state, &bearer("tok-alice")).expect("principal");
        assert_eq!(principal.user_id, "alice");

        assert!(resolve_principal(&state, &bearer("tok-mallory")).is_none());
        assert!(resolve_principal(&state, &bearer("tok-unknown")).is_none());
        assert!(resolve_principal(&state, &HeaderMap::new()).is_none());
    }

    #[test]
    fn resolve_principal_accepts_api_key_header() {
        let state = test_state();
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "tok-alice".parse().unwrap());
        let principal = resolve_principal(&state, &headers).expect("principal");
        assert_eq!(principal.user_id, "alice");
    }

    #[test]
    fn ensure_admin_rejects_when_not_configured() {
        let state = test_state();
        let err = ensure_admin(&state, &HeaderMap::new()).unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn ensure_admin_checks_token() {
        let state = test_state().with_admin_token("admin-secret");
        assert!(ensure_admin(&state, &bearer("admin-secret")).is_ok());

        let err = ensure_admin(&state, &bearer("wrong")).unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);

        let mut headers = HeaderMap::new();
        headers.insert("x-admin-token", "admin-secret".parse().unwrap());
        assert!(ensure_admin(&state, &headers).is_ok());
    }
}
