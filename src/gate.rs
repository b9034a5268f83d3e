//! The metering gate: authorize and charge a caller's credit balance before
//! running an arbitrary async operation.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ledger::{LedgerError, LedgerStore};

/// The authenticated caller as seen by the gate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
    #[serde(default)]
    pub is_superuser: bool,
    #[serde(default)]
    pub is_staff: bool,
}

impl Principal {
    /// Privileged principals may override the metered cost per request.
    pub fn is_privileged(&self) -> bool {
        self.is_superuser || self.is_staff
    }
}

/// The slice of the inbound request the gate needs: the path (used as the
/// audit description) and the parsed JSON body, if there was one.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub path: String,
    pub body: Option<serde_json::Value>,
}

impl RequestContext {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Gate rejections, plus transparent passthrough of whatever the wrapped
/// operation failed with. Credits already deducted are not returned when the
/// operation fails.
#[derive(Debug, Error)]
pub enum GateError<E> {
    #[error("authentication required")]
    Unauthenticated,
    #[error("invalid credit override: {reason}")]
    InvalidOverride { reason: String },
    #[error("insufficient credits: required={required} available={available}")]
    InsufficientCredits { required: i64, available: i64 },
    #[error("ledger backend error: {message}")]
    Ledger { message: String },
    #[error(transparent)]
    Operation(E),
}

/// Wraps async business logic with pay-before-you-play semantics against a
/// [`LedgerStore`] chosen at composition time.
#[derive(Clone)]
pub struct CreditGate {
    store: Arc<dyn LedgerStore>,
}

impl CreditGate {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Charges `credit_amount` credits to `principal` and then runs `func`.
    ///
    /// The sequence is: authenticate, resolve the actual cost (privileged
    /// principals may override it through a `credit_amount` field in the
    /// request body), load or create the ledger row, check sufficiency,
    /// deduct and log, invoke. Rejections before the deduction leave the
    /// ledger untouched. If `func` fails after the deduction the error is
    /// passed through unchanged and the credits stay spent.
    pub async fn call_with_credits<T, E, F, Fut>(
        &self,
        ctx: RequestContext,
        principal: Option<Principal>,
        credit_amount: i64,
        func: F,
    ) -> Result<T, GateError<E>>
    where
        F: FnOnce(RequestContext, Principal) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(principal) = principal else {
            return Err(GateError::Unauthenticated);
        };

        let cost = resolve_credit_amount(&ctx, &principal, credit_amount)?;

        let profile = self
            .store
            .get_or_create_profile(&principal.user_id)
            .await
            .map_err(ledger_error)?;

        if cost > 0 && cost > profile.credits_balance {
            tracing::warn!(
                user_id = %principal.user_id,
                required = cost,
                available = profile.credits_balance,
                "gated call rejected: insufficient credits"
            );
            return Err(GateError::InsufficientCredits {
                required: cost,
                available: profile.credits_balance,
            });
        }

        let description = format!("Used {cost} credits for endpoint {}", ctx.path);
        let profile = self
            .store
            .deduct(&profile, cost, &description)
            .await
            .map_err(ledger_error)?;
        tracing::debug!(
            user_id = %principal.user_id,
            cost,
            balance = profile.credits_balance,
            path = %ctx.path,
            "credits deducted"
        );

        func(ctx, principal).await.map_err(GateError::Operation)
    }
}

fn ledger_error<E>(err: LedgerError) -> GateError<E> {
    match err {
        // A deduction that lost the race to a concurrent charge surfaces the
        // balance observed by the atomic decrement, not the stale pre-check.
        LedgerError::Insufficient {
            required,
            available,
        } => GateError::InsufficientCredits {
            required,
            available,
        },
        LedgerError::Backend { message } => GateError::Ledger { message },
    }
}

fn resolve_credit_amount<E>(
    ctx: &RequestContext,
    principal: &Principal,
    default_amount: i64,
) -> Result<i64, GateError<E>> {
    if !principal.is_privileged() {
        return Ok(default_amount);
    }
    let Some(value) = ctx.body.as_ref().and_then(|body| body.get("credit_amount")) else {
        return Ok(default_amount);
    };
    if value.is_null() {
        return Ok(default_amount);
    }
    match value.as_i64() {
        Some(amount) if amount >= 0 => Ok(amount),
        Some(_) => Err(GateError::InvalidOverride {
            reason: "credit amount cannot be negative".to_string(),
        }),
        None => Err(GateError::InvalidOverride {
            reason: "credit amount must be a valid integer".to_string(),
        }),
    }
}
