//! Service configuration: principals, per-operation costs, and the static
//! ledger backend selection. Loaded from a JSON file; the binary's CLI flags
//! override individual fields.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gate::Principal;

#[derive(Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub listen: Option<String>,
    #[serde(default)]
    pub admin_token: Option<String>,
    #[serde(default)]
    pub principals: Vec<PrincipalConfig>,
    /// Cost charged for operations with no entry in `costs`.
    #[serde(default = "default_cost")]
    pub default_cost: i64,
    #[serde(default)]
    pub costs: BTreeMap<String, i64>,
    #[serde(default)]
    pub store: Option<StoreConfig>,
}

impl std::fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("listen", &self.listen)
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<redacted>"))
            .field("principals", &self.principals)
            .field("default_cost", &self.default_cost)
            .field("costs", &self.costs)
            .field("store", &self.store)
            .finish()
    }
}

fn default_cost() -> i64 {
    5
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen: None,
            admin_token: None,
            principals: Vec::new(),
            default_cost: default_cost(),
            costs: BTreeMap::new(),
            store: None,
        }
    }
}

impl ServiceConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn cost_for(&self, operation: &str) -> i64 {
        self.costs
            .get(operation)
            .copied()
            .unwrap_or(self.default_cost)
    }
}

/// One bearer-token principal. Stands in for an external auth dependency;
/// the gate only ever sees the resolved [`Principal`].
#[derive(Clone, Serialize, Deserialize)]
pub struct PrincipalConfig {
    pub user_id: String,
    pub token: String,
    #[serde(default)]
    pub is_superuser: bool,
    #[serde(default)]
    pub is_staff: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl std::fmt::Debug for PrincipalConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrincipalConfig")
            .field("user_id", &self.user_id)
            .field("token", &"<redacted>")
            .field("is_superuser", &self.is_superuser)
            .field("is_staff", &self.is_staff)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl PrincipalConfig {
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: token.into(),
            is_superuser: false,
            is_staff: false,
            enabled: true,
        }
    }

    pub fn superuser(mut self) -> Self {
        self.is_superuser = true;
        self
    }

    pub fn staff(mut self) -> Self {
        self.is_staff = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn principal(&self) -> Principal {
        Principal {
            user_id: self.user_id.clone(),
            is_superuser: self.is_superuser,
            is_staff: self.is_staff,
        }
    }
}

/// Static backend selection, resolved once at startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    Sqlite {
        path: PathBuf,
    },
    Redis {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let raw = r#"{
            "listen": "127.0.0.1:9090",
            "admin_token": "secret",
            "principals": [
                {"user_id": "alice", "token": "tok-alice"},
                {"user_id": "root", "token": "tok-root", "is_superuser": true}
            ],
            "default_cost": 2,
            "costs": {"echo": 3},
            "store": {"backend": "sqlite", "path": "/tmp/ledger.sqlite"}
        }"#;
        let config: ServiceConfig = serde_json::from_str(raw).expect("parse");
        assert_eq!(config.listen.as_deref(), Some("127.0.0.1:9090"));
        assert_eq!(config.principals.len(), 2);
        assert!(config.principals[1].is_superuser);
        assert!(config.principals[0].enabled);
        assert_eq!(config.cost_for("echo"), 3);
        assert_eq!(config.cost_for("other"), 2);
        assert!(matches!(config.store, Some(StoreConfig::Sqlite { .. })));
    }

    #[test]
    fn defaults_apply_to_minimal_config() {
        let config: ServiceConfig = serde_json::from_str("{}").expect("parse");
        assert_eq!(config.default_cost, 5);
        assert!(config.principals.is_empty());
        assert!(config.store.is_none());
        assert_eq!(config.cost_for("anything"), 5);
    }

    #[test]
    fn parses_redis_store_config() {
        let raw = r#"{"store": {"backend": "redis", "url": "redis://localhost:6379", "prefix": "credit"}}"#;
        let config: ServiceConfig = serde_json::from_str(raw).expect("parse");
        match config.store {
            Some(StoreConfig::Redis { ref url, ref prefix }) => {
                assert_eq!(url, "redis://localhost:6379");
                assert_eq!(prefix.as_deref(), Some("credit"));
            }
            ref other => panic!("unexpected store config: {other:?}"),
        }
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let config = ServiceConfig {
            admin_token: Some("super-secret".to_string()),
            principals: vec![PrincipalConfig::new("alice", "tok-alice")],
            ..ServiceConfig::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("tok-alice"));
        assert!(rendered.contains("<redacted>"));
    }
}
