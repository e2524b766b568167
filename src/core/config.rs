//! Runtime configuration: services, credentials, and principals.
//!
//! The live Service and Credential sets are read-mostly shared state. They
//! are kept as an immutable [`ConfigSnapshot`] behind a readers-writer lock;
//! reconfiguration swaps the whole snapshot atomically, so readers observe
//! either the pre- or post-swap set and never a mix.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::database::Database;
use crate::core::error::{GatewayError, Result};

// ============================================================================
// Wire Protocols
// ============================================================================

/// Wire dialect spoken on a connection (ingress or egress side).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    OpenAI,
    Anthropic,
    Gemini,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::OpenAI => write!(f, "openai"),
            Protocol::Anthropic => write!(f, "anthropic"),
            Protocol::Gemini => write!(f, "gemini"),
        }
    }
}

// ============================================================================
// Service Types
// ============================================================================

/// Upstream service type as configured by the management surface.
///
/// Several vendors expose OpenAI-compatible APIs; they get their own tag so
/// operators can label services truthfully, but they all resolve to the
/// OpenAI wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    OpenAI,
    Anthropic,
    Gemini,
    DeepSeek,
    Glm,
    Yi,
    Moonshot,
}

impl ServiceType {
    /// The wire protocol spoken by this service type.
    pub fn wire_protocol(&self) -> Protocol {
        match self {
            ServiceType::Anthropic => Protocol::Anthropic,
            ServiceType::Gemini => Protocol::Gemini,
            ServiceType::OpenAI
            | ServiceType::DeepSeek
            | ServiceType::Glm
            | ServiceType::Yi
            | ServiceType::Moonshot => Protocol::OpenAI,
        }
    }
}

impl FromStr for ServiceType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(ServiceType::OpenAI),
            "anthropic" | "claude" => Ok(ServiceType::Anthropic),
            "gemini" => Ok(ServiceType::Gemini),
            "deepseek" => Ok(ServiceType::DeepSeek),
            "glm" => Ok(ServiceType::Glm),
            "yi" => Ok(ServiceType::Yi),
            "moonshot" => Ok(ServiceType::Moonshot),
            _ => Err(format!("Unknown service type: {}", s)),
        }
    }
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceType::OpenAI => "openai",
            ServiceType::Anthropic => "anthropic",
            ServiceType::Gemini => "gemini",
            ServiceType::DeepSeek => "deepseek",
            ServiceType::Glm => "glm",
            ServiceType::Yi => "yi",
            ServiceType::Moonshot => "moonshot",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Service
// ============================================================================

/// A routing target: upstream endpoint, credential pool, and optional model
/// rewrite. The service `name` is the externally visible model id.
#[derive(Debug)]
pub struct Service {
    pub id: i64,
    pub name: String,
    pub service_type: ServiceType,
    pub base_url: String,
    /// Ordered upstream key pool. A legacy single key loads as a pool of one.
    pub api_keys: Vec<String>,
    /// When set and different from `name`, the upstream `model` field is
    /// rewritten to this value before dispatch.
    pub target_model: Option<String>,
    pub active: bool,
    /// Round-robin cursor over `api_keys`. Atomic, no lock.
    key_cursor: AtomicU64,
}

impl Service {
    pub fn new(
        id: i64,
        name: impl Into<String>,
        service_type: ServiceType,
        base_url: impl Into<String>,
        api_keys: Vec<String>,
    ) -> Self {
        Service {
            id,
            name: name.into(),
            service_type,
            base_url: base_url.into(),
            api_keys,
            target_model: None,
            active: true,
            key_cursor: AtomicU64::new(0),
        }
    }

    pub fn with_target_model(mut self, target_model: impl Into<String>) -> Self {
        self.target_model = Some(target_model.into());
        self
    }

    /// The wire protocol this service's upstream speaks.
    pub fn wire_protocol(&self) -> Protocol {
        self.service_type.wire_protocol()
    }

    /// Select the next key from the pool using strict round-robin.
    ///
    /// The fetch-and-add makes two concurrent selections land on distinct
    /// indices whenever the pool holds two or more keys.
    pub fn next_api_key(&self) -> Option<&str> {
        if self.api_keys.is_empty() {
            return None;
        }
        let idx = self.key_cursor.fetch_add(1, Ordering::Relaxed);
        let key = &self.api_keys[(idx % self.api_keys.len() as u64) as usize];
        Some(key.as_str())
    }

    /// The model name sent upstream: `target_model` when it is set and
    /// differs from the service name, otherwise the requested name.
    pub fn upstream_model(&self) -> &str {
        match &self.target_model {
            Some(target) if !target.is_empty() && target != &self.name => target,
            _ => &self.name,
        }
    }

    /// True when a model rewrite applies to outbound requests.
    pub fn rewrites_model(&self) -> bool {
        matches!(&self.target_model, Some(t) if !t.is_empty() && t != &self.name)
    }
}

// ============================================================================
// Principals and Credentials
// ============================================================================

/// Role attached to a principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    SuperAdmin,
    Admin,
    User,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "super_admin" => Ok(Role::SuperAdmin),
            "admin" => Ok(Role::Admin),
            "user" => Ok(Role::User),
            _ => Err(format!("Unknown role: {}", s)),
        }
    }
}

/// The authenticated identity owning a credential.
#[derive(Debug, Clone, PartialEq)]
pub struct Principal {
    pub id: i64,
    pub role: Role,
    /// Maximum token budget. Negative means unlimited.
    pub quota: f64,
    pub used_amount: f64,
}

impl Principal {
    /// Quota admission check. Admins are never limited; a negative quota
    /// means unlimited.
    pub fn quota_exhausted(&self) -> bool {
        self.role == Role::User && self.quota >= 0.0 && self.used_amount >= self.quota
    }
}

/// A client credential: an opaque bearer string owned by a principal.
/// Lookup is by exact string match.
#[derive(Debug, Clone)]
pub struct Credential {
    pub key: String,
    pub active: bool,
    pub principal: Principal,
}

// ============================================================================
// Snapshot
// ============================================================================

/// Immutable view of the configured services and credentials.
#[derive(Debug, Default)]
pub struct ConfigSnapshot {
    pub services: Vec<Arc<Service>>,
    pub credentials: Vec<Credential>,
    pub version: i64,
    pub loaded_at: Option<DateTime<Utc>>,
}

impl ConfigSnapshot {
    pub fn new(services: Vec<Service>, credentials: Vec<Credential>) -> Self {
        ConfigSnapshot {
            services: services.into_iter().map(Arc::new).collect(),
            credentials,
            version: 0,
            loaded_at: Some(Utc::now()),
        }
    }

    /// Find the active service whose name equals the requested model.
    pub fn find_service(&self, model: &str) -> Option<Arc<Service>> {
        self.services
            .iter()
            .find(|s| s.active && s.name == model)
            .cloned()
    }

    /// Find an active credential by exact key match.
    pub fn find_credential(&self, key: &str) -> Option<&Credential> {
        self.credentials
            .iter()
            .find(|c| c.active && c.key == key)
    }
}

/// Holder for the live snapshot. Readers take the lock only long enough to
/// clone the inner `Arc`; writers publish a whole new snapshot.
pub struct GatewayConfig {
    snapshot: RwLock<Arc<ConfigSnapshot>>,
    db: Option<Arc<Database>>,
}

impl GatewayConfig {
    /// Create a config holder over an in-memory snapshot (tests, bootstrap).
    pub fn new(snapshot: ConfigSnapshot) -> Self {
        GatewayConfig {
            snapshot: RwLock::new(Arc::new(snapshot)),
            db: None,
        }
    }

    /// Create a config holder that can reload itself from the database.
    pub fn with_database(snapshot: ConfigSnapshot, db: Arc<Database>) -> Self {
        GatewayConfig {
            snapshot: RwLock::new(Arc::new(snapshot)),
            db: Some(db),
        }
    }

    /// Current snapshot. Cheap: clones an `Arc` under a read lock.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Atomically publish a new snapshot.
    pub fn replace(&self, snapshot: ConfigSnapshot) {
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(snapshot);
    }

    /// Reload services and credentials from the database and publish them.
    pub async fn reload(&self) -> Result<()> {
        let db = self
            .db
            .as_ref()
            .ok_or_else(|| GatewayError::Internal("no database configured".into()))?;
        let snapshot = db
            .load_snapshot()
            .await
            .map_err(|e| GatewayError::Internal(format!("config reload failed: {}", e)))?;
        tracing::info!(
            services = snapshot.services.len(),
            credentials = snapshot.credentials.len(),
            "Configuration reloaded"
        );
        self.replace(snapshot);
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
