//! Database access for configuration and usage persistence.
//!
//! PostgreSQL only. The pipeline treats the store as a repository: it reads
//! the Service/Credential/Principal sets and performs exactly two writes,
//! the append-only usage record insert and the single-expression
//! `used_amount` increment (both issued by the usage recorder).

use std::str::FromStr;

use sqlx::{FromRow, PgPool};

use crate::core::config::{ConfigSnapshot, Credential, Principal, Role, Service, ServiceType};

/// Database connection settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/llm_gateway".to_string(),
            max_connections: 10,
            min_connections: 2,
            connect_timeout_secs: 30,
            idle_timeout_secs: 600,
        }
    }
}

impl DatabaseConfig {
    pub fn from_url(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Default::default()
        }
    }
}

/// Database connection manager.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

/// Service row as stored by the management surface.
#[derive(Debug, FromRow)]
struct ServiceRow {
    id: i64,
    name: String,
    service_type: String,
    base_url: String,
    api_key: Option<String>,
    /// JSON array of keys; empty or null falls back to the legacy `api_key`.
    api_keys: Option<String>,
    target_model: Option<String>,
    active: bool,
}

/// Credential row joined with its owning principal.
#[derive(Debug, FromRow)]
struct CredentialRow {
    credential_key: String,
    credential_active: bool,
    principal_id: i64,
    role: String,
    quota: f64,
    used_amount: f64,
}

impl Database {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(std::time::Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(std::time::Duration::from_secs(config.idle_timeout_secs))
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check if migrations have been applied (managed externally).
    pub async fn check_migrations(&self) -> Result<bool, sqlx::Error> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM information_schema.tables WHERE table_name='services')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// Load all services, including inactive ones (the snapshot filters at
    /// lookup time so a deactivation takes effect on the next reload).
    pub async fn load_services(&self) -> Result<Vec<Service>, sqlx::Error> {
        let rows = sqlx::query_as::<_, ServiceRow>(
            r#"
            SELECT id, name, service_type, base_url, api_key, api_keys, target_model, active
            FROM services
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(service_from_row).collect())
    }

    /// Load active credentials joined with their owning principals.
    pub async fn load_credentials(&self) -> Result<Vec<Credential>, sqlx::Error> {
        let rows = sqlx::query_as::<_, CredentialRow>(
            r#"
            SELECT c.key AS credential_key,
                   c.active AS credential_active,
                   p.id AS principal_id,
                   p.role,
                   p.quota,
                   p.used_amount
            FROM credentials c
            JOIN principals p ON p.id = c.principal_id
            WHERE c.active = true
            ORDER BY c.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| Credential {
                key: row.credential_key,
                active: row.credential_active,
                principal: Principal {
                    id: row.principal_id,
                    role: Role::from_str(&row.role).unwrap_or(Role::User),
                    quota: row.quota,
                    used_amount: row.used_amount,
                },
            })
            .collect())
    }

    /// Load a complete configuration snapshot.
    pub async fn load_snapshot(&self) -> Result<ConfigSnapshot, sqlx::Error> {
        let services = self.load_services().await?;
        let credentials = self.load_credentials().await?;
        Ok(ConfigSnapshot::new(services, credentials))
    }
}

/// Decode a service row into the runtime representation.
///
/// `api_keys` holds a JSON array; a missing/empty pool falls back to the
/// legacy single `api_key` as a pool of one.
fn service_from_row(row: ServiceRow) -> Service {
    let mut keys: Vec<String> = row
        .api_keys
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default();

    if keys.is_empty() {
        if let Some(key) = row.api_key.filter(|k| !k.is_empty()) {
            keys.push(key);
        }
    }

    let service_type = ServiceType::from_str(&row.service_type).unwrap_or(ServiceType::OpenAI);

    let mut service = Service::new(row.id, row.name, service_type, row.base_url, keys);
    service.target_model = row.target_model.filter(|t| !t.is_empty());
    service.active = row.active;
    service
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(api_key: Option<&str>, api_keys: Option<&str>) -> ServiceRow {
        ServiceRow {
            id: 1,
            name: "gpt-proxy".into(),
            service_type: "openai".into(),
            base_url: "https://api.openai.com/v1".into(),
            api_key: api_key.map(String::from),
            api_keys: api_keys.map(String::from),
            target_model: None,
            active: true,
        }
    }

    #[test]
    fn test_service_row_key_pool() {
        let service = service_from_row(row(Some("legacy"), Some(r#"["k1","k2"]"#)));
        assert_eq!(service.api_keys, vec!["k1", "k2"]);
    }

    #[test]
    fn test_service_row_legacy_single_key() {
        let service = service_from_row(row(Some("legacy"), None));
        assert_eq!(service.api_keys, vec!["legacy"]);

        let service = service_from_row(row(Some("legacy"), Some("")));
        assert_eq!(service.api_keys, vec!["legacy"]);
    }

    #[test]
    fn test_service_row_bad_pool_json_falls_back() {
        let service = service_from_row(row(Some("legacy"), Some("not-json")));
        assert_eq!(service.api_keys, vec!["legacy"]);
    }

    #[test]
    fn test_service_row_unknown_type_defaults_to_openai() {
        let mut r = row(Some("k"), None);
        r.service_type = "unheard-of".into();
        let service = service_from_row(r);
        assert_eq!(service.service_type, ServiceType::OpenAI);
    }

    #[test]
    fn test_service_row_empty_target_model_is_none() {
        let mut r = row(Some("k"), None);
        r.target_model = Some(String::new());
        let service = service_from_row(r);
        assert_eq!(service.target_model, None);
    }
}
