use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hg_common::{Installation, SecretString, TenantId};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::info;

use crate::installation::InstallationRepository;
use crate::{Result, StoreError};

pub struct PostgresInstallationRepository {
    pool: PgPool,
}

impl PostgresInstallationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS installations (
                tenant_id TEXT PRIMARY KEY,
                team_name TEXT,
                bot_token TEXT NOT NULL,
                bot_user_id TEXT,
                app_id TEXT,
                scopes TEXT NOT NULL,
                installed_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        info!("Installation schema ready (PostgreSQL)");
        Ok(())
    }
}

fn timestamp(tenant_id: &str, column: &str, millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| StoreError::Corrupt {
        key: tenant_id.to_string(),
        message: format!("invalid {}", column),
    })
}

fn row_to_installation(row: &PgRow) -> Result<Installation> {
    let tenant_id: String = row.get("tenant_id");
    let installed_at = timestamp(&tenant_id, "installed_at", row.get("installed_at"))?;
    let updated_at = timestamp(&tenant_id, "updated_at", row.get("updated_at"))?;
    let scopes: String = row.get("scopes");

    Ok(Installation {
        tenant_id: TenantId::new(tenant_id),
        team_name: row.get("team_name"),
        bot_token: SecretString::new(row.get::<String, _>("bot_token")),
        bot_user_id: row.get("bot_user_id"),
        app_id: row.get("app_id"),
        scopes: Installation::parse_scopes(&scopes),
        installed_at,
        updated_at,
    })
}

#[async_trait]
impl InstallationRepository for PostgresInstallationRepository {
    async fn find(&self, tenant_id: &TenantId) -> Result<Option<Installation>> {
        let row = sqlx::query(
            "SELECT tenant_id, team_name, bot_token, bot_user_id, app_id, scopes, installed_at, updated_at FROM installations WHERE tenant_id = $1",
        )
        .bind(tenant_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_installation).transpose()
    }

    async fn upsert(&self, installation: &Installation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO installations
                (tenant_id, team_name, bot_token, bot_user_id, app_id, scopes, installed_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (tenant_id) DO UPDATE SET
                team_name = EXCLUDED.team_name,
                bot_token = EXCLUDED.bot_token,
                bot_user_id = EXCLUDED.bot_user_id,
                app_id = EXCLUDED.app_id,
                scopes = EXCLUDED.scopes,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(installation.tenant_id.as_str())
        .bind(&installation.team_name)
        .bind(installation.bot_token.expose_secret())
        .bind(&installation.bot_user_id)
        .bind(&installation.app_id)
        .bind(installation.scope_string())
        .bind(installation.installed_at.timestamp_millis())
        .bind(installation.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, tenant_id: &TenantId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM installations WHERE tenant_id = $1")
            .bind(tenant_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
