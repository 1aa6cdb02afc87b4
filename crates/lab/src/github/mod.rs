//! GitHub integration settings (singleton row).

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

/// Stored GitHub settings. The token never leaves the server; responses
/// expose only whether one is configured.
#[derive(Debug, Clone, Default, Deserialize, sqlx::FromRow)]
pub struct GithubSettings {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// What clients see.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubSettingsView {
    pub configured: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl GithubSettings {
    pub fn view(&self) -> GithubSettingsView {
        GithubSettingsView {
            configured: self.token.as_deref().is_some_and(|t| !t.is_empty()),
            username: self.username.clone(),
            email: self.email.clone(),
        }
    }
}

/// Repository for the `github_settings` singleton.
#[derive(Debug, Clone)]
pub struct GithubSettingsRepository {
    pool: SqlitePool,
}

impl GithubSettingsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self) -> Result<GithubSettings> {
        let settings = sqlx::query_as::<_, GithubSettings>(
            "SELECT token, username, email FROM github_settings WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("fetching github settings")?;

        Ok(settings.unwrap_or_default())
    }

    pub async fn upsert(&self, settings: &GithubSettings) -> Result<GithubSettings> {
        sqlx::query(
            r#"
            INSERT INTO github_settings (id, token, username, email, updated_at)
            VALUES (1, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                token = excluded.token,
                username = excluded.username,
                email = excluded.email,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&settings.token)
        .bind(&settings.username)
        .bind(&settings.email)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("saving github settings")?;

        self.get().await
    }

    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM github_settings WHERE id = 1")
            .execute(&self.pool)
            .await
            .context("clearing github settings")?;

        Ok(())
    }
}
