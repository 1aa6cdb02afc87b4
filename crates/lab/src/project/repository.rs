//! Project database repository.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::models::{ContainerDefinition, Project, ProjectWithDefinitions};

/// Repository for project persistence.
#[derive(Debug, Clone)]
pub struct ProjectRepository {
    pool: SqlitePool,
}

impl ProjectRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn list(&self) -> Result<Vec<Project>> {
        let projects = sqlx::query_as::<_, Project>(
            r#"
            SELECT id, name, system_prompt, pool_size, created_at, updated_at
            FROM projects
            ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing projects")?;

        Ok(projects)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Project>> {
        let project = sqlx::query_as::<_, Project>(
            r#"
            SELECT id, name, system_prompt, pool_size, created_at, updated_at
            FROM projects
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching project")?;

        Ok(project)
    }

    /// Insert a project with its container definitions.
    pub async fn create(
        &self,
        name: &str,
        system_prompt: Option<&str>,
        pool_size: i64,
        definitions: &[(String, Option<String>, Vec<u16>)],
    ) -> Result<Project> {
        let now = Utc::now();
        let project = Project {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            system_prompt: system_prompt.map(str::to_string),
            pool_size,
            created_at: now,
            updated_at: now,
        };

        let mut tx = self.pool.begin().await.context("starting transaction")?;

        sqlx::query(
            r#"
            INSERT INTO projects (id, name, system_prompt, pool_size, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&project.id)
        .bind(&project.name)
        .bind(&project.system_prompt)
        .bind(project.pool_size)
        .bind(project.created_at)
        .bind(project.updated_at)
        .execute(&mut *tx)
        .await
        .context("inserting project")?;

        for (image, hostname, ports) in definitions {
            let def_id = Uuid::new_v4().to_string();
            sqlx::query(
                r#"
                INSERT INTO container_definitions (id, project_id, image, env_template, hostname)
                VALUES (?, ?, ?, NULL, ?)
                "#,
            )
            .bind(&def_id)
            .bind(&project.id)
            .bind(image)
            .bind(hostname)
            .execute(&mut *tx)
            .await
            .context("inserting container definition")?;

            for port in ports {
                sqlx::query(
                    "INSERT INTO container_ports (container_id, port, protocol) VALUES (?, ?, 'tcp')",
                )
                .bind(&def_id)
                .bind(*port as i64)
                .execute(&mut *tx)
                .await
                .context("inserting container port")?;
            }
        }

        tx.commit().await.context("committing project insert")?;

        Ok(project)
    }

    /// Fetch a project with its container definitions and declared ports.
    pub async fn get_with_definitions(&self, id: &str) -> Result<Option<ProjectWithDefinitions>> {
        let Some(project) = self.get(id).await? else {
            return Ok(None);
        };

        let definitions = sqlx::query_as::<_, ContainerDefinition>(
            r#"
            SELECT id, project_id, image, env_template, hostname
            FROM container_definitions
            WHERE project_id = ?
            ORDER BY id
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .context("fetching container definitions")?;

        let mut with_ports = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let ports: Vec<i64> = sqlx::query_scalar(
                "SELECT port FROM container_ports WHERE container_id = ? ORDER BY port",
            )
            .bind(&definition.id)
            .fetch_all(&self.pool)
            .await
            .context("fetching container ports")?;

            let ports = ports.into_iter().filter_map(|p| u16::try_from(p).ok()).collect();
            with_ports.push((definition, ports));
        }

        Ok(Some(ProjectWithDefinitions {
            project,
            definitions: with_ports,
        }))
    }

    pub async fn definition_count(&self, project_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM container_definitions WHERE project_id = ?",
        )
        .bind(project_id)
        .fetch_one(&self.pool)
        .await
        .context("counting container definitions")?;

        Ok(count)
    }
}
