//! Project CRUD. A project is the isolation boundary every document,
//! category, crawl job, and agent workflow is scoped to.

use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::Project;

pub async fn create_project(pool: &SqlitePool, name: &str) -> Result<Project> {
    let now = chrono::Utc::now().timestamp();
    let project = Project {
        id: Uuid::new_v4().to_string(),
        name: name.to_string(),
        created_at: now,
        updated_at: now,
    };

    sqlx::query("INSERT INTO projects (id, name, created_at, updated_at) VALUES (?, ?, ?, ?)")
        .bind(&project.id)
        .bind(&project.name)
        .bind(project.created_at)
        .bind(project.updated_at)
        .execute(pool)
        .await?;

    Ok(project)
}

pub async fn get_project(pool: &SqlitePool, id: &str) -> Result<Project> {
    let row = sqlx::query("SELECT id, name, created_at, updated_at FROM projects WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => Ok(Project {
            id: row.get("id"),
            name: row.get("name"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }),
        None => bail!("project not found: {}", id),
    }
}

pub async fn list_projects(pool: &SqlitePool) -> Result<Vec<Project>> {
    let rows = sqlx::query("SELECT id, name, created_at, updated_at FROM projects ORDER BY created_at ASC")
        .fetch_all(pool)
        .await?;

    Ok(rows
        .iter()
        .map(|row| Project {
            id: row.get("id"),
            name: row.get("name"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
        .collect())
}
