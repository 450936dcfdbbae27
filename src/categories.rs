//! Category tree construction and maintenance.
//!
//! A [`Category`] forms a per-project tree (depth ≤
//! [`crate::models::MAX_CATEGORY_DEPTH`]) used both to organize documents
//! for humans and as a navigable map for the agentic crawler (flattened
//! into a path list the "think" step can reference by name).

use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::{Category, MAX_CATEGORY_DEPTH};

/// Create a category under `parent_id` (or at the root if `None`), rejecting
/// anything that would exceed the maximum tree depth.
pub async fn create_category(
    pool: &SqlitePool,
    project_id: &str,
    parent_id: Option<&str>,
    name: &str,
) -> Result<Category> {
    let depth = match parent_id {
        None => 0,
        Some(pid) => {
            let parent_depth: i64 = sqlx::query_scalar("SELECT depth FROM categories WHERE id = ?")
                .bind(pid)
                .fetch_optional(pool)
                .await?
                .ok_or_else(|| anyhow::anyhow!("parent category not found: {}", pid))?;
            parent_depth + 1
        }
    };

    if depth > MAX_CATEGORY_DEPTH {
        bail!(
            "category depth {} exceeds maximum of {}",
            depth,
            MAX_CATEGORY_DEPTH
        );
    }

    let sort_order: i64 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM categories WHERE project_id = ? AND parent_id IS ?",
    )
    .bind(project_id)
    .bind(parent_id)
    .fetch_one(pool)
    .await?;

    let category = Category {
        id: Uuid::new_v4().to_string(),
        project_id: project_id.to_string(),
        parent_id: parent_id.map(|s| s.to_string()),
        name: name.to_string(),
        description: None,
        color: None,
        icon: None,
        depth,
        sort_order,
        source_url: None,
        url_path: None,
        content_hash: None,
        last_crawled_at: None,
    };

    sqlx::query(
        r#"
        INSERT INTO categories
            (id, project_id, parent_id, name, description, color, icon, depth, sort_order,
             source_url, url_path, content_hash, last_crawled_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&category.id)
    .bind(&category.project_id)
    .bind(&category.parent_id)
    .bind(&category.name)
    .bind(&category.description)
    .bind(&category.color)
    .bind(&category.icon)
    .bind(category.depth)
    .bind(category.sort_order)
    .bind(&category.source_url)
    .bind(&category.url_path)
    .bind(&category.content_hash)
    .bind(category.last_crawled_at)
    .execute(pool)
    .await?;

    Ok(category)
}

/// Load every category for a project, ordered so that a simple running walk
/// always sees a parent before its children (not true tree order, but
/// depth-then-sort_order is enough for [`flatten_tree_paths`] to work).
pub async fn load_categories(pool: &SqlitePool, project_id: &str) -> Result<Vec<Category>> {
    let rows = sqlx::query(
        "SELECT * FROM categories WHERE project_id = ? ORDER BY depth ASC, sort_order ASC",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| Category {
            id: row.get("id"),
            project_id: row.get("project_id"),
            parent_id: row.get("parent_id"),
            name: row.get("name"),
            description: row.get("description"),
            color: row.get("color"),
            icon: row.get("icon"),
            depth: row.get("depth"),
            sort_order: row.get("sort_order"),
            source_url: row.get("source_url"),
            url_path: row.get("url_path"),
            content_hash: row.get("content_hash"),
            last_crawled_at: row.get("last_crawled_at"),
        })
        .collect())
}

/// Flatten a category tree into `"/"`-joined path strings, one per node,
/// suitable for an agentic workflow's prompt (e.g. as a menu of places it
/// can file a finding under).
pub fn flatten_tree_paths(categories: &[Category]) -> Vec<String> {
    let mut by_id = std::collections::HashMap::new();
    for c in categories {
        by_id.insert(c.id.clone(), c);
    }

    let mut paths = Vec::with_capacity(categories.len());
    for c in categories {
        let mut segments = vec![c.name.clone()];
        let mut current = c;
        while let Some(parent_id) = &current.parent_id {
            match by_id.get(parent_id) {
                Some(parent) => {
                    segments.push(parent.name.clone());
                    current = parent;
                }
                None => break,
            }
        }
        segments.reverse();
        paths.push(segments.join("/"));
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cat(id: &str, parent: Option<&str>, name: &str, depth: i64) -> Category {
        Category {
            id: id.to_string(),
            project_id: "p1".to_string(),
            parent_id: parent.map(|s| s.to_string()),
            name: name.to_string(),
            description: None,
            color: None,
            icon: None,
            depth,
            sort_order: 0,
            source_url: None,
            url_path: None,
            content_hash: None,
            last_crawled_at: None,
        }
    }

    #[test]
    fn flattens_nested_paths() {
        let cats = vec![
            cat("1", None, "Engineering", 0),
            cat("2", Some("1"), "Backend", 1),
            cat("3", Some("2"), "Storage", 2),
        ];
        let paths = flatten_tree_paths(&cats);
        assert_eq!(
            paths,
            vec![
                "Engineering".to_string(),
                "Engineering/Backend".to_string(),
                "Engineering/Backend/Storage".to_string(),
            ]
        );
    }
}
