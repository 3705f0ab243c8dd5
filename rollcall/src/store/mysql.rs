//! L2 backed by MySQL through sqlx.
//!
//! Expects a `student` table:
//!
//! ```sql
//! CREATE TABLE student (
//!     id      VARCHAR(64)  NOT NULL PRIMARY KEY,
//!     name    VARCHAR(255) NOT NULL,
//!     age     INT          NOT NULL DEFAULT 0,
//!     deleted TINYINT(1)   NOT NULL DEFAULT 0
//! );
//! ```

use async_trait::async_trait;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::Row;

use super::{DurableStore, TierError};
use crate::entity::Entity;

const MAX_CONNECTIONS: u32 = 8;

pub struct MySqlStore {
    pool: MySqlPool,
}

fn durable(e: sqlx::Error) -> TierError {
    TierError::Durable(e.to_string())
}

/// MySQL counts changed rows, so a write that matched a row without changing
/// it reports zero as well; `found` tells the two apart.
fn confirm_row(id: &str, affected: u64, found: bool) -> Result<(), TierError> {
    if affected > 0 || found {
        Ok(())
    } else {
        Err(TierError::missing_row(id))
    }
}

fn to_entity(row: &MySqlRow) -> Result<Entity, TierError> {
    Ok(Entity {
        id: row.try_get("id").map_err(durable)?,
        name: row.try_get("name").map_err(durable)?,
        age: row.try_get("age").map_err(durable)?,
        deleted: row.try_get("deleted").map_err(durable)?,
    })
}

impl MySqlStore {
    pub async fn connect(url: &str) -> Result<Self, TierError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect(url)
            .await
            .map_err(durable)?;
        Ok(MySqlStore { pool })
    }

    async fn row_exists(&self, id: &str) -> Result<bool, TierError> {
        let row = sqlx::query("SELECT 1 FROM student WHERE id = ? LIMIT 1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(durable)?;
        Ok(row.is_some())
    }

    /// Fails when the write addressed no row at all.
    async fn require_row(&self, id: &str, affected: u64) -> Result<(), TierError> {
        let found = affected == 0 && self.row_exists(id).await?;
        confirm_row(id, affected, found)
    }
}

#[async_trait]
impl DurableStore for MySqlStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<Entity>, TierError> {
        let row = sqlx::query("SELECT id, name, age, deleted FROM student WHERE id = ? LIMIT 1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(durable)?;
        row.as_ref().map(to_entity).transpose()
    }

    async fn update_fields(&self, id: &str, entity: &Entity) -> Result<(), TierError> {
        let done = sqlx::query("UPDATE student SET id = ?, name = ?, age = ? WHERE id = ?")
            .bind(&entity.id)
            .bind(&entity.name)
            .bind(entity.age)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(durable)?;
        if let Err(e) = self.require_row(&entity.id, done.rows_affected()).await {
            log::warn!("update of student {} matched no row", id);
            return Err(e);
        }
        Ok(())
    }

    async fn soft_delete(&self, id: &str) -> Result<(), TierError> {
        let done = sqlx::query("UPDATE student SET deleted = TRUE WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(durable)?;
        self.require_row(id, done.rows_affected()).await
    }

    async fn list(&self, limit: usize) -> Result<Vec<Entity>, TierError> {
        let rows = sqlx::query("SELECT id, name, age, deleted FROM student WHERE deleted = FALSE LIMIT ?")
            .bind(limit as u64)
            .fetch_all(&self.pool)
            .await
            .map_err(durable)?;
        rows.iter().map(to_entity).collect()
    }
}
