use anyhow::{bail, Result};

use super::schema::Database;
use super::types::Folder;

impl Database {
    // ========================================================================
    // Folder Operations
    // ========================================================================

    /// Create a folder, returning its ID. Appended at the end of its
    /// parent partition's order.
    pub async fn create_folder(&self, name: &str, parent_id: Option<i64>) -> Result<i64> {
        let clean_name = Self::sanitize_name(name)?;

        if let Some(pid) = parent_id {
            let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM folders WHERE id = ?")
                .bind(pid)
                .fetch_optional(&self.pool)
                .await?;
            if exists.is_none() {
                bail!("Parent folder {} not found", pid);
            }
        }

        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO folders (name, parent_id, sort_order)
            VALUES (?, ?, (SELECT COUNT(*) FROM folders WHERE parent_id IS ?))
            RETURNING id
        "#,
        )
        .bind(&clean_name)
        .bind(parent_id)
        .bind(parent_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    /// Get all folders as a flat list ordered by partition and position.
    /// Callers build any tree structure from the parent_id references.
    pub async fn get_folders(&self) -> Result<Vec<Folder>> {
        let rows: Vec<(i64, String, Option<i64>, i64)> = sqlx::query_as(
            "SELECT id, name, parent_id, sort_order FROM folders
             ORDER BY parent_id, sort_order, id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, name, parent_id, sort_order)| Folder {
                id,
                name,
                parent_id,
                sort_order,
            })
            .collect())
    }

    /// Rename an existing folder.
    pub async fn rename_folder(&self, folder_id: i64, new_name: &str) -> Result<()> {
        let clean_name = Self::sanitize_name(new_name)?;

        let result = sqlx::query("UPDATE folders SET name = ? WHERE id = ?")
            .bind(&clean_name)
            .bind(folder_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            bail!("Folder {} not found", folder_id);
        }
        Ok(())
    }

    /// Delete a folder. Feeds inside move to the top level; child folders
    /// are reparented to the top level by the ON DELETE SET NULL reference.
    pub async fn delete_folder(&self, folder_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE feeds SET folder_id = NULL WHERE folder_id = ?")
            .bind(folder_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM folders WHERE id = ?")
            .bind(folder_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Move a folder under a new parent (or to the top level).
    ///
    /// Rejects moving a folder into itself.
    pub async fn move_folder(&self, folder_id: i64, parent_id: Option<i64>) -> Result<()> {
        if parent_id == Some(folder_id) {
            bail!("Cannot move a folder into itself");
        }

        let result = sqlx::query(
            "UPDATE folders SET parent_id = ?,
             sort_order = (SELECT COUNT(*) FROM folders WHERE parent_id IS ? AND id != ?)
             WHERE id = ?",
        )
        .bind(parent_id)
        .bind(parent_id)
        .bind(folder_id)
        .bind(folder_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            bail!("Folder {} not found", folder_id);
        }
        Ok(())
    }

    /// Move a folder to a new position within its parent partition.
    ///
    /// Same transaction shape as `reorder_feed`: read, remove, clamp,
    /// reinsert, rewrite 0..n-1.
    pub async fn reorder_folder(&self, folder_id: i64, new_index: usize) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(Option<i64>,)> =
            sqlx::query_as("SELECT parent_id FROM folders WHERE id = ?")
                .bind(folder_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((parent_id,)) = row else {
            bail!("Folder {} not found", folder_id);
        };

        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT id FROM folders WHERE parent_id IS ? ORDER BY sort_order, id",
        )
        .bind(parent_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut order: Vec<i64> = rows
            .into_iter()
            .map(|(id,)| id)
            .filter(|id| *id != folder_id)
            .collect();
        let idx = new_index.min(order.len());
        order.insert(idx, folder_id);

        for (i, id) in order.iter().enumerate() {
            sqlx::query("UPDATE folders SET sort_order = ? WHERE id = ?")
                .bind(i as i64)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
