use anyhow::{bail, Result};

use super::schema::Database;
use super::types::Feed;
use crate::util::strip_control_chars;

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Sanitize and validate a feed or folder display name.
    ///
    /// Strips control characters (ANSI escape injection prevention), trims
    /// whitespace, and rejects empty/whitespace-only names.
    pub(crate) fn sanitize_name(name: &str) -> Result<String> {
        let sanitized = strip_control_chars(name);
        let trimmed = sanitized.trim();
        if trimmed.is_empty() {
            bail!("Name cannot be empty or whitespace-only");
        }
        Ok(trimmed.to_owned())
    }

    /// Add a feed, returning its ID.
    ///
    /// The URL is the feed's identity: adding an existing URL updates the
    /// display name and returns the existing row's id instead of failing.
    /// New feeds are appended at the end of their partition's order.
    pub async fn add_feed(
        &self,
        url: &str,
        title: &str,
        folder_id: Option<i64>,
    ) -> Result<i64> {
        let clean_title = Self::sanitize_name(title)?;

        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO feeds (url, title, folder_id, sort_order)
            VALUES (?, ?, ?, (SELECT COUNT(*) FROM feeds WHERE folder_id IS ?))
            ON CONFLICT(url) DO UPDATE SET title = excluded.title
            RETURNING id
        "#,
        )
        .bind(url)
        .bind(&clean_title)
        .bind(folder_id)
        .bind(folder_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    /// Get all feeds ordered by partition and position.
    pub async fn get_feeds(&self) -> Result<Vec<Feed>> {
        let rows: Vec<(i64, String, String, Option<i64>, i64)> = sqlx::query_as(
            "SELECT id, url, title, folder_id, sort_order FROM feeds
             ORDER BY folder_id, sort_order, id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, url, title, folder_id, sort_order)| Feed {
                id,
                url,
                title,
                folder_id,
                sort_order,
            })
            .collect())
    }

    /// Get a single feed by id.
    pub async fn get_feed(&self, feed_id: i64) -> Result<Option<Feed>> {
        let row: Option<(i64, String, String, Option<i64>, i64)> = sqlx::query_as(
            "SELECT id, url, title, folder_id, sort_order FROM feeds WHERE id = ?",
        )
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, url, title, folder_id, sort_order)| Feed {
            id,
            url,
            title,
            folder_id,
            sort_order,
        }))
    }

    /// Delete a feed and everything that hangs off it.
    ///
    /// Articles are deleted explicitly (rather than relying on the CASCADE)
    /// so the search-index triggers fire row by row and the index stays in
    /// sync. Metadata cascades; archives are left for `cleanup_orphans`.
    pub async fn delete_feed(&self, feed_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM articles WHERE feed_id = ?")
            .bind(feed_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM feeds WHERE id = ?")
            .bind(feed_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Rename a feed.
    ///
    /// The search index mirrors the feed name into every article entry, so
    /// the rewrite happens inside the same transaction as the rename.
    pub async fn rename_feed(&self, feed_id: i64, new_title: &str) -> Result<()> {
        let clean_title = Self::sanitize_name(new_title)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE feeds SET title = ? WHERE id = ?")
            .bind(&clean_title)
            .bind(feed_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE article_search SET feed_title = ?
             WHERE rowid IN (SELECT id FROM articles WHERE feed_id = ?)",
        )
        .bind(&clean_title)
        .bind(feed_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Move a feed into a folder, or to the top level if `folder_id` is
    /// `None`. The feed is appended at the end of the target partition and
    /// the source partition is re-packed to stay contiguous.
    pub async fn move_feed_to_folder(&self, feed_id: i64, folder_id: Option<i64>) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(Option<i64>,)> =
            sqlx::query_as("SELECT folder_id FROM feeds WHERE id = ?")
                .bind(feed_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((old_folder,)) = row else {
            bail!("Feed {} not found", feed_id);
        };

        sqlx::query(
            "UPDATE feeds SET folder_id = ?,
             sort_order = (SELECT COUNT(*) FROM feeds WHERE folder_id IS ? AND id != ?)
             WHERE id = ?",
        )
        .bind(folder_id)
        .bind(folder_id)
        .bind(feed_id)
        .bind(feed_id)
        .execute(&mut *tx)
        .await?;

        // Re-pack the partition the feed left
        let remaining: Vec<(i64,)> = sqlx::query_as(
            "SELECT id FROM feeds WHERE folder_id IS ? ORDER BY sort_order, id",
        )
        .bind(old_folder)
        .fetch_all(&mut *tx)
        .await?;
        for (i, (id,)) in remaining.iter().enumerate() {
            sqlx::query("UPDATE feeds SET sort_order = ? WHERE id = ?")
                .bind(i as i64)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Move a feed to a new position within its folder partition.
    ///
    /// One transaction: read the current order, remove the target, reinsert
    /// at the requested position (clamped — interactive drags produce
    /// arbitrary indices), then rewrite every index contiguously 0..n-1.
    pub async fn reorder_feed(&self, feed_id: i64, new_index: usize) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(Option<i64>,)> =
            sqlx::query_as("SELECT folder_id FROM feeds WHERE id = ?")
                .bind(feed_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((folder_id,)) = row else {
            bail!("Feed {} not found", feed_id);
        };

        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT id FROM feeds WHERE folder_id IS ? ORDER BY sort_order, id",
        )
        .bind(folder_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut order: Vec<i64> = rows.into_iter().map(|(id,)| id).filter(|id| *id != feed_id).collect();
        let idx = new_index.min(order.len());
        order.insert(idx, feed_id);

        for (i, id) in order.iter().enumerate() {
            sqlx::query("UPDATE feeds SET sort_order = ? WHERE id = ?")
                .bind(i as i64)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::Database;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_add_feed_and_get() {
        let db = test_db().await;
        let id = db
            .add_feed("https://example.com/rss", "Example", None)
            .await
            .unwrap();
        assert!(id > 0);

        let feeds = db.get_feeds().await.unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].url, "https://example.com/rss");
        assert_eq!(feeds[0].title, "Example");
        assert_eq!(feeds[0].sort_order, 0);
    }

    #[tokio::test]
    async fn test_add_feed_duplicate_url_updates_title() {
        let db = test_db().await;
        let id1 = db
            .add_feed("https://example.com/rss", "Old", None)
            .await
            .unwrap();
        let id2 = db
            .add_feed("https://example.com/rss", "New", None)
            .await
            .unwrap();

        assert_eq!(id1, id2);
        let feeds = db.get_feeds().await.unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].title, "New");
    }

    #[tokio::test]
    async fn test_add_feed_rejects_blank_title() {
        let db = test_db().await;
        assert!(db.add_feed("https://x.com/rss", "   ", None).await.is_err());
    }

    #[tokio::test]
    async fn test_feeds_append_in_order() {
        let db = test_db().await;
        for i in 0..3 {
            db.add_feed(&format!("https://f{i}.com/rss"), &format!("F{i}"), None)
                .await
                .unwrap();
        }
        let feeds = db.get_feeds().await.unwrap();
        let orders: Vec<i64> = feeds.iter().map(|f| f.sort_order).collect();
        assert_eq!(orders, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_reorder_feed_contiguous() {
        let db = test_db().await;
        let mut ids = Vec::new();
        for i in 0..4 {
            ids.push(
                db.add_feed(&format!("https://f{i}.com/rss"), &format!("F{i}"), None)
                    .await
                    .unwrap(),
            );
        }

        // Move the last feed to the front
        db.reorder_feed(ids[3], 0).await.unwrap();

        let feeds = db.get_feeds().await.unwrap();
        let by_order: Vec<i64> = feeds.iter().map(|f| f.id).collect();
        assert_eq!(by_order, vec![ids[3], ids[0], ids[1], ids[2]]);
        let orders: Vec<i64> = feeds.iter().map(|f| f.sort_order).collect();
        assert_eq!(orders, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_reorder_feed_clamps_large_index() {
        let db = test_db().await;
        let a = db.add_feed("https://a.com/rss", "A", None).await.unwrap();
        let b = db.add_feed("https://b.com/rss", "B", None).await.unwrap();

        db.reorder_feed(a, 999).await.unwrap();

        let feeds = db.get_feeds().await.unwrap();
        let by_order: Vec<i64> = feeds.iter().map(|f| f.id).collect();
        assert_eq!(by_order, vec![b, a]);
    }

    #[tokio::test]
    async fn test_move_feed_repacks_source_partition() {
        let db = test_db().await;
        let folder = db.create_folder("Tech", None).await.unwrap();
        let a = db.add_feed("https://a.com/rss", "A", None).await.unwrap();
        let _b = db.add_feed("https://b.com/rss", "B", None).await.unwrap();
        let _c = db.add_feed("https://c.com/rss", "C", None).await.unwrap();

        db.move_feed_to_folder(a, Some(folder)).await.unwrap();

        let feeds = db.get_feeds().await.unwrap();
        let top_level: Vec<i64> = feeds
            .iter()
            .filter(|f| f.folder_id.is_none())
            .map(|f| f.sort_order)
            .collect();
        assert_eq!(top_level, vec![0, 1]);
        let moved = feeds.iter().find(|f| f.id == a).unwrap();
        assert_eq!(moved.folder_id, Some(folder));
        assert_eq!(moved.sort_order, 0);
    }

    #[tokio::test]
    async fn test_delete_feed_removes_articles() {
        let db = test_db().await;
        let id = db.add_feed("https://a.com/rss", "A", None).await.unwrap();
        db.upsert_new(
            id,
            &[crate::storage::NewItem {
                link: "https://a.com/1".into(),
                title: "One".into(),
                published: None,
                content: None,
            }],
        )
        .await
        .unwrap();

        db.delete_feed(id).await.unwrap();

        assert!(db.get_feeds().await.unwrap().is_empty());
        let articles = db.get_articles_for_feed(id, None).await.unwrap();
        assert!(articles.is_empty());
    }
}
