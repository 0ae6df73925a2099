use anyhow::{bail, Result};
use std::collections::{HashMap, HashSet, VecDeque};

use super::schema::Database;
use super::types::{Article, ArticleRow, DuplicateGroup};
use crate::util::{host_of, token_overlap};

// ============================================================================
// Similarity Scoring
// ============================================================================

// Weighted blend of the non-link signals. The weights sum to 1.0 so a
// perfect non-link match can reach the score an identical link gets outright.
const WEIGHT_TITLE: f64 = 0.4;
const WEIGHT_CONTENT: f64 = 0.2;
const WEIGHT_SUMMARY: f64 = 0.1;
const WEIGHT_DOMAIN: f64 = 0.15;
const WEIGHT_DATE: f64 = 0.15;

/// Publish dates within this window count as "close"; the date signal
/// decays linearly to zero across it.
const DATE_PROXIMITY_WINDOW_SECS: f64 = 72.0 * 3600.0;

/// Groups at or above this similarity are safe to merge without review.
pub const AUTO_MERGE_THRESHOLD: f64 = 0.9;

/// Maximum articles considered per duplicate scan. Pairwise scoring is
/// quadratic; the scan is an on-demand analytic, not a hot path.
const MAX_CANDIDATES: i64 = 500;

/// Pairwise similarity of two articles in `[0.0, 1.0]`.
///
/// An identical link is identity: 1.0, no further questions. Otherwise the
/// score is a weighted blend of title/content/summary token overlap, a
/// same-host bonus, and publish-date proximity.
pub fn similarity(a: &Article, b: &Article) -> f64 {
    if a.link == b.link {
        return 1.0;
    }

    let mut score = token_overlap(&a.title, &b.title) * WEIGHT_TITLE;

    if let (Some(ca), Some(cb)) = (&a.content, &b.content) {
        score += token_overlap(ca, cb) * WEIGHT_CONTENT;
    }
    if let (Some(sa), Some(sb)) = (&a.summary, &b.summary) {
        score += token_overlap(sa, sb) * WEIGHT_SUMMARY;
    }

    if let (Some(ha), Some(hb)) = (host_of(&a.link), host_of(&b.link)) {
        if ha == hb {
            score += WEIGHT_DOMAIN;
        }
    }

    if let (Some(pa), Some(pb)) = (a.published, b.published) {
        let distance = (pa - pb).abs() as f64;
        let proximity = (1.0 - distance / DATE_PROXIMITY_WINDOW_SECS).max(0.0);
        score += proximity * WEIGHT_DATE;
    }

    score
}

/// Orders candidate primaries: oldest first, richer content as tiebreak.
fn primary_rank(a: &Article) -> (i64, i64, i64) {
    let richness = a.content.as_deref().map(str::len).unwrap_or(0) as i64;
    (a.created_at, -richness, a.id)
}

/// Groups candidates whose pairwise similarity reaches `threshold`.
///
/// Matches are grouped transitively (A~B and B~C puts all three in one group
/// even if A and C score below the threshold); each group records the
/// highest pairwise similarity seen inside it and lists the primary first.
pub fn group_candidates(articles: &[Article], threshold: f64) -> Vec<DuplicateGroup> {
    // Pairwise scores above the threshold become edges
    let mut edges: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut best_score: HashMap<usize, f64> = HashMap::new();
    for i in 0..articles.len() {
        for j in (i + 1)..articles.len() {
            let score = similarity(&articles[i], &articles[j]);
            if score >= threshold {
                edges.entry(i).or_default().push(j);
                edges.entry(j).or_default().push(i);
                for k in [i, j] {
                    let e = best_score.entry(k).or_insert(0.0);
                    if score > *e {
                        *e = score;
                    }
                }
            }
        }
    }

    // Transitive closure via breadth-first walk over the edge set
    let mut seen: HashSet<usize> = HashSet::new();
    let mut groups = Vec::new();
    for start in 0..articles.len() {
        if seen.contains(&start) || !edges.contains_key(&start) {
            continue;
        }
        let mut members = Vec::new();
        let mut queue = VecDeque::from([start]);
        seen.insert(start);
        while let Some(idx) = queue.pop_front() {
            members.push(idx);
            for &next in edges.get(&idx).into_iter().flatten() {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }

        members.sort_by_key(|&idx| primary_rank(&articles[idx]));
        let similarity = members
            .iter()
            .filter_map(|idx| best_score.get(idx))
            .fold(0.0f64, |acc, &s| acc.max(s));

        groups.push(DuplicateGroup {
            primary_id: articles[members[0]].id,
            duplicate_ids: members[1..].iter().map(|&idx| articles[idx].id).collect(),
            similarity,
        });
    }

    groups.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    groups
}

impl Database {
    // ========================================================================
    // Duplicate Detection
    // ========================================================================

    /// Scan recent articles for duplicate groups at or above `threshold`.
    pub async fn find_duplicates(&self, threshold: f64) -> Result<Vec<DuplicateGroup>> {
        if !(0.0..=1.0).contains(&threshold) {
            bail!("Similarity threshold must be within 0.0..=1.0");
        }

        let rows = sqlx::query_as::<_, ArticleRow>(
            r#"
            SELECT id, feed_id, link, title, published, content, summary, read, status, created_at
            FROM articles
            ORDER BY created_at DESC, id DESC
            LIMIT ?
        "#,
        )
        .bind(MAX_CANDIDATES)
        .fetch_all(&self.pool)
        .await?;
        let articles: Vec<Article> = rows.into_iter().map(ArticleRow::into_article).collect();

        Ok(group_candidates(&articles, threshold))
    }

    /// Merge a duplicate group into its primary: the duplicates' content and
    /// summary are concatenated onto the primary, then the duplicates are
    /// archived — all in one transaction, so a failure part-way leaves both
    /// tables untouched.
    pub async fn merge_group(&self, primary_id: i64, duplicate_ids: &[i64]) -> Result<()> {
        if duplicate_ids.contains(&primary_id) {
            bail!("Primary {} cannot also be a duplicate", primary_id);
        }
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let primary = sqlx::query_as::<_, ArticleRow>(
            r#"
            SELECT id, feed_id, link, title, published, content, summary, read, status, created_at
            FROM articles WHERE id = ?
        "#,
        )
        .bind(primary_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(primary) = primary.map(ArticleRow::into_article) else {
            bail!("Primary article {} not found", primary_id);
        };

        let mut content = primary.content.unwrap_or_default();
        let mut summary = primary.summary.unwrap_or_default();

        for &dup_id in duplicate_ids {
            let dup = sqlx::query_as::<_, ArticleRow>(
                r#"
                SELECT id, feed_id, link, title, published, content, summary, read, status, created_at
                FROM articles WHERE id = ?
            "#,
            )
            .bind(dup_id)
            .fetch_optional(&mut *tx)
            .await?;
            let Some(dup) = dup.map(ArticleRow::into_article) else {
                bail!("Duplicate article {} not found", dup_id);
            };

            if let Some(c) = dup.content.filter(|c| !c.is_empty() && *c != content) {
                if !content.is_empty() {
                    content.push_str("\n\n");
                }
                content.push_str(&c);
            }
            if let Some(s) = dup.summary.filter(|s| !s.is_empty() && *s != summary) {
                if !summary.is_empty() {
                    summary.push_str("\n\n");
                }
                summary.push_str(&s);
            }

            // Same move semantics as archive_article, inside this transaction
            sqlx::query(
                r#"
                INSERT INTO archived_articles
                    (id, feed_id, link, title, published, content, summary, read, status,
                     created_at, reason, archived_at)
                SELECT id, feed_id, link, title, published, content, summary, read, status,
                       created_at, 'duplicate-merge', ?
                FROM articles WHERE id = ?
            "#,
            )
            .bind(now)
            .bind(dup_id)
            .execute(&mut *tx)
            .await?;
            sqlx::query("DELETE FROM articles WHERE id = ?")
                .bind(dup_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("UPDATE articles SET content = ?, summary = ? WHERE id = ?")
            .bind(if content.is_empty() { None } else { Some(&content) })
            .bind(if summary.is_empty() { None } else { Some(&summary) })
            .bind(primary_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        tracing::info!(
            primary_id,
            merged = duplicate_ids.len(),
            "Merged duplicate group"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{group_candidates, similarity, AUTO_MERGE_THRESHOLD};
    use crate::storage::{Article, ArticleStatus, Database, NewItem};

    fn article(id: i64, link: &str, title: &str, published: Option<i64>) -> Article {
        Article {
            id,
            feed_id: 1,
            link: link.to_string(),
            title: title.to_string(),
            published,
            content: None,
            summary: None,
            read: false,
            status: ArticleStatus::New,
            created_at: 0,
        }
    }

    #[test]
    fn test_identical_link_scores_one() {
        let a = article(1, "https://a.com/post", "Title A", None);
        let b = article(2, "https://a.com/post", "Completely different", None);
        assert_eq!(similarity(&a, &b), 1.0);
    }

    #[test]
    fn test_same_story_different_hosts_scores_high() {
        let mut a = article(1, "https://a.com/1", "Rust compiler release announced today", Some(1000));
        let mut b = article(2, "https://b.com/1", "Rust compiler release announced today", Some(2000));
        a.content = Some("The compiler team released a new version".into());
        b.content = Some("The compiler team released a new version".into());
        a.summary = Some("New compiler version".into());
        b.summary = Some("New compiler version".into());

        let score = similarity(&a, &b);
        // Full title/content/summary overlap + date proximity, no domain bonus
        assert!(score > 0.8, "score was {score}");
        assert!(score < 1.0);
    }

    #[test]
    fn test_unrelated_articles_score_low() {
        let a = article(1, "https://a.com/1", "Gardening tips for spring", Some(0));
        let b = article(2, "https://b.com/2", "Quarterly earnings report", Some(10_000_000));
        assert!(similarity(&a, &b) < 0.2);
    }

    #[test]
    fn test_date_proximity_decays() {
        let near_a = article(1, "https://a.com/1", "Same headline here", Some(0));
        let near_b = article(2, "https://b.com/2", "Same headline here", Some(3600));
        let far_b = article(3, "https://b.com/3", "Same headline here", Some(30 * 24 * 3600));
        assert!(similarity(&near_a, &near_b) > similarity(&near_a, &far_b));
    }

    #[test]
    fn test_group_identical_links_one_group_similarity_one() {
        // Distinct ids, identical link: one group of size 2, similarity 1.0
        let a = article(1, "https://news.com/story", "Copy A", None);
        let b = article(2, "https://news.com/story", "Copy B", None);

        let groups = group_candidates(&[a, b], 0.75);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].duplicate_ids.len(), 1);
        assert_eq!(groups[0].similarity, 1.0);
    }

    #[test]
    fn test_group_is_transitive() {
        // a~b and b~c by link identity; a and c share nothing but still land
        // in one group through b
        let mut a = article(1, "https://x.com/1", "First headline entirely", None);
        let b1 = article(2, "https://x.com/1", "Second headline entirely", None);
        let b2 = article(3, "https://y.com/2", "Second headline entirely", None);
        let mut c = article(4, "https://y.com/2", "Third headline entirely", None);
        a.created_at = 10;
        c.created_at = 40;

        let groups = group_candidates(&[a, b1, b2, c], 0.99);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].primary_id, 1);
        assert_eq!(groups[0].duplicate_ids.len(), 3);
    }

    #[test]
    fn test_group_primary_tiebreak_prefers_richer_content() {
        let mut thin = article(1, "https://x.com/1", "Same story", None);
        let mut rich = article(2, "https://x.com/1", "Same story", None);
        thin.created_at = 100;
        rich.created_at = 100;
        rich.content = Some("a much longer body of content".into());

        let groups = group_candidates(&[thin, rich], 0.9);
        assert_eq!(groups[0].primary_id, 2);
    }

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn item(link: &str, title: &str, content: Option<&str>) -> NewItem {
        NewItem {
            link: link.to_string(),
            title: title.to_string(),
            published: Some(1704067200),
            content: content.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_find_duplicates_same_story_two_feeds() {
        // The UNIQUE link constraint keeps identical links out of the active
        // table, so the syndicated-copy case differs only in the link path.
        let db = test_db().await;
        let f1 = db.add_feed("https://a.com/rss", "A", None).await.unwrap();
        let f2 = db.add_feed("https://b.com/rss", "B", None).await.unwrap();
        db.upsert_new(
            f1,
            &[item(
                "https://news.com/story?src=a",
                "Major outage hits cloud provider",
                Some("The outage lasted four hours and affected three regions"),
            )],
        )
        .await
        .unwrap();
        db.upsert_new(
            f2,
            &[item(
                "https://news.com/story?src=b",
                "Major outage hits cloud provider",
                Some("The outage lasted four hours and affected three regions"),
            )],
        )
        .await
        .unwrap();

        let groups = db.find_duplicates(0.7).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].duplicate_ids.len(), 1);
        assert!(groups[0].similarity >= AUTO_MERGE_THRESHOLD);
    }

    #[tokio::test]
    async fn test_find_duplicates_primary_is_oldest() {
        let db = test_db().await;
        let f = db.add_feed("https://a.com/rss", "A", None).await.unwrap();
        let first = db
            .upsert_new(f, &[item("https://a.com/1", "Breaking news story today", Some("x"))])
            .await
            .unwrap();
        // Later row, same title and host
        let second = db
            .upsert_new(f, &[item("https://a.com/2", "Breaking news story today", Some("x"))])
            .await
            .unwrap();

        let groups = db.find_duplicates(0.5).await.unwrap();
        assert_eq!(groups.len(), 1);
        // Same created_at second resolution is possible; primary must be one
        // of the two and the other the duplicate
        let g = &groups[0];
        assert!(
            (g.primary_id == first[0].id && g.duplicate_ids == vec![second[0].id])
                || (g.primary_id == second[0].id && g.duplicate_ids == vec![first[0].id])
        );
    }

    #[tokio::test]
    async fn test_find_duplicates_none_below_threshold() {
        let db = test_db().await;
        let f = db.add_feed("https://a.com/rss", "A", None).await.unwrap();
        db.upsert_new(
            f,
            &[
                item("https://a.com/1", "Gardening tips", None),
                item("https://other.org/2", "Stock market update", None),
            ],
        )
        .await
        .unwrap();

        let groups = db.find_duplicates(0.75).await.unwrap();
        assert!(groups.is_empty());
    }

    #[tokio::test]
    async fn test_merge_group_concatenates_and_archives() {
        let db = test_db().await;
        let f = db.add_feed("https://a.com/rss", "A", None).await.unwrap();
        let arts = db
            .upsert_new(
                f,
                &[
                    item("https://a.com/1", "Story", Some("first body")),
                    item("https://a.com/2", "Story", Some("second body")),
                ],
            )
            .await
            .unwrap();

        db.merge_group(arts[0].id, &[arts[1].id]).await.unwrap();

        let primary = db.get_article_by_id(arts[0].id).await.unwrap().unwrap();
        assert_eq!(primary.content.as_deref(), Some("first body\n\nsecond body"));

        assert!(db.get_article_by_id(arts[1].id).await.unwrap().is_none());
        let archived = db.get_archived_by_id(arts[1].id).await.unwrap().unwrap();
        assert_eq!(archived.reason, "duplicate-merge");
    }

    #[tokio::test]
    async fn test_merge_group_rejects_primary_in_duplicates() {
        let db = test_db().await;
        assert!(db.merge_group(1, &[1, 2]).await.is_err());
    }

    #[tokio::test]
    async fn test_merge_group_missing_duplicate_rolls_back() {
        let db = test_db().await;
        let f = db.add_feed("https://a.com/rss", "A", None).await.unwrap();
        let arts = db
            .upsert_new(
                f,
                &[
                    item("https://a.com/1", "Story", Some("first")),
                    item("https://a.com/2", "Story", Some("second")),
                ],
            )
            .await
            .unwrap();

        // One real duplicate, one bogus id: the whole merge must roll back
        let result = db.merge_group(arts[0].id, &[arts[1].id, 9999]).await;
        assert!(result.is_err());

        let primary = db.get_article_by_id(arts[0].id).await.unwrap().unwrap();
        assert_eq!(primary.content.as_deref(), Some("first"));
        assert!(db.get_article_by_id(arts[1].id).await.unwrap().is_some());
        assert!(db.get_archived_by_id(arts[1].id).await.unwrap().is_none());
    }
}
