use chrono::Utc;
use sqlx::sqlite::SqliteRow;

use super::{Database, Error, NewPost, Post, RawPostData, Resolution, Tag};

impl Database {
    // POSTS

    pub async fn post(&self, id: i64) -> Result<Option<Post>, Error> {
        sqlx::query("SELECT * FROM posts WHERE id=?;")
            .bind(id)
            .try_map(|row: SqliteRow| Post::from_row(&row))
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn post_by_message(
        &self,
        author_id: i64,
        message_id: i64,
    ) -> Result<Option<Post>, Error> {
        sqlx::query("SELECT * FROM posts WHERE author_id=? AND message_id=?;")
            .bind(author_id)
            .bind(message_id)
            .try_map(|row: SqliteRow| Post::from_row(&row))
            .fetch_optional(&self.pool)
            .await
    }

    /// Post made from the album with this media group ID, if any.
    pub async fn post_by_media_group(
        &self,
        author_id: i64,
        media_group_id: &str,
    ) -> Result<Option<Post>, Error> {
        if media_group_id.is_empty() {
            return Ok(None);
        }
        sqlx::query("SELECT * FROM posts WHERE author_id=? AND media_group_id=?;")
            .bind(author_id)
            .bind(media_group_id)
            .try_map(|row: SqliteRow| Post::from_row(&row))
            .fetch_optional(&self.pool)
            .await
    }

    /// All posts of an author, newest first.
    pub async fn posts_by_author(&self, author_id: i64) -> Result<Vec<Post>, Error> {
        sqlx::query("SELECT * FROM posts WHERE author_id=? ORDER BY created_at DESC, id DESC;")
            .bind(author_id)
            .try_map(|row: SqliteRow| Post::from_row(&row))
            .fetch_all(&self.pool)
            .await
    }

    /// Posts that may still reference images hosted by Telegram, newest first.
    pub async fn posts_with_images(&self, limit: Option<u32>) -> Result<Vec<Post>, Error> {
        sqlx::query(
            "SELECT * FROM posts
            WHERE content LIKE '%<img%'
                OR json_extract(raw_data, '$.photo_file_id') IS NOT NULL
                OR json_extract(raw_data, '$.gallery_file_ids') IS NOT NULL
            ORDER BY id DESC
            LIMIT ?;",
        )
        .bind(limit.map_or(-1, i64::from))
        .try_map(|row: SqliteRow| Post::from_row(&row))
        .fetch_all(&self.pool)
        .await
    }

    /// Insert a new post, returning its ID.
    pub async fn insert_post(&self, post: &NewPost) -> Result<i64, Error> {
        let now = Utc::now();
        let raw = serde_json::to_string(&post.raw_data).map_err(|e| Error::Encode(Box::new(e)))?;
        sqlx::query_scalar(
            "INSERT INTO posts(author_id, message_id, title, rubric_id, content, source_url,
                channel_url, media_group_id, is_pending, publish_at, raw_data,
                created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id;",
        )
        .bind(post.author_id)
        .bind(post.message_id)
        .bind(&post.title)
        .bind(post.rubric_id)
        .bind(&post.content)
        .bind(&post.source_url)
        .bind(&post.channel_url)
        .bind(&post.media_group_id)
        .bind(post.is_pending)
        .bind(post.publish_at)
        .bind(raw)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
    }

    /// Overwrite what is displayed for an existing post. Moderation state,
    /// rubric and publish time stay as they are. A media group ID is only
    /// ever set, never cleared.
    pub async fn update_post_content(&self, post: &Post) -> Result<(), Error> {
        let raw = serde_json::to_string(&post.raw_data).map_err(|e| Error::Encode(Box::new(e)))?;
        sqlx::query(
            "UPDATE posts SET title=?, content=?, source_url=?, channel_url=?, raw_data=?,
                media_group_id=CASE WHEN media_group_id='' THEN ? ELSE media_group_id END,
                updated_at=?
            WHERE id=?;",
        )
        .bind(&post.title)
        .bind(&post.content)
        .bind(&post.source_url)
        .bind(&post.channel_url)
        .bind(raw)
        .bind(&post.media_group_id)
        .bind(Utc::now())
        .bind(post.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Only replace the rendered content and raw data of a post.
    pub async fn update_post_media(
        &self,
        id: i64,
        content: &str,
        raw_data: &RawPostData,
    ) -> Result<(), Error> {
        let raw = serde_json::to_string(raw_data).map_err(|e| Error::Encode(Box::new(e)))?;
        sqlx::query("UPDATE posts SET content=?, raw_data=?, updated_at=? WHERE id=?;")
            .bind(content)
            .bind(raw)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Move a pending post out of the approval gate. Only one of several
    /// concurrent calls for the same post gets [`Resolution::Resolved`].
    /// Posts that aren't pending are left untouched.
    pub async fn resolve_pending_post(&self, id: i64, approve: bool) -> Result<Resolution, Error> {
        let resolved = sqlx::query(
            "UPDATE posts SET is_pending=0, is_blocked=?, updated_at=?
            WHERE id=? AND is_pending=1
            RETURNING *;",
        )
        .bind(!approve)
        .bind(Utc::now())
        .bind(id)
        .try_map(|row: SqliteRow| Post::from_row(&row))
        .fetch_optional(&self.pool)
        .await?;

        if let Some(post) = resolved {
            return Ok(Resolution::Resolved(post));
        }

        Ok(match self.post(id).await? {
            Some(post) => Resolution::AlreadyResolved(post),
            None => Resolution::NotFound,
        })
    }

    /// Whether the author has a published post other than this one.
    pub async fn has_other_published_posts(
        &self,
        author_id: i64,
        except_post_id: i64,
    ) -> Result<bool, Error> {
        sqlx::query_scalar(
            "SELECT EXISTS(
                SELECT 1 FROM posts
                WHERE author_id=? AND id!=? AND is_pending=0 AND is_blocked=0
            );",
        )
        .bind(author_id)
        .bind(except_post_id)
        .fetch_one(&self.pool)
        .await
    }

    // TAGS

    pub async fn all_tags(&self) -> Result<Vec<Tag>, Error> {
        sqlx::query("SELECT * FROM tags ORDER BY id;")
            .try_map(|row: SqliteRow| Tag::from_row(&row))
            .fetch_all(&self.pool)
            .await
    }

    pub async fn create_tag(&self, name: &str, lemma: &str) -> Result<Tag, Error> {
        sqlx::query("INSERT INTO tags(name, lemma) VALUES (?, ?) RETURNING *;")
            .bind(name)
            .bind(lemma)
            .try_map(|row: SqliteRow| Tag::from_row(&row))
            .fetch_one(&self.pool)
            .await
    }

    /// Enable or disable automatic matching of a tag by name. Returns the
    /// amount of tags changed.
    pub async fn set_tag_active(&self, name: &str, active: bool) -> Result<u64, Error> {
        let result = sqlx::query("UPDATE tags SET is_active=? WHERE name=? COLLATE NOCASE;")
            .bind(active)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Tags of a post, in the order they were attached.
    pub async fn post_tags(&self, post_id: i64) -> Result<Vec<Tag>, Error> {
        sqlx::query(
            "SELECT tags.* FROM tags
            JOIN post_tags ON post_tags.tag_id = tags.id
            WHERE post_tags.post_id=?
            ORDER BY post_tags.position;",
        )
        .bind(post_id)
        .try_map(|row: SqliteRow| Tag::from_row(&row))
        .fetch_all(&self.pool)
        .await
    }

    /// Replace the tags of a post.
    pub async fn set_post_tags(&self, post_id: i64, tag_ids: &[i64]) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM post_tags WHERE post_id=?;")
            .bind(post_id)
            .execute(&mut *tx)
            .await?;

        for (position, tag_id) in tag_ids.iter().enumerate() {
            sqlx::query(
                "INSERT INTO post_tags(post_id, tag_id, position) VALUES (?, ?, ?)
                ON CONFLICT DO NOTHING;",
            )
            .bind(post_id)
            .bind(tag_id)
            .bind(position as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use chrono::Duration;

    use crate::database::{tests::memory_db, PostStatus};

    use super::*;

    fn new_post(author_id: i64, message_id: i64) -> NewPost {
        NewPost {
            author_id,
            message_id,
            title: "Title".to_string(),
            rubric_id: None,
            content: "content".to_string(),
            source_url: String::new(),
            channel_url: String::new(),
            media_group_id: String::new(),
            is_pending: false,
            publish_at: None,
            raw_data: RawPostData::default(),
        }
    }

    #[tokio::test]
    async fn message_ids_are_unique_per_author() {
        let db = memory_db().await;
        let (author, _) = db.get_or_create_author("chan", "", None).await.unwrap();
        db.insert_post(&new_post(author.id, 1)).await.unwrap();
        assert!(db.insert_post(&new_post(author.id, 1)).await.is_err());

        let (other, _) = db.get_or_create_author("other", "", None).await.unwrap();
        db.insert_post(&new_post(other.id, 1)).await.unwrap();
    }

    #[tokio::test]
    async fn media_group_is_unique_per_author_but_only_when_set() {
        let db = memory_db().await;
        let (author, _) = db.get_or_create_author("chan", "", None).await.unwrap();

        // Plenty of posts without a group are fine.
        db.insert_post(&new_post(author.id, 1)).await.unwrap();
        db.insert_post(&new_post(author.id, 2)).await.unwrap();

        let mut grouped = new_post(author.id, 3);
        grouped.media_group_id = "album".to_string();
        let id = db.insert_post(&grouped).await.unwrap();

        let mut duplicate = new_post(author.id, 4);
        duplicate.media_group_id = "album".to_string();
        assert!(db.insert_post(&duplicate).await.is_err());

        let found = db.post_by_media_group(author.id, "album").await.unwrap();
        assert_eq!(found.unwrap().id, id);
        assert!(db
            .post_by_media_group(author.id, "")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn content_update_keeps_group_and_moderation() {
        let db = memory_db().await;
        let (author, _) = db.get_or_create_author("chan", "", None).await.unwrap();
        let mut grouped = new_post(author.id, 3);
        grouped.media_group_id = "album".to_string();
        grouped.is_pending = true;
        let id = db.insert_post(&grouped).await.unwrap();

        let mut post = db.post(id).await.unwrap().unwrap();
        post.title = "New".to_string();
        post.media_group_id = String::new();
        post.raw_data.gallery_urls = vec!["https://x/1.jpg".to_string()];
        db.update_post_content(&post).await.unwrap();

        let post = db.post(id).await.unwrap().unwrap();
        assert_eq!(post.title, "New");
        assert_eq!(post.media_group_id, "album");
        assert!(post.is_pending);
        assert_eq!(post.raw_data.gallery_urls.len(), 1);
    }

    #[tokio::test]
    async fn approval_gate_transitions() {
        let db = memory_db().await;
        let (author, _) = db.get_or_create_author("chan", "", None).await.unwrap();
        let mut pending = new_post(author.id, 1);
        pending.is_pending = true;
        let approved_id = db.insert_post(&pending).await.unwrap();
        pending.message_id = 2;
        let rejected_id = db.insert_post(&pending).await.unwrap();

        let now = Utc::now();
        let Resolution::Resolved(approved) =
            db.resolve_pending_post(approved_id, true).await.unwrap()
        else {
            panic!("pending post was not approved");
        };
        assert_eq!(approved.status(now), PostStatus::Published);
        let Resolution::Resolved(rejected) =
            db.resolve_pending_post(rejected_id, false).await.unwrap()
        else {
            panic!("pending post was not rejected");
        };
        assert_eq!(rejected.status(now), PostStatus::Blocked);

        // Pressing again changes nothing.
        let Resolution::AlreadyResolved(again) =
            db.resolve_pending_post(rejected_id, true).await.unwrap()
        else {
            panic!("resolved post was resolved twice");
        };
        assert!(again.is_blocked);
        assert_eq!(
            db.post(rejected_id).await.unwrap().unwrap().status(now),
            PostStatus::Blocked
        );

        assert_eq!(
            db.resolve_pending_post(9999, true).await.unwrap(),
            Resolution::NotFound
        );

        assert!(db
            .has_other_published_posts(author.id, rejected_id)
            .await
            .unwrap());
        assert!(!db
            .has_other_published_posts(author.id, approved_id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn concurrent_approvals_resolve_once() {
        let db = memory_db().await;
        let (author, _) = db.get_or_create_author("chan", "", None).await.unwrap();
        let mut pending = new_post(author.id, 1);
        pending.is_pending = true;
        let id = db.insert_post(&pending).await.unwrap();

        let (first, second) = tokio::join!(
            db.resolve_pending_post(id, true),
            db.resolve_pending_post(id, true)
        );
        let outcomes = [first.unwrap(), second.unwrap()];
        let resolved = outcomes
            .iter()
            .filter(|x| matches!(x, Resolution::Resolved(_)))
            .count();
        assert_eq!(resolved, 1);
        assert!(outcomes
            .iter()
            .any(|x| matches!(x, Resolution::AlreadyResolved(_))));
    }

    #[tokio::test]
    async fn delayed_posts_are_scheduled() {
        let db = memory_db().await;
        let (author, _) = db.get_or_create_author("chan", "", None).await.unwrap();
        let mut post = new_post(author.id, 1);
        post.publish_at = Some(Utc::now() + Duration::days(1));
        let id = db.insert_post(&post).await.unwrap();

        let post = db.post(id).await.unwrap().unwrap();
        assert_eq!(post.status(Utc::now()), PostStatus::Scheduled);
        assert_eq!(
            post.status(Utc::now() + Duration::days(2)),
            PostStatus::Published
        );
    }

    #[tokio::test]
    async fn post_tags_keep_their_order() {
        let db = memory_db().await;
        let (author, _) = db.get_or_create_author("chan", "", None).await.unwrap();
        let post_id = db.insert_post(&new_post(author.id, 1)).await.unwrap();
        let rust = db.create_tag("Rust", "rust").await.unwrap();
        let go = db.create_tag("Go", "go").await.unwrap();

        db.set_post_tags(post_id, &[go.id, rust.id]).await.unwrap();
        let names: Vec<String> = db
            .post_tags(post_id)
            .await
            .unwrap()
            .into_iter()
            .map(|x| x.name)
            .collect();
        assert_eq!(names, ["Go", "Rust"]);

        db.set_post_tags(post_id, &[]).await.unwrap();
        assert!(db.post_tags(post_id).await.unwrap().is_empty());

        assert_eq!(db.set_tag_active("rust", false).await.unwrap(), 1);
        let tags = db.all_tags().await.unwrap();
        assert!(!tags.iter().find(|x| x.id == rust.id).unwrap().is_active);
    }
}
