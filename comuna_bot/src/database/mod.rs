mod posts;
mod sessions;
mod types;

use std::{str::FromStr, sync::Arc};

use chrono::Utc;
pub use sqlx::Error;
use sqlx::{
    migrate::MigrateDatabase,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Executor, Sqlite,
};
use teloxide::types::ChatId;
use tokio::sync::{Mutex, MutexGuard};

pub use types::*;

type Pool = sqlx::Pool<Sqlite>;

pub struct Database {
    pool: Pool,
    /// Held while a channel post is being written, so that messages of one
    /// album arriving at the same time collapse into one post.
    ingest_mutex: Mutex<()>,
}

impl Database {
    /// Connect to the database at this `sqlite:` URL, creating it and its
    /// tables if needed. `sqlite::memory:` gives a private in-memory database.
    pub async fn new(url: &str) -> Result<Arc<Database>, Error> {
        let in_memory = url.contains(":memory:");

        let mut pool_options = SqlitePoolOptions::new();
        if in_memory {
            // Every connection to an in-memory database gets its own database,
            // so there must be exactly one and it must never be recycled.
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        } else {
            if !Sqlite::database_exists(url).await.unwrap_or(false) {
                Sqlite::create_database(url).await?;
            }
            pool_options = pool_options.max_connections(16);
        }

        let pool = pool_options
            .connect_with(
                SqliteConnectOptions::from_str(url)?
                    .foreign_keys(true)
                    .pragma("cache_size", "-32768")
                    .busy_timeout(std::time::Duration::from_secs(600)),
            )
            .await?;

        Self::create_tables(&pool).await?;

        Ok(Arc::new(Database {
            pool,
            ingest_mutex: Mutex::new(()),
        }))
    }

    async fn create_tables(pool: &Pool) -> Result<(), Error> {
        // RUBRICS:
        // name and slug are unique, hidden rubrics stay assigned but are not
        // offered in the bot.
        pool.execute(sqlx::query(
            "CREATE TABLE IF NOT EXISTS rubrics (
                id INTEGER PRIMARY KEY NOT NULL,
                name TEXT NOT NULL UNIQUE,
                slug TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT '',
                is_active INTEGER NOT NULL DEFAULT 1,
                is_hidden INTEGER NOT NULL DEFAULT 0,
                sort_order INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            ) STRICT;",
        ))
        .await?;

        // AUTHORS:
        // one row per channel, username is compared case-insensitively.
        // admin_chat_id is the private chat of whoever connected the channel.
        pool.execute(sqlx::query(
            "CREATE TABLE IF NOT EXISTS authors (
                id INTEGER PRIMARY KEY NOT NULL,
                username TEXT NOT NULL UNIQUE COLLATE NOCASE,
                title TEXT NOT NULL DEFAULT '',
                channel_id INTEGER NULL,
                channel_url TEXT NOT NULL DEFAULT '',
                avatar_url TEXT NOT NULL DEFAULT '',
                avatar_file_id TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                subscribers_count INTEGER NOT NULL DEFAULT 0,
                rubric_id INTEGER NULL REFERENCES rubrics(id) ON DELETE SET NULL,
                auto_publish INTEGER NOT NULL DEFAULT 1,
                admin_chat_id INTEGER NULL,
                is_blocked INTEGER NOT NULL DEFAULT 0,
                invite_url TEXT NOT NULL DEFAULT '',
                publish_delay_days INTEGER NOT NULL DEFAULT 0,
                first_post_notified INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            ) STRICT;",
        ))
        .await?;

        // POSTS:
        // (author_id, message_id) identifies a post. media_group_id is empty
        // for posts that are not albums. raw_data is JSON.
        pool.execute(sqlx::query(
            "CREATE TABLE IF NOT EXISTS posts (
                id INTEGER PRIMARY KEY NOT NULL,
                author_id INTEGER NOT NULL REFERENCES authors(id) ON DELETE CASCADE,
                message_id INTEGER NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                rubric_id INTEGER NULL REFERENCES rubrics(id) ON DELETE SET NULL,
                content TEXT NOT NULL DEFAULT '',
                source_url TEXT NOT NULL DEFAULT '',
                channel_url TEXT NOT NULL DEFAULT '',
                media_group_id TEXT NOT NULL DEFAULT '',
                is_pending INTEGER NOT NULL DEFAULT 0,
                is_blocked INTEGER NOT NULL DEFAULT 0,
                publish_at TEXT NULL,
                raw_data TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (author_id, message_id)
            ) STRICT;",
        ))
        .await?;

        // TAGS and POST_TAGS:
        pool.execute(sqlx::query(
            "CREATE TABLE IF NOT EXISTS tags (
                id INTEGER PRIMARY KEY NOT NULL,
                name TEXT NOT NULL,
                lemma TEXT NOT NULL DEFAULT '',
                is_active INTEGER NOT NULL DEFAULT 1
            ) STRICT;",
        ))
        .await?;
        pool.execute(sqlx::query(
            "CREATE TABLE IF NOT EXISTS post_tags (
                post_id INTEGER NOT NULL REFERENCES posts(id) ON DELETE CASCADE,
                tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
                position INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (post_id, tag_id)
            ) STRICT;",
        ))
        .await?;

        // BOT_SESSIONS:
        // one draft per private chat. pending_update_message is JSON.
        pool.execute(sqlx::query(
            "CREATE TABLE IF NOT EXISTS bot_sessions (
                telegram_user_id INTEGER PRIMARY KEY NOT NULL,
                auto_publish INTEGER NOT NULL DEFAULT 1,
                mode_selected INTEGER NOT NULL DEFAULT 0,
                rubric_id INTEGER NULL REFERENCES rubrics(id) ON DELETE SET NULL,
                rubric_skipped INTEGER NOT NULL DEFAULT 0,
                publish_delay_days INTEGER NULL,
                invite_url TEXT NOT NULL DEFAULT '',
                invite_decided INTEGER NOT NULL DEFAULT 0,
                invite_waiting INTEGER NOT NULL DEFAULT 0,
                instructions_sent INTEGER NOT NULL DEFAULT 0,
                selected_author_id INTEGER NULL REFERENCES authors(id) ON DELETE SET NULL,
                pending_update_post_id INTEGER NULL,
                pending_update_message TEXT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            ) STRICT;",
        ))
        .await?;

        // VERIFICATION_CODES and AUTHOR_ADMINS:
        // codes are issued to site users and redeemed in the bot to prove
        // that the site user manages the channels connected from that chat.
        pool.execute(sqlx::query(
            "CREATE TABLE IF NOT EXISTS verification_codes (
                code TEXT PRIMARY KEY NOT NULL COLLATE NOCASE,
                site_user_id INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                used_at TEXT NULL
            ) STRICT;",
        ))
        .await?;
        pool.execute(sqlx::query(
            "CREATE TABLE IF NOT EXISTS author_admins (
                author_id INTEGER NOT NULL REFERENCES authors(id) ON DELETE CASCADE,
                site_user_id INTEGER NOT NULL,
                telegram_user_id INTEGER NOT NULL,
                verified_at TEXT NOT NULL,
                PRIMARY KEY (author_id, site_user_id)
            ) STRICT;",
        ))
        .await?;

        // Columns added after the tables were first deployed. These fail
        // harmlessly if the column is already there.
        let _ = sqlx::query(
            "ALTER TABLE bot_sessions ADD COLUMN rubric_skipped INTEGER NOT NULL DEFAULT 0;",
        )
        .execute(pool)
        .await;

        // Indexes. These fail harmlessly if they already exist.
        let _ = sqlx::query(
            "CREATE UNIQUE INDEX posts_media_group ON posts(author_id, media_group_id)
            WHERE media_group_id != '';",
        )
        .execute(pool)
        .await;
        let _ = sqlx::query("CREATE INDEX authors_admin_chat ON authors(admin_chat_id);")
            .execute(pool)
            .await;
        let _ = sqlx::query("CREATE INDEX tags_lemma ON tags(lemma);")
            .execute(pool)
            .await;

        Ok(())
    }

    /// Lock that serializes writes of channel posts.
    pub async fn lock_ingestion(&self) -> MutexGuard<'_, ()> {
        self.ingest_mutex.lock().await
    }

    // RUBRICS

    pub async fn create_rubric(
        &self,
        name: &str,
        slug: &str,
        description: &str,
        sort_order: i64,
    ) -> Result<Rubric, Error> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO rubrics(name, slug, description, sort_order, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING *;",
        )
        .bind(name)
        .bind(slug)
        .bind(description)
        .bind(sort_order)
        .bind(now)
        .bind(now)
        .try_map(|row: SqliteRow| Rubric::from_row(&row))
        .fetch_one(&self.pool)
        .await
    }

    pub async fn rubric(&self, id: i64) -> Result<Option<Rubric>, Error> {
        sqlx::query("SELECT * FROM rubrics WHERE id=?;")
            .bind(id)
            .try_map(|row: SqliteRow| Rubric::from_row(&row))
            .fetch_optional(&self.pool)
            .await
    }

    /// Rubric by ID, but only if it's active.
    pub async fn active_rubric(&self, id: i64) -> Result<Option<Rubric>, Error> {
        sqlx::query("SELECT * FROM rubrics WHERE id=? AND is_active=1;")
            .bind(id)
            .try_map(|row: SqliteRow| Rubric::from_row(&row))
            .fetch_optional(&self.pool)
            .await
    }

    /// Rubrics channel owners can pick from, in display order.
    pub async fn selectable_rubrics(&self) -> Result<Vec<Rubric>, Error> {
        sqlx::query(
            "SELECT * FROM rubrics WHERE is_active=1 AND is_hidden=0
            ORDER BY sort_order, name;",
        )
        .try_map(|row: SqliteRow| Rubric::from_row(&row))
        .fetch_all(&self.pool)
        .await
    }

    pub async fn all_rubrics(&self) -> Result<Vec<Rubric>, Error> {
        sqlx::query("SELECT * FROM rubrics ORDER BY sort_order, name;")
            .try_map(|row: SqliteRow| Rubric::from_row(&row))
            .fetch_all(&self.pool)
            .await
    }

    /// Hide or show a rubric by slug. Returns `false` if there's no such rubric.
    pub async fn set_rubric_hidden(&self, slug: &str, hidden: bool) -> Result<bool, Error> {
        let result = sqlx::query("UPDATE rubrics SET is_hidden=?, updated_at=? WHERE slug=?;")
            .bind(hidden)
            .bind(Utc::now())
            .bind(slug)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // AUTHORS

    pub async fn author(&self, id: i64) -> Result<Option<Author>, Error> {
        sqlx::query("SELECT * FROM authors WHERE id=?;")
            .bind(id)
            .try_map(|row: SqliteRow| Author::from_row(&row))
            .fetch_optional(&self.pool)
            .await
    }

    /// Author by channel username, compared case-insensitively.
    pub async fn author_by_username(&self, username: &str) -> Result<Option<Author>, Error> {
        sqlx::query("SELECT * FROM authors WHERE username=?;")
            .bind(username)
            .try_map(|row: SqliteRow| Author::from_row(&row))
            .fetch_optional(&self.pool)
            .await
    }

    /// Get the author for this channel username, creating it if it doesn't
    /// exist. The second value is `true` if it was created.
    pub async fn get_or_create_author(
        &self,
        username: &str,
        title: &str,
        channel_id: Option<i64>,
    ) -> Result<(Author, bool), Error> {
        let now = Utc::now();
        let inserted = sqlx::query(
            "INSERT INTO authors(username, title, channel_id, channel_url, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(username) DO NOTHING
            RETURNING *;",
        )
        .bind(username)
        .bind(title)
        .bind(channel_id)
        .bind(format!("https://t.me/{username}"))
        .bind(now)
        .bind(now)
        .try_map(|row: SqliteRow| Author::from_row(&row))
        .fetch_optional(&self.pool)
        .await?;

        if let Some(author) = inserted {
            return Ok((author, true));
        }

        match self.author_by_username(username).await? {
            Some(author) => Ok((author, false)),
            None => Err(Error::RowNotFound),
        }
    }

    pub async fn all_authors(&self) -> Result<Vec<Author>, Error> {
        sqlx::query("SELECT * FROM authors ORDER BY username;")
            .try_map(|row: SqliteRow| Author::from_row(&row))
            .fetch_all(&self.pool)
            .await
    }

    /// Unblocked channels managed from this private chat, by username.
    pub async fn authors_administered_from(&self, chat: ChatId) -> Result<Vec<Author>, Error> {
        sqlx::query(
            "SELECT * FROM authors WHERE admin_chat_id=? AND is_blocked=0
            ORDER BY username;",
        )
        .bind(chat.0)
        .try_map(|row: SqliteRow| Author::from_row(&row))
        .fetch_all(&self.pool)
        .await
    }

    /// Author with this ID, but only if it's managed from this chat.
    pub async fn author_administered_from(
        &self,
        id: i64,
        chat: ChatId,
    ) -> Result<Option<Author>, Error> {
        sqlx::query("SELECT * FROM authors WHERE id=? AND admin_chat_id=?;")
            .bind(id)
            .bind(chat.0)
            .try_map(|row: SqliteRow| Author::from_row(&row))
            .fetch_optional(&self.pool)
            .await
    }

    /// Write back the metadata fetched from Telegram about this channel.
    pub async fn save_author_metadata(&self, author: &Author) -> Result<(), Error> {
        sqlx::query(
            "UPDATE authors SET title=?, description=?, channel_id=?, channel_url=?,
                avatar_url=?, avatar_file_id=?, subscribers_count=?, updated_at=?
            WHERE id=?;",
        )
        .bind(&author.title)
        .bind(&author.description)
        .bind(author.channel_id)
        .bind(&author.channel_url)
        .bind(&author.avatar_url)
        .bind(&author.avatar_file_id)
        .bind(author.subscribers_count)
        .bind(Utc::now())
        .bind(author.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Write back the publishing settings of this channel: mode, admin chat,
    /// rubric, invite link and delay. If the rubric changed, all posts of the
    /// author are moved to the new rubric.
    pub async fn save_author_settings(&self, author: &Author) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE authors SET auto_publish=?, admin_chat_id=?, rubric_id=?, invite_url=?,
                publish_delay_days=?, updated_at=?
            WHERE id=?;",
        )
        .bind(author.auto_publish)
        .bind(author.admin_chat_id.map(|x| x.0))
        .bind(author.rubric_id)
        .bind(&author.invite_url)
        .bind(author.publish_delay_days)
        .bind(Utc::now())
        .bind(author.id)
        .execute(&mut *tx)
        .await?;

        if let Some(rubric_id) = author.rubric_id {
            sqlx::query("UPDATE posts SET rubric_id=? WHERE author_id=? AND rubric_id IS NOT ?;")
                .bind(rubric_id)
                .bind(author.id)
                .bind(rubric_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await
    }

    /// Block or unblock a channel by username. Returns `false` if there's no
    /// such channel.
    pub async fn set_author_blocked(&self, username: &str, blocked: bool) -> Result<bool, Error> {
        let result = sqlx::query("UPDATE authors SET is_blocked=?, updated_at=? WHERE username=?;")
            .bind(blocked)
            .bind(Utc::now())
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_first_post_notified(&self, author_id: i64) -> Result<(), Error> {
        sqlx::query("UPDATE authors SET first_post_notified=1, updated_at=? WHERE id=?;")
            .bind(Utc::now())
            .bind(author_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
