use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use teloxide::types::ChatId;

use super::{BotSession, Database, Error, RedeemResult};

impl Database {
    // BOT SESSIONS

    pub async fn session(&self, telegram_user_id: i64) -> Result<Option<BotSession>, Error> {
        sqlx::query("SELECT * FROM bot_sessions WHERE telegram_user_id=?;")
            .bind(telegram_user_id)
            .try_map(|row: SqliteRow| BotSession::from_row(&row))
            .fetch_optional(&self.pool)
            .await
    }

    /// Session of this user, or a fresh one if there's none stored.
    pub async fn session_or_default(&self, telegram_user_id: i64) -> Result<BotSession, Error> {
        Ok(self
            .session(telegram_user_id)
            .await?
            .unwrap_or_else(|| BotSession::new(telegram_user_id)))
    }

    pub async fn save_session(&self, session: &BotSession) -> Result<(), Error> {
        let pending = session
            .pending_update_message
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| Error::Encode(Box::new(e)))?;
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO bot_sessions(telegram_user_id, auto_publish, mode_selected, rubric_id,
                rubric_skipped, publish_delay_days, invite_url, invite_decided, invite_waiting,
                instructions_sent, selected_author_id, pending_update_post_id,
                pending_update_message, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(telegram_user_id) DO UPDATE SET
                auto_publish=excluded.auto_publish,
                mode_selected=excluded.mode_selected,
                rubric_id=excluded.rubric_id,
                rubric_skipped=excluded.rubric_skipped,
                publish_delay_days=excluded.publish_delay_days,
                invite_url=excluded.invite_url,
                invite_decided=excluded.invite_decided,
                invite_waiting=excluded.invite_waiting,
                instructions_sent=excluded.instructions_sent,
                selected_author_id=excluded.selected_author_id,
                pending_update_post_id=excluded.pending_update_post_id,
                pending_update_message=excluded.pending_update_message,
                updated_at=excluded.updated_at;",
        )
        .bind(session.telegram_user_id)
        .bind(session.auto_publish)
        .bind(session.mode_selected)
        .bind(session.rubric_id)
        .bind(session.rubric_skipped)
        .bind(session.publish_delay_days)
        .bind(&session.invite_url)
        .bind(session.invite_decided)
        .bind(session.invite_waiting)
        .bind(session.instructions_sent)
        .bind(session.selected_author_id)
        .bind(session.pending_update_post_id)
        .bind(pending)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_session(&self, telegram_user_id: i64) -> Result<(), Error> {
        sqlx::query("DELETE FROM bot_sessions WHERE telegram_user_id=?;")
            .bind(telegram_user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // VERIFICATION CODES

    /// Register a code that a site user will send to the bot.
    pub async fn issue_verification_code(&self, site_user_id: i64, code: &str) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO verification_codes(code, site_user_id, created_at) VALUES (?, ?, ?);",
        )
        .bind(code)
        .bind(site_user_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Redeem a verification code sent from this private chat. On success,
    /// every unblocked channel managed from this chat gets linked to the site
    /// user the code was issued to, and the code is used up.
    ///
    /// If the chat manages no channels, the code is left unused so it can be
    /// sent again after connecting one.
    pub async fn redeem_verification_code(
        &self,
        code: &str,
        chat: ChatId,
    ) -> Result<RedeemResult, Error> {
        let mut tx = self.pool.begin().await?;

        let site_user_id: Option<i64> = sqlx::query_scalar(
            "SELECT site_user_id FROM verification_codes WHERE code=? AND used_at IS NULL;",
        )
        .bind(code)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(site_user_id) = site_user_id else {
            return Ok(RedeemResult::NotFound);
        };

        let channels: Vec<(i64, String)> = sqlx::query_as(
            "SELECT id, username FROM authors WHERE admin_chat_id=? AND is_blocked=0
            ORDER BY username;",
        )
        .bind(chat.0)
        .fetch_all(&mut *tx)
        .await?;

        if channels.is_empty() {
            return Ok(RedeemResult::NoChannels);
        }

        let now = Utc::now();
        for (author_id, _) in &channels {
            sqlx::query(
                "INSERT INTO author_admins(author_id, site_user_id, telegram_user_id, verified_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(author_id, site_user_id) DO UPDATE SET
                    telegram_user_id=excluded.telegram_user_id,
                    verified_at=excluded.verified_at;",
            )
            .bind(author_id)
            .bind(site_user_id)
            .bind(chat.0)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE verification_codes SET used_at=? WHERE code=?;")
            .bind(now)
            .bind(code)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(RedeemResult::Linked(
            channels.into_iter().map(|(_, username)| username).collect(),
        ))
    }

    /// Site users that proved they manage this author.
    pub async fn author_site_admins(&self, author_id: i64) -> Result<Vec<i64>, Error> {
        sqlx::query_scalar("SELECT site_user_id FROM author_admins WHERE author_id=? ORDER BY site_user_id;")
            .bind(author_id)
            .fetch_all(&self.pool)
            .await
    }
}
