use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row};
use teloxide::types::ChatId;

use crate::normalize::ChannelPost;

/// A topic a channel belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rubric {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub description: String,
    pub is_active: bool,
    /// Hidden rubrics are not offered to channel owners.
    pub is_hidden: bool,
    pub sort_order: i64,
}

impl Rubric {
    pub(super) fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Rubric {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            slug: row.try_get("slug")?,
            description: row.try_get("description")?,
            is_active: row.try_get("is_active")?,
            is_hidden: row.try_get("is_hidden")?,
            sort_order: row.try_get("sort_order")?,
        })
    }
}

/// A Telegram channel whose posts are mirrored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub id: i64,
    /// Public username of the channel, without `@`.
    pub username: String,
    pub title: String,
    pub channel_id: Option<i64>,
    pub channel_url: String,
    pub avatar_url: String,
    pub avatar_file_id: String,
    pub description: String,
    pub subscribers_count: i64,
    pub rubric_id: Option<i64>,
    /// If `false`, new posts wait for approval in the admin chat.
    pub auto_publish: bool,
    /// Private chat of the person who manages this channel through the bot.
    pub admin_chat_id: Option<ChatId>,
    pub is_blocked: bool,
    pub invite_url: String,
    pub publish_delay_days: u32,
    pub first_post_notified: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Author {
    pub(super) fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Author {
            id: row.try_get("id")?,
            username: row.try_get("username")?,
            title: row.try_get("title")?,
            channel_id: row.try_get("channel_id")?,
            channel_url: row.try_get("channel_url")?,
            avatar_url: row.try_get("avatar_url")?,
            avatar_file_id: row.try_get("avatar_file_id")?,
            description: row.try_get("description")?,
            subscribers_count: row.try_get("subscribers_count")?,
            rubric_id: row.try_get("rubric_id")?,
            auto_publish: row.try_get("auto_publish")?,
            admin_chat_id: row.try_get::<Option<i64>, _>("admin_chat_id")?.map(ChatId),
            is_blocked: row.try_get("is_blocked")?,
            invite_url: row.try_get("invite_url")?,
            publish_delay_days: row.try_get("publish_delay_days")?,
            first_post_notified: row.try_get("first_post_notified")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    /// Whether new posts of this author have to pass the approval gate.
    #[must_use]
    pub fn requires_approval(&self) -> bool {
        !self.auto_publish && self.admin_chat_id.is_some()
    }
}

/// Everything about a post that is not shown directly, kept as JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawPostData {
    /// The message this post was made from. For albums, the first message
    /// that created the post.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<ChannelPost>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_file_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_group_id: Option<String>,
    /// Image URLs of an album, in arrival order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gallery_urls: Vec<String>,
    /// Telegram file IDs of album photos, in arrival order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gallery_file_ids: Vec<String>,
    /// Formatted text of an album. Only one message of an album carries a
    /// caption, and it is not necessarily the first one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatted_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embed_html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_html: Option<String>,
}

/// A mirrored post.
#[derive(Debug, Clone, PartialEq)]
pub struct Post {
    pub id: i64,
    pub author_id: i64,
    /// Telegram message ID inside the channel.
    pub message_id: i64,
    pub title: String,
    pub rubric_id: Option<i64>,
    /// Rendered HTML.
    pub content: String,
    pub source_url: String,
    pub channel_url: String,
    /// Empty if the post is not an album.
    pub media_group_id: String,
    pub is_pending: bool,
    pub is_blocked: bool,
    pub publish_at: Option<DateTime<Utc>>,
    pub raw_data: RawPostData,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Post {
    pub(super) fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let raw: String = row.try_get("raw_data")?;
        Ok(Post {
            id: row.try_get("id")?,
            author_id: row.try_get("author_id")?,
            message_id: row.try_get("message_id")?,
            title: row.try_get("title")?,
            rubric_id: row.try_get("rubric_id")?,
            content: row.try_get("content")?,
            source_url: row.try_get("source_url")?,
            channel_url: row.try_get("channel_url")?,
            media_group_id: row.try_get("media_group_id")?,
            is_pending: row.try_get("is_pending")?,
            is_blocked: row.try_get("is_blocked")?,
            publish_at: row.try_get("publish_at")?,
            raw_data: serde_json::from_str(&raw).map_err(|e| sqlx::Error::ColumnDecode {
                index: "raw_data".to_string(),
                source: Box::new(e),
            })?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    /// Where this post is in its lifecycle at the moment `now`.
    #[must_use]
    pub fn status(&self, now: DateTime<Utc>) -> PostStatus {
        if self.is_blocked {
            PostStatus::Blocked
        } else if self.is_pending {
            PostStatus::Pending
        } else if self.publish_at.is_some_and(|at| at > now) {
            PostStatus::Scheduled
        } else {
            PostStatus::Published
        }
    }
}

/// Data needed to insert a new post.
#[derive(Debug, Clone)]
pub struct NewPost {
    pub author_id: i64,
    pub message_id: i64,
    pub title: String,
    pub rubric_id: Option<i64>,
    pub content: String,
    pub source_url: String,
    pub channel_url: String,
    pub media_group_id: String,
    pub is_pending: bool,
    pub publish_at: Option<DateTime<Utc>>,
    pub raw_data: RawPostData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PostStatus {
    /// Waiting for the channel owner to approve it.
    Pending,
    /// Rejected by the channel owner.
    Blocked,
    /// Approved, but its publish delay has not passed yet.
    Scheduled,
    Published,
}

impl Display for PostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PostStatus::Pending => "pending",
            PostStatus::Blocked => "blocked",
            PostStatus::Scheduled => "scheduled",
            PostStatus::Published => "published",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub id: i64,
    pub name: String,
    /// Lemmatized form used to match spellings of the same tag. May be empty
    /// for tags created by hand.
    pub lemma: String,
    /// Inactive tags are never attached automatically.
    pub is_active: bool,
}

impl Tag {
    pub(super) fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Tag {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            lemma: row.try_get("lemma")?,
            is_active: row.try_get("is_active")?,
        })
    }
}

/// Per-chat configuration draft of a channel owner talking to the bot.
#[derive(Debug, Clone, PartialEq)]
pub struct BotSession {
    /// ID of the user, which is also the ID of their private chat with the bot.
    pub telegram_user_id: i64,
    pub auto_publish: bool,
    pub mode_selected: bool,
    pub rubric_id: Option<i64>,
    /// Set if there were no rubrics to offer, so the step was passed over.
    pub rubric_skipped: bool,
    /// `None` until a delay is picked.
    pub publish_delay_days: Option<u32>,
    pub invite_url: String,
    /// Set once an invite link was given or explicitly skipped.
    pub invite_decided: bool,
    /// Set while the bot waits for an invite link to be sent as a message.
    pub invite_waiting: bool,
    pub instructions_sent: bool,
    /// Connected channel currently being edited, if any.
    pub selected_author_id: Option<i64>,
    pub pending_update_post_id: Option<i64>,
    /// Forwarded copy of a post waiting for "update it?" confirmation.
    pub pending_update_message: Option<ChannelPost>,
}

impl BotSession {
    #[must_use]
    pub fn new(telegram_user_id: i64) -> Self {
        BotSession {
            telegram_user_id,
            auto_publish: true,
            mode_selected: false,
            rubric_id: None,
            rubric_skipped: false,
            publish_delay_days: None,
            invite_url: String::new(),
            invite_decided: false,
            invite_waiting: false,
            instructions_sent: false,
            selected_author_id: None,
            pending_update_post_id: None,
            pending_update_message: None,
        }
    }

    pub(super) fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let pending: Option<String> = row.try_get("pending_update_message")?;
        let pending_update_message = pending
            .map(|x| serde_json::from_str(&x))
            .transpose()
            .map_err(|e| sqlx::Error::ColumnDecode {
                index: "pending_update_message".to_string(),
                source: Box::new(e),
            })?;

        Ok(BotSession {
            telegram_user_id: row.try_get("telegram_user_id")?,
            auto_publish: row.try_get("auto_publish")?,
            mode_selected: row.try_get("mode_selected")?,
            rubric_id: row.try_get("rubric_id")?,
            rubric_skipped: row.try_get("rubric_skipped")?,
            publish_delay_days: row.try_get("publish_delay_days")?,
            invite_url: row.try_get("invite_url")?,
            invite_decided: row.try_get("invite_decided")?,
            invite_waiting: row.try_get("invite_waiting")?,
            instructions_sent: row.try_get("instructions_sent")?,
            selected_author_id: row.try_get("selected_author_id")?,
            pending_update_post_id: row.try_get("pending_update_post_id")?,
            pending_update_message,
        })
    }
}

/// Result of [`Database::resolve_pending_post`].
///
/// [`Database::resolve_pending_post`]: super::Database::resolve_pending_post
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    NotFound,
    /// The post was not pending anymore. Holds it as it is now.
    AlreadyResolved(Post),
    /// The post was taken out of the gate by this call. Holds it as it is
    /// now.
    Resolved(Post),
}

/// Result of [`Database::redeem_verification_code`].
///
/// [`Database::redeem_verification_code`]: super::Database::redeem_verification_code
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedeemResult {
    /// No unused code like that exists.
    NotFound,
    /// The code exists, but this chat does not manage any channel yet.
    NoChannels,
    /// The code was used up and these channel usernames were linked.
    Linked(Vec<String>),
}
