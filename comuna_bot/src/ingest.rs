//! Turning channel posts into site posts.
//!
//! Posts are keyed by `(author, message ID)`, so a redelivered or edited
//! post overwrites what was stored for it. Messages of one album are merged
//! into the post made from the first of them to arrive.

use chrono::{DateTime, Duration, Utc};
use comuna_commons::is_bot_admin_of;
use teloxide::{
    prelude::*,
    types::{Me, Recipient},
};

use crate::{
    actions,
    database::{Author, Database, NewPost, Post, RawPostData},
    error::Result,
    media::{self, img_src_urls},
    normalize::{build_content, build_title, ChannelPost},
    tags::{apply_post_tags, extract_hashtags, Lemmatizer},
    App,
};

/// What happened to a channel post.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Added to the post of the album it belongs to.
    MergedIntoGroup(Post),
    Created { post: Post, pending: bool },
    /// An already stored post was overwritten.
    Updated(Post),
    /// Neither text nor anything else that can be shown.
    NothingToPublish,
}

/// Everything extracted from a channel post that ends up in a site post.
#[derive(Debug, Clone, Default)]
pub struct NormalizedPost {
    pub raw_text: String,
    pub hashtags: Vec<String>,
    pub formatted_text: String,
    pub photo_file_id: Option<String>,
    /// Stored copy of the photo, if it could be downloaded.
    pub image_url: Option<String>,
    pub embed: Option<(String, &'static str)>,
    pub poll: Option<(String, String)>,
}

impl NormalizedPost {
    /// Extract everything but the image, which has to be downloaded first.
    #[must_use]
    pub fn from_post(post: &ChannelPost) -> Self {
        let raw_text = post.plain_text().to_string();
        NormalizedPost {
            hashtags: extract_hashtags(&raw_text),
            formatted_text: post.formatted_text(),
            photo_file_id: post.largest_photo().map(|x| x.file_id.clone()),
            image_url: None,
            embed: post.embed(),
            poll: post.poll_block(),
            raw_text,
        }
    }

    fn embed_html(&self) -> &str {
        self.embed.as_ref().map_or("", |x| x.0.as_str())
    }

    fn poll_html(&self) -> &str {
        self.poll.as_ref().map_or("", |x| x.0.as_str())
    }

    fn has_publishable_content(&self) -> bool {
        !self.formatted_text.trim().is_empty()
            || self.image_url.is_some()
            || self.embed.is_some()
            || self.poll.is_some()
    }

    fn title(&self) -> String {
        let mut title = build_title(&self.raw_text);
        if title.is_empty() {
            if let Some((_, label)) = &self.poll {
                title = label.clone();
            }
        }
        if title.is_empty() && self.image_url.is_some() {
            title = "Фото".to_string();
        }
        if title.is_empty() {
            if let Some((_, label)) = &self.embed {
                title = label.to_string();
            }
        }
        title
    }
}

/// Handle a post of a channel, live or forwarded to the bot.
///
/// Posts of channels without a public username, of blocked channels, and of
/// channels the bot isn't an administrator of are ignored. `force_publish`
/// skips the approval gate.
pub async fn handle_channel_post(
    bot: &Bot,
    me: &Me,
    app: &App,
    post: &ChannelPost,
    force_publish: bool,
) -> Result<Option<IngestOutcome>> {
    let Some(username) = post.username() else {
        return Ok(None);
    };
    if post.is_service || post.message_id == 0 {
        return Ok(None);
    }

    let channel_id = (post.chat.id != 0).then_some(post.chat.id);
    let (mut author, _) = app
        .database
        .get_or_create_author(username, &post.chat.title, channel_id)
        .await?;

    if author.is_blocked {
        log::debug!("Ignoring post of blocked channel @{username}");
        return Ok(None);
    }

    if let Some(channel_id) = channel_id {
        let chat = ChatId(channel_id);
        if !is_bot_admin_of(bot, me, chat).await? {
            log::info!("Not an admin of @{username}, ignoring its post");
            return Ok(None);
        }

        match media::refresh_author(bot, &app.config, &mut author, Recipient::Id(chat)).await {
            Ok(true) => app.database.save_author_metadata(&author).await?,
            Ok(false) => {}
            Err(e) => log::warn!("Failed to refresh @{username}: {e}"),
        }
    }

    if author.rubric_id.is_none() {
        if let Some(admin_chat) = author.admin_chat_id {
            actions::send_rubric_required(bot, admin_chat).await?;
        }
        return Ok(None);
    }

    let mut normalized = NormalizedPost::from_post(post);
    if let Some(file_id) = &normalized.photo_file_id {
        if album_has_photo(&app.database, &author, &post.media_group_id, file_id).await? {
            log::debug!("Photo of @{username}/{} is already stored", post.message_id);
        } else {
            normalized.image_url = media::store_photo(bot, &app.config, file_id).await;
        }
    }

    let outcome = store_post(
        &app.database,
        app.lemmatizer.as_ref(),
        &author,
        post,
        &normalized,
        force_publish,
        Utc::now(),
    )
    .await?;

    match &outcome {
        IngestOutcome::Created {
            post,
            pending: true,
        } => {
            log::info!("New post {} of @{username} awaits approval", post.id);
            if let Some(admin_chat) = author.admin_chat_id {
                actions::send_approval_request(bot, admin_chat, &author, post).await?;
            }
        }
        IngestOutcome::Created {
            post,
            pending: false,
        } => {
            log::info!("New post {} of @{username}", post.id);
            actions::maybe_notify_new_author(bot, app, &author, post).await?;
        }
        IngestOutcome::MergedIntoGroup(post) => {
            log::debug!("Merged message {} into post {}", post.message_id, post.id);
        }
        IngestOutcome::Updated(post) => log::debug!("Updated post {}", post.id),
        IngestOutcome::NothingToPublish => {
            log::debug!("Nothing to publish in @{username}/{}", post.message_id);
        }
    }

    Ok(Some(outcome))
}

/// Write a normalized channel post into the database.
pub async fn store_post(
    database: &Database,
    lemmatizer: &dyn Lemmatizer,
    author: &Author,
    message: &ChannelPost,
    normalized: &NormalizedPost,
    force_publish: bool,
    now: DateTime<Utc>,
) -> Result<IngestOutcome> {
    let _guard = database.lock_ingestion().await;

    let channel_url = format!("https://t.me/{}", author.username);

    if !message.media_group_id.is_empty() {
        if let Some(post) =
            merge_into_group(database, author, message, normalized, &channel_url).await?
        {
            let mut explicit = normalized.hashtags.clone();
            if explicit.is_empty() {
                explicit = database
                    .post_tags(post.id)
                    .await?
                    .into_iter()
                    .map(|x| x.name)
                    .collect();
            }
            apply_post_tags(database, lemmatizer, &post, &explicit).await?;
            return Ok(IngestOutcome::MergedIntoGroup(post));
        }
    }

    if !normalized.has_publishable_content() {
        return Ok(IngestOutcome::NothingToPublish);
    }

    let gallery_urls: Vec<String> = normalized.image_url.iter().cloned().collect();
    let content = build_content(
        &normalized.formatted_text,
        &gallery_urls,
        normalized.embed_html(),
        normalized.poll_html(),
    );
    let title = normalized.title();
    let source_url = format!("{channel_url}/{}", message.message_id);

    let grouped = !message.media_group_id.is_empty();
    let raw_data = RawPostData {
        message: Some(message.clone()),
        photo_file_id: normalized.photo_file_id.clone(),
        media_group_id: grouped.then(|| message.media_group_id.clone()),
        formatted_text: (grouped && !gallery_urls.is_empty())
            .then(|| normalized.formatted_text.clone()),
        gallery_file_ids: match (grouped, &normalized.photo_file_id) {
            (true, Some(id)) => vec![id.clone()],
            _ => Vec::new(),
        },
        gallery_urls: match grouped {
            true => gallery_urls,
            false => Vec::new(),
        },
        embed_html: normalized.embed.as_ref().map(|x| x.0.clone()),
        poll_html: normalized.poll.as_ref().map(|x| x.0.clone()),
    };

    let outcome = match database
        .post_by_message(author.id, message.message_id)
        .await?
    {
        Some(mut post) => {
            post.title = title;
            post.content = content;
            post.source_url = source_url;
            post.channel_url = channel_url;
            post.raw_data = raw_data;
            if post.media_group_id.is_empty() {
                post.media_group_id = message.media_group_id.clone();
            }
            database.update_post_content(&post).await?;
            IngestOutcome::Updated(post)
        }
        None => {
            let pending = author.requires_approval() && !force_publish;
            let publish_at = match author.publish_delay_days {
                0 => None,
                days => Some(now + Duration::days(i64::from(days))),
            };

            let id = database
                .insert_post(&NewPost {
                    author_id: author.id,
                    message_id: message.message_id,
                    title,
                    rubric_id: author.rubric_id,
                    content,
                    source_url,
                    channel_url,
                    media_group_id: message.media_group_id.clone(),
                    is_pending: pending,
                    publish_at,
                    raw_data,
                })
                .await?;

            let Some(post) = database.post(id).await? else {
                return Err(sqlx::Error::RowNotFound.into());
            };
            IngestOutcome::Created { post, pending }
        }
    };

    let post = match &outcome {
        IngestOutcome::Created { post, .. } | IngestOutcome::Updated(post) => post,
        IngestOutcome::MergedIntoGroup(_) | IngestOutcome::NothingToPublish => {
            return Ok(outcome);
        }
    };
    apply_post_tags(database, lemmatizer, post, &normalized.hashtags).await?;

    Ok(outcome)
}

/// Whether the album post of this group already has the photo with this file
/// ID, in which case there's no need to download it again.
async fn album_has_photo(
    database: &Database,
    author: &Author,
    media_group_id: &str,
    file_id: &str,
) -> Result<bool> {
    if media_group_id.is_empty() {
        return Ok(false);
    }
    Ok(database
        .post_by_media_group(author.id, media_group_id)
        .await?
        .is_some_and(|x| x.raw_data.gallery_file_ids.iter().any(|x| x == file_id)))
}

/// Find the post of this album and add the message to it. A post made from
/// the same message before it was known to be part of an album is adopted.
///
/// Returns `None` if there's no such post yet.
async fn merge_into_group(
    database: &Database,
    author: &Author,
    message: &ChannelPost,
    normalized: &NormalizedPost,
    channel_url: &str,
) -> Result<Option<Post>> {
    let group_id = &message.media_group_id;

    let mut post = match database.post_by_media_group(author.id, group_id).await? {
        Some(x) => x,
        None => match database
            .post_by_message(author.id, message.message_id)
            .await?
        {
            Some(x) if x.media_group_id.is_empty() => x,
            _ => return Ok(None),
        },
    };

    let adopted = post.media_group_id.is_empty();
    post.media_group_id = group_id.clone();

    let raw = &mut post.raw_data;
    if adopted && raw.gallery_file_ids.is_empty() {
        // The image of a post made before it joined the album leads the
        // gallery.
        if let (Some(file_id), Some(url)) = (
            raw.photo_file_id.clone(),
            img_src_urls(&post.content).into_iter().next(),
        ) {
            raw.gallery_file_ids.push(file_id);
            raw.gallery_urls.push(url);
        }
    }

    // Both lists stay in step. Photos are told apart by file ID, since every
    // download of the same photo is stored under a new name.
    match (&normalized.photo_file_id, &normalized.image_url) {
        (Some(file_id), _) if raw.gallery_file_ids.contains(file_id) => {}
        (Some(file_id), Some(url)) => {
            raw.gallery_file_ids.push(file_id.clone());
            raw.gallery_urls.push(url.clone());
        }
        _ => {}
    }
    raw.media_group_id = Some(group_id.clone());

    let keep_first = |slot: &mut Option<String>, value: &str| {
        if slot.as_deref().map_or(true, str::is_empty) && !value.is_empty() {
            *slot = Some(value.to_string());
        }
    };
    keep_first(&mut raw.formatted_text, &normalized.formatted_text);
    keep_first(&mut raw.embed_html, normalized.embed_html());
    keep_first(&mut raw.poll_html, normalized.poll_html());

    post.content = build_content(
        raw.formatted_text.as_deref().unwrap_or_default(),
        &raw.gallery_urls,
        raw.embed_html.as_deref().unwrap_or_default(),
        raw.poll_html.as_deref().unwrap_or_default(),
    );
    post.channel_url = channel_url.to_string();
    post.source_url = format!("{channel_url}/{}", post.message_id);

    database.update_post_content(&post).await?;
    Ok(Some(post))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use teloxide::types::ChatId;

    use crate::{
        database::{tests::memory_db, PostStatus},
        normalize::{ChannelRef, PhotoRef},
        tags::SuffixLemmatizer,
    };

    use super::*;

    async fn author_with_rubric(database: &Database) -> Author {
        let rubric = database.create_rubric("Tech", "tech", "", 0).await.unwrap();
        let (mut author, _) = database
            .get_or_create_author("chan", "Channel", Some(-100))
            .await
            .unwrap();
        author.rubric_id = Some(rubric.id);
        database.save_author_settings(&author).await.unwrap();
        author
    }

    fn message(message_id: i64, text: &str, media_group_id: &str) -> ChannelPost {
        ChannelPost {
            chat: ChannelRef {
                id: -100,
                username: Some("chan".to_string()),
                title: "Channel".to_string(),
            },
            message_id,
            text: text.to_string(),
            media_group_id: media_group_id.to_string(),
            ..Default::default()
        }
    }

    fn with_photo(mut message: ChannelPost, file_id: &str) -> ChannelPost {
        message.photo = vec![PhotoRef {
            file_id: file_id.to_string(),
            width: 10,
            height: 10,
            file_size: 100,
        }];
        message
    }

    fn normalized(message: &ChannelPost, image_url: Option<&str>) -> NormalizedPost {
        let mut normalized = NormalizedPost::from_post(message);
        normalized.image_url = image_url.map(str::to_string);
        normalized
    }

    async fn store(
        database: &Database,
        author: &Author,
        message: &ChannelPost,
        image_url: Option<&str>,
    ) -> IngestOutcome {
        store_post(
            database,
            &SuffixLemmatizer,
            author,
            message,
            &normalized(message, image_url),
            false,
            Utc::now(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn posts_are_created_then_updated() {
        let database = memory_db().await;
        let author = author_with_rubric(&database).await;

        let first = message(7, "Hello world. More #news", "");
        let IngestOutcome::Created { post, pending } = store(&database, &author, &first, None).await
        else {
            panic!("post was not created");
        };
        assert!(!pending);
        assert_eq!(post.title, "Hello world");
        assert_eq!(post.source_url, "https://t.me/chan/7");
        assert_eq!(post.raw_data.message.as_ref(), Some(&first));
        let tags = database.post_tags(post.id).await.unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].name, "news");

        let edited = message(7, "Goodbye world", "");
        let IngestOutcome::Updated(updated) = store(&database, &author, &edited, None).await else {
            panic!("post was not updated");
        };
        assert_eq!(updated.id, post.id);

        let stored = database.post(post.id).await.unwrap().unwrap();
        assert_eq!(stored.title, "Goodbye world");
        assert_eq!(database.posts_by_author(author.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_posts_are_skipped() {
        let database = memory_db().await;
        let author = author_with_rubric(&database).await;

        let outcome = store(&database, &author, &message(1, "   ", ""), None).await;
        assert_eq!(outcome, IngestOutcome::NothingToPublish);
        assert!(database.posts_by_author(author.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn photo_only_posts_are_titled() {
        let database = memory_db().await;
        let author = author_with_rubric(&database).await;

        let photo = with_photo(message(3, "", ""), "file-a");
        let IngestOutcome::Created { post, .. } =
            store(&database, &author, &photo, Some("/media/a.jpg")).await
        else {
            panic!("post was not created");
        };
        assert_eq!(post.title, "Фото");
        assert_eq!(post.content, r#"<img src="/media/a.jpg" alt="" />"#);
        assert_eq!(post.raw_data.photo_file_id.as_deref(), Some("file-a"));
        assert!(post.raw_data.gallery_urls.is_empty());
    }

    #[tokio::test]
    async fn albums_collapse_into_one_post() {
        let database = memory_db().await;
        let author = author_with_rubric(&database).await;

        let first = with_photo(message(10, "", "album"), "file-a");
        let second = with_photo(message(11, "Album caption", "album"), "file-b");

        let IngestOutcome::Created { post, .. } =
            store(&database, &author, &first, Some("/media/a.jpg")).await
        else {
            panic!("album post was not created");
        };
        assert_eq!(post.title, "Фото");

        let outcome = store(&database, &author, &second, Some("/media/b.jpg")).await;
        assert!(matches!(outcome, IngestOutcome::MergedIntoGroup(_)));

        // Redelivery changes nothing, even though the photo was stored again
        // under another name.
        store(&database, &author, &second, Some("/media/b2.jpg")).await;
        assert!(album_has_photo(&database, &author, "album", "file-b").await.unwrap());
        assert!(!album_has_photo(&database, &author, "album", "file-c").await.unwrap());
        assert!(!album_has_photo(&database, &author, "", "file-b").await.unwrap());

        let posts = database.posts_by_author(author.id).await.unwrap();
        assert_eq!(posts.len(), 1);
        let post = &posts[0];
        assert_eq!(post.message_id, 10);
        assert_eq!(post.raw_data.gallery_urls, ["/media/a.jpg", "/media/b.jpg"]);
        assert_eq!(post.raw_data.gallery_file_ids, ["file-a", "file-b"]);
        assert_eq!(
            post.raw_data.formatted_text.as_deref(),
            Some("Album caption")
        );
        assert!(post.content.starts_with(r#"<div class="post-gallery">"#));
        assert!(post.content.ends_with("Album caption"));
    }

    #[tokio::test]
    async fn merges_keep_tags_without_new_hashtags() {
        let database = memory_db().await;
        let author = author_with_rubric(&database).await;

        let first = with_photo(message(20, "#cats here", "g"), "file-a");
        let IngestOutcome::Created { post, .. } =
            store(&database, &author, &first, Some("/media/a.jpg")).await
        else {
            panic!("album post was not created");
        };

        let second = with_photo(message(21, "", "g"), "file-b");
        store(&database, &author, &second, Some("/media/b.jpg")).await;

        let tags = database.post_tags(post.id).await.unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].name, "cats");
    }

    #[tokio::test]
    async fn ungrouped_post_is_adopted_by_its_album() {
        let database = memory_db().await;
        let author = author_with_rubric(&database).await;

        store(&database, &author, &message(30, "Text first", ""), None).await;

        let grouped = with_photo(message(30, "Text first", "late"), "file-a");
        let outcome = store(&database, &author, &grouped, Some("/media/a.jpg")).await;
        let IngestOutcome::MergedIntoGroup(post) = outcome else {
            panic!("post was not adopted");
        };
        assert_eq!(post.media_group_id, "late");

        let stored = database
            .post_by_media_group(author.id, "late")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.id, post.id);
    }

    #[tokio::test]
    async fn redelivered_photo_without_download_is_not_added() {
        let database = memory_db().await;
        let author = author_with_rubric(&database).await;

        let first = with_photo(message(50, "", "pair"), "file-a");
        let second = with_photo(message(51, "", "pair"), "file-b");
        store(&database, &author, &first, Some("/media/a.jpg")).await;
        store(&database, &author, &second, Some("/media/b.jpg")).await;
        store(&database, &author, &first, None).await;

        let post = database
            .post_by_media_group(author.id, "pair")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(post.raw_data.gallery_urls, ["/media/a.jpg", "/media/b.jpg"]);
        assert_eq!(post.raw_data.gallery_file_ids, ["file-a", "file-b"]);
    }

    #[tokio::test]
    async fn adopted_photo_leads_the_gallery() {
        let database = memory_db().await;
        let author = author_with_rubric(&database).await;

        let alone = with_photo(message(60, "Caption", ""), "file-a");
        store(&database, &author, &alone, Some("/media/a.jpg")).await;

        let grouped = with_photo(message(60, "Caption", "late"), "file-a");
        store(&database, &author, &grouped, Some("/media/a2.jpg")).await;
        let sibling = with_photo(message(61, "", "late"), "file-b");
        store(&database, &author, &sibling, Some("/media/b.jpg")).await;

        let post = database
            .post_by_media_group(author.id, "late")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(post.message_id, 60);
        assert_eq!(post.raw_data.gallery_urls, ["/media/a.jpg", "/media/b.jpg"]);
        assert_eq!(post.raw_data.gallery_file_ids, ["file-a", "file-b"]);
    }

    #[tokio::test]
    async fn approval_gate_and_delay() {
        let database = memory_db().await;
        let mut author = author_with_rubric(&database).await;
        author.auto_publish = false;
        author.admin_chat_id = Some(ChatId(42));
        author.publish_delay_days = 3;
        database.save_author_settings(&author).await.unwrap();

        let now = Utc::now();
        let gated = message(40, "Needs approval", "");
        let outcome = store_post(
            &database,
            &SuffixLemmatizer,
            &author,
            &gated,
            &normalized(&gated, None),
            false,
            now,
        )
        .await
        .unwrap();
        let IngestOutcome::Created { post, pending } = outcome else {
            panic!("post was not created");
        };
        assert!(pending);
        assert_eq!(post.status(now), PostStatus::Pending);
        let delay = post.publish_at.unwrap() - now;
        assert_eq!(delay.num_hours(), 72);

        let forced = message(41, "Forced", "");
        let outcome = store_post(
            &database,
            &SuffixLemmatizer,
            &author,
            &forced,
            &normalized(&forced, None),
            true,
            now,
        )
        .await
        .unwrap();
        assert!(matches!(
            outcome,
            IngestOutcome::Created { pending: false, .. }
        ));
    }
}
