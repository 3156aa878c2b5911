//! Copying images off Telegram into our own media storage.
//!
//! Telegram file URLs contain the bot token and expire, so nothing the site
//! shows may point at them. Photos are downloaded when a post comes in and
//! stored under the media root with a random name.

use std::{path::Path, sync::OnceLock, time::Duration};

use comuna_commons::useful_methods::BotStuff;
use regex::Regex;
use teloxide::{prelude::*, types::FileId, types::Recipient};

use crate::{config::Config, database::Author, error::Result};

/// Directory for photos of posts, relative to the media root.
pub const POST_MEDIA_DIR: &str = "posts/telegram";
/// Directory for channel avatars, relative to the media root.
pub const AVATAR_MEDIA_DIR: &str = "authors/avatars";

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Extension to store a file under, lowercased and with the dot. Telegram
/// file paths without a sensible extension are assumed to be JPEGs.
#[must_use]
pub fn media_extension(source_path: &str) -> String {
    let ext = Path::new(source_path)
        .extension()
        .and_then(|x| x.to_str())
        .map(|x| format!(".{}", x.to_lowercase()))
        .unwrap_or_default();

    if ext.len() <= 1 || ext.len() > 8 {
        ".jpg".to_string()
    } else {
        ext
    }
}

/// A fresh random path in `dir` for a file that came from `source_path`.
#[must_use]
pub fn new_media_path(dir: &str, source_path: &str) -> String {
    let name = uuid::Uuid::new_v4().simple().to_string();
    format!("{dir}/{}{}", &name[..24], media_extension(source_path))
}

/// The file path part of a Telegram file download URL.
#[must_use]
pub fn telegram_file_path(url: &str) -> Option<&str> {
    static FILE_URL: OnceLock<Regex> = OnceLock::new();
    let file_url = FILE_URL
        .get_or_init(|| Regex::new(r"^https?://api\.telegram\.org/file/bot[^/]+/(.+)").unwrap());
    file_url.captures(url)?.get(1).map(|x| x.as_str())
}

/// Write a file under the media root, returning its public URL.
pub async fn save_media(config: &Config, relative_path: &str, bytes: &[u8]) -> Result<String> {
    let path = config.media_root.join(relative_path);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, bytes).await?;
    Ok(config.public_media_url(relative_path))
}

/// Download a Telegram file by its ID. Returns the Telegram file path and
/// the contents.
async fn download_file_id(bot: &Bot, file_id: &str) -> Result<(String, Vec<u8>)> {
    let file = bot.get_file(FileId(file_id.to_string())).await?;
    let mut bytes = Vec::with_capacity(file.meta.size as usize);
    bot.download_file_to_vec(&file.path, &mut bytes).await?;
    Ok((file.path, bytes))
}

/// Download a photo and store it, returning its public URL. Failures are
/// logged and give `None`, since a post is still worth having without its
/// image.
pub async fn store_photo(bot: &Bot, config: &Config, file_id: &str) -> Option<String> {
    let result = async {
        let (path, bytes) = download_file_id(bot, file_id).await?;
        save_media(config, &new_media_path(POST_MEDIA_DIR, &path), &bytes).await
    }
    .await;

    match result {
        Ok(url) => Some(url),
        Err(e) => {
            log::warn!("Failed to store photo {file_id}: {e}");
            None
        }
    }
}

/// Store a copy of an image that's still referenced by a Telegram file URL,
/// returning the new public URL.
///
/// The file is fetched through the bot by its file path first, and by the
/// URL itself if that fails.
pub async fn rehydrate_url(bot: &Bot, config: &Config, url: &str) -> Option<String> {
    let file_path = telegram_file_path(url)?;

    let mut bytes = Vec::new();
    if let Err(e) = bot.download_file_to_vec(file_path, &mut bytes).await {
        log::debug!("Downloading {file_path} through the bot failed, trying the URL: {e}");
        bytes = match fetch_url(url).await {
            Ok(x) => x,
            Err(e) => {
                log::warn!("Failed to download {file_path}: {e}");
                return None;
            }
        };
    }

    match save_media(config, &new_media_path(POST_MEDIA_DIR, file_path), &bytes).await {
        Ok(url) => Some(url),
        Err(e) => {
            log::warn!("Failed to store {file_path}: {e}");
            None
        }
    }
}

async fn fetch_url(url: &str) -> Result<Vec<u8>> {
    let client = reqwest::Client::builder().timeout(DOWNLOAD_TIMEOUT).build()?;
    let response = client.get(url).send().await?.error_for_status()?;
    Ok(response.bytes().await?.to_vec())
}

/// Update what we know about a channel from Telegram: title, description,
/// link, avatar and subscriber count. Returns `false` if the chat turned out
/// not to be a channel, in which case nothing is changed.
///
/// The avatar is only downloaded again if it changed.
pub async fn refresh_author(
    bot: &Bot,
    config: &Config,
    author: &mut Author,
    chat: Recipient,
) -> Result<bool> {
    let chat = bot.get_chat(chat).await?;
    if !chat.is_channel() {
        return Ok(false);
    }

    author.channel_id = Some(chat.id.0);
    if let Some(title) = chat.title().filter(|x| !x.is_empty()) {
        author.title = title.to_string();
    }
    if let Some(description) = chat.description().filter(|x| !x.is_empty()) {
        author.description = description.to_string();
    }
    if let Some(username) = chat.username() {
        author.channel_url = format!("https://t.me/{username}");
    }

    if let Some(photo) = &chat.photo {
        let file_id = photo.big_file_id.to_string();
        if file_id != author.avatar_file_id {
            let result = async {
                let (path, bytes) = download_file_id(bot, &file_id).await?;
                save_media(config, &new_media_path(AVATAR_MEDIA_DIR, &path), &bytes).await
            }
            .await;
            match result {
                Ok(url) => {
                    author.avatar_url = url;
                    author.avatar_file_id = file_id;
                }
                Err(e) => log::warn!("Failed to update avatar of @{}: {e}", author.username),
            }
        }
    }

    match bot.get_chat_member_count(chat.id).await {
        Ok(count) => author.subscribers_count = i64::from(count),
        Err(e) => log::warn!("Failed to get subscriber count of @{}: {e}", author.username),
    }

    Ok(true)
}

/// Sources of all images in some post HTML, in order.
#[must_use]
pub fn img_src_urls(content: &str) -> Vec<String> {
    img_src()
        .captures_iter(content)
        .filter_map(|x| x.get(1))
        .map(|x| x.as_str().to_string())
        .collect()
}

/// Replace sources of images in some post HTML, in order. Images past the
/// end of `urls` are left alone.
#[must_use]
pub fn replace_img_urls(content: &str, urls: &[String]) -> String {
    let mut urls = urls.iter();
    img_src()
        .replace_all(content, |caps: &regex::Captures| {
            let whole = &caps[0];
            match (urls.next(), caps.get(0), caps.get(1)) {
                (Some(url), Some(m0), Some(m1)) => {
                    let start = m1.start() - m0.start();
                    let end = m1.end() - m0.start();
                    format!("{}{url}{}", &whole[..start], &whole[end..])
                }
                _ => whole.to_string(),
            }
        })
        .into_owned()
}

fn img_src() -> &'static Regex {
    static IMG_SRC: OnceLock<Regex> = OnceLock::new();
    IMG_SRC.get_or_init(|| Regex::new(r#"<img[^>]*\ssrc="([^"]*)""#).unwrap())
}
