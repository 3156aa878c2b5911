use std::{net::SocketAddr, path::PathBuf};

use teloxide::types::ChatId;
use url::Url;

use crate::error::{Error, Result};

const DEFAULT_DATABASE_URL: &str = "sqlite:comuna.sqlite";
const DEFAULT_SITE_BASE_URL: &str = "http://localhost:5173";
const DEFAULT_MEDIA_ROOT: &str = "media";
const DEFAULT_MEDIA_URL: &str = "/media/";
const DEFAULT_WEBHOOK_LISTEN: &str = "0.0.0.0:8443";

/// Webhook transport settings. Present only if both a public URL and a
/// secret were configured.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: Url,
    pub secret: String,
    pub listen: SocketAddr,
}

/// Runtime configuration of the bot and the admin tool.
#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub database_url: String,
    pub site_base_url: String,
    pub media_root: PathBuf,
    pub media_url: String,
    /// Chat that gets notified when a new author publishes their first post.
    pub admin_notify_chat: Option<ChatId>,
    pub webhook: Option<WebhookConfig>,
}

impl Config {
    /// Load the configuration from the process environment. A `.env` file in
    /// the working directory is read first, if there is one.
    ///
    /// The bot token is taken from `TELEGRAM_BOT_TOKEN`, or from the `key`
    /// file (`key_debug` in debug builds) if the variable is not set.
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                log::warn!("Failed to read .env file: {e}");
            }
        }

        Self::from_lookup(|name| std::env::var(name).ok(), read_key_file)
    }

    /// Build the configuration out of a variable lookup function. Empty
    /// values count as unset.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
        key_file: impl FnOnce() -> Option<String>,
    ) -> Result<Self> {
        let var = |name: &str| {
            lookup(name)
                .map(|x| x.trim().to_string())
                .filter(|x| !x.is_empty())
        };

        let bot_token = var("TELEGRAM_BOT_TOKEN")
            .or_else(|| key_file().map(|x| x.trim().to_string()))
            .filter(|x| !x.is_empty())
            .ok_or_else(|| {
                Error::Config(
                    "no bot token: set TELEGRAM_BOT_TOKEN or provide a key file".to_string(),
                )
            })?;

        let admin_notify_chat = match var("TELEGRAM_ADMIN_CHAT_ID") {
            Some(id) => Some(ChatId(id.parse().map_err(|_| {
                Error::Config(format!("TELEGRAM_ADMIN_CHAT_ID is not a chat ID: {id}"))
            })?)),
            None => None,
        };

        let webhook = match (var("TELEGRAM_WEBHOOK_URL"), var("TELEGRAM_WEBHOOK_SECRET")) {
            (Some(url), Some(secret)) => {
                let url = Url::parse(&url).map_err(|e| {
                    Error::Config(format!("TELEGRAM_WEBHOOK_URL is not a URL: {e}"))
                })?;
                let listen = var("TELEGRAM_WEBHOOK_LISTEN")
                    .unwrap_or_else(|| DEFAULT_WEBHOOK_LISTEN.to_string());
                let listen = listen.parse().map_err(|_| {
                    Error::Config(format!("TELEGRAM_WEBHOOK_LISTEN is not an address: {listen}"))
                })?;
                Some(WebhookConfig {
                    url,
                    secret,
                    listen,
                })
            }
            (Some(_), None) => {
                return Err(Error::Config(
                    "TELEGRAM_WEBHOOK_URL is set but TELEGRAM_WEBHOOK_SECRET is not".to_string(),
                ))
            }
            _ => None,
        };

        let mut media_url = var("MEDIA_URL").unwrap_or_else(|| DEFAULT_MEDIA_URL.to_string());
        if !media_url.ends_with('/') {
            media_url.push('/');
        }

        Ok(Config {
            bot_token,
            database_url: var("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            site_base_url: var("SITE_BASE_URL")
                .unwrap_or_else(|| DEFAULT_SITE_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            media_root: var("MEDIA_ROOT")
                .unwrap_or_else(|| DEFAULT_MEDIA_ROOT.to_string())
                .into(),
            media_url,
            admin_notify_chat,
            webhook,
        })
    }

    /// Public URL of a file stored under the media root.
    #[must_use]
    pub fn public_media_url(&self, relative_path: &str) -> String {
        format!(
            "{}{}{}",
            self.site_base_url,
            self.media_url,
            relative_path.trim_start_matches('/')
        )
    }

    /// Whether this URL points at our own media storage.
    #[must_use]
    pub fn is_local_media_url(&self, url: &str) -> bool {
        !url.is_empty()
            && (url.starts_with(&self.media_url)
                || url.starts_with(&format!("{}{}", self.site_base_url, self.media_url)))
    }

    #[must_use]
    pub fn author_page_url(&self, username: &str) -> String {
        format!("{}/{}", self.site_base_url, username)
    }

    #[must_use]
    pub fn post_page_url(&self, post_id: i64) -> String {
        format!("{}/b/post/{}", self.site_base_url, post_id)
    }
}

fn read_key_file() -> Option<String> {
    std::fs::read_to_string(match cfg!(debug_assertions) {
        true => "key_debug",
        false => "key",
    })
    .ok()
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        bot_token: "123:abc".to_string(),
        database_url: "sqlite::memory:".to_string(),
        site_base_url: "https://comuna.example".to_string(),
        media_root: std::env::temp_dir().join("comuna_test_media"),
        media_url: "/media/".to_string(),
        admin_notify_chat: None,
        webhook: None,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::collections::HashMap;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned(), || None)
    }

    #[test]
    fn defaults_are_applied() {
        let config = config_from(&[("TELEGRAM_BOT_TOKEN", "123:abc")]).unwrap();
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.site_base_url, DEFAULT_SITE_BASE_URL);
        assert_eq!(config.media_url, "/media/");
        assert!(config.webhook.is_none());
        assert!(config.admin_notify_chat.is_none());
    }

    #[test]
    fn token_falls_back_to_key_file() {
        let config = Config::from_lookup(|_| None, || Some("456:def\n".to_string())).unwrap();
        assert_eq!(config.bot_token, "456:def");
    }

    #[test]
    fn missing_token_is_an_error() {
        assert!(matches!(config_from(&[]), Err(Error::Config(_))));
    }

    #[test]
    fn webhook_needs_a_secret() {
        let result = config_from(&[
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("TELEGRAM_WEBHOOK_URL", "https://comuna.example/telegram"),
        ]);
        assert!(matches!(result, Err(Error::Config(_))));

        let config = config_from(&[
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("TELEGRAM_WEBHOOK_URL", "https://comuna.example/telegram"),
            ("TELEGRAM_WEBHOOK_SECRET", "s3cret"),
        ])
        .unwrap();
        let webhook = config.webhook.unwrap();
        assert_eq!(webhook.secret, "s3cret");
        assert_eq!(webhook.listen.port(), 8443);
    }

    #[test]
    fn media_urls_are_normalized() {
        let config = config_from(&[
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("SITE_BASE_URL", "https://comuna.example/"),
            ("MEDIA_URL", "/files"),
        ])
        .unwrap();
        assert_eq!(
            config.public_media_url("/posts/telegram/a.jpg"),
            "https://comuna.example/files/posts/telegram/a.jpg"
        );
        assert!(config.is_local_media_url("https://comuna.example/files/x.jpg"));
        assert!(config.is_local_media_url("/files/x.jpg"));
        assert!(!config.is_local_media_url("https://api.telegram.org/file/botX/y.jpg"));
        assert!(!config.is_local_media_url(""));
    }

    #[test]
    fn admin_chat_must_be_numeric() {
        let result = config_from(&[
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("TELEGRAM_ADMIN_CHAT_ID", "not a number"),
        ]);
        assert!(matches!(result, Err(Error::Config(_))));

        let config = config_from(&[
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("TELEGRAM_ADMIN_CHAT_ID", "-100123"),
        ])
        .unwrap();
        assert_eq!(config.admin_notify_chat, Some(ChatId(-100123)));
    }
}
