//! Source code for the Comuna bot, which mirrors posts of Telegram channels
//! onto the Comuna site.
//!
//! Channel owners add the bot to their channel and pick a topic and a
//! publishing mode in a private chat with it. From then on every channel
//! post becomes a post on the site, either right away or after the owner
//! approves it.

/// Error type for everything.
mod error;
pub use error::{Error, Result};

/// Configuration from the environment.
mod config;

/// Various types used throughout.
mod types;

/// The database.
mod database;

/// Turning Telegram messages into HTML and titles.
mod normalize;

/// Hashtags and automatic tagging of posts.
mod tags;

/// Downloading images and channel metadata from Telegram.
mod media;

/// Setup progress of channel owners.
mod session;

/// Storing channel posts as site posts.
mod ingest;

/// Functions that perform stuff via the bot.
mod actions;

/// Functions that handle events from Telegram.
mod handlers;

/// Maintenance commands for the site operators.
mod admin;
pub use admin::{run_admin, AdminCli};

/// Entry function that starts the bot.
mod entry;
pub use entry::*;

use std::sync::Arc;

/// Everything the handlers share.
pub struct App {
    pub(crate) config: config::Config,
    pub(crate) database: Arc<database::Database>,
    pub(crate) lemmatizer: Box<dyn tags::Lemmatizer>,
}
