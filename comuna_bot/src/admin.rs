use std::collections::HashSet;

use chrono::Utc;
use clap::{Parser, Subcommand};
use teloxide::Bot;

use crate::{
    config::Config,
    database::{Database, Post},
    error::{Error, Result},
    media::{self, img_src_urls, replace_img_urls},
    normalize::{build_content, slugify_title},
    tags::{normalize_tag_value, Lemmatizer, SuffixLemmatizer},
};

/// Maintenance of the Comuna bot database.
#[derive(Debug, Parser)]
#[command(name = "comuna_admin", version, long_about = None)]
pub struct AdminCli {
    #[command(subcommand)]
    command: AdminCommand,
}

#[derive(Debug, Subcommand)]
enum AdminCommand {
    /// Manage channel topics
    Rubric {
        #[command(subcommand)]
        action: RubricAction,
    },
    /// Manage post tags
    Tag {
        #[command(subcommand)]
        action: TagAction,
    },
    /// Manage connected channels
    Author {
        #[command(subcommand)]
        action: AuthorAction,
    },
    /// Manage site verification codes
    Code {
        #[command(subcommand)]
        action: CodeAction,
    },
    /// List posts of a channel with their status
    Posts {
        /// Channel username, without @
        username: String,
    },
    /// Copy images still hosted by Telegram into the media storage
    Rehydrate {
        /// Only look at this many of the newest posts
        #[arg(long)]
        limit: Option<u32>,
        /// Only report what would be downloaded
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Debug, Subcommand)]
enum RubricAction {
    Add {
        name: String,
        /// Made from the name if not given
        #[arg(long)]
        slug: Option<String>,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value_t = 0)]
        sort_order: i64,
    },
    List,
    /// Stop offering a rubric to channel owners
    Hide { slug: String },
    Show { slug: String },
}

#[derive(Debug, Subcommand)]
enum TagAction {
    Add { name: String },
    List,
    /// Allow a tag to be attached automatically again
    Enable { name: String },
    /// Never attach a tag automatically
    Disable { name: String },
}

#[derive(Debug, Subcommand)]
enum AuthorAction {
    List,
    Block { username: String },
    Unblock { username: String },
}

#[derive(Debug, Subcommand)]
enum CodeAction {
    /// Issue a code a site user sends to the bot to prove they own a channel
    Issue { site_user_id: i64 },
}

/// A fresh verification code, like `COMUNA-3F2A9C1B`.
fn new_verification_code() -> String {
    let token = uuid::Uuid::new_v4().simple().to_string().to_uppercase();
    format!("COMUNA-{}", &token[..8])
}

/// Run an admin command.
///
/// # Errors
///
/// Errors if the configuration or database is unusable, or the command
/// refers to something that doesn't exist.
pub async fn run_admin(cli: AdminCli) -> Result<()> {
    let config = Config::from_env()?;
    let database = Database::new(&config.database_url).await?;

    match cli.command {
        AdminCommand::Rubric { action } => rubric_command(&database, action).await,
        AdminCommand::Tag { action } => tag_command(&database, action).await,
        AdminCommand::Author { action } => author_command(&database, action).await,
        AdminCommand::Code {
            action: CodeAction::Issue { site_user_id },
        } => {
            let code = new_verification_code();
            database.issue_verification_code(site_user_id, &code).await?;
            println!("{code}");
            Ok(())
        }
        AdminCommand::Posts { username } => posts_command(&database, &username).await,
        AdminCommand::Rehydrate { limit, dry_run } => {
            let bot = Bot::new(&config.bot_token);
            rehydrate_command(&bot, &config, &database, limit, dry_run).await
        }
    }
}

async fn rubric_command(database: &Database, action: RubricAction) -> Result<()> {
    match action {
        RubricAction::Add {
            name,
            slug,
            description,
            sort_order,
        } => {
            let slug = slug.unwrap_or_else(|| slugify_title(&name));
            if slug.is_empty() {
                return Err(Error::Invalid(format!(
                    "can't make a slug out of {name:?}, pass --slug"
                )));
            }
            let rubric = database
                .create_rubric(&name, &slug, &description, sort_order)
                .await?;
            println!("Created rubric {} ({})", rubric.id, rubric.slug);
        }
        RubricAction::List => {
            for rubric in database.all_rubrics().await? {
                let mut flags = Vec::new();
                if !rubric.is_active {
                    flags.push("inactive");
                }
                if rubric.is_hidden {
                    flags.push("hidden");
                }
                println!(
                    "{}\t{}\t{}\t{}",
                    rubric.id,
                    rubric.slug,
                    rubric.name,
                    flags.join(",")
                );
            }
        }
        RubricAction::Hide { slug } => set_rubric_hidden(database, &slug, true).await?,
        RubricAction::Show { slug } => set_rubric_hidden(database, &slug, false).await?,
    }
    Ok(())
}

async fn set_rubric_hidden(database: &Database, slug: &str, hidden: bool) -> Result<()> {
    if !database.set_rubric_hidden(slug, hidden).await? {
        return Err(Error::Invalid(format!("no rubric with slug {slug:?}")));
    }
    Ok(())
}

async fn tag_command(database: &Database, action: TagAction) -> Result<()> {
    match action {
        TagAction::Add { name } => {
            let name = normalize_tag_value(&name);
            if name.is_empty() {
                return Err(Error::Invalid("tag name is empty".to_string()));
            }
            let lemma = SuffixLemmatizer.lemmatize(&name);
            let tag = database.create_tag(&name, &lemma).await?;
            println!("Created tag {} ({}, lemma {:?})", tag.id, tag.name, tag.lemma);
        }
        TagAction::List => {
            for tag in database.all_tags().await? {
                let state = if tag.is_active { "" } else { "disabled" };
                println!("{}\t{}\t{}\t{}", tag.id, tag.name, tag.lemma, state);
            }
        }
        TagAction::Enable { name } => set_tag_active(database, &name, true).await?,
        TagAction::Disable { name } => set_tag_active(database, &name, false).await?,
    }
    Ok(())
}

async fn set_tag_active(database: &Database, name: &str, active: bool) -> Result<()> {
    if database.set_tag_active(name.trim(), active).await? == 0 {
        return Err(Error::Invalid(format!("no tag named {name:?}")));
    }
    Ok(())
}

async fn author_command(database: &Database, action: AuthorAction) -> Result<()> {
    let (username, blocked) = match action {
        AuthorAction::List => {
            for author in database.all_authors().await? {
                println!(
                    "{}\t@{}\t{}\t{}\t{}\tsubscribers: {}{}",
                    author.id,
                    author.username,
                    author.title,
                    if author.auto_publish { "auto" } else { "approval" },
                    author
                        .rubric_id
                        .map_or_else(|| "no rubric".to_string(), |x| format!("rubric {x}")),
                    author.subscribers_count,
                    if author.is_blocked { "\tblocked" } else { "" },
                );
            }
            return Ok(());
        }
        AuthorAction::Block { username } => (username, true),
        AuthorAction::Unblock { username } => (username, false),
    };

    let username = username.trim_start_matches('@');
    if !database.set_author_blocked(username, blocked).await? {
        return Err(Error::Invalid(format!("no channel @{username}")));
    }
    Ok(())
}

async fn posts_command(database: &Database, username: &str) -> Result<()> {
    let username = username.trim_start_matches('@');
    let Some(author) = database.author_by_username(username).await? else {
        return Err(Error::Invalid(format!("no channel @{username}")));
    };

    let now = Utc::now();
    for post in database.posts_by_author(author.id).await? {
        let publish_at = post
            .publish_at
            .map(|x| x.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!(
            "{}\t{}\t{}\t{}\t{}",
            post.id,
            post.message_id,
            post.status(now),
            publish_at,
            post.title
        );
    }
    Ok(())
}

/// Images of a post that aren't in our media storage yet, along with the
/// Telegram file ID each one can be downloaded by, if known.
///
/// Album posts list their images in the raw data. Other posts have them in
/// their content, or only have a file ID if the image never got downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ImageSources {
    /// Empty strings stand for images that are known only by file ID.
    urls: Vec<String>,
    file_ids: Vec<Option<String>>,
    /// Whether the images are missing from the content and have to be added.
    needs_insert: bool,
}

impl ImageSources {
    fn of(post: &Post) -> Self {
        let raw = &post.raw_data;
        let content_urls = img_src_urls(&post.content);
        let single_file_id = raw.photo_file_id.clone().or_else(|| {
            raw.message
                .as_ref()
                .and_then(|x| x.largest_photo())
                .map(|x| x.file_id.clone())
        });

        let (urls, needs_insert) = if !raw.gallery_urls.is_empty() {
            (raw.gallery_urls.clone(), false)
        } else if !content_urls.is_empty() {
            (content_urls, false)
        } else if !raw.gallery_file_ids.is_empty() {
            (vec![String::new(); raw.gallery_file_ids.len()], true)
        } else if single_file_id.is_some() {
            (vec![String::new()], true)
        } else {
            (Vec::new(), false)
        };

        let file_ids = (0..urls.len())
            .map(|index| match raw.gallery_file_ids.get(index) {
                Some(id) => Some(id.clone()),
                None if urls.len() == 1 => single_file_id.clone(),
                None => None,
            })
            .collect();

        ImageSources {
            urls,
            file_ids,
            needs_insert,
        }
    }

    fn needs_download(&self, config: &Config) -> bool {
        self.urls.iter().any(|x| !config.is_local_media_url(x))
    }
}

/// Download images of a post that are still hosted by Telegram, and point
/// the post at the copies. Returns `true` if the post changed.
async fn rehydrate_post(
    bot: &Bot,
    config: &Config,
    database: &Database,
    post: &Post,
) -> Result<bool> {
    let sources = ImageSources::of(post);

    let mut changed = false;
    let mut local_urls = Vec::with_capacity(sources.urls.len());
    for (url, file_id) in sources.urls.iter().zip(&sources.file_ids) {
        if config.is_local_media_url(url) {
            local_urls.push(url.clone());
            continue;
        }

        let mut local = match url.is_empty() {
            true => None,
            false => media::rehydrate_url(bot, config, url).await,
        };
        if local.is_none() {
            if let Some(file_id) = file_id {
                local = media::store_photo(bot, config, file_id).await;
            }
        }

        match local {
            Some(local) => {
                changed = true;
                local_urls.push(local);
            }
            None => local_urls.push(url.clone()),
        }
    }

    if !changed {
        return Ok(false);
    }

    let content = match sources.needs_insert {
        true => {
            let urls: Vec<String> = local_urls.iter().filter(|x| !x.is_empty()).cloned().collect();
            build_content(&post.content, &urls, "", "")
        }
        false if img_src_urls(&post.content).is_empty() => post.content.clone(),
        false => replace_img_urls(&post.content, &local_urls),
    };

    let mut raw = post.raw_data.clone();
    if !raw.gallery_urls.is_empty() || !raw.gallery_file_ids.is_empty() {
        raw.gallery_urls = local_urls.into_iter().filter(|x| !x.is_empty()).collect();
    }

    database.update_post_media(post.id, &content, &raw).await?;
    Ok(true)
}

async fn rehydrate_command(
    bot: &Bot,
    config: &Config,
    database: &Database,
    limit: Option<u32>,
    dry_run: bool,
) -> Result<()> {
    let posts = database.posts_with_images(limit).await?;

    let mut seen = HashSet::new();
    let mut updated = 0;
    for post in &posts {
        if !seen.insert(post.id) {
            continue;
        }

        if dry_run {
            let sources = ImageSources::of(post);
            if sources.needs_download(config) {
                println!("Would update post {} ({} images)", post.id, sources.urls.len());
                updated += 1;
            }
            continue;
        }

        match rehydrate_post(bot, config, database, post).await {
            Ok(true) => {
                log::info!("Rehydrated images of post {}", post.id);
                updated += 1;
            }
            Ok(false) => {}
            Err(e) => log::warn!("Failed to rehydrate post {}: {e}", post.id),
        }
    }

    println!("Scanned: {}, updated: {updated}", seen.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use crate::{
        config::test_config,
        database::RawPostData,
        normalize::{ChannelPost, PhotoRef},
    };

    use super::*;

    fn post(content: &str, raw_data: RawPostData) -> Post {
        Post {
            id: 1,
            author_id: 1,
            message_id: 1,
            title: String::new(),
            rubric_id: None,
            content: content.to_string(),
            source_url: String::new(),
            channel_url: String::new(),
            media_group_id: String::new(),
            is_pending: false,
            is_blocked: false,
            publish_at: None,
            raw_data,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn codes_look_right() {
        let code = new_verification_code();
        assert!(code.starts_with("COMUNA-"));
        assert_eq!(code.len(), "COMUNA-".len() + 8);
        assert_eq!(code, code.to_uppercase());
        assert_ne!(code, new_verification_code());
    }

    #[test]
    fn cli_parses() {
        let cli = AdminCli::try_parse_from(["comuna_admin", "rehydrate", "--limit", "5", "--dry-run"])
            .unwrap();
        assert!(matches!(
            cli.command,
            AdminCommand::Rehydrate {
                limit: Some(5),
                dry_run: true
            }
        ));

        let cli = AdminCli::try_parse_from(["comuna_admin", "rubric", "add", "Наука"]).unwrap();
        assert!(matches!(
            cli.command,
            AdminCommand::Rubric {
                action: RubricAction::Add { sort_order: 0, .. }
            }
        ));

        assert!(AdminCli::try_parse_from(["comuna_admin", "code", "issue", "x"]).is_err());
    }

    #[test]
    fn album_sources_come_from_raw_data() {
        let sources = ImageSources::of(&post(
            "",
            RawPostData {
                gallery_urls: vec![
                    "https://api.telegram.org/file/botX/a.jpg".to_string(),
                    "/media/b.jpg".to_string(),
                ],
                gallery_file_ids: vec!["fa".to_string(), "fb".to_string()],
                ..Default::default()
            },
        ));
        assert_eq!(sources.file_ids, [Some("fa".to_string()), Some("fb".to_string())]);
        assert!(!sources.needs_insert);
        assert!(sources.needs_download(&test_config()));
    }

    #[test]
    fn single_photo_known_only_by_file_id() {
        let message = ChannelPost {
            photo: vec![
                PhotoRef {
                    file_id: "small".to_string(),
                    width: 90,
                    height: 90,
                    file_size: 10,
                },
                PhotoRef {
                    file_id: "big".to_string(),
                    width: 900,
                    height: 900,
                    file_size: 1000,
                },
            ],
            ..Default::default()
        };
        let sources = ImageSources::of(&post(
            "text",
            RawPostData {
                message: Some(message),
                ..Default::default()
            },
        ));
        assert_eq!(sources.urls, [""]);
        assert_eq!(sources.file_ids, [Some("big".to_string())]);
        assert!(sources.needs_insert);
    }

    #[test]
    fn local_images_need_nothing() {
        let sources = ImageSources::of(&post(
            r#"<img src="https://comuna.example/media/a.jpg" alt="" />"#,
            RawPostData::default(),
        ));
        assert!(!sources.needs_download(&test_config()));

        let sources = ImageSources::of(&post("just text", RawPostData::default()));
        assert!(sources.urls.is_empty());
        assert!(!sources.needs_download(&test_config()));
    }
}
