use std::sync::Arc;

use comuna_commons::{is_bot_admin_of, useful_methods::MessageStuff};
use teloxide::{
    prelude::*,
    types::{ChatMemberUpdated, Me, Recipient},
};

use crate::{
    actions::{self, send_text, BUTTON_HELP, BUTTON_INVITE, BUTTON_SETUP},
    database::{Database, RedeemResult},
    error::Result,
    ingest::{handle_channel_post, IngestOutcome},
    media::refresh_author,
    normalize::ChannelPost,
    session::{is_invite_link, SetupChoice, SetupStep},
    App,
};

mod callbacks;
pub use callbacks::handle_callback_query;

/// New and edited posts of channels the bot is in.
pub async fn handle_channel_message(
    bot: Bot,
    me: Me,
    message: Message,
    app: Arc<App>,
) -> Result<()> {
    let post = ChannelPost::from_channel_message(&message);
    handle_channel_post(&bot, &me, &app, &post, false).await?;
    Ok(())
}

/// The bot was added to (or had its rights changed in) a chat.
pub async fn handle_my_chat_member(
    bot: Bot,
    update: ChatMemberUpdated,
    app: Arc<App>,
) -> Result<()> {
    if !update.chat.is_channel() {
        return Ok(());
    }
    let kind = &update.new_chat_member.kind;
    if !(kind.is_administrator() || kind.is_member()) {
        return Ok(());
    }

    let admin_chat = ChatId::from(update.from.id);

    let Some(username) = update.chat.username() else {
        send_text(
            &bot,
            admin_chat,
            "У канала нет публичного username. Сделайте канал публичным и повторите.",
            None,
        )
        .await?;
        return Ok(());
    };

    let title = update.chat.title().unwrap_or_default();
    let (mut author, created) = app
        .database
        .get_or_create_author(username, title, Some(update.chat.id.0))
        .await?;
    if created {
        log::info!("New channel @{username} connected by {admin_chat}");
    }

    author.channel_id = Some(update.chat.id.0);
    if !title.is_empty() {
        author.title = title.to_string();
    }

    match app.database.session(admin_chat.0).await? {
        Some(session) if session.selected_author_id.is_none() => {
            session.apply_to_author(&mut author, admin_chat);
        }
        _ => author.admin_chat_id = Some(admin_chat),
    }
    app.database.save_author_settings(&author).await?;

    let recipient = Recipient::ChannelUsername(format!("@{username}"));
    if let Err(e) = refresh_author(&bot, &app.config, &mut author, recipient).await {
        log::warn!("Failed to refresh @{username}: {e}");
    }
    app.database.save_author_metadata(&author).await?;

    send_text(
        &bot,
        admin_chat,
        format!("Канал @{} подключён. Настройки применены.", author.username),
        None,
    )
    .await
}

/// Get the command out of a message, without the bot's username, lowercase.
fn parse_command(me: &Me, text: &str) -> Option<String> {
    if !text.starts_with('/') {
        return None;
    }
    let command = text.split_whitespace().next()?;
    let username = format!("@{}", me.username());
    Some(command.trim_end_matches(username.as_str()).to_lowercase())
}

pub async fn handle_private_message(
    bot: Bot,
    me: Me,
    message: Message,
    app: Arc<App>,
) -> Result<()> {
    let chat = message.chat.id;

    if let Some(post) = ChannelPost::from_forward(&message) {
        return handle_forwarded_post(&bot, &me, &app, chat, post).await;
    }

    let text = message.text_full().unwrap_or_default().trim();

    match parse_command(&me, text).as_deref() {
        Some("/start") => {
            actions::send_start(&bot, chat).await?;
            return start_setup(&bot, &app, chat).await;
        }
        Some("/help") => return actions::send_help(&bot, &app, chat).await,
        _ => {}
    }

    if text == BUTTON_HELP {
        return actions::send_help(&bot, &app, chat).await;
    }
    if text == BUTTON_SETUP {
        return start_setup(&bot, &app, chat).await;
    }
    if text == BUTTON_INVITE {
        actions::send_channel_picker(&bot, &app, chat, "Выберите канал для ссылки приглашения")
            .await?;
        return Ok(());
    }

    if text.to_uppercase().starts_with("COMUNA-") {
        let reply = match app.database.redeem_verification_code(text, chat).await? {
            RedeemResult::NotFound => "Код не найден или уже использован.".to_string(),
            RedeemResult::NoChannels => {
                "Сначала подключите канал в боте, затем отправьте код повторно.".to_string()
            }
            RedeemResult::Linked(usernames) => {
                log::info!("Chat {chat} verified {usernames:?}");
                let usernames: Vec<String> = usernames.iter().map(|x| format!("@{x}")).collect();
                format!("Канал подтверждён: {}", usernames.join(", "))
            }
        };
        return send_text(&bot, chat, reply, None).await;
    }

    if is_invite_link(text) && handle_invite_link(&bot, &app, chat, text).await? {
        return Ok(());
    }

    send_text(
        &bot,
        chat,
        "Перешлите пост из канала, чтобы добавить его на сайт. Для помощи — /help.",
        None,
    )
    .await
}

/// Show the channel picker, and restart the setup draft. If the chat has
/// connected channels, picking one of them is all that's offered.
async fn start_setup(bot: &Bot, app: &App, chat: ChatId) -> Result<()> {
    let mut session = app.database.session_or_default(chat.0).await?;
    session.instructions_sent = false;

    if actions::send_channel_picker(bot, app, chat, "Выберите канал для настройки").await? {
        app.database.save_session(&session).await?;
        return Ok(());
    }

    session.reset_draft();
    actions::send_setup_step(bot, app, chat, &mut session, SetupStep::Mode).await?;
    app.database.save_session(&session).await?;
    Ok(())
}

/// Save an invite link the bot was waiting for. Returns `false` if it
/// wasn't waiting for one.
async fn handle_invite_link(bot: &Bot, app: &App, chat: ChatId, text: &str) -> Result<bool> {
    let Some(mut session) = app.database.session(chat.0).await? else {
        return Ok(false);
    };
    if !session.invite_waiting {
        return Ok(false);
    }

    if let Some(author_id) = session.selected_author_id {
        let Some(mut author) = app
            .database
            .author_administered_from(author_id, chat)
            .await?
        else {
            send_text(bot, chat, "Сначала выберите канал для настройки.", None).await?;
            return Ok(true);
        };

        author.invite_url = text.to_string();
        app.database.save_author_settings(&author).await?;
        session.invite_waiting = false;
        app.database.save_session(&session).await?;

        send_text(
            bot,
            chat,
            "Ссылка сохранена. Мы будем использовать её для кнопок подписки.",
            None,
        )
        .await?;
        return Ok(true);
    }

    match session.apply_choice(SetupChoice::InviteLink(text.to_string())) {
        Ok(next) => {
            send_text(
                bot,
                chat,
                "Ссылка сохранена. Мы будем использовать её для кнопок подписки.",
                None,
            )
            .await?;
            actions::send_setup_step(bot, app, chat, &mut session, next).await?;
        }
        Err(rejected) => send_text(bot, chat, rejected.user_message(), None).await?,
    }
    app.database.save_session(&session).await?;
    Ok(true)
}

/// What to do with a forwarded post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ForwardTarget {
    /// The channel has no rubric yet, so nothing can be imported.
    NoRubric,
    /// The post with this ID is already on the site. The forwarded copy is
    /// kept in the session until the owner decides whether to update it.
    AlreadyImported(i64),
    Import,
}

/// Connect the channel of a forwarded post to `chat` if the setup draft
/// allows, and find out whether the post can be imported.
///
/// A channel that isn't known yet is only created if the draft has a rubric.
/// A draft not tied to a selected channel is used up by this.
async fn prepare_forward(
    database: &Database,
    chat: ChatId,
    username: &str,
    post: &ChannelPost,
) -> Result<ForwardTarget> {
    let session = database.session(chat.0).await?;
    let mut author = database.author_by_username(username).await?;

    if author.is_none() && session.as_ref().is_some_and(|x| x.rubric_id.is_some()) {
        let channel_id = (post.chat.id != 0).then_some(post.chat.id);
        let (created, _) = database
            .get_or_create_author(username, &post.chat.title, channel_id)
            .await?;
        author = Some(created);
    }

    let Some(mut author) = author else {
        return Ok(ForwardTarget::NoRubric);
    };

    if let Some(session) = &session {
        let selected = session.selected_author_id;
        if selected.is_none() || selected == Some(author.id) {
            session.apply_to_author(&mut author, chat);
            database.save_author_settings(&author).await?;
            if selected.is_none() {
                database.delete_session(chat.0).await?;
            }
        }
    }

    if author.rubric_id.is_none() {
        return Ok(ForwardTarget::NoRubric);
    }

    if let Some(existing) = database.post_by_message(author.id, post.message_id).await? {
        let mut session = database.session_or_default(chat.0).await?;
        session.pending_update_post_id = Some(existing.id);
        session.pending_update_message = Some(post.clone());
        database.save_session(&session).await?;
        return Ok(ForwardTarget::AlreadyImported(existing.id));
    }

    Ok(ForwardTarget::Import)
}

/// A channel post forwarded to the bot by a channel owner. Imports it, or
/// asks whether to overwrite it if it's already on the site.
async fn handle_forwarded_post(
    bot: &Bot,
    me: &Me,
    app: &App,
    chat: ChatId,
    post: ChannelPost,
) -> Result<()> {
    let Some(username) = post.username().map(str::to_string) else {
        return send_text(
            bot,
            chat,
            "У канала нет публичного username. Сделайте канал публичным и повторите пересылку.",
            None,
        )
        .await;
    };

    if post.chat.id != 0 {
        let is_admin = is_bot_admin_of(bot, me, ChatId(post.chat.id))
            .await
            .unwrap_or_else(|e| {
                log::debug!("Could not check admin rights in @{username}: {e}");
                false
            });
        if !is_admin {
            return send_text(
                bot,
                chat,
                concat!(
                    "Бот не является админом этого канала. Добавьте бота в админы и ",
                    "дайте права на чтение/публикацию, затем повторите пересылку.",
                ),
                None,
            )
            .await;
        }
    }

    match prepare_forward(&app.database, chat, &username, &post).await? {
        ForwardTarget::NoRubric => return actions::send_rubric_required(bot, chat).await,
        ForwardTarget::AlreadyImported(post_id) => {
            return actions::send_update_question(bot, chat, post_id).await;
        }
        ForwardTarget::Import => {}
    }

    let reply = match handle_channel_post(bot, me, app, &post, false).await? {
        Some(
            IngestOutcome::Created { .. }
            | IngestOutcome::Updated(_)
            | IngestOutcome::MergedIntoGroup(_),
        ) => "Пост добавлен на сайт.",
        Some(IngestOutcome::NothingToPublish) => "В этом посте нечего публиковать.",
        None => return Ok(()),
    };
    send_text(bot, chat, reply, None).await
}
