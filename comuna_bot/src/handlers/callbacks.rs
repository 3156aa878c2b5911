use std::sync::Arc;

use teloxide::{
    payloads::AnswerCallbackQuerySetters,
    prelude::*,
    types::{CallbackQuery, Me},
    ApiError, RequestError,
};

use crate::{
    actions::{self, send_text, INVITE_PROMPT},
    database::{Author, BotSession, Database, Post, Resolution},
    error::Result,
    ingest::handle_channel_post,
    session::SetupChoice,
    types::{CallbackAction, SettingsItem},
    App,
};

pub async fn handle_callback_query(
    bot: Bot,
    me: Me,
    query: CallbackQuery,
    app: Arc<App>,
) -> Result<()> {
    macro_rules! goodbye {
        ($text:expr) => {
            bot.answer_callback_query(query.id.clone()).text($text).await?;
            return Ok(());
        };
        () => {
            bot.answer_callback_query(query.id.clone()).await?;
            return Ok(());
        };
    }

    let Some(data) = &query.data else {
        goodbye!();
    };

    let action: CallbackAction = match data.parse() {
        Ok(x) => x,
        Err(e) => {
            log::debug!("Bad callback data {data:?}: {e}");
            goodbye!(e.user_message());
        }
    };

    // Buttons are only ever sent in private chats, whose ID is the user's.
    let chat = ChatId::from(query.from.id);
    let mut session = app.database.session_or_default(chat.0).await?;

    // Channel being edited, if it still belongs to this chat.
    let selected = match session.selected_author_id {
        Some(id) => app.database.author_administered_from(id, chat).await?,
        None => None,
    };

    match action {
        CallbackAction::Mode { auto_publish } => {
            if let Some(mut author) = selected {
                author.auto_publish = auto_publish;
                app.database.save_author_settings(&author).await?;
                bot.answer_callback_query(query.id.clone())
                    .text("Настройка сохранена")
                    .await?;
                let text = format!("Режим обновлён для @{}.", author.username);
                return send_text(&bot, chat, text, None).await;
            }
            let toast = advance_setup(
                &bot,
                &app,
                chat,
                &mut session,
                SetupChoice::Mode { auto_publish },
            )
            .await?;
            goodbye!(toast);
        }
        CallbackAction::Rubric(id) => {
            let Some(rubric) = app.database.active_rubric(id).await? else {
                goodbye!("Рубрика не найдена");
            };
            if let Some(mut author) = selected {
                author.rubric_id = Some(rubric.id);
                app.database.save_author_settings(&author).await?;
                bot.answer_callback_query(query.id.clone())
                    .text("Рубрика сохранена")
                    .await?;
                let text = format!("Тематика обновлена для @{}.", author.username);
                return send_text(&bot, chat, text, None).await;
            }
            let toast =
                advance_setup(&bot, &app, chat, &mut session, SetupChoice::Rubric(rubric.id))
                    .await?;
            goodbye!(toast);
        }
        CallbackAction::Delay(days) => {
            if let Some(mut author) = selected {
                author.publish_delay_days = days;
                app.database.save_author_settings(&author).await?;
                bot.answer_callback_query(query.id.clone())
                    .text("Задержка сохранена")
                    .await?;
                let text = format!("Задержка публикации обновлена для @{}.", author.username);
                return send_text(&bot, chat, text, None).await;
            }
            let toast =
                advance_setup(&bot, &app, chat, &mut session, SetupChoice::Delay(days)).await?;
            goodbye!(toast);
        }
        CallbackAction::SkipInvite => {
            if selected.is_some() {
                session.invite_waiting = false;
                app.database.save_session(&session).await?;
                goodbye!("Отменено");
            }
            let toast =
                advance_setup(&bot, &app, chat, &mut session, SetupChoice::SkipInvite).await?;
            goodbye!(toast);
        }
        CallbackAction::Channel(id) => {
            let Some(author) = app
                .database
                .author_administered_from(id, chat)
                .await?
                .filter(|x| !x.is_blocked)
            else {
                goodbye!("Канал не найден");
            };
            session.selected_author_id = Some(author.id);
            session.invite_waiting = false;
            app.database.save_session(&session).await?;
            bot.answer_callback_query(query.id.clone())
                .text("Канал выбран")
                .await?;
            actions::send_settings_menu(&bot, &app, chat, &author).await
        }
        CallbackAction::Settings(item) => {
            let Some(author) = selected else {
                bot.answer_callback_query(query.id.clone())
                    .text("Сначала выберите канал")
                    .await?;
                actions::send_channel_picker(&bot, &app, chat, "Выберите канал для настройки")
                    .await?;
                return Ok(());
            };
            open_settings_item(&bot, &app, &query, chat, &mut session, &author, item).await
        }
        CallbackAction::Approve(id) | CallbackAction::Reject(id) => {
            let approve = matches!(action, CallbackAction::Approve(_));
            let decision = resolve_post(&bot, &app, chat, id, approve).await?;
            if decision.is_final() {
                remove_keyboard(&bot, &query).await;
            }
            goodbye!(decision.toast());
        }
        CallbackAction::Update(id) => {
            let message = match session.pending_update_message.take() {
                Some(message) if session.pending_update_post_id == Some(id) => message,
                _ => {
                    goodbye!("Обновление не найдено");
                }
            };
            session.pending_update_post_id = None;
            app.database.save_session(&session).await?;

            handle_channel_post(&bot, &me, &app, &message, true).await?;

            bot.answer_callback_query(query.id.clone())
                .text("Пост обновлён")
                .await?;
            remove_keyboard(&bot, &query).await;
            send_text(&bot, chat, "Пост обновлён на сайте.", None).await
        }
        CallbackAction::SkipUpdate(id) => {
            if session.pending_update_post_id == Some(id) {
                session.pending_update_post_id = None;
                session.pending_update_message = None;
                app.database.save_session(&session).await?;
            }
            remove_keyboard(&bot, &query).await;
            goodbye!("Отменено");
        }
    }
}

/// Apply a setup choice to the draft and ask about the next step. Returns
/// the toast to show.
async fn advance_setup(
    bot: &Bot,
    app: &App,
    chat: ChatId,
    session: &mut BotSession,
    choice: SetupChoice,
) -> Result<&'static str> {
    // A selected channel that's gone or was handed over to another chat.
    session.selected_author_id = None;

    let saved = choice.saved_message();
    match session.apply_choice(choice) {
        Ok(next) => {
            actions::send_setup_step(bot, app, chat, session, next).await?;
            app.database.save_session(session).await?;
            Ok(saved)
        }
        Err(rejected) => Ok(rejected.user_message()),
    }
}

async fn open_settings_item(
    bot: &Bot,
    app: &App,
    query: &CallbackQuery,
    chat: ChatId,
    session: &mut BotSession,
    author: &Author,
    item: SettingsItem,
) -> Result<()> {
    let toast = match item {
        SettingsItem::Mode => {
            actions::send_mode_prompt(bot, chat, "Выберите режим публикации:").await?;
            "Выберите режим"
        }
        SettingsItem::Rubric => {
            match actions::send_rubric_prompt(bot, app, chat, "Выберите тематику канала").await? {
                true => "Выберите тематику",
                false => "Нет доступных рубрик",
            }
        }
        SettingsItem::Delay => {
            actions::send_delay_prompt(bot, chat).await?;
            "Выберите задержку"
        }
        SettingsItem::Invite => {
            log::debug!("Waiting for an invite link of @{}", author.username);
            session.invite_waiting = true;
            app.database.save_session(session).await?;
            send_text(bot, chat, INVITE_PROMPT, None).await?;
            "Ожидаю ссылку"
        }
    };

    bot.answer_callback_query(query.id.clone())
        .text(toast)
        .await?;
    Ok(())
}

/// What pressing approve or reject on a post did.
#[derive(Debug, Clone, PartialEq)]
enum Decision {
    /// No such post, or it belongs to a channel managed from another chat.
    NotFound,
    AlreadyPublished,
    AlreadyRejected,
    Rejected,
    Approved { author: Author, post: Post },
}

impl Decision {
    fn toast(&self) -> &'static str {
        match self {
            Decision::NotFound => "Пост не найден",
            Decision::AlreadyPublished => "Пост уже опубликован",
            Decision::AlreadyRejected => "Пост уже отклонён",
            Decision::Rejected => "Пропущено",
            Decision::Approved { .. } => "Опубликовано",
        }
    }

    /// Whether the buttons have served their purpose.
    fn is_final(&self) -> bool {
        matches!(self, Decision::Rejected | Decision::Approved { .. })
    }
}

/// Take a post of a channel managed from `chat` out of the approval gate.
async fn decide_post(
    database: &Database,
    chat: ChatId,
    post_id: i64,
    approve: bool,
) -> Result<Decision> {
    let Some(post) = database.post(post_id).await? else {
        return Ok(Decision::NotFound);
    };
    let Some(author) = database
        .author(post.author_id)
        .await?
        .filter(|x| x.admin_chat_id == Some(chat))
    else {
        return Ok(Decision::NotFound);
    };

    Ok(match database.resolve_pending_post(post.id, approve).await? {
        Resolution::NotFound => Decision::NotFound,
        Resolution::AlreadyResolved(post) if post.is_blocked => Decision::AlreadyRejected,
        Resolution::AlreadyResolved(_) => Decision::AlreadyPublished,
        Resolution::Resolved(_) if !approve => {
            log::info!("Post {post_id} of @{} rejected", author.username);
            Decision::Rejected
        }
        Resolution::Resolved(post) => {
            log::info!("Post {post_id} of @{} approved", author.username);
            Decision::Approved { author, post }
        }
    })
}

/// Approve or reject a post waiting in the approval gate, announcing the
/// channel if this was its first published post.
async fn resolve_post(
    bot: &Bot,
    app: &App,
    chat: ChatId,
    post_id: i64,
    approve: bool,
) -> Result<Decision> {
    let decision = decide_post(&app.database, chat, post_id, approve).await?;
    if let Decision::Approved { author, post } = &decision {
        actions::maybe_notify_new_author(bot, app, author, post).await?;
    }
    Ok(decision)
}

/// Take the buttons off the message a callback came from. Failing to do so
/// is only logged.
async fn remove_keyboard(bot: &Bot, query: &CallbackQuery) {
    let Some(message) = &query.message else {
        return;
    };

    match bot
        .edit_message_reply_markup(message.chat().id, message.id())
        .await
    {
        Ok(_) | Err(RequestError::Api(ApiError::MessageNotModified)) => {}
        Err(e) => log::debug!("Failed to remove keyboard: {e}"),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use crate::database::{tests::memory_db, NewPost, PostStatus, RawPostData};

    use super::*;

    async fn pending_post(database: &Database, admin_chat: ChatId) -> i64 {
        let (mut author, _) = database
            .get_or_create_author("chan", "Channel", None)
            .await
            .unwrap();
        author.auto_publish = false;
        author.admin_chat_id = Some(admin_chat);
        database.save_author_settings(&author).await.unwrap();

        database
            .insert_post(&NewPost {
                author_id: author.id,
                message_id: 1,
                title: "Title".to_string(),
                rubric_id: None,
                content: "text".to_string(),
                source_url: String::new(),
                channel_url: String::new(),
                media_group_id: String::new(),
                is_pending: true,
                publish_at: None,
                raw_data: RawPostData::default(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn approving_twice_reports_the_state() {
        let database = memory_db().await;
        let id = pending_post(&database, ChatId(42)).await;

        let decision = decide_post(&database, ChatId(42), id, true).await.unwrap();
        let Decision::Approved { author, post } = &decision else {
            panic!("post was not approved");
        };
        assert_eq!(author.username, "chan");
        assert_eq!(post.status(chrono::Utc::now()), PostStatus::Published);
        assert!(decision.is_final());
        assert_eq!(decision.toast(), "Опубликовано");

        let again = decide_post(&database, ChatId(42), id, false).await.unwrap();
        assert_eq!(again, Decision::AlreadyPublished);
        assert!(!again.is_final());
    }

    #[tokio::test]
    async fn rejecting_blocks_the_post() {
        let database = memory_db().await;
        let id = pending_post(&database, ChatId(42)).await;

        let decision = decide_post(&database, ChatId(42), id, false).await.unwrap();
        assert_eq!(decision, Decision::Rejected);
        assert_eq!(decision.toast(), "Пропущено");

        let again = decide_post(&database, ChatId(42), id, true).await.unwrap();
        assert_eq!(again, Decision::AlreadyRejected);
        assert_eq!(again.toast(), "Пост уже отклонён");
        let post = database.post(id).await.unwrap().unwrap();
        assert!(post.is_blocked);
    }

    #[tokio::test]
    async fn only_the_admin_chat_decides() {
        let database = memory_db().await;
        let id = pending_post(&database, ChatId(42)).await;

        let decision = decide_post(&database, ChatId(7), id, true).await.unwrap();
        assert_eq!(decision, Decision::NotFound);
        assert!(database.post(id).await.unwrap().unwrap().is_pending);

        let missing = decide_post(&database, ChatId(42), 9999, true).await.unwrap();
        assert_eq!(missing, Decision::NotFound);
    }
}
