use comuna_commons::useful_methods::callback_keyboard;
use teloxide::{
    payloads::SendMessageSetters,
    prelude::Requester,
    sugar::request::RequestLinkPreviewExt,
    types::{ChatId, InlineKeyboardMarkup, KeyboardButton, KeyboardMarkup, ReplyMarkup},
    ApiError, Bot, RequestError,
};

use crate::{
    database::{Author, BotSession, Post},
    error::Result,
    session::{SetupChoice, SetupStep},
    types::{
        delay_button_label, format_delay_label, CallbackAction, SettingsItem, ALLOWED_DELAYS,
    },
    App,
};

pub const BUTTON_HELP: &str = "Помощь";
pub const BUTTON_SETUP: &str = "Настройка";
pub const BUTTON_INVITE: &str = "Ссылка для подписки";

const NO_RUBRICS: &str =
    "Пока нет доступных тематик. Тематику можно будет выбрать позже в настройках.";

/// Send a message without link previews. Chats that blocked the bot or no
/// longer exist are logged and otherwise ignored.
pub async fn send_text(
    bot: &Bot,
    chat: ChatId,
    text: impl Into<String>,
    markup: Option<ReplyMarkup>,
) -> Result<()> {
    let mut request = bot.send_message(chat, text).disable_link_preview(true);
    if let Some(markup) = markup {
        request = request.reply_markup(markup);
    }

    match request.await {
        Ok(_) => Ok(()),
        Err(RequestError::Api(
            e @ (ApiError::BotBlocked
            | ApiError::BotKicked
            | ApiError::UserDeactivated
            | ApiError::ChatNotFound),
        )) => {
            log::info!("Could not message chat {chat}: {e}");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn send_keyboard(
    bot: &Bot,
    chat: ChatId,
    text: impl Into<String>,
    keyboard: InlineKeyboardMarkup,
) -> Result<()> {
    send_text(bot, chat, text, Some(ReplyMarkup::InlineKeyboard(keyboard))).await
}

fn buttons<'a>(
    items: impl IntoIterator<Item = (&'a str, CallbackAction)>,
) -> Vec<(String, String)> {
    items
        .into_iter()
        .map(|(label, action)| (label.to_string(), action.to_string()))
        .collect()
}

/// Keyboard with the main menu buttons, shown under the message box.
#[must_use]
pub fn main_menu_keyboard() -> ReplyMarkup {
    ReplyMarkup::Keyboard(
        KeyboardMarkup::new(vec![vec![
            KeyboardButton::new(BUTTON_HELP),
            KeyboardButton::new(BUTTON_SETUP),
        ]])
        .resize_keyboard(),
    )
}

pub async fn send_start(bot: &Bot, chat: ChatId) -> Result<()> {
    send_text(
        bot,
        chat,
        concat!(
            "Привет! Это бот Comuna.ru он публикует твои посты на сайте, ",
            "они собирают аудиторию из поисковых систем и ведут ее к тебе в канал. ",
            "Чтобы запустить бота добавь его администратором к себе в канал ",
            "и выбери тематику канала и настройки публикации ниже",
        ),
        Some(main_menu_keyboard()),
    )
    .await
}

pub async fn send_help(bot: &Bot, app: &App, chat: ChatId) -> Result<()> {
    send_text(
        bot,
        chat,
        format!(
            concat!(
                "Как подключить канал:\n",
                "1) Выберите рубрику и режим публикации в настройке.\n",
                "2) Добавьте бота админом в канал.\n",
                "3) Дайте права: «Читать сообщения» и «Публиковать сообщения».\n",
                "4) По желанию добавьте ссылку приглашения на канал.\n",
                "5) Для старых постов — пересылайте их сюда.\n",
                "Сайт: {}/authors",
            ),
            app.config.site_base_url
        ),
        Some(main_menu_keyboard()),
    )
    .await
}

/// Offer the connected channels of this chat to pick from. If there are
/// none, says how to connect one and returns `false`.
pub async fn send_channel_picker(bot: &Bot, app: &App, chat: ChatId, prompt: &str) -> Result<bool> {
    let authors = app.database.authors_administered_from(chat).await?;
    if authors.is_empty() {
        send_text(
            bot,
            chat,
            concat!(
                "Сначала добавьте бота администратором в канал и дайте права ",
                "«Читать сообщения» и «Публиковать сообщения».",
            ),
            None,
        )
        .await?;
        return Ok(false);
    }

    let keyboard = callback_keyboard(
        authors.iter().map(|author| {
            (
                format!("@{}", author.username),
                CallbackAction::Channel(author.id).to_string(),
            )
        }),
        2,
    );
    send_keyboard(bot, chat, prompt, keyboard).await?;
    Ok(true)
}

pub async fn send_settings_menu(bot: &Bot, app: &App, chat: ChatId, author: &Author) -> Result<()> {
    let rubric = match author.rubric_id {
        Some(id) => app.database.rubric(id).await?.map(|x| x.name),
        None => None,
    };

    let text = format!(
        "Настройки для канала @{}:\nРежим: {}\nТематика: {}\nЗадержка: {}\nСсылка: {}",
        author.username,
        match author.auto_publish {
            true => "Автопубликация",
            false => "Согласование",
        },
        rubric.as_deref().unwrap_or("не выбрана"),
        format_delay_label(author.publish_delay_days),
        match author.invite_url.is_empty() {
            true => "не задана",
            false => "установлена",
        },
    );

    let keyboard = callback_keyboard(
        buttons([
            ("Режим публикации", CallbackAction::Settings(SettingsItem::Mode)),
            ("Тематика канала", CallbackAction::Settings(SettingsItem::Rubric)),
            ("Задержка публикации", CallbackAction::Settings(SettingsItem::Delay)),
            (BUTTON_INVITE, CallbackAction::Settings(SettingsItem::Invite)),
        ]),
        1,
    );
    send_keyboard(bot, chat, text, keyboard).await
}

pub async fn send_mode_prompt(bot: &Bot, chat: ChatId, text: &str) -> Result<()> {
    let keyboard = callback_keyboard(
        buttons([
            ("Автопубликация", CallbackAction::Mode { auto_publish: true }),
            (
                "Согласование",
                CallbackAction::Mode {
                    auto_publish: false,
                },
            ),
        ]),
        1,
    );
    send_keyboard(bot, chat, text, keyboard).await
}

/// Offer the selectable rubrics. Returns `false` if there are none.
pub async fn send_rubric_prompt(bot: &Bot, app: &App, chat: ChatId, text: &str) -> Result<bool> {
    let rubrics = app.database.selectable_rubrics().await?;
    if rubrics.is_empty() {
        return Ok(false);
    }

    let keyboard = callback_keyboard(
        rubrics
            .iter()
            .map(|x| (x.name.clone(), CallbackAction::Rubric(x.id).to_string())),
        2,
    );
    send_keyboard(bot, chat, text, keyboard).await?;
    Ok(true)
}

pub async fn send_delay_prompt(bot: &Bot, chat: ChatId) -> Result<()> {
    let keyboard = callback_keyboard(
        buttons(
            ALLOWED_DELAYS
                .iter()
                .map(|&days| (delay_button_label(days), CallbackAction::Delay(days))),
        ),
        1,
    );
    send_keyboard(bot, chat, "Выберите задержку публикации:", keyboard).await
}

pub const INVITE_PROMPT: &str =
    "Пришлите ссылку приглашения на канал (например, https://t.me/+xxxx).";

/// Ask for an invite link as part of the setup, which may be skipped.
pub async fn send_invite_prompt(bot: &Bot, chat: ChatId) -> Result<()> {
    let keyboard = callback_keyboard(buttons([("Пропустить", CallbackAction::SkipInvite)]), 1);
    send_keyboard(bot, chat, INVITE_PROMPT, keyboard).await
}

pub const MODE_PROMPT: &str = concat!(
    "Будем публиковать все новые посты на сайте или ты хочешь каждый новый пост ",
    "согласовывать в этом боте (удобно, если много постов картинок, видео, ",
    "голосований, не подходящих для внешнего ресурса)",
);

/// Ask about the given setup step. Once the setup is done, sends the
/// instructions if they are due.
///
/// If there are no rubrics to offer, the rubric step is passed over and the
/// next one is asked about instead.
pub async fn send_setup_step(
    bot: &Bot,
    app: &App,
    chat: ChatId,
    session: &mut BotSession,
    mut step: SetupStep,
) -> Result<()> {
    if step == SetupStep::Rubric {
        if send_rubric_prompt(bot, app, chat, "Выберите тематику канала").await? {
            return Ok(());
        }

        log::warn!("No rubrics to offer for setup in chat {chat}");
        send_text(bot, chat, NO_RUBRICS, None).await?;
        step = match session.apply_choice(SetupChoice::SkipRubric) {
            Ok(next) => next,
            Err(rejected) => return send_text(bot, chat, rejected.user_message(), None).await,
        };
    }

    match step {
        SetupStep::Mode => send_mode_prompt(bot, chat, MODE_PROMPT).await,
        SetupStep::Rubric => Ok(()),
        SetupStep::Delay => send_delay_prompt(bot, chat).await,
        SetupStep::InviteLink => {
            session.invite_waiting = true;
            send_invite_prompt(bot, chat).await
        }
        SetupStep::Done => {
            if session.take_instructions_due() {
                send_setup_instructions(bot, chat, session).await?;
            }
            Ok(())
        }
    }
}

pub async fn send_setup_instructions(bot: &Bot, chat: ChatId, session: &BotSession) -> Result<()> {
    let publish_line = match session.auto_publish {
        true => "Новые посты будут публиковаться автоматически.",
        false => "Новые посты будут отправляться на согласование в боте.",
    };
    let delay_line = match session.publish_delay_days.unwrap_or(0) {
        0 => "Публикация без задержки.".to_string(),
        days => format!("Публикация будет с задержкой {days} дн."),
    };

    send_text(
        bot,
        chat,
        format!(
            concat!(
                "Отлично! Теперь:\n",
                "1) Добавьте бота в админы канала.\n",
                "2) Дайте права: «Читать сообщения» и «Публиковать сообщения».\n",
                "3) По желанию добавьте ссылку приглашения на канал.\n",
                "4) Для старых постов — пересылайте их сюда, и они появятся на сайте.\n",
                "{}\n{}",
            ),
            publish_line, delay_line
        ),
        None,
    )
    .await
}

pub async fn send_rubric_required(bot: &Bot, chat: ChatId) -> Result<()> {
    send_text(
        bot,
        chat,
        "Перед первой публикацией необходимо выбрать тематику канала.",
        None,
    )
    .await
}

/// Ask the channel owner whether a new post should be published.
pub async fn send_approval_request(
    bot: &Bot,
    chat: ChatId,
    author: &Author,
    post: &Post,
) -> Result<()> {
    let keyboard = callback_keyboard(
        buttons([
            ("Публикуем", CallbackAction::Approve(post.id)),
            ("Этот пропустим", CallbackAction::Reject(post.id)),
        ]),
        2,
    );
    send_keyboard(
        bot,
        chat,
        format!(
            "Новый пост из канала @{}:\n{}\n\nОпубликуем?",
            author.username, post.title
        ),
        keyboard,
    )
    .await
}

/// Ask whether an already imported post should be overwritten with its
/// forwarded copy.
pub async fn send_update_question(bot: &Bot, chat: ChatId, post_id: i64) -> Result<()> {
    let keyboard = callback_keyboard(
        buttons([
            ("Да", CallbackAction::Update(post_id)),
            ("Нет", CallbackAction::SkipUpdate(post_id)),
        ]),
        2,
    );
    send_keyboard(
        bot,
        chat,
        "Этот пост уже был опубликован, вы хотите его обновить?",
        keyboard,
    )
    .await
}

/// Tell the site admins about an author's first published post. Does
/// nothing if the author was already announced or the post isn't
/// published. Authors that turn out to have older published posts are only
/// marked as announced.
pub async fn maybe_notify_new_author(
    bot: &Bot,
    app: &App,
    author: &Author,
    post: &Post,
) -> Result<()> {
    if author.first_post_notified || post.is_pending || post.is_blocked {
        return Ok(());
    }

    if app
        .database
        .has_other_published_posts(author.id, post.id)
        .await?
    {
        app.database.mark_first_post_notified(author.id).await?;
        return Ok(());
    }

    let Some(admin_chat) = app.config.admin_notify_chat else {
        return Ok(());
    };

    let rubric = match author.rubric_id {
        Some(id) => app.database.rubric(id).await?.map(|x| x.name),
        None => None,
    };

    send_text(
        bot,
        admin_chat,
        format!(
            "Новый автор опубликовал первый пост.\nКанал: @{}\nРубрика: {}\nАвтор: {}\nПост: {}",
            author.username,
            rubric.as_deref().unwrap_or("—"),
            app.config.author_page_url(&author.username),
            app.config.post_page_url(post.id),
        ),
        None,
    )
    .await?;

    app.database.mark_first_post_notified(author.id).await?;
    log::info!("Announced first post of @{}", author.username);
    Ok(())
}
