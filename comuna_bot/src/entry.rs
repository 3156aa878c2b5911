use std::sync::Arc;

use teloxide::{
    dptree::deps,
    error_handlers::LoggingErrorHandler,
    prelude::*,
    types::BotCommand,
    update_listeners::webhooks,
};

use crate::{
    config::Config,
    database::Database,
    error::Result,
    handlers::{
        handle_callback_query, handle_channel_message, handle_my_chat_member,
        handle_private_message,
    },
    tags::SuffixLemmatizer,
    App,
};

fn bot_commands() -> Vec<BotCommand> {
    vec![
        BotCommand::new("start", "Подключить канал"),
        BotCommand::new("help", "Как это работает"),
    ]
}

/// Run the bot until it's stopped with Ctrl+C.
///
/// # Errors
///
/// Errors if the configuration is incomplete, the database can't be opened,
/// or the webhook can't be set up.
pub async fn entry() -> Result<()> {
    let config = Config::from_env()?;
    let bot = Bot::new(&config.bot_token);

    if let Err(e) = bot.set_my_commands(bot_commands()).await {
        log::warn!("Failed to set bot commands: {e}");
    }

    let database = Database::new(&config.database_url).await?;
    log::info!("Opened database at {}", config.database_url);

    let webhook = config.webhook.clone();

    let app = Arc::new(App {
        config,
        database,
        lemmatizer: Box::new(SuffixLemmatizer),
    });

    log::info!("Creating the handler...");

    let handler = dptree::entry()
        .branch(Update::filter_channel_post().endpoint(handle_channel_message))
        .branch(Update::filter_edited_channel_post().endpoint(handle_channel_message))
        .branch(Update::filter_my_chat_member().endpoint(handle_my_chat_member))
        .branch(
            Update::filter_message()
                .filter(|message: Message| message.chat.is_private())
                .endpoint(handle_private_message),
        )
        .branch(Update::filter_callback_query().endpoint(handle_callback_query));

    let mut dispatcher = Dispatcher::builder(bot.clone(), handler)
        .default_handler(|_| async {})
        .dependencies(deps![app])
        .enable_ctrlc_handler()
        .build();

    match webhook {
        Some(webhook) => {
            log::info!(
                "Listening for webhook updates on {} for {}",
                webhook.listen,
                webhook.url
            );
            let options =
                webhooks::Options::new(webhook.listen, webhook.url).secret_token(webhook.secret);
            let listener = webhooks::axum(bot, options).await?;
            dispatcher
                .dispatch_with_listener(
                    listener,
                    LoggingErrorHandler::with_custom_text("Webhook listener failed"),
                )
                .await;
        }
        None => {
            log::info!("Dispatching the dispatcher with long polling!");
            dispatcher.dispatch().await;
        }
    }

    log::info!("it appears we have been bonked.");
    Ok(())
}
