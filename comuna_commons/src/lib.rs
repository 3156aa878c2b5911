//! Boilerplate shared by the Comuna bot binaries: logging and runtime
//! startup, plus a few extension traits over teloxide types.

pub mod useful_methods;

use std::future::Future;

use teloxide::{
    prelude::*,
    types::{ChatMemberKind, Me},
    RequestError,
};

/// Initialize logging and run `closure` to completion in a multi-threaded
/// tokio runtime.
///
/// Log filtering comes from the `RUST_LOG` environment variable, or
/// `default_filter` if it is not set. This uses [pretty_env_logger][]
/// internally. Timestamps are left out when running as a systemd service,
/// since journald adds its own.
///
/// # Errors
///
/// Errors if the tokio runtime could not be built.
///
/// [pretty_env_logger]: https://docs.rs/pretty_env_logger
pub fn start_everything<F: Future>(
    default_filter: &str,
    closure: F,
) -> std::io::Result<F::Output> {
    let log_filter = std::env::var_os("RUST_LOG")
        .and_then(|x| x.into_string().ok())
        .unwrap_or_else(|| default_filter.to_string());

    let running_as_systemd_service = std::env::var_os("JOURNAL_STREAM").is_some();

    let mut builder = match running_as_systemd_service {
        true => pretty_env_logger::formatted_builder(),
        false => pretty_env_logger::formatted_timed_builder(),
    };

    builder.parse_filters(&log_filter);

    if builder.try_init().is_err() {
        log::error!("Tried to init logger twice!");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    Ok(runtime.block_on(closure))
}

/// Find out if this bot is an administrator (or the owner) of the given chat.
///
/// Channels only deliver posts to bots that are administrators, so a `false`
/// here means that the bot has lost its rights or was never given them.
pub async fn is_bot_admin_of(bot: &Bot, me: &Me, chat: ChatId) -> Result<bool, RequestError> {
    let member = bot.get_chat_member(chat, me.id).await?;
    Ok(matches!(
        member.kind,
        ChatMemberKind::Owner(_) | ChatMemberKind::Administrator(_)
    ))
}
