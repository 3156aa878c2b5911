use std::{fmt::Display, str::FromStr};

use thiserror::Error;

/// Publish delays a channel owner can pick, in days.
pub const ALLOWED_DELAYS: [u32; 4] = [0, 1, 3, 7];

/// Maximum amount of tags attached to a single post.
pub const MAX_TAGS_PER_POST: usize = 5;

/// One of the settings of an already connected channel, as offered by the
/// settings menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingsItem {
    Mode,
    Rubric,
    Delay,
    Invite,
}

impl SettingsItem {
    fn as_str(self) -> &'static str {
        match self {
            SettingsItem::Mode => "mode",
            SettingsItem::Rubric => "rubric",
            SettingsItem::Delay => "delay",
            SettingsItem::Invite => "invite",
        }
    }
}

/// Data carried by an inline keyboard button of this bot.
///
/// Telegram limits callback data to 64 bytes, so everything is referred to
/// by database ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackAction {
    /// Pick auto-publishing (`true`) or manual approval (`false`).
    Mode { auto_publish: bool },
    Rubric(i64),
    Delay(u32),
    /// Finish setup without an invite link.
    SkipInvite,
    /// Select a connected channel (author ID) for editing.
    Channel(i64),
    Settings(SettingsItem),
    Approve(i64),
    Reject(i64),
    /// Overwrite an already imported post (post ID) with a forwarded copy.
    Update(i64),
    SkipUpdate(i64),
}

/// Why callback data could not be understood.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CallbackParseError {
    #[error("unknown callback action")]
    Unknown,
    #[error("invalid rubric")]
    Rubric,
    #[error("invalid delay")]
    Delay,
    #[error("invalid channel")]
    Channel,
    #[error("invalid post")]
    Post,
}

impl CallbackParseError {
    /// Text of the toast shown to the user who pressed the button.
    #[must_use]
    pub fn user_message(self) -> &'static str {
        match self {
            CallbackParseError::Unknown => "Неизвестное действие",
            CallbackParseError::Rubric => "Некорректная рубрика",
            CallbackParseError::Delay => "Некорректная задержка",
            CallbackParseError::Channel => "Некорректный канал",
            CallbackParseError::Post => "Некорректный пост",
        }
    }
}

impl FromStr for CallbackAction {
    type Err = CallbackParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (action, arg) = s.split_once(':').ok_or(CallbackParseError::Unknown)?;

        let id = |err: CallbackParseError| arg.parse::<i64>().map_err(|_| err);

        Ok(match action {
            "mode" => match arg {
                "auto" => CallbackAction::Mode { auto_publish: true },
                "approval" => CallbackAction::Mode {
                    auto_publish: false,
                },
                _ => return Err(CallbackParseError::Unknown),
            },
            "rubric" => CallbackAction::Rubric(id(CallbackParseError::Rubric)?),
            "delay" => {
                let days = arg.parse().map_err(|_| CallbackParseError::Delay)?;
                if !ALLOWED_DELAYS.contains(&days) {
                    return Err(CallbackParseError::Delay);
                }
                CallbackAction::Delay(days)
            }
            "invite" if arg == "skip" => CallbackAction::SkipInvite,
            "channel" => CallbackAction::Channel(id(CallbackParseError::Channel)?),
            "settings" => CallbackAction::Settings(match arg {
                "mode" => SettingsItem::Mode,
                "rubric" => SettingsItem::Rubric,
                "delay" => SettingsItem::Delay,
                "invite" => SettingsItem::Invite,
                _ => return Err(CallbackParseError::Unknown),
            }),
            "approve" => CallbackAction::Approve(id(CallbackParseError::Post)?),
            "reject" => CallbackAction::Reject(id(CallbackParseError::Post)?),
            "update" => CallbackAction::Update(id(CallbackParseError::Post)?),
            "skip_update" => CallbackAction::SkipUpdate(id(CallbackParseError::Post)?),
            _ => return Err(CallbackParseError::Unknown),
        })
    }
}

impl Display for CallbackAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallbackAction::Mode { auto_publish: true } => write!(f, "mode:auto"),
            CallbackAction::Mode {
                auto_publish: false,
            } => write!(f, "mode:approval"),
            CallbackAction::Rubric(id) => write!(f, "rubric:{id}"),
            CallbackAction::Delay(days) => write!(f, "delay:{days}"),
            CallbackAction::SkipInvite => write!(f, "invite:skip"),
            CallbackAction::Channel(id) => write!(f, "channel:{id}"),
            CallbackAction::Settings(item) => write!(f, "settings:{}", item.as_str()),
            CallbackAction::Approve(id) => write!(f, "approve:{id}"),
            CallbackAction::Reject(id) => write!(f, "reject:{id}"),
            CallbackAction::Update(id) => write!(f, "update:{id}"),
            CallbackAction::SkipUpdate(id) => write!(f, "skip_update:{id}"),
        }
    }
}

/// Human readable publish delay.
#[must_use]
pub fn format_delay_label(days: u32) -> String {
    if days == 0 {
        "без задержки".to_string()
    } else {
        format!("{days} дн.")
    }
}

/// Label of a delay choice button.
#[must_use]
pub fn delay_button_label(days: u32) -> &'static str {
    match days {
        0 => "Без задержки",
        1 => "1 день",
        3 => "3 дня",
        7 => "7 дней",
        _ => "Другая задержка",
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn callback_data_survives_display_and_parse() {
        let actions = [
            CallbackAction::Mode { auto_publish: true },
            CallbackAction::Mode {
                auto_publish: false,
            },
            CallbackAction::Rubric(12),
            CallbackAction::Delay(3),
            CallbackAction::SkipInvite,
            CallbackAction::Channel(7),
            CallbackAction::Settings(SettingsItem::Invite),
            CallbackAction::Approve(100),
            CallbackAction::Reject(100),
            CallbackAction::Update(5),
            CallbackAction::SkipUpdate(5),
        ];
        for action in actions {
            let data = action.to_string();
            assert!(data.len() <= 64, "{data} does not fit into callback data");
            assert_eq!(data.parse::<CallbackAction>().unwrap(), action);
        }
    }

    #[test]
    fn legacy_payloads_parse() {
        assert_eq!(
            "approve:42".parse::<CallbackAction>().unwrap(),
            CallbackAction::Approve(42)
        );
        assert_eq!(
            "skip_update:9".parse::<CallbackAction>().unwrap(),
            CallbackAction::SkipUpdate(9)
        );
    }

    #[test]
    fn bad_arguments_are_reported_per_kind() {
        assert_eq!(
            "rubric:abc".parse::<CallbackAction>(),
            Err(CallbackParseError::Rubric)
        );
        assert_eq!(
            "delay:2".parse::<CallbackAction>(),
            Err(CallbackParseError::Delay)
        );
        assert_eq!(
            "approve:".parse::<CallbackAction>(),
            Err(CallbackParseError::Post)
        );
        assert_eq!(
            "channel:x".parse::<CallbackAction>(),
            Err(CallbackParseError::Channel)
        );
        assert_eq!(
            "whatever".parse::<CallbackAction>(),
            Err(CallbackParseError::Unknown)
        );
        assert_eq!(
            "settings:colour".parse::<CallbackAction>(),
            Err(CallbackParseError::Unknown)
        );
    }

    #[test]
    fn delay_labels() {
        assert_eq!(format_delay_label(0), "без задержки");
        assert_eq!(format_delay_label(3), "3 дн.");
    }
}
