//! Setup draft of a channel owner, before a channel is connected.
//!
//! The draft is filled in a fixed order of steps. Each step has to be
//! completed before the next one is accepted, but a completed step may be
//! changed again at any time without losing later steps.

use teloxide::types::ChatId;
use thiserror::Error;

use crate::{
    database::{Author, BotSession},
    types::ALLOWED_DELAYS,
};

/// Steps of the setup, in the order they have to be completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SetupStep {
    Mode,
    Rubric,
    Delay,
    InviteLink,
    Done,
}

/// A value given by the user for one of the setup steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupChoice {
    Mode { auto_publish: bool },
    Rubric(i64),
    /// Pass over the rubric step, for when there are no rubrics to pick.
    SkipRubric,
    Delay(u32),
    InviteLink(String),
    SkipInvite,
}

impl SetupChoice {
    fn step(&self) -> SetupStep {
        match self {
            SetupChoice::Mode { .. } => SetupStep::Mode,
            SetupChoice::Rubric(_) | SetupChoice::SkipRubric => SetupStep::Rubric,
            SetupChoice::Delay(_) => SetupStep::Delay,
            SetupChoice::InviteLink(_) | SetupChoice::SkipInvite => SetupStep::InviteLink,
        }
    }

    /// Toast shown once this choice is saved.
    #[must_use]
    pub fn saved_message(&self) -> &'static str {
        match self {
            SetupChoice::Rubric(_) => "Рубрика сохранена",
            SetupChoice::Delay(_) => "Задержка сохранена",
            SetupChoice::Mode { .. }
            | SetupChoice::SkipRubric
            | SetupChoice::InviteLink(_)
            | SetupChoice::SkipInvite => "Настройка сохранена",
        }
    }
}

/// A choice was made too early. Holds the step that has to be completed
/// first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("setup step {0:?} is not completed yet")]
pub struct SetupRejected(pub SetupStep);

impl SetupRejected {
    /// Text telling the user what to do first.
    #[must_use]
    pub fn user_message(self) -> &'static str {
        match self.0 {
            SetupStep::Mode => "Сначала выберите режим публикации.",
            SetupStep::Rubric => "Сначала выберите тематику канала.",
            SetupStep::Delay => "Сначала выберите задержку публикации.",
            SetupStep::InviteLink | SetupStep::Done => {
                "Сначала пришлите ссылку приглашения или пропустите этот шаг."
            }
        }
    }
}

/// Whether this looks like a link to a Telegram channel or invite.
#[must_use]
pub fn is_invite_link(text: &str) -> bool {
    let text = text.trim();
    let rest = text
        .strip_prefix("https://")
        .or_else(|| text.strip_prefix("http://"))
        .unwrap_or(text);

    ["t.me/", "telegram.me/"]
        .iter()
        .any(|host| rest.strip_prefix(host).is_some_and(|x| !x.is_empty()))
        && !text.contains(char::is_whitespace)
}

impl BotSession {
    /// The first step that is not completed yet.
    #[must_use]
    pub fn current_step(&self) -> SetupStep {
        if !self.mode_selected {
            SetupStep::Mode
        } else if self.rubric_id.is_none() && !self.rubric_skipped {
            SetupStep::Rubric
        } else if self.publish_delay_days.is_none() {
            SetupStep::Delay
        } else if !self.invite_decided {
            SetupStep::InviteLink
        } else {
            SetupStep::Done
        }
    }

    /// Apply a choice to the draft, returning the step to ask about next.
    ///
    /// # Errors
    ///
    /// Errors if an earlier step is not completed yet. The draft is left
    /// unchanged then.
    pub fn apply_choice(&mut self, choice: SetupChoice) -> Result<SetupStep, SetupRejected> {
        let current = self.current_step();
        if choice.step() > current {
            return Err(SetupRejected(current));
        }

        match choice {
            SetupChoice::Mode { auto_publish } => {
                self.auto_publish = auto_publish;
                self.mode_selected = true;
            }
            SetupChoice::Rubric(id) => self.rubric_id = Some(id),
            SetupChoice::SkipRubric => self.rubric_skipped = true,
            SetupChoice::Delay(days) => {
                if !ALLOWED_DELAYS.contains(&days) {
                    return Err(SetupRejected(SetupStep::Delay));
                }
                self.publish_delay_days = Some(days);
            }
            SetupChoice::InviteLink(url) => {
                self.invite_url = url.trim().to_string();
                self.invite_decided = true;
                self.invite_waiting = false;
            }
            SetupChoice::SkipInvite => {
                self.invite_decided = true;
                self.invite_waiting = false;
            }
        }

        Ok(self.current_step())
    }

    /// Forget all draft progress. The selected channel and a pending post
    /// update are forgotten too.
    pub fn reset_draft(&mut self) {
        *self = BotSession::new(self.telegram_user_id);
    }

    /// Returns `true` exactly once, when the draft is complete and the
    /// setup instructions have not been sent yet.
    pub fn take_instructions_due(&mut self) -> bool {
        if self.current_step() == SetupStep::Done && !self.instructions_sent {
            self.instructions_sent = true;
            true
        } else {
            false
        }
    }

    /// Copy the settings chosen so far onto a newly connected channel, which
    /// will be managed from `chat` from now on.
    pub fn apply_to_author(&self, author: &mut Author, chat: ChatId) {
        author.admin_chat_id = Some(chat);
        if self.mode_selected {
            author.auto_publish = self.auto_publish;
        }
        if let Some(rubric_id) = self.rubric_id {
            author.rubric_id = Some(rubric_id);
        }
        if let Some(days) = self.publish_delay_days {
            author.publish_delay_days = days;
        }
        if !self.invite_url.is_empty() {
            author.invite_url = self.invite_url.clone();
        }
    }
}
