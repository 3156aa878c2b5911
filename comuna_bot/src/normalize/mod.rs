//! Turning Telegram messages into something that can be stored and shown.
//!
//! [`ChannelPost`] is a plain snapshot of the parts of a channel message the
//! site cares about. It's what gets stored as raw data, and it's what a
//! forwarded copy of a post is turned into, so the rest of the pipeline
//! doesn't need to care where a post came from.

mod content;
mod entities;

pub use content::*;
pub use entities::*;

use serde::{Deserialize, Serialize};
use teloxide::types::{Message, MessageEntity, MessageEntityKind, MessageKind, MessageOrigin, Poll};

/// The channel a post was published in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRef {
    pub id: i64,
    /// Public username, without `@`. Posts of channels without one are
    /// never ingested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoRef {
    pub file_id: String,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub file_size: u32,
}

/// Kinds of media that can't be mirrored as images.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFlags {
    #[serde(default)]
    pub video: bool,
    #[serde(default)]
    pub video_note: bool,
    #[serde(default)]
    pub animation: bool,
    #[serde(default)]
    pub audio: bool,
    #[serde(default)]
    pub voice: bool,
    /// MIME type of an attached document, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_mime_type: Option<String>,
}

impl MediaFlags {
    fn document_mime_starts_with(&self, prefix: &str) -> bool {
        self.document_mime_type
            .as_deref()
            .is_some_and(|x| x.to_lowercase().starts_with(prefix))
    }

    #[must_use]
    pub fn has_video(&self) -> bool {
        self.video || self.video_note || self.animation || self.document_mime_starts_with("video/")
    }

    #[must_use]
    pub fn has_audio(&self) -> bool {
        self.audio || self.voice || self.document_mime_starts_with("audio/")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollOptionSnapshot {
    pub text: String,
    #[serde(default)]
    pub voter_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSnapshot {
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub options: Vec<PollOptionSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_voter_count: Option<u32>,
    #[serde(default)]
    pub is_anonymous: bool,
    #[serde(default)]
    pub allows_multiple_answers: bool,
    #[serde(default)]
    pub is_closed: bool,
}

impl From<&Poll> for PollSnapshot {
    fn from(poll: &Poll) -> Self {
        PollSnapshot {
            question: poll.question.clone(),
            options: poll
                .options
                .iter()
                .map(|x| PollOptionSnapshot {
                    text: x.text.clone(),
                    voter_count: x.voter_count,
                })
                .collect(),
            total_voter_count: Some(poll.total_voter_count),
            is_anonymous: poll.is_anonymous,
            allows_multiple_answers: poll.allows_multiple_answers,
            is_closed: poll.is_closed,
        }
    }
}

/// A channel message, reduced to what the site needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelPost {
    pub chat: ChannelRef,
    pub message_id: i64,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub caption: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<TextEntity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub caption_entities: Vec<TextEntity>,
    /// All sizes of the attached photo, if there is one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub photo: Vec<PhotoRef>,
    /// Empty if this message is not part of an album.
    #[serde(default)]
    pub media_group_id: String,
    #[serde(default)]
    pub media: MediaFlags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll: Option<PollSnapshot>,
    /// Service messages (pins, title changes and such) are never ingested.
    #[serde(default)]
    pub is_service: bool,
}

impl ChannelPost {
    /// Snapshot a post as it was delivered in a channel.
    #[must_use]
    pub fn from_channel_message(message: &Message) -> Self {
        let chat = ChannelRef {
            id: message.chat.id.0,
            username: message.chat.username().map(str::to_string),
            title: message.chat.title().unwrap_or_default().to_string(),
        };
        Self::from_message_parts(message, chat, i64::from(message.id.0))
    }

    /// Snapshot the channel post this private message is a forward of.
    /// Returns `None` if the message is not forwarded from a channel.
    #[must_use]
    pub fn from_forward(message: &Message) -> Option<Self> {
        let MessageOrigin::Channel {
            chat, message_id, ..
        } = message.forward_origin()?
        else {
            return None;
        };

        let channel = ChannelRef {
            id: chat.id.0,
            username: chat.username().map(str::to_string),
            title: chat.title().unwrap_or_default().to_string(),
        };
        Some(Self::from_message_parts(
            message,
            channel,
            i64::from(message_id.0),
        ))
    }

    fn from_message_parts(message: &Message, chat: ChannelRef, message_id: i64) -> Self {
        let convert = |entities: Option<&[MessageEntity]>| -> Vec<TextEntity> {
            entities
                .unwrap_or_default()
                .iter()
                .map(TextEntity::from)
                .collect()
        };

        let photo = message
            .photo()
            .unwrap_or_default()
            .iter()
            .map(|x| PhotoRef {
                file_id: x.file.id.0.clone(),
                width: x.width,
                height: x.height,
                file_size: x.file.size,
            })
            .collect();

        let media = MediaFlags {
            video: message.video().is_some(),
            video_note: message.video_note().is_some(),
            animation: message.animation().is_some(),
            audio: message.audio().is_some(),
            voice: message.voice().is_some(),
            document_mime_type: message
                .document()
                .and_then(|x| x.mime_type.as_ref())
                .map(ToString::to_string),
        };

        ChannelPost {
            chat,
            message_id,
            text: message.text().unwrap_or_default().to_string(),
            caption: message.caption().unwrap_or_default().to_string(),
            entities: convert(message.entities()),
            caption_entities: convert(message.caption_entities()),
            photo,
            media_group_id: message
                .media_group_id()
                .map(|x| x.0.clone())
                .unwrap_or_default(),
            media,
            poll: message.poll().map(PollSnapshot::from),
            is_service: !matches!(message.kind, MessageKind::Common(_)),
        }
    }

    /// Public username of the channel, if it has a non-empty one.
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.chat.username.as_deref().filter(|x| !x.is_empty())
    }

    /// Text of the post, or its caption if it has no text. Untrimmed, since
    /// entity offsets refer to it.
    #[must_use]
    pub fn raw_text(&self) -> &str {
        if !self.text.is_empty() {
            &self.text
        } else {
            &self.caption
        }
    }

    /// Text of the post, or its caption, trimmed.
    #[must_use]
    pub fn plain_text(&self) -> &str {
        self.raw_text().trim()
    }

    /// Entities that belong to [`ChannelPost::raw_text`].
    #[must_use]
    pub fn text_entities(&self) -> &[TextEntity] {
        if !self.text.is_empty() {
            &self.entities
        } else if !self.caption.is_empty() {
            &self.caption_entities
        } else {
            &[]
        }
    }

    /// Text rendered to HTML.
    #[must_use]
    pub fn formatted_text(&self) -> String {
        format_text(self.raw_text(), self.text_entities())
    }

    /// Largest size of the attached photo, by file size and then by area.
    #[must_use]
    pub fn largest_photo(&self) -> Option<&PhotoRef> {
        self.photo
            .iter()
            .max_by_key(|x| (x.file_size, u64::from(x.width) * u64::from(x.height)))
    }

    /// Telegram's embedded player for posts with video or audio, along with
    /// a label for it.
    #[must_use]
    pub fn embed(&self) -> Option<(String, &'static str)> {
        let username = self.username()?;
        if self.message_id == 0 {
            return None;
        }

        if self.media.has_video() {
            Some((embed_html(username, self.message_id, 420), "Видео"))
        } else if self.media.has_audio() {
            Some((embed_html(username, self.message_id, 200), "Аудио"))
        } else {
            None
        }
    }

    /// Rendered poll along with a title for it.
    #[must_use]
    pub fn poll_block(&self) -> Option<(String, String)> {
        poll_html(self.poll.as_ref()?)
    }
}

impl From<&MessageEntity> for TextEntity {
    fn from(entity: &MessageEntity) -> Self {
        let kind = match &entity.kind {
            MessageEntityKind::Bold => EntityKind::Bold,
            MessageEntityKind::Italic => EntityKind::Italic,
            MessageEntityKind::Underline => EntityKind::Underline,
            MessageEntityKind::Strikethrough => EntityKind::Strikethrough,
            MessageEntityKind::Spoiler => EntityKind::Spoiler,
            MessageEntityKind::Code => EntityKind::Code,
            MessageEntityKind::Pre { language } => EntityKind::Pre {
                language: language.clone(),
            },
            MessageEntityKind::Blockquote | MessageEntityKind::ExpandableBlockquote => {
                EntityKind::Blockquote
            }
            MessageEntityKind::TextLink { url } => EntityKind::TextLink {
                url: url.to_string(),
            },
            MessageEntityKind::Url => EntityKind::Url,
            MessageEntityKind::Mention => EntityKind::Mention,
            _ => EntityKind::Other,
        };

        TextEntity {
            kind,
            offset: entity.offset,
            length: entity.length,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn post() -> ChannelPost {
        ChannelPost {
            chat: ChannelRef {
                id: -100,
                username: Some("chan".to_string()),
                title: "Chan".to_string(),
            },
            message_id: 15,
            ..Default::default()
        }
    }

    #[test]
    fn caption_is_used_when_there_is_no_text() {
        let mut post = post();
        post.caption = "  caption  ".to_string();
        post.caption_entities = vec![TextEntity {
            kind: EntityKind::Bold,
            offset: 2,
            length: 7,
        }];
        post.entities = vec![TextEntity {
            kind: EntityKind::Italic,
            offset: 0,
            length: 1,
        }];
        assert_eq!(post.plain_text(), "caption");
        assert_eq!(post.text_entities(), post.caption_entities.as_slice());

        post.text = "text".to_string();
        assert_eq!(post.plain_text(), "text");
        assert_eq!(post.text_entities(), post.entities.as_slice());
    }

    #[test]
    fn largest_photo_prefers_file_size_then_area() {
        let mut post = post();
        post.photo = vec![
            PhotoRef {
                file_id: "small".to_string(),
                width: 90,
                height: 90,
                file_size: 1000,
            },
            PhotoRef {
                file_id: "wide".to_string(),
                width: 1280,
                height: 720,
                file_size: 5000,
            },
            PhotoRef {
                file_id: "tall".to_string(),
                width: 720,
                height: 1281,
                file_size: 5000,
            },
        ];
        assert_eq!(post.largest_photo().unwrap().file_id, "tall");
        assert!(ChannelPost::default().largest_photo().is_none());
    }

    #[test]
    fn video_wins_over_audio_in_embeds() {
        let mut post = post();
        assert!(post.embed().is_none());

        post.media.document_mime_type = Some("audio/mpeg".to_string());
        let (html, label) = post.embed().unwrap();
        assert_eq!(label, "Аудио");
        assert!(html.contains(r#"height="200""#));
        assert!(html.contains("https://t.me/chan/15?embed=1&single=1"));

        post.media.animation = true;
        let (html, label) = post.embed().unwrap();
        assert_eq!(label, "Видео");
        assert!(html.contains(r#"height="420""#));

        post.chat.username = None;
        assert!(post.embed().is_none());
    }

    #[test]
    fn expandable_quotes_are_plain_quotes() {
        let entities = [
            MessageEntity::new(MessageEntityKind::ExpandableBlockquote, 0, 5),
            MessageEntity::new(MessageEntityKind::Blockquote, 6, 5),
            MessageEntity::new(MessageEntityKind::Hashtag, 12, 4),
        ];
        let converted: Vec<TextEntity> = entities.iter().map(TextEntity::from).collect();
        assert_eq!(converted[0].kind, EntityKind::Blockquote);
        assert_eq!(converted[1].kind, EntityKind::Blockquote);
        assert_eq!(converted[2].kind, EntityKind::Other);
        assert_eq!((converted[0].offset, converted[0].length), (0, 5));

        assert_eq!(
            format_text("first\nlast! #tag", &converted),
            "<blockquote>first</blockquote><br><blockquote>last!</blockquote> #tag"
        );
    }

    #[test]
    fn snapshots_survive_json() {
        let mut post = post();
        post.text = "hello".to_string();
        post.poll = Some(PollSnapshot {
            question: "Q?".to_string(),
            ..Default::default()
        });
        let json = serde_json::to_string(&post).unwrap();
        let back: ChannelPost = serde_json::from_str(&json).unwrap();
        assert_eq!(back, post);

        // Older rows may lack most fields.
        let minimal: ChannelPost =
            serde_json::from_str(r#"{"chat":{"id":1},"message_id":2}"#).unwrap();
        assert_eq!(minimal.message_id, 2);
        assert!(minimal.username().is_none());
    }
}
