use std::{borrow::Cow, collections::BTreeMap};

use serde::{Deserialize, Serialize};

/// Formatting kinds that can be rendered. Everything else Telegram may send
/// is kept as [`EntityKind::Other`] and skipped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntityKind {
    Bold,
    Italic,
    Underline,
    Strikethrough,
    Spoiler,
    Code,
    Pre {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },
    Blockquote,
    TextLink {
        url: String,
    },
    Url,
    Mention,
    #[serde(other)]
    Other,
}

/// A formatting span. Offset and length are in UTF-16 code units, the way
/// Telegram counts them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextEntity {
    #[serde(flatten)]
    pub kind: EntityKind,
    pub offset: usize,
    pub length: usize,
}

/// Convert an offset in UTF-16 code units into an index of a `char` in
/// `text`.
///
/// An offset that lands in the middle of a surrogate pair is rounded up to
/// the next `char`. Offsets past the end give the amount of chars.
#[must_use]
pub fn utf16_offset_to_index(text: &str, offset: usize) -> usize {
    if offset == 0 {
        return 0;
    }

    let mut units = 0;
    for (index, ch) in text.chars().enumerate() {
        units += ch.len_utf16();
        if units >= offset {
            return index + 1;
        }
    }

    text.chars().count()
}

fn escape(text: &str) -> Cow<'_, str> {
    html_escape::encode_quoted_attribute(text)
}

fn link_tags(href: &str) -> (String, &'static str) {
    (
        format!(r#"<a href="{}" target="_blank" rel="noopener">"#, escape(href)),
        "</a>",
    )
}

/// Opening and closing HTML tags of an entity covering `segment`.
fn entity_tags(kind: &EntityKind, segment: &str) -> Option<(String, &'static str)> {
    let simple = |open: &str, close: &'static str| Some((open.to_string(), close));

    match kind {
        EntityKind::Bold => simple("<b>", "</b>"),
        EntityKind::Italic => simple("<i>", "</i>"),
        EntityKind::Underline => simple("<u>", "</u>"),
        EntityKind::Strikethrough => simple("<s>", "</s>"),
        EntityKind::Spoiler => simple(r#"<span class="tg-spoiler">"#, "</span>"),
        EntityKind::Code => simple("<code>", "</code>"),
        EntityKind::Pre { language } => {
            let class = match language.as_deref().filter(|x| !x.is_empty()) {
                Some(language) => format!(r#" class="language-{}""#, escape(language)),
                None => String::new(),
            };
            Some((format!("<pre><code{class}>"), "</code></pre>"))
        }
        EntityKind::Blockquote => simple("<blockquote>", "</blockquote>"),
        EntityKind::TextLink { url } => Some(link_tags(url)),
        EntityKind::Url => Some(link_tags(segment.trim())),
        EntityKind::Mention => Some(link_tags(&format!(
            "https://t.me/{}",
            segment.trim_start_matches('@')
        ))),
        EntityKind::Other => None,
    }
}

/// Render Telegram-formatted text to HTML.
///
/// All text is escaped and line breaks become `<br>`. Tags opening at the
/// same position are ordered outermost first, and tags closing at the same
/// position innermost first, so properly nested entities give properly
/// nested HTML.
#[must_use]
pub fn format_text(text: &str, entities: &[TextEntity]) -> String {
    if text.is_empty() {
        return String::new();
    }

    let normalized = text.replace("\r\n", "\n");

    if entities.is_empty() {
        return escape(&normalized).replace('\n', "<br>");
    }

    let chars: Vec<char> = normalized.chars().collect();

    // start index -> (end, sequence, open tag)
    let mut opens: BTreeMap<usize, Vec<(usize, usize, String)>> = BTreeMap::new();
    // end index -> (start, sequence, close tag)
    let mut closes: BTreeMap<usize, Vec<(usize, usize, &'static str)>> = BTreeMap::new();

    for (seq, entity) in entities.iter().enumerate() {
        let start = utf16_offset_to_index(&normalized, entity.offset);
        let end = utf16_offset_to_index(&normalized, entity.offset + entity.length);
        if start >= end {
            continue;
        }

        let segment: String = chars[start..end].iter().collect();
        let Some((open, close)) = entity_tags(&entity.kind, &segment) else {
            continue;
        };

        opens.entry(start).or_default().push((end, seq, open));
        closes.entry(end).or_default().push((start, seq, close));
    }

    for tags in opens.values_mut() {
        // Longest first. Equal spans keep their order.
        tags.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    }
    for tags in closes.values_mut() {
        // Latest start first. Equal spans close in reverse of how they opened.
        tags.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
    }

    let mut out = String::with_capacity(normalized.len() * 2);
    let mut buf = [0u8; 4];

    for (index, ch) in chars.iter().enumerate() {
        if let Some(tags) = opens.get(&index) {
            for (_, _, open) in tags {
                out.push_str(open);
            }
        }

        out.push_str(&escape(ch.encode_utf8(&mut buf)));

        if let Some(tags) = closes.get(&(index + 1)) {
            for (_, _, close) in tags {
                out.push_str(close);
            }
        }
    }

    out.replace('\n', "<br>")
}
