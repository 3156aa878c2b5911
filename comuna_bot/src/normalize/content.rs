use std::sync::OnceLock;

use regex::Regex;

use crate::database::Post;

use super::PollSnapshot;

const TITLE_MAX_CHARS: usize = 120;

fn escape(text: &str) -> std::borrow::Cow<'_, str> {
    html_escape::encode_quoted_attribute(text)
}

fn is_line_break(c: char) -> bool {
    matches!(
        c,
        '\n' | '\r' | '\u{0b}' | '\u{0c}' | '\u{1c}'..='\u{1e}' | '\u{85}' | '\u{2028}' | '\u{2029}'
    )
}

/// Make a title out of the text of a post.
///
/// That's the first line of it, up to the first sentence end. If there is
/// no sentence end, overly long lines are shortened with `...`.
#[must_use]
pub fn build_title(text: &str) -> String {
    let Some(first_line) = text.trim().split(is_line_break).next() else {
        return String::new();
    };
    let first_line = first_line.trim();

    let cut = ['.', '!', '?']
        .into_iter()
        .filter_map(|sep| first_line.find(sep).filter(|&idx| idx > 0).map(|idx| (idx, sep)))
        .min_by_key(|(idx, _)| *idx);

    if let Some((idx, sep)) = cut {
        return match sep {
            '.' => first_line[..idx].trim().to_string(),
            _ => first_line[..idx + sep.len_utf8()].trim().to_string(),
        };
    }

    if first_line.chars().count() <= TITLE_MAX_CHARS {
        return first_line.to_string();
    }

    let shortened: String = first_line.chars().take(TITLE_MAX_CHARS - 3).collect();
    format!("{}...", shortened.trim())
}

/// Remove HTML tags and decode entities.
#[must_use]
pub fn strip_html(html: &str) -> String {
    if html.is_empty() {
        return String::new();
    }
    static HTML_TAG: OnceLock<Regex> = OnceLock::new();
    let html_tag = HTML_TAG.get_or_init(|| Regex::new(r"<[^>]+>").unwrap());
    html_escape::decode_html_entities(&html_tag.replace_all(html, "")).into_owned()
}

/// Title to show for a post, even if it was stored without one.
#[must_use]
pub fn display_title(post: &Post) -> String {
    let title = post.title.trim();
    if !title.is_empty() {
        return title.to_string();
    }

    let question = post
        .raw_data
        .message
        .as_ref()
        .and_then(|x| x.poll.as_ref())
        .map(|x| x.question.trim())
        .unwrap_or_default();
    if !question.is_empty() {
        let title = build_title(question);
        if !title.is_empty() {
            return title;
        }
    }

    let content = strip_html(&post.content);
    let title = build_title(&content);
    if !title.is_empty() {
        return title;
    }

    "Пост".to_string()
}

/// Make a URL slug out of a title, transliterating Cyrillic.
#[must_use]
pub fn slugify_title(text: &str) -> String {
    let mut translit = String::with_capacity(text.len());

    for ch in text.to_lowercase().chars() {
        let replacement = match ch {
            'а' => "a",
            'б' => "b",
            'в' => "v",
            'г' => "g",
            'д' => "d",
            'е' | 'ё' | 'э' => "e",
            'ж' => "zh",
            'з' => "z",
            'и' => "i",
            'й' | 'ы' => "y",
            'к' => "k",
            'л' => "l",
            'м' => "m",
            'н' => "n",
            'о' => "o",
            'п' => "p",
            'р' => "r",
            'с' => "s",
            'т' => "t",
            'у' => "u",
            'ф' => "f",
            'х' => "h",
            'ц' => "ts",
            'ч' => "ch",
            'ш' => "sh",
            'щ' => "shch",
            'ю' => "yu",
            'я' => "ya",
            'ъ' | 'ь' => "",
            _ => {
                translit.push(ch);
                continue;
            }
        };
        translit.push_str(replacement);
    }

    static NON_SLUG: OnceLock<Regex> = OnceLock::new();
    let non_slug = NON_SLUG.get_or_init(|| Regex::new(r"[^a-z0-9]+").unwrap());
    non_slug
        .replace_all(&translit, "-")
        .trim_matches('-')
        .to_string()
}

/// Telegram's embedded post widget.
#[must_use]
pub fn embed_html(username: &str, message_id: i64, height: u32) -> String {
    let src = format!("https://t.me/{username}/{message_id}?embed=1&single=1");
    format!(
        concat!(
            r#"<div class="post-embed">"#,
            r#"<iframe class="telegram-embed" src="{src}" "#,
            r#"width="100%" height="{height}" frameborder="0" "#,
            r#"allow="accelerometer; autoplay; encrypted-media; gyroscope; picture-in-picture" "#,
            r#"allowfullscreen loading="lazy" referrerpolicy="no-referrer"></iframe>"#,
            "</div>"
        ),
        src = src,
        height = height
    )
}

/// Render a poll, returning the HTML and a title for it. Gives `None` for
/// polls with neither a question nor options.
#[must_use]
pub fn poll_html(poll: &PollSnapshot) -> Option<(String, String)> {
    let question = poll.question.trim();
    let options: Vec<(&str, u32)> = poll
        .options
        .iter()
        .map(|x| (x.text.trim(), x.voter_count))
        .filter(|(text, _)| !text.is_empty())
        .collect();

    if question.is_empty() && options.is_empty() {
        return None;
    }

    let total = poll.total_voter_count;

    let option_items: String = options
        .iter()
        .map(|&(text, count)| {
            let value = match total.filter(|&x| x > 0) {
                Some(total) => {
                    let percent = (f64::from(count) / f64::from(total) * 100.0).round_ties_even();
                    format!("{count} ({percent}%)")
                }
                None => count.to_string(),
            };
            format!(
                r#"<li class="post-poll-option">{} <b>{value}</b></li>"#,
                escape(text)
            )
        })
        .collect();

    let mut meta = Vec::new();
    if poll.is_anonymous {
        meta.push("Анонимный опрос".to_string());
    }
    if poll.allows_multiple_answers {
        meta.push("Можно выбрать несколько вариантов".to_string());
    }
    if poll.is_closed {
        meta.push("Опрос завершен".to_string());
    }
    if let Some(total) = total {
        meta.push(format!("Голосов: {total}"));
    }

    let mut html = String::from(r#"<div class="post-poll">"#);
    if !question.is_empty() {
        html.push_str(&format!(
            r#"<div class="post-poll-question"><b>{}</b></div>"#,
            escape(question)
        ));
    }
    if !option_items.is_empty() {
        html.push_str(&format!(
            r#"<ul class="post-poll-options">{option_items}</ul>"#
        ));
    }
    if !meta.is_empty() {
        html.push_str(&format!(
            r#"<div class="post-poll-meta">{}</div>"#,
            meta.join(" · ")
        ));
    }
    html.push_str("</div>");

    let mut title = build_title(question);
    if title.is_empty() {
        title = "Опрос".to_string();
    }

    Some((html, title))
}

/// Assemble the HTML of a post: images, embed, poll and text, in that order.
#[must_use]
pub fn build_content(
    text_html: &str,
    image_urls: &[String],
    embed_html: &str,
    poll_html: &str,
) -> String {
    let media_html = match image_urls {
        [] => String::new(),
        [url] => format!(r#"<img src="{url}" alt="" />"#),
        urls => {
            let images: String = urls
                .iter()
                .map(|url| format!(r#"<img src="{url}" alt="" />"#))
                .collect();
            format!(r#"<div class="post-gallery">{images}</div>"#)
        }
    };

    [media_html.as_str(), embed_html, poll_html, text_html]
        .into_iter()
        .filter(|x| !x.is_empty())
        .collect::<Vec<_>>()
        .join("<br><br>")
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use chrono::Utc;

    use crate::{
        database::RawPostData,
        normalize::{ChannelPost, PollOptionSnapshot},
    };

    use super::*;

    #[test]
    fn titles_stop_at_sentence_end() {
        assert_eq!(build_title(""), "");
        assert_eq!(build_title("  Hello world. More text"), "Hello world");
        assert_eq!(build_title("Wow! Such title."), "Wow!");
        assert_eq!(build_title("Really? Yes."), "Really?");
        assert_eq!(build_title("First line\nSecond. line"), "First line");
        // A leading dot doesn't count, and only the first of each is looked at.
        assert_eq!(build_title(".hidden file"), ".hidden file");
        assert_eq!(build_title("Привет, мир! Как дела"), "Привет, мир!");
    }

    #[test]
    fn long_titles_are_shortened() {
        let line = "слово ".repeat(30);
        let title = build_title(&line);
        assert!(title.ends_with("..."));
        assert!(title.chars().count() <= 120);

        let exact = "a".repeat(120);
        assert_eq!(build_title(&exact), exact);
    }

    #[test]
    fn html_is_stripped() {
        assert_eq!(strip_html("<b>a &amp; b</b><br>c"), "a & bc");
        assert_eq!(strip_html(""), "");
    }

    #[test]
    fn slugs() {
        assert_eq!(slugify_title("Привет, Мир!"), "privet-mir");
        assert_eq!(slugify_title("  Щука и ёж 2024 "), "shchuka-i-ezh-2024");
        assert_eq!(slugify_title("Объявление"), "obyavlenie");
        assert_eq!(slugify_title("!!!"), "");
    }

    #[test]
    fn content_order_and_gallery() {
        assert_eq!(build_content("", &[], "", ""), "");
        assert_eq!(
            build_content("text", &["a.jpg".to_string()], "", ""),
            r#"<img src="a.jpg" alt="" /><br><br>text"#
        );
        assert_eq!(
            build_content(
                "text",
                &["a.jpg".to_string(), "b.jpg".to_string()],
                "EMBED",
                "POLL"
            ),
            concat!(
                r#"<div class="post-gallery"><img src="a.jpg" alt="" /><img src="b.jpg" alt="" /></div>"#,
                "<br><br>EMBED<br><br>POLL<br><br>text"
            )
        );
    }

    #[test]
    fn polls() {
        assert!(poll_html(&PollSnapshot::default()).is_none());

        let poll = PollSnapshot {
            question: "Best <language>? Pick one".to_string(),
            options: vec![
                PollOptionSnapshot {
                    text: "Rust".to_string(),
                    voter_count: 2,
                },
                PollOptionSnapshot {
                    text: "  ".to_string(),
                    voter_count: 5,
                },
                PollOptionSnapshot {
                    text: "Go".to_string(),
                    voter_count: 1,
                },
            ],
            total_voter_count: Some(3),
            is_anonymous: true,
            allows_multiple_answers: false,
            is_closed: true,
        };
        let (html, title) = poll_html(&poll).unwrap();
        assert_eq!(title, "Best <language>?");
        assert!(html.contains("<b>Best &lt;language&gt;? Pick one</b>"));
        assert!(html.contains(r#"<li class="post-poll-option">Rust <b>2 (67%)</b></li>"#));
        assert!(html.contains(r#"<li class="post-poll-option">Go <b>1 (33%)</b></li>"#));
        assert_eq!(html.matches("<li").count(), 2);
        assert!(html.contains("Анонимный опрос · Опрос завершен · Голосов: 3"));

        let untitled = PollSnapshot {
            options: vec![PollOptionSnapshot {
                text: "only".to_string(),
                voter_count: 0,
            }],
            total_voter_count: Some(0),
            ..Default::default()
        };
        let (html, title) = poll_html(&untitled).unwrap();
        assert_eq!(title, "Опрос");
        assert!(html.contains("only <b>0</b>"));
    }

    fn stored_post(title: &str, content: &str, poll: Option<PollSnapshot>) -> Post {
        Post {
            id: 1,
            author_id: 1,
            message_id: 1,
            title: title.to_string(),
            rubric_id: None,
            content: content.to_string(),
            source_url: String::new(),
            channel_url: String::new(),
            media_group_id: String::new(),
            is_pending: false,
            is_blocked: false,
            publish_at: None,
            raw_data: RawPostData {
                message: Some(ChannelPost {
                    poll,
                    ..Default::default()
                }),
                ..Default::default()
            },
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn display_title_fallbacks() {
        assert_eq!(display_title(&stored_post(" Title ", "x", None)), "Title");

        let poll = PollSnapshot {
            question: "Who? Yes".to_string(),
            ..Default::default()
        };
        assert_eq!(display_title(&stored_post("", "x", Some(poll))), "Who?");

        assert_eq!(
            display_title(&stored_post("", "<b>From content.</b> rest", None)),
            "From content"
        );
        assert_eq!(
            display_title(&stored_post("", r#"<img src="a" />"#, None)),
            "Пост"
        );
    }
}
