//! Tags of posts: hashtags written by authors, plus existing tags found in
//! the text of a post.

use std::{
    collections::{HashMap, HashSet},
    sync::OnceLock,
};

use regex::Regex;

use crate::{
    database::{Database, Error, Post, Tag},
    normalize::strip_html,
    types::MAX_TAGS_PER_POST,
};

/// Collapse runs of whitespace into single spaces and trim.
#[must_use]
pub fn normalize_tag_value(value: &str) -> String {
    static WHITESPACE: OnceLock<Regex> = OnceLock::new();
    let whitespace = WHITESPACE.get_or_init(|| Regex::new(r"\s+").unwrap());
    whitespace.replace_all(value, " ").trim().to_string()
}

/// Normalize values and drop empty ones and case-insensitive duplicates,
/// keeping the first spelling.
fn dedup_normalized<'a>(values: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .into_iter()
        .map(normalize_tag_value)
        .filter(|x| !x.is_empty() && seen.insert(x.to_lowercase()))
        .collect()
}

/// Hashtags in this text, without `#`.
#[must_use]
pub fn extract_hashtags(text: &str) -> Vec<String> {
    static HASHTAG: OnceLock<Regex> = OnceLock::new();
    let hashtag = HASHTAG.get_or_init(|| Regex::new(r"#([\w-]+)").unwrap());
    dedup_normalized(
        hashtag
            .captures_iter(text)
            .filter_map(|x| x.get(1))
            .map(|x| x.as_str()),
    )
}

/// Tags from a comma or newline separated list.
#[must_use]
pub fn parse_tag_payload(raw: &str) -> Vec<String> {
    dedup_normalized(raw.split([',', '\n']))
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// How many times `tag` occurs in `text`.
///
/// Tags that look like a single word only count where they are not glued to
/// other word characters. Anything else is counted as a plain substring.
#[must_use]
pub fn count_occurrences(text: &str, tag: &str) -> usize {
    if text.is_empty() || tag.is_empty() {
        return 0;
    }

    let word_like = tag.chars().all(|c| is_word_char(c) || c == '-');
    if !word_like {
        return text.matches(tag).count();
    }

    let mut count = 0;
    let mut pos = 0;
    while pos < text.len() {
        let rest = &text[pos..];
        if rest.starts_with(tag) {
            let before_ok = !text[..pos].chars().next_back().is_some_and(is_word_char);
            let after_ok = !rest[tag.len()..].chars().next().is_some_and(is_word_char);
            if before_ok && after_ok {
                count += 1;
                pos += tag.len();
                continue;
            }
        }
        pos += rest.chars().next().map_or(1, char::len_utf8);
    }
    count
}

/// Reduces a word to its dictionary form, so that different spellings of a
/// tag match each other.
pub trait Lemmatizer: Send + Sync {
    /// Lemma of a single lowercase word.
    fn lemmatize_word(&self, word: &str) -> String;

    /// Lemma of a whole tag. Words are split on whitespace and hyphens, and
    /// each part is lemmatized on its own.
    fn lemmatize(&self, value: &str) -> String {
        normalize_tag_value(value)
            .to_lowercase()
            .split_whitespace()
            .filter_map(|word| {
                let parts: Vec<String> = word
                    .split('-')
                    .filter(|x| !x.is_empty())
                    .map(|x| self.lemmatize_word(x))
                    .collect();
                (!parts.is_empty()).then(|| parts.join("-"))
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Strips common inflectional endings of Russian and English words.
///
/// No dictionary is involved, so this only gets regular forms right, but
/// that's what most tags are.
#[derive(Debug, Clone, Copy, Default)]
pub struct SuffixLemmatizer;

/// Endings, longest first within each language.
const RUSSIAN_ENDINGS: &[&str] = &[
    "иями", "ями", "ами", "ого", "его", "ому", "ему", "ыми", "ими", "ях", "ах", "ов", "ев", "ей",
    "ой", "ий", "ый", "ая", "яя", "ое", "ее", "ые", "ие", "ам", "ям", "ом", "ем", "ы", "и", "а",
    "я", "о", "е", "у", "ю", "ь",
];
const ENGLISH_ENDINGS: &[&str] = &["ies", "es", "s"];

/// Stems shorter than this are left alone.
const MIN_STEM_CHARS: usize = 3;

impl Lemmatizer for SuffixLemmatizer {
    fn lemmatize_word(&self, word: &str) -> String {
        let word = word.to_lowercase();
        let cyrillic = word.chars().any(|c| matches!(c, 'а'..='я' | 'ё'));
        let endings = if cyrillic {
            RUSSIAN_ENDINGS
        } else {
            ENGLISH_ENDINGS
        };

        for ending in endings {
            let Some(stem) = word.strip_suffix(ending) else {
                continue;
            };
            if stem.chars().count() < MIN_STEM_CHARS {
                continue;
            }
            if !cyrillic {
                match *ending {
                    "ies" => return format!("{stem}y"),
                    "es" if !["s", "x", "z", "ch", "sh"].iter().any(|x| stem.ends_with(x)) => {
                        continue
                    }
                    // "ss" is not a plural.
                    "s" if stem.ends_with('s') => continue,
                    _ => {}
                }
            }
            return stem.to_string();
        }

        word
    }
}

/// Key a tag is matched by.
fn tag_key(lemmatizer: &dyn Lemmatizer, tag: &Tag) -> String {
    let lemma = tag.lemma.trim();
    if !lemma.is_empty() {
        return lemma.to_lowercase();
    }
    let lemma = lemmatizer.lemmatize(&tag.name);
    if lemma.is_empty() {
        tag.name.trim().to_lowercase()
    } else {
        lemma
    }
}

/// A tag picked for a post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectedTag<'a> {
    Existing(&'a Tag),
    /// A hashtag that doesn't match any existing tag yet.
    New { name: String, lemma: String },
}

/// Pick up to [`MAX_TAGS_PER_POST`] tags for a post.
///
/// `explicit` tags come first, matched to `existing` tags by lemma. The rest
/// is filled with active existing tags found in the title and content,
/// most frequent first, then longest first, then alphabetically.
#[must_use]
pub fn select_tags<'a>(
    lemmatizer: &dyn Lemmatizer,
    explicit: &[String],
    existing: &'a [Tag],
    title: &str,
    content: &str,
) -> Vec<SelectedTag<'a>> {
    let mut by_key: HashMap<String, &Tag> = HashMap::new();
    let mut keyed = Vec::new();
    for tag in existing {
        let key = tag_key(lemmatizer, tag);
        if !key.is_empty() && !by_key.contains_key(&key) {
            by_key.insert(key, tag);
            keyed.push(tag);
        }
    }

    let mut selected = Vec::new();
    let mut seen_ids = HashSet::new();
    let mut new_keys = HashSet::new();

    for name in explicit {
        if selected.len() >= MAX_TAGS_PER_POST {
            break;
        }

        let name = normalize_tag_value(name);
        if name.is_empty() {
            continue;
        }
        let mut lemma = lemmatizer.lemmatize(&name);
        if lemma.is_empty() {
            lemma = name.clone();
        }
        let key = lemma.to_lowercase();

        match by_key.get(&key) {
            Some(&tag) => {
                if seen_ids.insert(tag.id) {
                    selected.push(SelectedTag::Existing(tag));
                }
            }
            None => {
                if new_keys.insert(key) {
                    selected.push(SelectedTag::New { name, lemma });
                }
            }
        }
    }

    if selected.len() < MAX_TAGS_PER_POST && !keyed.is_empty() {
        let text = strip_html(&format!("{title} {content}")).to_lowercase();

        let mut candidates: Vec<(usize, usize, String, &Tag)> = keyed
            .into_iter()
            .filter(|x| x.is_active && !seen_ids.contains(&x.id))
            .filter_map(|tag| {
                let name = tag.name.to_lowercase();
                let count = count_occurrences(&text, &name);
                (count > 0).then(|| (count, tag.name.chars().count(), name, tag))
            })
            .collect();

        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)).then(a.2.cmp(&b.2)));

        selected.extend(
            candidates
                .into_iter()
                .take(MAX_TAGS_PER_POST - selected.len())
                .map(|(_, _, _, tag)| SelectedTag::Existing(tag)),
        );
    }

    selected
}

/// Select tags for a stored post and write them, creating new tags for
/// unknown hashtags.
pub async fn apply_post_tags(
    database: &Database,
    lemmatizer: &dyn Lemmatizer,
    post: &Post,
    explicit: &[String],
) -> Result<(), Error> {
    let existing = database.all_tags().await?;

    let mut tag_ids = Vec::new();
    for tag in select_tags(lemmatizer, explicit, &existing, &post.title, &post.content) {
        let id = match tag {
            SelectedTag::Existing(tag) => tag.id,
            SelectedTag::New { name, lemma } => {
                log::debug!("Creating tag {name:?} with lemma {lemma:?}");
                database.create_tag(&name, &lemma).await?.id
            }
        };
        tag_ids.push(id);
    }

    database.set_post_tags(post.id, &tag_ids).await
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn tag(id: i64, name: &str, lemma: &str, is_active: bool) -> Tag {
        Tag {
            id,
            name: name.to_string(),
            lemma: lemma.to_string(),
            is_active,
        }
    }

    #[test]
    fn hashtags_are_deduplicated() {
        assert_eq!(
            extract_hashtags("Hi #Rust and #rust, #web-dev #котики!"),
            ["Rust", "web-dev", "котики"]
        );
        assert!(extract_hashtags("no tags # here").is_empty());
    }

    #[test]
    fn payloads_split_on_commas_and_lines() {
        assert_eq!(
            parse_tag_payload("one, Two\n  two ,,three   four"),
            ["one", "Two", "three four"]
        );
    }

    #[test]
    fn word_tags_count_whole_words() {
        assert_eq!(count_occurrences("rust is rusty, rust!", "rust"), 2);
        assert_eq!(count_occurrences("c++ and c++", "c++"), 2);
        assert_eq!(count_occurrences("веб-дизайн и дизайн", "дизайн"), 2);
        assert_eq!(count_occurrences("_rust rust_", "rust"), 0);
        assert_eq!(count_occurrences("", "rust"), 0);
    }

    #[test]
    fn suffix_lemmatizer() {
        let l = SuffixLemmatizer;
        assert_eq!(l.lemmatize("Котики"), "котик");
        assert_eq!(l.lemmatize("котика"), "котик");
        assert_eq!(l.lemmatize("Stories"), "story");
        assert_eq!(l.lemmatize("Games"), "game");
        assert_eq!(l.lemmatize("class"), "class");
        assert_eq!(l.lemmatize("go"), "go");
        assert_eq!(l.lemmatize("  web-Games  dev "), "web-game dev");
    }

    #[test]
    fn explicit_tags_come_first_and_match_by_lemma() {
        let existing = vec![tag(1, "Котик", "котик", true), tag(2, "Rust", "", true)];
        let explicit = vec!["котики".to_string(), "Новое".to_string(), "новое".to_string()];
        let selected = select_tags(&SuffixLemmatizer, &explicit, &existing, "", "");
        assert_eq!(
            selected,
            [
                SelectedTag::Existing(&existing[0]),
                SelectedTag::New {
                    name: "Новое".to_string(),
                    lemma: "нов".to_string()
                }
            ]
        );
    }

    #[test]
    fn found_tags_are_ranked() {
        let existing = vec![
            tag(1, "go", "go", true),
            tag(2, "rust", "rust", true),
            tag(3, "web", "web", true),
            tag(4, "async", "async", false),
            tag(5, "tokio", "tokio", true),
        ];
        let selected = select_tags(
            &SuffixLemmatizer,
            &[],
            &existing,
            "Rust and go",
            "<p>rust, tokio, go, async async</p>",
        );
        let ids: Vec<i64> = selected
            .iter()
            .map(|x| match x {
                SelectedTag::Existing(tag) => tag.id,
                SelectedTag::New { .. } => 0,
            })
            .collect();
        // Two mentions each, longer name first; then tokio once.
        assert_eq!(ids, [2, 1, 5]);
    }

    #[test]
    fn at_most_five_tags() {
        let explicit: Vec<String> = (0..8).map(|x| format!("tag{x}")).collect();
        let selected = select_tags(&SuffixLemmatizer, &explicit, &[], "", "");
        assert_eq!(selected.len(), MAX_TAGS_PER_POST);
    }

    #[tokio::test]
    async fn tags_are_written_to_posts() {
        use crate::database::{tests::memory_db, NewPost, RawPostData};

        let db = memory_db().await;
        db.create_tag("Rust", "rust").await.unwrap();
        let (author, _) = db.get_or_create_author("chan", "", None).await.unwrap();
        let id = db
            .insert_post(&NewPost {
                author_id: author.id,
                message_id: 1,
                title: "About Rust".to_string(),
                rubric_id: None,
                content: "rust".to_string(),
                source_url: String::new(),
                channel_url: String::new(),
                media_group_id: String::new(),
                is_pending: false,
                publish_at: None,
                raw_data: RawPostData::default(),
            })
            .await
            .unwrap();
        let post = db.post(id).await.unwrap().unwrap();

        apply_post_tags(&db, &SuffixLemmatizer, &post, &["Новинка".to_string()])
            .await
            .unwrap();

        let names: Vec<String> = db
            .post_tags(id)
            .await
            .unwrap()
            .into_iter()
            .map(|x| x.name)
            .collect();
        assert_eq!(names, ["Новинка", "Rust"]);
        assert_eq!(db.all_tags().await.unwrap().len(), 2);
    }
}
