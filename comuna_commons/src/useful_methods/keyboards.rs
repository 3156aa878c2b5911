use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};

/// Lay out callback buttons into rows of at most `per_row` buttons each.
///
/// Each item is a `(label, callback data)` pair. A `per_row` of 0 is treated
/// as 1.
pub fn callback_rows<L, D>(
    buttons: impl IntoIterator<Item = (L, D)>,
    per_row: usize,
) -> Vec<Vec<InlineKeyboardButton>>
where
    L: Into<String>,
    D: Into<String>,
{
    let per_row = per_row.max(1);
    let mut rows = Vec::new();
    let mut row = Vec::with_capacity(per_row);

    for (label, data) in buttons {
        row.push(InlineKeyboardButton::callback(label, data));
        if row.len() == per_row {
            rows.push(std::mem::replace(&mut row, Vec::with_capacity(per_row)));
        }
    }

    if !row.is_empty() {
        rows.push(row);
    }

    rows
}

/// Convenience function around [`callback_rows`] that produces a whole
/// keyboard.
pub fn callback_keyboard<L, D>(
    buttons: impl IntoIterator<Item = (L, D)>,
    per_row: usize,
) -> InlineKeyboardMarkup
where
    L: Into<String>,
    D: Into<String>,
{
    InlineKeyboardMarkup::new(callback_rows(buttons, per_row))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn rows_are_filled_left_to_right() {
        let rows = callback_rows([("a", "1"), ("b", "2"), ("c", "3")], 2);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].len(), 2);
        assert_eq!(rows[1].len(), 1);
        assert_eq!(rows[1][0].text, "c");
    }

    #[test]
    fn zero_per_row_means_one_per_row() {
        let rows = callback_rows([("a", "1"), ("b", "2")], 0);
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn empty_input_gives_no_rows() {
        let rows = callback_rows(Vec::<(String, String)>::new(), 2);
        assert!(rows.is_empty());
    }
}
