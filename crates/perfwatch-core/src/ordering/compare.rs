//! Dotted-version-aware revision comparison.

use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'a> {
    /// Digits with leading zeros stripped.
    Number(&'a str),
    Text(&'a str),
}

impl<'a> Token<'a> {
    fn parse(raw: &'a str) -> Self {
        if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
            let trimmed = raw.trim_start_matches('0');
            Token::Number(if trimmed.is_empty() { "0" } else { trimmed })
        } else {
            Token::Text(raw)
        }
    }
}

impl Ord for Token<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            // Arbitrary-width integers: longer is larger.
            (Token::Number(a), Token::Number(b)) => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
            (Token::Number(_), Token::Text(_)) => Ordering::Less,
            (Token::Text(_), Token::Number(_)) => Ordering::Greater,
            (Token::Text(a), Token::Text(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for Token<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Compares one field value. Values are split on `.`; purely numeric tokens
/// compare as integers, everything else as strings, and a value that is a
/// prefix of another sorts first. Surrounding whitespace is ignored. Values
/// that tie token-wise (`1.02` vs `1.2`) fall back to plain string order so
/// the ordering stays total.
pub fn compare_values(a: &str, b: &str) -> Ordering {
    let (ta, tb) = (a.trim(), b.trim());
    ta.split('.')
        .map(Token::parse)
        .cmp(tb.split('.').map(Token::parse))
        .then_with(|| ta.cmp(tb))
        .then_with(|| a.cmp(b))
}

/// Compares two revisions field by field in ordinal order.
pub fn compare_revisions<A, B>(a: &[A], b: &[B]) -> Ordering
where
    A: AsRef<str>,
    B: AsRef<str>,
{
    for (x, y) in a.iter().zip(b.iter()) {
        match compare_values(x.as_ref(), y.as_ref()) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_versions_compare_numerically() {
        assert_eq!(compare_values("1.2.9", "1.2.10"), Ordering::Less);
        assert_eq!(compare_values("1.2.10", "1.3"), Ordering::Less);
        assert_eq!(compare_values("10", "9"), Ordering::Greater);
        assert_eq!(compare_values("1.2", "1.2.0"), Ordering::Less);
    }

    #[test]
    fn text_tokens_compare_lexicographically() {
        assert_eq!(compare_values("1.rc1", "1.rc2"), Ordering::Less);
        assert_eq!(compare_values("1.beta", "1.alpha"), Ordering::Greater);
        // Numbers sort before words.
        assert_eq!(compare_values("1.5", "1.rc"), Ordering::Less);
    }

    #[test]
    fn leading_zeros_tie_break_on_text() {
        assert_eq!(compare_values("007", "7"), Ordering::Less);
        assert_eq!(compare_values("12345678901234567890", "9"), Ordering::Greater);
    }

    #[test]
    fn multi_field_revisions_use_ordinal_order() {
        assert_eq!(compare_revisions(&["1", "9"], &["1", "10"]), Ordering::Less);
        assert_eq!(compare_revisions(&["2", "0"], &["1", "99"]), Ordering::Greater);
        assert_eq!(compare_revisions(&["1", "1"], &["1", "1"]), Ordering::Equal);
    }
}
