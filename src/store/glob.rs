//! Shell-style glob patterns for bulk key resets.
//!
//! Supported syntax:
//! - `*` matches any run of characters (including none)
//! - `?` matches exactly one character
//! - `[abc]`, `[a-z]`, `[^a-z]` / `[!a-z]` match one character from a class
//! - `\x` matches `x` literally, both inside and outside classes
//!
//! `*` does not stop at `/`. Matching is per character, not per byte, and
//! every backend filters keys through [`Pattern::matches`] so a pattern
//! selects the same keys everywhere.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TollgateError};

#[derive(Debug, Clone, PartialEq, Eq)]
enum ClassItem {
    Single(char),
    Range(char, char),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(char),
    AnyChar,
    AnyRun,
    Class { negated: bool, items: Vec<ClassItem> },
}

impl Token {
    fn matches_char(&self, c: char) -> bool {
        match self {
            Token::Literal(l) => *l == c,
            Token::AnyChar => true,
            Token::AnyRun => false,
            Token::Class { negated, items } => {
                let hit = items.iter().any(|item| match *item {
                    ClassItem::Single(s) => s == c,
                    ClassItem::Range(lo, hi) => lo <= c && c <= hi,
                });
                hit != *negated
            }
        }
    }
}

/// A compiled glob pattern.
///
/// Deserializes from a string, failing on malformed patterns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Pattern {
    source: String,
    tokens: Vec<Token>,
}

impl Pattern {
    /// Compile a pattern, rejecting unterminated classes, empty classes,
    /// inverted ranges and trailing escapes.
    pub fn new(pattern: &str) -> Result<Self> {
        let invalid = |reason: &str| TollgateError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        let mut tokens = Vec::new();
        let mut chars = pattern.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '*' => {
                    // Consecutive stars are equivalent to one
                    if tokens.last() != Some(&Token::AnyRun) {
                        tokens.push(Token::AnyRun);
                    }
                }
                '?' => tokens.push(Token::AnyChar),
                '\\' => {
                    let escaped = chars.next().ok_or_else(|| invalid("trailing escape"))?;
                    tokens.push(Token::Literal(escaped));
                }
                '[' => {
                    let negated = matches!(chars.peek(), Some('^') | Some('!'));
                    if negated {
                        chars.next();
                    }

                    let mut items = Vec::new();
                    let mut closed = false;
                    while let Some(c) = chars.next() {
                        let lo = match c {
                            ']' if items.is_empty() => return Err(invalid("empty character class")),
                            ']' => {
                                closed = true;
                                break;
                            }
                            '-' => return Err(invalid("unescaped '-' in character class")),
                            '\\' => chars.next().ok_or_else(|| invalid("trailing escape"))?,
                            other => other,
                        };

                        if chars.peek() == Some(&'-') {
                            chars.next();
                            let hi = match chars.next() {
                                None => return Err(invalid("unterminated character class")),
                                Some(']') | Some('-') => {
                                    return Err(invalid("incomplete range in character class"))
                                }
                                Some('\\') => {
                                    chars.next().ok_or_else(|| invalid("trailing escape"))?
                                }
                                Some(other) => other,
                            };
                            if lo > hi {
                                return Err(invalid("inverted range in character class"));
                            }
                            items.push(ClassItem::Range(lo, hi));
                        } else {
                            items.push(ClassItem::Single(lo));
                        }
                    }

                    if !closed {
                        return Err(invalid("unterminated character class"));
                    }
                    tokens.push(Token::Class { negated, items });
                }
                other => tokens.push(Token::Literal(other)),
            }
        }

        Ok(Self {
            source: pattern.to_string(),
            tokens,
        })
    }

    /// The pattern text as given.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// The literal text every matching key starts with.
    pub fn literal_prefix(&self) -> String {
        self.tokens
            .iter()
            .map_while(|token| match token {
                Token::Literal(c) => Some(*c),
                _ => None,
            })
            .collect()
    }

    /// Whether `text` matches the whole pattern.
    pub fn matches(&self, text: &str) -> bool {
        let chars: Vec<char> = text.chars().collect();
        let mut t = 0;
        let mut p = 0;
        // (token index after the last star, text index it is currently absorbing up to)
        let mut backtrack: Option<(usize, usize)> = None;

        while t < chars.len() {
            if let Some(token) = self.tokens.get(p) {
                if *token == Token::AnyRun {
                    backtrack = Some((p + 1, t));
                    p += 1;
                    continue;
                }
                if token.matches_char(chars[t]) {
                    p += 1;
                    t += 1;
                    continue;
                }
            }

            match backtrack {
                Some((after_star, absorbed)) => {
                    p = after_star;
                    t = absorbed + 1;
                    backtrack = Some((after_star, absorbed + 1));
                }
                None => return false,
            }
        }

        self.tokens[p..].iter().all(|token| *token == Token::AnyRun)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl TryFrom<String> for Pattern {
    type Error = TollgateError;

    fn try_from(pattern: String) -> Result<Self> {
        Pattern::new(&pattern)
    }
}

impl From<Pattern> for String {
    fn from(pattern: Pattern) -> Self {
        pattern.source
    }
}

/// Compile `pattern` and test it against `text` in one step.
pub fn matches(pattern: &str, text: &str) -> Result<bool> {
    Ok(Pattern::new(pattern)?.matches(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(pattern: &str, text: &str) -> bool {
        matches(pattern, text).unwrap()
    }

    #[test]
    fn test_literal_patterns() {
        assert!(m("user:123", "user:123"));
        assert!(!m("user:123", "user:1234"));
        assert!(!m("user:123", "user:12"));
        assert!(m("", ""));
        assert!(!m("", "a"));
    }

    #[test]
    fn test_star_matches_any_run() {
        assert!(m("api:*", "api:"));
        assert!(m("api:*", "api:endpoint:get"));
        assert!(!m("api:*", "user:123"));
        assert!(m("*:get", "api:users:get"));
        assert!(m("a*b*c", "aXXbYYc"));
        assert!(!m("a*b*c", "aXXbYY"));
        assert!(m("ip:*", "ip:10.0.0.1/32"));
        assert!(m("**", "anything"));
    }

    #[test]
    fn test_question_mark_matches_one_char() {
        assert!(m("user:?", "user:1"));
        assert!(!m("user:?", "user:12"));
        assert!(!m("user:?", "user:"));
        assert!(m("user:??", "user:é1"));
    }

    #[test]
    fn test_character_classes() {
        assert!(m("user:[0-9]", "user:7"));
        assert!(!m("user:[0-9]", "user:x"));
        assert!(m("user:[^0-9]", "user:x"));
        assert!(m("user:[!0-9]", "user:x"));
        assert!(!m("user:[!0-9]", "user:3"));
        assert!(m("[abc]pi:*", "api:x"));
        assert!(m("[a-cx-z]", "y"));
        assert!(!m("[a-cx-z]", "m"));
    }

    #[test]
    fn test_escapes() {
        assert!(m("literal\\*", "literal*"));
        assert!(!m("literal\\*", "literalX"));
        assert!(m("[\\]]", "]"));
        assert!(m("[\\-]", "-"));
    }

    #[test]
    fn test_malformed_patterns_rejected() {
        for bad in ["[", "[abc", "[]", "[^]", "abc\\", "[z-a]", "[a-]", "[-a]"] {
            let err = Pattern::new(bad).unwrap_err();
            assert!(
                matches!(err, TollgateError::InvalidPattern { .. }),
                "expected {:?} to be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_literal_prefix() {
        let prefix = |p: &str| Pattern::new(p).unwrap().literal_prefix();
        assert_eq!(prefix("api:*"), "api:");
        assert_eq!(prefix("t:[!a]x"), "t:");
        assert_eq!(prefix("user:??"), "user:");
        assert_eq!(prefix("a\\*b*"), "a*b");
        assert_eq!(prefix("*"), "");
        assert_eq!(prefix("exact"), "exact");
    }

    #[test]
    fn test_backtracking_star() {
        assert!(m("*ab", "aaab"));
        assert!(m("*a*a*a", "aaa"));
        assert!(!m("*a*a*a*a", "aaa"));
    }
}
