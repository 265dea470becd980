//! Event-name pattern matching
//!
//! Patterns select which handler nodes see a message. An event name is a
//! sequence of dot-separated segments (`user.profile.update`); a pattern
//! is the same shape where a segment may also be one of two wildcards:
//!
//! - `*` matches exactly one segment
//! - `**` matches zero or more segments, dots included
//!
//! Patterns compile to anchored regular expressions once, at
//! registration time, and are matched per inbound message.

use std::fmt;

use regex::Regex;

use crate::error::Error;

/// Matches exactly one event segment.
pub const WILDCARD_SINGLE: &str = "*";

/// Matches zero or more event segments, including the empty suffix.
pub const WILDCARD_DEEP: &str = "**";

/// A compiled event-name pattern
///
/// Keeps the original pattern string for display and round-tripping.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    Single,
    Deep,
}

impl Pattern {
    /// Compile a pattern string
    ///
    /// Empty segments (leading, trailing or doubled dots) are dropped, so
    /// `a..b` compiles identically to `a.b`. The empty pattern matches
    /// only the empty event name.
    pub fn compile(pattern: &str) -> Result<Self, Error> {
        let segments = parse_segments(pattern);
        let expr = regex_from_segments(&segments);
        let regex = Regex::new(&expr).map_err(|source| Error::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    /// Test an event name against this pattern
    pub fn matches(&self, event: &str) -> bool {
        self.regex.is_match(event)
    }

    /// The pattern string this was compiled from
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn parse_segments(pattern: &str) -> Vec<Segment<'_>> {
    pattern
        .split('.')
        .filter(|part| !part.is_empty())
        .map(|part| match part {
            WILDCARD_SINGLE => Segment::Single,
            WILDCARD_DEEP => Segment::Deep,
            literal => Segment::Literal(literal),
        })
        .collect()
}

fn regex_from_segments(segments: &[Segment<'_>]) -> String {
    let mut expr = String::from("^");
    for (i, segment) in segments.iter().enumerate() {
        // The separator is omitted before a deep wildcard: `.*` absorbs
        // it, which is what lets `a.**` match the bare event `a`.
        if i > 0 && *segment != Segment::Deep {
            expr.push_str("\\.");
        }
        match segment {
            Segment::Literal(literal) => expr.push_str(&regex::escape(literal)),
            Segment::Single => expr.push_str("[^.]+"),
            Segment::Deep => expr.push_str(".*"),
        }
    }
    expr.push('$');
    expr
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, event: &str) -> bool {
        Pattern::compile(pattern).unwrap().matches(event)
    }

    #[test]
    fn test_literal_match() {
        assert!(matches("user.login", "user.login"));
        assert!(!matches("user.login", "user.logout"));
        assert!(!matches("user.login", "user.login.extra"));
    }

    #[test]
    fn test_single_wildcard_is_one_segment() {
        assert!(matches("user.*", "user.login"));
        assert!(!matches("user.*", "user"));
        assert!(!matches("user.*", "user.profile.update"));
    }

    #[test]
    fn test_deep_wildcard_matches_empty_suffix() {
        assert!(matches("a.**", "a"));
        assert!(matches("a.**", "a.b"));
        assert!(matches("a.**", "a.b.c"));
    }

    #[test]
    fn test_deep_wildcard_alone_matches_everything() {
        assert!(matches("**", ""));
        assert!(matches("**", "a"));
        assert!(matches("**", "a.b.c"));
    }

    #[test]
    fn test_deep_wildcard_in_middle() {
        assert!(matches("a.**.z", "a.z"));
        assert!(matches("a.**.z", "a.b.c.z"));
        assert!(!matches("a.**.z", "a.b.c"));
    }

    #[test]
    fn test_empty_segments_dropped() {
        assert!(matches("a..b", "a.b"));
        assert!(matches(".a.b.", "a.b"));
        let doubled = Pattern::compile("a..b").unwrap();
        let plain = Pattern::compile("a.b").unwrap();
        assert_eq!(doubled.matches("a.b"), plain.matches("a.b"));
        assert_eq!(doubled.matches("a..b"), plain.matches("a..b"));
    }

    #[test]
    fn test_empty_pattern_matches_only_empty_event() {
        assert!(matches("", ""));
        assert!(!matches("", "a"));
    }

    #[test]
    fn test_literal_segments_are_quoted() {
        assert!(matches("price.us$", "price.us$"));
        assert!(!matches("a+b", "aab"));
        assert!(matches("a+b", "a+b"));
    }

    #[test]
    fn test_round_trip() {
        for source in ["user.*", "a.**", "", "a..b", "**"] {
            let pattern = Pattern::compile(source).unwrap();
            assert_eq!(pattern.to_string(), source);
            assert_eq!(pattern.as_str(), source);
        }
    }
}
