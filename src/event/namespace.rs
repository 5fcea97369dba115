//! # Namespace Matching
//!
//! Event names are dot-separated namespaces such as `support.tickets.new`.
//! Subscriptions use patterns over the same syntax, where the segment `any`
//! is a wildcard.
//!
//! ## Matching Rules
//!
//! - A literal segment must equal the event-name segment at that position.
//!   Comparison is case-sensitive.
//! - `any` absorbs **one or more** consecutive segments. Spans are chosen with
//!   backtracking, so `any.critical` finds `critical` wherever it sits.
//! - A pattern containing at least one wildcard is open-ended: once all of its
//!   segments are consumed, any remaining suffix of the name is tolerated.
//! - A pattern without wildcards matches only the identical name.
//!
//! | Pattern | Name | Result |
//! |---|---|---|
//! | `support.any` | `support.tickets.new` | match |
//! | `support.any` | `support` | no match |
//! | `any.critical` | `system.critical.memory` | match |
//! | `support.tickets` | `support.tickets.new` | no match |

use std::{fmt, str::FromStr, sync::Arc};

use super::event_bus::{EventError, EventResult};

/// The wildcard segment token.
pub const WILDCARD: &str = "any";
/// Separator between namespace segments.
pub const SEPARATOR: char = '.';

/// An immutable, validated event name.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventName {
    raw: Arc<str>,
    segments: Arc<[String]>,
}

impl EventName {
    pub fn parse(input: &str) -> EventResult<Self> {
        let segments = split_segments(input).map_err(|reason| EventError::InvalidEventName {
            name: input.to_string(),
            reason,
        })?;
        Ok(Self {
            raw: Arc::from(input),
            segments: segments.into(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The first segment, e.g. `support` for `support.tickets.new`.
    pub fn root(&self) -> &str {
        // parse guarantees at least one segment
        self.segments.first().map(String::as_str).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl fmt::Debug for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventName({})", self.raw)
    }
}

impl FromStr for EventName {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for EventName {
    type Error = EventError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PatternSegment {
    Literal(String),
    Wildcard,
}

/// A subscription pattern. Immutable once parsed.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Pattern {
    raw: Arc<str>,
    segments: Arc<[PatternSegment]>,
    has_wildcard: bool,
}

impl Pattern {
    pub fn parse(input: &str) -> EventResult<Self> {
        let segments = split_segments(input).map_err(|reason| EventError::InvalidPattern {
            pattern: input.to_string(),
            reason,
        })?;
        let segments: Vec<PatternSegment> = segments
            .into_iter()
            .map(|segment| {
                if segment == WILDCARD {
                    PatternSegment::Wildcard
                } else {
                    PatternSegment::Literal(segment)
                }
            })
            .collect();
        let has_wildcard = segments
            .iter()
            .any(|segment| matches!(segment, PatternSegment::Wildcard));
        Ok(Self {
            raw: Arc::from(input),
            segments: segments.into(),
            has_wildcard,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[PatternSegment] {
        &self.segments
    }

    pub fn has_wildcard(&self) -> bool {
        self.has_wildcard
    }

    pub fn matches(&self, name: &EventName) -> bool {
        matches(self, name)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pattern({})", self.raw)
    }
}

impl FromStr for Pattern {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Decides whether `pattern` matches `name`.
///
/// Pure and deterministic. Runs in `O(pattern_len * name_len)` by tracking,
/// after each pattern segment, the set of name positions that some assignment
/// of wildcard spans can reach. This explores the same assignments a
/// backtracking matcher would, without the exponential worst case.
pub fn matches(pattern: &Pattern, name: &EventName) -> bool {
    let segments = name.segments();

    // Only wildcard patterns tolerate trailing segments; literal patterns
    // name exactly one event.
    if !pattern.has_wildcard() {
        return pattern.segments().len() == segments.len()
            && pattern
                .segments()
                .iter()
                .zip(segments)
                .all(|(p, s)| matches!(p, PatternSegment::Literal(lit) if lit == s));
    }

    let n = segments.len();
    let mut reachable = vec![false; n + 1];
    reachable[0] = true;

    for segment in pattern.segments() {
        let mut next = vec![false; n + 1];
        match segment {
            PatternSegment::Literal(literal) => {
                for position in 0..n {
                    if reachable[position] && segments[position] == *literal {
                        next[position + 1] = true;
                    }
                }
            }
            PatternSegment::Wildcard => {
                let mut open = false;
                for end in 1..=n {
                    open |= reachable[end - 1];
                    next[end] = open;
                }
            }
        }
        if !next.contains(&true) {
            return false;
        }
        reachable = next;
    }

    // open-ended: any reachable position may absorb the rest of the name
    reachable.contains(&true)
}

fn split_segments(input: &str) -> Result<Vec<String>, String> {
    if input.is_empty() {
        return Err("name is empty".to_string());
    }
    input
        .split(SEPARATOR)
        .enumerate()
        .map(|(position, segment)| {
            if segment.is_empty() {
                Err(format!("empty segment at position {}", position))
            } else if segment.chars().any(char::is_whitespace) {
                Err(format!("segment '{}' contains whitespace", segment))
            } else {
                Ok(segment.to_string())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn check(pattern: &str, name: &str) -> bool {
        matches(
            &Pattern::parse(pattern).unwrap(),
            &EventName::parse(name).unwrap(),
        )
    }

    #[test]
    fn test_trailing_wildcard() {
        assert!(check("support.any", "support.tickets.new"));
        assert!(check("support.any", "support.tickets"));
        assert!(!check("support.any", "development.tasks.assigned"));
        assert!(!check("support.any", "support"));
    }

    #[test]
    fn test_leading_wildcard() {
        assert!(check("any.critical", "system.critical.memory"));
        assert!(check("any.critical", "alerts.critical.disk"));
        assert!(check("any.critical", "a.b.critical"));
        assert!(!check("any.critical", "critical"));
        assert!(!check("any.critical", "critical.memory"));
        assert!(!check("any.critical", "system.warning.memory"));
    }

    #[test]
    fn test_medial_wildcard() {
        assert!(check("support.any.closed", "support.tickets.closed"));
        assert!(check("support.any.closed", "support.tickets.t1.closed"));
        assert!(!check("support.any.closed", "support.closed"));
        assert!(check("any.any", "a.b"));
        assert!(!check("any.any", "a"));
    }

    #[test]
    fn test_exact_pattern() {
        assert!(check("support.tickets", "support.tickets"));
        assert!(!check("support.tickets", "support.tickets.new"));
        assert!(!check("support.tickets", "Support.tickets"));
        assert!(!check("support.tickets.new", "support.tickets"));
    }

    #[test]
    fn test_backtracking_over_repeated_literals() {
        // the first `x` must not be committed to greedily
        assert!(check("any.x.y", "x.x.y"));
        assert!(check("any.x.any.y", "a.x.b.x.c.y"));
        assert!(!check("any.x.any.y", "a.x.y"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(matches!(
            Pattern::parse(""),
            Err(EventError::InvalidPattern { .. })
        ));
        assert!(matches!(
            Pattern::parse("support..new"),
            Err(EventError::InvalidPattern { .. })
        ));
        assert!(matches!(
            Pattern::parse("support.tickets."),
            Err(EventError::InvalidPattern { .. })
        ));
        assert!(matches!(
            Pattern::parse("support.new tickets"),
            Err(EventError::InvalidPattern { .. })
        ));
        assert!(matches!(
            EventName::parse(".support"),
            Err(EventError::InvalidEventName { .. })
        ));
    }

    #[test]
    fn test_event_name_accessors() {
        let name = EventName::parse("support.tickets.new").unwrap();
        assert_eq!(name.root(), "support");
        assert_eq!(name.len(), 3);
        assert_eq!(name.to_string(), "support.tickets.new");
        assert_eq!(
            name.segments(),
            &["support".to_string(), "tickets".to_string(), "new".to_string()]
        );
    }

    fn segment() -> impl Strategy<Value = String> {
        "[a-z]{1,6}"
    }

    fn name() -> impl Strategy<Value = String> {
        prop::collection::vec(segment(), 1..6).prop_map(|s| s.join("."))
    }

    fn pattern() -> impl Strategy<Value = String> {
        prop::collection::vec(
            prop_oneof![segment(), Just(WILDCARD.to_string())],
            1..5,
        )
        .prop_map(|s| s.join("."))
    }

    proptest! {
        #[test]
        fn prop_matching_is_deterministic(p in pattern(), n in name()) {
            let p = Pattern::parse(&p).unwrap();
            let n = EventName::parse(&n).unwrap();
            let first = matches(&p, &n);
            for _ in 0..3 {
                prop_assert_eq!(matches(&p, &n), first);
            }
        }

        #[test]
        fn prop_name_matches_itself(n in name()) {
            prop_assume!(!n.split('.').any(|s| s == WILDCARD));
            let pattern = Pattern::parse(&n).unwrap();
            prop_assert!(matches(&pattern, &EventName::parse(&n).unwrap()));
        }

        #[test]
        fn prop_bare_wildcard_matches_everything(n in name()) {
            let pattern = Pattern::parse(WILDCARD).unwrap();
            prop_assert!(matches(&pattern, &EventName::parse(&n).unwrap()));
        }

        #[test]
        fn prop_prefix_wildcard_matches_extensions(prefix in name(), suffix in name()) {
            let pattern = Pattern::parse(&format!("{}.{}", prefix, WILDCARD)).unwrap();
            let extended = EventName::parse(&format!("{}.{}", prefix, suffix)).unwrap();
            prop_assert!(matches(&pattern, &extended));
            let bare = EventName::parse(&prefix).unwrap();
            prop_assert!(!matches(&pattern, &bare));
        }
    }
}
