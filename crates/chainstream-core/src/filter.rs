//! Event type filter.
//!
//! Entries are either a bare event type (`"transfer"`) or a type qualified by
//! an attribute key (`"wasm:_contract_address"`). An event is kept when the
//! filter is empty or when any entry matches it.

use serde::{Deserialize, Serialize};

use crate::error::StreamError;
use crate::types::RawEvent;

/// A single parsed filter entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterRule {
    /// Matches on event type alone.
    Type(String),
    /// Matches on event type plus the presence of an attribute key.
    TypeWithAttribute { kind: String, key: String },
}

impl FilterRule {
    /// Parse one configuration entry.
    pub fn parse(entry: &str) -> Result<Self, StreamError> {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err(StreamError::Config("empty event filter entry".into()));
        }
        match entry.split_once(':') {
            None => Ok(Self::Type(entry.to_string())),
            Some((kind, key)) if !kind.is_empty() && !key.is_empty() => {
                Ok(Self::TypeWithAttribute {
                    kind: kind.to_string(),
                    key: key.to_string(),
                })
            }
            Some(_) => Err(StreamError::Config(format!(
                "malformed event filter entry '{entry}', expected 'type' or 'type:attributeKey'"
            ))),
        }
    }

    pub fn matches(&self, event: &RawEvent) -> bool {
        match self {
            Self::Type(kind) => event.kind == *kind,
            Self::TypeWithAttribute { kind, key } => event.kind == *kind && event.has_attribute(key),
        }
    }
}

/// Filter applied by the extractor to every raw event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    rules: Vec<FilterRule>,
}

impl EventFilter {
    /// A filter that keeps every event.
    pub fn all() -> Self {
        Self::default()
    }

    /// Build a filter from configuration entries.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self, StreamError> {
        let rules = entries
            .iter()
            .map(|e| FilterRule::parse(e.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[FilterRule] {
        &self.rules
    }

    /// Returns `true` if the filter keeps everything.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Returns `true` if `event` passes the filter.
    pub fn matches(&self, event: &RawEvent) -> bool {
        self.rules.is_empty() || self.rules.iter().any(|r| r.matches(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventAttribute;

    fn events() -> Vec<RawEvent> {
        vec![
            RawEvent {
                kind: "A".into(),
                attributes: vec![],
            },
            RawEvent {
                kind: "B".into(),
                attributes: vec![EventAttribute::new("x", "1")],
            },
            RawEvent {
                kind: "C".into(),
                attributes: vec![],
            },
        ]
    }

    fn kept(filter: &EventFilter) -> Vec<String> {
        events()
            .into_iter()
            .filter(|e| filter.matches(e))
            .map(|e| e.kind)
            .collect()
    }

    #[test]
    fn empty_filter_keeps_everything() {
        assert_eq!(kept(&EventFilter::all()), vec!["A", "B", "C"]);
        let parsed = EventFilter::parse::<&str>(&[]).unwrap();
        assert_eq!(kept(&parsed), vec!["A", "B", "C"]);
    }

    #[test]
    fn bare_type_entry() {
        let f = EventFilter::parse(&["A"]).unwrap();
        assert_eq!(kept(&f), vec!["A"]);
    }

    #[test]
    fn type_with_attribute_entry() {
        let f = EventFilter::parse(&["B:x"]).unwrap();
        assert_eq!(kept(&f), vec!["B"]);

        let missing_key = EventFilter::parse(&["B:y"]).unwrap();
        assert!(kept(&missing_key).is_empty());
    }

    #[test]
    fn entries_are_a_union() {
        let f = EventFilter::parse(&["A", "B:x"]).unwrap();
        assert_eq!(kept(&f), vec!["A", "B"]);
    }

    #[test]
    fn malformed_entries_rejected() {
        assert!(FilterRule::parse("").is_err());
        assert!(FilterRule::parse("type:").is_err());
        assert!(FilterRule::parse(":key").is_err());
        assert_eq!(
            FilterRule::parse("wasm:_contract_address").unwrap(),
            FilterRule::TypeWithAttribute {
                kind: "wasm".into(),
                key: "_contract_address".into()
            }
        );
    }
}
