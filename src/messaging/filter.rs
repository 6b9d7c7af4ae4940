//! Filter steps and the per-source filter chain.
//!
//! A chain is an ordered list of steps keyed by sideline identifier. A chain
//! *matches* a message iff any step matches (logical OR). Steps are plain
//! serde values so a persisted step re-hydrates to a structurally equal
//! predicate.

use std::sync::Arc;

use arc_swap::ArcSwap;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::messaging::Message;
use crate::sideline::SidelineId;

/// A pattern compiled once at construction. Compares and serializes by its
/// source string, so persisted steps re-hydrate to equal predicates.
#[derive(Debug, Clone)]
pub struct ValuePattern(Regex);

impl ValuePattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Regex::new(pattern).map(Self)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    fn is_match(&self, value: &str) -> bool {
        self.0.is_match(value)
    }
}

impl PartialEq for ValuePattern {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_str() == other.0.as_str()
    }
}

impl Serialize for ValuePattern {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.0.as_str())
    }
}

impl<'de> Deserialize<'de> for ValuePattern {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pattern = String::deserialize(deserializer)?;
        Self::new(&pattern).map_err(serde::de::Error::custom)
    }
}

/// A deterministic boolean predicate over a message's value tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterStep {
    /// True when the tuple value at `index` equals `value`.
    ValueEquals {
        index: usize,
        value: serde_json::Value,
    },
    /// True when the tuple value at `index` is a string matching `pattern`.
    ValueMatches { index: usize, pattern: ValuePattern },
    /// Negation wrapper around another step.
    Not { step: Box<FilterStep> },
}

impl FilterStep {
    pub fn value_equals(index: usize, value: impl Into<serde_json::Value>) -> Self {
        Self::ValueEquals {
            index,
            value: value.into(),
        }
    }

    /// Fails on an invalid pattern; steps never carry an uncompiled regex.
    pub fn value_matches(index: usize, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self::ValueMatches {
            index,
            pattern: ValuePattern::new(pattern)?,
        })
    }

    /// Wrap this step in a negation.
    pub fn negated(self) -> Self {
        Self::Not {
            step: Box::new(self),
        }
    }

    pub fn matches(&self, message: &Message) -> bool {
        match self {
            Self::ValueEquals { index, value } => {
                message.values.get(*index).is_some_and(|v| v == value)
            }
            Self::ValueMatches { index, pattern } => message
                .values
                .get(*index)
                .and_then(|v| v.as_str())
                .is_some_and(|value| pattern.is_match(value)),
            Self::Not { step } => !step.matches(message),
        }
    }
}

/// Ordered sequence of (identifier, steps) entries. Identifiers are unique;
/// removal by identifier removes all steps tagged with it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterChain {
    entries: Vec<(SidelineId, Vec<FilterStep>)>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if any step in the chain matches the message.
    pub fn matches(&self, message: &Message) -> bool {
        self.entries
            .iter()
            .flat_map(|(_, steps)| steps)
            .any(|step| step.matches(message))
    }

    /// Attach steps under an identifier. Re-attaching an existing identifier
    /// replaces its steps, keeping identifiers unique.
    pub fn add_steps(&mut self, id: SidelineId, steps: Vec<FilterStep>) {
        self.entries.retain(|(existing, _)| *existing != id);
        self.entries.push((id, steps));
    }

    pub fn remove_steps(&mut self, id: &SidelineId) -> Option<Vec<FilterStep>> {
        let position = self.entries.iter().position(|(existing, _)| existing == id)?;
        Some(self.entries.remove(position).1)
    }

    /// Look up an identifier by structural equality of its step list.
    pub fn find_by_value(&self, steps: &[FilterStep]) -> Option<SidelineId> {
        self.entries
            .iter()
            .find(|(_, existing)| existing.as_slice() == steps)
            .map(|(id, _)| id.clone())
    }

    pub fn steps(&self, id: &SidelineId) -> Option<&[FilterStep]> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == id)
            .map(|(_, steps)| steps.as_slice())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Copy-on-write view of a filter chain shared between the controller thread
/// and a source worker. Writers swap in a new snapshot; readers are
/// lock-free.
#[derive(Debug, Default)]
pub struct SharedFilterChain {
    chain: ArcSwap<FilterChain>,
}

impl SharedFilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn matches(&self, message: &Message) -> bool {
        self.chain.load().matches(message)
    }

    pub fn add_steps(&self, id: SidelineId, steps: Vec<FilterStep>) {
        let mut next = FilterChain::clone(&self.chain.load());
        next.add_steps(id, steps);
        self.chain.store(Arc::new(next));
    }

    pub fn remove_steps(&self, id: &SidelineId) -> Option<Vec<FilterStep>> {
        let mut next = FilterChain::clone(&self.chain.load());
        let removed = next.remove_steps(id)?;
        self.chain.store(Arc::new(next));
        Some(removed)
    }

    pub fn find_by_value(&self, steps: &[FilterStep]) -> Option<SidelineId> {
        self.chain.load().find_by_value(steps)
    }

    pub fn snapshot(&self) -> Arc<FilterChain> {
        self.chain.load_full()
    }

    pub fn len(&self) -> usize {
        self.chain.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.load().is_empty()
    }
}
