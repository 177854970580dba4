// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topic Pattern Matching
//!
//! Routing keys are dot-separated segments. In a subscription pattern `*`
//! matches exactly one segment made of alphanumeric or underscore characters,
//! and `#` matches zero or more whole segments. A pattern is compiled once into
//! an anchored regular expression and reused for every inbound message.

use crate::errors::BusError;
use regex::Regex;
use std::fmt;

const STAR_SEGMENT: &str = "[A-Za-z0-9_]*";
const ANY_SEGMENT: &str = "[^.]*";

/// A compiled topic subscription pattern.
///
/// Equality and `Debug` only look at the pattern text, never at the compiled
/// expression.
#[derive(Clone)]
pub struct TopicPattern {
    source: String,
    regex: Regex,
}

impl TopicPattern {
    /// Compiles a subscription pattern.
    ///
    /// # Parameters
    /// * `pattern` - Dot-separated pattern, e.g. `orders.*.created` or `eu.#`
    ///
    /// # Returns
    /// The compiled pattern, or [`BusError::ConfigError`] if the expression
    /// built from it is rejected by the regex engine.
    pub fn new(pattern: &str) -> Result<TopicPattern, BusError> {
        Ok(TopicPattern {
            source: pattern.to_owned(),
            regex: compile(pattern)?,
        })
    }

    /// The pattern text this matcher was compiled from.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Tests a routing key against the pattern.
    ///
    /// # Parameters
    /// * `routing_key` - Routing key of an inbound message
    ///
    /// # Returns
    /// `true` when the whole key matches; partial matches never count.
    pub fn matches(&self, routing_key: &str) -> bool {
        self.regex.is_match(routing_key)
    }
}

impl fmt::Debug for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TopicPattern").field(&self.source).finish()
    }
}

impl PartialEq for TopicPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for TopicPattern {}

/// One-shot helper; prefer [`TopicPattern`] when matching repeatedly.
///
/// A pattern that fails to compile matches nothing.
pub fn matches(pattern: &str, routing_key: &str) -> bool {
    TopicPattern::new(pattern).is_ok_and(|compiled| compiled.matches(routing_key))
}

fn compile(pattern: &str) -> Result<Regex, BusError> {
    let segments: Vec<&str> = pattern.split('.').collect();
    let mut expr = String::from("^");
    // A separator is owed once at least one concrete segment has been emitted.
    let mut owes_dot = false;

    for (idx, segment) in segments.iter().enumerate() {
        let last = idx + 1 == segments.len();

        match *segment {
            "#" if owes_dot => {
                expr.push_str(&format!(r"(?:\.{})*", ANY_SEGMENT));
            }
            "#" if last => {
                expr.push_str(".*");
            }
            "#" => {
                expr.push_str(&format!(r"(?:{}\.)*", ANY_SEGMENT));
            }
            "*" => {
                if owes_dot {
                    expr.push_str(r"\.");
                }
                expr.push_str(STAR_SEGMENT);
                owes_dot = true;
            }
            literal => {
                if owes_dot {
                    expr.push_str(r"\.");
                }
                expr.push_str(&regex::escape(literal));
                owes_dot = true;
            }
        }
    }

    expr.push('$');

    Regex::new(&expr).map_err(|err| {
        BusError::ConfigError(format!("topic pattern `{}`", pattern), err.to_string())
    })
}
