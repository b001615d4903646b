// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Pod label selectors.
//!
//! Input grammar: `NAME:K1OP1V1,K2OP2V2,...` where each segment is
//! `key==value`, `key=value` (same as `==`), `key!=value`, or a bare `key`
//! (existence check). Segments of one selector are AND-ed; multiple selectors
//! are OR-ed.

use std::collections::BTreeMap;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectorParseError {
    #[error("empty selector")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Bare key: the label key must exist.
    Exists,
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelPredicate {
    pub key: String,
    pub op: Op,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    pub name: String,
    pub predicates: Vec<LabelPredicate>,
}

impl Selector {
    pub fn parse(input: &str) -> Result<Self, SelectorParseError> {
        if input.is_empty() {
            return Err(SelectorParseError::Empty);
        }

        let (name, rest) = match input.split_once(':') {
            Some((name, rest)) => (name, Some(rest)),
            None => (input, None),
        };

        let mut predicates = Vec::new();
        if let Some(rest) = rest {
            for segment in rest.split(',') {
                predicates.push(parse_predicate(segment));
            }
        }

        Ok(Selector {
            name: name.to_string(),
            predicates,
        })
    }

    /// All predicates must hold. A selector with no predicates matches
    /// nothing.
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        if self.predicates.is_empty() {
            return false;
        }

        self.predicates.iter().all(|predicate| {
            let Some(value) = labels.get(&predicate.key) else {
                // Absent key fails every predicate, != included.
                return false;
            };
            match predicate.op {
                Op::Exists => true,
                Op::Eq => *value == predicate.value,
                Op::Ne => *value != predicate.value,
            }
        })
    }
}

fn parse_predicate(segment: &str) -> LabelPredicate {
    if let Some((key, value)) = segment.split_once("!=") {
        return LabelPredicate {
            key: key.to_string(),
            op: Op::Ne,
            value: value.to_string(),
        };
    }
    if let Some((key, value)) = segment.split_once("==") {
        return LabelPredicate {
            key: key.to_string(),
            op: Op::Eq,
            value: value.to_string(),
        };
    }
    if let Some((key, value)) = segment.split_once('=') {
        return LabelPredicate {
            key: key.to_string(),
            op: Op::Eq,
            value: value.to_string(),
        };
    }
    LabelPredicate {
        key: segment.to_string(),
        op: Op::Exists,
        value: String::new(),
    }
}

/// A disjunction of selectors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selectors(Vec<Selector>);

impl Selectors {
    pub fn parse_all(inputs: &[String]) -> Result<Self, SelectorParseError> {
        let selectors = inputs
            .iter()
            .map(|input| Selector::parse(input))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Selectors(selectors))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// At least one selector must match. An empty set matches nothing.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().any(|selector| selector.matches(labels))
    }
}
