//! Label selectors.
//!
//! Supported grammar (comma-joined requirements, all must hold):
//! `k=v`, `k==v`, `k!=v`, `k in (a,b)`, `k notin (a,b)`, `k`, `!k`.
//!
//! ```
//! use std::collections::BTreeMap;
//! use brokervisor::store::LabelSelector;
//!
//! let sel = LabelSelector::parse("state in (in_progress), instance_guid=i1").unwrap();
//! let mut labels = BTreeMap::new();
//! labels.insert("state".to_string(), "in_progress".to_string());
//! labels.insert("instance_guid".to_string(), "i1".to_string());
//! assert!(sel.matches(&labels));
//! ```

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{BrokerError, BrokerResult};
use crate::store::resource::{ResourceState, STATE_LABEL};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
            Requirement::In(k, vs) => labels.get(k).is_some_and(|l| vs.contains(l)),
            Requirement::NotIn(k, vs) => !labels.get(k).is_some_and(|l| vs.contains(l)),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::DoesNotExist(k) => !labels.contains_key(k),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Equals(k, v) => write!(f, "{k}={v}"),
            Requirement::NotEquals(k, v) => write!(f, "{k}!={v}"),
            Requirement::In(k, vs) => write!(f, "{k} in ({})", vs.join(",")),
            Requirement::NotIn(k, vs) => write!(f, "{k} notin ({})", vs.join(",")),
            Requirement::Exists(k) => write!(f, "{k}"),
            Requirement::DoesNotExist(k) => write!(f, "!{k}"),
        }
    }
}

/// Conjunction of label requirements. The empty selector matches everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    #[must_use]
    pub fn and(mut self, req: Requirement) -> Self {
        self.requirements.push(req);
        self
    }

    pub fn eq(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::default().and(Requirement::Equals(key.into(), value.into()))
    }

    /// `state in (a,b,...)`.
    pub fn state_in(states: &[ResourceState]) -> Self {
        let values = states.iter().map(|s| s.as_str().to_string()).collect();
        Self::default().and(Requirement::In(STATE_LABEL.to_string(), values))
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }

    /// Parses the textual selector form.
    pub fn parse(input: &str) -> BrokerResult<Self> {
        let mut requirements = Vec::new();
        for part in split_top_level(input)? {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            requirements.push(parse_requirement(part)?);
        }
        Ok(Self { requirements })
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.requirements.iter().map(|r| r.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

fn split_top_level(input: &str) -> BrokerResult<Vec<&str>> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| malformed(input, "unbalanced ')'"))?;
            }
            ',' if depth == 0 => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(malformed(input, "unbalanced '('"));
    }
    parts.push(&input[start..]);
    Ok(parts)
}

fn parse_requirement(part: &str) -> BrokerResult<Requirement> {
    if let Some(key) = part.strip_prefix('!') {
        return Ok(Requirement::DoesNotExist(key_of(part, key)?));
    }
    if let Some((k, v)) = part.split_once("!=") {
        return Ok(Requirement::NotEquals(key_of(part, k)?, v.trim().to_string()));
    }
    if let Some((k, v)) = part.split_once("==") {
        return Ok(Requirement::Equals(key_of(part, k)?, v.trim().to_string()));
    }
    if let Some((k, v)) = part.split_once('=') {
        return Ok(Requirement::Equals(key_of(part, k)?, v.trim().to_string()));
    }
    if let Some((k, rest)) = part.split_once(" notin ") {
        return Ok(Requirement::NotIn(key_of(part, k)?, set_of(part, rest)?));
    }
    if let Some((k, rest)) = part.split_once(" in ") {
        return Ok(Requirement::In(key_of(part, k)?, set_of(part, rest)?));
    }
    Ok(Requirement::Exists(key_of(part, part)?))
}

fn key_of(part: &str, key: &str) -> BrokerResult<String> {
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return Err(malformed(part, "invalid key"));
    }
    Ok(key.to_string())
}

fn set_of(part: &str, rest: &str) -> BrokerResult<Vec<String>> {
    let inner = rest
        .trim()
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(|| malformed(part, "expected '(...)'"))?;
    Ok(inner
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .collect())
}

fn malformed(input: &str, why: &str) -> BrokerError {
    BrokerError::bad_request(format!("malformed label selector '{input}': {why}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_all_operators() {
        let sel = LabelSelector::parse("a=1, b==2, c!=3, d in (x, y), e notin (z), f, !g").unwrap();
        assert_eq!(
            sel.requirements(),
            &[
                Requirement::Equals("a".into(), "1".into()),
                Requirement::Equals("b".into(), "2".into()),
                Requirement::NotEquals("c".into(), "3".into()),
                Requirement::In("d".into(), vec!["x".into(), "y".into()]),
                Requirement::NotIn("e".into(), vec!["z".into()]),
                Requirement::Exists("f".into()),
                Requirement::DoesNotExist("g".into()),
            ]
        );
        let l = labels(&[("a", "1"), ("b", "2"), ("d", "y"), ("f", "")]);
        assert!(sel.matches(&l));
    }

    #[test]
    fn test_state_in_matches_label() {
        let sel = LabelSelector::state_in(&[ResourceState::InProgress, ResourceState::InQueue]);
        assert_eq!(sel.to_string(), "state in (in_progress,in_queue)");
        assert!(sel.matches(&labels(&[("state", "in_queue")])));
        assert!(!sel.matches(&labels(&[("state", "succeeded")])));
        assert!(!sel.matches(&labels(&[])));
    }

    #[test]
    fn test_malformed_selectors_are_bad_requests() {
        for bad in ["a in (x", "a in x", "x y", "=v"] {
            let err = LabelSelector::parse(bad).unwrap_err();
            assert_eq!(err.as_label(), "bad_request", "{bad}");
        }
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        let sel = LabelSelector::parse("").unwrap();
        assert!(sel.is_empty());
        assert!(sel.matches(&labels(&[("k", "v")])));
    }
}
