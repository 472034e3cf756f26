//! # Label Selectors
//!
//! A builder over `kube`'s label selector types. A [`Selector`] is a
//! conjunction of [`Requirement`]s; it renders to the API server's selector
//! syntax for list calls and can be evaluated locally against a label map.

use kube::core::{Expression, Selector as LabelSelector, SelectorExt};
use std::collections::BTreeMap;
use std::fmt;

pub type Labels = BTreeMap<String, String>;

/// One label expression
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Requirement(Expression);

/// Selects objects whose labels satisfy every requirement.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Requirement {
    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self(Expression::Equal(key.into(), value.into()))
    }

    pub fn not_equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self(Expression::NotEqual(key.into(), value.into()))
    }

    pub fn is_in<I, S>(key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(Expression::In(
            key.into(),
            values.into_iter().map(Into::into).collect(),
        ))
    }

    pub fn not_in<I, S>(key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(Expression::NotIn(
            key.into(),
            values.into_iter().map(Into::into).collect(),
        ))
    }

    pub fn exists(key: impl Into<String>) -> Self {
        Self(Expression::Exists(key.into()))
    }

    pub fn does_not_exist(key: impl Into<String>) -> Self {
        Self(Expression::DoesNotExist(key.into()))
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        std::iter::once(self.0.clone())
            .collect::<LabelSelector>()
            .matches(labels)
    }
}

impl From<Requirement> for Expression {
    fn from(requirement: Requirement) -> Self {
        requirement.0
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selector matching every label in `map` exactly
    pub fn from_map<'a>(map: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        map.into_iter()
            .map(|(k, v)| Requirement::equals(k, v))
            .collect()
    }

    #[must_use]
    pub fn and(mut self, requirement: Requirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// The same conjunction as `kube`'s selector, for `ListParams::labels_from`
    pub fn to_label_selector(&self) -> LabelSelector {
        self.requirements.iter().cloned().map(Expression::from).collect()
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.to_label_selector().matches(labels)
    }

    /// Match against optional object labels (absent labels are an empty map)
    pub fn matches_opt(&self, labels: Option<&Labels>) -> bool {
        match labels {
            Some(labels) => self.matches(labels),
            None => self.matches(&Labels::new()),
        }
    }
}

impl FromIterator<Requirement> for Selector {
    fn from_iter<T: IntoIterator<Item = Requirement>>(iter: T) -> Self {
        Self {
            requirements: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.to_label_selector().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_matches() {
        for (selector, labels, matches, msg) in [
            (Selector::new(), labels(&[]), true, "empty selector matches all"),
            (
                Selector::from_map([("foo", "bar")]),
                labels(&[("foo", "bar"), ("bah", "baz")]),
                true,
                "sufficient label match",
            ),
            (
                Selector::from_map([("foo", "bar")]),
                labels(&[("foo", "other")]),
                false,
                "value mismatch",
            ),
            (
                Selector::new().and(Requirement::is_in("t", ["a", "b"])),
                labels(&[("t", "b")]),
                true,
                "in match",
            ),
            (
                Selector::new().and(Requirement::is_in("t", ["a", "b"])),
                labels(&[]),
                false,
                "in requires key",
            ),
            (
                Selector::new().and(Requirement::not_in("t", ["a"])),
                labels(&[]),
                true,
                "notin matches absent key",
            ),
            (
                Selector::new().and(Requirement::not_equals("t", "a")),
                labels(&[("t", "a")]),
                false,
                "not equals excludes value",
            ),
            (
                Selector::new().and(Requirement::exists("t")),
                labels(&[("t", "")]),
                true,
                "exists with empty value",
            ),
            (
                Selector::new().and(Requirement::does_not_exist("t")),
                labels(&[("t", "x")]),
                false,
                "does not exist",
            ),
            (
                Selector::new()
                    .and(Requirement::equals("component", "server"))
                    .and(Requirement::is_in("rbac", ["resource-management"])),
                labels(&[("component", "server"), ("rbac", "app-management")]),
                false,
                "conjunction requires every requirement",
            ),
        ] {
            assert_eq!(selector.matches(&labels), matches, "{msg}");
        }
    }

    #[test]
    fn test_display_renders_api_syntax() {
        let selector = Selector::new()
            .and(Requirement::equals("component", "server"))
            .and(Requirement::is_in("rbac", ["b", "a"]))
            .and(Requirement::not_in("x", ["y"]))
            .and(Requirement::exists("e"))
            .and(Requirement::does_not_exist("d"))
            .and(Requirement::not_equals("n", "v"));
        assert_eq!(
            selector.to_string(),
            "component=server,rbac in (a,b),x notin (y),e,!d,n!=v"
        );
    }

    #[test]
    fn test_requirement_matches_on_its_own() {
        assert!(Requirement::equals("t", "a").matches(&labels(&[("t", "a")])));
        assert!(!Requirement::exists("t").matches(&labels(&[])));
    }

    #[test]
    fn test_matches_opt_treats_missing_labels_as_empty() {
        let selector = Selector::new().and(Requirement::does_not_exist("k"));
        assert!(selector.matches_opt(None));
    }
}
