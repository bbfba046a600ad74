use anyhow::{bail, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

/// A set of key/value labels attached to an endpoint or profile.
///
/// Shared via `Arc`: the indexes hold many handles to the same label set
/// without copying it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Labels(Arc<Map>);

pub type Map = BTreeMap<String, String>;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
pub struct Expression {
    key: String,
    operator: Operator,
    values: Option<BTreeSet<String>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// A predicate over an endpoint's effective labels. Every `match_labels`
/// entry must be present with exactly that value and every expression must
/// hold; a selector with no constraints at all matches every endpoint.
#[derive(Clone, Debug, Eq, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    match_labels: Option<Map>,
    match_expressions: Option<Vec<Expression>>,
}

/// Returns the IP set ID for a tag: a stable short hash of `("t", tag)`.
pub fn tag_set_id(tag: &str) -> String {
    make_unique_id("t", tag)
}

/// Hashes `seed` down to a short, collision-resistant identifier.
fn make_unique_id(prefix: &str, seed: &str) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    let encoded = URL_SAFE_NO_PAD.encode(digest);
    format!("{}:{}", prefix, &encoded[..16])
}

// === impl Selector ===

impl Selector {
    pub fn new(labels: Map, exprs: Vec<Expression>) -> Self {
        Self {
            match_labels: Some(labels),
            match_expressions: Some(exprs),
        }
    }

    pub fn from_expressions(exprs: Vec<Expression>) -> Self {
        Self {
            match_labels: None,
            match_expressions: Some(exprs),
        }
    }

    /// True when the selector places no constraints, i.e. it matches every
    /// endpoint.
    pub fn selects_all(&self) -> bool {
        let exact = self.match_labels.as_ref().map_or(0, Map::len);
        let exprs = self.match_expressions.as_ref().map_or(0, Vec::len);
        exact + exprs == 0
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        let exact_ok = self
            .match_labels
            .iter()
            .flatten()
            .all(|(key, want)| labels.get(key) == Some(want.as_str()));
        exact_ok
            && self
                .match_expressions
                .iter()
                .flatten()
                .all(|expr| expr.holds_for(labels))
    }

    /// Checks every expression for an operator/values mismatch.
    ///
    /// Selectors arrive pre-parsed from the datastore, so this is the only
    /// way one can be unusable.
    pub fn validate(&self) -> Result<()> {
        for expr in self.match_expressions.iter().flatten() {
            expr.validate()?;
        }
        Ok(())
    }

    /// Returns a stable short identifier derived from the selector's
    /// canonical form.
    ///
    /// Structurally different selectors with the same canonical form (e.g.
    /// reordered expressions, `None` vs empty maps) share an ID, so the rule
    /// scanner refcounts them as one.
    pub fn unique_id(&self) -> String {
        let canonical = Selector {
            match_labels: Some(self.match_labels.clone().unwrap_or_default()),
            match_expressions: Some({
                let mut exprs = self.match_expressions.clone().unwrap_or_default();
                exprs.sort();
                exprs
            }),
        };
        let seed = serde_json::to_string(&canonical).expect("selector serializes to JSON");
        make_unique_id("s", &seed)
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        let labels = iter
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        Self {
            match_labels: Some(labels),
            match_expressions: None,
        }
    }
}

impl std::iter::FromIterator<Expression> for Selector {
    fn from_iter<T: IntoIterator<Item = Expression>>(iter: T) -> Self {
        Self::from_expressions(iter.into_iter().collect())
    }
}

// === impl Labels ===

impl Labels {
    /// True when no labels are set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Looks up a single label's value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Iterates the labels in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl From<Map> for Labels {
    fn from(labels: Map) -> Self {
        Self(Arc::new(labels))
    }
}

impl std::iter::FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Map::from_iter(iter).into()
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self(Arc::new(
            iter.into_iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect(),
        ))
    }
}

impl Serialize for Labels {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.as_ref().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Labels {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Map::deserialize(deserializer).map(|m| Self(Arc::new(m)))
    }
}

// === impl Expression ===

impl Expression {
    pub fn new(key: impl ToString, operator: Operator, values: Option<BTreeSet<String>>) -> Self {
        Self {
            key: key.to_string(),
            operator,
            values,
        }
    }

    /// Whether the expression holds for the given label set. An expression
    /// `validate` would reject holds for nothing.
    fn holds_for(&self, labels: &Labels) -> bool {
        let value = labels.get(&self.key);
        match (self.operator, self.values.as_ref()) {
            (Operator::In, Some(wanted)) => value.is_some_and(|v| wanted.contains(v)),
            (Operator::NotIn, Some(wanted)) => !value.is_some_and(|v| wanted.contains(v)),
            (Operator::Exists, None) => value.is_some(),
            (Operator::DoesNotExist, None) => value.is_none(),
            _ => false,
        }
    }

    fn validate(&self) -> Result<()> {
        match (self.operator, self.values.as_ref()) {
            (Operator::In | Operator::NotIn, None) => {
                bail!("{:?} expression on {:?} needs a value set", self.operator, self.key)
            }
            (Operator::In | Operator::NotIn, Some(values)) if values.is_empty() => {
                bail!("{:?} expression on {:?} needs a value set", self.operator, self.key)
            }
            (Operator::Exists | Operator::DoesNotExist, Some(_)) => {
                bail!("{:?} expression on {:?} takes no values", self.operator, self.key)
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&'static str, &'static str)]) -> Labels {
        pairs.iter().copied().collect()
    }

    fn values(vs: &[&str]) -> Option<BTreeSet<String>> {
        Some(vs.iter().map(|v| v.to_string()).collect())
    }

    #[test]
    fn exact_labels_are_a_subset_requirement() {
        let sel: Selector = [("role", "db")].into_iter().collect();
        assert!(sel.matches(&labels(&[("role", "db")])));
        assert!(sel.matches(&labels(&[("role", "db"), ("env", "prod")])));
        assert!(!sel.matches(&labels(&[("role", "web")])));
        assert!(!sel.matches(&labels(&[])));
    }

    #[test]
    fn empty_selector_matches_everything() {
        assert!(Selector::default().selects_all());
        assert!(Selector::default().matches(&labels(&[("anything", "at-all")])));
        assert!(Selector::new(Map::new(), vec![]).selects_all());
        assert!(!Selector::new(Map::from([("role".into(), "db".into())]), vec![]).selects_all());
    }

    #[test]
    fn expression_operators() {
        let labelled = labels(&[("role", "db"), ("env", "prod")]);

        let in_expr = Expression::new("env", Operator::In, values(&["prod", "staging"]));
        assert!(in_expr.holds_for(&labelled));
        assert!(!in_expr.holds_for(&labels(&[("env", "dev")])));
        // An absent key is never In.
        assert!(!in_expr.holds_for(&labels(&[])));

        let not_in = Expression::new("env", Operator::NotIn, values(&["dev"]));
        assert!(not_in.holds_for(&labelled));
        // ...but it is always NotIn.
        assert!(not_in.holds_for(&labels(&[])));
        assert!(!not_in.holds_for(&labels(&[("env", "dev")])));

        assert!(Expression::new("role", Operator::Exists, None).holds_for(&labelled));
        assert!(!Expression::new("zone", Operator::Exists, None).holds_for(&labelled));
        assert!(Expression::new("zone", Operator::DoesNotExist, None).holds_for(&labelled));
    }

    #[test]
    fn labels_and_expressions_are_conjunctive() {
        let sel = Selector::new(
            Map::from([("role".to_string(), "db".to_string())]),
            vec![Expression::new("env", Operator::In, values(&["prod"]))],
        );
        assert!(sel.matches(&labels(&[("role", "db"), ("env", "prod")])));
        assert!(!sel.matches(&labels(&[("role", "db"), ("env", "staging")])));
        assert!(!sel.matches(&labels(&[("env", "prod")])));
    }

    #[test]
    fn label_accessors() {
        let set = labels(&[("role", "db"), ("env", "prod")]);
        assert!(!set.is_empty());
        assert!(Labels::default().is_empty());
        assert_eq!(set.get("role"), Some("db"));
        assert_eq!(set.get("zone"), None);
        let pairs: Vec<(&str, &str)> = set.iter().collect();
        assert_eq!(pairs, [("env", "prod"), ("role", "db")]);
    }

    #[test]
    fn unique_id_is_canonical() {
        let a = Selector::from_expressions(vec![
            Expression::new("env", Operator::Exists, None),
            Expression::new("role", Operator::Exists, None),
        ]);
        let b = Selector::new(
            Map::new(),
            vec![
                Expression::new("role", Operator::Exists, None),
                Expression::new("env", Operator::Exists, None),
            ],
        );
        assert_eq!(a.unique_id(), b.unique_id());

        let c: Selector = [("role", "db")].into_iter().collect();
        assert_ne!(a.unique_id(), c.unique_id());
        assert!(a.unique_id().starts_with("s:"));
    }

    #[test]
    fn empty_forms_share_an_id() {
        let explicit = Selector::new(Map::new(), vec![]);
        assert_eq!(Selector::default().unique_id(), explicit.unique_id());
    }

    #[test]
    fn tag_ids_are_stable_and_distinct() {
        assert_eq!(tag_set_id("prod"), tag_set_id("prod"));
        assert_ne!(tag_set_id("prod"), tag_set_id("staging"));
        assert!(tag_set_id("prod").starts_with("t:"));
    }

    #[test]
    fn validate_rejects_operator_value_mismatches() {
        let missing_values = Selector::from_expressions(vec![Expression::new(
            "role",
            Operator::In,
            None,
        )]);
        assert!(missing_values.validate().is_err());
        assert!(!missing_values.matches(&labels(&[("role", "db")])));

        let empty_values = Selector::from_expressions(vec![Expression::new(
            "role",
            Operator::NotIn,
            values(&[]),
        )]);
        assert!(empty_values.validate().is_err());

        let stray_values = Selector::from_expressions(vec![Expression::new(
            "role",
            Operator::Exists,
            values(&["db"]),
        )]);
        assert!(stray_values.validate().is_err());

        let ok: Selector = [("role", "db")].into_iter().collect();
        assert!(ok.validate().is_ok());
    }
}
