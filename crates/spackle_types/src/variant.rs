use std::{
    collections::BTreeSet,
    fmt::{self, Display, Formatter},
};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::Spec;

/// The value of a variant on a spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariantValue {
    /// A boolean variant, written `+name` or `~name`.
    Bool(bool),

    /// A single-valued variant, written `name=value`.
    Single(String),

    /// A multi-valued variant, written `name=a,b`.
    Multi(BTreeSet<String>),
}

impl VariantValue {
    /// Parses the right-hand side of `name=value`.
    pub fn from_assignment(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "true" => return VariantValue::Bool(true),
            "false" => return VariantValue::Bool(false),
            _ => {}
        }
        if value.contains(',') {
            VariantValue::Multi(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(ToOwned::to_owned)
                    .collect(),
            )
        } else {
            VariantValue::Single(value.to_string())
        }
    }

    /// Returns the values as they appear in the solver facts. Boolean variants use `True` and
    /// `False`.
    pub fn values(&self) -> Vec<String> {
        match self {
            VariantValue::Bool(true) => vec!["True".to_string()],
            VariantValue::Bool(false) => vec!["False".to_string()],
            VariantValue::Single(value) => vec![value.clone()],
            VariantValue::Multi(values) => values.iter().cloned().collect(),
        }
    }

    /// Returns true if every value required by `other` is present in `self`.
    pub fn satisfies(&self, other: &VariantValue) -> bool {
        let ours: BTreeSet<String> = self.values().into_iter().collect();
        other.values().iter().all(|v| ours.contains(v))
    }

    /// Returns true if both values can hold at the same time on a single-valued variant.
    pub fn intersects(&self, other: &VariantValue) -> bool {
        match (self, other) {
            (VariantValue::Multi(_), _) | (_, VariantValue::Multi(_)) => true,
            _ => self.values() == other.values(),
        }
    }
}

/// Formats a variant the way it is written in a spec string.
pub(crate) fn format_variant(f: &mut Formatter<'_>, name: &str, value: &VariantValue) -> fmt::Result {
    match value {
        VariantValue::Bool(true) => write!(f, "+{name}"),
        VariantValue::Bool(false) => write!(f, "~{name}"),
        VariantValue::Single(value) => write!(f, " {name}={value}"),
        VariantValue::Multi(values) => write!(f, " {name}={}", values.iter().format(",")),
    }
}

impl Display for VariantValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.values().iter().format(","))
    }
}

/// The values a variant accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllowedValues {
    /// Any string is accepted.
    Any,

    /// Only the listed values are accepted.
    Set(Vec<String>),
}

/// How many values a variant holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum VariantKind {
    /// `True` or `False`.
    Bool,
    /// Exactly one value.
    Single,
    /// One or more values.
    Multi,
}

/// A variant declared by a package.
///
/// A package may declare the same variant name several times with different conditions. Where
/// conditions overlap, the definition registered last wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantDefinition {
    /// The name of the variant.
    pub name: String,
    /// The kind of variant.
    pub kind: VariantKind,
    /// The default value(s).
    pub default: Vec<String>,
    /// The values the variant accepts.
    pub values: AllowedValues,
    /// A sticky variant keeps its default unless a value is explicitly requested.
    pub sticky: bool,
    /// The definition only applies when the package matches this anonymous spec.
    pub when: Option<Spec>,
    /// Human readable description.
    pub description: String,
}

impl VariantDefinition {
    /// A boolean variant with the given default.
    pub fn boolean(name: impl Into<String>, default: bool) -> Self {
        Self {
            name: name.into(),
            kind: VariantKind::Bool,
            default: vec![if default { "True" } else { "False" }.to_string()],
            values: AllowedValues::Set(vec!["True".to_string(), "False".to_string()]),
            sticky: false,
            when: None,
            description: String::new(),
        }
    }

    /// A single-valued variant.
    pub fn single<I, S>(name: impl Into<String>, default: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            kind: VariantKind::Single,
            default: vec![default.into()],
            values: AllowedValues::Set(values.into_iter().map(Into::into).collect()),
            sticky: false,
            when: None,
            description: String::new(),
        }
    }

    /// A multi-valued variant.
    pub fn multi<I, S, D>(name: impl Into<String>, default: D, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        D: IntoIterator<Item = S>,
    {
        Self {
            name: name.into(),
            kind: VariantKind::Multi,
            default: default.into_iter().map(Into::into).collect(),
            values: AllowedValues::Set(values.into_iter().map(Into::into).collect()),
            sticky: false,
            when: None,
            description: String::new(),
        }
    }

    /// Accept any value for this variant.
    pub fn with_any_value(mut self) -> Self {
        self.values = AllowedValues::Any;
        self
    }

    /// Make the variant sticky.
    pub fn sticky(mut self) -> Self {
        self.sticky = true;
        self
    }

    /// Restrict the definition to packages matching `when`.
    pub fn when(mut self, when: Spec) -> Self {
        self.when = Some(when);
        self
    }

    /// Returns true if the value is accepted by this definition.
    pub fn accepts(&self, value: &str) -> bool {
        match &self.values {
            AllowedValues::Any => true,
            AllowedValues::Set(values) => values.iter().any(|v| v == value),
        }
    }

    /// Builds the [`VariantValue`] for the given solver values according to the kind of this
    /// definition.
    pub fn value_from_strings<I, S>(&self, values: I) -> VariantValue
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let values: BTreeSet<String> = values
            .into_iter()
            .map(|v| v.as_ref().to_string())
            .collect();
        match self.kind {
            VariantKind::Bool => VariantValue::Bool(values.contains("True")),
            VariantKind::Single => match values.into_iter().next() {
                Some(value) => VariantValue::Single(value),
                None => VariantValue::Single(self.default.first().cloned().unwrap_or_default()),
            },
            VariantKind::Multi => VariantValue::Multi(values),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{VariantDefinition, VariantValue};

    #[test]
    fn test_from_assignment() {
        assert_eq!(VariantValue::from_assignment("True"), VariantValue::Bool(true));
        assert_eq!(
            VariantValue::from_assignment("static"),
            VariantValue::Single("static".to_string())
        );
        assert_eq!(
            VariantValue::from_assignment("a,b").values(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn test_satisfies() {
        let multi = VariantValue::from_assignment("a,b");
        assert!(multi.satisfies(&VariantValue::Single("a".into())));
        assert!(!VariantValue::Single("a".into()).satisfies(&multi));
        assert!(VariantValue::Bool(true).satisfies(&VariantValue::Bool(true)));
        assert!(!VariantValue::Bool(true).intersects(&VariantValue::Bool(false)));
    }

    #[test]
    fn test_value_from_strings() {
        let def = VariantDefinition::boolean("shared", true);
        assert_eq!(def.value_from_strings(["False"]), VariantValue::Bool(false));
        let def = VariantDefinition::multi("langs", ["c"], ["c", "cxx", "fortran"]);
        assert_eq!(
            def.value_from_strings(["cxx", "c"]),
            VariantValue::from_assignment("c,cxx")
        );
        assert!(def.accepts("fortran"));
        assert!(!def.accepts("rust"));
    }
}
