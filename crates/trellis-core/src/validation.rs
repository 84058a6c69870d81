// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Commit-time validation and structured violation reports.
use std::fmt;

use rustc_hash::FxHashSet;

use crate::graph::GraphStore;
use crate::ident::{ObjectId, TypeName};
use crate::permission::grant_bits;
use crate::record::{keys, NodeRecord, RelationshipRecord};
use crate::schema::{
    NodeType, PropertyDef, PropertyFormat, PropertyKind, Schema, CONTAINS, OWNS, SECURITY,
};
use crate::security::Permissions;
use crate::value::Value;

/// Kind of a validation failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ViolationKind {
    /// Required property missing or empty.
    Required,
    /// Value already held by another node.
    Unique,
    /// String value does not match the declared format.
    Format,
    /// Value kind differs from the declared kind, or an endpoint has the wrong type.
    TypeMismatch,
    /// Property not declared on a closed type.
    UnknownProperty,
    /// A required relationship is missing.
    MissingRelationship,
    /// Reported by a custom validator.
    Custom(String),
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Required => f.write_str("must not be empty"),
            Self::Unique => f.write_str("already taken"),
            Self::Format => f.write_str("invalid format"),
            Self::TypeMismatch => f.write_str("wrong type"),
            Self::UnknownProperty => f.write_str("unknown property"),
            Self::MissingRelationship => f.write_str("missing required relationship"),
            Self::Custom(msg) => f.write_str(msg),
        }
    }
}

/// One validation failure.
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorToken {
    /// Type of the failing object.
    pub type_name: TypeName,
    /// The failing object, when known.
    pub object: Option<ObjectId>,
    /// Failing property (or relationship type for constraint failures).
    pub property: Option<String>,
    /// What went wrong.
    pub kind: ViolationKind,
    /// Offending value.
    pub value: Option<Value>,
}

impl ErrorToken {
    /// Token for `node`.
    pub fn for_node(node: &NodeRecord, property: Option<&str>, kind: ViolationKind) -> Self {
        Self {
            type_name: node.ty.clone(),
            object: Some(node.id),
            property: property.map(str::to_owned),
            kind,
            value: property.and_then(|p| node.property(p).cloned()),
        }
    }
}

impl fmt::Display for ErrorToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name)?;
        if let Some(property) = &self.property {
            write!(f, ".{property}")?;
        }
        write!(f, " {}", self.kind)?;
        if let Some(value) = &self.value {
            write!(f, " ({value})")?;
        }
        Ok(())
    }
}

/// Non-empty collection of [`ErrorToken`]s.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ValidationReport {
    tokens: Vec<ErrorToken>,
}

impl ValidationReport {
    /// All tokens in discovery order.
    pub fn tokens(&self) -> &[ErrorToken] {
        &self.tokens
    }

    /// Returns `true` if any token has `kind`.
    pub fn has(&self, kind: &ViolationKind) -> bool {
        self.tokens.iter().any(|t| &t.kind == kind)
    }
}

impl From<Vec<ErrorToken>> for ValidationReport {
    fn from(tokens: Vec<ErrorToken>) -> Self {
        Self { tokens }
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, token) in self.tokens.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{token}")?;
        }
        Ok(())
    }
}

/// Loose `local@domain.tld` check.
pub fn is_email(s: &str) -> bool {
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !s.chars().any(char::is_whitespace)
        && !domain.contains('@')
        && domain.contains('.')
        && domain.split('.').all(|label| !label.is_empty())
}

/// Checks a single value against its definition.
pub fn check_value(def: &PropertyDef, value: &Value) -> Option<ViolationKind> {
    let kind_ok = match (&def.kind, value) {
        (PropertyKind::String, Value::String(_))
        | (PropertyKind::Bool, Value::Bool(_))
        | (PropertyKind::Date, Value::Date(_))
        | (PropertyKind::Int, Value::Int(_))
        | (PropertyKind::Long, Value::Long(_) | Value::Int(_))
        | (PropertyKind::Double, Value::Double(_) | Value::Int(_) | Value::Long(_))
        | (PropertyKind::Ref, Value::Ref(_))
        | (PropertyKind::RefList, Value::RefList(_)) => true,
        (PropertyKind::Enum(allowed), Value::Enum(v) | Value::String(v)) => {
            return (!allowed.contains(v)).then_some(ViolationKind::Format);
        }
        _ => false,
    };
    if !kind_ok {
        return Some(ViolationKind::TypeMismatch);
    }
    match (def.format, value) {
        (Some(PropertyFormat::Email), Value::String(s)) if !is_email(s) => {
            Some(ViolationKind::Format)
        }
        _ => None,
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::String(s) | Value::Enum(s) => s.is_empty(),
        Value::RefList(ids) => ids.is_empty(),
        _ => false,
    }
}

/// Relationship constraints of `node` that fail when the relationships in
/// `removed` are ignored.
pub fn relationship_constraint_violations(
    schema: &Schema,
    store: &GraphStore,
    node: &NodeRecord,
    removed: &FxHashSet<ObjectId>,
) -> Vec<ErrorToken> {
    schema
        .constraints_of(node.ty.as_str())
        .filter(|c| {
            !store
                .relationships_by_type(&node.id, c.rel_type.as_str(), c.direction)
                .any(|r| !removed.contains(&r.id))
        })
        .map(|c| ErrorToken {
            type_name: node.ty.clone(),
            object: Some(node.id),
            property: Some(c.rel_type.to_string()),
            kind: ViolationKind::MissingRelationship,
            value: None,
        })
        .collect()
}

/// Validates one node against its type: declared kinds and formats,
/// required and unique properties, relationship constraints and custom
/// validators.
pub fn validate_node(schema: &Schema, store: &GraphStore, node: &NodeRecord) -> Vec<ErrorToken> {
    let mut tokens = Vec::new();
    let closed = schema
        .node_type(node.ty.as_str())
        .is_some_and(NodeType::is_closed);
    for (key, value) in &node.properties {
        match schema.property_def(node.ty.as_str(), key) {
            Some(def) => {
                if let Some(kind) = check_value(def, value) {
                    tokens.push(ErrorToken::for_node(node, Some(key.as_str()), kind));
                }
            }
            None if closed => {
                tokens.push(ErrorToken::for_node(
                    node,
                    Some(key.as_str()),
                    ViolationKind::UnknownProperty,
                ));
            }
            None => {}
        }
    }
    for (key, def) in schema.properties_of(node.ty.as_str()) {
        let value = node.property(key);
        if def.required && value.is_none_or(is_empty_value) {
            tokens.push(ErrorToken::for_node(node, Some(key), ViolationKind::Required));
        }
        if def.unique {
            if let Some(value) = value {
                if is_taken(schema, store, node, key, value) {
                    tokens.push(ErrorToken::for_node(node, Some(key), ViolationKind::Unique));
                }
            }
        }
    }
    tokens.extend(relationship_constraint_violations(
        schema,
        store,
        node,
        &FxHashSet::default(),
    ));
    for validator in schema.validators_of(node.ty.as_str()) {
        tokens.extend(validator(node, store));
    }
    tokens
}

/// Uniqueness is scoped to the type that declares the property, including
/// all of its subtypes.
fn is_taken(schema: &Schema, store: &GraphStore, node: &NodeRecord, key: &str, value: &Value) -> bool {
    let scope = schema
        .ancestors(node.ty.as_str())
        .find(|t| t.properties().contains_key(key))
        .map_or_else(|| node.ty.clone(), |t| t.name().clone());
    schema.subtypes_of(scope.as_str()).iter().any(|ty| {
        store
            .nodes_of_type(ty)
            .any(|other| other.id != node.id && other.property(key) == Some(value))
    })
}

/// Validates one relationship: registered type, endpoint types, the
/// cardinality of system relationships and, for grants, the permission
/// bitmask.
pub fn validate_relationship(
    schema: &Schema,
    store: &GraphStore,
    rel: &RelationshipRecord,
) -> Vec<ErrorToken> {
    let token = |property: &str, kind: ViolationKind, value: Option<Value>| ErrorToken {
        type_name: rel.ty.clone(),
        object: Some(rel.id),
        property: Some(property.to_owned()),
        kind,
        value,
    };
    let Some(def) = schema.relationship_type(rel.ty.as_str()) else {
        return vec![token(keys::TYPE, ViolationKind::TypeMismatch, None)];
    };
    let mut tokens = Vec::new();
    for (end, expected, label) in [(rel.from, def.source(), "from"), (rel.to, def.target(), "to")] {
        let Some(expected) = expected.filter(|t| *t != "*") else {
            continue;
        };
        let ok = store
            .node(&end)
            .is_some_and(|n| schema.is_subtype(n.ty.as_str(), expected.as_str()));
        if !ok {
            tokens.push(token(label, ViolationKind::TypeMismatch, Some(Value::Ref(end))));
        }
    }
    if let Some(label) = duplicated(store, rel) {
        let end = if label == "to" { rel.to } else { rel.from };
        tokens.push(token(label, ViolationKind::Unique, Some(Value::Ref(end))));
    }
    if rel.ty == SECURITY {
        if let Some(raw) = rel.property(keys::ALLOWED) {
            let valid = raw.as_i64().is_some_and(|bits| Permissions::from_bits(bits).is_ok());
            if !valid || grant_bits(rel).is_empty() {
                tokens.push(token(keys::ALLOWED, ViolationKind::Format, Some(raw.clone())));
            }
        }
    }
    tokens
}

/// A node has at most one owner, and a principal at most one grant per
/// object and one membership per group. Returns the endpoint label of the
/// violated bound.
fn duplicated(store: &GraphStore, rel: &RelationshipRecord) -> Option<&'static str> {
    let same = |other: &RelationshipRecord| other.id != rel.id && other.ty == rel.ty;
    if rel.ty == OWNS {
        return store.incoming(&rel.to).any(same).then_some("to");
    }
    if rel.ty == SECURITY || rel.ty == CONTAINS {
        return store
            .outgoing(&rel.from)
            .any(|r| same(r) && r.to == rel.to)
            .then_some("from");
    }
    None
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn email_format() {
        assert!(is_email("alice@example.org"));
        assert!(is_email("a.b+c@mail.example.co"));
        for bad in ["", "alice", "@example.org", "alice@", "alice@org", "a b@x.io", "a@@x.io", "a@x..io"] {
            assert!(!is_email(bad), "{bad}");
        }
    }

    #[test]
    fn kinds_and_enums() {
        let long = PropertyDef::new(PropertyKind::Long);
        assert_eq!(check_value(&long, &Value::Int(3)), None);
        assert_eq!(
            check_value(&long, &Value::from("3")),
            Some(ViolationKind::TypeMismatch)
        );
        let status = PropertyDef::new(PropertyKind::Enum(vec!["open".into(), "done".into()]));
        assert_eq!(check_value(&status, &Value::Enum("open".into())), None);
        assert_eq!(
            check_value(&status, &Value::Enum("lost".into())),
            Some(ViolationKind::Format)
        );
    }

    #[test]
    fn report_display_joins_tokens() {
        let report = ValidationReport::from(vec![
            ErrorToken {
                type_name: "User".into(),
                object: None,
                property: Some("eMail".into()),
                kind: ViolationKind::Unique,
                value: Some(Value::from("a@b.io")),
            },
            ErrorToken {
                type_name: "Task".into(),
                object: None,
                property: None,
                kind: ViolationKind::Custom("bad".into()),
                value: None,
            },
        ]);
        assert_eq!(report.to_string(), "User.eMail already taken (a@b.io); Task bad");
        assert!(report.has(&ViolationKind::Unique));
    }
}
