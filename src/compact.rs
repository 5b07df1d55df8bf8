//! Compact Tuple Encoding
//!
//! Bindings and marker configurations travel from compiler to runtime as
//! fixed-shape JSON arrays of table indices:
//!
//! ```text
//! binding: [nameIdx, bindType, deps | null, exprOrHandlerId | null, extras?]
//! if:      [0, branch[]]        branch = [exprId | null, deps | null] | []
//! for:     [1, iteratorIdx, iterableExprId, hasEmpty, deps | null, trackByIdx | null]
//! text:    [2, exprId, deps | null, pipes | null]
//! switch:  [3, exprId, deps | null, case[]]    case = [isDefault, fallthrough, valueExprId | null]
//! break:   [4]
//! ```
//!
//! The Rust side is a closed set of types; serde impls go through `serde_json::Value`
//! so the wire shape is exactly the arrays above.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};

use crate::validate::BindingKind;

// ═══════════════════════════════════════════════════════════════════════════════
// DEPENDENCIES & PIPES
// ═══════════════════════════════════════════════════════════════════════════════

/// A dependency as string-table indices: one index for a bare name, a list for a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CompactDep {
    Simple(u32),
    Chain(Vec<u32>),
}

/// `[pipeNameIdx, argExprIds[]]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactPipe(pub u32, pub Vec<u32>);

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BindingExtras {
    /// Host property written back by a two-way binding.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub t: Option<String>,
    /// Extra host property to subscribe to.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub s: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub p: Option<Vec<CompactPipe>>,
}

impl BindingExtras {
    pub fn is_empty(&self) -> bool {
        self.t.is_none() && self.s.is_none() && self.p.is_none()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// VALUE HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

fn as_u32(value: &Value, what: &str) -> Result<u32, String> {
    value
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| format!("expected index for {}, found {}", what, value))
}

fn opt_u32(value: Option<&Value>, what: &str) -> Result<Option<u32>, String> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => as_u32(v, what).map(Some),
    }
}

fn as_bool(value: Option<&Value>, what: &str) -> Result<bool, String> {
    value
        .and_then(Value::as_bool)
        .ok_or_else(|| format!("expected boolean for {}", what))
}

fn as_array<'a>(value: &'a Value, what: &str) -> Result<&'a Vec<Value>, String> {
    value
        .as_array()
        .ok_or_else(|| format!("expected array for {}, found {}", what, value))
}

fn from_value<T: for<'de> Deserialize<'de>>(value: Value, what: &str) -> Result<T, String> {
    serde_json::from_value(value).map_err(|e| format!("invalid {}: {}", what, e))
}

fn deps_value(deps: &Option<Vec<CompactDep>>) -> Value {
    match deps {
        Some(deps) => json!(deps),
        None => Value::Null,
    }
}

fn opt_deps(value: Option<&Value>) -> Result<Option<Vec<CompactDep>>, String> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => from_value(v.clone(), "deps").map(Some),
    }
}

fn opt_pipes(value: Option<&Value>) -> Result<Option<Vec<CompactPipe>>, String> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => from_value(v.clone(), "pipes").map(Some),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMPACT BINDING
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub struct CompactBinding {
    pub name: u32,
    pub kind: BindingKind,
    pub deps: Option<Vec<CompactDep>>,
    /// Expression id, or handler id for events.
    pub id: Option<u32>,
    pub extras: Option<BindingExtras>,
}

impl CompactBinding {
    pub fn to_value(&self) -> Value {
        let mut tuple = vec![
            json!(self.name),
            json!(self.kind.code()),
            deps_value(&self.deps),
            self.id.map(|id| json!(id)).unwrap_or(Value::Null),
        ];
        if let Some(extras) = self.extras.as_ref().filter(|e| !e.is_empty()) {
            tuple.push(json!(extras));
        }
        Value::Array(tuple)
    }

    pub fn from_value(value: &Value) -> Result<Self, String> {
        let items = as_array(value, "binding")?;
        if items.len() < 4 {
            return Err(format!("binding tuple has {} elements, expected 4 or 5", items.len()));
        }
        let code = as_u32(&items[1], "binding type")?;
        let kind = u8::try_from(code)
            .ok()
            .and_then(BindingKind::from_code)
            .ok_or_else(|| format!("unknown binding type {}", code))?;
        let extras = match items.get(4) {
            None | Some(Value::Null) => None,
            Some(v) => Some(from_value::<BindingExtras>(v.clone(), "binding extras")?),
        };
        Ok(CompactBinding {
            name: as_u32(&items[0], "binding name")?,
            kind,
            deps: opt_deps(items.get(2))?,
            id: opt_u32(items.get(3), "binding expression")?,
            extras,
        })
    }
}

impl Serialize for CompactBinding {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CompactBinding {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        CompactBinding::from_value(&value).map_err(D::Error::custom)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MARKER CONFIGS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkerType {
    If,
    For,
    Text,
    Switch,
    Break,
}

impl MarkerType {
    pub fn code(self) -> u8 {
        match self {
            MarkerType::If => 0,
            MarkerType::For => 1,
            MarkerType::Text => 2,
            MarkerType::Switch => 3,
            MarkerType::Break => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(MarkerType::If),
            1 => Some(MarkerType::For),
            2 => Some(MarkerType::Text),
            3 => Some(MarkerType::Switch),
            4 => Some(MarkerType::Break),
            _ => None,
        }
    }

    /// Name used in the `fluff:<type>:<id>` comment sentinels.
    pub fn name(self) -> &'static str {
        match self {
            MarkerType::If => "if",
            MarkerType::For => "for",
            MarkerType::Text => "text",
            MarkerType::Switch => "switch",
            MarkerType::Break => "break",
        }
    }

    pub fn start_sentinel(self, id: u32) -> String {
        format!("fluff:{}:{}", self.name(), id)
    }

    pub fn end_sentinel(self, id: u32) -> String {
        format!("/fluff:{}:{}", self.name(), id)
    }
}

/// One `@if`/`@else if`/`@else` branch. An unconditional branch has neither field.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompactBranch {
    pub expr: Option<u32>,
    pub deps: Option<Vec<CompactDep>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompactCase {
    pub is_default: bool,
    pub fallthrough: bool,
    pub value: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompactMarkerConfig {
    If {
        branches: Vec<CompactBranch>,
    },
    For {
        iterator: u32,
        iterable: u32,
        has_empty: bool,
        deps: Option<Vec<CompactDep>>,
        track_by: Option<u32>,
    },
    Text {
        expr: u32,
        deps: Option<Vec<CompactDep>>,
        pipes: Option<Vec<CompactPipe>>,
    },
    Switch {
        expr: u32,
        deps: Option<Vec<CompactDep>>,
        cases: Vec<CompactCase>,
    },
    Break,
}

impl CompactMarkerConfig {
    pub fn marker_type(&self) -> MarkerType {
        match self {
            CompactMarkerConfig::If { .. } => MarkerType::If,
            CompactMarkerConfig::For { .. } => MarkerType::For,
            CompactMarkerConfig::Text { .. } => MarkerType::Text,
            CompactMarkerConfig::Switch { .. } => MarkerType::Switch,
            CompactMarkerConfig::Break => MarkerType::Break,
        }
    }

    pub fn to_value(&self) -> Value {
        let code = json!(self.marker_type().code());
        match self {
            CompactMarkerConfig::If { branches } => {
                let branches: Vec<Value> = branches
                    .iter()
                    .map(|b| {
                        if b.expr.is_none() && b.deps.is_none() {
                            json!([])
                        } else {
                            json!([b.expr, deps_value(&b.deps)])
                        }
                    })
                    .collect();
                json!([code, branches])
            }
            CompactMarkerConfig::For {
                iterator,
                iterable,
                has_empty,
                deps,
                track_by,
            } => json!([code, iterator, iterable, has_empty, deps_value(deps), track_by]),
            CompactMarkerConfig::Text { expr, deps, pipes } => {
                json!([code, expr, deps_value(deps), pipes])
            }
            CompactMarkerConfig::Switch { expr, deps, cases } => {
                let cases: Vec<Value> = cases
                    .iter()
                    .map(|c| json!([c.is_default, c.fallthrough, c.value]))
                    .collect();
                json!([code, expr, deps_value(deps), cases])
            }
            CompactMarkerConfig::Break => json!([code]),
        }
    }

    pub fn from_value(value: &Value) -> Result<Self, String> {
        let items = as_array(value, "marker config")?;
        let code = items
            .first()
            .map(|v| as_u32(v, "marker type"))
            .transpose()?
            .ok_or_else(|| "empty marker config".to_string())?;
        let marker_type = u8::try_from(code)
            .ok()
            .and_then(MarkerType::from_code)
            .ok_or_else(|| format!("unknown marker type {}", code))?;

        let field = |i: usize, what: &str| -> Result<&Value, String> {
            items
                .get(i)
                .ok_or_else(|| format!("{} marker is missing {}", marker_type.name(), what))
        };

        match marker_type {
            MarkerType::If => {
                let mut branches = Vec::new();
                for branch in as_array(field(1, "branches")?, "branches")? {
                    let parts = as_array(branch, "branch")?;
                    branches.push(CompactBranch {
                        expr: opt_u32(parts.first(), "branch condition")?,
                        deps: opt_deps(parts.get(1))?,
                    });
                }
                Ok(CompactMarkerConfig::If { branches })
            }
            MarkerType::For => Ok(CompactMarkerConfig::For {
                iterator: as_u32(field(1, "iterator")?, "iterator")?,
                iterable: as_u32(field(2, "iterable")?, "iterable")?,
                has_empty: as_bool(items.get(3), "hasEmpty")?,
                deps: opt_deps(items.get(4))?,
                track_by: opt_u32(items.get(5), "trackBy")?,
            }),
            MarkerType::Text => Ok(CompactMarkerConfig::Text {
                expr: as_u32(field(1, "expression")?, "expression")?,
                deps: opt_deps(items.get(2))?,
                pipes: opt_pipes(items.get(3))?,
            }),
            MarkerType::Switch => {
                let mut cases = Vec::new();
                for case in as_array(field(3, "cases")?, "cases")? {
                    let parts = as_array(case, "case")?;
                    cases.push(CompactCase {
                        is_default: as_bool(parts.first(), "isDefault")?,
                        fallthrough: as_bool(parts.get(1), "fallthrough")?,
                        value: opt_u32(parts.get(2), "case value")?,
                    });
                }
                Ok(CompactMarkerConfig::Switch {
                    expr: as_u32(field(1, "expression")?, "expression")?,
                    deps: opt_deps(items.get(2))?,
                    cases,
                })
            }
            MarkerType::Break => Ok(CompactMarkerConfig::Break),
        }
    }
}

impl Serialize for CompactMarkerConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CompactMarkerConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        CompactMarkerConfig::from_value(&value).map_err(D::Error::custom)
    }
}

/// `[markerId, config]` pairs in marker-id order.
pub type MarkerConfigEntries = Vec<(u32, CompactMarkerConfig)>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_wire_shape() {
        let binding = CompactBinding {
            name: 3,
            kind: BindingKind::TwoWay,
            deps: Some(vec![CompactDep::Simple(4), CompactDep::Chain(vec![5, 6])]),
            id: Some(7),
            extras: Some(BindingExtras {
                t: Some("query".into()),
                s: None,
                p: None,
            }),
        };
        assert_eq!(
            serde_json::to_value(&binding).unwrap(),
            json!([3, 2, [4, [5, 6]], 7, {"t": "query"}])
        );
    }

    #[test]
    fn test_ref_binding_has_no_extras() {
        let binding = CompactBinding {
            name: 0,
            kind: BindingKind::Ref,
            deps: None,
            id: None,
            extras: Some(BindingExtras::default()),
        };
        assert_eq!(binding.to_value(), json!([0, 5, null, null]));
    }

    #[test]
    fn test_marker_wire_shapes() {
        let if_config = CompactMarkerConfig::If {
            branches: vec![
                CompactBranch {
                    expr: Some(0),
                    deps: Some(vec![CompactDep::Simple(1)]),
                },
                CompactBranch::default(),
            ],
        };
        assert_eq!(if_config.to_value(), json!([0, [[0, [1]], []]]));

        let for_config = CompactMarkerConfig::For {
            iterator: 2,
            iterable: 1,
            has_empty: true,
            deps: None,
            track_by: None,
        };
        assert_eq!(for_config.to_value(), json!([1, 2, 1, true, null, null]));

        let text = CompactMarkerConfig::Text {
            expr: 4,
            deps: Some(vec![]),
            pipes: Some(vec![CompactPipe(9, vec![5])]),
        };
        assert_eq!(text.to_value(), json!([2, 4, [], [[9, [5]]]]));

        let switch = CompactMarkerConfig::Switch {
            expr: 0,
            deps: None,
            cases: vec![CompactCase {
                is_default: true,
                fallthrough: false,
                value: None,
            }],
        };
        assert_eq!(switch.to_value(), json!([3, 0, null, [[true, false, null]]]));
        assert_eq!(CompactMarkerConfig::Break.to_value(), json!([4]));
    }

    #[test]
    fn test_decode_hand_written_entries() {
        let entries: MarkerConfigEntries =
            serde_json::from_value(json!([[0, [0, [[1, null], []]]], [1, [4]]])).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1], (1, CompactMarkerConfig::Break));
        match &entries[0].1 {
            CompactMarkerConfig::If { branches } => {
                assert_eq!(branches[0].expr, Some(1));
                assert_eq!(branches[1], CompactBranch::default());
            }
            other => panic!("expected if config, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_bad_tuples() {
        assert!(CompactMarkerConfig::from_value(&json!([9])).is_err());
        assert!(CompactMarkerConfig::from_value(&json!([1, 0])).is_err());
        assert!(CompactBinding::from_value(&json!([0, 7, null, null])).is_err());
        assert!(CompactBinding::from_value(&json!([0, 1])).is_err());
    }

    #[test]
    fn test_sentinels() {
        assert_eq!(MarkerType::Switch.start_sentinel(3), "fluff:switch:3");
        assert_eq!(MarkerType::If.end_sentinel(0), "/fluff:if:0");
    }
}
