//! Condition Node data model.
//!
//! A condition is a leaf (one field compared against values), an AND/OR
//! tree node, or a constant folded during rewriting (`TrueCondition` /
//! `FalseCondition`). Nodes are immutable once built; rewrites return a new
//! node or the same `Arc`.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use log::debug;
use once_cell::sync::Lazy;
use serde_json::Value;

use crate::definition::{Definition, DefinitionPath};
use crate::error::{FilterError, Result};

/// Metadata channel: name → condition (`Error`, `Arguments`, ...)
pub type PropertyConditions = IndexMap<String, Arc<ConditionNode>>;

/// Placeholder prefix, as in `$parStatus` or `$curRep`
pub const PLACEHOLDER_PREFIX: &str = "$";
/// Prefix of named parameters
pub const PARAMETER_PREFIX: &str = "$par";
/// Unnamed parameter
pub const UNNAMED_PARAMETER: &str = "$parValue";
/// Comparisons after this marker are numeric
pub const COMPARE_NUMBER_MARKER: &str = "$compareNumber";
/// Property condition carrying the error message key
pub const ERROR_PROPERTY: &str = "Error";

pub fn is_placeholder(value: &str) -> bool {
    value.starts_with(PLACEHOLDER_PREFIX)
}

pub fn is_parameter(value: &str) -> bool {
    value.starts_with(PARAMETER_PREFIX)
}

static TRUE_CONDITION: Lazy<Arc<ConditionNode>> =
    Lazy::new(|| Arc::new(ConditionNode::new(ConditionKind::Fixed(true))));
static FALSE_CONDITION: Lazy<Arc<ConditionNode>> =
    Lazy::new(|| Arc::new(ConditionNode::new(ConditionKind::Fixed(false))));

/// Relation of a tree node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relation {
    Leaf,
    And,
    Or,
}

impl Relation {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "LEAF" => Some(Relation::Leaf),
            "AND" => Some(Relation::And),
            "OR" => Some(Relation::Or),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Relation::Leaf => "LEAF",
            Relation::And => "AND",
            Relation::Or => "OR",
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOperator {
    Equal,          // =
    NotEqual,       // <>
    GreaterOrEqual, // >=
    LessOrEqual,    // <=
    Greater,        // >
    Less,           // <
}

impl CompareOperator {
    /// An empty string means `=`
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "" | "=" => Some(CompareOperator::Equal),
            "<>" | "!=" => Some(CompareOperator::NotEqual),
            ">=" => Some(CompareOperator::GreaterOrEqual),
            "<=" => Some(CompareOperator::LessOrEqual),
            ">" => Some(CompareOperator::Greater),
            "<" => Some(CompareOperator::Less),
            _ => None,
        }
    }

    /// `ordering` is the checked value relative to the condition value
    pub fn holds(&self, ordering: Ordering) -> bool {
        match self {
            CompareOperator::Equal => ordering == Ordering::Equal,
            CompareOperator::NotEqual => ordering != Ordering::Equal,
            CompareOperator::GreaterOrEqual => ordering != Ordering::Less,
            CompareOperator::LessOrEqual => ordering != Ordering::Greater,
            CompareOperator::Greater => ordering == Ordering::Greater,
            CompareOperator::Less => ordering == Ordering::Less,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOperator::Equal => "=",
            CompareOperator::NotEqual => "<>",
            CompareOperator::GreaterOrEqual => ">=",
            CompareOperator::LessOrEqual => "<=",
            CompareOperator::Greater => ">",
            CompareOperator::Less => "<",
        }
    }
}

impl fmt::Display for CompareOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Special semantics of a leaf, parsed once from its functionName
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionKind {
    /// Plain comparison
    None,
    /// `RemoveInfoAreaIf*`: decides whether the enclosing table is dropped
    RemoveInfoAreaIf {
        negate: bool,
        zero_is_empty: bool,
        has_value: bool,
    },
    /// `Compare*` / `CompareNumeric*`: folds to a constant
    Compare { numeric: bool },
    /// `Parameter:<name>`: becomes a property condition
    Parameter { name: String },
    /// Any other function name (`Error`, `Arguments`, ...), kept as is
    Other(String),
}

impl FunctionKind {
    pub fn parse(function_name: Option<&str>) -> Self {
        let name = match function_name.map(str::trim) {
            Some(name) if !name.is_empty() => name,
            _ => return FunctionKind::None,
        };

        if let Some(modifiers) = name.strip_prefix("RemoveInfoAreaIf") {
            return FunctionKind::RemoveInfoAreaIf {
                negate: modifiers.contains("Not"),
                zero_is_empty: modifiers.contains("Or0"),
                has_value: modifiers.contains("HasValue"),
            };
        }
        if name.starts_with("CompareNumeric") {
            return FunctionKind::Compare { numeric: true };
        }
        if name.starts_with("Compare") {
            return FunctionKind::Compare { numeric: false };
        }
        if let Some(parameter) = name.strip_prefix("Parameter:") {
            let parameter = parameter.trim();
            if !parameter.is_empty() {
                return FunctionKind::Parameter {
                    name: parameter.to_string(),
                };
            }
        }
        FunctionKind::Other(name.to_string())
    }
}

/// Leaf condition: `infoAreaId.fieldId <op> values`
#[derive(Debug, Clone, PartialEq)]
pub struct Leaf {
    info_area_id: String,
    field_id: i32,
    compare_operator: CompareOperator,
    field_values: Vec<String>,
    function_name: Option<String>,
    function: FunctionKind,
}

impl Leaf {
    pub fn info_area_id(&self) -> &str {
        &self.info_area_id
    }

    pub fn field_id(&self) -> i32 {
        self.field_id
    }

    pub fn compare_operator(&self) -> CompareOperator {
        self.compare_operator
    }

    pub fn field_values(&self) -> &[String] {
        &self.field_values
    }

    pub fn function_name(&self) -> Option<&str> {
        self.function_name.as_deref()
    }

    pub fn function(&self) -> &FunctionKind {
        &self.function
    }

    /// A leaf with a negative field id and a function name only carries metadata
    fn property_name(&self) -> Option<&str> {
        match &self.function {
            FunctionKind::Other(name) if self.field_id < 0 => Some(name.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ConditionKind {
    Leaf(Leaf),
    Tree {
        relation: Relation,
        sub_conditions: Vec<Arc<ConditionNode>>,
    },
    Fixed(bool),
}

/// Condition node
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionNode {
    pub(crate) kind: ConditionKind,
    property_conditions: PropertyConditions,
}

impl ConditionNode {
    fn new(kind: ConditionKind) -> Self {
        Self {
            kind,
            property_conditions: PropertyConditions::new(),
        }
    }

    /// The shared `TrueCondition` singleton.
    pub fn true_condition() -> Arc<ConditionNode> {
        Arc::clone(&TRUE_CONDITION)
    }

    /// The shared `FalseCondition` singleton.
    pub fn false_condition() -> Arc<ConditionNode> {
        Arc::clone(&FALSE_CONDITION)
    }

    pub fn fixed(value: bool) -> Arc<ConditionNode> {
        if value {
            Self::true_condition()
        } else {
            Self::false_condition()
        }
    }

    /// Builds a leaf; the value list must not be empty
    pub fn leaf(
        info_area_id: impl Into<String>,
        field_id: i32,
        compare_operator: CompareOperator,
        field_values: Vec<String>,
        function_name: Option<String>,
    ) -> Result<Arc<ConditionNode>> {
        let info_area_id = info_area_id.into();
        if field_values.is_empty() {
            return Err(FilterError::malformed(
                format!("{}.{}", info_area_id, field_id),
                "leaf condition has no field values",
            ));
        }
        let function = FunctionKind::parse(function_name.as_deref());
        Ok(Arc::new(Self::new(ConditionKind::Leaf(Leaf {
            info_area_id,
            field_id,
            compare_operator,
            field_values,
            function_name,
            function,
        }))))
    }

    /// Builds an AND/OR node; it needs at least one child
    pub fn tree(
        relation: Relation,
        sub_conditions: Vec<Arc<ConditionNode>>,
    ) -> Result<Arc<ConditionNode>> {
        if relation == Relation::Leaf {
            return Err(FilterError::malformed(
                "condition",
                "a tree condition needs an AND or OR relation",
            ));
        }
        if sub_conditions.is_empty() {
            return Err(FilterError::malformed(
                "condition",
                "tree condition has no sub conditions",
            ));
        }
        Ok(Arc::new(Self::new(ConditionKind::Tree {
            relation,
            sub_conditions,
        })))
    }

    /// Converts `[relation, ...]` into a typed node. Leaves inherit the
    /// info area of the owning table.
    pub fn from_definition(
        value: &Value,
        info_area_id: &str,
        path: &DefinitionPath,
    ) -> Result<Arc<ConditionNode>> {
        let def = Definition::new(value, path)?;
        def.require_arity(1)?;

        let relation_name = def.string(0)?;
        let relation = Relation::parse(relation_name)
            .ok_or_else(|| def.error(format!("unknown relation '{}'", relation_name)))?;

        if relation == Relation::Leaf {
            return Self::leaf_from_definition(&def, info_area_id);
        }

        def.require_arity(2)?;
        let mut sub_conditions = Vec::with_capacity(def.len() - 1);
        let mut property_conditions = PropertyConditions::new();
        for (index, child) in def.items().iter().enumerate().skip(1) {
            let child = Self::from_definition(child, info_area_id, &path.index(index))?;
            match child.property_name().map(str::to_string) {
                Some(name) => {
                    property_conditions.insert(name, child);
                }
                None => sub_conditions.push(child),
            }
        }

        if sub_conditions.is_empty() {
            return Err(def.error("tree condition has no constraint children"));
        }

        Ok(Arc::new(Self {
            kind: ConditionKind::Tree {
                relation,
                sub_conditions,
            },
            property_conditions,
        }))
    }

    /// `["LEAF", fieldId, compareOperator, functionName, fieldValues]`
    fn leaf_from_definition(def: &Definition<'_>, info_area_id: &str) -> Result<Arc<ConditionNode>> {
        def.require_arity(5)?;

        let field_id = def.integer(1)?;
        let field_id = i32::try_from(field_id)
            .map_err(|_| def.error(format!("field id {} out of range", field_id)))?;
        let operator_name = def.optional_string(2)?.unwrap_or("");
        let compare_operator = CompareOperator::parse(operator_name)
            .ok_or_else(|| def.error(format!("unknown compare operator '{}'", operator_name)))?;
        let function_name = def.optional_string(3)?.map(str::to_string);
        let field_values = def.string_list(4)?;

        if field_values.is_empty() {
            return Err(def.error("leaf condition has no field values"));
        }

        let function = FunctionKind::parse(function_name.as_deref());
        Ok(Arc::new(Self::new(ConditionKind::Leaf(Leaf {
            info_area_id: info_area_id.to_string(),
            field_id,
            compare_operator,
            field_values,
            function_name,
            function,
        }))))
    }

    pub fn relation(&self) -> Relation {
        match &self.kind {
            ConditionKind::Tree { relation, .. } => *relation,
            _ => Relation::Leaf,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, ConditionKind::Leaf(_))
    }

    pub fn as_leaf(&self) -> Option<&Leaf> {
        match &self.kind {
            ConditionKind::Leaf(leaf) => Some(leaf),
            _ => None,
        }
    }

    /// `Some(..)` for the collapsed constant nodes.
    pub fn fixed_value(&self) -> Option<bool> {
        match self.kind {
            ConditionKind::Fixed(value) => Some(value),
            _ => None,
        }
    }

    pub fn sub_conditions(&self) -> &[Arc<ConditionNode>] {
        match &self.kind {
            ConditionKind::Tree { sub_conditions, .. } => sub_conditions,
            _ => &[],
        }
    }

    /// -1 for tree and fixed nodes.
    pub fn field_id(&self) -> i32 {
        self.as_leaf().map_or(-1, Leaf::field_id)
    }

    pub fn field_values(&self) -> &[String] {
        self.as_leaf().map(Leaf::field_values).unwrap_or(&[])
    }

    pub fn function_name(&self) -> Option<&str> {
        self.as_leaf().and_then(Leaf::function_name)
    }

    pub fn property_conditions(&self) -> &PropertyConditions {
        &self.property_conditions
    }

    pub fn property_condition(&self, name: &str) -> Option<&Arc<ConditionNode>> {
        self.property_conditions.get(name)
    }

    /// First value of the `Error` property condition.
    pub fn error_key(&self) -> Option<&str> {
        self.property_condition(ERROR_PROPERTY)
            .and_then(|error| error.field_values().first())
            .map(String::as_str)
    }

    pub(crate) fn property_name(&self) -> Option<&str> {
        self.as_leaf().and_then(Leaf::property_name)
    }

    /// Number of nodes in this sub-tree, property conditions excluded.
    pub fn node_count(&self) -> usize {
        1 + self
            .sub_conditions()
            .iter()
            .map(|child| child.node_count())
            .sum::<usize>()
    }

    /// Visits every leaf in definition order.
    pub fn for_each_leaf(self: &Arc<Self>, visit: &mut dyn FnMut(&Arc<ConditionNode>)) {
        match &self.kind {
            ConditionKind::Leaf(_) => visit(self),
            ConditionKind::Tree { sub_conditions, .. } => {
                for child in sub_conditions {
                    child.for_each_leaf(visit);
                }
            }
            ConditionKind::Fixed(_) => {}
        }
    }

    pub fn contains_value(&self, predicate: &dyn Fn(&str) -> bool) -> bool {
        match &self.kind {
            ConditionKind::Leaf(leaf) => leaf.field_values.iter().any(|v| predicate(v)),
            ConditionKind::Tree { sub_conditions, .. } => {
                sub_conditions.iter().any(|child| child.contains_value(predicate))
            }
            ConditionKind::Fixed(_) => false,
        }
    }

    /// Copy of this leaf with other values; property conditions are kept.
    pub(crate) fn with_field_values(&self, field_values: Vec<String>) -> Arc<ConditionNode> {
        let mut node = self.clone();
        if let ConditionKind::Leaf(leaf) = &mut node.kind {
            leaf.field_values = field_values;
        }
        Arc::new(node)
    }

    /// Copy of this tree node with other children. Flattens to the single
    /// remaining child (merging this node's property conditions into it).
    pub(crate) fn with_sub_conditions(
        &self,
        mut sub_conditions: Vec<Arc<ConditionNode>>,
    ) -> Option<Arc<ConditionNode>> {
        match sub_conditions.len() {
            0 => None,
            1 => {
                let only = sub_conditions.remove(0);
                Some(only.with_properties(&self.property_conditions))
            }
            _ => Some(Arc::new(Self {
                kind: ConditionKind::Tree {
                    relation: self.relation(),
                    sub_conditions,
                },
                property_conditions: self.property_conditions.clone(),
            })),
        }
    }

    /// Merges `extra` into the property conditions. Fixed singletons cannot
    /// carry metadata and are returned as they are.
    pub(crate) fn with_properties(self: &Arc<Self>, extra: &PropertyConditions) -> Arc<ConditionNode> {
        if extra.is_empty() || self.fixed_value().is_some() {
            return Arc::clone(self);
        }
        let mut node = (**self).clone();
        for (name, condition) in extra {
            node.property_conditions
                .insert(name.clone(), Arc::clone(condition));
        }
        Arc::new(node)
    }

    /// Drops every leaf for which `remove` holds. Trees left without children
    /// disappear, trees left with one child flatten, and untouched sub-trees
    /// are returned as the same `Arc`.
    pub fn without_leaves(self: &Arc<Self>, remove: &dyn Fn(&Leaf) -> bool) -> Option<Arc<ConditionNode>> {
        match &self.kind {
            ConditionKind::Leaf(leaf) if remove(leaf) => None,
            ConditionKind::Leaf(_) | ConditionKind::Fixed(_) => Some(Arc::clone(self)),
            ConditionKind::Tree { sub_conditions, .. } => {
                let mut changed = false;
                let mut children = Vec::with_capacity(sub_conditions.len());
                for child in sub_conditions {
                    match child.without_leaves(remove) {
                        Some(kept) => {
                            changed |= !Arc::ptr_eq(&kept, child);
                            children.push(kept);
                        }
                        None => changed = true,
                    }
                }
                if !changed {
                    return Some(Arc::clone(self));
                }
                self.with_sub_conditions(children)
            }
        }
    }

    /// Combines two conditions under `relation`, flattening nested nodes of
    /// the same relation.
    pub fn combine(
        relation: Relation,
        left: &Arc<ConditionNode>,
        right: &Arc<ConditionNode>,
    ) -> Arc<ConditionNode> {
        let mut sub_conditions = Vec::new();
        for side in [left, right] {
            if side.relation() == relation && side.property_conditions.is_empty() {
                sub_conditions.extend(side.sub_conditions().iter().cloned());
            } else {
                sub_conditions.push(Arc::clone(side));
            }
        }
        debug!(
            "combined two conditions with {} into {} children",
            relation,
            sub_conditions.len()
        );
        Arc::new(Self::new(ConditionKind::Tree {
            relation,
            sub_conditions,
        }))
    }
}

impl fmt::Display for ConditionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ConditionKind::Fixed(true) => write!(f, "TRUE"),
            ConditionKind::Fixed(false) => write!(f, "FALSE"),
            ConditionKind::Leaf(leaf) => {
                write!(
                    f,
                    "{}.{} {} [{}]",
                    leaf.info_area_id,
                    leaf.field_id,
                    leaf.compare_operator,
                    leaf.field_values.join(", ")
                )?;
                if let Some(function_name) = &leaf.function_name {
                    write!(f, " {{{}}}", function_name)?;
                }
                Ok(())
            }
            ConditionKind::Tree {
                relation,
                sub_conditions,
            } => {
                write!(f, "(")?;
                for (i, child) in sub_conditions.iter().enumerate() {
                    if i > 0 {
                        write!(f, " {} ", relation)?;
                    }
                    write!(f, "{}", child)?;
                }
                write!(f, ")")
            }
        }
    }
}
