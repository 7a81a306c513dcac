//! SQL compiler that renders a bound filter as a query using sea-query.
//!
//! The root table becomes the `FROM` clause, its condition the `WHERE`
//! clause. Every sub-table turns into an `EXISTS` sub-query joined to its
//! parent; optional siblings form one OR group and exclusions are negated.

use std::collections::HashMap;

use log::debug;
use sea_query::{Alias, Asterisk, Expr, Iden, PostgresQueryBuilder, Query, SimpleExpr, Value};
use serde::{Deserialize, Serialize};

use crate::check::parse_number;
use crate::condition::{
    is_parameter, is_placeholder, CompareOperator, ConditionNode, Leaf, Relation,
    COMPARE_NUMBER_MARKER, PLACEHOLDER_PREFIX,
};
use crate::error::{FilterError, Result};
use crate::filter::Filter;
use crate::table::{ParentRelation, TableNode};

/// Configuration for SQL optimization
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OptimizationConfig {
    /// Maximum number of values in one IN clause before it is split
    pub max_values_for_in: usize,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            max_values_for_in: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CompilerConfig {
    /// Maps info area ids to table names
    pub table_mapping: HashMap<String, String>,
    pub optimization_config: OptimizationConfig,
}

/// Table identifier for sea-query
#[derive(Debug, Clone)]
pub struct TableName(pub String);

impl Iden for TableName {
    fn unquoted(&self, s: &mut dyn std::fmt::Write) {
        let _ = s.write_str(&self.0);
    }
}

/// Column identifier wrapper
#[derive(Debug, Clone)]
pub struct ColumnName(pub String);

impl Iden for ColumnName {
    fn unquoted(&self, s: &mut dyn std::fmt::Write) {
        let _ = s.write_str(&self.0);
    }
}

/// Represents an optimization applied during compilation
#[derive(Debug, Clone, PartialEq)]
pub enum Optimization {
    EqualToIn { field: String, value_count: usize },
    InSplit { field: String, total_values: usize, chunk_count: usize },
    ConstantCondition { value: bool },
}

/// Result of SQL compilation with optimization information
#[derive(Debug)]
pub struct CompileResult {
    pub sql: String,
    pub optimizations: Vec<Optimization>,
}

#[derive(Default)]
struct CompileState {
    optimizations: Vec<Optimization>,
    next_alias: usize,
}

impl CompileState {
    fn alias(&mut self) -> String {
        let alias = format!("t{}", self.next_alias);
        self.next_alias += 1;
        alias
    }
}

/// SQL Compiler that renders filters as queries
pub struct SqlCompiler {
    config: CompilerConfig,
}

impl Default for SqlCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl SqlCompiler {
    pub fn new() -> Self {
        Self::from_config(CompilerConfig::default())
    }

    pub fn with_config(config: OptimizationConfig) -> Self {
        Self::from_config(CompilerConfig {
            optimization_config: config,
            ..Default::default()
        })
    }

    pub fn from_config(config: CompilerConfig) -> Self {
        Self { config }
    }

    /// Set table mapping for info areas
    pub fn set_table_mapping(&mut self, mapping: HashMap<String, String>) {
        self.config.table_mapping = mapping;
    }

    /// Mapped table name, or the lowercase info area id
    fn table_name(&self, info_area_id: &str) -> String {
        self.config
            .table_mapping
            .get(info_area_id)
            .cloned()
            .unwrap_or_else(|| info_area_id.to_lowercase())
    }

    /// Compile a filter whose placeholders are all resolved.
    pub fn compile(&self, filter: &Filter) -> Result<CompileResult> {
        let mut state = CompileState::default();
        let root = filter.root_table();
        let alias = state.alias();

        let mut select = Query::select();
        select
            .column(Asterisk)
            .from_as(TableName(self.table_name(root.info_area_id())), Alias::new(&alias));
        if let Some(constraints) = self.table_constraints(root, &alias, &mut state)? {
            select.and_where(constraints);
        }

        let sql = select.to_string(PostgresQueryBuilder);
        debug!(
            "compiled filter {} with {} optimizations",
            filter.unit_name(),
            state.optimizations.len()
        );
        Ok(CompileResult {
            sql,
            optimizations: state.optimizations,
        })
    }

    /// Own condition plus sub-table predicates of `table`, against `alias`.
    fn table_constraints(
        &self,
        table: &TableNode,
        alias: &str,
        state: &mut CompileState,
    ) -> Result<Option<SimpleExpr>> {
        let mut parts = Vec::new();
        if let Some(condition) = table.condition() {
            parts.push(self.compile_condition(condition, alias, state)?);
        }

        let mut optional = Vec::new();
        for sub in table.sub_tables() {
            let exists = self.compile_exists(table, sub, alias, state)?;
            match sub.parent_relation() {
                relation if relation.is_optional() => optional.push(exists),
                ParentRelation::Without => parts.push(exists.not()),
                _ => parts.push(exists),
            }
        }
        if let Some(group) = optional.into_iter().reduce(SimpleExpr::or) {
            parts.push(group);
        }

        Ok(parts.into_iter().reduce(SimpleExpr::and))
    }

    fn compile_exists(
        &self,
        parent: &TableNode,
        sub: &TableNode,
        parent_alias: &str,
        state: &mut CompileState,
    ) -> Result<SimpleExpr> {
        let alias = state.alias();
        let mut select = Query::select();
        select
            .expr(Expr::val(1))
            .from_as(TableName(self.table_name(sub.info_area_id())), Alias::new(&alias))
            .and_where(self.join_condition(parent, sub, parent_alias, &alias));
        if let Some(constraints) = self.table_constraints(sub, &alias, state)? {
            select.and_where(constraints);
        }
        Ok(Expr::exists(select))
    }

    /// A sub-table over the parent's own info area joins on identity,
    /// others through `<parent>_id[_<linkId>]`.
    fn join_condition(&self, parent: &TableNode, sub: &TableNode, parent_alias: &str, alias: &str) -> SimpleExpr {
        let column = if sub.info_area_id() == parent.info_area_id() && sub.link_id() <= 0 {
            "id".to_string()
        } else if sub.link_id() > 0 {
            format!("{}_id_{}", parent.info_area_id().to_lowercase(), sub.link_id())
        } else {
            format!("{}_id", parent.info_area_id().to_lowercase())
        };
        Expr::col((Alias::new(alias), ColumnName(column)))
            .equals((Alias::new(parent_alias), ColumnName("id".to_string())))
    }

    fn compile_condition(
        &self,
        condition: &ConditionNode,
        alias: &str,
        state: &mut CompileState,
    ) -> Result<SimpleExpr> {
        if let Some(value) = condition.fixed_value() {
            state.optimizations.push(Optimization::ConstantCondition { value });
            return Ok(Expr::val(value).into());
        }
        if let Some(leaf) = condition.as_leaf() {
            return self.compile_leaf(leaf, alias, state);
        }

        let children = condition
            .sub_conditions()
            .iter()
            .map(|child| self.compile_condition(child, alias, state))
            .collect::<Result<Vec<_>>>()?;
        let combined = match condition.relation() {
            Relation::Or => children.into_iter().reduce(SimpleExpr::or),
            _ => children.into_iter().reduce(SimpleExpr::and),
        };
        combined.ok_or_else(|| FilterError::Compile(format!("empty condition {}", condition)))
    }

    /// A leaf holds when any of its values satisfies the operator.
    fn compile_leaf(&self, leaf: &Leaf, alias: &str, state: &mut CompileState) -> Result<SimpleExpr> {
        let mut numeric = false;
        let mut values = Vec::with_capacity(leaf.field_values().len());
        for value in leaf.field_values() {
            if value == COMPARE_NUMBER_MARKER {
                numeric = true;
            } else if is_parameter(value) {
                let name = value.strip_prefix(PLACEHOLDER_PREFIX).unwrap_or(value);
                return Err(FilterError::UnboundParameter(name.to_string()));
            } else if is_placeholder(value) {
                return Err(FilterError::Compile(format!(
                    "unresolved placeholder {} on {}.{}",
                    value,
                    leaf.info_area_id(),
                    leaf.field_id()
                )));
            } else {
                values.push(literal_to_value(value, numeric));
            }
        }

        let field = format!("f{}", leaf.field_id());
        let column = || Expr::col((Alias::new(alias), ColumnName(field.clone())));
        let operator = leaf.compare_operator();

        if values.len() > 1 && operator == CompareOperator::Equal {
            return Ok(self.compile_in(column, &field, values, state));
        }

        values
            .into_iter()
            .map(|value| compile_comparison(column(), operator, value))
            .reduce(SimpleExpr::or)
            .ok_or_else(|| {
                FilterError::Compile(format!(
                    "leaf {}.{} has no values",
                    leaf.info_area_id(),
                    leaf.field_id()
                ))
            })
    }

    fn compile_in(
        &self,
        column: impl Fn() -> Expr,
        field: &str,
        values: Vec<Value>,
        state: &mut CompileState,
    ) -> SimpleExpr {
        let max = self.config.optimization_config.max_values_for_in.max(1);
        state.optimizations.push(Optimization::EqualToIn {
            field: field.to_string(),
            value_count: values.len(),
        });

        let chunks: Vec<_> = values.chunks(max).map(<[Value]>::to_vec).collect();
        if chunks.len() > 1 {
            state.optimizations.push(Optimization::InSplit {
                field: field.to_string(),
                total_values: values.len(),
                chunk_count: chunks.len(),
            });
        }

        chunks
            .into_iter()
            .map(|chunk| column().is_in(chunk))
            .reduce(SimpleExpr::or)
            .unwrap_or_else(|| Expr::val(false).into())
    }
}

fn compile_comparison(column: Expr, operator: CompareOperator, value: Value) -> SimpleExpr {
    match operator {
        CompareOperator::Equal => column.eq(value),
        CompareOperator::NotEqual => column.ne(value),
        CompareOperator::Greater => column.gt(value),
        CompareOperator::Less => column.lt(value),
        CompareOperator::GreaterOrEqual => column.gte(value),
        CompareOperator::LessOrEqual => column.lte(value),
    }
}

/// Values after `$compareNumber` are bound as numbers
fn literal_to_value(literal: &str, numeric: bool) -> Value {
    if numeric {
        Value::Double(Some(parse_number(literal)))
    } else {
        Value::String(Some(Box::new(literal.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filter(definition: serde_json::Value) -> Filter {
        Filter::from_definition("test", &json!([definition])).unwrap()
    }

    fn create_test_compiler() -> SqlCompiler {
        let mut compiler = SqlCompiler::new();
        let mut mapping = HashMap::new();
        mapping.insert("KD".to_string(), "company".to_string());
        mapping.insert("KP".to_string(), "person".to_string());
        compiler.set_table_mapping(mapping);
        compiler
    }

    #[test]
    fn test_simple_filter_compilation() {
        let compiler = create_test_compiler();
        let result = compiler
            .compile(&filter(json!(["KD", -1, "", ["LEAF", 2, "=", null, ["Open"]]])))
            .unwrap();

        assert!(result.sql.contains(r#"FROM "company" AS "t0""#));
        assert!(result.sql.contains(r#""t0"."f2" = 'Open'"#));
        assert!(result.optimizations.is_empty());
    }

    #[test]
    fn test_multi_value_equal_to_in() {
        let compiler = create_test_compiler();
        let result = compiler
            .compile(&filter(json!(["KD", -1, "", ["LEAF", 2, "=", null, ["A", "B", "C"]]])))
            .unwrap();

        assert!(result.sql.contains("IN ('A', 'B', 'C')"));
        assert_eq!(
            result.optimizations,
            vec![Optimization::EqualToIn {
                field: "f2".to_string(),
                value_count: 3
            }]
        );
    }

    #[test]
    fn test_large_in_is_split() {
        let compiler = SqlCompiler::with_config(OptimizationConfig { max_values_for_in: 2 });
        let result = compiler
            .compile(&filter(json!(["KD", -1, "", ["LEAF", 2, "=", null, ["1", "2", "3", "4", "5"]]])))
            .unwrap();

        assert!(result.sql.contains(" OR "));
        assert!(result.optimizations.contains(&Optimization::InSplit {
            field: "f2".to_string(),
            total_values: 5,
            chunk_count: 3
        }));
    }

    #[test]
    fn test_sub_tables_become_exists() {
        let compiler = create_test_compiler();
        let result = compiler
            .compile(&filter(json!([
                "KD", -1, "", [],
                [
                    ["KP", -1, "HAVING", ["LEAF", 3, ">", null, ["$compareNumber", "10"]]],
                    ["MA", 2, "WITHOUT"]
                ]
            ])))
            .unwrap();

        assert!(result.sql.contains("EXISTS"));
        assert!(result.sql.contains(r#"SELECT 1 FROM "person" AS "t1""#));
        assert!(result.sql.contains(r#""t1"."kd_id" = "t0"."id""#));
        assert!(result.sql.contains(r#""t1"."f3" > 10"#));
        assert!(result.sql.contains("NOT EXISTS"));
        assert!(result.sql.contains(r#""t2"."kd_id_2" = "t0"."id""#));
    }

    #[test]
    fn test_optional_siblings_form_or_group() {
        let compiler = create_test_compiler();
        let result = compiler
            .compile(&filter(json!([
                "KD", -1, "", [],
                [["KP", -1, "HAVINGOPTIONAL"], ["MA", -1, "WITHOPTIONAL"]]
            ])))
            .unwrap();

        assert!(result.sql.contains(" OR EXISTS"));
    }

    #[test]
    fn test_unresolved_placeholders_are_rejected() {
        let compiler = create_test_compiler();
        let unbound = filter(json!(["KD", -1, "", ["LEAF", 2, "=", null, ["$parStatus"]]]));
        assert!(matches!(
            compiler.compile(&unbound),
            Err(FilterError::UnboundParameter(name)) if name == "parStatus"
        ));

        let session = filter(json!(["KD", -1, "", ["LEAF", 2, "=", null, ["$curRep"]]]));
        assert!(matches!(compiler.compile(&session), Err(FilterError::Compile(_))));
    }

    #[test]
    fn test_constant_condition() {
        let compiler = create_test_compiler();
        let folded = filter(json!([
            "KD", -1, "",
            ["LEAF", 2, "=", "Compare", ["$curA", "$curA"]]
        ]))
        .apply_value_dictionary(&crate::replacement::ValueDictionary::new().with("curA", ["1"]))
        .unwrap();

        let result = compiler.compile(&folded).unwrap();
        assert!(result.sql.contains("WHERE TRUE"));
        assert_eq!(result.optimizations, vec![Optimization::ConstantCondition { value: true }]);
    }
}
