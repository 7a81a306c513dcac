//! Filter façade.
//!
//! Binds a configuration unit name to the root of a table tree and exposes
//! checks, parameter binding, merging and pruning. Nothing mutates `self`:
//! an operation that changes nothing returns a copy sharing the same root.

use std::fmt;
use std::sync::Arc;

use log::debug;
use serde_json::Value;

use crate::check::{FieldValueMap, FilterCheckResult};
use crate::definition::{Definition, DefinitionPath};
use crate::error::{FilterError, Result};
use crate::metadata::FieldMetadataProvider;
use crate::parameter::FilterParameters;
use crate::replacement::{ReplacementProvider, ValueDictionary};
use crate::table::TableNode;

/// Filter
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    /// Configuration unit name
    unit_name: String,
    info_area_id: String,
    /// Display name, UI only
    display_name: Option<String>,
    root_table: Arc<TableNode>,
}

impl Filter {
    pub fn new(unit_name: impl Into<String>, root_table: Arc<TableNode>) -> Self {
        Self {
            unit_name: unit_name.into(),
            info_area_id: root_table.info_area_id().to_string(),
            display_name: None,
            root_table,
        }
    }

    /// `[tableDefinition, displayName?]`
    pub fn from_definition(unit_name: &str, value: &Value) -> Result<Self> {
        let path = DefinitionPath::new(unit_name);
        let def = Definition::new(value, &path)?;
        def.require_arity(1)?;

        let table_definition = def
            .get(0)
            .ok_or_else(|| def.error("missing table definition"))?;
        let root_table = TableNode::from_definition(table_definition, &path.index(0))?;

        let mut filter = Filter::new(unit_name, root_table);
        filter.display_name = def.optional_string(1)?.map(str::to_string);
        debug!(
            "filter {} loaded with {} tables",
            unit_name,
            filter.root_table.node_count()
        );
        Ok(filter)
    }

    pub fn unit_name(&self) -> &str {
        &self.unit_name
    }

    pub fn info_area_id(&self) -> &str {
        &self.info_area_id
    }

    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.unit_name)
    }

    pub fn root_table(&self) -> &Arc<TableNode> {
        &self.root_table
    }

    /// Same filter around another root; keeps the root `Arc` when unchanged.
    fn with_root(&self, root_table: Arc<TableNode>) -> Filter {
        if Arc::ptr_eq(&root_table, &self.root_table) {
            return self.clone();
        }
        Filter {
            root_table,
            ..self.clone()
        }
    }

    /// Parameter index of the whole tree, `None` if there are no parameters.
    pub fn parameters(&self) -> Option<FilterParameters> {
        let mut parameters = FilterParameters::new();
        self.root_table.add_parameters(&mut parameters);
        debug!(
            "filter {} references {} parameters",
            self.unit_name,
            parameters.len()
        );
        if parameters.is_empty() {
            None
        } else {
            Some(parameters)
        }
    }

    pub fn check_value(&self, value: &str) -> Option<FilterCheckResult> {
        self.root_table.check_value(value)
    }

    pub fn check_value_for_field(
        &self,
        value: &str,
        metadata: &dyn FieldMetadataProvider,
    ) -> Option<FilterCheckResult> {
        self.root_table
            .condition()
            .and_then(|c| c.check_value_for_field(value, metadata))
    }

    pub fn check_with_values(&self, values: &FieldValueMap) -> Option<FilterCheckResult> {
        self.root_table.check_with_values(values)
    }

    /// `None` when the root table itself was removed.
    pub fn apply_replacements(&self, provider: &dyn ReplacementProvider) -> Option<Filter> {
        match self.root_table.apply_replacements(provider) {
            Some(root) => Some(self.with_root(root)),
            None => {
                debug!("filter {} removed its root table", self.unit_name);
                None
            }
        }
    }

    pub fn apply_value_dictionary(&self, dictionary: &ValueDictionary) -> Option<Filter> {
        self.apply_replacements(dictionary)
    }

    /// Applies every bound parameter of `parameters`.
    pub fn apply_filter_parameters(&self, parameters: &FilterParameters) -> Option<Filter> {
        self.apply_replacements(&parameters.replacement())
    }

    /// Applies one named parameter group, which must be bound.
    pub fn apply_filter_parameter(&self, parameters: &FilterParameters, name: &str) -> Result<Option<Filter>> {
        if !parameters.contains(name) {
            return Err(FilterError::UnknownParameter(name.to_string()));
        }
        if !parameters.is_bound(name) {
            return Err(FilterError::UnboundParameter(name.to_string()));
        }
        Ok(self.apply_replacements(&parameters.replacement_for(name)))
    }

    pub fn append_or_filter(&self, other: &Filter) -> Filter {
        self.with_root(self.root_table.merge_append(&other.root_table, true))
    }

    pub fn append_and_filter(&self, other: &Filter) -> Filter {
        self.with_root(self.root_table.merge_append(&other.root_table, false))
    }

    pub fn remove_mandatory_sub_tables(&self) -> Filter {
        self.with_root(self.root_table.remove_mandatory_sub_tables())
    }

    pub fn remove_root_condition(&self) -> Filter {
        self.with_root(self.root_table.remove_root_condition())
    }

    pub fn remove_sub_tables_with(&self, info_area_id: &str, link_id: i32) -> Filter {
        self.with_root(self.root_table.remove_sub_tables_with(info_area_id, link_id))
    }

    pub fn remove_unbound_parameters(&self) -> Filter {
        self.with_root(self.root_table.remove_unbound_parameters())
    }

    pub fn remove_fixed_conditions_for_unnamed_parameters(&self) -> Filter {
        self.with_root(self.root_table.remove_fixed_conditions_for_unnamed_parameters())
    }

    pub fn table_with_alias(&self, alias: &str) -> Option<Arc<TableNode>> {
        self.root_table.table_with_alias(alias)
    }

    pub fn table_with_info_area_id(&self, info_area_id: &str, link_id: i32) -> Option<Arc<TableNode>> {
        self.root_table.table_with_info_area_id(info_area_id, link_id)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} ({})", self.unit_name, self.display_name())?;
        write!(f, "{}", self.root_table)
    }
}
