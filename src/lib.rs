//! CRM filter engine: typed condition and table trees built from
//! configuration definitions, evaluated against field values, rewritten
//! with parameter values, merged and pruned without mutation.

pub mod check;
pub mod condition;
pub mod config;
pub mod definition;
pub mod error;
pub mod filter;
pub mod merge;
pub mod metadata;
pub mod parameter;
pub mod replacement;
pub mod sql_compiler;
pub mod table;

pub use check::{FieldValueMap, FilterCheckResult};
pub use condition::{CompareOperator, ConditionNode, FunctionKind, Relation};
pub use config::FilterCatalog;
pub use error::{FilterError, Result};
pub use filter::Filter;
pub use parameter::{FilterParameter, FilterParameters};
pub use replacement::{ChainedReplacements, Replacement, ReplacementProvider, ValueDictionary};
pub use table::{ParentRelation, TableNode};
