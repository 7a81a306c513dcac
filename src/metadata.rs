//! Field-metadata collaborator.
//!
//! The engine only needs the classification of a field to choose between
//! numeric and string comparison; the real provider lives with the CRM data
//! model.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Boolean,
    Numeric,
    Catalog,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMetadata {
    pub field_type: FieldType,
    /// Catalog number for catalog fields.
    pub catalog_id: Option<i32>,
}

impl FieldMetadata {
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            catalog_id: None,
        }
    }

    pub fn catalog(catalog_id: i32) -> Self {
        Self {
            field_type: FieldType::Catalog,
            catalog_id: Some(catalog_id),
        }
    }

    /// Numeric and catalog (code) fields compare as numbers.
    pub fn compares_numerically(&self) -> bool {
        matches!(self.field_type, FieldType::Numeric | FieldType::Catalog)
    }
}

pub trait FieldMetadataProvider {
    fn field_metadata(&self, info_area_id: &str, field_id: i32) -> Option<FieldMetadata>;
}

impl FieldMetadataProvider for HashMap<(String, i32), FieldMetadata> {
    fn field_metadata(&self, info_area_id: &str, field_id: i32) -> Option<FieldMetadata> {
        self.get(&(info_area_id.to_string(), field_id)).cloned()
    }
}

/// Maps the textual spellings of a boolean onto `"1"` / `"0"`.
pub fn normalize_boolean(value: &str) -> &str {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "x" => "1",
        "" | "0" | "false" | "no" => "0",
        _ => value,
    }
}
