//! Positional access to decoded definition arrays.
//!
//! The configuration store hands out definitions as nested, loosely typed
//! arrays. `Definition` wraps one such array together with the path that led
//! to it, so that every arity or type violation is reported with a location
//! instead of producing a half-built tree.

use serde_json::Value;

use crate::error::{FilterError, Result};

#[derive(Debug, Clone, Copy)]
pub struct Definition<'a> {
    items: &'a [Value],
    path: &'a str,
}

/// Owned variant of the path, needed when descending into children.
#[derive(Debug, Clone)]
pub struct DefinitionPath(String);

impl DefinitionPath {
    pub fn new(root: impl Into<String>) -> Self {
        Self(root.into())
    }

    pub fn index(&self, index: usize) -> Self {
        Self(format!("{}[{}]", self.0, index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'a> Definition<'a> {
    /// Wraps `value`, which must be an array.
    pub fn new(value: &'a Value, path: &'a DefinitionPath) -> Result<Self> {
        match value {
            Value::Array(items) => Ok(Self {
                items,
                path: path.as_str(),
            }),
            other => Err(FilterError::malformed(
                path.as_str(),
                format!("expected an array, found {}", type_name(other)),
            )),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn path(&self) -> &str {
        self.path
    }

    pub fn items(&self) -> &'a [Value] {
        self.items
    }

    pub fn require_arity(&self, min: usize) -> Result<()> {
        if self.items.len() < min {
            return Err(self.error(format!(
                "expected at least {} elements, found {}",
                min,
                self.items.len()
            )));
        }
        Ok(())
    }

    /// Element at `index`; `null` counts as absent.
    pub fn get(&self, index: usize) -> Option<&'a Value> {
        self.items.get(index).filter(|v| !v.is_null())
    }

    pub fn string(&self, index: usize) -> Result<&'a str> {
        match self.get(index) {
            Some(Value::String(s)) => Ok(s),
            Some(other) => Err(self.element_error(index, "a string", other)),
            None => Err(self.error(format!("missing string at position {}", index))),
        }
    }

    pub fn optional_string(&self, index: usize) -> Result<Option<&'a str>> {
        match self.get(index) {
            Some(Value::String(s)) if s.is_empty() => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(self.element_error(index, "a string", other)),
            None => Ok(None),
        }
    }

    /// Integers may be encoded as numbers or as numeric strings.
    pub fn integer(&self, index: usize) -> Result<i64> {
        match self.get(index) {
            Some(value) => integer_value(value)
                .ok_or_else(|| self.element_error(index, "an integer", value)),
            None => Err(self.error(format!("missing integer at position {}", index))),
        }
    }

    pub fn optional_integer(&self, index: usize, default: i64) -> Result<i64> {
        match self.get(index) {
            Some(Value::String(s)) if s.is_empty() => Ok(default),
            Some(_) => self.integer(index),
            None => Ok(default),
        }
    }

    /// Sequence of literal strings; numbers and booleans are converted.
    pub fn string_list(&self, index: usize) -> Result<Vec<String>> {
        let values = match self.get(index) {
            Some(Value::Array(values)) => values,
            // a single scalar is accepted as a one-element list
            Some(scalar) => std::slice::from_ref(scalar),
            None => return Ok(Vec::new()),
        };

        values
            .iter()
            .map(|value| {
                scalar_to_string(value)
                    .ok_or_else(|| self.element_error(index, "a list of scalars", value))
            })
            .collect()
    }

    pub fn error(&self, message: impl Into<String>) -> FilterError {
        FilterError::malformed(self.path, message)
    }

    fn element_error(&self, index: usize, expected: &str, found: &Value) -> FilterError {
        FilterError::malformed(
            format!("{}[{}]", self.path, index),
            format!("expected {}, found {}", expected, type_name(found)),
        )
    }
}

pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        _ => None,
    }
}

fn integer_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_positional_access() {
        let value = json!(["KD", "3", null, ["a", 2, true]]);
        let path = DefinitionPath::new("unit");
        let def = Definition::new(&value, &path).unwrap();

        assert_eq!(def.len(), 4);
        assert_eq!(def.string(0).unwrap(), "KD");
        assert_eq!(def.integer(1).unwrap(), 3);
        assert_eq!(def.optional_string(2).unwrap(), None);
        assert_eq!(def.optional_integer(7, -1).unwrap(), -1);
        assert_eq!(def.string_list(3).unwrap(), vec!["a", "2", "1"]);
    }

    #[test]
    fn test_errors_carry_path() {
        let value = json!(["KD", {"x": 1}]);
        let path = DefinitionPath::new("unit").index(4);
        let def = Definition::new(&value, &path).unwrap();

        match def.integer(1) {
            Err(FilterError::Malformed { path, message }) => {
                assert_eq!(path, "unit[4][1]");
                assert!(message.contains("object"));
            }
            other => panic!("expected malformed error, got {:?}", other),
        }
        assert!(def.require_arity(3).is_err());
    }

    #[test]
    fn test_non_array_is_rejected() {
        let value = json!("LEAF");
        let path = DefinitionPath::new("unit");
        assert!(Definition::new(&value, &path).is_err());
    }
}
