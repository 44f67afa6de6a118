//! Materialized result rows.

use crate::Result;
use crate::error::{DecodeError, DecodeErrorKind, Error};
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Column names shared across all rows of one result.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    names: Vec<String>,
    name_to_index: HashMap<String, usize>,
}

impl ColumnInfo {
    /// Create new column info from a list of column names.
    ///
    /// When a name repeats, lookups by name resolve to its first occurrence.
    pub fn new(names: Vec<String>) -> Self {
        let mut name_to_index = HashMap::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            name_to_index.entry(name.clone()).or_insert(i);
        }
        Self {
            names,
            name_to_index,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Get the index of a column by name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    /// Get the name of a column by index.
    pub fn name_at(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// A fully decoded row.
#[derive(Debug, Clone)]
pub struct Row {
    values: Vec<Value>,
    columns: Arc<ColumnInfo>,
}

impl Row {
    /// Create a new row with the given columns and values.
    pub fn new(column_names: Vec<String>, values: Vec<Value>) -> Self {
        let columns = Arc::new(ColumnInfo::new(column_names));
        Self { values, columns }
    }

    /// Create a new row with shared column metadata.
    pub fn with_columns(columns: Arc<ColumnInfo>, values: Vec<Value>) -> Self {
        Self { values, columns }
    }

    pub fn column_info(&self) -> Arc<ColumnInfo> {
        Arc::clone(&self.columns)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a value by column index.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Get a value by column name.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns.index_of(name).and_then(|i| self.values.get(i))
    }

    /// Get a typed value by column index.
    pub fn get_as<T>(&self, index: usize) -> Result<T>
    where
        T: TryFrom<Value, Error = Error>,
    {
        let value = self.get(index).ok_or_else(|| {
            Error::Decode(DecodeError::new(
                DecodeErrorKind::Malformed,
                "row",
                std::any::type_name::<T>(),
                format!("index {} out of bounds (row has {} columns)", index, self.len()),
            ))
        })?;
        T::try_from(value.clone()).map_err(|e| match (e, self.columns.name_at(index)) {
            (Error::Decode(de), Some(name)) => Error::Decode(de.in_column(name)),
            (e, _) => e,
        })
    }

    /// Get a typed value by column name.
    pub fn get_named<T>(&self, name: &str) -> Result<T>
    where
        T: TryFrom<Value, Error = Error>,
    {
        let index = self.columns.index_of(name).ok_or_else(|| {
            Error::Decode(
                DecodeError::new(
                    DecodeErrorKind::Malformed,
                    "row",
                    std::any::type_name::<T>(),
                    "column not found",
                )
                .in_column(name),
            )
        })?;
        self.get_as(index)
    }

    /// Iterate over all values.
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }

    /// Consume the row, returning its values.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_and_indexed_access() {
        let row = Row::new(
            vec!["a".into(), "b".into()],
            vec![Value::Int(5), Value::Text("x".into())],
        );
        assert_eq!(row.get_as::<i64>(0).unwrap(), 5);
        assert_eq!(row.get_named::<String>("b").unwrap(), "x");
        assert!(row.get_named::<i64>("missing").is_err());
        assert!(row.get_as::<i64>(9).is_err());
    }

    #[test]
    fn decode_errors_name_the_column() {
        let row = Row::new(vec!["d".into()], vec![Value::Date(3)]);
        match row.get_as::<bool>(0) {
            Err(Error::Decode(e)) => assert_eq!(e.column.as_deref(), Some("d")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn duplicate_names_resolve_to_first() {
        let info = ColumnInfo::new(vec!["id".into(), "id".into()]);
        assert_eq!(info.index_of("id"), Some(0));
        assert_eq!(info.len(), 2);
    }
}
