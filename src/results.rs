use std::fmt;
use std::sync::Arc;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::types::Value;

/// A single row keyed by column name
///
/// Column names are shared by every row of the same statement. The row serializes as a
/// JSON object whose keys follow column order.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// The column names for this row (shared across all rows of a statement)
    pub column_names: Arc<Vec<String>>,
    /// The values for this row, in column order
    pub values: Vec<Value>,
}

impl Row {
    #[must_use]
    pub fn new(column_names: Arc<Vec<String>>, values: Vec<Value>) -> Self {
        Self {
            column_names,
            values,
        }
    }

    /// Get a value by column name.
    ///
    /// When a name repeats, the last column with that name wins.
    #[must_use]
    pub fn get(&self, column_name: &str) -> Option<&Value> {
        self.column_names
            .iter()
            .rposition(|col| col == column_name)
            .and_then(|idx| self.values.get(idx))
    }

    #[must_use]
    pub fn get_by_index(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.column_names
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, value) in self.iter() {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Row {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RowVisitor;

        impl<'de> Visitor<'de> for RowVisitor {
            type Value = Row;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of column name to value")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Row, A::Error> {
                let mut names = Vec::with_capacity(access.size_hint().unwrap_or(0));
                let mut values = Vec::with_capacity(names.capacity());
                while let Some((name, value)) = access.next_entry::<String, Value>()? {
                    names.push(name);
                    values.push(value);
                }
                Ok(Row::new(Arc::new(names), values))
            }
        }

        deserializer.deserialize_map(RowVisitor)
    }
}

/// One result block from `exec`: the column names of a sub-statement and every row it
/// produced.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub values: Vec<Vec<Value>>,
}

impl QueryResult {
    /// Iterate the block as [`Row`]s sharing one copy of the column names.
    pub fn rows(&self) -> impl Iterator<Item = Row> + '_ {
        let names = Arc::new(self.columns.clone());
        self.values
            .iter()
            .map(move |values| Row::new(Arc::clone(&names), values.clone()))
    }
}
