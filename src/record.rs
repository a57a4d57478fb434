//! Delimited records and sort-key projection.

use serde;

/// An input record: an ordered sequence of text fields. One field, selected
/// by a column index, serves as the sort key and is compared as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Record(Vec<String>);

impl Record {
    pub fn new(fields: Vec<String>) -> Self {
        Record(fields)
    }

    /// Parses a record from a single delimited line.
    pub fn from_line(line: &str, delimiter: char) -> Self {
        Record(line.split(delimiter).map(str::to_string).collect())
    }

    pub fn fields(&self) -> &[String] {
        &self.0
    }

    /// Renders the record back to a delimited line (without line terminator).
    pub fn to_line(&self, delimiter: char) -> String {
        self.0.join(delimiter.encode_utf8(&mut [0; 4]))
    }

    /// Returns the sort key: the field at `column` as raw bytes,
    /// or [`None`] if the record has no such column.
    pub fn key(&self, column: usize) -> Option<&[u8]> {
        self.0.get(column).map(|field| field.as_bytes())
    }

    /// Byte length of the record's delimited serialized form: the UTF-8
    /// length of every field plus one delimiter/terminator byte per field.
    pub fn encoded_size(&self) -> u64 {
        self.0.iter().map(|field| field.len() as u64 + 1).sum()
    }
}

impl From<Vec<String>> for Record {
    fn from(fields: Vec<String>) -> Self {
        Record(fields)
    }
}
