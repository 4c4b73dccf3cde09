//! Output tables that decoders write rows into
//!
//! Decoders only see the [`OutputTable`] trait: a write cursor (`loc`),
//! per-field storage addressable at that cursor, and `push_row` to commit.
//! [`Table`] is an in-memory columnar implementation built from a
//! [`DecodedSchema`].
//!
//! A table always holds one pending (uncommitted) row at `loc`. Writes land
//! there; `push_row` commits it and opens a fresh zeroed row.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use crate::decoder::{ChannelKey, DecodedSchema, NumericType};

/// Table write errors
#[derive(Error, Debug)]
pub enum TableError {
    #[error("Unknown field '{0}'")]
    UnknownField(String),

    #[error("Field '{field}' holds {actual:?}, requested {requested:?}")]
    TypeMismatch {
        field: String,
        requested: NumericType,
        actual: NumericType,
    },

    #[error("Field '{0}' is not a waveform")]
    NotWaveform(String),

    #[error("Field '{0}' is a waveform, not a scalar")]
    NotScalar(String),
}

/// Row sink with a write cursor
pub trait OutputTable {
    /// Index of the row currently being written
    fn loc(&self) -> usize;

    /// Store a scalar in the pending row; the value is narrowed to the field type
    fn set_scalar(&mut self, field: &str, value: u64) -> Result<(), TableError>;

    /// Waveform storage of the pending row for an unsigned 16-bit field
    fn waveform_u16_mut(&mut self, field: &str) -> Result<&mut [u16], TableError>;

    /// Waveform storage of the pending row for a signed 16-bit field
    fn waveform_i16_mut(&mut self, field: &str) -> Result<&mut [i16], TableError>;

    /// Commit the pending row and advance the cursor
    fn push_row(&mut self);
}

/// A set of tables addressed by channel key
pub trait ChannelTables {
    fn table_mut(&mut self, key: ChannelKey) -> Option<&mut dyn OutputTable>;
}

impl<T: OutputTable> ChannelTables for HashMap<ChannelKey, T> {
    fn table_mut(&mut self, key: ChannelKey) -> Option<&mut dyn OutputTable> {
        self.get_mut(&key).map(|t| t as &mut dyn OutputTable)
    }
}

impl<T: OutputTable> ChannelTables for BTreeMap<ChannelKey, T> {
    fn table_mut(&mut self, key: ChannelKey) -> Option<&mut dyn OutputTable> {
        self.get_mut(&key).map(|t| t as &mut dyn OutputTable)
    }
}

/// Typed storage of one column
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Uint8(Vec<u8>),
    Uint16(Vec<u16>),
    Uint32(Vec<u32>),
    Uint64(Vec<u64>),
    Int16(Vec<i16>),
}

impl ColumnData {
    fn new(dtype: NumericType, len: usize) -> Self {
        match dtype {
            NumericType::Uint8 => ColumnData::Uint8(vec![0; len]),
            NumericType::Uint16 => ColumnData::Uint16(vec![0; len]),
            NumericType::Uint32 => ColumnData::Uint32(vec![0; len]),
            NumericType::Uint64 => ColumnData::Uint64(vec![0; len]),
            NumericType::Int16 => ColumnData::Int16(vec![0; len]),
        }
    }

    fn dtype(&self) -> NumericType {
        match self {
            ColumnData::Uint8(_) => NumericType::Uint8,
            ColumnData::Uint16(_) => NumericType::Uint16,
            ColumnData::Uint32(_) => NumericType::Uint32,
            ColumnData::Uint64(_) => NumericType::Uint64,
            ColumnData::Int16(_) => NumericType::Int16,
        }
    }

    fn grow(&mut self, additional: usize) {
        match self {
            ColumnData::Uint8(v) => v.resize(v.len() + additional, 0),
            ColumnData::Uint16(v) => v.resize(v.len() + additional, 0),
            ColumnData::Uint32(v) => v.resize(v.len() + additional, 0),
            ColumnData::Uint64(v) => v.resize(v.len() + additional, 0),
            ColumnData::Int16(v) => v.resize(v.len() + additional, 0),
        }
    }

    fn reserve(&mut self, additional: usize) {
        match self {
            ColumnData::Uint8(v) => v.reserve(additional),
            ColumnData::Uint16(v) => v.reserve(additional),
            ColumnData::Uint32(v) => v.reserve(additional),
            ColumnData::Uint64(v) => v.reserve(additional),
            ColumnData::Int16(v) => v.reserve(additional),
        }
    }

    fn get(&self, index: usize) -> Option<u64> {
        match self {
            ColumnData::Uint8(v) => v.get(index).map(|&x| x as u64),
            ColumnData::Uint16(v) => v.get(index).map(|&x| x as u64),
            ColumnData::Uint32(v) => v.get(index).map(|&x| x as u64),
            ColumnData::Uint64(v) => v.get(index).copied(),
            ColumnData::Int16(v) => v.get(index).map(|&x| x as u64),
        }
    }

    fn json_range(&self, start: usize, stop: usize) -> serde_json::Value {
        match self {
            ColumnData::Uint8(v) => serde_json::Value::from(v[start..stop].to_vec()),
            ColumnData::Uint16(v) => serde_json::Value::from(v[start..stop].to_vec()),
            ColumnData::Uint32(v) => serde_json::Value::from(v[start..stop].to_vec()),
            ColumnData::Uint64(v) => serde_json::Value::from(v[start..stop].to_vec()),
            ColumnData::Int16(v) => serde_json::Value::from(v[start..stop].to_vec()),
        }
    }
}

/// One named column; waveform columns store `width` elements per row
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub width: usize,
    pub is_waveform: bool,
    pub data: ColumnData,
}

/// In-memory growable table
#[derive(Debug, Clone)]
pub struct Table {
    columns: Vec<Column>,
    loc: usize,
}

impl Table {
    /// Create an empty table with one column per schema field
    pub fn new(schema: &DecodedSchema) -> Self {
        let columns = schema
            .fields()
            .iter()
            .map(|field| {
                let width = field.length.unwrap_or(1);
                Column {
                    name: field.name.clone(),
                    width,
                    is_waveform: field.is_waveform(),
                    data: ColumnData::new(field.dtype, width),
                }
            })
            .collect();
        Self { columns, loc: 0 }
    }

    /// Create a table with room for `rows` committed rows before reallocating
    pub fn with_capacity(schema: &DecodedSchema, rows: usize) -> Self {
        let mut table = Self::new(schema);
        for column in &mut table.columns {
            column.data.reserve(rows * column.width);
        }
        table
    }

    /// Number of committed rows
    pub fn len(&self) -> usize {
        self.loc
    }

    pub fn is_empty(&self) -> bool {
        self.loc == 0
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    fn column(&self, field: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == field)
    }

    fn column_mut(&mut self, field: &str) -> Result<&mut Column, TableError> {
        self.columns
            .iter_mut()
            .find(|c| c.name == field)
            .ok_or_else(|| TableError::UnknownField(field.to_string()))
    }

    /// Committed scalar value, widened to u64 (signed values are sign-extended)
    pub fn scalar(&self, field: &str, row: usize) -> Option<u64> {
        if row >= self.loc {
            return None;
        }
        let column = self.column(field)?;
        if column.is_waveform {
            return None;
        }
        column.data.get(row)
    }

    /// Committed unsigned 16-bit waveform
    pub fn waveform_u16(&self, field: &str, row: usize) -> Option<&[u16]> {
        let column = self.column(field)?;
        match &column.data {
            ColumnData::Uint16(v) if column.is_waveform && row < self.loc => {
                Some(&v[row * column.width..(row + 1) * column.width])
            }
            _ => None,
        }
    }

    /// Committed signed 16-bit waveform
    pub fn waveform_i16(&self, field: &str, row: usize) -> Option<&[i16]> {
        let column = self.column(field)?;
        match &column.data {
            ColumnData::Int16(v) if column.is_waveform && row < self.loc => {
                Some(&v[row * column.width..(row + 1) * column.width])
            }
            _ => None,
        }
    }

    /// Committed rows as a JSON object of column name → values
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for column in &self.columns {
            let value = if column.is_waveform {
                serde_json::Value::Array(
                    (0..self.loc)
                        .map(|row| {
                            column
                                .data
                                .json_range(row * column.width, (row + 1) * column.width)
                        })
                        .collect(),
                )
            } else {
                column.data.json_range(0, self.loc)
            };
            map.insert(column.name.clone(), value);
        }
        serde_json::Value::Object(map)
    }

    /// Committed rows as MessagePack, same structure as [`Table::to_json`]
    pub fn to_msgpack(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(&self.to_json())
    }
}

impl OutputTable for Table {
    fn loc(&self) -> usize {
        self.loc
    }

    fn set_scalar(&mut self, field: &str, value: u64) -> Result<(), TableError> {
        let row = self.loc;
        let column = self.column_mut(field)?;
        if column.is_waveform {
            return Err(TableError::NotScalar(field.to_string()));
        }
        match &mut column.data {
            ColumnData::Uint8(v) => v[row] = value as u8,
            ColumnData::Uint16(v) => v[row] = value as u16,
            ColumnData::Uint32(v) => v[row] = value as u32,
            ColumnData::Uint64(v) => v[row] = value,
            ColumnData::Int16(v) => v[row] = value as i16,
        }
        Ok(())
    }

    fn waveform_u16_mut(&mut self, field: &str) -> Result<&mut [u16], TableError> {
        let row = self.loc;
        let column = self.column_mut(field)?;
        if !column.is_waveform {
            return Err(TableError::NotWaveform(field.to_string()));
        }
        let width = column.width;
        match &mut column.data {
            ColumnData::Uint16(v) => Ok(&mut v[row * width..(row + 1) * width]),
            other => Err(TableError::TypeMismatch {
                field: field.to_string(),
                requested: NumericType::Uint16,
                actual: other.dtype(),
            }),
        }
    }

    fn waveform_i16_mut(&mut self, field: &str) -> Result<&mut [i16], TableError> {
        let row = self.loc;
        let column = self.column_mut(field)?;
        if !column.is_waveform {
            return Err(TableError::NotWaveform(field.to_string()));
        }
        let width = column.width;
        match &mut column.data {
            ColumnData::Int16(v) => Ok(&mut v[row * width..(row + 1) * width]),
            other => Err(TableError::TypeMismatch {
                field: field.to_string(),
                requested: NumericType::Int16,
                actual: other.dtype(),
            }),
        }
    }

    fn push_row(&mut self) {
        self.loc += 1;
        for column in &mut self.columns {
            column.data.grow(column.width);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::FieldSpec;

    fn schema() -> DecodedSchema {
        DecodedSchema::new(vec![
            FieldSpec::scalar("ievt", NumericType::Uint32),
            FieldSpec::scalar("crate", NumericType::Uint8),
            FieldSpec::waveform("waveform", NumericType::Int16, 4, 10.0),
        ])
    }

    #[test]
    fn test_new_table_is_empty() {
        let table = Table::new(&schema());
        assert_eq!(table.loc(), 0);
        assert!(table.is_empty());
        assert_eq!(table.scalar("ievt", 0), None);
    }

    #[test]
    fn test_write_and_commit_rows() {
        let mut table = Table::new(&schema());
        table.set_scalar("ievt", 7).unwrap();
        table.set_scalar("crate", 0x1FF).unwrap(); // narrowed to u8
        table
            .waveform_i16_mut("waveform")
            .unwrap()
            .copy_from_slice(&[1, -2, 3, -4]);
        table.push_row();
        table.set_scalar("ievt", 8).unwrap();
        table.push_row();

        assert_eq!(table.len(), 2);
        assert_eq!(table.scalar("ievt", 0), Some(7));
        assert_eq!(table.scalar("crate", 0), Some(0xFF));
        assert_eq!(table.waveform_i16("waveform", 0), Some(&[1, -2, 3, -4][..]));
        assert_eq!(table.waveform_i16("waveform", 1), Some(&[0, 0, 0, 0][..]));
        assert_eq!(table.scalar("ievt", 1), Some(8));
        assert_eq!(table.scalar("ievt", 2), None);
    }

    #[test]
    fn test_write_errors() {
        let mut table = Table::new(&schema());
        assert!(matches!(
            table.set_scalar("energy", 1),
            Err(TableError::UnknownField(_))
        ));
        assert!(matches!(
            table.set_scalar("waveform", 1),
            Err(TableError::NotScalar(_))
        ));
        assert!(matches!(
            table.waveform_i16_mut("ievt"),
            Err(TableError::NotWaveform(_))
        ));
        assert!(matches!(
            table.waveform_u16_mut("waveform"),
            Err(TableError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_channel_tables_lookup() {
        let key = ChannelKey::resolve(0, 2, 1);
        let mut tables: HashMap<ChannelKey, Table> = HashMap::new();
        tables.insert(key, Table::new(&schema()));

        let table = tables.table_mut(key).unwrap();
        table.set_scalar("ievt", 3).unwrap();
        table.push_row();
        assert!(tables.table_mut(ChannelKey::resolve(0, 2, 2)).is_none());
        assert_eq!(tables[&key].scalar("ievt", 0), Some(3));
    }

    #[test]
    fn test_to_json_only_committed_rows() {
        let mut table = Table::with_capacity(&schema(), 4);
        table.set_scalar("ievt", 1).unwrap();
        table.push_row();
        table.set_scalar("ievt", 99).unwrap(); // pending, not exported
        let json = table.to_json();
        assert_eq!(json["ievt"], serde_json::json!([1]));
        assert_eq!(json["waveform"], serde_json::json!([[0, 0, 0, 0]]));
    }

    #[test]
    fn test_to_msgpack_matches_json() {
        let mut table = Table::new(&schema());
        table.set_scalar("ievt", 5).unwrap();
        table.push_row();
        let bytes = table.to_msgpack().unwrap();
        let decoded: serde_json::Value = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded, table.to_json());
    }
}
