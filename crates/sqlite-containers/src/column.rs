// crates/sqlite-containers/src/column.rs
// ============================================================================
// Module: Column Codecs
// Description: Mapping between Rust key/value types and SQLite columns.
// Purpose: Let stores declare column affinity and move payloads losslessly.
// Dependencies: rusqlite
// ============================================================================

//! ## Overview
//! [`ColumnValue`] is the capability a key or value type needs to live in a
//! store column: a declared SQL type for the DDL, an encoding into an owned
//! engine value, and the matching decoding. Opaque fixed-layout records
//! implement [`ByteRecord`] and are stored as `BLOB` through [`Record`].

// ============================================================================
// SECTION: Imports
// ============================================================================

use rusqlite::types::Value;

use crate::error::StoreError;

// ============================================================================
// SECTION: Column Types
// ============================================================================

/// SQL column type for integer payloads.
pub const SQL_INTEGER: &str = "INTEGER";
/// SQL column type for floating point payloads.
pub const SQL_REAL: &str = "REAL";
/// SQL column type for text payloads.
pub const SQL_TEXT: &str = "TEXT";
/// SQL column type for binary payloads.
pub const SQL_BLOB: &str = "BLOB";

/// A type that can be stored in a key or value column.
///
/// # Invariants
/// - `from_sql_value(to_sql_value(x)?)` reproduces `x`.
/// - Encoding never yields `NULL`; key and value columns are `NOT NULL`.
pub trait ColumnValue: Sized {
    /// Declared column type used when the table is created.
    const SQL_TYPE: &'static str;

    /// Encodes the payload as an owned engine value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Invalid`] when the payload has no column
    /// representation.
    fn to_sql_value(&self) -> Result<Value, StoreError>;

    /// Decodes a payload read back from the column.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Invalid`] when the column holds an incompatible
    /// value.
    fn from_sql_value(value: Value) -> Result<Self, StoreError>;
}

/// Describes the storage class of an engine value for error messages.
const fn storage_class(value: &Value) -> &'static str {
    match value {
        Value::Null => "NULL",
        Value::Integer(_) => SQL_INTEGER,
        Value::Real(_) => SQL_REAL,
        Value::Text(_) => SQL_TEXT,
        Value::Blob(_) => SQL_BLOB,
    }
}

/// Builds the error for a column holding the wrong storage class.
fn mismatch(expected: &str, found: &Value) -> StoreError {
    StoreError::Invalid(format!(
        "expected {expected} column value, found {}",
        storage_class(found)
    ))
}

/// Implements [`ColumnValue`] for integers narrower than `i64`.
macro_rules! integer_column {
    ($($ty:ty),* $(,)?) => {
        $(
            impl ColumnValue for $ty {
                const SQL_TYPE: &'static str = SQL_INTEGER;

                fn to_sql_value(&self) -> Result<Value, StoreError> {
                    Ok(Value::Integer(i64::from(*self)))
                }

                fn from_sql_value(value: Value) -> Result<Self, StoreError> {
                    match value {
                        Value::Integer(raw) => <$ty>::try_from(raw).map_err(|_| {
                            StoreError::Invalid(format!(
                                "integer column value out of range for {}",
                                stringify!($ty)
                            ))
                        }),
                        other => Err(mismatch(SQL_INTEGER, &other)),
                    }
                }
            }
        )*
    };
}

integer_column!(i8, i16, i32, u8, u16, u32);

impl ColumnValue for i64 {
    const SQL_TYPE: &'static str = SQL_INTEGER;

    fn to_sql_value(&self) -> Result<Value, StoreError> {
        Ok(Value::Integer(*self))
    }

    fn from_sql_value(value: Value) -> Result<Self, StoreError> {
        match value {
            Value::Integer(raw) => Ok(raw),
            other => Err(mismatch(SQL_INTEGER, &other)),
        }
    }
}

impl ColumnValue for u64 {
    const SQL_TYPE: &'static str = SQL_INTEGER;

    fn to_sql_value(&self) -> Result<Value, StoreError> {
        i64::try_from(*self)
            .map(Value::Integer)
            .map_err(|_| StoreError::Invalid("u64 value exceeds the i64 column range".to_string()))
    }

    fn from_sql_value(value: Value) -> Result<Self, StoreError> {
        match value {
            Value::Integer(raw) => Self::try_from(raw).map_err(|_| {
                StoreError::Invalid("negative integer in a u64 column".to_string())
            }),
            other => Err(mismatch(SQL_INTEGER, &other)),
        }
    }
}

impl ColumnValue for bool {
    const SQL_TYPE: &'static str = SQL_INTEGER;

    fn to_sql_value(&self) -> Result<Value, StoreError> {
        Ok(Value::Integer(i64::from(*self)))
    }

    fn from_sql_value(value: Value) -> Result<Self, StoreError> {
        match value {
            Value::Integer(0) => Ok(false),
            Value::Integer(1) => Ok(true),
            Value::Integer(_) => {
                Err(StoreError::Invalid("boolean column holds a non 0/1 integer".to_string()))
            }
            other => Err(mismatch(SQL_INTEGER, &other)),
        }
    }
}

impl ColumnValue for f64 {
    const SQL_TYPE: &'static str = SQL_REAL;

    fn to_sql_value(&self) -> Result<Value, StoreError> {
        // NaN binds as NULL in SQLite.
        if self.is_nan() {
            return Err(StoreError::Invalid("NaN cannot be stored in a REAL column".to_string()));
        }
        Ok(Value::Real(*self))
    }

    fn from_sql_value(value: Value) -> Result<Self, StoreError> {
        match value {
            Value::Real(raw) => Ok(raw),
            other => Err(mismatch(SQL_REAL, &other)),
        }
    }
}

impl ColumnValue for f32 {
    const SQL_TYPE: &'static str = SQL_REAL;

    fn to_sql_value(&self) -> Result<Value, StoreError> {
        f64::from(*self).to_sql_value()
    }

    #[allow(
        clippy::cast_possible_truncation,
        reason = "REAL columns of f32 keys only ever hold widened f32 values."
    )]
    fn from_sql_value(value: Value) -> Result<Self, StoreError> {
        f64::from_sql_value(value).map(|raw| raw as Self)
    }
}

impl ColumnValue for String {
    const SQL_TYPE: &'static str = SQL_TEXT;

    fn to_sql_value(&self) -> Result<Value, StoreError> {
        Ok(Value::Text(self.clone()))
    }

    fn from_sql_value(value: Value) -> Result<Self, StoreError> {
        match value {
            Value::Text(text) => Ok(text),
            other => Err(mismatch(SQL_TEXT, &other)),
        }
    }
}

impl ColumnValue for Vec<u8> {
    const SQL_TYPE: &'static str = SQL_BLOB;

    fn to_sql_value(&self) -> Result<Value, StoreError> {
        Ok(Value::Blob(self.clone()))
    }

    fn from_sql_value(value: Value) -> Result<Self, StoreError> {
        match value {
            Value::Blob(bytes) => Ok(bytes),
            other => Err(mismatch(SQL_BLOB, &other)),
        }
    }
}

// ============================================================================
// SECTION: Opaque Records
// ============================================================================

/// A fixed-layout record persisted as its raw byte image.
///
/// Implementors usually have no meaningful `PartialEq`; stores compare them
/// with [`crate::ByteIdentity`].
pub trait ByteRecord: Sized {
    /// Returns the record's byte image.
    fn to_bytes(&self) -> Vec<u8>;

    /// Rebuilds a record from its byte image.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Invalid`] when the image has the wrong size or
    /// content.
    fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError>;
}

/// Column adapter storing a [`ByteRecord`] as `BLOB`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Record<T>(pub T);

impl<T> Record<T> {
    /// Unwraps the record.
    #[must_use]
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T: ByteRecord> ColumnValue for Record<T> {
    const SQL_TYPE: &'static str = SQL_BLOB;

    fn to_sql_value(&self) -> Result<Value, StoreError> {
        Ok(Value::Blob(self.0.to_bytes()))
    }

    fn from_sql_value(value: Value) -> Result<Self, StoreError> {
        match value {
            Value::Blob(bytes) => T::from_bytes(&bytes).map(Record),
            other => Err(mismatch(SQL_BLOB, &other)),
        }
    }
}

/// Copies a byte image into a fixed-size array.
///
/// # Errors
///
/// Returns [`StoreError::Invalid`] when `bytes` is not exactly `N` long.
pub fn fixed_bytes<const N: usize>(bytes: &[u8]) -> Result<[u8; N], StoreError> {
    <[u8; N]>::try_from(bytes).map_err(|_| {
        StoreError::Invalid(format!("record image is {} bytes, expected {N}", bytes.len()))
    })
}

// ============================================================================
// SECTION: Tests
// ============================================================================
