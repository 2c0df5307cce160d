use serde::{Deserialize, Serialize};
use std::fmt;

/// Backend value types understood by the wire layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Decimal,
    Text,
    Varchar,
    Bytea,
    Date,
    Time,
    Timestamp,
    Json,
    Jsonb,
    /// Placeholder whose type the client left unspecified.
    Unknown,
}

impl DataType {
    /// PostgreSQL type OID.
    pub fn pg_oid(&self) -> i32 {
        match self {
            DataType::Boolean => 16,
            DataType::Bytea => 17,
            DataType::Int64 => 20,
            DataType::Int16 => 21,
            DataType::Int32 => 23,
            DataType::Text => 25,
            DataType::Json => 114,
            DataType::Float32 => 700,
            DataType::Float64 => 701,
            DataType::Unknown => 705,
            DataType::Varchar => 1043,
            DataType::Date => 1082,
            DataType::Time => 1083,
            DataType::Timestamp => 1114,
            DataType::Decimal => 1700,
            DataType::Jsonb => 3802,
        }
    }

    /// `typlen`: fixed width in bytes, -1 for varlena, -2 for C strings.
    pub fn type_len(&self) -> i16 {
        match self {
            DataType::Boolean => 1,
            DataType::Int16 => 2,
            DataType::Int32 | DataType::Float32 | DataType::Date => 4,
            DataType::Int64 | DataType::Float64 | DataType::Time | DataType::Timestamp => 8,
            DataType::Unknown => -2,
            _ => -1,
        }
    }

    pub fn from_oid(oid: i32) -> Option<DataType> {
        let ty = match oid {
            16 => DataType::Boolean,
            17 => DataType::Bytea,
            20 => DataType::Int64,
            21 => DataType::Int16,
            23 => DataType::Int32,
            25 => DataType::Text,
            114 => DataType::Json,
            700 => DataType::Float32,
            701 => DataType::Float64,
            705 => DataType::Unknown,
            1043 => DataType::Varchar,
            1082 => DataType::Date,
            1083 => DataType::Time,
            1114 => DataType::Timestamp,
            1700 => DataType::Decimal,
            3802 => DataType::Jsonb,
            _ => return None,
        };
        Some(ty)
    }

    /// SQL name, as shown by `\d` and JSON metadata rows.
    pub fn name(&self) -> &'static str {
        match self {
            DataType::Boolean => "boolean",
            DataType::Int16 => "smallint",
            DataType::Int32 => "integer",
            DataType::Int64 => "bigint",
            DataType::Float32 => "real",
            DataType::Float64 => "double precision",
            DataType::Decimal => "numeric",
            DataType::Text => "text",
            DataType::Varchar => "character varying",
            DataType::Bytea => "bytea",
            DataType::Date => "date",
            DataType::Time => "time without time zone",
            DataType::Timestamp => "timestamp without time zone",
            DataType::Json => "json",
            DataType::Jsonb => "jsonb",
            DataType::Unknown => "unknown",
        }
    }

    /// Whether the binary wire encoding is implemented for this type.
    pub fn supports_binary(&self) -> bool {
        !matches!(self, DataType::Decimal | DataType::Unknown)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            DataType::Int16
                | DataType::Int32
                | DataType::Int64
                | DataType::Float32
                | DataType::Float64
                | DataType::Decimal
        )
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Column wire type: OID, declared length and type modifier derived from the
/// underlying value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnType {
    pub data_type: DataType,
    pub modifier: i32,
}

impl ColumnType {
    pub fn new(data_type: DataType) -> Self {
        Self {
            data_type,
            modifier: -1,
        }
    }

    /// `varchar(n)` style modifier; PG stores `n + 4`.
    pub fn with_length(data_type: DataType, n: i32) -> Self {
        Self {
            data_type,
            modifier: n + 4,
        }
    }

    pub fn oid(&self) -> i32 {
        self.data_type.pg_oid()
    }

    pub fn length(&self) -> i16 {
        self.data_type.type_len()
    }
}

impl From<DataType> for ColumnType {
    fn from(data_type: DataType) -> Self {
        ColumnType::new(data_type)
    }
}

/// One column of a statement's result shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultColumn {
    pub name: String,
    pub column_type: ColumnType,
    /// Source table OID, 0 for computed columns.
    pub table_oid: i32,
    pub column_attr: i16,
}

impl ResultColumn {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            column_type: ColumnType::new(data_type),
            table_oid: 0,
            column_attr: 0,
        }
    }

    pub fn data_type(&self) -> DataType {
        self.column_type.data_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oid_round_trip() {
        for ty in [
            DataType::Boolean,
            DataType::Int16,
            DataType::Int32,
            DataType::Int64,
            DataType::Float64,
            DataType::Decimal,
            DataType::Text,
            DataType::Varchar,
            DataType::Bytea,
            DataType::Date,
            DataType::Timestamp,
            DataType::Jsonb,
        ] {
            assert_eq!(DataType::from_oid(ty.pg_oid()), Some(ty));
        }
        assert_eq!(DataType::from_oid(999_999), None);
    }

    #[test]
    fn test_type_len() {
        assert_eq!(DataType::Int32.type_len(), 4);
        assert_eq!(DataType::Timestamp.type_len(), 8);
        assert_eq!(DataType::Text.type_len(), -1);
    }

    #[test]
    fn test_varchar_modifier() {
        let ct = ColumnType::with_length(DataType::Varchar, 32);
        assert_eq!(ct.modifier, 36);
        assert_eq!(ct.oid(), 1043);
        assert_eq!(ColumnType::new(DataType::Int64).modifier, -1);
    }
}
