use serde_json::{json, Map, Value};

use heron_common::datum::{Datum, Row};
use heron_common::error::HeronResult;
use heron_common::types::{DataType, ResultColumn};

use crate::codec::{BackendMessage, FieldDescription};
use crate::messenger::Messenger;

use super::RowOutputter;

pub const JSON_COLUMN_NAME: &str = "JSON";

/// The single wire column every JSON row travels in.
pub fn json_field() -> FieldDescription {
    FieldDescription {
        name: JSON_COLUMN_NAME.into(),
        table_oid: 0,
        column_attr: 0,
        type_oid: DataType::Json.pg_oid(),
        type_len: DataType::Json.type_len(),
        type_modifier: -1,
        format_code: 0,
    }
}

/// `{"columns": [{"name", "type", "oid"}, ...]}`
pub fn metadata_value(columns: &[ResultColumn]) -> Value {
    let cols: Vec<Value> = columns
        .iter()
        .map(|c| {
            json!({
                "name": c.name,
                "type": c.data_type().name(),
                "oid": c.column_type.oid(),
            })
        })
        .collect();
    json!({ "columns": cols })
}

/// Object keys for `columns`. A repeated name gets a `_2`, `_3`, ... suffix
/// so every value keeps its own key.
pub fn object_keys(columns: &[ResultColumn]) -> Vec<String> {
    let mut keys: Vec<String> = Vec::with_capacity(columns.len());
    for c in columns {
        let mut key = c.name.clone();
        let mut n = 1;
        while keys.contains(&key) {
            n += 1;
            key = format!("{}_{}", c.name, n);
        }
        keys.push(key);
    }
    keys
}

/// One JSON object per row, keyed by [`object_keys`].
pub fn row_value(keys: &[String], row: &Row) -> Value {
    let mut obj = Map::with_capacity(keys.len());
    for (i, key) in keys.iter().enumerate() {
        obj.insert(key.clone(), row.get(i).unwrap_or(&Datum::Null).to_json());
    }
    Value::Object(obj)
}

/// Rows serialized as JSON objects in a single text column, optionally
/// preceded by a metadata row describing the real columns.
pub struct JsonOutputter<'a> {
    messenger: &'a mut dyn Messenger,
    columns: Vec<ResultColumn>,
    keys: Vec<String>,
    describe: bool,
    with_metadata: bool,
}

impl<'a> JsonOutputter<'a> {
    /// `with_metadata` should only be set for the first chunk of a portal.
    pub fn new(
        messenger: &'a mut dyn Messenger,
        columns: Vec<ResultColumn>,
        describe: bool,
        with_metadata: bool,
    ) -> Self {
        let keys = object_keys(&columns);
        Self {
            messenger,
            columns,
            keys,
            describe,
            with_metadata,
        }
    }

    fn send_value(&mut self, value: &Value) -> HeronResult<()> {
        self.messenger.send(&BackendMessage::DataRow {
            values: vec![Some(value.to_string().into_bytes())],
        })
    }
}

impl RowOutputter for JsonOutputter<'_> {
    fn before_data(&mut self) -> HeronResult<()> {
        if self.describe {
            self.messenger.send(&BackendMessage::RowDescription {
                fields: vec![json_field()],
            })?;
        }
        if self.with_metadata {
            self.with_metadata = false;
            let meta = metadata_value(&self.columns);
            self.send_value(&meta)?;
        }
        Ok(())
    }

    fn output(&mut self, row: &Row) -> HeronResult<()> {
        let value = row_value(&self.keys, row);
        self.send_value(&value)
    }
}
