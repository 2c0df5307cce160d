use heron_common::datum::{Datum, Row};
use heron_common::error::HeronResult;
use heron_common::types::ResultColumn;

use crate::codec::BackendMessage;
use crate::messenger::Messenger;

use super::{resolve_format, table_fields, RowOutputter};

/// Encode one value in its column's wire format. `Err` carries the reason a
/// binary encoding is impossible.
pub fn encode_value(
    value: &Datum,
    column: &ResultColumn,
    format: i16,
) -> Result<Option<Vec<u8>>, String> {
    if format == 1 {
        value.to_pg_binary(column.data_type())
    } else {
        Ok(value.to_pg_text().map(String::into_bytes))
    }
}

/// Rows as DataRow messages, one wire column per result column.
pub struct TableOutputter<'a> {
    messenger: &'a mut dyn Messenger,
    columns: Vec<ResultColumn>,
    formats: Vec<i16>,
    describe: bool,
    warned: Vec<bool>,
}

impl<'a> TableOutputter<'a> {
    pub fn new(
        messenger: &'a mut dyn Messenger,
        columns: Vec<ResultColumn>,
        formats: Vec<i16>,
        describe: bool,
    ) -> Self {
        let warned = vec![false; columns.len()];
        Self {
            messenger,
            columns,
            formats,
            describe,
            warned,
        }
    }
}

impl RowOutputter for TableOutputter<'_> {
    fn before_data(&mut self) -> HeronResult<()> {
        self.warned.iter_mut().for_each(|w| *w = false);
        if self.describe {
            self.messenger.send(&BackendMessage::RowDescription {
                fields: table_fields(&self.columns, &self.formats),
            })?;
        }
        Ok(())
    }

    fn output(&mut self, row: &Row) -> HeronResult<()> {
        let mut values = Vec::with_capacity(self.columns.len());
        for (i, column) in self.columns.iter().enumerate() {
            let value = row.get(i).unwrap_or(&Datum::Null);
            match encode_value(value, column, resolve_format(&self.formats, i)) {
                Ok(bytes) => values.push(bytes),
                Err(reason) => {
                    if !self.warned[i] {
                        self.warned[i] = true;
                        tracing::warn!("column \"{}\" sent as NULL: {}", column.name, reason);
                        self.messenger.send(&BackendMessage::warning(format!(
                            "could not encode column \"{}\": {}",
                            column.name, reason
                        )))?;
                    }
                    values.push(None);
                }
            }
        }
        self.messenger.send(&BackendMessage::DataRow { values })
    }
}
