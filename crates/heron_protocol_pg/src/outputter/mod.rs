//! Row serialization strategies.
//!
//! A statement picks an outputter for its result shape and feeds it rows
//! through [`RowOutputter`]; the outputter decides how they reach the wire.

pub mod csv;
pub mod direct;
pub mod json;
pub mod table;

use heron_common::config::OutputFormat;
use heron_common::datum::Row;
use heron_common::error::{HeronError, HeronResult};
use heron_common::types::ResultColumn;

use crate::codec::FieldDescription;
use crate::messenger::Messenger;
use crate::portal::Portal;

pub use self::csv::CsvCopyOutputter;
pub use self::direct::DirectObjectOutputter;
pub use self::json::JsonOutputter;
pub use self::table::TableOutputter;

pub trait RowOutputter {
    /// Called once before the first row of an execute call.
    fn before_data(&mut self) -> HeronResult<()> {
        Ok(())
    }

    fn output(&mut self, row: &Row) -> HeronResult<()>;

    /// Called once after the last row of an execute call.
    fn after_data(&mut self) -> HeronResult<()> {
        Ok(())
    }
}

/// Drops rows. Used for statements that only count affected rows.
#[derive(Debug, Default)]
pub struct DiscardOutputter;

impl RowOutputter for DiscardOutputter {
    fn output(&mut self, _row: &Row) -> HeronResult<()> {
        Ok(())
    }
}

/// Format code for column `i` from a Bind-style format list: none means
/// text for all, one applies to all, otherwise one per column.
pub fn resolve_format(formats: &[i16], i: usize) -> i16 {
    match formats.len() {
        0 => 0,
        1 => formats[0],
        _ => formats.get(i).copied().unwrap_or(0),
    }
}

/// Reject format lists that cannot describe `count` columns.
pub fn validate_formats(formats: &[i16], count: usize, what: &str) -> HeronResult<()> {
    if formats.len() > 1 && formats.len() != count {
        return Err(HeronError::protocol(format!(
            "{what} has {} format codes but {count} columns",
            formats.len()
        )));
    }
    if let Some(bad) = formats.iter().find(|f| **f != 0 && **f != 1) {
        return Err(HeronError::protocol(format!("invalid format code {bad}")));
    }
    Ok(())
}

/// RowDescription fields for table output.
pub fn table_fields(columns: &[ResultColumn], formats: &[i16]) -> Vec<FieldDescription> {
    columns
        .iter()
        .enumerate()
        .map(|(i, col)| FieldDescription {
            name: col.name.clone(),
            table_oid: col.table_oid,
            column_attr: col.column_attr,
            type_oid: col.column_type.oid(),
            type_len: col.column_type.length(),
            type_modifier: col.column_type.modifier,
            format_code: resolve_format(formats, i),
        })
        .collect()
}

/// RowDescription fields as the client will actually receive them under
/// `output_format`. Empty when the statement returns no rows.
pub fn describe_fields(
    output_format: OutputFormat,
    columns: &[ResultColumn],
    formats: &[i16],
) -> Vec<FieldDescription> {
    if columns.is_empty() {
        return Vec::new();
    }
    match output_format {
        OutputFormat::Table => table_fields(columns, formats),
        OutputFormat::Json | OutputFormat::JsonWithMetaData => vec![json::json_field()],
    }
}

/// The row outputter for a query portal, chosen by its output format.
pub fn for_portal<'a>(
    messenger: &'a mut dyn Messenger,
    portal: &Portal,
    columns: &[ResultColumn],
    describe: bool,
) -> Box<dyn RowOutputter + 'a> {
    if columns.is_empty() {
        return Box::new(DiscardOutputter);
    }
    match portal.output_format {
        OutputFormat::Table => Box::new(TableOutputter::new(
            messenger,
            columns.to_vec(),
            portal.result_formats.clone(),
            describe,
        )),
        format => Box::new(JsonOutputter::new(
            messenger,
            columns.to_vec(),
            describe,
            format == OutputFormat::JsonWithMetaData && portal.cursor.is_fresh(),
        )),
    }
}
