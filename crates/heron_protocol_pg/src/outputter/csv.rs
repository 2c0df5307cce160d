//! Delimited row format shared by COPY TO, COPY FROM and streaming routine
//! output.
//!
//! `Csv` mode quotes fields that would otherwise be ambiguous. `Text` mode is
//! the PostgreSQL text COPY format: no quoting, backslash escapes, `\N` for
//! NULL and tab as the default delimiter.

use std::io::BufRead;

use heron_common::config::CopyConfig;
use heron_common::datum::Row;
use heron_common::error::{CompileError, ExecutionError, HeronError, HeronResult};
use heron_common::types::ResultColumn;

use crate::ast::{CopyFormatKind, CopyOptions};
use crate::copy_stream::CopyDestination;

use super::RowOutputter;

#[derive(Debug, Clone, PartialEq)]
pub struct CsvFormat {
    pub mode: CopyFormatKind,
    pub delimiter: char,
    pub quote: char,
    pub escape: char,
    /// Token standing for SQL NULL.
    pub null: String,
    pub header: bool,
    pub terminator: String,
}

/// Outcome of parsing one record's text.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedRecord {
    Fields(Vec<Option<String>>),
    /// Ends inside a quoted field; the next line belongs to this record.
    Incomplete,
}

fn single_char(name: &str, value: &str) -> HeronResult<char> {
    let mut chars = value.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii() => Ok(c),
        _ => Err(CompileError::InvalidParameterValue {
            name: name.into(),
            value: value.into(),
        }
        .into()),
    }
}

impl CsvFormat {
    pub fn csv() -> Self {
        Self::from_config(&CopyConfig::default())
    }

    pub fn text() -> Self {
        Self {
            mode: CopyFormatKind::Text,
            delimiter: '\t',
            quote: '"',
            escape: '\\',
            null: "\\N".into(),
            header: false,
            terminator: "\n".into(),
        }
    }

    /// CSV defaults from server configuration, falling back to the
    /// standard ones for anything malformed.
    pub fn from_config(config: &CopyConfig) -> Self {
        Self {
            mode: CopyFormatKind::Csv,
            delimiter: config.delimiter.chars().next().unwrap_or(','),
            quote: config.quote.chars().next().unwrap_or('"'),
            escape: config.escape.chars().next().unwrap_or('"'),
            null: config.null_string.clone(),
            header: false,
            terminator: config.record_terminator.clone(),
        }
    }

    /// Resolve `WITH (...)` options against the server defaults.
    pub fn from_options(options: &CopyOptions, defaults: &CopyConfig) -> HeronResult<Self> {
        let mode = options.format.unwrap_or(CopyFormatKind::Text);
        let mut format = match mode {
            CopyFormatKind::Text => {
                if options.quote.is_some() || options.escape.is_some() {
                    return Err(HeronError::unsupported(
                        "COPY QUOTE and ESCAPE are available only in CSV mode",
                    ));
                }
                Self::text()
            }
            CopyFormatKind::Csv => Self::from_config(defaults),
        };
        if let Some(d) = &options.delimiter {
            format.delimiter = single_char("delimiter", d)?;
        }
        if let Some(q) = &options.quote {
            format.quote = single_char("quote", q)?;
            if options.escape.is_none() {
                format.escape = format.quote;
            }
        }
        if let Some(e) = &options.escape {
            format.escape = single_char("escape", e)?;
        }
        if let Some(n) = &options.null {
            format.null = n.clone();
        }
        format.header = options.header.unwrap_or(false);
        format.validate()?;
        Ok(format)
    }

    fn validate(&self) -> HeronResult<()> {
        let invalid = |name: &str, value: String| -> HeronError {
            CompileError::InvalidParameterValue {
                name: name.into(),
                value,
            }
            .into()
        };
        if matches!(self.delimiter, '\r' | '\n' | '\\') {
            return Err(invalid("delimiter", self.delimiter.to_string()));
        }
        if self.mode == CopyFormatKind::Csv && self.delimiter == self.quote {
            return Err(invalid("quote", self.quote.to_string()));
        }
        if self.null.contains(self.delimiter) || self.null.contains(['\r', '\n']) {
            return Err(invalid("null", self.null.clone()));
        }
        Ok(())
    }

    fn needs_quotes(&self, value: &str) -> bool {
        value == self.null
            || value
                .chars()
                .any(|c| c == self.delimiter || c == self.quote || c == self.escape || c == '\r' || c == '\n')
    }

    fn push_field(&self, out: &mut String, value: Option<&str>) {
        let value = match value {
            None => {
                out.push_str(&self.null);
                return;
            }
            Some(v) => v,
        };
        match self.mode {
            CopyFormatKind::Csv => {
                if !self.needs_quotes(value) {
                    out.push_str(value);
                    return;
                }
                out.push(self.quote);
                for c in value.chars() {
                    if c == self.quote || c == self.escape {
                        out.push(self.escape);
                    }
                    out.push(c);
                }
                out.push(self.quote);
            }
            CopyFormatKind::Text => {
                for c in value.chars() {
                    match c {
                        '\\' => out.push_str("\\\\"),
                        '\n' => out.push_str("\\n"),
                        '\r' => out.push_str("\\r"),
                        '\t' => out.push_str("\\t"),
                        c if c == self.delimiter => {
                            out.push('\\');
                            out.push(c);
                        }
                        c => out.push(c),
                    }
                }
            }
        }
    }

    /// One record, terminator included.
    pub fn format_fields<'v>(&self, fields: impl IntoIterator<Item = Option<&'v str>>) -> String {
        let mut out = String::new();
        for (i, field) in fields.into_iter().enumerate() {
            if i > 0 {
                out.push(self.delimiter);
            }
            self.push_field(&mut out, field);
        }
        out.push_str(&self.terminator);
        out
    }

    pub fn format_row(&self, row: &Row) -> String {
        let texts: Vec<Option<String>> = row.values.iter().map(|d| d.to_pg_text()).collect();
        self.format_fields(texts.iter().map(|t| t.as_deref()))
    }

    pub fn format_header(&self, columns: &[ResultColumn]) -> String {
        self.format_fields(columns.iter().map(|c| Some(c.name.as_str())))
    }

    /// Parse one record, terminator already stripped.
    pub fn parse_record(&self, text: &str) -> Result<ParsedRecord, String> {
        match self.mode {
            CopyFormatKind::Csv => Ok(self.parse_csv(text)),
            CopyFormatKind::Text => self.parse_text(text).map(ParsedRecord::Fields),
        }
    }

    fn parse_csv(&self, text: &str) -> ParsedRecord {
        let mut fields = Vec::new();
        let mut current = String::new();
        let mut quoted = false;
        let mut in_quotes = false;
        let mut chars = text.chars().peekable();

        while let Some(c) = chars.next() {
            if in_quotes {
                if c == self.escape
                    && self.escape != self.quote
                    && matches!(chars.peek(), Some(&n) if n == self.quote || n == self.escape)
                {
                    if let Some(n) = chars.next() {
                        current.push(n);
                    }
                } else if c == self.quote {
                    if self.escape == self.quote && chars.peek() == Some(&self.quote) {
                        chars.next();
                        current.push(self.quote);
                    } else {
                        in_quotes = false;
                    }
                } else {
                    current.push(c);
                }
            } else if c == self.quote {
                in_quotes = true;
                quoted = true;
            } else if c == self.delimiter {
                fields.push(self.csv_value(std::mem::take(&mut current), quoted));
                quoted = false;
            } else {
                current.push(c);
            }
        }
        if in_quotes {
            return ParsedRecord::Incomplete;
        }
        fields.push(self.csv_value(current, quoted));
        ParsedRecord::Fields(fields)
    }

    /// A quoted field is never NULL, even when it matches the null token.
    fn csv_value(&self, value: String, quoted: bool) -> Option<String> {
        if !quoted && value == self.null {
            None
        } else {
            Some(value)
        }
    }

    fn parse_text(&self, text: &str) -> Result<Vec<Option<String>>, String> {
        let mut fields = Vec::new();
        let mut raw = String::new();
        let mut current = String::new();
        let mut chars = text.chars();

        while let Some(c) = chars.next() {
            if c == '\\' {
                let n = chars
                    .next()
                    .ok_or_else(|| "unexpected end of line after backslash".to_string())?;
                raw.push(c);
                raw.push(n);
                current.push(match n {
                    'n' => '\n',
                    'r' => '\r',
                    't' => '\t',
                    'b' => '\u{8}',
                    'f' => '\u{c}',
                    'v' => '\u{b}',
                    other => other,
                });
            } else if c == self.delimiter {
                fields.push(self.text_value(std::mem::take(&mut raw), std::mem::take(&mut current)));
            } else {
                raw.push(c);
                current.push(c);
            }
        }
        fields.push(self.text_value(raw, current));
        Ok(fields)
    }

    fn text_value(&self, raw: String, value: String) -> Option<String> {
        if raw == self.null {
            None
        } else {
            Some(value)
        }
    }
}

fn strip_terminator(s: &str) -> &str {
    let s = s.strip_suffix('\n').unwrap_or(s);
    s.strip_suffix('\r').unwrap_or(s)
}

/// Reads records from a byte stream, joining lines of multi-line quoted
/// fields and skipping the header when the format has one.
pub struct CsvReader<'f, R: BufRead> {
    format: &'f CsvFormat,
    input: R,
    header_pending: bool,
    line: u64,
    finished: bool,
}

impl<'f, R: BufRead> CsvReader<'f, R> {
    pub fn new(format: &'f CsvFormat, input: R) -> Self {
        Self {
            format,
            input,
            header_pending: format.header,
            line: 0,
            finished: false,
        }
    }

    /// Current line number, 1-based.
    pub fn line(&self) -> u64 {
        self.line
    }

    pub fn next_record(&mut self) -> HeronResult<Option<Vec<Option<String>>>> {
        loop {
            let fields = match self.read_record()? {
                Some(fields) => fields,
                None => return Ok(None),
            };
            if self.header_pending {
                self.header_pending = false;
                continue;
            }
            return Ok(Some(fields));
        }
    }

    fn read_record(&mut self) -> HeronResult<Option<Vec<Option<String>>>> {
        if self.finished {
            return Ok(None);
        }
        let mut record = String::new();
        loop {
            let mut line = String::new();
            if self.input.read_line(&mut line)? == 0 {
                self.finished = true;
                if record.is_empty() {
                    return Ok(None);
                }
                return Err(self.bad("unterminated CSV quoted field"));
            }
            self.line += 1;
            if record.is_empty() && strip_terminator(&line) == "\\." {
                self.finished = true;
                return Ok(None);
            }
            record.push_str(&line);
            match self.format.parse_record(strip_terminator(&record)) {
                Ok(ParsedRecord::Fields(fields)) => return Ok(Some(fields)),
                Ok(ParsedRecord::Incomplete) => continue,
                Err(msg) => return Err(self.bad(&msg)),
            }
        }
    }

    fn bad(&self, msg: &str) -> HeronError {
        ExecutionError::BadCopyFormat(format!("line {}: {}", self.line, msg)).into()
    }
}

/// Rows in COPY format to a [`CopyDestination`].
pub struct CsvCopyOutputter<'a> {
    dest: &'a mut dyn CopyDestination,
    format: CsvFormat,
    columns: Vec<ResultColumn>,
}

impl<'a> CsvCopyOutputter<'a> {
    pub fn new(dest: &'a mut dyn CopyDestination, format: CsvFormat, columns: Vec<ResultColumn>) -> Self {
        Self {
            dest,
            format,
            columns,
        }
    }
}

impl RowOutputter for CsvCopyOutputter<'_> {
    fn before_data(&mut self) -> HeronResult<()> {
        self.dest.begin(self.columns.len())?;
        if self.format.header {
            let header = self.format.format_header(&self.columns);
            self.dest.write_row(header.as_bytes())?;
        }
        Ok(())
    }

    fn output(&mut self, row: &Row) -> HeronResult<()> {
        let line = self.format.format_row(row);
        self.dest.write_row(line.as_bytes())
    }

    fn after_data(&mut self) -> HeronResult<()> {
        self.dest.finish()
    }
}
