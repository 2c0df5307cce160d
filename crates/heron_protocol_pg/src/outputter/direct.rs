//! Output of routines that produce rows by calling back into the host
//! instead of through a cursor.

use std::sync::mpsc::{sync_channel, SyncSender};
use std::thread;

use heron_common::datum::{Datum, Row};
use heron_common::error::{HeronError, HeronResult};
use heron_common::types::{DataType, ResultColumn};

use crate::backend::{DirectRoutine, RowSink, TxnHandle};
use crate::codec::BackendMessage;
use crate::messenger::Messenger;
use crate::registry::SessionHandle;

use super::{table_fields, RowOutputter};

/// Rows buffered between a streaming routine and the client.
const STREAM_BACKLOG: usize = 64;

/// Text DataRows for routine output. Rows need not share a shape; without
/// declared columns the description is taken from the first row.
pub struct DirectObjectOutputter<'a> {
    messenger: &'a mut dyn Messenger,
    columns: Vec<ResultColumn>,
    describe: bool,
    described: bool,
}

impl<'a> DirectObjectOutputter<'a> {
    pub fn new(messenger: &'a mut dyn Messenger, columns: Vec<ResultColumn>, describe: bool) -> Self {
        Self {
            messenger,
            columns,
            describe,
            described: false,
        }
    }

    fn send_description(&mut self) -> HeronResult<()> {
        self.described = true;
        self.messenger.send(&BackendMessage::RowDescription {
            fields: table_fields(&self.columns, &[]),
        })
    }
}

/// Column shape guessed from one row: `column1..N`, NULLs as text.
pub fn infer_columns(row: &Row) -> Vec<ResultColumn> {
    row.values
        .iter()
        .enumerate()
        .map(|(i, d)| ResultColumn::new(format!("column{}", i + 1), d.data_type().unwrap_or(DataType::Text)))
        .collect()
}

impl RowOutputter for DirectObjectOutputter<'_> {
    fn before_data(&mut self) -> HeronResult<()> {
        if self.describe && !self.columns.is_empty() {
            self.send_description()?;
        }
        Ok(())
    }

    fn output(&mut self, row: &Row) -> HeronResult<()> {
        if self.describe && !self.described {
            self.columns = infer_columns(row);
            self.send_description()?;
        }
        let values = row
            .values
            .iter()
            .map(|d| d.to_pg_text().map(String::into_bytes))
            .collect();
        self.messenger.send(&BackendMessage::DataRow { values })
    }
}

/// Forwards pushed rows to an outputter on the calling thread.
struct ForwardSink<'o, 'h> {
    out: &'o mut dyn RowOutputter,
    handle: &'h SessionHandle,
    rows: u64,
}

impl RowSink for ForwardSink<'_, '_> {
    fn push(&mut self, row: Row) -> HeronResult<()> {
        self.handle.check_interrupts()?;
        self.out.output(&row)?;
        self.rows += 1;
        Ok(())
    }
}

/// Hands pushed rows to the consuming thread.
struct ChannelSink {
    tx: SyncSender<Row>,
}

impl RowSink for ChannelSink {
    fn push(&mut self, row: Row) -> HeronResult<()> {
        self.tx
            .send(row)
            .map_err(|_| HeronError::internal("routine output stream closed"))
    }
}

/// Invoke `routine` and write its rows to `out` as they are pushed.
pub fn run_direct(
    routine: &dyn DirectRoutine,
    args: &[Datum],
    txn: Option<TxnHandle>,
    handle: &SessionHandle,
    out: &mut dyn RowOutputter,
) -> HeronResult<u64> {
    handle.check_interrupts()?;
    out.before_data()?;
    let mut sink = ForwardSink {
        out: &mut *out,
        handle,
        rows: 0,
    };
    routine.invoke(args, txn, &mut sink)?;
    let rows = sink.rows;
    out.after_data()?;
    Ok(rows)
}

/// Like [`run_direct`], but the routine runs on its own thread so rows reach
/// the client while it is still producing. The output side stays on the
/// calling thread and stops the routine by closing the channel when the
/// query is canceled or the client write fails.
pub fn run_direct_streaming(
    routine: &dyn DirectRoutine,
    args: &[Datum],
    txn: Option<TxnHandle>,
    handle: &SessionHandle,
    out: &mut dyn RowOutputter,
) -> HeronResult<u64> {
    handle.check_interrupts()?;
    let (tx, rx) = sync_channel::<Row>(STREAM_BACKLOG);
    thread::scope(|scope| {
        let producer = scope.spawn(move || {
            let mut sink = ChannelSink { tx };
            routine.invoke(args, txn, &mut sink)
        });

        let mut rows = 0u64;
        let streamed = out.before_data().and_then(|()| {
            for row in rx.iter() {
                handle.check_interrupts()?;
                out.output(&row)?;
                rows += 1;
            }
            Ok(())
        });
        drop(rx);

        let produced = producer
            .join()
            .unwrap_or_else(|_| Err(HeronError::internal("routine thread panicked")));
        streamed?;
        produced?;
        out.after_data()?;
        Ok(rows)
    })
}
