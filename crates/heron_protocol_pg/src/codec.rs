use bytes::{Buf, BufMut, BytesMut};
use std::collections::HashMap;

use heron_common::error::{HeronError, HeronResult, ProtocolError};

pub const PROTOCOL_VERSION_3: i32 = 196_608;
const SSL_REQUEST_CODE: i32 = 80_877_103;
const GSSENC_REQUEST_CODE: i32 = 80_877_104;
const CANCEL_REQUEST_CODE: i32 = 80_877_102;

/// Who sends a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Frontend,
    Backend,
    Both,
}

/// What happens to the connection when processing a message fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorMode {
    /// Close the connection without further ado.
    None,
    /// Report the error and reset for the next message.
    Simple,
    /// Report the error and discard messages until Sync.
    Extended,
    /// Report the error and shut the connection down.
    Fatal,
}

/// Static description of one protocol message type.
#[derive(Debug, Clone, Copy)]
pub struct MessageType {
    /// Type byte; 0 for the untyped startup packet.
    pub code: u8,
    pub name: &'static str,
    /// Largest accepted length (including the length word). `UNBOUNDED`
    /// defers to the configured server limit.
    pub max_size: usize,
    pub direction: Direction,
    pub error_mode: ErrorMode,
}

pub const UNBOUNDED: usize = usize::MAX;

const fn mt(
    code: u8,
    name: &'static str,
    max_size: usize,
    direction: Direction,
    error_mode: ErrorMode,
) -> MessageType {
    MessageType {
        code,
        name,
        max_size,
        direction,
        error_mode,
    }
}

pub const MESSAGE_TYPES: &[MessageType] = &[
    mt(0, "Startup", 10_000, Direction::Frontend, ErrorMode::Fatal),
    mt(b'Q', "Query", UNBOUNDED, Direction::Frontend, ErrorMode::Simple),
    mt(b'P', "Parse", UNBOUNDED, Direction::Frontend, ErrorMode::Extended),
    mt(b'B', "Bind", UNBOUNDED, Direction::Frontend, ErrorMode::Extended),
    mt(b'D', "Describe", 4 + 1 + 1024, Direction::Frontend, ErrorMode::Extended),
    mt(b'E', "Execute", 4 + 1024 + 4, Direction::Frontend, ErrorMode::Extended),
    mt(b'C', "Close", 4 + 1 + 1024, Direction::Frontend, ErrorMode::Extended),
    mt(b'H', "Flush", 4, Direction::Frontend, ErrorMode::Extended),
    mt(b'S', "Sync", 4, Direction::Frontend, ErrorMode::Simple),
    mt(b'X', "Terminate", 4, Direction::Frontend, ErrorMode::None),
    mt(b'd', "CopyData", UNBOUNDED, Direction::Both, ErrorMode::Simple),
    mt(b'c', "CopyDone", 4, Direction::Both, ErrorMode::Simple),
    mt(b'f', "CopyFail", 4 + 8192, Direction::Frontend, ErrorMode::Simple),
    mt(b'R', "Authentication", UNBOUNDED, Direction::Backend, ErrorMode::None),
    mt(b'S', "ParameterStatus", UNBOUNDED, Direction::Backend, ErrorMode::None),
    mt(b'K', "BackendKeyData", 12, Direction::Backend, ErrorMode::None),
    mt(b'Z', "ReadyForQuery", 5, Direction::Backend, ErrorMode::None),
    mt(b'T', "RowDescription", UNBOUNDED, Direction::Backend, ErrorMode::None),
    mt(b'D', "DataRow", UNBOUNDED, Direction::Backend, ErrorMode::None),
    mt(b'C', "CommandComplete", UNBOUNDED, Direction::Backend, ErrorMode::None),
    mt(b'E', "ErrorResponse", UNBOUNDED, Direction::Backend, ErrorMode::None),
    mt(b'N', "NoticeResponse", UNBOUNDED, Direction::Backend, ErrorMode::None),
    mt(b'I', "EmptyQueryResponse", 4, Direction::Backend, ErrorMode::None),
    mt(b'1', "ParseComplete", 4, Direction::Backend, ErrorMode::None),
    mt(b'2', "BindComplete", 4, Direction::Backend, ErrorMode::None),
    mt(b'3', "CloseComplete", 4, Direction::Backend, ErrorMode::None),
    mt(b'n', "NoData", 4, Direction::Backend, ErrorMode::None),
    mt(b's', "PortalSuspended", 4, Direction::Backend, ErrorMode::None),
    mt(b't', "ParameterDescription", UNBOUNDED, Direction::Backend, ErrorMode::None),
    mt(b'G', "CopyInResponse", UNBOUNDED, Direction::Backend, ErrorMode::None),
    mt(b'H', "CopyOutResponse", UNBOUNDED, Direction::Backend, ErrorMode::None),
];

/// Look up a client→server message type by its code.
pub fn frontend_message_type(code: u8) -> Option<&'static MessageType> {
    MESSAGE_TYPES
        .iter()
        .find(|t| t.code == code && t.direction != Direction::Backend)
}

/// Look up a server→client message type by its code.
pub fn backend_message_type(code: u8) -> Option<&'static MessageType> {
    MESSAGE_TYPES
        .iter()
        .find(|t| t.code == code && t.direction != Direction::Frontend)
}

/// Raw PG frontend (client→server) message types.
#[derive(Debug, Clone, PartialEq)]
pub enum FrontendMessage {
    /// Initial startup message (no type byte).
    Startup {
        version: i32,
        params: HashMap<String, String>,
    },
    /// SSL request (special startup message).
    SslRequest,
    /// GSSAPI encryption request, declined like SSL.
    GssEncRequest,
    /// Cancel request (special startup-phase message with process_id and secret_key).
    CancelRequest { process_id: i32, secret_key: i32 },
    /// Simple query ('Q').
    Query(String),
    /// Parse ('P'): extended query.
    Parse {
        name: String,
        query: String,
        param_types: Vec<i32>,
    },
    /// Bind ('B'): extended query.
    Bind {
        portal: String,
        statement: String,
        param_formats: Vec<i16>,
        param_values: Vec<Option<Vec<u8>>>,
        result_formats: Vec<i16>,
    },
    /// Describe ('D'); kind is `S` (statement) or `P` (portal).
    Describe { kind: u8, name: String },
    /// Execute ('E').
    Execute { portal: String, max_rows: i32 },
    /// Sync ('S').
    Sync,
    /// Close ('C').
    Close { kind: u8, name: String },
    /// Flush ('H').
    Flush,
    /// Terminate ('X').
    Terminate,
    /// CopyData ('d'): data row during COPY.
    CopyData(Vec<u8>),
    /// CopyDone ('c'): end of COPY data.
    CopyDone,
    /// CopyFail ('f'): client aborts COPY.
    CopyFail(String),
}

impl FrontendMessage {
    /// Type byte of this message; 0 for startup-phase packets.
    pub fn code(&self) -> u8 {
        match self {
            FrontendMessage::Startup { .. }
            | FrontendMessage::SslRequest
            | FrontendMessage::GssEncRequest
            | FrontendMessage::CancelRequest { .. } => 0,
            FrontendMessage::Query(_) => b'Q',
            FrontendMessage::Parse { .. } => b'P',
            FrontendMessage::Bind { .. } => b'B',
            FrontendMessage::Describe { .. } => b'D',
            FrontendMessage::Execute { .. } => b'E',
            FrontendMessage::Sync => b'S',
            FrontendMessage::Close { .. } => b'C',
            FrontendMessage::Flush => b'H',
            FrontendMessage::Terminate => b'X',
            FrontendMessage::CopyData(_) => b'd',
            FrontendMessage::CopyDone => b'c',
            FrontendMessage::CopyFail(_) => b'f',
        }
    }

    pub fn message_type(&self) -> Option<&'static MessageType> {
        frontend_message_type(self.code())
    }

    /// Recovery policy when handling this message fails.
    pub fn error_mode(&self) -> ErrorMode {
        self.message_type()
            .map(|t| t.error_mode)
            .unwrap_or(ErrorMode::Fatal)
    }
}

/// Raw PG backend (server→client) message types.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    AuthenticationOk,
    /// Parameter status ('S').
    ParameterStatus { name: String, value: String },
    /// Backend key data ('K').
    BackendKeyData { process_id: i32, secret_key: i32 },
    /// Ready for query ('Z').
    ReadyForQuery { txn_status: u8 },
    /// Row description ('T').
    RowDescription { fields: Vec<FieldDescription> },
    /// Data row ('D'); values are already encoded in their column format.
    DataRow { values: Vec<Option<Vec<u8>>> },
    /// Command complete ('C').
    CommandComplete { tag: String },
    /// Error response ('E').
    ErrorResponse {
        severity: String,
        code: String,
        message: String,
        detail: Option<String>,
    },
    /// Notice response ('N').
    NoticeResponse {
        severity: String,
        code: String,
        message: String,
    },
    /// Empty query response ('I').
    EmptyQueryResponse,
    /// Parse complete ('1').
    ParseComplete,
    /// Bind complete ('2').
    BindComplete,
    /// Close complete ('3').
    CloseComplete,
    /// No data ('n').
    NoData,
    /// Portal suspended ('s'): Execute stopped at its row limit.
    PortalSuspended,
    /// Parameter description ('t').
    ParameterDescription { type_oids: Vec<i32> },
    /// CopyInResponse ('G'): server ready to receive COPY data.
    CopyInResponse {
        format: u8, // 0 = text, 1 = binary
        column_formats: Vec<i16>,
    },
    /// CopyOutResponse ('H'): server will send COPY data.
    CopyOutResponse { format: u8, column_formats: Vec<i16> },
    /// CopyData ('d'): a row of COPY data.
    CopyData(Vec<u8>),
    /// CopyDone ('c'): end of COPY output.
    CopyDone,
}

impl BackendMessage {
    pub fn warning(message: impl Into<String>) -> Self {
        BackendMessage::NoticeResponse {
            severity: "WARNING".into(),
            code: "01000".into(),
            message: message.into(),
        }
    }

    pub fn notice(message: impl Into<String>) -> Self {
        BackendMessage::NoticeResponse {
            severity: "NOTICE".into(),
            code: "00000".into(),
            message: message.into(),
        }
    }

    pub fn error(err: &HeronError) -> Self {
        BackendMessage::ErrorResponse {
            severity: err.pg_severity().into(),
            code: err.pg_sqlstate().into(),
            message: err.to_string(),
            detail: err.pg_detail(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: i32,
    pub type_len: i16,
    pub type_modifier: i32,
    pub format_code: i16, // 0 = text, 1 = binary
}

fn invalid(msg: impl Into<String>) -> HeronError {
    HeronError::Protocol(ProtocolError::InvalidMessage(msg.into()))
}

/// Decode a startup-phase packet.
/// Returns Ok(Some(msg)) if a complete message was decoded,
/// Ok(None) if more data is needed.
pub fn decode_startup(buf: &mut BytesMut) -> HeronResult<Option<FrontendMessage>> {
    if buf.len() < 4 {
        return Ok(None);
    }

    let len = (&buf[0..4]).get_i32();
    if len < 8 {
        return Err(invalid("startup packet too short"));
    }
    let len = len as usize;
    if buf.len() < len {
        return Ok(None);
    }

    let mut msg_buf = buf.split_to(len);
    msg_buf.advance(4); // skip length
    let version = msg_buf.get_i32();

    match version {
        SSL_REQUEST_CODE => return Ok(Some(FrontendMessage::SslRequest)),
        GSSENC_REQUEST_CODE => return Ok(Some(FrontendMessage::GssEncRequest)),
        CANCEL_REQUEST_CODE => {
            if msg_buf.remaining() < 8 {
                return Err(invalid("cancel request too short"));
            }
            let process_id = msg_buf.get_i32();
            let secret_key = msg_buf.get_i32();
            return Ok(Some(FrontendMessage::CancelRequest {
                process_id,
                secret_key,
            }));
        }
        _ => {}
    }

    let mut params = HashMap::new();
    while msg_buf.has_remaining() {
        let key = read_cstring(&mut msg_buf)?;
        if key.is_empty() {
            break;
        }
        let value = read_cstring(&mut msg_buf)?;
        params.insert(key, value);
    }

    Ok(Some(FrontendMessage::Startup { version, params }))
}

/// Decode a regular frontend message (after startup).
pub fn decode_message(buf: &mut BytesMut) -> HeronResult<Option<FrontendMessage>> {
    if buf.len() < 5 {
        return Ok(None);
    }

    let msg_type = buf[0];
    let len = (&buf[1..5]).get_i32();
    if len < 4 {
        return Err(invalid(format!("invalid message length {len}")));
    }
    let len = len as usize;
    if buf.len() < 1 + len {
        return Ok(None);
    }

    buf.advance(1); // type byte
    let mut msg_buf = buf.split_to(len);
    msg_buf.advance(4);

    let msg = match msg_type {
        b'Q' => FrontendMessage::Query(read_cstring(&mut msg_buf)?),
        b'X' => FrontendMessage::Terminate,
        b'P' => {
            let name = read_cstring(&mut msg_buf)?;
            let query = read_cstring(&mut msg_buf)?;
            let count = read_i16(&mut msg_buf)?;
            let mut param_types = Vec::with_capacity(count.max(0) as usize);
            for _ in 0..count {
                param_types.push(read_i32(&mut msg_buf)?);
            }
            FrontendMessage::Parse {
                name,
                query,
                param_types,
            }
        }
        b'B' => {
            let portal = read_cstring(&mut msg_buf)?;
            let statement = read_cstring(&mut msg_buf)?;
            let num_formats = read_i16(&mut msg_buf)?;
            let mut param_formats = Vec::new();
            for _ in 0..num_formats {
                param_formats.push(read_i16(&mut msg_buf)?);
            }
            let num_values = read_i16(&mut msg_buf)?;
            let mut param_values = Vec::new();
            for _ in 0..num_values {
                let vlen = read_i32(&mut msg_buf)?;
                if vlen < 0 {
                    param_values.push(None);
                } else {
                    let vlen = vlen as usize;
                    if msg_buf.remaining() < vlen {
                        return Err(invalid("Bind parameter value truncated"));
                    }
                    param_values.push(Some(msg_buf.split_to(vlen).to_vec()));
                }
            }
            let num_result_formats = read_i16(&mut msg_buf)?;
            let mut result_formats = Vec::new();
            for _ in 0..num_result_formats {
                result_formats.push(read_i16(&mut msg_buf)?);
            }
            FrontendMessage::Bind {
                portal,
                statement,
                param_formats,
                param_values,
                result_formats,
            }
        }
        b'D' => {
            let kind = read_u8(&mut msg_buf)?;
            let name = read_cstring(&mut msg_buf)?;
            FrontendMessage::Describe { kind, name }
        }
        b'E' => {
            let portal = read_cstring(&mut msg_buf)?;
            let max_rows = if msg_buf.remaining() >= 4 {
                msg_buf.get_i32()
            } else {
                0
            };
            FrontendMessage::Execute { portal, max_rows }
        }
        b'S' => FrontendMessage::Sync,
        b'C' => {
            let kind = read_u8(&mut msg_buf)?;
            let name = read_cstring(&mut msg_buf)?;
            FrontendMessage::Close { kind, name }
        }
        b'H' => FrontendMessage::Flush,
        b'd' => FrontendMessage::CopyData(msg_buf.to_vec()),
        b'c' => FrontendMessage::CopyDone,
        b'f' => FrontendMessage::CopyFail(read_cstring(&mut msg_buf)?),
        other => {
            tracing::warn!(
                "Unknown frontend message type: {} (0x{:02x})",
                other as char,
                other
            );
            return Err(HeronError::Protocol(ProtocolError::UnexpectedMessage(
                other as char,
            )));
        }
    };
    Ok(Some(msg))
}

/// Encode a backend message into bytes.
pub fn encode_message(msg: &BackendMessage) -> BytesMut {
    let mut buf = BytesMut::new();

    match msg {
        BackendMessage::AuthenticationOk => {
            buf.put_u8(b'R');
            buf.put_i32(8);
            buf.put_i32(0);
        }
        BackendMessage::ParameterStatus { name, value } => {
            let len = 4 + name.len() + 1 + value.len() + 1;
            buf.put_u8(b'S');
            buf.put_i32(len as i32);
            write_cstring(&mut buf, name);
            write_cstring(&mut buf, value);
        }
        BackendMessage::BackendKeyData {
            process_id,
            secret_key,
        } => {
            buf.put_u8(b'K');
            buf.put_i32(12);
            buf.put_i32(*process_id);
            buf.put_i32(*secret_key);
        }
        BackendMessage::ReadyForQuery { txn_status } => {
            buf.put_u8(b'Z');
            buf.put_i32(5);
            buf.put_u8(*txn_status);
        }
        BackendMessage::RowDescription { fields } => {
            let mut body = BytesMut::new();
            body.put_i16(fields.len() as i16);
            for field in fields {
                write_cstring(&mut body, &field.name);
                body.put_i32(field.table_oid);
                body.put_i16(field.column_attr);
                body.put_i32(field.type_oid);
                body.put_i16(field.type_len);
                body.put_i32(field.type_modifier);
                body.put_i16(field.format_code);
            }
            frame(&mut buf, b'T', &body);
        }
        BackendMessage::DataRow { values } => {
            let mut body = BytesMut::new();
            body.put_i16(values.len() as i16);
            for val in values {
                match val {
                    Some(bytes) => {
                        body.put_i32(bytes.len() as i32);
                        body.put_slice(bytes);
                    }
                    None => body.put_i32(-1), // NULL
                }
            }
            frame(&mut buf, b'D', &body);
        }
        BackendMessage::CommandComplete { tag } => {
            let len = 4 + tag.len() + 1;
            buf.put_u8(b'C');
            buf.put_i32(len as i32);
            write_cstring(&mut buf, tag);
        }
        BackendMessage::ErrorResponse {
            severity,
            code,
            message,
            detail,
        } => {
            let mut body = BytesMut::new();
            body.put_u8(b'S');
            write_cstring(&mut body, severity);
            body.put_u8(b'V');
            write_cstring(&mut body, severity);
            body.put_u8(b'C');
            write_cstring(&mut body, code);
            body.put_u8(b'M');
            write_cstring(&mut body, message);
            if let Some(detail) = detail {
                body.put_u8(b'D');
                write_cstring(&mut body, detail);
            }
            body.put_u8(0); // terminator
            frame(&mut buf, b'E', &body);
        }
        BackendMessage::NoticeResponse {
            severity,
            code,
            message,
        } => {
            let mut body = BytesMut::new();
            body.put_u8(b'S');
            write_cstring(&mut body, severity);
            body.put_u8(b'V');
            write_cstring(&mut body, severity);
            body.put_u8(b'C');
            write_cstring(&mut body, code);
            body.put_u8(b'M');
            write_cstring(&mut body, message);
            body.put_u8(0);
            frame(&mut buf, b'N', &body);
        }
        BackendMessage::EmptyQueryResponse => empty(&mut buf, b'I'),
        BackendMessage::ParseComplete => empty(&mut buf, b'1'),
        BackendMessage::BindComplete => empty(&mut buf, b'2'),
        BackendMessage::CloseComplete => empty(&mut buf, b'3'),
        BackendMessage::NoData => empty(&mut buf, b'n'),
        BackendMessage::PortalSuspended => empty(&mut buf, b's'),
        BackendMessage::ParameterDescription { type_oids } => {
            buf.put_u8(b't');
            buf.put_i32(4 + 2 + type_oids.len() as i32 * 4);
            buf.put_i16(type_oids.len() as i16);
            for oid in type_oids {
                buf.put_i32(*oid);
            }
        }
        BackendMessage::CopyInResponse {
            format,
            column_formats,
        } => copy_response(&mut buf, b'G', *format, column_formats),
        BackendMessage::CopyOutResponse {
            format,
            column_formats,
        } => copy_response(&mut buf, b'H', *format, column_formats),
        BackendMessage::CopyData(data) => {
            buf.put_u8(b'd');
            buf.put_i32(4 + data.len() as i32);
            buf.put_slice(data);
        }
        BackendMessage::CopyDone => empty(&mut buf, b'c'),
    }

    buf
}

/// Encode a frontend message. Used by clients and test drivers.
pub fn encode_frontend(msg: &FrontendMessage) -> BytesMut {
    let mut buf = BytesMut::new();
    let mut body = BytesMut::new();
    match msg {
        FrontendMessage::Startup { version, params } => {
            body.put_i32(*version);
            let mut keys: Vec<_> = params.keys().collect();
            keys.sort();
            for key in keys {
                write_cstring(&mut body, key);
                write_cstring(&mut body, &params[key]);
            }
            body.put_u8(0);
            buf.put_i32(4 + body.len() as i32);
            buf.extend_from_slice(&body);
            return buf;
        }
        FrontendMessage::SslRequest | FrontendMessage::GssEncRequest => {
            let code = if matches!(msg, FrontendMessage::SslRequest) {
                SSL_REQUEST_CODE
            } else {
                GSSENC_REQUEST_CODE
            };
            buf.put_i32(8);
            buf.put_i32(code);
            return buf;
        }
        FrontendMessage::CancelRequest {
            process_id,
            secret_key,
        } => {
            buf.put_i32(16);
            buf.put_i32(CANCEL_REQUEST_CODE);
            buf.put_i32(*process_id);
            buf.put_i32(*secret_key);
            return buf;
        }
        FrontendMessage::Query(sql) => write_cstring(&mut body, sql),
        FrontendMessage::Parse {
            name,
            query,
            param_types,
        } => {
            write_cstring(&mut body, name);
            write_cstring(&mut body, query);
            body.put_i16(param_types.len() as i16);
            for oid in param_types {
                body.put_i32(*oid);
            }
        }
        FrontendMessage::Bind {
            portal,
            statement,
            param_formats,
            param_values,
            result_formats,
        } => {
            write_cstring(&mut body, portal);
            write_cstring(&mut body, statement);
            body.put_i16(param_formats.len() as i16);
            for f in param_formats {
                body.put_i16(*f);
            }
            body.put_i16(param_values.len() as i16);
            for v in param_values {
                match v {
                    Some(bytes) => {
                        body.put_i32(bytes.len() as i32);
                        body.put_slice(bytes);
                    }
                    None => body.put_i32(-1),
                }
            }
            body.put_i16(result_formats.len() as i16);
            for f in result_formats {
                body.put_i16(*f);
            }
        }
        FrontendMessage::Describe { kind, name } | FrontendMessage::Close { kind, name } => {
            body.put_u8(*kind);
            write_cstring(&mut body, name);
        }
        FrontendMessage::Execute { portal, max_rows } => {
            write_cstring(&mut body, portal);
            body.put_i32(*max_rows);
        }
        FrontendMessage::CopyData(data) => body.put_slice(data),
        FrontendMessage::CopyFail(reason) => write_cstring(&mut body, reason),
        FrontendMessage::Sync
        | FrontendMessage::Flush
        | FrontendMessage::Terminate
        | FrontendMessage::CopyDone => {}
    }
    frame(&mut buf, msg.code(), &body);
    buf
}

/// Decode one backend message. Used by clients and test drivers.
/// Returns Ok(None) if more data is needed.
pub fn decode_backend(buf: &mut BytesMut) -> HeronResult<Option<BackendMessage>> {
    if buf.len() < 5 {
        return Ok(None);
    }
    let code = buf[0];
    let len = (&buf[1..5]).get_i32();
    if len < 4 {
        return Err(invalid(format!("invalid message length {len}")));
    }
    if buf.len() < 1 + len as usize {
        return Ok(None);
    }
    buf.advance(5);
    let mut body = buf.split_to(len as usize - 4);

    let msg = match code {
        b'R' => {
            read_i32(&mut body)?;
            BackendMessage::AuthenticationOk
        }
        b'S' => BackendMessage::ParameterStatus {
            name: read_cstring(&mut body)?,
            value: read_cstring(&mut body)?,
        },
        b'K' => BackendMessage::BackendKeyData {
            process_id: read_i32(&mut body)?,
            secret_key: read_i32(&mut body)?,
        },
        b'Z' => BackendMessage::ReadyForQuery {
            txn_status: read_u8(&mut body)?,
        },
        b'T' => {
            let n = read_i16(&mut body)?;
            let mut fields = Vec::with_capacity(n.max(0) as usize);
            for _ in 0..n {
                fields.push(FieldDescription {
                    name: read_cstring(&mut body)?,
                    table_oid: read_i32(&mut body)?,
                    column_attr: read_i16(&mut body)?,
                    type_oid: read_i32(&mut body)?,
                    type_len: read_i16(&mut body)?,
                    type_modifier: read_i32(&mut body)?,
                    format_code: read_i16(&mut body)?,
                });
            }
            BackendMessage::RowDescription { fields }
        }
        b'D' => {
            let n = read_i16(&mut body)?;
            let mut values = Vec::with_capacity(n.max(0) as usize);
            for _ in 0..n {
                let vlen = read_i32(&mut body)?;
                if vlen < 0 {
                    values.push(None);
                } else {
                    if body.remaining() < vlen as usize {
                        return Err(invalid("DataRow value truncated"));
                    }
                    values.push(Some(body.split_to(vlen as usize).to_vec()));
                }
            }
            BackendMessage::DataRow { values }
        }
        b'C' => BackendMessage::CommandComplete {
            tag: read_cstring(&mut body)?,
        },
        b'E' | b'N' => {
            let (mut severity, mut sqlstate, mut message, mut detail) =
                (String::new(), String::new(), String::new(), None);
            loop {
                let field = read_u8(&mut body)?;
                if field == 0 {
                    break;
                }
                let value = read_cstring(&mut body)?;
                match field {
                    b'S' => severity = value,
                    b'C' => sqlstate = value,
                    b'M' => message = value,
                    b'D' => detail = Some(value),
                    _ => {}
                }
            }
            if code == b'E' {
                BackendMessage::ErrorResponse {
                    severity,
                    code: sqlstate,
                    message,
                    detail,
                }
            } else {
                BackendMessage::NoticeResponse {
                    severity,
                    code: sqlstate,
                    message,
                }
            }
        }
        b'I' => BackendMessage::EmptyQueryResponse,
        b'1' => BackendMessage::ParseComplete,
        b'2' => BackendMessage::BindComplete,
        b'3' => BackendMessage::CloseComplete,
        b'n' => BackendMessage::NoData,
        b's' => BackendMessage::PortalSuspended,
        b't' => {
            let n = read_i16(&mut body)?;
            let mut type_oids = Vec::with_capacity(n.max(0) as usize);
            for _ in 0..n {
                type_oids.push(read_i32(&mut body)?);
            }
            BackendMessage::ParameterDescription { type_oids }
        }
        b'G' | b'H' => {
            let format = read_u8(&mut body)?;
            let n = read_i16(&mut body)?;
            let mut column_formats = Vec::with_capacity(n.max(0) as usize);
            for _ in 0..n {
                column_formats.push(read_i16(&mut body)?);
            }
            if code == b'G' {
                BackendMessage::CopyInResponse {
                    format,
                    column_formats,
                }
            } else {
                BackendMessage::CopyOutResponse {
                    format,
                    column_formats,
                }
            }
        }
        b'd' => BackendMessage::CopyData(body.to_vec()),
        b'c' => BackendMessage::CopyDone,
        other => {
            return Err(invalid(format!(
                "unknown backend message type '{}'",
                other as char
            )))
        }
    };
    Ok(Some(msg))
}

fn frame(buf: &mut BytesMut, code: u8, body: &[u8]) {
    buf.put_u8(code);
    buf.put_i32(4 + body.len() as i32);
    buf.extend_from_slice(body);
}

fn empty(buf: &mut BytesMut, code: u8) {
    buf.put_u8(code);
    buf.put_i32(4);
}

fn copy_response(buf: &mut BytesMut, code: u8, format: u8, column_formats: &[i16]) {
    let len = 4 + 1 + 2 + column_formats.len() as i32 * 2;
    buf.put_u8(code);
    buf.put_i32(len);
    buf.put_u8(format);
    buf.put_i16(column_formats.len() as i16);
    for cf in column_formats {
        buf.put_i16(*cf);
    }
}

fn read_u8(buf: &mut BytesMut) -> HeronResult<u8> {
    if !buf.has_remaining() {
        return Err(invalid("message truncated"));
    }
    Ok(buf.get_u8())
}

fn read_i16(buf: &mut BytesMut) -> HeronResult<i16> {
    if buf.remaining() < 2 {
        return Err(invalid("message truncated"));
    }
    Ok(buf.get_i16())
}

fn read_i32(buf: &mut BytesMut) -> HeronResult<i32> {
    if buf.remaining() < 4 {
        return Err(invalid("message truncated"));
    }
    Ok(buf.get_i32())
}

fn read_cstring(buf: &mut BytesMut) -> HeronResult<String> {
    match buf.iter().position(|&b| b == 0) {
        Some(pos) => {
            let s = String::from_utf8(buf[..pos].to_vec())
                .map_err(|e| invalid(format!("invalid UTF-8 in cstring: {e}")))?;
            buf.advance(pos + 1);
            Ok(s)
        }
        None => Err(invalid("no null terminator in cstring")),
    }
}

fn write_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}
