//! Bind parameter decoding.

use heron_common::datum::Datum;
use heron_common::error::{CompileError, ExecutionError, HeronError, HeronResult};
use heron_common::types::DataType;

use crate::ast::Arg;
use crate::outputter::{resolve_format, validate_formats};

/// Decode Bind parameter values against the statement's parameter types.
/// `formats` follows the usual rule: none means text, one applies to all,
/// otherwise one per parameter.
pub fn decode_params(
    values: &[Option<Vec<u8>>],
    formats: &[i16],
    types: &[DataType],
) -> HeronResult<Vec<Datum>> {
    if values.len() != types.len() {
        return Err(CompileError::WrongParameterCount {
            expected: types.len(),
            got: values.len(),
        }
        .into());
    }
    validate_formats(formats, values.len(), "Bind parameter list")?;

    values
        .iter()
        .zip(types)
        .enumerate()
        .map(|(i, (raw, ty))| decode_param(raw.as_deref(), resolve_format(formats, i), *ty, i + 1))
        .collect()
}

fn decode_param(raw: Option<&[u8]>, format: i16, ty: DataType, position: usize) -> HeronResult<Datum> {
    let bytes = match raw {
        None => return Ok(Datum::Null),
        Some(b) => b,
    };
    if format == 1 {
        return Datum::from_pg_binary(bytes, ty).map_err(|e| {
            ExecutionError::InvalidBinaryRepresentation(format!("parameter ${position}: {e}")).into()
        });
    }
    let text = std::str::from_utf8(bytes).map_err(|_| {
        HeronError::from(ExecutionError::InvalidTextRepresentation(format!(
            "parameter ${position} is not valid UTF-8"
        )))
    })?;
    Datum::from_pg_text(text, ty).map_err(|e| ExecutionError::InvalidTextRepresentation(e).into())
}

/// Resolve EXECUTE / CALL arguments: literals are parsed as the target
/// type, `$n` refers to the enclosing portal's bindings.
pub fn resolve_args(args: &[Arg], types: &[DataType], bindings: &[Datum]) -> HeronResult<Vec<Datum>> {
    if args.len() != types.len() {
        return Err(CompileError::WrongParameterCount {
            expected: types.len(),
            got: args.len(),
        }
        .into());
    }
    args.iter()
        .zip(types)
        .map(|(arg, ty)| match arg {
            Arg::Literal(None) => Ok(Datum::Null),
            Arg::Literal(Some(text)) => Datum::from_pg_text(text, *ty)
                .map_err(|e| ExecutionError::InvalidTextRepresentation(e).into()),
            Arg::Param(n) => bindings.get(n.wrapping_sub(1)).cloned().ok_or_else(|| {
                CompileError::Semantic(format!("there is no parameter ${n}")).into()
            }),
        })
        .collect()
}
