//! Field and key values on the wire.
//!
//! A value is a tag byte from [`fabric_types::value::tag`] followed by a
//! fixed-width body (`I32`, `I64`, `F64`, `REF`) or a `u32` length and that
//! many bytes (`STR`, `BYTES`). `NULL` and both booleans are the tag alone.

use fabric_error::{FabricError, Result};
use fabric_types::value::tag;
use fabric_types::{ObjectId, Value};

use crate::buf::InBuf;
use crate::scalar::{ScalarReader, ScalarWriter};

/// Stage `value` for writing.
pub fn stage_value(writer: &mut ScalarWriter, value: &Value) -> Result<()> {
    writer.put_u8(value.tag());
    match value {
        Value::Null | Value::Bool(_) => {}
        Value::I32(v) => writer.put_i32(*v),
        Value::I64(v) => writer.put_i64(*v),
        Value::F64(v) => writer.put_u64(v.to_bits()),
        Value::Str(s) => stage_len_prefixed(writer, s.as_bytes())?,
        Value::Bytes(b) => stage_len_prefixed(writer, b)?,
        Value::Ref(id) => writer.put_u64(id.get()),
    }
    Ok(())
}

fn stage_len_prefixed(writer: &mut ScalarWriter, bytes: &[u8]) -> Result<()> {
    let len = u32::try_from(bytes.len()).map_err(|_| FabricError::Protocol {
        detail: format!("value of {} bytes is too long to encode", bytes.len()),
    })?;
    writer.put_u32(len);
    writer.put_bytes(bytes);
    Ok(())
}

#[derive(Debug)]
enum Step {
    Tag,
    Fixed { tag: u8 },
    Len { tag: u8 },
    Body { tag: u8, len: usize, buf: Vec<u8> },
}

/// Resumable decoder for one value at a time.
#[derive(Debug)]
pub struct ValueReader {
    step: Step,
    scalar: ScalarReader,
    max_len: u32,
}

impl ValueReader {
    /// Strings and byte values longer than `max_len` are rejected.
    #[must_use]
    pub fn new(max_len: u32) -> Self {
        Self {
            step: Step::Tag,
            scalar: ScalarReader::new(),
            max_len,
        }
    }

    /// Whether no value is partially decoded.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        matches!(self.step, Step::Tag) && self.scalar.is_idle()
    }

    /// Continue decoding; `Ok(None)` when more input is needed.
    pub fn read(&mut self, input: &mut InBuf) -> Result<Option<Value>> {
        loop {
            match &mut self.step {
                Step::Tag => {
                    let Some(t) = self.scalar.u8(input) else {
                        return Ok(None);
                    };
                    match t {
                        tag::NULL => return Ok(Some(Value::Null)),
                        tag::BOOL_FALSE => return Ok(Some(Value::Bool(false))),
                        tag::BOOL_TRUE => return Ok(Some(Value::Bool(true))),
                        tag::I32 | tag::I64 | tag::F64 | tag::REF => {
                            self.step = Step::Fixed { tag: t };
                        }
                        tag::STR | tag::BYTES => self.step = Step::Len { tag: t },
                        other => {
                            return Err(FabricError::Protocol {
                                detail: format!("unknown value tag {other}"),
                            });
                        }
                    }
                }
                Step::Fixed { tag: t } => {
                    let t = *t;
                    let value = match t {
                        tag::I32 => self.scalar.i32(input).map(Value::I32),
                        tag::I64 => self.scalar.i64(input).map(Value::I64),
                        tag::F64 => self.scalar.u64(input).map(|b| Value::F64(f64::from_bits(b))),
                        _ => match self.scalar.u64(input) {
                            Some(raw) => Some(Value::Ref(ObjectId::new(raw).ok_or_else(|| {
                                FabricError::Protocol {
                                    detail: "reference to object 0".to_owned(),
                                }
                            })?)),
                            None => None,
                        },
                    };
                    let Some(value) = value else {
                        return Ok(None);
                    };
                    self.step = Step::Tag;
                    return Ok(Some(value));
                }
                Step::Len { tag: t } => {
                    let t = *t;
                    let Some(len) = self.scalar.u32(input) else {
                        return Ok(None);
                    };
                    if len > self.max_len {
                        self.step = Step::Tag;
                        return Err(FabricError::Protocol {
                            detail: format!("value of {len} bytes exceeds limit {}", self.max_len),
                        });
                    }
                    let len = len as usize;
                    self.step = Step::Body {
                        tag: t,
                        len,
                        buf: Vec::with_capacity(len.min(4096)),
                    };
                }
                Step::Body { tag: t, len, buf } => {
                    if !ScalarReader::bytes_into(input, buf, *len) {
                        return Ok(None);
                    }
                    let (t, buf) = (*t, std::mem::take(buf));
                    self.step = Step::Tag;
                    return finish_body(t, buf).map(Some);
                }
            }
        }
    }
}

fn finish_body(t: u8, buf: Vec<u8>) -> Result<Value> {
    if t == tag::STR {
        String::from_utf8(buf)
            .map(Value::Str)
            .map_err(|err| FabricError::Protocol {
                detail: format!("string value is not UTF-8: {err}"),
            })
    } else {
        Ok(Value::Bytes(buf))
    }
}
