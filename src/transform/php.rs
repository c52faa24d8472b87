//! Decoder for PHP's `serialize()` format
//!
//! Supports the scalar types (`N`, `b`, `i`, `d`, `s`), arrays and objects.
//! Arrays whose keys are exactly `0..n` decode to JSON arrays, any other
//! array or object decodes to a JSON object with stringified keys.
//! References (`r`, `R`) decode to null. Arrays and objects may nest at
//! most [`MAX_DEPTH`] levels.

use serde_json::{Map, Number, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unserialize failed at byte {offset}: {reason}")]
pub struct UnserializeError {
    pub offset: usize,
    pub reason: String,
}

pub const MAX_DEPTH: usize = 64;

/// Decode one serialized value. Trailing bytes after the value are an error.
pub fn unserialize(input: &str) -> Result<Value, UnserializeError> {
    let mut parser = Parser {
        bytes: input.as_bytes(),
        pos: 0,
        depth: 0,
    };
    let value = parser.value()?;
    if parser.pos != parser.bytes.len() {
        return Err(parser.error("trailing data"));
    }
    Ok(value)
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
    depth: usize,
}

/// Array or object keys
enum Key {
    Int(i64),
    Str(String),
}

impl Key {
    fn into_string(self) -> String {
        match self {
            Key::Int(i) => i.to_string(),
            Key::Str(s) => s,
        }
    }
}

impl<'a> Parser<'a> {
    fn error(&self, reason: impl Into<String>) -> UnserializeError {
        UnserializeError {
            offset: self.pos,
            reason: reason.into(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> Result<(), UnserializeError> {
        match self.peek() {
            Some(b) if b == byte => {
                self.pos += 1;
                Ok(())
            }
            Some(b) => {
                let found = b as char;
                Err(self.error(format!("expected '{}', found '{}'", byte as char, found)))
            }
            None => Err(self.error(format!("expected '{}', found end of input", byte as char))),
        }
    }

    /// Bytes up to (not including) `delim`, consuming the delimiter
    fn until(&mut self, delim: u8) -> Result<&'a str, UnserializeError> {
        let bytes = self.bytes;
        let rest = &bytes[self.pos..];
        let len = rest
            .iter()
            .position(|&b| b == delim)
            .ok_or_else(|| self.error(format!("missing '{}'", delim as char)))?;
        let text = std::str::from_utf8(&rest[..len]).map_err(|_| self.error("invalid utf-8"))?;
        self.pos += len + 1;
        Ok(text)
    }

    fn int_until(&mut self, delim: u8) -> Result<i64, UnserializeError> {
        let start = self.pos;
        let text = self.until(delim)?;
        text.parse().map_err(|_| UnserializeError {
            offset: start,
            reason: format!("invalid integer '{}'", text),
        })
    }

    fn length(&mut self) -> Result<usize, UnserializeError> {
        let start = self.pos;
        let len = self.int_until(b':')?;
        usize::try_from(len).map_err(|_| UnserializeError {
            offset: start,
            reason: format!("negative length {}", len),
        })
    }

    /// `<len>:"<bytes>"`
    fn quoted(&mut self) -> Result<String, UnserializeError> {
        let len = self.length()?;
        self.expect(b'"')?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| self.error("string length past end of input"))?;
        let text = String::from_utf8_lossy(&self.bytes[self.pos..end]).into_owned();
        self.pos = end;
        self.expect(b'"')?;
        Ok(text)
    }

    fn value(&mut self) -> Result<Value, UnserializeError> {
        let tag = self.peek().ok_or_else(|| self.error("unexpected end of input"))?;
        self.pos += 1;
        match tag {
            b'N' => {
                self.expect(b';')?;
                Ok(Value::Null)
            }
            b'b' => {
                self.expect(b':')?;
                match self.int_until(b';')? {
                    0 => Ok(Value::Bool(false)),
                    1 => Ok(Value::Bool(true)),
                    other => Err(self.error(format!("invalid boolean {}", other))),
                }
            }
            b'i' => {
                self.expect(b':')?;
                Ok(Value::from(self.int_until(b';')?))
            }
            b'd' => {
                self.expect(b':')?;
                let start = self.pos;
                let text = self.until(b';')?;
                let v: f64 = match text {
                    "INF" | "-INF" | "NAN" => return Ok(Value::Null),
                    _ => text.parse().map_err(|_| UnserializeError {
                        offset: start,
                        reason: format!("invalid float '{}'", text),
                    })?,
                };
                Ok(Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null))
            }
            b's' => {
                self.expect(b':')?;
                let text = self.quoted()?;
                self.expect(b';')?;
                Ok(Value::String(text))
            }
            b'r' | b'R' => {
                self.expect(b':')?;
                self.int_until(b';')?;
                Ok(Value::Null)
            }
            b'a' => {
                self.expect(b':')?;
                let entries = self.entries()?;
                Ok(collect_array(entries))
            }
            b'O' => {
                self.expect(b':')?;
                // class name is dropped, only the properties are kept
                self.quoted()?;
                self.expect(b':')?;
                let entries = self.entries()?;
                let object = entries
                    .into_iter()
                    .map(|(k, v)| (property_name(k.into_string()), v))
                    .collect::<Map<_, _>>();
                Ok(Value::Object(object))
            }
            other => Err(UnserializeError {
                offset: self.pos - 1,
                reason: format!("unknown type tag '{}'", other as char),
            }),
        }
    }

    /// `<n>:{<key><value>...}`
    fn entries(&mut self) -> Result<Vec<(Key, Value)>, UnserializeError> {
        if self.depth >= MAX_DEPTH {
            return Err(self.error(format!("nesting deeper than {} levels", MAX_DEPTH)));
        }
        let count = self.length()?;
        self.expect(b'{')?;
        self.depth += 1;
        let mut entries = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let key = self.key()?;
            let value = self.value()?;
            entries.push((key, value));
        }
        self.depth -= 1;
        self.expect(b'}')?;
        Ok(entries)
    }

    fn key(&mut self) -> Result<Key, UnserializeError> {
        match self.value()? {
            Value::Number(n) => n
                .as_i64()
                .map(Key::Int)
                .ok_or_else(|| self.error("non-integer numeric key")),
            Value::String(s) => Ok(Key::Str(s)),
            _ => Err(self.error("array key must be an integer or string")),
        }
    }
}

fn collect_array(entries: Vec<(Key, Value)>) -> Value {
    let sequential = entries
        .iter()
        .enumerate()
        .all(|(i, (k, _))| matches!(k, Key::Int(n) if *n == i as i64));
    if sequential {
        Value::Array(entries.into_iter().map(|(_, v)| v).collect())
    } else {
        Value::Object(entries.into_iter().map(|(k, v)| (k.into_string(), v)).collect())
    }
}

/// Protected (`\0*\0name`) and private (`\0Class\0name`) properties keep only `name`
fn property_name(raw: String) -> String {
    match raw.strip_prefix('\0') {
        Some(rest) => rest
            .split_once('\0')
            .map(|(_, name)| name.to_string())
            .unwrap_or_else(|| rest.to_string()),
        None => raw,
    }
}
