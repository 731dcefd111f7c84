//! Parsing of D-Bus type signatures into type trees.
//!
//! A signature is a compact string like `a{sv}` describing the types of a
//! sequence of values. [`parse_signature`] turns it into a list of
//! [`DBusType`] nodes which drive the wire codec.

use crate::error::*;

/// Signature strings are limited to 255 bytes on the wire.
pub const MAX_SIGNATURE_LEN: usize = 255;
/// Arrays and structs may each nest at most 32 levels deep.
pub const MAX_NESTING_DEPTH: usize = 32;

/// A single complete D-Bus type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DBusType {
    /// `y` - unsigned 8 bit
    Byte,
    /// `b` - boolean, 32 bit on the wire
    Boolean,
    /// `n` - signed 16 bit
    Int16,
    /// `q` - unsigned 16 bit
    Uint16,
    /// `i` - signed 32 bit
    Int32,
    /// `u` - unsigned 32 bit
    Uint32,
    /// `x` - signed 64 bit
    Int64,
    /// `t` - unsigned 64 bit
    Uint64,
    /// `d` - IEEE-754 double
    Double,
    /// `h` - index into an out-of-band file descriptor array
    UnixFd,
    /// `s` - UTF-8 string
    String,
    /// `o` - object path
    ObjectPath,
    /// `g` - type signature
    Signature,
    /// `aT` - homogeneous array
    Array(Box<DBusType>),
    /// `(T...)` - fixed-shape tuple, at least one field
    Struct(Vec<DBusType>),
    /// `{KV}` - key/value pair, only directly below an array
    DictEntry(Box<DBusType>, Box<DBusType>),
    /// `v` - value carrying its own signature
    Variant,
}

impl DBusType {
    /// Natural alignment of this type on the wire.
    pub fn alignment(&self) -> usize {
        match self {
            DBusType::Byte | DBusType::Signature | DBusType::Variant => 1,
            DBusType::Int16 | DBusType::Uint16 => 2,
            DBusType::Boolean
            | DBusType::Int32
            | DBusType::Uint32
            | DBusType::UnixFd
            | DBusType::String
            | DBusType::ObjectPath
            | DBusType::Array(_) => 4,
            DBusType::Int64
            | DBusType::Uint64
            | DBusType::Double
            | DBusType::Struct(_)
            | DBusType::DictEntry(_, _) => 8,
        }
    }

    /// True for types permitted as dict-entry keys.
    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            DBusType::Array(_) | DBusType::Struct(_) | DBusType::DictEntry(_, _) | DBusType::Variant
        )
    }

    /// Render the type back into its signature string.
    pub fn signature(&self) -> String {
        let mut out = String::new();
        self.write_signature(&mut out);
        out
    }

    fn write_signature(&self, out: &mut String) {
        match self {
            DBusType::Byte => out.push('y'),
            DBusType::Boolean => out.push('b'),
            DBusType::Int16 => out.push('n'),
            DBusType::Uint16 => out.push('q'),
            DBusType::Int32 => out.push('i'),
            DBusType::Uint32 => out.push('u'),
            DBusType::Int64 => out.push('x'),
            DBusType::Uint64 => out.push('t'),
            DBusType::Double => out.push('d'),
            DBusType::UnixFd => out.push('h'),
            DBusType::String => out.push('s'),
            DBusType::ObjectPath => out.push('o'),
            DBusType::Signature => out.push('g'),
            DBusType::Array(elt) => {
                out.push('a');
                elt.write_signature(out);
            }
            DBusType::Struct(fields) => {
                out.push('(');
                for f in fields {
                    f.write_signature(out);
                }
                out.push(')');
            }
            DBusType::DictEntry(k, v) => {
                out.push('{');
                k.write_signature(out);
                v.write_signature(out);
                out.push('}');
            }
            DBusType::Variant => out.push('v'),
        }
    }
}

/// Render a sequence of types back into one signature string.
pub fn signature_string(types: &[DBusType]) -> String {
    let mut out = String::new();
    for t in types {
        t.write_signature(&mut out);
    }
    out
}

struct SignatureParser<'a> {
    sig: &'a [u8],
    pos: usize,
    array_depth: usize,
    struct_depth: usize,
}

impl<'a> SignatureParser<'a> {
    fn new(sig: &'a str) -> Result<Self> {
        if sig.len() > MAX_SIGNATURE_LEN {
            return Err(context!(ErrorKind::Signature(format!(
                "signature longer than {} bytes",
                MAX_SIGNATURE_LEN
            ))));
        }
        Ok(SignatureParser {
            sig: sig.as_bytes(),
            pos: 0,
            array_depth: 0,
            struct_depth: 0,
        })
    }

    fn peek(&self) -> Option<u8> {
        self.sig.get(self.pos).copied()
    }

    fn next_type(&mut self) -> Result<DBusType> {
        let code = match self.peek() {
            Some(c) => c,
            None => {
                return Err(context!(ErrorKind::Signature(
                    "unexpected end of signature".into()
                )));
            }
        };
        self.pos += 1;

        match code {
            b'y' => Ok(DBusType::Byte),
            b'b' => Ok(DBusType::Boolean),
            b'n' => Ok(DBusType::Int16),
            b'q' => Ok(DBusType::Uint16),
            b'i' => Ok(DBusType::Int32),
            b'u' => Ok(DBusType::Uint32),
            b'x' => Ok(DBusType::Int64),
            b't' => Ok(DBusType::Uint64),
            b'd' => Ok(DBusType::Double),
            b'h' => Ok(DBusType::UnixFd),
            b's' => Ok(DBusType::String),
            b'o' => Ok(DBusType::ObjectPath),
            b'g' => Ok(DBusType::Signature),
            b'v' => Ok(DBusType::Variant),
            b'a' => {
                self.array_depth += 1;
                if self.array_depth > MAX_NESTING_DEPTH {
                    return Err(context!(ErrorKind::Signature(format!(
                        "arrays nested deeper than {}",
                        MAX_NESTING_DEPTH
                    ))));
                }
                let elt = if self.peek() == Some(b'{') {
                    self.pos += 1;
                    self.dict_entry()?
                } else {
                    self.next_type()?
                };
                self.array_depth -= 1;
                Ok(DBusType::Array(Box::new(elt)))
            }
            b'(' => {
                self.struct_depth += 1;
                if self.struct_depth > MAX_NESTING_DEPTH {
                    return Err(context!(ErrorKind::Signature(format!(
                        "structs nested deeper than {}",
                        MAX_NESTING_DEPTH
                    ))));
                }
                let mut fields = Vec::new();
                while self.peek() != Some(b')') {
                    if self.peek().is_none() {
                        return Err(context!(ErrorKind::Signature("unmatched '('".into())));
                    }
                    fields.push(self.next_type()?);
                }
                self.pos += 1;
                self.struct_depth -= 1;
                if fields.is_empty() {
                    return Err(context!(ErrorKind::Signature("empty struct '()'".into())));
                }
                Ok(DBusType::Struct(fields))
            }
            b'{' => Err(context!(ErrorKind::Signature(
                "dict entry only allowed directly inside an array".into()
            ))),
            b')' | b'}' => Err(context!(ErrorKind::Signature(format!(
                "unexpected '{}'",
                code as char
            )))),
            c => Err(context!(ErrorKind::Signature(format!(
                "unknown type code {:?}",
                c as char
            )))),
        }
    }

    fn dict_entry(&mut self) -> Result<DBusType> {
        // Dict entries count towards struct nesting.
        self.struct_depth += 1;
        if self.struct_depth > MAX_NESTING_DEPTH {
            return Err(context!(ErrorKind::Signature(format!(
                "structs nested deeper than {}",
                MAX_NESTING_DEPTH
            ))));
        }
        let key = self.next_type()?;
        if !key.is_basic() {
            return Err(context!(ErrorKind::Signature(format!(
                "dict key must be a basic type, not '{}'",
                key.signature()
            ))));
        }
        let value = self.next_type()?;
        match self.peek() {
            Some(b'}') => {
                self.pos += 1;
                self.struct_depth -= 1;
                Ok(DBusType::DictEntry(Box::new(key), Box::new(value)))
            }
            Some(_) => Err(context!(ErrorKind::Signature(
                "dict entry must have exactly two fields".into()
            ))),
            None => Err(context!(ErrorKind::Signature("unmatched '{'".into()))),
        }
    }
}

/// Parse a signature string into an ordered sequence of complete types.
pub fn parse_signature(sig: &str) -> Result<Vec<DBusType>> {
    let mut parser = SignatureParser::new(sig)?;
    let mut types = Vec::new();
    while parser.peek().is_some() {
        types.push(parser.next_type()?);
    }
    Ok(types)
}

/// Parse a signature which must contain exactly one complete type.
///
/// This is the form required inside variants.
pub fn parse_single_type(sig: &str) -> Result<DBusType> {
    let mut parser = SignatureParser::new(sig)?;
    let t = parser.next_type()?;
    if parser.peek().is_some() {
        return Err(context!(ErrorKind::Signature(format!(
            "'{}' is not a single complete type",
            sig
        ))));
    }
    Ok(t)
}
