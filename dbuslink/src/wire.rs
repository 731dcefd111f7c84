//! The signature-driven value codec.
//!
//! Marshalling walks a [`DBusType`] tree together with a [`Value`] and emits
//! bytes with the exact alignment padding the D-Bus wire format requires.
//! Offsets are relative to the start of the output buffer, which is the
//! encoding anchor (the start of a message for headers, the start of the
//! body for body values). Unmarshalling mirrors the walk and validates
//! everything the format promises: length fields, UTF-8, object path
//! syntax, boolean canonicalisation and exact array extents.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::error::*;
use crate::signature::{parse_signature, parse_single_type, DBusType};

/// A single array may not exceed 64 MiB on the wire.
pub const MAX_ARRAY_SIZE: usize = 1 << 26;

/// Byte order of one message. The first byte of every frame declares it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    /// The flag byte used on the wire: `l` or `B`.
    pub fn code(self) -> u8 {
        match self {
            Endianness::Little => b'l',
            Endianness::Big => b'B',
        }
    }

    pub fn from_code(code: u8) -> Option<Endianness> {
        match code {
            b'l' => Some(Endianness::Little),
            b'B' => Some(Endianness::Big),
            _ => None,
        }
    }
}

impl Default for Endianness {
    fn default() -> Self {
        Endianness::Little
    }
}

/// An in-memory D-Bus value.
///
/// Dicts keep their entries in wire order; the order carries no meaning.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(u8),
    Bool(bool),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    UnixFd(u32),
    Str(String),
    ObjectPath(String),
    Signature(String),
    Array(Vec<Value>),
    Struct(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Variant(String, Box<Value>),
}

impl Value {
    /// Borrow the inner text of any of the three string kinds.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::ObjectPath(s) | Value::Signature(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::Uint32(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Value {
        Value::Byte(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Value {
        Value::Int16(v)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Value {
        Value::Uint16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Value {
        Value::Int32(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Value {
        Value::Uint32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Int64(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Value {
        Value::Uint64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Str(v.into())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::Str(v)
    }
}

pub(crate) fn padding(pos: usize, alignment: usize) -> usize {
    match pos % alignment {
        0 => 0,
        rem => alignment - rem,
    }
}

/// Check that an object path is well formed: `/`, or `/`-joined non-empty
/// segments of `[A-Za-z0-9_]`. Double or trailing slashes are rejected.
pub fn validate_object_path(path: &str) -> Result<()> {
    let invalid = || context!(ErrorKind::InvalidObjectPath(path.into()));

    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') || path.ends_with('/') {
        return Err(invalid());
    }
    for segment in path[1..].split('/') {
        if segment.is_empty() {
            return Err(invalid());
        }
        if !segment
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            return Err(invalid());
        }
    }
    Ok(())
}

/// Check that `value` fits the shape of `ty` without emitting any bytes.
pub fn check_type(ty: &DBusType, value: &Value) -> Result<()> {
    let mismatch = || {
        context!(ErrorKind::Marshal(format!(
            "value {:?} does not fit type '{}'",
            value,
            ty.signature()
        )))
    };

    match (ty, value) {
        (DBusType::Byte, Value::Byte(_))
        | (DBusType::Boolean, Value::Bool(_))
        | (DBusType::Int16, Value::Int16(_))
        | (DBusType::Uint16, Value::Uint16(_))
        | (DBusType::Int32, Value::Int32(_))
        | (DBusType::Uint32, Value::Uint32(_))
        | (DBusType::Int64, Value::Int64(_))
        | (DBusType::Uint64, Value::Uint64(_))
        | (DBusType::Double, Value::Double(_))
        | (DBusType::UnixFd, Value::UnixFd(_))
        | (DBusType::String, Value::Str(_))
        | (DBusType::ObjectPath, Value::ObjectPath(_))
        | (DBusType::Signature, Value::Signature(_)) => Ok(()),
        (DBusType::Array(elt), Value::Array(items)) => {
            if matches!(**elt, DBusType::DictEntry(_, _)) {
                return Err(mismatch());
            }
            for item in items {
                check_type(elt, item)?;
            }
            Ok(())
        }
        (DBusType::Array(elt), Value::Dict(pairs)) => match &**elt {
            DBusType::DictEntry(kt, vt) => {
                for (k, v) in pairs {
                    check_type(kt, k)?;
                    check_type(vt, v)?;
                }
                Ok(())
            }
            _ => Err(mismatch()),
        },
        (DBusType::Struct(fields), Value::Struct(values)) => {
            if fields.len() != values.len() {
                return Err(mismatch());
            }
            for (f, v) in fields.iter().zip(values) {
                check_type(f, v)?;
            }
            Ok(())
        }
        (DBusType::Variant, Value::Variant(sig, inner)) => {
            let inner_ty = parse_single_type(sig)?;
            check_type(&inner_ty, inner)
        }
        _ => Err(mismatch()),
    }
}

/// Serialises values into a growing buffer.
pub struct Marshaller {
    buf: Vec<u8>,
    endianness: Endianness,
}

impl Marshaller {
    pub fn new(endianness: Endianness) -> Self {
        Marshaller {
            buf: Vec::new(),
            endianness,
        }
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    /// Emit zero bytes until the write position is a multiple of `alignment`.
    pub fn pad(&mut self, alignment: usize) {
        let pad = padding(self.buf.len(), alignment);
        self.buf.extend(std::iter::repeat(0u8).take(pad));
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        let mut b = [0u8; 2];
        match self.endianness {
            Endianness::Little => LittleEndian::write_u16(&mut b, v),
            Endianness::Big => BigEndian::write_u16(&mut b, v),
        }
        self.buf.extend_from_slice(&b);
    }

    pub fn put_u32(&mut self, v: u32) {
        let mut b = [0u8; 4];
        match self.endianness {
            Endianness::Little => LittleEndian::write_u32(&mut b, v),
            Endianness::Big => BigEndian::write_u32(&mut b, v),
        }
        self.buf.extend_from_slice(&b);
    }

    pub fn put_u64(&mut self, v: u64) {
        let mut b = [0u8; 8];
        match self.endianness {
            Endianness::Little => LittleEndian::write_u64(&mut b, v),
            Endianness::Big => BigEndian::write_u64(&mut b, v),
        }
        self.buf.extend_from_slice(&b);
    }

    fn patch_u32(&mut self, pos: usize, v: u32) {
        let b = &mut self.buf[pos..pos + 4];
        match self.endianness {
            Endianness::Little => LittleEndian::write_u32(b, v),
            Endianness::Big => BigEndian::write_u32(b, v),
        }
    }

    /// Marshal one value of the given type, padding first to its alignment.
    pub fn marshal(&mut self, ty: &DBusType, value: &Value) -> Result<()> {
        let mismatch = || {
            context!(ErrorKind::Marshal(format!(
                "value {:?} does not fit type '{}'",
                value,
                ty.signature()
            )))
        };

        match (ty, value) {
            (DBusType::Byte, Value::Byte(v)) => self.put_u8(*v),
            (DBusType::Boolean, Value::Bool(v)) => {
                self.pad(4);
                self.put_u32(*v as u32);
            }
            (DBusType::Int16, Value::Int16(v)) => {
                self.pad(2);
                self.put_u16(*v as u16);
            }
            (DBusType::Uint16, Value::Uint16(v)) => {
                self.pad(2);
                self.put_u16(*v);
            }
            (DBusType::Int32, Value::Int32(v)) => {
                self.pad(4);
                self.put_u32(*v as u32);
            }
            (DBusType::Uint32, Value::Uint32(v)) => {
                self.pad(4);
                self.put_u32(*v);
            }
            (DBusType::UnixFd, Value::UnixFd(v)) => {
                self.pad(4);
                self.put_u32(*v);
            }
            (DBusType::Int64, Value::Int64(v)) => {
                self.pad(8);
                self.put_u64(*v as u64);
            }
            (DBusType::Uint64, Value::Uint64(v)) => {
                self.pad(8);
                self.put_u64(*v);
            }
            (DBusType::Double, Value::Double(v)) => {
                self.pad(8);
                self.put_u64(v.to_bits());
            }
            (DBusType::String, Value::Str(s)) => {
                self.marshal_string(s)?;
            }
            (DBusType::ObjectPath, Value::ObjectPath(s)) => {
                validate_object_path(s)?;
                self.marshal_string(s)?;
            }
            (DBusType::Signature, Value::Signature(s)) => {
                parse_signature(s)?;
                self.marshal_signature(s);
            }
            (DBusType::Array(elt), value) => {
                self.pad(4);
                let len_pos = self.buf.len();
                self.put_u32(0);
                // Element alignment padding is emitted even for an empty
                // array.
                self.pad(elt.alignment());
                let data_start = self.buf.len();

                match (&**elt, value) {
                    (DBusType::DictEntry(kt, vt), Value::Dict(pairs)) => {
                        for (k, v) in pairs {
                            self.pad(8);
                            self.marshal(kt, k)?;
                            self.marshal(vt, v)?;
                        }
                    }
                    (DBusType::DictEntry(_, _), _) => return Err(mismatch()),
                    (_, Value::Array(items)) => {
                        for item in items {
                            self.marshal(elt, item)?;
                        }
                    }
                    _ => return Err(mismatch()),
                }

                let size = self.buf.len() - data_start;
                if size > MAX_ARRAY_SIZE {
                    return Err(context!(ErrorKind::SizeLimit(format!(
                        "array of {} bytes exceeds the 64 MiB limit",
                        size
                    ))));
                }
                self.patch_u32(len_pos, size as u32);
            }
            (DBusType::Struct(fields), Value::Struct(values)) => {
                if fields.len() != values.len() {
                    return Err(mismatch());
                }
                self.pad(8);
                for (f, v) in fields.iter().zip(values) {
                    self.marshal(f, v)?;
                }
            }
            (DBusType::DictEntry(_, _), _) => {
                return Err(context!(ErrorKind::Marshal(
                    "dict entry outside of an array".into()
                )));
            }
            (DBusType::Variant, Value::Variant(sig, inner)) => {
                let inner_ty = parse_single_type(sig)?;
                self.marshal_signature(sig);
                self.marshal(&inner_ty, inner)?;
            }
            _ => return Err(mismatch()),
        }
        Ok(())
    }

    fn marshal_string(&mut self, s: &str) -> Result<()> {
        if s.as_bytes().contains(&0) {
            return Err(context!(ErrorKind::Marshal(
                "string contains a NUL byte".into()
            )));
        }
        self.pad(4);
        self.put_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        Ok(())
    }

    fn marshal_signature(&mut self, s: &str) {
        self.put_u8(s.len() as u8);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }
}

/// Deserialises values from a borrowed buffer.
///
/// The buffer's first byte is the encoding anchor: all alignment is
/// computed relative to it.
pub struct Unmarshaller<'a> {
    buf: &'a [u8],
    pos: usize,
    endianness: Endianness,
}

impl<'a> Unmarshaller<'a> {
    pub fn new(buf: &'a [u8], endianness: Endianness) -> Self {
        Unmarshaller {
            buf,
            pos: 0,
            endianness,
        }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn truncated() -> Error {
        context!(ErrorKind::Marshal("unexpected end of data".into()))
    }

    fn align(&mut self, alignment: usize) -> Result<()> {
        let new_pos = self.pos + padding(self.pos, alignment);
        if new_pos > self.buf.len() {
            return Err(Self::truncated());
        }
        self.pos = new_pos;
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Self::truncated());
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(match self.endianness {
            Endianness::Little => LittleEndian::read_u16(b),
            Endianness::Big => BigEndian::read_u16(b),
        })
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(match self.endianness {
            Endianness::Little => LittleEndian::read_u32(b),
            Endianness::Big => BigEndian::read_u32(b),
        })
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(match self.endianness {
            Endianness::Little => LittleEndian::read_u64(b),
            Endianness::Big => BigEndian::read_u64(b),
        })
    }

    /// Unmarshal one value of the given type, skipping alignment padding
    /// first.
    pub fn unmarshal(&mut self, ty: &DBusType) -> Result<Value> {
        self.align(ty.alignment())?;
        match ty {
            DBusType::Byte => Ok(Value::Byte(self.get_u8()?)),
            DBusType::Boolean => match self.get_u32()? {
                0 => Ok(Value::Bool(false)),
                1 => Ok(Value::Bool(true)),
                v => Err(context!(ErrorKind::InvalidBool(v))),
            },
            DBusType::Int16 => Ok(Value::Int16(self.get_u16()? as i16)),
            DBusType::Uint16 => Ok(Value::Uint16(self.get_u16()?)),
            DBusType::Int32 => Ok(Value::Int32(self.get_u32()? as i32)),
            DBusType::Uint32 => Ok(Value::Uint32(self.get_u32()?)),
            DBusType::UnixFd => Ok(Value::UnixFd(self.get_u32()?)),
            DBusType::Int64 => Ok(Value::Int64(self.get_u64()? as i64)),
            DBusType::Uint64 => Ok(Value::Uint64(self.get_u64()?)),
            DBusType::Double => Ok(Value::Double(f64::from_bits(self.get_u64()?))),
            DBusType::String => Ok(Value::Str(self.read_string()?)),
            DBusType::ObjectPath => {
                let s = self.read_string()?;
                validate_object_path(&s)?;
                Ok(Value::ObjectPath(s))
            }
            DBusType::Signature => {
                let s = self.read_signature_str()?;
                parse_signature(&s)?;
                Ok(Value::Signature(s))
            }
            DBusType::Array(elt) => {
                let size = self.get_u32()? as usize;
                if size > MAX_ARRAY_SIZE {
                    return Err(context!(ErrorKind::SizeLimit(format!(
                        "array of {} bytes exceeds the 64 MiB limit",
                        size
                    ))));
                }
                self.align(elt.alignment())?;
                let end = self.pos + size;
                if end > self.buf.len() {
                    return Err(Self::truncated());
                }

                if let DBusType::DictEntry(kt, vt) = &**elt {
                    let mut pairs = Vec::new();
                    while self.pos < end {
                        self.align(8)?;
                        let k = self.unmarshal(kt)?;
                        let v = self.unmarshal(vt)?;
                        pairs.push((k, v));
                    }
                    if self.pos != end {
                        return Err(context!(ErrorKind::Marshal(
                            "array contents overran the declared length".into()
                        )));
                    }
                    Ok(Value::Dict(pairs))
                } else {
                    let mut items = Vec::new();
                    while self.pos < end {
                        items.push(self.unmarshal(elt)?);
                    }
                    if self.pos != end {
                        return Err(context!(ErrorKind::Marshal(
                            "array contents overran the declared length".into()
                        )));
                    }
                    Ok(Value::Array(items))
                }
            }
            DBusType::Struct(fields) => {
                let mut values = Vec::with_capacity(fields.len());
                for f in fields {
                    values.push(self.unmarshal(f)?);
                }
                Ok(Value::Struct(values))
            }
            DBusType::DictEntry(_, _) => Err(context!(ErrorKind::Marshal(
                "dict entry outside of an array".into()
            ))),
            DBusType::Variant => {
                let sig = self.read_signature_str()?;
                let inner_ty = parse_single_type(&sig)?;
                let inner = self.unmarshal(&inner_ty)?;
                Ok(Value::Variant(sig, Box::new(inner)))
            }
        }
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.get_u32()? as usize;
        let bytes = self.take(len)?;
        let s = ::std::str::from_utf8(bytes)
            .map_err(|_| context!(ErrorKind::Marshal("string is not valid UTF-8".into())))?
            .to_owned();
        if self.get_u8()? != 0 {
            return Err(context!(ErrorKind::Marshal(
                "string missing NUL terminator".into()
            )));
        }
        Ok(s)
    }

    fn read_signature_str(&mut self) -> Result<String> {
        let len = self.get_u8()? as usize;
        let bytes = self.take(len)?;
        let s = ::std::str::from_utf8(bytes)
            .map_err(|_| context!(ErrorKind::Marshal("signature is not valid UTF-8".into())))?
            .to_owned();
        if self.get_u8()? != 0 {
            return Err(context!(ErrorKind::Marshal(
                "signature missing NUL terminator".into()
            )));
        }
        Ok(s)
    }
}

/// Marshal a sequence of values anchored at offset zero.
pub fn marshal_values(
    endianness: Endianness,
    types: &[DBusType],
    values: &[Value],
) -> Result<Vec<u8>> {
    if types.len() != values.len() {
        return Err(context!(ErrorKind::Marshal(format!(
            "{} values for {} types",
            values.len(),
            types.len()
        ))));
    }
    let mut m = Marshaller::new(endianness);
    for (t, v) in types.iter().zip(values) {
        m.marshal(t, v)?;
    }
    Ok(m.into_vec())
}

/// Unmarshal a sequence of values anchored at the start of `buf`.
/// Returns the values and the number of bytes consumed.
pub fn unmarshal_values(
    endianness: Endianness,
    types: &[DBusType],
    buf: &[u8],
) -> Result<(Vec<Value>, usize)> {
    let mut u = Unmarshaller::new(buf, endianness);
    let mut values = Vec::with_capacity(types.len());
    for t in types {
        values.push(u.unmarshal(t)?);
    }
    Ok((values, u.pos()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::parse_signature;

    fn roundtrip(sig: &str, values: Vec<Value>) {
        let types = parse_signature(sig).unwrap();
        for endianness in &[Endianness::Little, Endianness::Big] {
            let buf = marshal_values(*endianness, &types, &values).unwrap();
            let (back, consumed) = unmarshal_values(*endianness, &types, &buf).unwrap();
            assert_eq!(back, values, "signature {:?} ({:?})", sig, endianness);
            assert_eq!(consumed, buf.len());
        }
    }

    #[test]
    fn roundtrip_scalars() {
        roundtrip(
            "ybnqiuxtd",
            vec![
                Value::Byte(0xfe),
                Value::Bool(true),
                Value::Int16(-2),
                Value::Uint16(65535),
                Value::Int32(-70_000),
                Value::Uint32(70_000),
                Value::Int64(-5_000_000_000),
                Value::Uint64(5_000_000_000),
                Value::Double(6.5),
            ],
        );
    }

    #[test]
    fn roundtrip_strings() {
        roundtrip(
            "sog",
            vec![
                Value::Str("hello, D-Bus".into()),
                Value::ObjectPath("/org/freedesktop/DBus".into()),
                Value::Signature("a{sv}".into()),
            ],
        );
    }

    #[test]
    fn roundtrip_containers() {
        roundtrip(
            "a(si)",
            vec![Value::Array(vec![
                Value::Struct(vec![Value::Str("one".into()), Value::Int32(1)]),
                Value::Struct(vec![Value::Str("two".into()), Value::Int32(2)]),
            ])],
        );
        roundtrip(
            "a{sv}",
            vec![Value::Dict(vec![
                (
                    Value::Str("answer".into()),
                    Value::Variant("u".into(), Box::new(Value::Uint32(42))),
                ),
                (
                    Value::Str("greeting".into()),
                    Value::Variant("s".into(), Box::new(Value::Str("hi".into()))),
                ),
            ])],
        );
        roundtrip("aau", vec![Value::Array(vec![
            Value::Array(vec![Value::Uint32(1), Value::Uint32(2)]),
            Value::Array(vec![]),
        ])]);
    }

    #[test]
    fn struct_layout() {
        // ("foo", 42) as (si): u32 length, "foo", NUL, pad to 4, i32.
        let types = parse_signature("(si)").unwrap();
        let buf = marshal_values(
            Endianness::Little,
            &types,
            &[Value::Struct(vec![
                Value::Str("foo".into()),
                Value::Int32(42),
            ])],
        )
        .unwrap();
        assert_eq!(
            buf,
            vec![0x03, 0, 0, 0, 0x66, 0x6f, 0x6f, 0x00, 0x2a, 0, 0, 0]
        );
    }

    #[test]
    fn variant_layout() {
        // Variant holding u32 7: signature "u" then padding to 4.
        let types = parse_signature("v").unwrap();
        let buf = marshal_values(
            Endianness::Little,
            &types,
            &[Value::Variant("u".into(), Box::new(Value::Uint32(7)))],
        )
        .unwrap();
        assert_eq!(buf, vec![0x01, 0x75, 0x00, 0x00, 0x07, 0, 0, 0]);
    }

    #[test]
    fn empty_array_pads_to_element_alignment() {
        // An empty at still pads to the 8-byte alignment of t after the
        // length word.
        let types = parse_signature("at").unwrap();
        let buf = marshal_values(Endianness::Little, &types, &[Value::Array(vec![])]).unwrap();
        assert_eq!(buf, vec![0, 0, 0, 0, 0, 0, 0, 0]);

        let (values, consumed) = unmarshal_values(Endianness::Little, &types, &buf).unwrap();
        assert_eq!(values, vec![Value::Array(vec![])]);
        assert_eq!(consumed, 8);
    }

    #[test]
    fn alignment_is_relative_to_anchor() {
        // y then u: three padding bytes in between.
        let types = parse_signature("yu").unwrap();
        let buf = marshal_values(
            Endianness::Little,
            &types,
            &[Value::Byte(1), Value::Uint32(2)],
        )
        .unwrap();
        assert_eq!(buf, vec![1, 0, 0, 0, 2, 0, 0, 0]);
    }

    #[test]
    fn big_endian_scalars() {
        let types = parse_signature("u").unwrap();
        let buf = marshal_values(Endianness::Big, &types, &[Value::Uint32(7)]).unwrap();
        assert_eq!(buf, vec![0, 0, 0, 7]);
    }

    #[test]
    fn boolean_must_be_canonical() {
        let types = parse_signature("b").unwrap();
        let buf = vec![2, 0, 0, 0];
        let err = unmarshal_values(Endianness::Little, &types, &buf).unwrap_err();
        assert_eq!(*err.kind(), ErrorKind::InvalidBool(2));
    }

    #[test]
    fn object_path_strictness() {
        assert!(validate_object_path("/").is_ok());
        assert!(validate_object_path("/org/freedesktop/DBus").is_ok());
        assert!(validate_object_path("/a_b/c0").is_ok());
        assert!(validate_object_path("").is_err());
        assert!(validate_object_path("org/freedesktop").is_err());
        assert!(validate_object_path("/org//freedesktop").is_err());
        assert!(validate_object_path("/org/").is_err());
        assert!(validate_object_path("/org/free-desktop").is_err());
    }

    #[test]
    fn declared_array_length_must_match() {
        // Array of u32 with length 6: no element boundary at byte 6.
        let mut buf = vec![6, 0, 0, 0];
        buf.extend_from_slice(&[1, 0, 0, 0, 2, 0]);
        let types = parse_signature("au").unwrap();
        assert!(unmarshal_values(Endianness::Little, &types, &buf).is_err());
    }

    #[test]
    fn variant_signature_must_be_single_type() {
        let types = parse_signature("v").unwrap();
        let err = marshal_values(
            Endianness::Little,
            &types,
            &[Value::Variant("uu".into(), Box::new(Value::Uint32(1)))],
        )
        .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Signature(_)));

        // And on decode: signature "uu" inside a variant.
        let buf = vec![0x02, 0x75, 0x75, 0x00, 0x01, 0, 0, 0];
        assert!(unmarshal_values(Endianness::Little, &types, &buf).is_err());
    }

    #[test]
    fn truncated_input_is_rejected() {
        let types = parse_signature("s").unwrap();
        // Declared length 10 but only 3 bytes follow.
        let buf = vec![10, 0, 0, 0, b'a', b'b', b'c'];
        assert!(unmarshal_values(Endianness::Little, &types, &buf).is_err());
    }

    #[test]
    fn value_type_mismatch() {
        let types = parse_signature("u").unwrap();
        let err =
            marshal_values(Endianness::Little, &types, &[Value::Str("no".into())]).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Marshal(_)));
    }

    #[test]
    fn check_type_matches_marshal() {
        let ty = parse_signature("a{sv}").unwrap().remove(0);
        let good = Value::Dict(vec![(
            Value::Str("k".into()),
            Value::Variant("i".into(), Box::new(Value::Int32(-1))),
        )]);
        assert!(check_type(&ty, &good).is_ok());
        let bad = Value::Dict(vec![(Value::Uint32(1), Value::Str("v".into()))]);
        assert!(check_type(&ty, &bad).is_err());
    }
}
