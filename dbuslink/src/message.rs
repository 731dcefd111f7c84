//! Whole-frame encoding and decoding.
//!
//! A frame is the fixed 12-byte prefix, the header-field array, padding to
//! an 8-byte boundary, then the body. The header is itself marshalled as
//! `yyyyuua(yv)` with alignment anchored at the start of the message; the
//! body is anchored at its own first byte.

use crate::error::*;
use crate::signature::{parse_signature, DBusType};
use crate::wire::{
    check_type, padding, validate_object_path, Endianness, Marshaller, Unmarshaller, Value,
    MAX_ARRAY_SIZE,
};

/// Total message size cap: 128 MiB, of which the body may use up to 2^27.
pub const MAX_MESSAGE_SIZE: usize = 1 << 27;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    MethodCall = 1,
    MethodReturn = 2,
    Error = 3,
    Signal = 4,
}

impl MessageType {
    pub fn from_code(code: u8) -> Option<MessageType> {
        match code {
            1 => Some(MessageType::MethodCall),
            2 => Some(MessageType::MethodReturn),
            3 => Some(MessageType::Error),
            4 => Some(MessageType::Signal),
            _ => None,
        }
    }

    /// The name used in match rules, e.g. `type='signal'`.
    pub fn rule_name(self) -> &'static str {
        match self {
            MessageType::MethodCall => "method_call",
            MessageType::MethodReturn => "method_return",
            MessageType::Error => "error",
            MessageType::Signal => "signal",
        }
    }
}

/// Bitmask of message flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageFlags(u8);

impl MessageFlags {
    pub const NONE: MessageFlags = MessageFlags(0);
    pub const NO_REPLY_EXPECTED: MessageFlags = MessageFlags(1);
    pub const NO_AUTO_START: MessageFlags = MessageFlags(2);
    pub const ALLOW_INTERACTIVE_AUTHORIZATION: MessageFlags = MessageFlags(4);

    pub fn from_bits(bits: u8) -> MessageFlags {
        MessageFlags(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: MessageFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl ::std::ops::BitOr for MessageFlags {
    type Output = MessageFlags;

    fn bitor(self, rhs: MessageFlags) -> MessageFlags {
        MessageFlags(self.0 | rhs.0)
    }
}

/// Header-field tags. Each tag carries a value of one fixed type,
/// transported as a variant on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HeaderField {
    Path = 1,
    Interface = 2,
    Member = 3,
    ErrorName = 4,
    ReplySerial = 5,
    Destination = 6,
    Sender = 7,
    Signature = 8,
    UnixFds = 9,
}

impl HeaderField {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<HeaderField> {
        match code {
            1 => Some(HeaderField::Path),
            2 => Some(HeaderField::Interface),
            3 => Some(HeaderField::Member),
            4 => Some(HeaderField::ErrorName),
            5 => Some(HeaderField::ReplySerial),
            6 => Some(HeaderField::Destination),
            7 => Some(HeaderField::Sender),
            8 => Some(HeaderField::Signature),
            9 => Some(HeaderField::UnixFds),
            _ => None,
        }
    }

    pub fn value_type(self) -> DBusType {
        match self {
            HeaderField::Path => DBusType::ObjectPath,
            HeaderField::ReplySerial | HeaderField::UnixFds => DBusType::Uint32,
            HeaderField::Signature => DBusType::Signature,
            _ => DBusType::String,
        }
    }
}

fn header_fields_type() -> DBusType {
    DBusType::Array(Box::new(DBusType::Struct(vec![
        DBusType::Byte,
        DBusType::Variant,
    ])))
}

/// A parsed or to-be-sent message header. The body length is not stored;
/// it is computed when serializing and checked when parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub endianness: Endianness,
    pub message_type: MessageType,
    pub flags: MessageFlags,
    pub protocol_version: u8,
    pub serial: u32,
    pub fields: Vec<(HeaderField, Value)>,
}

impl Header {
    fn new(message_type: MessageType) -> Header {
        Header {
            endianness: Endianness::default(),
            message_type,
            flags: MessageFlags::NONE,
            protocol_version: 1,
            serial: 0,
            fields: Vec::new(),
        }
    }

    pub fn field(&self, field: HeaderField) -> Option<&Value> {
        self.fields.iter().find(|(f, _)| *f == field).map(|(_, v)| v)
    }

    pub fn set_field(&mut self, field: HeaderField, value: Value) {
        if let Some(slot) = self.fields.iter_mut().find(|(f, _)| *f == field) {
            slot.1 = value;
        } else {
            self.fields.push((field, value));
        }
    }

    fn str_field(&self, field: HeaderField) -> Option<&str> {
        self.field(field).and_then(Value::as_str)
    }

    fn serialize(&self, body_length: u32, serial: u32) -> Result<Vec<u8>> {
        let mut m = Marshaller::new(self.endianness);
        m.put_u8(self.endianness.code());
        m.put_u8(self.message_type as u8);
        m.put_u8(self.flags.bits());
        m.put_u8(self.protocol_version);
        m.put_u32(body_length);
        m.put_u32(serial);

        let mut fields = self.fields.clone();
        fields.sort_by_key(|(f, _)| f.code());
        let mut entries = Vec::with_capacity(fields.len());
        for (field, value) in fields {
            let ty = field.value_type();
            check_type(&ty, &value)?;
            entries.push(Value::Struct(vec![
                Value::Byte(field.code()),
                Value::Variant(ty.signature(), Box::new(value)),
            ]));
        }
        m.marshal(&header_fields_type(), &Value::Array(entries))?;
        Ok(m.into_vec())
    }

    fn check_required_fields(&self) -> Result<()> {
        let required: &[HeaderField] = match self.message_type {
            MessageType::MethodCall => &[HeaderField::Path, HeaderField::Member],
            MessageType::Signal => &[
                HeaderField::Path,
                HeaderField::Interface,
                HeaderField::Member,
            ],
            MessageType::MethodReturn => &[HeaderField::ReplySerial],
            MessageType::Error => &[HeaderField::ReplySerial, HeaderField::ErrorName],
        };
        for f in required {
            if self.field(*f).is_none() {
                return Err(context!(ErrorKind::Framing(format!(
                    "{:?} message without {:?} header field",
                    self.message_type, f
                ))));
            }
        }
        Ok(())
    }
}

/// One D-Bus message: header plus body values.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: Header,
    pub body: Vec<Value>,
}

impl Message {
    /// Convert this message to bytes.
    ///
    /// `serial` overrides the header's serial field, so a connection can
    /// stamp its own serial without mutating the message. The effective
    /// serial must not be zero.
    pub fn serialize(&self, serial: Option<u32>) -> Result<Vec<u8>> {
        let serial = serial.unwrap_or(self.header.serial);
        if serial == 0 {
            return Err(context!(ErrorKind::Framing(
                "outgoing message serial must not be zero".into()
            )));
        }

        let body_buf = self.serialize_body()?;
        let mut buf = self.header.serialize(body_buf.len() as u32, serial)?;
        let pad = padding(buf.len(), 8);
        buf.extend(std::iter::repeat(0u8).take(pad));
        buf.extend_from_slice(&body_buf);
        Ok(buf)
    }

    fn serialize_body(&self) -> Result<Vec<u8>> {
        let signature = self.header.str_field(HeaderField::Signature).unwrap_or("");
        let types = parse_signature(signature)?;
        if types.len() != self.body.len() {
            return Err(context!(ErrorKind::Marshal(format!(
                "body has {} values but signature '{}' describes {}",
                self.body.len(),
                signature,
                types.len()
            ))));
        }
        let mut m = Marshaller::new(self.header.endianness);
        for (t, v) in types.iter().zip(&self.body) {
            m.marshal(t, v)?;
        }
        Ok(m.into_vec())
    }

    /// Parse one complete frame. The buffer must hold exactly one message.
    pub fn from_buffer(buf: &[u8]) -> Result<Message> {
        if buf.len() < 16 {
            return Err(context!(ErrorKind::Framing("truncated header".into())));
        }
        let endianness = Endianness::from_code(buf[0]).ok_or_else(|| {
            context!(ErrorKind::Framing(format!(
                "unknown endianness flag {:#04x}",
                buf[0]
            )))
        })?;
        let message_type = MessageType::from_code(buf[1]).ok_or_else(|| {
            context!(ErrorKind::Framing(format!("unknown message type {}", buf[1])))
        })?;
        let flags = MessageFlags::from_bits(buf[2]);
        let protocol_version = buf[3];
        if protocol_version != 1 {
            return Err(context!(ErrorKind::Framing(format!(
                "unsupported protocol version {}",
                protocol_version
            ))));
        }

        let mut u = Unmarshaller::new(buf, endianness);
        u.get_u32()?; // fixed prefix, already examined above
        let body_length = u.get_u32()? as usize;
        let serial = u.get_u32()?;
        if serial == 0 {
            return Err(context!(ErrorKind::Framing("message serial is zero".into())));
        }

        let raw_fields = u.unmarshal(&header_fields_type())?;
        let mut header = Header {
            endianness,
            message_type,
            flags,
            protocol_version,
            serial,
            fields: Vec::new(),
        };
        let entries = match raw_fields {
            Value::Array(entries) => entries,
            _ => {
                return Err(context!(ErrorKind::Framing(
                    "malformed header field array".into()
                )));
            }
        };
        for entry in entries {
            // The a(yv) element type guarantees this shape.
            let (code, variant) = match entry {
                Value::Struct(mut pair) if pair.len() == 2 => {
                    let variant = pair.pop();
                    match (pair.pop(), variant) {
                        (Some(Value::Byte(code)), Some(Value::Variant(sig, value))) => {
                            (code, (sig, *value))
                        }
                        _ => {
                            return Err(context!(ErrorKind::Framing(
                                "malformed header field entry".into()
                            )));
                        }
                    }
                }
                _ => {
                    return Err(context!(ErrorKind::Framing(
                        "malformed header field entry".into()
                    )));
                }
            };
            let field = match HeaderField::from_code(code) {
                Some(f) => f,
                // Unknown tags are allowed on the wire; skip them.
                None => continue,
            };
            let (sig, value) = variant;
            if sig != field.value_type().signature() {
                return Err(context!(ErrorKind::Framing(format!(
                    "header field {:?} carries type '{}'",
                    field, sig
                ))));
            }
            header.set_field(field, value);
        }
        header.check_required_fields()?;

        let fields_end = u.pos();
        let body_start = fields_end + padding(fields_end, 8);
        if buf.len() != body_start + body_length {
            return Err(context!(ErrorKind::Framing(format!(
                "frame is {} bytes but header describes {}",
                buf.len(),
                body_start + body_length
            ))));
        }

        let signature = header.str_field(HeaderField::Signature).unwrap_or("");
        let types = parse_signature(signature)?;
        let mut body_u = Unmarshaller::new(&buf[body_start..], endianness);
        let mut body = Vec::with_capacity(types.len());
        for t in &types {
            body.push(body_u.unmarshal(t)?);
        }
        if body_u.pos() != body_length {
            return Err(context!(ErrorKind::Framing(format!(
                "body signature '{}' consumed {} of {} bytes",
                signature,
                body_u.pos(),
                body_length
            ))));
        }

        Ok(Message { header, body })
    }

    pub fn with_flags(mut self, flags: MessageFlags) -> Message {
        self.header.flags = flags;
        self
    }

    pub fn body_signature(&self) -> &str {
        self.header.str_field(HeaderField::Signature).unwrap_or("")
    }

    pub fn path(&self) -> Option<&str> {
        self.header.str_field(HeaderField::Path)
    }

    pub fn interface(&self) -> Option<&str> {
        self.header.str_field(HeaderField::Interface)
    }

    pub fn member(&self) -> Option<&str> {
        self.header.str_field(HeaderField::Member)
    }

    pub fn error_name(&self) -> Option<&str> {
        self.header.str_field(HeaderField::ErrorName)
    }

    pub fn destination(&self) -> Option<&str> {
        self.header.str_field(HeaderField::Destination)
    }

    pub fn sender(&self) -> Option<&str> {
        self.header.str_field(HeaderField::Sender)
    }

    pub fn reply_serial(&self) -> Option<u32> {
        self.header.field(HeaderField::ReplySerial).and_then(Value::as_u32)
    }

    /// Consume the message and return its body, turning an error-typed
    /// reply into [`ErrorKind::ErrorReply`].
    pub fn unwrap_body(self) -> Result<Vec<Value>> {
        unwrap_msg(self)
    }
}

/// The remote half of a method call: a path on a (usually named) peer,
/// optionally pinned to one interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DBusAddress {
    pub object_path: String,
    pub bus_name: Option<String>,
    pub interface: Option<String>,
}

impl DBusAddress {
    pub fn new(object_path: &str) -> DBusAddress {
        DBusAddress {
            object_path: object_path.into(),
            bus_name: None,
            interface: None,
        }
    }

    pub fn with_bus_name(mut self, bus_name: &str) -> DBusAddress {
        self.bus_name = Some(bus_name.into());
        self
    }

    pub fn with_interface(&self, interface: &str) -> DBusAddress {
        DBusAddress {
            object_path: self.object_path.clone(),
            bus_name: self.bus_name.clone(),
            interface: Some(interface.into()),
        }
    }
}

fn set_signature_and_body(
    header: &mut Header,
    signature: &str,
    body: &[Value],
) -> Result<()> {
    let types = parse_signature(signature)?;
    if types.len() != body.len() {
        return Err(context!(ErrorKind::Marshal(format!(
            "{} body values for signature '{}'",
            body.len(),
            signature
        ))));
    }
    for (t, v) in types.iter().zip(body) {
        check_type(t, v)?;
    }
    if !signature.is_empty() {
        header.set_field(HeaderField::Signature, Value::Signature(signature.into()));
    }
    Ok(())
}

/// Build a method call. The serial is left at zero; the connection stamps
/// it on send. `signature` may be empty for a bodyless call.
pub fn new_method_call(
    addr: &DBusAddress,
    member: &str,
    signature: &str,
    body: Vec<Value>,
) -> Result<Message> {
    validate_object_path(&addr.object_path)?;
    let mut header = Header::new(MessageType::MethodCall);
    header.set_field(
        HeaderField::Path,
        Value::ObjectPath(addr.object_path.clone()),
    );
    if let Some(ref bus_name) = addr.bus_name {
        header.set_field(HeaderField::Destination, Value::Str(bus_name.clone()));
    }
    if let Some(ref interface) = addr.interface {
        header.set_field(HeaderField::Interface, Value::Str(interface.clone()));
    }
    header.set_field(HeaderField::Member, Value::Str(member.into()));
    set_signature_and_body(&mut header, signature, &body)?;
    Ok(Message { header, body })
}

/// Build the successful reply to `parent`.
pub fn new_method_return(parent: &Message, signature: &str, body: Vec<Value>) -> Result<Message> {
    let mut header = Header::new(MessageType::MethodReturn);
    header.set_field(HeaderField::ReplySerial, Value::Uint32(parent.header.serial));
    if let Some(sender) = parent.sender() {
        header.set_field(HeaderField::Destination, Value::Str(sender.into()));
    }
    set_signature_and_body(&mut header, signature, &body)?;
    Ok(Message { header, body })
}

/// Build an error reply to `parent`.
pub fn new_error(
    parent: &Message,
    error_name: &str,
    signature: &str,
    body: Vec<Value>,
) -> Result<Message> {
    let mut header = Header::new(MessageType::Error);
    header.set_field(HeaderField::ReplySerial, Value::Uint32(parent.header.serial));
    header.set_field(HeaderField::ErrorName, Value::Str(error_name.into()));
    if let Some(sender) = parent.sender() {
        header.set_field(HeaderField::Destination, Value::Str(sender.into()));
    }
    set_signature_and_body(&mut header, signature, &body)?;
    Ok(Message { header, body })
}

/// Build a signal emitted from `addr`, whose interface must be set.
pub fn new_signal(
    addr: &DBusAddress,
    member: &str,
    signature: &str,
    body: Vec<Value>,
) -> Result<Message> {
    validate_object_path(&addr.object_path)?;
    let interface = addr.interface.as_ref().ok_or_else(|| {
        context!(ErrorKind::Marshal(
            "signal emitter address has no interface".into()
        ))
    })?;
    let mut header = Header::new(MessageType::Signal);
    header.set_field(
        HeaderField::Path,
        Value::ObjectPath(addr.object_path.clone()),
    );
    header.set_field(HeaderField::Interface, Value::Str(interface.clone()));
    header.set_field(HeaderField::Member, Value::Str(member.into()));
    set_signature_and_body(&mut header, signature, &body)?;
    Ok(Message { header, body })
}

/// Split a reply into its body, turning an error-typed message into an
/// [`ErrorKind::ErrorReply`].
pub fn unwrap_msg(msg: Message) -> Result<Vec<Value>> {
    if msg.header.message_type == MessageType::Error {
        return Err(context!(ErrorKind::ErrorReply(msg)));
    }
    Ok(msg.body)
}

fn frame_size(buf: &[u8]) -> Result<usize> {
    let endianness = Endianness::from_code(buf[0]).ok_or_else(|| {
        context!(ErrorKind::Framing(format!(
            "unknown endianness flag {:#04x}",
            buf[0]
        )))
    })?;
    let mut u = Unmarshaller::new(buf, endianness);
    u.get_u32()?;
    let body_length = u.get_u32()? as usize;
    u.get_u32()?;
    let fields_length = u.get_u32()? as usize;
    if body_length > MAX_MESSAGE_SIZE {
        return Err(context!(ErrorKind::SizeLimit(format!(
            "declared body of {} bytes exceeds the 128 MiB frame limit",
            body_length
        ))));
    }
    if fields_length > MAX_ARRAY_SIZE {
        return Err(context!(ErrorKind::SizeLimit(format!(
            "declared header field array of {} bytes exceeds the 64 MiB limit",
            fields_length
        ))));
    }
    let header_len = 16 + fields_length;
    Ok(header_len + padding(header_len, 8) + body_length)
}

/// Incremental frame parser over a stream of bytes.
///
/// Any decode failure is fatal to the instance, matching the
/// connection-level nature of framing errors: once poisoned it refuses
/// further parsing and the buffer is left untouched.
#[derive(Debug, Default)]
pub struct Parser {
    buf: Vec<u8>,
    next_msg_size: Option<usize>,
    poisoned: bool,
}

impl Parser {
    pub fn new() -> Parser {
        Parser::default()
    }

    /// Provide newly received bytes to the parser.
    pub fn add_data(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Feed bytes and collect every message they complete.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Message>> {
        self.add_data(data);
        let mut msgs = Vec::new();
        while let Some(msg) = self.get_next_message()? {
            msgs.push(msg);
        }
        Ok(msgs)
    }

    /// Parse one message if enough bytes are buffered.
    pub fn get_next_message(&mut self) -> Result<Option<Message>> {
        if self.poisoned {
            return Err(context!(ErrorKind::Framing(
                "parser already failed on this stream".into()
            )));
        }
        if self.next_msg_size.is_none() && self.buf.len() >= 16 {
            match frame_size(&self.buf) {
                Ok(size) => self.next_msg_size = Some(size),
                Err(e) => {
                    self.poisoned = true;
                    return Err(e);
                }
            }
        }
        match self.next_msg_size {
            Some(size) if self.buf.len() >= size => {
                match Message::from_buffer(&self.buf[..size]) {
                    Ok(msg) => {
                        self.buf.drain(..size);
                        self.next_msg_size = None;
                        Ok(Some(msg))
                    }
                    Err(e) => {
                        self.poisoned = true;
                        Err(e)
                    }
                }
            }
            _ => Ok(None),
        }
    }
}
