pub use chainerror::*;
use std::io;

#[macro_export]
macro_rules! context {
    ($k:expr) => {
        $crate::error::cherr!($k)
    };
}

#[macro_export]
macro_rules! map_context {
    () => {
        $crate::error::minto_cherr!()
    };
}

#[derive(Clone, PartialEq, Debug)]
pub enum ErrorKind {
    Io(::std::io::ErrorKind),
    Signature(String),
    Marshal(String),
    InvalidObjectPath(String),
    InvalidBool(u32),
    SizeLimit(String),
    Framing(String),
    Authentication(String),
    ErrorReply(crate::message::Message),
    InvalidAddress,
    ConnectionClosed,
    Timeout,
    Generic,
}

impl ::std::error::Error for ErrorKind {}

impl ::std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        match self {
            ErrorKind::Io(_) => write!(f, "IO error"),
            ErrorKind::Signature(v) => write!(f, "Invalid type signature: {}", v),
            ErrorKind::Marshal(v) => write!(f, "Marshalling error: {}", v),
            ErrorKind::InvalidObjectPath(v) => write!(f, "Invalid object path: '{}'", v),
            ErrorKind::InvalidBool(v) => write!(f, "Invalid boolean value: {}", v),
            ErrorKind::SizeLimit(v) => write!(f, "Size limit exceeded: {}", v),
            ErrorKind::Framing(v) => write!(f, "Invalid message frame: {}", v),
            ErrorKind::Authentication(v) => write!(f, "Authentication failed: '{}'", v),
            ErrorKind::ErrorReply(m) => write!(
                f,
                "Error reply: '{}'",
                m.error_name().unwrap_or("<unnamed>")
            ),
            ErrorKind::InvalidAddress => write!(f, "Invalid D-Bus bus address"),
            ErrorKind::ConnectionClosed => write!(f, "Connection Closed"),
            ErrorKind::Timeout => write!(f, "Timeout Error"),
            ErrorKind::Generic => Ok(()),
        }
    }
}

impl ChainErrorFrom<std::io::Error> for ErrorKind {
    fn chain_error_from(
        e: io::Error,
        line_filename: Option<(u32, &'static str)>,
    ) -> ChainError<Self> {
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof => {
                ChainError::<_>::new(ErrorKind::ConnectionClosed, Some(Box::from(e)), line_filename)
            }

            kind => ChainError::<_>::new(ErrorKind::Io(kind), Some(Box::from(e)), line_filename),
        }
    }
}

pub type Result<T> = ChainResult<T, ErrorKind>;
pub type Error = ChainError<ErrorKind>;
