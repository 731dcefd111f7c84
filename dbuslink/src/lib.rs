//! Client and router support for the D-Bus wire protocol.
//!
//! The codec layers are pure: signatures ([`signature`]), values
//! ([`wire`]), whole frames and the streaming parser ([`message`]) and the
//! SASL handshake ([`auth`]) never touch a socket, so they can sit under
//! any I/O model. On top of them this crate ships a blocking adapter: a
//! [`DBusConnection`] over unix or TCP transports and a [`DBusRouter`]
//! that matches replies to calls and fans signals out to filters.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use dbuslink::{bus_messages, DBusConnection, DBusRouter, MatchRule, MessageType};
//!
//! fn main() -> dbuslink::Result<()> {
//!     let conn = DBusConnection::open_session_bus()?;
//!     println!("connected as {:?}", conn.unique_name());
//!
//!     let router = DBusRouter::new(conn);
//!     let reply = router.send_and_get_reply(
//!         &bus_messages::list_names()?,
//!         Some(Duration::from_secs(10)),
//!     )?;
//!     println!("names on the bus: {:?}", reply.body);
//!
//!     // Watch name-ownership changes.
//!     let rule = MatchRule::new()
//!         .msg_type(MessageType::Signal)
//!         .interface("org.freedesktop.DBus")
//!         .member("NameOwnerChanged");
//!     router.send_and_get_reply(&bus_messages::add_match(&rule)?, None)?;
//!     let signals = router.filter(rule, 16);
//!     let msg = signals.receive()?;
//!     println!("name owner changed: {:?}", msg.body);
//!
//!     router.close();
//!     Ok(())
//! }
//! ```
//!
//! Passing file descriptors (the `h` type beyond its index value) is out
//! of scope, as is serving as a bus daemon.

pub mod error;
pub use crate::error::{Error, ErrorKind, Result};

pub mod auth;
pub mod bus;
pub mod bus_messages;
mod connection;
pub mod message;
mod router;
pub mod signature;
pub mod stream;
pub mod wire;

#[cfg(test)]
mod test;

pub use crate::bus_messages::MatchRule;
pub use crate::connection::{ConnectionState, DBusConnection};
pub use crate::message::{
    new_error, new_method_call, new_method_return, new_signal, unwrap_msg, DBusAddress, Header,
    HeaderField, Message, MessageFlags, MessageType, Parser,
};
pub use crate::router::{DBusRouter, FilterHandle};
pub use crate::wire::{Endianness, Value};
