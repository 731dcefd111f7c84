//! Blocking connections to a message bus.
//!
//! A [`DBusConnection`] owns one authenticated stream. Sends go through a
//! writer lock so bytes hit the wire in serial order; receives go through
//! a reader lock feeding the frame parser. Reply correlation and filtering
//! live one layer up in [`DBusRouter`](crate::DBusRouter).

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::debug;

use crate::auth::{make_auth_external, SaslParser, BEGIN};
use crate::bus::{parse_addresses, session_bus_addresses, system_bus_addresses, TransportAddress};
use crate::bus_messages::hello;
use crate::error::*;
use crate::message::{Message, Parser};
use crate::stream::{connect, Stream};
use crate::wire::Value;

/// Lifecycle of a connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Opening,
    Authenticating,
    Running,
    Closing,
    Closed,
}

struct Reader {
    read: Box<dyn Read + Send + Sync>,
    parser: Parser,
}

pub struct DBusConnection {
    reader: Mutex<Reader>,
    writer: Mutex<Box<dyn Write + Send + Sync>>,
    stream: Mutex<Box<dyn Stream>>,
    outgoing_serial: AtomicU32,
    state: RwLock<ConnectionState>,
    unique_name: RwLock<Option<String>>,
    server_guid: RwLock<Option<String>>,
}

impl DBusConnection {
    /// Connect to the bus named by `DBUS_SESSION_BUS_ADDRESS`.
    pub fn open_session_bus() -> Result<Arc<DBusConnection>> {
        Self::open_addresses(&session_bus_addresses()?)
    }

    /// Connect to the system bus.
    pub fn open_system_bus() -> Result<Arc<DBusConnection>> {
        Self::open_addresses(&system_bus_addresses()?)
    }

    /// Connect to a bus address string such as
    /// `unix:path=/run/user/1000/bus`.
    pub fn open(address: &str) -> Result<Arc<DBusConnection>> {
        Self::open_addresses(&parse_addresses(address)?)
    }

    /// Connect to the first reachable transport in the list.
    pub fn open_addresses(addresses: &[TransportAddress]) -> Result<Arc<DBusConnection>> {
        Self::open_with_stream(connect(addresses)?)
    }

    /// Run the SASL handshake and `Hello` bootstrap on an established
    /// stream, e.g. a freshly connected socket.
    pub fn open_with_stream(mut stream: Box<dyn Stream>) -> Result<Arc<DBusConnection>> {
        let (read, write) = stream.split()?;
        let conn = Arc::new(DBusConnection {
            reader: Mutex::new(Reader {
                read,
                parser: Parser::new(),
            }),
            writer: Mutex::new(write),
            stream: Mutex::new(stream),
            outgoing_serial: AtomicU32::new(0),
            state: RwLock::new(ConnectionState::Opening),
            unique_name: RwLock::new(None),
            server_guid: RwLock::new(None),
        });
        conn.set_state(ConnectionState::Authenticating);
        conn.authenticate()?;
        conn.set_state(ConnectionState::Running);
        conn.say_hello()?;
        Ok(conn)
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write().unwrap() = state;
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap()
    }

    /// The unique name (`:1.xx`) handed out by the bus in the `Hello`
    /// reply.
    pub fn unique_name(&self) -> Option<String> {
        self.unique_name.read().unwrap().clone()
    }

    /// The server GUID from the SASL `OK` line.
    pub fn server_guid(&self) -> Option<String> {
        self.server_guid.read().unwrap().clone()
    }

    fn authenticate(&self) -> Result<()> {
        let mut reader = self.reader.lock().unwrap();
        {
            let mut writer = self.writer.lock().unwrap();
            writer.write_all(b"\0").map_err(map_context!())?;
            writer
                .write_all(&make_auth_external())
                .map_err(map_context!())?;
            writer.flush().map_err(map_context!())?;
        }

        let mut sasl = SaslParser::new();
        let mut buf = [0u8; 1024];
        while !sasl.authenticated() {
            let n = reader.read.read(&mut buf).map_err(map_context!())?;
            if n == 0 {
                return Err(context!(ErrorKind::ConnectionClosed));
            }
            sasl.feed(&buf[..n]);
            sasl.check()?;
        }

        {
            let mut writer = self.writer.lock().unwrap();
            writer.write_all(BEGIN).map_err(map_context!())?;
            writer.flush().map_err(map_context!())?;
        }
        debug!("authenticated, server guid {:?}", sasl.guid());

        *self.server_guid.write().unwrap() = sasl.guid().map(str::to_owned);
        // Bytes that arrived after the OK line already belong to the
        // binary protocol.
        reader.parser.add_data(&sasl.into_buffer());
        Ok(())
    }

    fn say_hello(&self) -> Result<()> {
        let serial = self.send(&hello()?)?;
        loop {
            let msg = self.receive()?;
            if msg.reply_serial() == Some(serial) {
                match msg.unwrap_body()?.into_iter().next() {
                    Some(Value::Str(name)) => {
                        debug!("connected to the bus as {}", name);
                        *self.unique_name.write().unwrap() = Some(name);
                        return Ok(());
                    }
                    _ => {
                        return Err(context!(ErrorKind::Framing(
                            "Hello reply carried no bus name".into()
                        )));
                    }
                }
            }
            debug!("dropping message received before the Hello reply");
        }
    }

    /// The next outgoing serial: monotonic, wrapping, never zero.
    pub fn next_serial(&self) -> u32 {
        loop {
            let serial = self
                .outgoing_serial
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_add(1);
            if serial != 0 {
                return serial;
            }
        }
    }

    /// Serialize and send a message, stamping the next serial.
    /// Returns the serial used.
    pub fn send(&self, message: &Message) -> Result<u32> {
        self.send_message(message, None)
    }

    pub(crate) fn send_message(&self, message: &Message, serial: Option<u32>) -> Result<u32> {
        match self.state() {
            ConnectionState::Closing | ConnectionState::Closed => {
                return Err(context!(ErrorKind::ConnectionClosed));
            }
            _ => {}
        }
        let serial = serial.unwrap_or_else(|| self.next_serial());
        let data = message.serialize(Some(serial))?;
        let mut writer = self.writer.lock().unwrap();
        writer.write_all(&data).map_err(map_context!())?;
        writer.flush().map_err(map_context!())?;
        Ok(serial)
    }

    /// Block until the next message arrives on the stream.
    pub fn receive(&self) -> Result<Message> {
        let mut reader = self.reader.lock().unwrap();
        loop {
            if let Some(msg) = reader.parser.get_next_message()? {
                return Ok(msg);
            }
            if self.state() == ConnectionState::Closed {
                return Err(context!(ErrorKind::ConnectionClosed));
            }
            let mut buf = [0u8; 4096];
            let n = reader.read.read(&mut buf).map_err(map_context!())?;
            if n == 0 {
                return Err(context!(ErrorKind::ConnectionClosed));
            }
            reader.parser.add_data(&buf[..n]);
        }
    }

    #[cfg(test)]
    pub(crate) fn set_serial_counter(&self, value: u32) {
        self.outgoing_serial.store(value, Ordering::Relaxed);
    }

    /// Shut the stream down. Idempotent; any blocked reader wakes up with
    /// a closed-connection error.
    pub fn close(&self) {
        {
            let mut state = self.state.write().unwrap();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closing;
        }
        let _ = self.stream.lock().unwrap().shutdown();
        self.set_state(ConnectionState::Closed);
    }
}

impl Drop for DBusConnection {
    fn drop(&mut self) {
        self.close();
    }
}
