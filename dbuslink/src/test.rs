use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use crate::bus_messages::MatchRule;
use crate::connection::{ConnectionState, DBusConnection};
use crate::error::*;
use crate::message::{
    new_method_call, new_method_return, new_signal, DBusAddress, Message, MessageType, Parser,
};
use crate::router::DBusRouter;
use crate::wire::{Endianness, Value};

const TEST_GUID: &str = "1234deadbeef8badf00d5ca1ab1e0000";

/// A single-connection message bus on the other end of a socketpair.
/// It answers in big-endian frames so the receive path exercises both
/// byte orders.
struct TestBus {
    stream: UnixStream,
    parser: Parser,
    serial: u32,
    // Replies and errors the client sends towards the bus.
    inbox: mpsc::Sender<Message>,
}

impl TestBus {
    fn new(stream: UnixStream, inbox: mpsc::Sender<Message>) -> TestBus {
        TestBus {
            stream,
            parser: Parser::new(),
            serial: 0,
            inbox,
        }
    }

    fn send(&mut self, mut msg: Message) {
        self.serial += 1;
        msg.header.endianness = Endianness::Big;
        let data = msg.serialize(Some(self.serial)).unwrap();
        self.stream.write_all(&data).unwrap();
    }

    fn handshake(&mut self) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 256];

        // Zero byte plus the AUTH line.
        while !buf.windows(2).any(|w| w == b"\r\n") {
            let n = self.stream.read(&mut chunk).unwrap();
            buf.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(buf[0], 0);
        assert!(buf[1..].starts_with(b"AUTH EXTERNAL "));

        self.stream
            .write_all(format!("OK {}\r\n", TEST_GUID).as_bytes())
            .unwrap();

        // Wait for BEGIN; anything after it is already framed data.
        let mut buf: Vec<u8> = buf
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|p| buf[p + 2..].to_vec())
            .unwrap();
        loop {
            if let Some(p) = buf.windows(7).position(|w| w == b"BEGIN\r\n") {
                self.parser.add_data(&buf[p + 7..]);
                return;
            }
            let n = self.stream.read(&mut chunk).unwrap();
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn handle_call(&mut self, msg: Message) {
        match msg.member() {
            Some("Hello") => {
                let reply =
                    new_method_return(&msg, "s", vec![Value::Str(":1.42".into())]).unwrap();
                self.send(reply);
            }
            Some("Echo") => {
                let signature = msg.body_signature().to_string();
                let body = msg.body.clone();
                let reply = new_method_return(&msg, &signature, body).unwrap();
                self.send(reply);
            }
            Some("Delayed") => {
                thread::sleep(Duration::from_millis(300));
                let reply = new_method_return(&msg, "", vec![]).unwrap();
                self.send(reply);
            }
            Some("Ignore") => {}
            Some("EmitSignal") => {
                let emitter =
                    DBusAddress::new("/com/example/Obj").with_interface("com.example.Test");
                let signal =
                    new_signal(&emitter, "Ping", "s", vec![Value::Str("hello".into())]).unwrap();
                self.send(signal);
                let reply = new_method_return(&msg, "", vec![]).unwrap();
                self.send(reply);
            }
            Some("CallMeBack") => {
                let client = DBusAddress::new("/").with_bus_name(":1.42");
                let call = new_method_call(&client, "Nope", "", vec![]).unwrap();
                self.send(call);
                let reply = new_method_return(&msg, "", vec![]).unwrap();
                self.send(reply);
            }
            _ => {}
        }
    }

    fn run(mut self) {
        self.handshake();
        let mut chunk = [0u8; 4096];
        loop {
            while let Ok(Some(msg)) = self.parser.get_next_message() {
                if msg.header.message_type == MessageType::MethodCall {
                    self.handle_call(msg);
                } else {
                    let _ = self.inbox.send(msg);
                }
            }
            match self.stream.read(&mut chunk) {
                Ok(0) | Err(_) => return,
                Ok(n) => self.parser.add_data(&chunk[..n]),
            }
        }
    }
}

fn connect_test_bus() -> (
    Arc<DBusConnection>,
    mpsc::Receiver<Message>,
    thread::JoinHandle<()>,
) {
    let (client_end, bus_end) = UnixStream::pair().unwrap();
    let (tx, rx) = mpsc::channel();
    let bus = thread::spawn(move || TestBus::new(bus_end, tx).run());
    let conn = DBusConnection::open_with_stream(Box::new(client_end)).unwrap();
    (conn, rx, bus)
}

fn peer() -> DBusAddress {
    DBusAddress::new("/com/example/Obj").with_bus_name("com.example.Svc")
}

#[test]
fn test_open_address_string() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("bus-socket");
    let listener = std::os::unix::net::UnixListener::bind(&socket_path).unwrap();

    let (tx, _rx) = mpsc::channel();
    let bus = thread::spawn(move || {
        let (stream, _addr) = listener.accept().unwrap();
        TestBus::new(stream, tx).run();
    });

    // An unreachable first entry is skipped in favour of the live one.
    let address = format!(
        "unix:path={}%2fmissing;unix:path={}",
        dir.path().display(),
        socket_path.display()
    );
    let conn = DBusConnection::open(&address).unwrap();
    assert_eq!(conn.unique_name(), Some(":1.42".into()));

    conn.close();
    bus.join().unwrap();
}

#[test]
fn test_connect_and_hello() {
    let (conn, _inbox, bus) = connect_test_bus();
    assert_eq!(conn.state(), ConnectionState::Running);
    assert_eq!(conn.unique_name(), Some(":1.42".into()));
    assert_eq!(conn.server_guid(), Some(TEST_GUID.into()));

    conn.close();
    assert_eq!(conn.state(), ConnectionState::Closed);
    bus.join().unwrap();
}

#[test]
fn test_serials_are_monotonic_and_skip_zero() {
    let (conn, _inbox, bus) = connect_test_bus();

    let a = conn.next_serial();
    let b = conn.next_serial();
    assert!(b > a);

    conn.set_serial_counter(u32::MAX - 1);
    assert_eq!(conn.next_serial(), u32::MAX);
    assert_eq!(conn.next_serial(), 1);

    conn.close();
    bus.join().unwrap();
}

#[test]
fn test_send_and_get_reply() {
    let (conn, _inbox, bus) = connect_test_bus();
    let router = DBusRouter::new(conn);

    let call = new_method_call(
        &peer(),
        "Echo",
        "su",
        vec![Value::Str("hi".into()), Value::Uint32(3)],
    )
    .unwrap();
    let reply = router
        .send_and_get_reply(&call, Some(Duration::from_secs(5)))
        .unwrap();

    assert_eq!(reply.header.message_type, MessageType::MethodReturn);
    assert_eq!(reply.header.endianness, Endianness::Big);
    assert_eq!(
        reply.unwrap_body().unwrap(),
        vec![Value::Str("hi".into()), Value::Uint32(3)]
    );
    assert_eq!(router.pending_replies(), 0);

    router.close();
    bus.join().unwrap();
}

#[test]
fn test_concurrent_calls_route_to_their_callers() {
    let (conn, _inbox, bus) = connect_test_bus();
    let router = Arc::new(DBusRouter::new(conn));

    let mut workers = Vec::new();
    for i in 0u32..4 {
        let router = router.clone();
        workers.push(thread::spawn(move || {
            let call =
                new_method_call(&peer(), "Echo", "u", vec![Value::Uint32(i)]).unwrap();
            let reply = router
                .send_and_get_reply(&call, Some(Duration::from_secs(5)))
                .unwrap();
            assert_eq!(reply.body, vec![Value::Uint32(i)]);
        }));
    }
    for w in workers {
        w.join().unwrap();
    }

    router.close();
    bus.join().unwrap();
}

#[test]
fn test_reply_timeout_and_late_delivery() {
    let (conn, _inbox, bus) = connect_test_bus();
    let router = DBusRouter::new(conn);

    // Catch anything that is not claimed by a reply slot.
    let returns = router.filter(MatchRule::new().msg_type(MessageType::MethodReturn), 4);

    let call = new_method_call(&peer(), "Delayed", "", vec![]).unwrap();
    let err = router
        .send_and_get_reply(&call, Some(Duration::from_millis(100)))
        .unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::Timeout);
    assert_eq!(router.pending_replies(), 0);

    // The reply still arrives; with the waiter gone it lands in the
    // filter instead.
    let late = returns.receive_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(late.header.message_type, MessageType::MethodReturn);

    // The router keeps working afterwards.
    let call = new_method_call(&peer(), "Echo", "s", vec![Value::Str("ok".into())]).unwrap();
    let reply = router
        .send_and_get_reply(&call, Some(Duration::from_secs(5)))
        .unwrap();
    assert_eq!(reply.body, vec![Value::Str("ok".into())]);

    router.close();
    bus.join().unwrap();
}

#[test]
fn test_signal_filtering_and_unsubscribe() {
    let (conn, _inbox, bus) = connect_test_bus();
    let router = DBusRouter::new(conn);

    let rule = MatchRule::new()
        .msg_type(MessageType::Signal)
        .interface("com.example.Test");
    let signals = router.filter(rule, 4);

    let call = new_method_call(&peer(), "EmitSignal", "", vec![]).unwrap();
    router
        .send_and_get_reply(&call, Some(Duration::from_secs(5)))
        .unwrap();

    let sig = signals.receive_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(sig.header.message_type, MessageType::Signal);
    assert_eq!(sig.member(), Some("Ping"));
    assert_eq!(sig.body, vec![Value::Str("hello".into())]);

    // Dropping the handle unsubscribes; a further signal goes nowhere.
    drop(signals);
    router
        .send_and_get_reply(&call, Some(Duration::from_secs(5)))
        .unwrap();

    router.close();
    bus.join().unwrap();
}

#[test]
fn test_unmatched_call_gets_unknown_method_error() {
    let (conn, inbox, bus) = connect_test_bus();
    let router = DBusRouter::new(conn);

    let call = new_method_call(&peer(), "CallMeBack", "", vec![]).unwrap();
    router
        .send_and_get_reply(&call, Some(Duration::from_secs(5)))
        .unwrap();

    let err_msg = inbox.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(err_msg.header.message_type, MessageType::Error);
    assert_eq!(
        err_msg.error_name(),
        Some("org.freedesktop.DBus.Error.UnknownMethod")
    );
    assert!(err_msg.reply_serial().is_some());

    router.close();
    bus.join().unwrap();
}

#[test]
fn test_close_fails_pending_replies() {
    let (conn, _inbox, bus) = connect_test_bus();
    let router = Arc::new(DBusRouter::new(conn));

    let waiter_router = router.clone();
    let waiter = thread::spawn(move || {
        let call = new_method_call(&peer(), "Ignore", "", vec![]).unwrap();
        waiter_router.send_and_get_reply(&call, None)
    });

    // Give the waiter time to register its slot and send.
    thread::sleep(Duration::from_millis(100));
    router.close();

    let result = waiter.join().unwrap();
    assert_eq!(*result.unwrap_err().kind(), ErrorKind::ConnectionClosed);
    assert_eq!(router.pending_replies(), 0);

    // Closing again is fine, and sending now fails cleanly.
    router.close();
    let call = new_method_call(&peer(), "Echo", "", vec![]).unwrap();
    assert_eq!(
        *router.send(&call).unwrap_err().kind(),
        ErrorKind::ConnectionClosed
    );

    bus.join().unwrap();
}
