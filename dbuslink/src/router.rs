//! Multiplexing of calls, replies and signals over one connection.
//!
//! One receiver thread owns the inbound side of a connection. Each
//! incoming message is tried against the pending-reply table first, then
//! against every registered filter in registration order. Replies are
//! correlated through one-shot slots keyed by serial, registered before
//! the call bytes are written so the receiver can never see a reply whose
//! slot is missing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, warn};

use crate::bus_messages::MatchRule;
use crate::connection::DBusConnection;
use crate::error::*;
use crate::message::{new_error, Message, MessageFlags, MessageType};
use crate::wire::Value;

struct ReplyMatcher {
    slots: Mutex<HashMap<u32, mpsc::SyncSender<Message>>>,
}

impl ReplyMatcher {
    fn new() -> ReplyMatcher {
        ReplyMatcher {
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn register(&self, serial: u32) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.slots.lock().unwrap().insert(serial, tx);
        rx
    }

    fn forget(&self, serial: u32) {
        self.slots.lock().unwrap().remove(&serial);
    }

    /// Complete the slot waiting for this message, if there is one.
    fn dispatch(&self, msg: &Message) -> bool {
        let serial = match msg.reply_serial() {
            Some(s) => s,
            None => return false,
        };
        match self.slots.lock().unwrap().remove(&serial) {
            Some(tx) => {
                // The waiter may have given up; that is not our problem.
                let _ = tx.try_send(msg.clone());
                true
            }
            None => false,
        }
    }

    /// Fail every waiter by dropping their senders.
    fn drop_all(&self) {
        self.slots.lock().unwrap().clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

struct FilterSlot {
    id: u64,
    rule: MatchRule,
    tx: Sender<Message>,
    // Router-side handle on the same buffer, used to shed the oldest
    // message when the consumer lags.
    rx: Receiver<Message>,
}

#[derive(Default)]
struct FilterRegistry {
    slots: Vec<FilterSlot>,
}

/// A live subscription created by [`DBusRouter::filter`]. Dropping the
/// handle removes the subscription.
pub struct FilterHandle {
    id: u64,
    rx: Receiver<Message>,
    registry: Arc<Mutex<FilterRegistry>>,
}

impl FilterHandle {
    /// Block until the next matching message.
    pub fn receive(&self) -> Result<Message> {
        self.rx
            .recv()
            .map_err(|_| context!(ErrorKind::ConnectionClosed))
    }

    pub fn receive_timeout(&self, timeout: Duration) -> Result<Message> {
        use crossbeam_channel::RecvTimeoutError;
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => context!(ErrorKind::Timeout),
            RecvTimeoutError::Disconnected => context!(ErrorKind::ConnectionClosed),
        })
    }

    pub fn try_receive(&self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

impl Drop for FilterHandle {
    fn drop(&mut self) {
        let mut registry = self.registry.lock().unwrap();
        registry.slots.retain(|s| s.id != self.id);
    }
}

/// Reply matching, filter dispatch and lifecycle over one connection.
pub struct DBusRouter {
    conn: Arc<DBusConnection>,
    replies: Arc<ReplyMatcher>,
    filters: Arc<Mutex<FilterRegistry>>,
    next_filter_id: AtomicU64,
    recv_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl DBusRouter {
    /// Take over the inbound side of `conn` with a receiver thread.
    pub fn new(conn: Arc<DBusConnection>) -> DBusRouter {
        let replies = Arc::new(ReplyMatcher::new());
        let filters = Arc::new(Mutex::new(FilterRegistry::default()));

        let thread_conn = conn.clone();
        let thread_replies = replies.clone();
        let thread_filters = filters.clone();
        let handle = thread::spawn(move || {
            receiver_loop(thread_conn, thread_replies, thread_filters);
        });

        DBusRouter {
            conn,
            replies,
            filters,
            next_filter_id: AtomicU64::new(0),
            recv_thread: Mutex::new(Some(handle)),
        }
    }

    pub fn connection(&self) -> &Arc<DBusConnection> {
        &self.conn
    }

    pub fn unique_name(&self) -> Option<String> {
        self.conn.unique_name()
    }

    /// Send without waiting for a reply. Returns the serial used.
    pub fn send(&self, message: &Message) -> Result<u32> {
        self.conn.send(message)
    }

    /// Send a method call and block until its reply arrives, the timeout
    /// fires, or the connection closes. The reply slot is registered
    /// before any bytes are written.
    pub fn send_and_get_reply(
        &self,
        message: &Message,
        timeout: Option<Duration>,
    ) -> Result<Message> {
        let serial = self.conn.next_serial();
        let rx = self.replies.register(serial);

        let result = (|| {
            self.conn.send_message(message, Some(serial))?;
            match timeout {
                Some(timeout) => rx.recv_timeout(timeout).map_err(|e| match e {
                    mpsc::RecvTimeoutError::Timeout => context!(ErrorKind::Timeout),
                    mpsc::RecvTimeoutError::Disconnected => {
                        context!(ErrorKind::ConnectionClosed)
                    }
                }),
                None => rx
                    .recv()
                    .map_err(|_| context!(ErrorKind::ConnectionClosed)),
            }
        })();

        // On success the receiver already removed the slot; on failure or
        // cancellation this cleans it up so a late reply goes to the
        // filters instead.
        self.replies.forget(serial);
        result
    }

    /// Subscribe to incoming messages matching `rule`. At most `bufsize`
    /// messages are buffered; when the buffer is full the oldest one is
    /// dropped so a slow consumer never stalls the receiver.
    pub fn filter(&self, rule: MatchRule, bufsize: usize) -> FilterHandle {
        let (tx, rx) = bounded(bufsize.max(1));
        let id = self.next_filter_id.fetch_add(1, Ordering::Relaxed);
        let slot = FilterSlot {
            id,
            rule,
            tx,
            rx: rx.clone(),
        };
        self.filters.lock().unwrap().slots.push(slot);
        FilterHandle {
            id,
            rx,
            registry: self.filters.clone(),
        }
    }

    /// Shut the connection down, fail every pending reply and disconnect
    /// every filter. Idempotent.
    pub fn close(&self) {
        self.conn.close();
        if let Some(handle) = self.recv_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_replies(&self) -> usize {
        self.replies.len()
    }
}

impl Drop for DBusRouter {
    fn drop(&mut self) {
        self.close();
    }
}

fn receiver_loop(
    conn: Arc<DBusConnection>,
    replies: Arc<ReplyMatcher>,
    filters: Arc<Mutex<FilterRegistry>>,
) {
    loop {
        let msg = match conn.receive() {
            Ok(msg) => msg,
            Err(e) => {
                debug!("receiver stopping: {}", e);
                break;
            }
        };
        dispatch(&conn, &replies, &filters, msg);
    }

    // Drain: fail the waiters, disconnect the filters, mark the
    // connection closed.
    replies.drop_all();
    filters.lock().unwrap().slots.clear();
    conn.close();
}

fn dispatch(
    conn: &DBusConnection,
    replies: &ReplyMatcher,
    filters: &Mutex<FilterRegistry>,
    msg: Message,
) {
    match msg.header.message_type {
        MessageType::MethodReturn | MessageType::Error => {
            if replies.dispatch(&msg) {
                return;
            }
        }
        _ => {}
    }

    let mut matched = false;
    {
        let registry = filters.lock().unwrap();
        for slot in &registry.slots {
            if slot.rule.matches(&msg) {
                matched = true;
                deliver(slot, msg.clone());
            }
        }
    }
    if matched {
        return;
    }

    // Unmatched method calls are answered with a standard error unless
    // the caller opted out of replies.
    if msg.header.message_type == MessageType::MethodCall
        && !msg.header.flags.contains(MessageFlags::NO_REPLY_EXPECTED)
    {
        let text = format!(
            "No handler for method {}.{}",
            msg.interface().unwrap_or(""),
            msg.member().unwrap_or("")
        );
        if let Ok(reply) = new_error(
            &msg,
            "org.freedesktop.DBus.Error.UnknownMethod",
            "s",
            vec![Value::Str(text)],
        ) {
            if let Err(e) = conn.send(&reply) {
                debug!("could not send UnknownMethod reply: {}", e);
            }
        }
    }
}

fn deliver(slot: &FilterSlot, msg: Message) {
    if let Err(TrySendError::Full(msg)) = slot.tx.try_send(msg) {
        // Per-filter back-pressure boundary: shed the oldest buffered
        // message rather than stall the reader.
        let _ = slot.rx.try_recv();
        if slot.tx.try_send(msg).is_err() {
            warn!("filter {} is saturated, dropping a message", slot.id);
        } else {
            warn!(
                "filter {} buffer full, dropped its oldest message",
                slot.id
            );
        }
    }
}
