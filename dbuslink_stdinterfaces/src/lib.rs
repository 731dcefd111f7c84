//! Message generators for the standard D-Bus interfaces every object or
//! bus implements: `org.freedesktop.DBus.Properties`, `Introspectable`,
//! `Peer` and the bus driver's `Monitoring` interface.
//!
//! Each generator binds an object path and interface once and then turns
//! method arguments into ready-to-send [`dbuslink::Message`]s.

pub mod org_freedesktop_dbus;

pub use crate::org_freedesktop_dbus::{Introspectable, Monitoring, Peer, Properties};
