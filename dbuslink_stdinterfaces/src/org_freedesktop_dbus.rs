use dbuslink::bus_messages::{message_bus, MatchRule};
use dbuslink::error::*;
use dbuslink::{new_method_call, DBusAddress, Message, Value};

/// Property access on any object via `org.freedesktop.DBus.Properties`.
///
/// The wrapped address must carry the interface whose properties are
/// being read or written.
#[derive(Debug, Clone)]
pub struct Properties {
    obj: DBusAddress,
    props: DBusAddress,
}

impl Properties {
    pub fn new(obj: &DBusAddress) -> Properties {
        Properties {
            obj: obj.clone(),
            props: obj.with_interface("org.freedesktop.DBus.Properties"),
        }
    }

    fn interface(&self) -> Result<&str> {
        self.obj.interface.as_deref().ok_or_else(|| {
            context!(ErrorKind::Marshal(
                "property access needs an address with an interface".into()
            ))
        })
    }

    /// `Get(interface, name)`, replied to with a variant.
    pub fn get(&self, name: &str) -> Result<Message> {
        let interface = self.interface()?;
        new_method_call(
            &self.props,
            "Get",
            "ss",
            vec![Value::Str(interface.into()), Value::Str(name.into())],
        )
    }

    /// `GetAll(interface)`, replied to with an `a{sv}` dict.
    pub fn get_all(&self) -> Result<Message> {
        let interface = self.interface()?;
        new_method_call(
            &self.props,
            "GetAll",
            "s",
            vec![Value::Str(interface.into())],
        )
    }

    /// `Set(interface, name, value)` with the value wrapped in a variant
    /// of the given signature.
    pub fn set(&self, name: &str, signature: &str, value: Value) -> Result<Message> {
        let interface = self.interface()?;
        new_method_call(
            &self.props,
            "Set",
            "ssv",
            vec![
                Value::Str(interface.into()),
                Value::Str(name.into()),
                Value::Variant(signature.into(), Box::new(value)),
            ],
        )
    }
}

/// `org.freedesktop.DBus.Introspectable` on any object.
#[derive(Debug, Clone)]
pub struct Introspectable {
    addr: DBusAddress,
}

impl Introspectable {
    pub fn new(obj: &DBusAddress) -> Introspectable {
        Introspectable {
            addr: obj.with_interface("org.freedesktop.DBus.Introspectable"),
        }
    }

    /// `Introspect()`, replied to with the XML description.
    pub fn introspect(&self) -> Result<Message> {
        new_method_call(&self.addr, "Introspect", "", vec![])
    }
}

/// `org.freedesktop.DBus.Peer` on any object.
#[derive(Debug, Clone)]
pub struct Peer {
    addr: DBusAddress,
}

impl Peer {
    pub fn new(obj: &DBusAddress) -> Peer {
        Peer {
            addr: obj.with_interface("org.freedesktop.DBus.Peer"),
        }
    }

    pub fn ping(&self) -> Result<Message> {
        new_method_call(&self.addr, "Ping", "", vec![])
    }

    pub fn get_machine_id(&self) -> Result<Message> {
        new_method_call(&self.addr, "GetMachineId", "", vec![])
    }
}

/// The bus driver's `org.freedesktop.DBus.Monitoring` interface.
#[derive(Debug, Clone)]
pub struct Monitoring {
    addr: DBusAddress,
}

impl Monitoring {
    pub fn new() -> Monitoring {
        Monitoring {
            addr: message_bus().with_interface("org.freedesktop.DBus.Monitoring"),
        }
    }

    /// `BecomeMonitor(rules, 0)`: turn this connection into a monitor
    /// receiving everything matching the rules (all traffic if empty).
    pub fn become_monitor(&self, rules: &[MatchRule]) -> Result<Message> {
        let rules = rules
            .iter()
            .map(|r| Value::Str(r.serialize()))
            .collect::<Vec<_>>();
        new_method_call(
            &self.addr,
            "BecomeMonitor",
            "asu",
            vec![Value::Array(rules), Value::Uint32(0)],
        )
    }
}

impl Default for Monitoring {
    fn default() -> Self {
        Monitoring::new()
    }
}
