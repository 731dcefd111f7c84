//! Messages for talking to the message bus itself, and match rules for
//! subscribing to traffic.

use crate::error::*;
use crate::message::{new_method_call, DBusAddress, Message, MessageType};
use crate::wire::Value;

/// The bus driver: `org.freedesktop.DBus` at `/org/freedesktop/DBus`.
pub fn message_bus() -> DBusAddress {
    DBusAddress::new("/org/freedesktop/DBus")
        .with_bus_name("org.freedesktop.DBus")
        .with_interface("org.freedesktop.DBus")
}

/// The first call on every bus connection; the reply carries our unique
/// name.
pub fn hello() -> Result<Message> {
    new_method_call(&message_bus(), "Hello", "", vec![])
}

/// Flags for [`request_name`].
pub mod name_flag {
    pub const ALLOW_REPLACEMENT: u32 = 1;
    pub const REPLACE_EXISTING: u32 = 2;
    pub const DO_NOT_QUEUE: u32 = 4;
}

/// Codes carried in the u32 reply to [`request_name`].
pub mod request_name_reply {
    pub const PRIMARY_OWNER: u32 = 1;
    pub const IN_QUEUE: u32 = 2;
    pub const EXISTS: u32 = 3;
    pub const ALREADY_OWNER: u32 = 4;
}

pub fn request_name(name: &str, flags: u32) -> Result<Message> {
    new_method_call(
        &message_bus(),
        "RequestName",
        "su",
        vec![Value::Str(name.into()), Value::Uint32(flags)],
    )
}

pub fn release_name(name: &str) -> Result<Message> {
    new_method_call(
        &message_bus(),
        "ReleaseName",
        "s",
        vec![Value::Str(name.into())],
    )
}

pub fn list_names() -> Result<Message> {
    new_method_call(&message_bus(), "ListNames", "", vec![])
}

pub fn list_activatable_names() -> Result<Message> {
    new_method_call(&message_bus(), "ListActivatableNames", "", vec![])
}

pub fn name_has_owner(name: &str) -> Result<Message> {
    new_method_call(
        &message_bus(),
        "NameHasOwner",
        "s",
        vec![Value::Str(name.into())],
    )
}

pub fn get_name_owner(name: &str) -> Result<Message> {
    new_method_call(
        &message_bus(),
        "GetNameOwner",
        "s",
        vec![Value::Str(name.into())],
    )
}

/// Everyone queued to own `name`, current owner first.
pub fn list_queued_owners(name: &str) -> Result<Message> {
    new_method_call(
        &message_bus(),
        "ListQueuedOwners",
        "s",
        vec![Value::Str(name.into())],
    )
}

/// Add or update environment variables used for bus activation.
pub fn update_activation_environment(env: &[(&str, &str)]) -> Result<Message> {
    let pairs = env
        .iter()
        .map(|(k, v)| (Value::Str((*k).into()), Value::Str((*v).into())))
        .collect();
    new_method_call(
        &message_bus(),
        "UpdateActivationEnvironment",
        "a{ss}",
        vec![Value::Dict(pairs)],
    )
}

pub fn get_connection_unix_user(name: &str) -> Result<Message> {
    new_method_call(
        &message_bus(),
        "GetConnectionUnixUser",
        "s",
        vec![Value::Str(name.into())],
    )
}

pub fn get_connection_unix_process_id(name: &str) -> Result<Message> {
    new_method_call(
        &message_bus(),
        "GetConnectionUnixProcessID",
        "s",
        vec![Value::Str(name.into())],
    )
}

/// Credentials of the connection owning `name`, as an `a{sv}` dict.
pub fn get_connection_credentials(name: &str) -> Result<Message> {
    new_method_call(
        &message_bus(),
        "GetConnectionCredentials",
        "s",
        vec![Value::Str(name.into())],
    )
}

pub fn get_adt_audit_session_data(name: &str) -> Result<Message> {
    new_method_call(
        &message_bus(),
        "GetAdtAuditSessionData",
        "s",
        vec![Value::Str(name.into())],
    )
}

pub fn get_connection_selinux_security_context(name: &str) -> Result<Message> {
    new_method_call(
        &message_bus(),
        "GetConnectionSELinuxSecurityContext",
        "s",
        vec![Value::Str(name.into())],
    )
}

pub fn start_service_by_name(name: &str) -> Result<Message> {
    new_method_call(
        &message_bus(),
        "StartServiceByName",
        "su",
        vec![Value::Str(name.into()), Value::Uint32(0)],
    )
}

pub fn get_id() -> Result<Message> {
    new_method_call(&message_bus(), "GetId", "", vec![])
}

/// Ask the bus to route messages matching `rule` to this connection.
pub fn add_match(rule: &MatchRule) -> Result<Message> {
    new_method_call(
        &message_bus(),
        "AddMatch",
        "s",
        vec![Value::Str(rule.serialize())],
    )
}

pub fn remove_match(rule: &MatchRule) -> Result<Message> {
    new_method_call(
        &message_bus(),
        "RemoveMatch",
        "s",
        vec![Value::Str(rule.serialize())],
    )
}

/// A match rule, both in its wire form (`key='value',...` for `AddMatch`)
/// and as a local predicate for router filters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchRule {
    conditions: Vec<(String, String)>,
}

impl MatchRule {
    pub fn new() -> MatchRule {
        MatchRule::default()
    }

    fn condition(mut self, key: &str, value: &str) -> MatchRule {
        self.conditions.retain(|(k, _)| k != key);
        self.conditions.push((key.into(), value.into()));
        self
    }

    pub fn msg_type(self, message_type: MessageType) -> MatchRule {
        self.condition("type", message_type.rule_name())
    }

    pub fn sender(self, sender: &str) -> MatchRule {
        self.condition("sender", sender)
    }

    pub fn interface(self, interface: &str) -> MatchRule {
        self.condition("interface", interface)
    }

    pub fn member(self, member: &str) -> MatchRule {
        self.condition("member", member)
    }

    pub fn path(self, path: &str) -> MatchRule {
        self.condition("path", path)
    }

    /// Match any path equal to or below `namespace`.
    pub fn path_namespace(self, namespace: &str) -> MatchRule {
        self.condition("path_namespace", namespace)
    }

    pub fn destination(self, destination: &str) -> MatchRule {
        self.condition("destination", destination)
    }

    pub fn eavesdrop(self) -> MatchRule {
        self.condition("eavesdrop", "true")
    }

    /// Require string argument `n` (0-63) of the body to equal `value`.
    pub fn arg(self, n: u8, value: &str) -> Result<MatchRule> {
        if n > 63 {
            return Err(context!(ErrorKind::Marshal(format!(
                "arg{} is out of the arg0..arg63 range",
                n
            ))));
        }
        Ok(self.condition(&format!("arg{}", n), value))
    }

    /// Require string argument `n` to be a path-style prefix match of
    /// `value`.
    pub fn arg_path(self, n: u8, value: &str) -> Result<MatchRule> {
        if n > 63 {
            return Err(context!(ErrorKind::Marshal(format!(
                "arg{}path is out of the arg0..arg63 range",
                n
            ))));
        }
        Ok(self.condition(&format!("arg{}path", n), value))
    }

    /// Require argument 0 to be `value` or a dotted name below it.
    pub fn arg0_namespace(self, value: &str) -> MatchRule {
        self.condition("arg0namespace", value)
    }

    /// Render the rule in the bus wire syntax, keys sorted.
    pub fn serialize(&self) -> String {
        let mut conditions = self.conditions.clone();
        conditions.sort();
        let parts: Vec<String> = conditions
            .iter()
            .map(|(k, v)| format!("{}='{}'", k, v.replace('\'', "\\'")))
            .collect();
        parts.join(",")
    }

    /// Evaluate the rule against a message, for local filtering.
    /// `eavesdrop` only affects the bus and is ignored here.
    pub fn matches(&self, msg: &Message) -> bool {
        self.conditions.iter().all(|(key, value)| {
            let value = value.as_str();
            match key.as_str() {
                "type" => msg.header.message_type.rule_name() == value,
                "sender" => msg.sender() == Some(value),
                "interface" => msg.interface() == Some(value),
                "member" => msg.member() == Some(value),
                "path" => msg.path() == Some(value),
                "destination" => msg.destination() == Some(value),
                "path_namespace" => match msg.path() {
                    Some(path) => {
                        value == "/"
                            || path == value
                            || path.starts_with(&format!("{}/", value))
                    }
                    None => false,
                },
                "arg0namespace" => match str_arg(msg, 0) {
                    Some(arg) => {
                        arg == value || arg.starts_with(&format!("{}.", value))
                    }
                    None => false,
                },
                "eavesdrop" => true,
                _ => match parse_arg_key(key) {
                    Some((n, false)) => str_arg(msg, n) == Some(value),
                    Some((n, true)) => match str_arg(msg, n) {
                        Some(arg) => path_prefix_match(arg, value),
                        None => false,
                    },
                    None => false,
                },
            }
        })
    }
}

fn str_arg(msg: &Message, n: usize) -> Option<&str> {
    match msg.body.get(n) {
        Some(Value::Str(s)) => Some(s),
        _ => None,
    }
}

fn parse_arg_key(key: &str) -> Option<(usize, bool)> {
    let rest = key.strip_prefix("arg")?;
    let (digits, is_path) = match rest.strip_suffix("path") {
        Some(digits) => (digits, true),
        None => (rest, false),
    };
    let n: usize = digits.parse().ok()?;
    if n > 63 {
        return None;
    }
    Some((n, is_path))
}

/// The `argNpath` relation: equal, or one side is a `/`-terminated
/// prefix of the other.
fn path_prefix_match(arg: &str, value: &str) -> bool {
    arg == value
        || (value.ends_with('/') && arg.starts_with(value))
        || (arg.ends_with('/') && value.starts_with(arg))
}
