//! Parsing of D-Bus bus address strings and well-known bus discovery.
//!
//! An address is a semicolon-separated list of transports, each
//! `transport:key=value,key=value` with `%XX` escapes in values. The
//! parser only interprets the string; opening a socket is the stream
//! layer's job, which tries the parsed entries in listed order.

use std::env;

use crate::error::*;

/// Path of the system bus socket when `DBUS_SYSTEM_BUS_ADDRESS` is unset.
pub const DEFAULT_SYSTEM_BUS_PATH: &str = "/var/run/dbus/system_bus_socket";

/// One connectable endpoint from a bus address string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportAddress {
    UnixPath(String),
    UnixAbstract(String),
    Tcp {
        host: String,
        port: u16,
        family: Option<String>,
    },
}

fn percent_decode(value: &str) -> Result<String> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 3 > bytes.len() {
                return Err(context!(ErrorKind::InvalidAddress));
            }
            let hex = ::std::str::from_utf8(&bytes[i + 1..i + 3])
                .map_err(|_| context!(ErrorKind::InvalidAddress))?;
            let byte =
                u8::from_str_radix(hex, 16).map_err(|_| context!(ErrorKind::InvalidAddress))?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| context!(ErrorKind::InvalidAddress))
}

fn parse_entry(entry: &str) -> Result<Option<TransportAddress>> {
    let mut split = entry.splitn(2, ':');
    let transport = split.next().unwrap_or("");
    let params = split
        .next()
        .ok_or_else(|| context!(ErrorKind::InvalidAddress))?;

    let mut keys: Vec<(String, String)> = Vec::new();
    for pair in params.split(',') {
        if pair.is_empty() {
            continue;
        }
        let mut kv = pair.splitn(2, '=');
        let key = kv.next().unwrap_or("");
        let value = kv
            .next()
            .ok_or_else(|| context!(ErrorKind::InvalidAddress))?;
        keys.push((key.into(), percent_decode(value)?));
    }
    let get = |name: &str| {
        keys.iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    };

    match transport {
        "unix" => {
            if let Some(path) = get("path") {
                Ok(Some(TransportAddress::UnixPath(path)))
            } else if let Some(name) = get("abstract") {
                Ok(Some(TransportAddress::UnixAbstract(name)))
            } else {
                Err(context!(ErrorKind::InvalidAddress))
            }
        }
        "tcp" => {
            let host = get("host").ok_or_else(|| context!(ErrorKind::InvalidAddress))?;
            let port = get("port")
                .ok_or_else(|| context!(ErrorKind::InvalidAddress))?
                .parse::<u16>()
                .map_err(|_| context!(ErrorKind::InvalidAddress))?;
            Ok(Some(TransportAddress::Tcp {
                host,
                port,
                family: get("family"),
            }))
        }
        // Transports this library cannot open (launchd, systemd,
        // unixexec, ...) are skipped, not rejected.
        _ => Ok(None),
    }
}

/// Parse a bus address string into its usable transports, in listed order.
pub fn parse_addresses(address: &str) -> Result<Vec<TransportAddress>> {
    let mut out = Vec::new();
    for entry in address.split(';') {
        if entry.is_empty() {
            continue;
        }
        if let Some(t) = parse_entry(entry)? {
            out.push(t);
        }
    }
    if out.is_empty() {
        return Err(context!(ErrorKind::InvalidAddress));
    }
    Ok(out)
}

/// Transports for the session bus, from `DBUS_SESSION_BUS_ADDRESS`.
pub fn session_bus_addresses() -> Result<Vec<TransportAddress>> {
    let addr =
        env::var("DBUS_SESSION_BUS_ADDRESS").map_err(|_| context!(ErrorKind::InvalidAddress))?;
    parse_addresses(&addr)
}

/// Transports for the system bus, from `DBUS_SYSTEM_BUS_ADDRESS` or the
/// conventional socket path.
pub fn system_bus_addresses() -> Result<Vec<TransportAddress>> {
    match env::var("DBUS_SYSTEM_BUS_ADDRESS") {
        Ok(addr) => parse_addresses(&addr),
        Err(_) => Ok(vec![TransportAddress::UnixPath(
            DEFAULT_SYSTEM_BUS_PATH.into(),
        )]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_addresses() {
        assert_eq!(
            parse_addresses("unix:path=/run/user/1000/bus").unwrap(),
            vec![TransportAddress::UnixPath("/run/user/1000/bus".into())]
        );
        assert_eq!(
            parse_addresses("unix:abstract=/tmp/dbus-Ea3bc,guid=00").unwrap(),
            vec![TransportAddress::UnixAbstract("/tmp/dbus-Ea3bc".into())]
        );
    }

    #[test]
    fn tcp_addresses() {
        assert_eq!(
            parse_addresses("tcp:host=localhost,port=4710,family=ipv4").unwrap(),
            vec![TransportAddress::Tcp {
                host: "localhost".into(),
                port: 4710,
                family: Some("ipv4".into()),
            }]
        );
        assert!(parse_addresses("tcp:host=localhost").is_err());
        assert!(parse_addresses("tcp:host=localhost,port=banana").is_err());
    }

    #[test]
    fn percent_escapes_decode_in_values() {
        assert_eq!(
            parse_addresses("unix:path=/tmp/with%20space%2fslash").unwrap(),
            vec![TransportAddress::UnixPath("/tmp/with space/slash".into())]
        );
        assert!(parse_addresses("unix:path=/tmp/%zz").is_err());
        assert!(parse_addresses("unix:path=/tmp/%2").is_err());
    }

    #[test]
    fn lists_keep_order_and_skip_unknown_transports() {
        let parsed = parse_addresses(
            "launchd:env=DBUS_LAUNCHD_SESSION_BUS_SOCKET;unix:path=/one;tcp:host=h,port=1",
        )
        .unwrap();
        assert_eq!(
            parsed,
            vec![
                TransportAddress::UnixPath("/one".into()),
                TransportAddress::Tcp {
                    host: "h".into(),
                    port: 1,
                    family: None,
                },
            ]
        );
    }

    #[test]
    fn malformed_addresses_are_rejected() {
        assert!(parse_addresses("unix").is_err());
        assert!(parse_addresses("unix:pathless").is_err());
        assert!(parse_addresses("unix:guid=00").is_err());
        assert!(parse_addresses("").is_err());
    }

    #[test]
    fn system_bus_falls_back_to_the_conventional_path() {
        env::remove_var("DBUS_SYSTEM_BUS_ADDRESS");
        assert_eq!(
            system_bus_addresses().unwrap(),
            vec![TransportAddress::UnixPath(DEFAULT_SYSTEM_BUS_PATH.into())]
        );
    }

    #[test]
    fn session_bus_reads_the_environment() {
        env::set_var("DBUS_SESSION_BUS_ADDRESS", "unix:path=/tmp/test-bus");
        assert_eq!(
            session_bus_addresses().unwrap(),
            vec![TransportAddress::UnixPath("/tmp/test-bus".into())]
        );
    }
}
