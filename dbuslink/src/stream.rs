//! Byte-stream transports for bus connections.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::net::UnixStream;

use crate::bus::TransportAddress;
use crate::error::*;

/// A full-duplex transport carrying D-Bus bytes.
pub trait Stream: Read + Write + Send + Sync {
    fn split(&mut self) -> Result<(Box<dyn Read + Send + Sync>, Box<dyn Write + Send + Sync>)>;
    fn shutdown(&mut self) -> Result<()>;
    fn try_clone(&mut self) -> ::std::io::Result<Box<dyn Stream>>;
}

impl Stream for TcpStream {
    #[inline]
    fn split(&mut self) -> Result<(Box<dyn Read + Send + Sync>, Box<dyn Write + Send + Sync>)> {
        Ok((
            Box::new(TcpStream::try_clone(self).map_err(map_context!())?),
            Box::new(TcpStream::try_clone(self).map_err(map_context!())?),
        ))
    }

    #[inline]
    fn shutdown(&mut self) -> Result<()> {
        TcpStream::shutdown(self, Shutdown::Both).map_err(map_context!())?;
        Ok(())
    }

    #[inline]
    fn try_clone(&mut self) -> ::std::io::Result<Box<dyn Stream>> {
        Ok(Box::new(TcpStream::try_clone(self)?))
    }
}

impl Stream for UnixStream {
    #[inline]
    fn split(&mut self) -> Result<(Box<dyn Read + Send + Sync>, Box<dyn Write + Send + Sync>)> {
        Ok((
            Box::new(UnixStream::try_clone(self).map_err(map_context!())?),
            Box::new(UnixStream::try_clone(self).map_err(map_context!())?),
        ))
    }

    #[inline]
    fn shutdown(&mut self) -> Result<()> {
        UnixStream::shutdown(self, Shutdown::Both).map_err(map_context!())?;
        Ok(())
    }

    #[inline]
    fn try_clone(&mut self) -> ::std::io::Result<Box<dyn Stream>> {
        Ok(Box::new(UnixStream::try_clone(self)?))
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn connect_abstract(name: &str) -> Result<UnixStream> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    let addr = SocketAddr::from_abstract_name(name.as_bytes()).map_err(map_context!())?;
    UnixStream::connect_addr(&addr).map_err(map_context!())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn connect_abstract(_name: &str) -> Result<UnixStream> {
    Err(context!(ErrorKind::InvalidAddress))
}

fn connect_one(address: &TransportAddress) -> Result<Box<dyn Stream>> {
    match address {
        TransportAddress::UnixPath(path) => Ok(Box::new(
            UnixStream::connect(path).map_err(map_context!())?,
        )),
        TransportAddress::UnixAbstract(name) => Ok(Box::new(connect_abstract(name)?)),
        TransportAddress::Tcp { host, port, .. } => Ok(Box::new(
            TcpStream::connect((host.as_str(), *port)).map_err(map_context!())?,
        )),
    }
}

/// Open the first transport in the list that accepts a connection.
pub fn connect(addresses: &[TransportAddress]) -> Result<Box<dyn Stream>> {
    let mut last_err = None;
    for address in addresses {
        match connect_one(address) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| context!(ErrorKind::InvalidAddress)))
}
