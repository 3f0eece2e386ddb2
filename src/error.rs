//! Error type for the resolver core.

use std::error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

//------------ Error ---------------------------------------------------------

/// Error type for the resolver core.
///
/// All per-query outcomes (responses, timeouts, cancellations) travel
/// through [`Handler`][crate::Handler] callbacks instead; this type only
/// covers construction and submission failures plus the transport errors
/// the engine handles internally.
#[derive(Clone, Debug)]
pub enum Error {
    /// The engine is gone, no more queries can be submitted.
    ConnectionClosed,

    /// The configuration lists no nameservers to forward to.
    NoServers,

    /// Composing a query message failed.
    MessageBuild,

    /// Octet sequence too short to be a valid DNS message.
    ShortMessage,

    /// Parsing the resolver configuration failed.
    Config(crate::conf::Error),

    /// Loading the static host table failed.
    HostTable(crate::hosts::Error),

    /// Binding a UDP socket gave an error.
    UdpBind(Arc<std::io::Error>),

    /// Sending over a UDP socket gave an error.
    UdpSend(Arc<std::io::Error>),

    /// Connecting a TCP socket gave an error.
    TcpConnect(Arc<std::io::Error>),

    /// Writing to a TCP stream gave an error.
    TcpWrite(Arc<std::io::Error>),

    /// Reading from a TCP stream gave an error.
    TcpRead(Arc<std::io::Error>),

    /// Reading from a TCP stream ended before a full message arrived.
    TcpUnexpectedEndOfData,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Error::ConnectionClosed => write!(f, "resolver engine closed"),
            Error::NoServers => write!(f, "no servers available"),
            Error::MessageBuild => write!(f, "failed to compose query"),
            Error::ShortMessage => {
                write!(f, "octet sequence too short to be a valid message")
            }
            Error::Config(err) => {
                write!(f, "bad resolver configuration: {}", err)
            }
            Error::HostTable(err) => write!(f, "bad host table: {}", err),
            Error::UdpBind(_) => write!(f, "error binding UDP socket"),
            Error::UdpSend(_) => write!(f, "error sending to UDP socket"),
            Error::TcpConnect(_) => {
                write!(f, "error connecting TCP socket")
            }
            Error::TcpWrite(_) => write!(f, "error writing to TCP stream"),
            Error::TcpRead(_) => write!(f, "error reading from TCP stream"),
            Error::TcpUnexpectedEndOfData => {
                write!(f, "unexpected end of data on TCP stream")
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::ConnectionClosed => None,
            Error::NoServers => None,
            Error::MessageBuild => None,
            Error::ShortMessage => None,
            Error::Config(err) => Some(err),
            Error::HostTable(err) => Some(err),
            Error::UdpBind(err) => Some(err),
            Error::UdpSend(err) => Some(err),
            Error::TcpConnect(err) => Some(err),
            Error::TcpWrite(err) => Some(err),
            Error::TcpRead(err) => Some(err),
            Error::TcpUnexpectedEndOfData => None,
        }
    }
}

impl From<crate::conf::Error> for Error {
    fn from(err: crate::conf::Error) -> Self {
        Error::Config(err)
    }
}

impl From<crate::hosts::Error> for Error {
    fn from(err: crate::hosts::Error) -> Self {
        Error::HostTable(err)
    }
}
