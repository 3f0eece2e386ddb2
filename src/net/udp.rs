//! The UDP endpoints of the engine.
//!
//! An [`Endpoint`] owns one UDP socket per address family, the table of
//! lookups subscribed to it and a buffer of parsed inbound responses. The
//! socket is opened lazily on the first send so a context that only ever
//! answers from the host table never touches the network.
//!
//! Receiving is done by a small reader task that parses each datagram and
//! forwards it to the engine; the engine buffers it here and consumes the
//! buffer in bounded batches from its step function, so a burst of
//! responses can never monopolise the loop.

use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use domain::base::message::Message;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::core::Event;
use crate::error::Error;
use crate::net::Family;

/// Size of the buffer datagrams are received into.
///
/// Large enough for the 1232 octet payload size advertised with EDNS0.
const RECV_SIZE: usize = 2000;

//------------ Endpoint ------------------------------------------------------

/// A UDP endpoint for one address family.
#[derive(Debug)]
pub struct Endpoint {
    /// The address family served by this endpoint.
    family: Family,

    /// The socket, once something was sent.
    socket: Option<Arc<UdpSocket>>,

    /// The reader task draining the socket.
    reader: Option<JoinHandle<()>>,

    /// Where the reader delivers parsed responses.
    events: mpsc::Sender<Event>,

    /// Lookups interested in responses, by source address and query id.
    ///
    /// Ids are random so collisions between concurrent lookups are rare,
    /// but they are legal, hence a list per key.
    subscriptions: HashMap<(IpAddr, u16), Vec<u64>>,

    /// Parsed responses awaiting delivery by the engine.
    buffer: VecDeque<(SocketAddr, Message<Bytes>)>,
}

impl Endpoint {
    /// Creates a new, unopened endpoint.
    pub fn new(family: Family, events: mpsc::Sender<Event>) -> Self {
        Endpoint {
            family,
            socket: None,
            reader: None,
            events,
            subscriptions: HashMap::new(),
            buffer: VecDeque::new(),
        }
    }

    /// Sends a query datagram to a nameserver.
    ///
    /// Opens the socket on first use. A full kernel send buffer is not an
    /// error: the attempt is simply spent and the retry machinery will
    /// send again.
    pub fn send(
        &mut self,
        target: SocketAddr,
        dgram: &[u8],
        buffersize: usize,
    ) -> Result<(), Error> {
        let socket = self.ensure_socket(buffersize)?;
        match socket.try_send_to(dgram, target) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                trace!("udp send to {} would block, dropping", target);
                Ok(())
            }
            Err(err) => Err(Error::UdpSend(Arc::new(err))),
        }
    }

    /// Subscribes a lookup to responses from a server with a given id.
    pub fn subscribe(&mut self, server: IpAddr, id: u16, lookup: u64) {
        self.subscriptions
            .entry((server, id))
            .or_default()
            .push(lookup)
    }

    /// Removes a lookup's subscription again.
    pub fn unsubscribe(&mut self, server: IpAddr, id: u16, lookup: u64) {
        if let Some(entry) = self.subscriptions.get_mut(&(server, id)) {
            entry.retain(|&key| key != lookup);
            if entry.is_empty() {
                self.subscriptions.remove(&(server, id));
            }
        }
    }

    /// Returns the lookups subscribed for a source address and id.
    pub fn subscribers(&self, server: IpAddr, id: u16) -> Vec<u64> {
        self.subscriptions
            .get(&(server, id))
            .cloned()
            .unwrap_or_default()
    }

    /// Appends a parsed response to the delivery buffer.
    pub fn buffer_response(
        &mut self,
        from: SocketAddr,
        message: Message<Bytes>,
    ) {
        self.buffer.push_back((from, message))
    }

    /// Takes the next buffered response, if any.
    pub fn next_buffered(
        &mut self,
    ) -> Option<(SocketAddr, Message<Bytes>)> {
        self.buffer.pop_front()
    }

    /// Returns the socket, opening it if necessary.
    ///
    /// Opening binds to an ephemeral port, applies the configured socket
    /// buffer size and spawns the reader task.
    fn ensure_socket(
        &mut self,
        buffersize: usize,
    ) -> Result<&UdpSocket, Error> {
        if self.socket.is_none() {
            let socket = open_socket(self.family, buffersize)
                .map_err(|err| Error::UdpBind(Arc::new(err)))?;
            let socket = Arc::new(socket);
            self.reader = Some(tokio::spawn(read_loop(
                self.family,
                socket.clone(),
                self.events.clone(),
            )));
            self.socket = Some(socket);
        }
        Ok(self.socket.as_deref().expect("socket was just opened"))
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort()
        }
    }
}

//------------ Utility -------------------------------------------------------

/// Opens a non-blocking UDP socket bound to an ephemeral port.
fn open_socket(
    family: Family,
    buffersize: usize,
) -> Result<UdpSocket, std::io::Error> {
    let (domain, local) = match family {
        Family::V4 => (
            Domain::IPV4,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        ),
        Family::V6 => (
            Domain::IPV6,
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        ),
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if buffersize > 0 {
        socket.set_recv_buffer_size(buffersize)?;
        socket.set_send_buffer_size(buffersize)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&local.into())?;
    UdpSocket::from_std(socket.into())
}

/// Drains a socket, forwarding every parseable response to the engine.
///
/// Datagrams that do not parse are dropped here; they never reach any
/// lookup. The loop ends when the engine goes away.
async fn read_loop(
    family: Family,
    socket: Arc<UdpSocket>,
    events: mpsc::Sender<Event>,
) {
    loop {
        let mut buf = vec![0u8; RECV_SIZE];
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(res) => res,
            Err(err) => {
                trace!("udp receive error: {}", err);
                continue;
            }
        };
        buf.truncate(len);
        let message = match Message::from_octets(Bytes::from(buf)) {
            Ok(message) => message,
            Err(_) => {
                trace!("dropping malformed datagram from {}", from);
                continue;
            }
        };
        let event = Event::Datagram {
            family,
            from,
            message,
        };
        if events.send(event).await.is_err() {
            break;
        }
    }
}
