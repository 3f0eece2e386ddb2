//! The per-lookup TCP exchange.
//!
//! When a UDP reply comes back truncated, the lookup retries the same
//! query over a short-lived TCP connection to the nameserver that sent
//! the truncated reply. The exchange runs as its own task and reports
//! back to the engine through the event channel; dropping the
//! [`Exchange`] aborts a connection that is still in progress.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use domain::base::message::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::Event;
use crate::error::Error;

//------------ Exchange ------------------------------------------------------

/// A running TCP exchange for a single lookup.
#[derive(Debug)]
pub struct Exchange {
    /// The task driving the exchange.
    task: JoinHandle<()>,
}

impl Exchange {
    /// Starts an exchange with a server.
    ///
    /// The outcome arrives at the engine as an [`Event::Stream`] carrying
    /// the lookup key.
    pub fn start(
        lookup: u64,
        server: SocketAddr,
        query: Vec<u8>,
        events: mpsc::Sender<Event>,
    ) -> Self {
        let task = tokio::spawn(async move {
            let result = exchange(server, query).await;
            let _ = events.send(Event::Stream { lookup, result }).await;
        });
        Exchange { task }
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        self.task.abort()
    }
}

//------------ Utility -------------------------------------------------------

/// Runs one query over a fresh TCP connection.
///
/// The message is sent with the two octet length prefix of RFC 1035,
/// section 4.2.2, and a single length-prefixed response is read back.
async fn exchange(
    server: SocketAddr,
    query: Vec<u8>,
) -> Result<Message<Bytes>, Error> {
    let mut stream = TcpStream::connect(server)
        .await
        .map_err(|err| Error::TcpConnect(Arc::new(err)))?;

    let mut framed = Vec::with_capacity(2 + query.len());
    framed.extend_from_slice(&(query.len() as u16).to_be_bytes());
    framed.extend_from_slice(&query);
    stream
        .write_all(&framed)
        .await
        .map_err(|err| Error::TcpWrite(Arc::new(err)))?;

    let len = stream
        .read_u16()
        .await
        .map_err(|err| Error::TcpRead(Arc::new(err)))?;
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::TcpUnexpectedEndOfData
        } else {
            Error::TcpRead(Arc::new(err))
        }
    })?;

    Message::from_octets(Bytes::from(buf)).map_err(|_| Error::ShortMessage)
}
