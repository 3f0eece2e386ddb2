//! The per-lookup state machine.
//!
//! One [`Lookup`] exists for every outstanding operation. Remote lookups
//! are network driven: they spend attempts on UDP datagrams, collect
//! subscriptions on the endpoints they sent to and may promote themselves
//! to a TCP exchange when a reply comes back truncated. Local lookups are
//! answered from the host table and only exist so that their result is
//! delivered with the same deferred semantics as everything else.
//!
//! The lookup itself is a passive record; the engine in [`crate::core`]
//! drives all transitions.

use std::net::IpAddr;
use std::sync::Arc;

use tokio::time::Instant;

use crate::context::Operation;
use crate::net::tcp::Exchange;
use crate::net::Family;
use crate::query::Answer;

//------------ Location ------------------------------------------------------

/// The queue a lookup currently lives on.
///
/// A lookup is on exactly one queue at any time; the engine keeps this tag
/// in sync with the queue contents.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Location {
    /// Awaiting its first or next attempt.
    Scheduled,

    /// Sent at least one datagram and awaiting a response or timeout.
    InFlight,

    /// Terminal result decided, awaiting callback dispatch.
    Ready,
}

//------------ Outcome -------------------------------------------------------

/// The terminal result of a lookup.
///
/// Cancellation is not listed here: it reports synchronously from the
/// caller's stack and never travels through the ready queue.
#[derive(Debug)]
pub enum Outcome {
    /// A response was received.
    Answered(Answer),

    /// All attempts were spent without a response.
    TimedOut,
}

//------------ Lookup --------------------------------------------------------

/// The state of one outstanding operation.
#[derive(Debug)]
pub struct Lookup {
    /// The user-facing operation handle.
    pub op: Arc<Operation>,

    /// The queue the lookup currently lives on.
    pub location: Location,

    /// The decided terminal result, if any.
    pub outcome: Option<Outcome>,

    /// The variant-specific state.
    pub kind: Kind,
}

impl Lookup {
    /// Creates a lookup in the scheduled state.
    pub fn new(op: Arc<Operation>, local: bool) -> Self {
        Lookup {
            op,
            location: Location::Scheduled,
            outcome: None,
            kind: if local {
                Kind::Local
            } else {
                Kind::Remote(Remote::new())
            },
        }
    }

    /// Returns the number of attempts the lookup may still make.
    ///
    /// Local lookups always report one credit: they never send anything
    /// but have one resolution step left until they are executed.
    pub fn credits(&self, configured: usize) -> usize {
        match &self.kind {
            Kind::Remote(remote) => {
                configured.saturating_sub(remote.attempts)
            }
            Kind::Local => 1,
        }
    }

    /// Returns the remote state, if this is a remote lookup.
    pub fn remote_mut(&mut self) -> Option<&mut Remote> {
        match &mut self.kind {
            Kind::Remote(remote) => Some(remote),
            Kind::Local => None,
        }
    }
}

//------------ Kind ----------------------------------------------------------

/// The two lookup variants.
#[derive(Debug)]
pub enum Kind {
    /// A lookup forwarded to the configured name servers.
    Remote(Remote),

    /// A lookup answered from the static host table.
    Local,
}

//------------ Remote --------------------------------------------------------

/// State of a network-driven lookup.
#[derive(Debug)]
pub struct Remote {
    /// The number of datagrams sent so far.
    pub attempts: usize,

    /// When the last attempt was made.
    ///
    /// Reset when a TCP exchange starts so the exchange gets a fresh
    /// timeout window. Only meaningful while the lookup is in flight.
    pub last: Instant,

    /// The endpoint subscriptions collected across attempts.
    ///
    /// Kept until the lookup terminates so that a late reply to an
    /// earlier attempt still completes the lookup.
    pub subscriptions: Vec<(Family, IpAddr)>,

    /// The TCP exchange started after a truncated reply, if any.
    pub exchange: Option<Exchange>,

    /// The truncated UDP answer that triggered the TCP exchange.
    ///
    /// Reported as a best-effort result should the exchange fail.
    pub truncated: Option<Answer>,
}

impl Remote {
    /// Creates the state for a fresh remote lookup.
    fn new() -> Self {
        Remote {
            attempts: 0,
            last: Instant::now(),
            subscriptions: Vec::new(),
            exchange: None,
            truncated: None,
        }
    }

    /// Records a subscription so it can be torn down later.
    pub fn subscribe(&mut self, family: Family, server: IpAddr) {
        if !self.subscriptions.contains(&(family, server)) {
            self.subscriptions.push((family, server))
        }
    }
}
