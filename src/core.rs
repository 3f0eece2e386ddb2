//! The scheduler engine.
//!
//! The [`Core`] owns all lookup state and drives it from a single task:
//! a [`Context`][crate::Context] is only a handle that feeds commands
//! into the engine. Lookups move between three queues: `scheduled` holds
//! lookups awaiting their first or next attempt, `inflight` holds lookups
//! that have sent a datagram and are waiting for a response, ordered by
//! send time, and `ready` holds lookups whose terminal result is decided
//! but whose callback has not run yet.
//!
//! All transitions happen in the step function, which runs whenever the
//! single pacing timer fires and processes a bounded amount of work per
//! tick so the engine can never monopolise the runtime: deliver buffered
//! responses, flush a batch of ready callbacks, launch scheduled lookups
//! up to the in-flight capacity, sweep timed-out lookups, and rearm the
//! timer.

use std::cmp;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use domain::base::iana::Rcode;
use domain::base::message::Message;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};

use crate::context::{Operation, Settings};
use crate::error::Error;
use crate::hosts::Hosts;
use crate::lookup::{Kind, Location, Lookup, Outcome};
use crate::net::tcp::Exchange;
use crate::net::udp::Endpoint;
use crate::net::Family;
use crate::query::{self, Answer};

/// The work budget of a single timer tick.
///
/// Bounds the number of response deliveries and user callbacks per tick;
/// the rearm logic guarantees forward progress for whatever is left over.
const MAX_CALLS: usize = 8;

/// Capacity of the channel carrying transport events to the engine.
const EVENT_CHAN_CAP: usize = 8;

//------------ Command -------------------------------------------------------

/// An instruction from the context to the engine.
#[derive(Debug)]
pub(crate) enum Command {
    /// A freshly submitted operation.
    Submit {
        /// The operation handle shared with user space.
        op: Arc<Operation>,

        /// Whether the host table answers this one.
        local: bool,
    },

    /// An operation was cancelled; drop its state.
    Cancel {
        /// The key of the cancelled lookup.
        lookup: u64,
    },
}

//------------ Event ---------------------------------------------------------

/// A notification from one of the transports.
#[derive(Debug)]
pub(crate) enum Event {
    /// A parsed response arrived on a UDP endpoint.
    Datagram {
        /// The endpoint that received the datagram.
        family: Family,

        /// The source address of the datagram.
        from: SocketAddr,

        /// The parsed response.
        message: Message<Bytes>,
    },

    /// A TCP exchange concluded.
    Stream {
        /// The key of the lookup the exchange belongs to.
        lookup: u64,

        /// The response or the reason there is none.
        result: Result<Message<Bytes>, Error>,
    },
}

//------------ Core ----------------------------------------------------------

/// The engine behind a resolver context.
///
/// Returned by [`Context::new`][crate::Context::new]; run it by spawning
/// [`run`][Self::run] onto your runtime. The future completes once the
/// context is dropped.
#[derive(Debug)]
pub struct Core {
    /// Commands from the context.
    commands: mpsc::UnboundedReceiver<Command>,

    /// Events from the transports.
    events: mpsc::Receiver<Event>,

    /// A sender handed to transports as they are created.
    events_tx: mpsc::Sender<Event>,

    /// The configured name servers, in configuration order.
    servers: Vec<SocketAddr>,

    /// The runtime knobs, shared with the context.
    settings: Arc<Settings>,

    /// The static host table.
    hosts: Arc<Hosts>,

    /// Cleared when the context is dropped.
    alive: Arc<AtomicBool>,

    /// All outstanding lookups by key.
    lookups: HashMap<u64, Lookup>,

    /// Lookups awaiting their first or next attempt.
    scheduled: VecDeque<u64>,

    /// Lookups with a datagram out, in send order.
    inflight: VecDeque<u64>,

    /// Lookups with a decided result awaiting callback dispatch.
    ready: VecDeque<u64>,

    /// The IPv4 endpoint.
    v4: Endpoint,

    /// The IPv6 endpoint.
    v6: Endpoint,

    /// When the pacing timer fires next, if it is armed.
    deadline: Option<Instant>,
}

impl Core {
    /// Creates a new engine.
    pub(crate) fn new(
        commands: mpsc::UnboundedReceiver<Command>,
        servers: Vec<SocketAddr>,
        settings: Arc<Settings>,
        hosts: Arc<Hosts>,
        alive: Arc<AtomicBool>,
    ) -> Self {
        let (events_tx, events) = mpsc::channel(EVENT_CHAN_CAP);
        Core {
            commands,
            events,
            v4: Endpoint::new(Family::V4, events_tx.clone()),
            v6: Endpoint::new(Family::V6, events_tx.clone()),
            events_tx,
            servers,
            settings,
            hosts,
            alive,
            lookups: HashMap::new(),
            scheduled: VecDeque::new(),
            inflight: VecDeque::new(),
            ready: VecDeque::new(),
            deadline: None,
        }
    }

    /// Runs the engine.
    ///
    /// The future completes when the context that created the engine is
    /// dropped. Lookups still outstanding at that point are silently
    /// discarded.
    pub async fn run(mut self) {
        loop {
            let deadline = self.deadline.unwrap_or_else(Instant::now);
            tokio::select! {
                biased;
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Submit { op, local }) => {
                        self.submit(op, local)
                    }
                    Some(Command::Cancel { lookup }) => self.remove(lookup),
                    None => break,
                },
                event = self.events.recv() => {
                    match event.expect("engine holds an event sender") {
                        Event::Datagram { family, from, message } => {
                            self.buffered(family, from, message)
                        }
                        Event::Stream { lookup, result } => {
                            self.on_stream(lookup, result)
                        }
                    }
                }
                _ = sleep_until(deadline), if self.deadline.is_some() => {
                    self.step(Instant::now())
                }
            }
            if !self.alive.load(Ordering::Relaxed) {
                break;
            }
        }
        debug!("resolver engine shutting down");
    }

    /// Accepts a freshly submitted operation.
    fn submit(&mut self, op: Arc<Operation>, local: bool) {
        let key = op.key();
        self.lookups.insert(key, Lookup::new(op, local));
        self.scheduled.push_back(key);
        self.deadline = Some(Instant::now());
    }

    /// Drops the state of a cancelled operation.
    ///
    /// The cancellation callback already ran on the caller's stack; all
    /// that is left is tearing down subscriptions and queue entries.
    fn remove(&mut self, key: u64) {
        let Some(mut lookup) = self.lookups.remove(&key) else { return };
        self.unlink(&lookup, key);
        self.unsubscribe(&mut lookup, key);
        self.rearm(Instant::now());
    }

    /// Buffers an inbound response for delivery in the next step.
    fn buffered(
        &mut self,
        family: Family,
        from: SocketAddr,
        message: Message<Bytes>,
    ) {
        self.endpoint_mut(family).buffer_response(from, message);
        self.deadline = Some(Instant::now());
    }

    /// Handles the conclusion of a TCP exchange.
    fn on_stream(
        &mut self,
        key: u64,
        result: Result<Message<Bytes>, Error>,
    ) {
        let Some(lookup) = self.lookups.get_mut(&key) else { return };
        let (active, truncated) = match &lookup.kind {
            Kind::Remote(remote) => {
                (remote.exchange.is_some(), remote.truncated.clone())
            }
            Kind::Local => return,
        };
        if active {
            let matched = match &result {
                Ok(message) => lookup.op.query().matches(message),
                Err(_) => false,
            };
            match result {
                Ok(message) if matched => {
                    self.finish(key, Outcome::Answered(message.into()))
                }
                Ok(_) => {
                    trace!("ignoring mismatched tcp reply for lookup {}", key)
                }
                Err(err) => {
                    debug!("tcp exchange failed: {}", err);
                    // Fall back to the truncated answer that started the
                    // exchange.
                    if let Some(answer) = truncated {
                        self.finish(key, Outcome::Answered(answer))
                    }
                }
            }
        }
    }

    /// Runs one tick of the scheduler.
    fn step(&mut self, now: Instant) {
        self.deadline = None;

        // Step 1: deliver buffered responses.
        let mut budget = MAX_CALLS;
        budget -= self.deliver(Family::V4, budget, now);
        budget -= self.deliver(Family::V6, budget, now);

        // Step 2: flush ready callbacks, but not too many.
        let flush = cmp::min(budget, self.ready.len());
        for _ in 0..flush {
            let Some(key) = self.ready.pop_front() else { break };
            let Some(lookup) = self.lookups.remove(&key) else { continue };
            if let Some(handler) = lookup.op.take_handler() {
                match lookup.outcome {
                    Some(Outcome::Answered(answer)) => {
                        handler.on_received(&lookup.op, answer)
                    }
                    Some(Outcome::TimedOut) | None => {
                        handler.on_timeout(&lookup.op)
                    }
                }
            }
            // The callback may have dropped the context; in that case
            // none of our state can be trusted to be wanted anymore.
            if !self.alive.load(Ordering::Relaxed) {
                return;
            }
        }

        // Step 3: launch scheduled lookups up to capacity.
        while self.inflight.len() < self.settings.capacity() {
            let Some(key) = self.scheduled.pop_front() else { break };
            if self.execute(key, now) {
                if let Some(lookup) = self.lookups.get_mut(&key) {
                    lookup.location = Location::InFlight;
                }
                self.inflight.push_back(key);
            } else if let Some(lookup) = self.lookups.get_mut(&key) {
                lookup.location = Location::Ready;
                self.ready.push_back(key);
            }
        }

        // Step 4: sweep timed-out in-flight lookups. Lookups with credits
        // left go back to scheduled for another attempt, the rest are
        // done.
        let timeout = self.settings.timeout();
        let attempts = self.settings.attempts();
        while let Some(&key) = self.inflight.front() {
            let state = self.lookups.get(&key).and_then(|l| match &l.kind {
                Kind::Remote(remote) => {
                    Some((remote.last, remote.exchange.is_some()))
                }
                Kind::Local => None,
            });
            let (last, tcp_active) = match state {
                Some(state) => state,
                // A stray entry; discard it.
                None => {
                    self.inflight.pop_front();
                    continue;
                }
            };
            if last + timeout > now {
                break;
            }
            self.inflight.pop_front();
            if tcp_active {
                // The exchange outlived its window. Report the truncated
                // answer that started it rather than nothing at all.
                let truncated = self
                    .lookups
                    .get_mut(&key)
                    .and_then(Lookup::remote_mut)
                    .and_then(|remote| remote.truncated.take());
                match truncated {
                    Some(answer) => {
                        self.finish(key, Outcome::Answered(answer))
                    }
                    None => self.finish(key, Outcome::TimedOut),
                }
            } else if self
                .lookups
                .get(&key)
                .map(|lookup| lookup.credits(attempts))
                .unwrap_or(0)
                > 0
            {
                if let Some(lookup) = self.lookups.get_mut(&key) {
                    lookup.location = Location::Scheduled;
                }
                self.scheduled.push_back(key);
            } else {
                self.finish(key, Outcome::TimedOut);
            }
        }

        // Step 5: rearm the timer.
        self.rearm(now);
    }

    /// Delivers buffered responses of one endpoint, up to a budget.
    ///
    /// Returns the number of responses taken from the buffer, delivered
    /// or not.
    fn deliver(
        &mut self,
        family: Family,
        budget: usize,
        now: Instant,
    ) -> usize {
        let mut handled = 0;
        while handled < budget {
            let Some((from, message)) =
                self.endpoint_mut(family).next_buffered()
            else {
                break;
            };
            handled += 1;
            let id = message.header().id();
            for key in self.endpoint_mut(family).subscribers(from.ip(), id)
            {
                if self.on_datagram(key, from, &message, now) {
                    break;
                }
            }
        }
        handled
    }

    /// Offers a response to a subscribed lookup.
    ///
    /// Returns whether the lookup processed the response.
    fn on_datagram(
        &mut self,
        key: u64,
        from: SocketAddr,
        message: &Message<Bytes>,
        now: Instant,
    ) -> bool {
        let Some(lookup) = self.lookups.get_mut(&key) else { return false };
        if lookup.outcome.is_some() {
            return false;
        }
        match &lookup.kind {
            // Once a TCP exchange owns the lookup, datagrams are stale.
            Kind::Remote(remote) if remote.exchange.is_some() => {
                return false
            }
            Kind::Remote(_) => {}
            Kind::Local => return false,
        }
        // A cancelled operation may still be reachable until its removal
        // command arrives.
        if !lookup.op.has_handler() {
            return false;
        }
        if !lookup.op.query().matches(message) {
            return false;
        }

        if !message.header().tc() {
            self.finish(key, Outcome::Answered(message.clone().into()));
            return true;
        }

        // Truncated: retry the same query over TCP with the server that
        // reported the truncation. The UDP subscriptions are torn down,
        // and the timeout window starts over for the exchange.
        let id = lookup.op.query().id();
        let wire = lookup.op.query().message().as_octets().clone();
        let Some(remote) = lookup.remote_mut() else { return false };
        remote.truncated = Some(message.clone().into());
        remote.last = now;
        let subscriptions = std::mem::take(&mut remote.subscriptions);
        for (family, server) in subscriptions {
            self.endpoint_mut(family).unsubscribe(server, id, key);
        }
        let exchange =
            Exchange::start(key, from, wire, self.events_tx.clone());
        if let Some(remote) =
            self.lookups.get_mut(&key).and_then(Lookup::remote_mut)
        {
            remote.exchange = Some(exchange);
        }
        true
    }

    /// Makes an attempt for a scheduled lookup.
    ///
    /// Returns whether the lookup should move to the in-flight queue.
    fn execute(&mut self, key: u64, now: Instant) -> bool {
        let rotate = self.settings.rotate();
        let buffersize = self.settings.buffersize();
        let attempts = self.settings.attempts();
        let hosts = self.hosts.clone();

        let Some(lookup) = self.lookups.get_mut(&key) else { return false };
        match &mut lookup.kind {
            Kind::Local => {
                lookup.outcome = Some(Outcome::Answered(
                    hosts.synthesize(lookup.op.query()),
                ));
                false
            }
            Kind::Remote(remote) => {
                if remote.exchange.is_some() {
                    // A TCP exchange is running; keep waiting for it
                    // without spending an attempt.
                    return true;
                }
                if self.servers.is_empty()
                    || remote.attempts >= attempts
                {
                    lookup.outcome = Some(Outcome::TimedOut);
                    return false;
                }
                let id = lookup.op.query().id();
                let index = select_server(
                    rotate,
                    remote.attempts,
                    id,
                    self.servers.len(),
                );
                let server = self.servers[index];
                let family = Family::of(server.ip());
                let endpoint = match family {
                    Family::V4 => &mut self.v4,
                    Family::V6 => &mut self.v6,
                };
                match endpoint.send(
                    server,
                    lookup.op.query().as_slice(),
                    buffersize,
                ) {
                    Ok(()) => {
                        endpoint.subscribe(server.ip(), id, key);
                        remote.subscribe(family, server.ip());
                    }
                    // The attempt is spent anyway; the sweep drives the
                    // retry.
                    Err(err) => warn!("udp send failed: {}", err),
                }
                remote.attempts += 1;
                remote.last = now;
                true
            }
        }
    }

    /// Settles a lookup with its terminal result.
    ///
    /// Tears down subscriptions and any TCP exchange, applies the
    /// NXDOMAIN rewrite, and moves the lookup to the ready queue; the
    /// callback runs in a later flush phase.
    fn finish(&mut self, key: u64, outcome: Outcome) {
        let Some(mut lookup) = self.lookups.remove(&key) else { return };
        let outcome = match outcome {
            Outcome::Answered(answer) => {
                Outcome::Answered(self.soften_nxdomain(answer))
            }
            outcome => outcome,
        };
        self.unlink(&lookup, key);
        self.unsubscribe(&mut lookup, key);
        lookup.location = Location::Ready;
        lookup.outcome = Some(outcome);
        self.lookups.insert(key, lookup);
        self.ready.push_back(key);
        self.deadline = Some(Instant::now());
    }

    /// Rewrites an upstream NXDOMAIN for a name the host table knows.
    ///
    /// A nameserver that is unaware of a locally hosted name must not get
    /// to deny its existence, so the answer becomes an empty no-error
    /// response with the original question.
    fn soften_nxdomain(&self, answer: Answer) -> Answer {
        if answer.rcode() != Rcode::NXDOMAIN {
            return answer;
        }
        match query::question_name(answer.as_ref()) {
            Some(name) if self.hosts.contains(&name) => {
                query::empty_answer(&answer)
            }
            _ => answer,
        }
    }

    /// Removes a lookup's key from the queue it lives on.
    fn unlink(&mut self, lookup: &Lookup, key: u64) {
        let queue = match lookup.location {
            Location::Scheduled => &mut self.scheduled,
            Location::InFlight => &mut self.inflight,
            Location::Ready => &mut self.ready,
        };
        queue.retain(|&entry| entry != key);
    }

    /// Tears down a lookup's subscriptions and TCP exchange.
    fn unsubscribe(&mut self, lookup: &mut Lookup, key: u64) {
        let id = lookup.op.query().id();
        let Some(remote) = lookup.remote_mut() else { return };
        remote.exchange = None;
        for (family, server) in std::mem::take(&mut remote.subscriptions) {
            self.endpoint_mut(family).unsubscribe(server, id, key);
        }
    }

    /// Schedules the next timer tick.
    ///
    /// Ready callbacks and launchable lookups want a tick right away; an
    /// in-flight queue wants one when its front expires; and when
    /// everything is drained the timer is disarmed.
    fn rearm(&mut self, now: Instant) {
        self.deadline = if !self.ready.is_empty() {
            Some(now)
        } else if !self.scheduled.is_empty()
            && self.inflight.len() < self.settings.capacity()
        {
            Some(now)
        } else if let Some(&key) = self.inflight.front() {
            let timeout = self.settings.timeout();
            match self.lookups.get(&key).and_then(|l| match &l.kind {
                Kind::Remote(remote) => Some(remote.last + timeout),
                Kind::Local => None,
            }) {
                Some(at) => Some(at),
                None => Some(now),
            }
        } else {
            debug_assert!(self.scheduled.is_empty());
            None
        };
    }

    /// Returns the endpoint for an address family.
    fn endpoint_mut(&mut self, family: Family) -> &mut Endpoint {
        match family {
            Family::V4 => &mut self.v4,
            Family::V6 => &mut self.v6,
        }
    }
}

//------------ Utility -------------------------------------------------------

/// Picks the nameserver for an attempt.
///
/// Without rotation the list is walked in configuration order, retries
/// cycling through the fallbacks. With rotation the random query id
/// offsets the walk so that even first attempts spread across the list.
fn select_server(
    rotate: bool,
    attempt: usize,
    id: u16,
    count: usize,
) -> usize {
    if rotate {
        (attempt + id as usize) % count
    } else {
        attempt % count
    }
}

//============ Testing ======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn server_selection_in_order() {
        assert_eq!(select_server(false, 0, 7, 3), 0);
        assert_eq!(select_server(false, 1, 7, 3), 1);
        assert_eq!(select_server(false, 2, 7, 3), 2);
        assert_eq!(select_server(false, 3, 7, 3), 0);
    }

    #[test]
    fn server_selection_rotated() {
        // Three servers, id 7: the walk starts in the middle of the list.
        assert_eq!(select_server(true, 0, 7, 3), 1);
        assert_eq!(select_server(true, 1, 7, 3), 2);
        assert_eq!(select_server(true, 2, 7, 3), 0);
    }

    #[test]
    fn server_selection_single() {
        assert_eq!(select_server(true, 0, 40000, 1), 0);
        assert_eq!(select_server(false, 5, 0, 1), 0);
    }
}
