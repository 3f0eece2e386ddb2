//! The user-facing resolver context.
//!
//! This module contains [`Context`], the handle through which queries are
//! submitted, the [`Operation`] handle returned for every query, and the
//! [`Handler`] trait user space implements to receive results.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use domain::base::iana::{Rcode, Rtype};
use domain::base::name::{Name, ToName};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::conf::{ResolvConf, ResolvOptions};
use crate::core::{Command, Core};
use crate::error::Error;
use crate::hosts::Hosts;
use crate::query::{Answer, Bits, Query};

//------------ Handler -------------------------------------------------------

/// A user space object receiving the result of an operation.
///
/// Exactly one of the terminal callbacks is invoked for every submitted
/// operation, unless the context is dropped first. All callbacks except
/// [`on_cancelled`][Self::on_cancelled] run on the engine's task;
/// `on_cancelled` runs synchronously on the stack of the caller of
/// [`Operation::cancel`].
pub trait Handler: Send + Sync + 'static {
    /// Called when a response was received.
    ///
    /// The default implementation dispatches on the response code:
    /// [`on_resolved`][Self::on_resolved] for a no-error response and
    /// [`on_failure`][Self::on_failure] for everything else. Override
    /// this method instead if you want to inspect every response
    /// yourself.
    fn on_received(&self, op: &Operation, answer: Answer) {
        match answer.rcode() {
            Rcode::NOERROR => self.on_resolved(op, answer),
            rcode => self.on_failure(op, rcode),
        }
    }

    /// Called when the operation succeeded.
    fn on_resolved(&self, op: &Operation, answer: Answer) {
        let _ = (op, answer);
    }

    /// Called when a response carried an error code.
    fn on_failure(&self, op: &Operation, rcode: Rcode) {
        let _ = (op, rcode);
    }

    /// Called when all attempts expired without a response.
    fn on_timeout(&self, op: &Operation) {
        let _ = op;
    }

    /// Called when the operation was cancelled from user space.
    fn on_cancelled(&self, op: &Operation) {
        let _ = op;
    }
}

//------------ Operation -----------------------------------------------------

/// A handle to a submitted query.
///
/// The handle allows inspecting the query and cancelling the operation.
/// Dropping the handle does not cancel anything; the result is still
/// delivered to the handler.
pub struct Operation {
    /// The key identifying the lookup inside the engine.
    key: u64,

    /// The composed query.
    query: Query,

    /// The handler to report to.
    ///
    /// Taken on the first terminal report; an empty slot marks the
    /// operation as settled and prevents any second callback.
    handler: Mutex<Option<Arc<dyn Handler>>>,

    /// Channel for telling the engine about a cancellation.
    commands: mpsc::UnboundedSender<Command>,
}

impl Operation {
    /// Creates a new operation.
    fn new(
        key: u64,
        query: Query,
        handler: Arc<dyn Handler>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Operation {
            key,
            query,
            handler: Mutex::new(Some(handler)),
            commands,
        }
    }

    /// Returns the query this operation asks.
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Cancels the operation.
    ///
    /// The handler's `on_cancelled` is invoked before this method
    /// returns and no further callbacks will happen. Cancelling an
    /// operation that already reported is a no-op.
    pub fn cancel(&self) {
        let handler = self.handler.lock().take();
        let Some(handler) = handler else { return };
        handler.on_cancelled(self);
        let _ = self.commands.send(Command::Cancel { lookup: self.key });
    }

    /// Returns the engine key of this operation.
    pub(crate) fn key(&self) -> u64 {
        self.key
    }

    /// Takes the handler out of its slot for the terminal report.
    pub(crate) fn take_handler(&self) -> Option<Arc<dyn Handler>> {
        self.handler.lock().take()
    }

    /// Returns whether the operation still has a handler to report to.
    pub(crate) fn has_handler(&self) -> bool {
        self.handler.lock().is_some()
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("key", &self.key)
            .field("query", &self.query)
            .finish()
    }
}

//------------ Settings ------------------------------------------------------

/// The runtime knobs of a context, shared with its engine.
#[derive(Debug)]
pub(crate) struct Settings {
    /// Maximum number of concurrent in-flight lookups.
    capacity: AtomicUsize,

    /// Maximum number of datagrams to send per lookup.
    attempts: AtomicUsize,

    /// Time to wait for a response after an attempt, in milliseconds.
    timeout: AtomicU64,

    /// Seconds between retries, in milliseconds.
    ///
    /// Kept as a separate knob for compatibility; the scheduler
    /// currently paces retries by `timeout` alone.
    interval: AtomicU64,

    /// Socket send and receive buffer size, zero for the kernel default.
    buffersize: AtomicUsize,

    /// Distribute first attempts across the nameserver list.
    rotate: AtomicBool,
}

impl Settings {
    /// The default in-flight capacity.
    const DEFAULT_CAPACITY: usize = 10;

    /// Creates settings from configured options.
    fn from_options(options: &ResolvOptions) -> Self {
        Settings {
            capacity: AtomicUsize::new(Self::DEFAULT_CAPACITY),
            attempts: AtomicUsize::new(options.attempts),
            timeout: AtomicU64::new(options.timeout.as_millis() as u64),
            interval: AtomicU64::new(options.timeout.as_millis() as u64),
            buffersize: AtomicUsize::new(0),
            rotate: AtomicBool::new(options.rotate),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout.load(Ordering::Relaxed))
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval.load(Ordering::Relaxed))
    }

    pub fn buffersize(&self) -> usize {
        self.buffersize.load(Ordering::Relaxed)
    }

    pub fn rotate(&self) -> bool {
        self.rotate.load(Ordering::Relaxed)
    }
}

//------------ Context -------------------------------------------------------

/// A DNS resolver context.
///
/// The context is the public face of the resolver: it accepts queries,
/// hands out [`Operation`] handles and exposes the runtime knobs. The
/// actual work happens in the [`Core`] returned alongside the context,
/// which needs to be spawned onto a runtime; [`Context::spawn`] does both
/// in one go. Dropping the context shuts the engine down and silently
/// abandons all outstanding lookups.
#[derive(Debug)]
pub struct Context {
    /// Channel to the engine.
    commands: mpsc::UnboundedSender<Command>,

    /// The runtime knobs.
    settings: Arc<Settings>,

    /// The configured nameservers.
    servers: Vec<SocketAddr>,

    /// The static host table.
    hosts: Arc<Hosts>,

    /// Advertise EDNS0 in outgoing queries.
    edns0: bool,

    /// Key generator for operations.
    counter: AtomicU64,

    /// Shared liveness flag, cleared on drop.
    alive: Arc<AtomicBool>,
}

impl Context {
    /// Creates a new context from a configuration and host table.
    ///
    /// Returns the context and the engine driving it; spawn the engine's
    /// [`run`][Core::run] future onto your runtime.
    pub fn new(conf: ResolvConf, hosts: Hosts) -> (Context, Core) {
        let settings = Arc::new(Settings::from_options(&conf.options));
        let hosts = Arc::new(hosts);
        let alive = Arc::new(AtomicBool::new(true));
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let core = Core::new(
            commands_rx,
            conf.servers.clone(),
            settings.clone(),
            hosts.clone(),
            alive.clone(),
        );
        let context = Context {
            commands,
            settings,
            servers: conf.servers,
            hosts,
            edns0: conf.options.use_edns0,
            counter: AtomicU64::new(0),
            alive,
        };
        (context, core)
    }

    /// Creates a context from the system configuration.
    ///
    /// Reads `/etc/resolv.conf` and `/etc/hosts`, falling back to the
    /// glibc defaults where the files are absent.
    pub fn system() -> (Context, Core) {
        Self::new(ResolvConf::system(), Hosts::system())
    }

    /// Creates a context and spawns its engine onto the current runtime.
    ///
    /// This must be called from within a tokio runtime.
    pub fn spawn(conf: ResolvConf, hosts: Hosts) -> Context {
        let (context, core) = Self::new(conf, hosts);
        tokio::spawn(core.run());
        context
    }

    /// Starts a query for a name and record type.
    ///
    /// The recursion desired bit is set; use
    /// [`query_with`][Self::query_with] for control over the header bits.
    /// The returned handle can be used to cancel the operation.
    pub fn query<N: ToName>(
        &self,
        name: &N,
        qtype: Rtype,
        handler: Arc<dyn Handler>,
    ) -> Result<Arc<Operation>, Error> {
        self.query_with(name, qtype, Bits::default(), handler)
    }

    /// Starts a query with explicit header bits.
    pub fn query_with<N: ToName>(
        &self,
        name: &N,
        qtype: Rtype,
        bits: Bits,
        handler: Arc<dyn Handler>,
    ) -> Result<Arc<Operation>, Error> {
        let qname = name.to_vec();
        let local = self.hosts.can_answer(&qname, qtype);
        self.submit(qname, qtype, bits, local, handler)
    }

    /// Starts a reverse lookup for an address.
    ///
    /// Produces a PTR query for the address's reverse name. If the host
    /// table holds a reverse record for the address the query is
    /// answered locally.
    pub fn query_reverse(
        &self,
        addr: IpAddr,
        handler: Arc<dyn Handler>,
    ) -> Result<Arc<Operation>, Error> {
        let qname = Name::<Vec<u8>>::reverse_from_addr(addr)
            .map_err(|_| Error::MessageBuild)?;
        let local = self.hosts.can_answer(&qname, Rtype::PTR);
        self.submit(qname, Rtype::PTR, Bits::default(), local, handler)
    }

    /// Builds the operation and hands it to the engine.
    fn submit(
        &self,
        qname: Name<Vec<u8>>,
        qtype: Rtype,
        bits: Bits,
        local: bool,
        handler: Arc<dyn Handler>,
    ) -> Result<Arc<Operation>, Error> {
        if !local && self.servers.is_empty() {
            return Err(Error::NoServers);
        }
        let query = Query::new(&qname, qtype, bits, self.edns0)?;
        let key = self.counter.fetch_add(1, Ordering::Relaxed);
        let op = Arc::new(Operation::new(
            key,
            query,
            handler,
            self.commands.clone(),
        ));
        self.commands
            .send(Command::Submit {
                op: op.clone(),
                local,
            })
            .map_err(|_| Error::ConnectionClosed)?;
        Ok(op)
    }
}

/// # Runtime knobs
///
/// All of these may be changed while queries are outstanding; new values
/// take effect from the next scheduler tick.
impl Context {
    /// Returns the maximum number of concurrent in-flight lookups.
    pub fn capacity(&self) -> usize {
        self.settings.capacity()
    }

    /// Sets the maximum number of concurrent in-flight lookups.
    ///
    /// A capacity of zero is treated as one.
    pub fn set_capacity(&self, capacity: usize) {
        self.settings
            .capacity
            .store(capacity.max(1), Ordering::Relaxed)
    }

    /// Returns the maximum number of datagrams sent per lookup.
    pub fn attempts(&self) -> usize {
        self.settings.attempts()
    }

    /// Sets the maximum number of datagrams sent per lookup.
    pub fn set_attempts(&self, attempts: usize) {
        self.settings.attempts.store(attempts, Ordering::Relaxed)
    }

    /// Returns the time to wait for a response after the last attempt.
    pub fn timeout(&self) -> Duration {
        self.settings.timeout()
    }

    /// Sets the time to wait for a response after the last attempt.
    pub fn set_timeout(&self, timeout: Duration) {
        self.settings
            .timeout
            .store(timeout.as_millis() as u64, Ordering::Relaxed)
    }

    /// Returns the time between retry attempts.
    pub fn interval(&self) -> Duration {
        self.settings.interval()
    }

    /// Sets the time between retry attempts.
    ///
    /// The knob is kept for configuration compatibility, but the
    /// scheduler currently paces retries by the response timeout alone:
    /// a new attempt is made when the previous one times out.
    pub fn set_interval(&self, interval: Duration) {
        self.settings
            .interval
            .store(interval.as_millis() as u64, Ordering::Relaxed)
    }

    /// Returns the socket buffer size, zero meaning the kernel default.
    pub fn buffersize(&self) -> usize {
        self.settings.buffersize()
    }

    /// Sets the send and receive buffer size of the UDP sockets.
    ///
    /// Only affects sockets opened after the call; the sockets are
    /// opened lazily on the first query that needs them.
    pub fn set_buffersize(&self, buffersize: usize) {
        self.settings
            .buffersize
            .store(buffersize, Ordering::Relaxed)
    }

    /// Returns whether nameserver rotation is enabled.
    pub fn rotate(&self) -> bool {
        self.settings.rotate()
    }

    /// Sets whether first attempts are spread across the nameservers.
    pub fn set_rotate(&self, rotate: bool) {
        self.settings.rotate.store(rotate, Ordering::Relaxed)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Relaxed);
    }
}

//============ Testing ======================================================
