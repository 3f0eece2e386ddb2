//! Resolver configuration.
//!
//! This module contains [`ResolvConf`], the global configuration of a
//! resolver context: the name servers to forward queries to and a set of
//! options governing retry behaviour. The type can parse a glibc-style
//! configuration file, commonly known as `/etc/resolv.conf`, and is
//! modeled along the lines of glibc's resolver.

use std::default::Default;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::str::{self, FromStr, SplitWhitespace};
use std::sync::Arc;
use std::time::Duration;
use std::{error, fmt, fs, io, ops};

use domain::base::name::Name;

//------------ ResolvOptions -------------------------------------------------

/// Options for the resolver configuration.
///
/// This type collects the server-independent options that influence how
/// queries are scheduled. All of them can be set through the `options`
/// line of a configuration file.
#[derive(Clone, Debug)]
pub struct ResolvOptions {
    /// Search list for host-name lookup.
    ///
    /// The list is parsed and exposed for the benefit of lookup layers
    /// built on top of the core; the core itself queries names verbatim.
    pub search: SearchList,

    /// Number of dots before an initial absolute query is made.
    pub ndots: usize,

    /// Timeout to wait for a response after the last attempt.
    pub timeout: Duration,

    /// Number of datagrams to send before giving up.
    pub attempts: usize,

    /// Use round-robin selection of name servers.
    pub rotate: bool,

    /// Advertise EDNS0 support in outgoing queries.
    pub use_edns0: bool,
}

impl Default for ResolvOptions {
    fn default() -> Self {
        ResolvOptions {
            search: SearchList::new(),
            ndots: 1,
            timeout: Duration::from_secs(5),
            attempts: 2,
            rotate: false,
            use_edns0: false,
        }
    }
}

//------------ ResolvConf ----------------------------------------------------

/// Resolver configuration.
///
/// This type collects all information necessary to configure how a stub
/// resolver talks to its upstream servers.
///
/// The type follows the builder pattern. After creating a value with
/// [`ResolvConf::new`] you can manipulate the members. Once you are happy
/// with them, you call [`finalize`][Self::finalize] to make sure the
/// configuration is valid. It mostly just fixes the `servers`.
///
/// Additionally, the type can parse a glibc-style configuration file
/// through the [`parse`][Self::parse] and [`parse_file`][Self::parse_file]
/// methods. You still need to call `finalize` after parsing.
///
/// The easiest way to get the system configuration is through
/// [`ResolvConf::system`]. This parses `/etc/resolv.conf` or returns a
/// default configuration if that fails.
#[derive(Clone, Debug)]
pub struct ResolvConf {
    /// Addresses of servers to query.
    pub servers: Vec<SocketAddr>,

    /// Default options.
    pub options: ResolvOptions,
}

/// # Management
///
impl ResolvConf {
    /// Creates a new, empty configuration.
    ///
    /// Using an empty configuration will fail since it does not contain
    /// any name servers. Call [`finalize`][Self::finalize] to make it
    /// usable.
    pub fn new() -> Self {
        ResolvConf {
            servers: Vec::new(),
            options: ResolvOptions::default(),
        }
    }

    /// Finalizes the configuration for actual use.
    ///
    /// If `servers` is empty, the function adds `127.0.0.1:53`. This is
    /// exactly what glibc does.
    pub fn finalize(&mut self) {
        if self.servers.is_empty() {
            self.servers.push(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
                53,
            ));
        }
    }

    /// Creates the default configuration for this system.
    ///
    /// XXX This currently only works for Unix-y systems.
    pub fn system() -> Self {
        let mut res = ResolvConf::new();
        let _ = res.parse_file("/etc/resolv.conf");
        res.finalize();
        res
    }
}

/// # Parsing the Configuration File
///
impl ResolvConf {
    /// Parses the configuration from a file.
    pub fn parse_file<P: AsRef<Path>>(
        &mut self,
        path: P,
    ) -> Result<(), Error> {
        let mut file = fs::File::open(path).map_err(Error::io)?;
        self.parse(&mut file)
    }

    /// Parses the configuration from a reader.
    ///
    /// The format is that of the `/etc/resolv.conf` file. Unrecognised
    /// keywords and options are ignored.
    pub fn parse<R: io::Read>(&mut self, reader: &mut R) -> Result<(), Error> {
        self.parse_internal(reader, false)
    }

    /// Parses the configuration from a reader, rejecting unknown content.
    ///
    /// Like [`parse`][Self::parse] but any keyword or option that is not
    /// recognised becomes a parse error.
    pub fn parse_strict<R: io::Read>(
        &mut self,
        reader: &mut R,
    ) -> Result<(), Error> {
        self.parse_internal(reader, true)
    }

    /// Parses the configuration, optionally rejecting unknown content.
    fn parse_internal<R: io::Read>(
        &mut self,
        reader: &mut R,
        strict: bool,
    ) -> Result<(), Error> {
        use std::io::BufRead;

        for line in io::BufReader::new(reader).lines() {
            let line = line.map_err(Error::io)?;
            let line = line.trim_end();

            if line.is_empty()
                || line.starts_with(';')
                || line.starts_with('#')
            {
                continue;
            }

            let mut words = line.split_whitespace();
            match words.next() {
                Some("nameserver") => self.parse_nameserver(words)?,
                Some("domain") => self.parse_domain(words)?,
                Some("search") => self.parse_search(words)?,
                Some("sortlist") => {}
                Some("options") => self.parse_options(words, strict)?,
                _ if strict => return Err(Error::Parse),
                _ => {}
            }
        }
        Ok(())
    }

    /// Parses a `nameserver` line.
    fn parse_nameserver(
        &mut self,
        mut words: SplitWhitespace,
    ) -> Result<(), Error> {
        let addr = IpAddr::from_str(next_word(&mut words)?)
            .map_err(|_| Error::Parse)?;
        self.servers.push(SocketAddr::new(addr, 53));
        no_more_words(words)
    }

    /// Parses a `domain` line.
    fn parse_domain(
        &mut self,
        mut words: SplitWhitespace,
    ) -> Result<(), Error> {
        let domain = Name::vec_from_str(next_word(&mut words)?)
            .map_err(|_| Error::Parse)?;
        self.options.search = domain.into();
        no_more_words(words)
    }

    /// Parses a `search` line.
    fn parse_search(
        &mut self,
        words: SplitWhitespace,
    ) -> Result<(), Error> {
        let mut search = SearchList::new();
        for word in words {
            let name =
                Name::vec_from_str(word).map_err(|_| Error::Parse)?;
            search.push(name)
        }
        self.options.search = search;
        Ok(())
    }

    /// Parses an `options` line.
    fn parse_options(
        &mut self,
        words: SplitWhitespace,
        strict: bool,
    ) -> Result<(), Error> {
        for word in words {
            match split_arg(word)? {
                ("ndots", Some(n)) => self.options.ndots = n,
                ("timeout", Some(n)) => {
                    self.options.timeout = Duration::from_secs(n as u64)
                }
                ("attempts", Some(n)) => self.options.attempts = n,
                ("rotate", None) => self.options.rotate = true,
                ("edns0", None) => self.options.use_edns0 = true,
                _ if strict => return Err(Error::Parse),
                // Ignore unknown or misformated options.
                _ => {}
            }
        }
        Ok(())
    }
}

//--- Default

impl Default for ResolvConf {
    fn default() -> Self {
        Self::new()
    }
}

//--- Display

impl fmt::Display for ResolvConf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for server in &self.servers {
            f.write_str("nameserver ")?;
            if server.port() == 53 {
                server.ip().fmt(f)?;
            } else {
                server.fmt(f)?;
            }
            writeln!(f)?;
        }
        if self.options.search.len() == 1 {
            writeln!(f, "domain {}", self.options.search[0])?;
        } else if self.options.search.len() > 1 {
            f.write_str("search")?;
            for name in self.options.search.as_slice() {
                write!(f, " {}", name)?;
            }
            writeln!(f)?;
        }

        // Collect options so we only print the line if there are any
        // non-default ones.
        let mut options = Vec::new();

        if self.options.ndots != 1 {
            options.push(format!("ndots:{}", self.options.ndots));
        }
        if self.options.timeout != Duration::from_secs(5) {
            // XXX This ignores fractional seconds.
            options
                .push(format!("timeout:{}", self.options.timeout.as_secs()));
        }
        if self.options.attempts != 2 {
            options.push(format!("attempts:{}", self.options.attempts));
        }
        if self.options.rotate {
            options.push("rotate".into())
        }
        if self.options.use_edns0 {
            options.push("edns0".into())
        }

        if !options.is_empty() {
            f.write_str("options")?;
            for option in options {
                write!(f, " {}", option)?;
            }
            writeln!(f)?;
        }

        Ok(())
    }
}

//------------ SearchList ----------------------------------------------------

/// A list of domain suffixes for relative name lookup.
#[derive(Clone, Debug, Default)]
pub struct SearchList {
    search: Vec<Name<Vec<u8>>>,
}

impl SearchList {
    /// Creates a new, empty search list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a name to the list.
    pub fn push(&mut self, name: Name<Vec<u8>>) {
        self.search.push(name)
    }

    /// Returns the name at the given position, if present.
    pub fn get(&self, pos: usize) -> Option<&Name<Vec<u8>>> {
        self.search.get(pos)
    }

    /// Returns the list as a slice of names.
    pub fn as_slice(&self) -> &[Name<Vec<u8>>] {
        self.as_ref()
    }
}

impl From<Name<Vec<u8>>> for SearchList {
    fn from(name: Name<Vec<u8>>) -> Self {
        let mut res = Self::new();
        res.push(name);
        res
    }
}

//--- AsRef and Deref

impl AsRef<[Name<Vec<u8>>]> for SearchList {
    fn as_ref(&self) -> &[Name<Vec<u8>>] {
        self.search.as_ref()
    }
}

impl ops::Deref for SearchList {
    type Target = [Name<Vec<u8>>];

    fn deref(&self) -> &Self::Target {
        self.as_ref()
    }
}

//------------ Private Helpers -----------------------------------------------
//
// These are here to wrap stuff into Results.

/// Returns a reference to the next word or an error.
fn next_word<'a>(
    words: &'a mut str::SplitWhitespace,
) -> Result<&'a str, Error> {
    match words.next() {
        Some(word) => Ok(word),
        None => Err(Error::Parse),
    }
}

/// Returns nothing but errors out if there are words left.
fn no_more_words(mut words: str::SplitWhitespace) -> Result<(), Error> {
    match words.next() {
        Some(..) => Err(Error::Parse),
        None => Ok(()),
    }
}

/// Splits the name and argument from an option with arguments.
///
/// These options consist of a name followed by a colon followed by a
/// value, which so far is only `usize`, so we do that.
fn split_arg(s: &str) -> Result<(&str, Option<usize>), Error> {
    match s.find(':') {
        Some(idx) => {
            let (left, right) = s.split_at(idx);
            let value =
                usize::from_str(&right[1..]).map_err(|_| Error::Parse)?;
            Ok((left, Some(value)))
        }
        None => Ok((s, None)),
    }
}

//------------ Error ---------------------------------------------------------

/// An error happened while parsing a configuration file.
#[derive(Clone, Debug)]
pub enum Error {
    /// The file is not a proper configuration file.
    Parse,

    /// Something happened while reading.
    Io(Arc<io::Error>),
}

impl Error {
    /// Wraps an IO error.
    fn io(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Parse => write!(f, "error parsing configuration"),
            Error::Io(err) => err.fmt(f),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Parse => None,
            Error::Io(err) => Some(err),
        }
    }
}

//============ Testing ======================================================
