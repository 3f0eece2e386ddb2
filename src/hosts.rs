//! Static host table.
//!
//! This module implements [`Hosts`] representing the static host table
//! commonly stored in `/etc/hosts`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::{error, fmt, fs, io};

use domain::base::iana::{Class, Opcode, Rtype};
use domain::base::message_builder::MessageBuilder;
use domain::base::name::Name;
use domain::base::record::{Record, Ttl};
use domain::rdata::{Aaaa, Ptr, A};

use crate::query::{Answer, Query};

//------------ Hosts ---------------------------------------------------------

/// A type for the static host table.
///
/// The static host table maps host names to IP addresses. It is used to
/// either give names to addresses that do not appear in DNS or to override
/// address information from DNS: queries the table can answer never reach
/// a name server, and an upstream NXDOMAIN for a name the table knows is
/// softened into an empty answer.
///
/// You can create an empty table with [`Hosts::new`], fill one by parsing
/// a hosts file with [`parse`][Self::parse] or
/// [`parse_file`][Self::parse_file], or start with the system's table by
/// calling [`Hosts::system`]. Entries can also be added one by one with
/// [`add_forward`][Self::add_forward] and
/// [`add_reverse`][Self::add_reverse]; the forward and reverse directions
/// are independent.
///
/// The table is immutable once handed to a resolver context.
#[derive(Clone, Debug, Default)]
pub struct Hosts {
    /// Host name to address mapping.
    forward: HashMap<Name<Vec<u8>>, Vec<IpAddr>>,

    /// Reverse pointer name to host name mapping.
    ///
    /// Keyed by the `in-addr.arpa`/`ip6.arpa` name of the address so PTR
    /// questions can be answered directly from the question name.
    reverse: HashMap<Name<Vec<u8>>, Vec<Name<Vec<u8>>>>,
}

/// # Creation and Manipulation
///
impl Hosts {
    /// Creates a new, empty host table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the default host table for this system.
    ///
    /// XXX This currently only works for Unix-y systems.
    pub fn system() -> Self {
        let mut res = Hosts::new();
        let _ = res.parse_file("/etc/hosts");
        res
    }

    /// Adds a host to address mapping.
    pub fn add_forward(&mut self, name: Name<Vec<u8>>, addr: IpAddr) {
        self.forward.entry(name).or_default().push(addr)
    }

    /// Adds an address to host mapping.
    pub fn add_reverse(&mut self, addr: IpAddr, name: Name<Vec<u8>>) {
        if let Ok(rname) = Name::<Vec<u8>>::reverse_from_addr(addr) {
            self.reverse.entry(rname).or_default().push(name)
        }
    }
}

/// # Lookups
///
impl Hosts {
    /// Returns whether the table has any record for a host name.
    pub fn contains(&self, name: &Name<Vec<u8>>) -> bool {
        self.forward.contains_key(name)
    }

    /// Looks up the addresses of a host.
    pub fn lookup_host(
        &self,
        name: &Name<Vec<u8>>,
    ) -> Option<&[IpAddr]> {
        self.forward.get(name).map(Vec::as_slice)
    }

    /// Looks up the host names of an address.
    pub fn lookup_addr(&self, addr: IpAddr) -> Option<&[Name<Vec<u8>>]> {
        let rname = Name::<Vec<u8>>::reverse_from_addr(addr).ok()?;
        self.reverse.get(&rname).map(Vec::as_slice)
    }

    /// Returns whether the table can answer a question locally.
    ///
    /// Address queries are answered when the name is known at all, even
    /// if no address of the requested family is on file; the synthesized
    /// answer is then simply empty. Pointer queries are answered when the
    /// question name is the reverse name of a known address.
    pub fn can_answer(&self, qname: &Name<Vec<u8>>, qtype: Rtype) -> bool {
        match qtype {
            Rtype::A | Rtype::AAAA => self.forward.contains_key(qname),
            Rtype::PTR => self.reverse.contains_key(qname),
            _ => false,
        }
    }

    /// Produces a response message answering a query from the table.
    ///
    /// The response preserves the query id and question and carries the
    /// matching records with a zero TTL.
    pub fn synthesize(&self, query: &Query) -> Answer {
        let mut builder = MessageBuilder::new_vec();
        let header = builder.header_mut();
        header.set_id(query.id());
        header.set_qr(true);
        header.set_opcode(Opcode::QUERY);
        header.set_rd(query.message().header().rd());
        header.set_ra(true);
        let mut builder = builder.question();
        builder
            .push((query.qname(), query.qtype()))
            .expect("push should not fail");
        let mut builder = builder.answer();
        match query.qtype() {
            Rtype::A => {
                for addr in self.addrs(query.qname()) {
                    if let IpAddr::V4(addr) = addr {
                        builder
                            .push(Record::new(
                                query.qname(),
                                Class::IN,
                                Ttl::from_secs(0),
                                A::new(*addr),
                            ))
                            .expect("push should not fail");
                    }
                }
            }
            Rtype::AAAA => {
                for addr in self.addrs(query.qname()) {
                    if let IpAddr::V6(addr) = addr {
                        builder
                            .push(Record::new(
                                query.qname(),
                                Class::IN,
                                Ttl::from_secs(0),
                                Aaaa::new(*addr),
                            ))
                            .expect("push should not fail");
                    }
                }
            }
            Rtype::PTR => {
                for name in self
                    .reverse
                    .get(query.qname())
                    .map(Vec::as_slice)
                    .unwrap_or_default()
                {
                    builder
                        .push(Record::new(
                            query.qname(),
                            Class::IN,
                            Ttl::from_secs(0),
                            Ptr::new(name.clone()),
                        ))
                        .expect("push should not fail");
                }
            }
            _ => {}
        }
        builder.into_message().into()
    }

    /// Returns the addresses on file for a name, empty if unknown.
    fn addrs(&self, name: &Name<Vec<u8>>) -> &[IpAddr] {
        self.forward.get(name).map(Vec::as_slice).unwrap_or_default()
    }
}

/// # Parsing the Hosts File
///
impl Hosts {
    /// Adds the hosts listed in a file.
    pub fn parse_file<P: AsRef<Path>>(
        &mut self,
        path: P,
    ) -> Result<(), Error> {
        let mut file = fs::File::open(path).map_err(Error::io)?;
        self.parse(&mut file)
    }

    /// Reads hosts from a reader and adds them.
    ///
    /// The format is that of the `/etc/hosts` file. Lines that do not
    /// parse are skipped, which is what the platform resolvers do, too.
    pub fn parse<R: io::Read>(&mut self, reader: &mut R) -> Result<(), Error> {
        use std::io::BufRead;

        for line in io::BufReader::new(reader).lines() {
            let _ = self.parse_line(line.map_err(Error::io)?);
        }
        Ok(())
    }

    /// Parses a single line.
    fn parse_line(&mut self, line: String) -> Result<(), Error> {
        let line: &str = match line.find('#') {
            Some(pos) => line.split_at(pos).0,
            None => &line,
        };
        let line = line.trim();
        if line.is_empty() {
            return Ok(());
        }
        let mut words = line.split_whitespace();

        let addr = words.next().ok_or(Error::Parse)?;
        let addr = IpAddr::from_str(addr).map_err(|_| Error::Parse)?;

        let cname = words.next().ok_or(Error::Parse)?;
        let cname = Name::vec_from_str(cname).map_err(|_| Error::Parse)?;

        self.add_forward(cname.clone(), addr);
        self.add_reverse(addr, cname);

        for name in words {
            let name = Name::vec_from_str(name).map_err(|_| Error::Parse)?;
            self.add_forward(name, addr);
        }
        Ok(())
    }
}

//------------ Error ---------------------------------------------------------

/// An error happened while parsing a hosts file.
#[derive(Clone, Debug)]
pub enum Error {
    /// The hosts file is kaputt.
    Parse,

    /// Reading failed.
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
            Error::Parse => write!(f, "error parsing hosts file"),
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

#[cfg(test)]
mod test {
    use super::*;
    use crate::query::Bits;
    use std::io::Cursor;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn table() -> Hosts {
        let mut hosts = Hosts::new();
        let data = "# local names\n\
                    192.0.2.7 www.example.com www\n\
                    2001:db8::7 www.example.com\n\
                    192.0.2.8 other.example.com # trailing comment\n\
                    not-an-address broken.example.com\n"
            .to_string();
        hosts.parse(&mut Cursor::new(data)).unwrap();
        hosts
    }

    fn name(s: &str) -> Name<Vec<u8>> {
        Name::vec_from_str(s).unwrap()
    }

    #[test]
    fn parse_and_lookup() {
        let hosts = table();
        assert!(hosts.contains(&name("www.example.com")));
        assert!(hosts.contains(&name("www")));
        assert!(!hosts.contains(&name("broken.example.com")));
        assert_eq!(
            hosts.lookup_host(&name("www.example.com")).unwrap(),
            &[
                IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7)),
                IpAddr::V6(Ipv6Addr::from_str("2001:db8::7").unwrap()),
            ]
        );
    }

    #[test]
    fn reverse_lookup() {
        let hosts = table();
        let names = hosts
            .lookup_addr(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 8)))
            .unwrap();
        assert_eq!(names, &[name("other.example.com")]);
        assert!(hosts
            .lookup_addr(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 99)))
            .is_none());
    }

    #[test]
    fn can_answer() {
        let hosts = table();
        assert!(hosts.can_answer(&name("www.example.com"), Rtype::A));
        assert!(hosts.can_answer(&name("www.example.com"), Rtype::AAAA));
        assert!(!hosts.can_answer(&name("www.example.com"), Rtype::MX));
        assert!(!hosts.can_answer(&name("nobody.example.com"), Rtype::A));
        let rname = Name::<Vec<u8>>::reverse_from_addr(
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7)),
        )
        .unwrap();
        assert!(hosts.can_answer(&rname, Rtype::PTR));
    }

    #[test]
    fn synthesize_addresses() {
        let hosts = table();
        let query = Query::new(
            &name("www.example.com"),
            Rtype::A,
            Bits::default(),
            false,
        )
        .unwrap();
        let answer = hosts.synthesize(&query);
        assert_eq!(answer.header().id(), query.id());
        assert!(answer.header().qr());
        assert_eq!(answer.header_counts().ancount(), 1);
        let record = answer
            .answer()
            .unwrap()
            .limit_to::<A>()
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(record.data().addr(), Ipv4Addr::new(192, 0, 2, 7));
    }

    #[test]
    fn synthesize_pointer() {
        let hosts = table();
        let rname = Name::<Vec<u8>>::reverse_from_addr(
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, 8)),
        )
        .unwrap();
        let query =
            Query::new(&rname, Rtype::PTR, Bits::default(), false).unwrap();
        let answer = hosts.synthesize(&query);
        assert_eq!(answer.header_counts().ancount(), 1);
    }

    #[test]
    fn synthesize_empty_for_missing_family() {
        let hosts = table();
        let query = Query::new(
            &name("other.example.com"),
            Rtype::AAAA,
            Bits::default(),
            false,
        )
        .unwrap();
        let answer = hosts.synthesize(&query);
        assert_eq!(answer.header_counts().ancount(), 0);
        assert_eq!(answer.header_counts().qdcount(), 1);
    }
}
