//! Composed queries and their answers.
//!
//! A [`Query`] is the wire form of a question as submitted to the engine:
//! a message with a random id, the requested header bits and a single
//! question. It stays immutable for the lifetime of the lookup so that
//! every attempt, including a TCP retry after truncation, sends the very
//! same octets. An [`Answer`] wraps the response message that is handed
//! to the user.

use std::ops;

use bytes::Bytes;
use domain::base::iana::{Opcode, Rcode, Rtype};
use domain::base::message::Message;
use domain::base::message_builder::MessageBuilder;
use domain::base::name::{Name, ToName};
use domain::base::opt::OptRecord;
use octseq::Octets;

use crate::error::Error;

//------------ Bits ----------------------------------------------------------

/// Header bits to include in a query.
///
/// The default value requests recursion and leaves everything else unset,
/// which is what a stub resolver almost always wants.
#[derive(Clone, Copy, Debug)]
pub struct Bits {
    /// Set the recursion desired bit.
    pub rd: bool,

    /// Set the authentic data bit.
    pub ad: bool,

    /// Set the checking disabled bit.
    pub cd: bool,
}

impl Default for Bits {
    fn default() -> Self {
        Bits {
            rd: true,
            ad: false,
            cd: false,
        }
    }
}

//------------ Query ---------------------------------------------------------

/// A composed DNS query.
///
/// The message is built once when the lookup is submitted and carries a
/// random 16-bit id drawn from the thread RNG.
#[derive(Clone, Debug)]
pub struct Query {
    /// The complete wire-format query message.
    message: Message<Vec<u8>>,

    /// The question name, kept for cheap access.
    qname: Name<Vec<u8>>,

    /// The question type.
    qtype: Rtype,
}

impl Query {
    /// Composes a new query for the given question.
    pub(crate) fn new(
        name: &Name<Vec<u8>>,
        qtype: Rtype,
        bits: Bits,
        use_edns0: bool,
    ) -> Result<Self, Error> {
        let mut builder = MessageBuilder::new_vec();
        let header = builder.header_mut();
        header.set_id(rand::random());
        header.set_opcode(Opcode::QUERY);
        header.set_rd(bits.rd);
        header.set_ad(bits.ad);
        header.set_cd(bits.cd);
        let mut builder = builder.question();
        builder
            .push((name, qtype))
            .map_err(|_| Error::MessageBuild)?;
        let mut builder = builder.additional();
        if use_edns0 {
            let mut opt = OptRecord::<Vec<u8>>::default();
            opt.set_udp_payload_size(UDP_PAYLOAD_SIZE);
            builder
                .push(opt.as_record())
                .map_err(|_| Error::MessageBuild)?;
        }
        let message = builder.into_message();
        Ok(Query {
            message,
            qname: name.clone(),
            qtype,
        })
    }

    /// Returns the query id.
    pub fn id(&self) -> u16 {
        self.message.header().id()
    }

    /// Returns the question name.
    pub fn qname(&self) -> &Name<Vec<u8>> {
        &self.qname
    }

    /// Returns the question type.
    pub fn qtype(&self) -> Rtype {
        self.qtype
    }

    /// Returns the complete query message.
    pub fn message(&self) -> &Message<Vec<u8>> {
        &self.message
    }

    /// Returns the wire octets of the query.
    pub fn as_slice(&self) -> &[u8] {
        self.message.as_slice()
    }

    /// Checks whether a message is a valid reply to this query.
    ///
    /// The reply has to have the QR bit set and carry the query's id. The
    /// question section has to be the same as in the query, except that
    /// an entirely empty message is acceptable for truncated or error
    /// replies.
    pub fn matches<Octs: Octets + AsRef<[u8]>>(
        &self,
        reply: &Message<Octs>,
    ) -> bool {
        let reply_header = reply.header();
        let reply_hcounts = reply.header_counts();

        // First check qr and id.
        if !reply_header.qr() || reply_header.id() != self.id() {
            return false;
        }

        // If either tc is set or the result is an error, then the question
        // section can be empty. In that case we require all other sections
        // to be empty as well.
        if (reply_header.tc() || reply_header.rcode() != Rcode::NOERROR)
            && reply_hcounts.qdcount() == 0
            && reply_hcounts.ancount() == 0
            && reply_hcounts.nscount() == 0
            && reply_hcounts.arcount() == 0
        {
            // We can accept this as a valid reply.
            return true;
        }

        // Remaining checks. The question section in the reply has to be
        // the same as in the query.
        if reply_hcounts.qdcount() != self.message.header_counts().qdcount()
        {
            false
        } else {
            reply.question() == self.message.question()
        }
    }
}

/// The UDP payload size advertised when EDNS0 is enabled.
///
/// See draft-ietf-dnsop-avoid-fragmentation for discussion of the value.
const UDP_PAYLOAD_SIZE: u16 = 1232;

//------------ Answer --------------------------------------------------------

/// The answer to a query.
///
/// This type is a wrapper around the DNS [`Message`] containing the answer
/// that provides some additional information.
#[derive(Clone, Debug)]
pub struct Answer {
    /// The response message.
    message: Message<Bytes>,
}

impl Answer {
    /// Returns whether the answer is truncated.
    pub fn is_truncated(&self) -> bool {
        self.message.header().tc()
    }

    /// Returns the response code of the answer.
    pub fn rcode(&self) -> Rcode {
        self.message.header().rcode()
    }

    /// Converts the answer into the underlying message.
    pub fn into_message(self) -> Message<Bytes> {
        self.message
    }
}

impl From<Message<Bytes>> for Answer {
    fn from(message: Message<Bytes>) -> Self {
        Answer { message }
    }
}

impl From<Message<Vec<u8>>> for Answer {
    fn from(message: Message<Vec<u8>>) -> Self {
        let message = Message::from_octets(Bytes::from(
            message.into_octets(),
        ))
        .expect("Message failed to parse contents of another Message");
        Answer { message }
    }
}

impl ops::Deref for Answer {
    type Target = Message<Bytes>;

    fn deref(&self) -> &Self::Target {
        &self.message
    }
}

impl AsRef<Message<Bytes>> for Answer {
    fn as_ref(&self) -> &Message<Bytes> {
        &self.message
    }
}

//------------ Utility -------------------------------------------------------

/// Replaces an answer with an empty no-error response.
///
/// The question section and id of the original answer are preserved. This
/// is used to soften an upstream NXDOMAIN for a name the host table knows
/// about.
pub(crate) fn empty_answer(original: &Answer) -> Answer {
    let mut builder = MessageBuilder::new_vec();
    let header = builder.header_mut();
    header.set_id(original.header().id());
    header.set_qr(true);
    header.set_opcode(Opcode::QUERY);
    header.set_rd(original.header().rd());
    header.set_ra(original.header().ra());
    header.set_rcode(Rcode::NOERROR);
    let mut builder = builder.question();
    for question in original.question().flatten() {
        builder.push(question).expect("push should not fail");
    }
    builder.into_message().into()
}

/// Extracts the question name of a message, if there is one.
pub(crate) fn question_name<Octs: Octets>(
    message: &Message<Octs>,
) -> Option<Name<Vec<u8>>> {
    message
        .sole_question()
        .ok()
        .map(|question| question.qname().to_vec())
}

//============ Testing ======================================================

#[cfg(test)]
mod test {
    use super::*;
    use domain::base::message_builder::MessageBuilder;

    fn name(s: &str) -> Name<Vec<u8>> {
        Name::vec_from_str(s).unwrap()
    }

    fn query() -> Query {
        Query::new(
            &name("example.com"),
            Rtype::A,
            Bits::default(),
            false,
        )
        .unwrap()
    }

    fn reply_to(query: &Query) -> Message<Vec<u8>> {
        MessageBuilder::new_vec()
            .start_answer(query.message(), Rcode::NOERROR)
            .unwrap()
            .into_message()
    }

    #[test]
    fn compose_sets_header_bits() {
        let query = query();
        let header = query.message().header();
        assert_eq!(header.opcode(), Opcode::QUERY);
        assert!(header.rd());
        assert!(!header.qr());
        assert_eq!(query.message().header_counts().qdcount(), 1);
        assert_eq!(query.qtype(), Rtype::A);
    }

    #[test]
    fn compose_edns() {
        let query = Query::new(
            &name("example.com"),
            Rtype::A,
            Bits::default(),
            true,
        )
        .unwrap();
        assert_eq!(query.message().header_counts().arcount(), 1);
        assert!(query.message().opt().is_some());
    }

    #[test]
    fn matches_id_and_question() {
        let query = query();
        let reply = reply_to(&query);
        assert!(query.matches(&reply));

        // Wrong id.
        let mut wrong = reply_to(&query);
        wrong.header_mut().set_id(query.id().wrapping_add(1));
        assert!(!query.matches(&wrong));

        // Not a response.
        let mut wrong = reply_to(&query);
        wrong.header_mut().set_qr(false);
        assert!(!query.matches(&wrong));

        // Different question.
        let other = Query::new(
            &name("other.example.com"),
            Rtype::A,
            Bits::default(),
            false,
        )
        .unwrap();
        let mut reply = reply_to(&other);
        reply.header_mut().set_id(query.id());
        assert!(!query.matches(&reply));
    }

    #[test]
    fn matches_empty_error_reply() {
        let query = query();
        let mut builder = MessageBuilder::new_vec();
        let header = builder.header_mut();
        header.set_id(query.id());
        header.set_qr(true);
        header.set_rcode(Rcode::SERVFAIL);
        let reply = builder.into_message();
        assert!(query.matches(&reply));

        // An empty NOERROR reply on the other hand is not acceptable.
        let mut builder = MessageBuilder::new_vec();
        let header = builder.header_mut();
        header.set_id(query.id());
        header.set_qr(true);
        let reply = builder.into_message();
        assert!(!query.matches(&reply));
    }

    #[test]
    fn empty_answer_preserves_question() {
        let query = query();
        let reply = MessageBuilder::new_vec()
            .start_answer(query.message(), Rcode::NXDOMAIN)
            .unwrap();
        let answer = Answer::from(reply.into_message());
        let rewritten = empty_answer(&answer);
        assert_eq!(rewritten.rcode(), Rcode::NOERROR);
        assert_eq!(rewritten.header().id(), query.id());
        assert_eq!(rewritten.header_counts().qdcount(), 1);
        assert_eq!(rewritten.header_counts().ancount(), 0);
        assert_eq!(
            question_name(&rewritten).unwrap(),
            name("example.com")
        );
        assert!(query.matches(&rewritten));
    }
}
