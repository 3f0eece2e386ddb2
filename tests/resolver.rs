//! End-to-end tests of the resolver engine against mock nameservers.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use domain::base::iana::{Class, Rcode, Rtype};
use domain::base::message::Message;
use domain::base::message_builder::MessageBuilder;
use domain::base::name::{Name, ToName};
use domain::base::record::Ttl;
use domain::rdata::{Ptr, A};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::{sleep, timeout, Instant};

use stub_resolv::conf::ResolvConf;
use stub_resolv::hosts::Hosts;
use stub_resolv::{Answer, Context, Handler, Operation};

//------------ Recorder ------------------------------------------------------

/// The reports a handler can receive.
#[derive(Debug)]
enum Report {
    Resolved(Answer),
    Failure(Rcode),
    Timeout,
    Cancelled,
}

/// A handler that records every report it receives.
#[derive(Debug, Default)]
struct Recorder {
    reports: Mutex<Vec<Report>>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Default::default()
    }

    fn len(&self) -> usize {
        self.reports.lock().unwrap().len()
    }

    /// Waits until at least `count` reports arrived.
    async fn wait(&self, count: usize) {
        for _ in 0..1000 {
            if self.len() >= count {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {} reports, have {:?}",
            count,
            self.reports.lock().unwrap()
        );
    }
}

impl Handler for Recorder {
    fn on_resolved(&self, _op: &Operation, answer: Answer) {
        self.reports.lock().unwrap().push(Report::Resolved(answer));
    }

    fn on_failure(&self, _op: &Operation, rcode: Rcode) {
        self.reports.lock().unwrap().push(Report::Failure(rcode));
    }

    fn on_timeout(&self, _op: &Operation) {
        self.reports.lock().unwrap().push(Report::Timeout);
    }

    fn on_cancelled(&self, _op: &Operation) {
        self.reports.lock().unwrap().push(Report::Cancelled);
    }
}

//------------ Mock nameservers ----------------------------------------------

/// Starts a UDP nameserver that answers via the given closure.
///
/// Returns its address and a counter of received queries.
async fn udp_server<F>(reply: F) -> (SocketAddr, Arc<AtomicUsize>)
where
    F: Fn(&Message<Vec<u8>>) -> Option<Vec<u8>> + Send + 'static,
{
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2000];
        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let Ok(query) = Message::from_octets(buf[..len].to_vec())
            else {
                continue;
            };
            if let Some(response) = reply(&query) {
                let _ = socket.send_to(&response, from).await;
            }
        }
    });
    (addr, received)
}

/// Builds a response with a single A record for the query's question.
fn a_response(query: &Message<Vec<u8>>) -> Vec<u8> {
    let qname = query.sole_question().unwrap().qname().to_vec();
    let mut builder = MessageBuilder::new_vec()
        .start_answer(query, Rcode::NOERROR)
        .unwrap();
    builder
        .push((
            qname,
            Class::IN,
            Ttl::from_secs(60),
            A::new(Ipv4Addr::new(192, 0, 2, 99)),
        ))
        .unwrap();
    builder.into_message().into_octets()
}

/// Builds an answerless response with the given response code.
fn status_response(query: &Message<Vec<u8>>, rcode: Rcode) -> Vec<u8> {
    MessageBuilder::new_vec()
        .start_answer(query, rcode)
        .unwrap()
        .into_message()
        .into_octets()
}

/// Builds an empty response with the truncation bit set.
fn truncated_response(query: &Message<Vec<u8>>) -> Vec<u8> {
    let mut builder = MessageBuilder::new_vec()
        .start_answer(query, Rcode::NOERROR)
        .unwrap();
    builder.header_mut().set_tc(true);
    builder.into_message().into_octets()
}

/// Starts a server that truncates over UDP and answers fully over TCP.
async fn truncating_server() -> (SocketAddr, Arc<AtomicUsize>) {
    // The TCP listener has to share the address of the UDP socket since
    // the truncated reply sends the client there.
    let (tcp, udp) = loop {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        match UdpSocket::bind(tcp.local_addr().unwrap()).await {
            Ok(udp) => break (tcp, udp),
            Err(_) => continue,
        }
    };
    let addr = tcp.local_addr().unwrap();
    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 2000];
        loop {
            let Ok((len, from)) = udp.recv_from(&mut buf).await else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let Ok(query) = Message::from_octets(buf[..len].to_vec())
            else {
                continue;
            };
            let _ = udp.send_to(&truncated_response(&query), from).await;
        }
    });
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = tcp.accept().await else { break };
            tokio::spawn(async move {
                let len = stream.read_u16().await.unwrap() as usize;
                let mut buf = vec![0u8; len];
                stream.read_exact(&mut buf).await.unwrap();
                let query = Message::from_octets(buf).unwrap();
                let response = a_response(&query);
                let mut framed =
                    (response.len() as u16).to_be_bytes().to_vec();
                framed.extend_from_slice(&response);
                stream.write_all(&framed).await.unwrap();
            });
        }
    });
    (addr, received)
}

//------------ Helpers -------------------------------------------------------

fn conf_for(server: SocketAddr) -> ResolvConf {
    let mut conf = ResolvConf::new();
    conf.servers.push(server);
    conf
}

fn name(s: &str) -> Name<Vec<u8>> {
    Name::vec_from_str(s).unwrap()
}

fn local_hosts() -> Hosts {
    let mut hosts = Hosts::new();
    let data = "192.0.2.7 foo.local\n".to_string();
    hosts.parse(&mut std::io::Cursor::new(data)).unwrap();
    hosts
}

//------------ Tests ---------------------------------------------------------

#[tokio::test]
async fn resolves_over_udp() {
    let (server, _) = udp_server(|query| Some(a_response(query))).await;
    let context = Context::spawn(conf_for(server), Hosts::new());
    let recorder = Recorder::new();

    context
        .query(&name("example.com"), Rtype::A, recorder.clone())
        .unwrap();
    recorder.wait(1).await;

    let reports = recorder.reports.lock().unwrap();
    match &reports[..] {
        [Report::Resolved(answer)] => {
            assert_eq!(answer.header_counts().ancount(), 1);
            assert_eq!(answer.rcode(), Rcode::NOERROR);
        }
        other => panic!("unexpected reports: {:?}", other),
    }
}

#[tokio::test]
async fn error_rcode_reports_failure() {
    let (server, _) =
        udp_server(|query| Some(status_response(query, Rcode::SERVFAIL)))
            .await;
    let context = Context::spawn(conf_for(server), Hosts::new());
    let recorder = Recorder::new();

    context
        .query(&name("example.com"), Rtype::A, recorder.clone())
        .unwrap();
    recorder.wait(1).await;

    let reports = recorder.reports.lock().unwrap();
    assert!(matches!(
        &reports[..],
        [Report::Failure(rcode)] if *rcode == Rcode::SERVFAIL
    ));
}

#[tokio::test(start_paused = true)]
async fn timeout_after_all_attempts() {
    // A server that never answers.
    let (server, _) = udp_server(|_| None).await;
    let context = Context::spawn(conf_for(server), Hosts::new());
    context.set_attempts(2);
    context.set_timeout(Duration::from_secs(1));
    let recorder = Recorder::new();
    let start = Instant::now();

    context
        .query(&name("example.com"), Rtype::A, recorder.clone())
        .unwrap();
    recorder.wait(1).await;

    // Attempt one at zero seconds, attempt two after the first window
    // expires, the timeout report after the second.
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(1990), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(2500), "{:?}", elapsed);
    let reports = recorder.reports.lock().unwrap();
    assert!(matches!(&reports[..], [Report::Timeout]));
}

#[tokio::test]
async fn each_attempt_sends_a_datagram() {
    let (server, received) = udp_server(|_| None).await;
    let context = Context::spawn(conf_for(server), Hosts::new());
    context.set_attempts(2);
    context.set_timeout(Duration::from_millis(150));
    let recorder = Recorder::new();

    context
        .query(&name("example.com"), Rtype::A, recorder.clone())
        .unwrap();
    recorder.wait(1).await;

    assert_eq!(received.load(Ordering::SeqCst), 2);
    let reports = recorder.reports.lock().unwrap();
    assert!(matches!(&reports[..], [Report::Timeout]));
}

#[tokio::test]
async fn truncation_promotes_to_tcp() {
    let (server, received) = truncating_server().await;
    let context = Context::spawn(conf_for(server), Hosts::new());
    let recorder = Recorder::new();

    context
        .query(&name("example.com"), Rtype::A, recorder.clone())
        .unwrap();
    recorder.wait(1).await;

    // The truncated reply arrived on the first attempt; the full answer
    // came over TCP without any further datagram.
    assert_eq!(received.load(Ordering::SeqCst), 1);
    let reports = recorder.reports.lock().unwrap();
    match &reports[..] {
        [Report::Resolved(answer)] => {
            assert!(!answer.is_truncated());
            assert_eq!(answer.header_counts().ancount(), 1);
        }
        other => panic!("unexpected reports: {:?}", other),
    }
}

#[tokio::test]
async fn nxdomain_softened_for_local_names() {
    let (server, _) =
        udp_server(|query| Some(status_response(query, Rcode::NXDOMAIN)))
            .await;
    let context = Context::spawn(conf_for(server), local_hosts());
    let recorder = Recorder::new();

    // An MX query is never answered from the host table, so it travels
    // upstream; the NXDOMAIN for the locally known name comes back
    // softened into an empty answer.
    context
        .query(&name("foo.local"), Rtype::MX, recorder.clone())
        .unwrap();
    recorder.wait(1).await;

    let reports = recorder.reports.lock().unwrap();
    match &reports[..] {
        [Report::Resolved(answer)] => {
            assert_eq!(answer.rcode(), Rcode::NOERROR);
            assert_eq!(answer.header_counts().ancount(), 0);
            assert_eq!(
                answer.sole_question().unwrap().qname().to_vec(),
                name("foo.local")
            );
        }
        other => panic!("unexpected reports: {:?}", other),
    }
}

#[tokio::test]
async fn nxdomain_passes_for_unknown_names() {
    let (server, _) =
        udp_server(|query| Some(status_response(query, Rcode::NXDOMAIN)))
            .await;
    let context = Context::spawn(conf_for(server), local_hosts());
    let recorder = Recorder::new();

    context
        .query(&name("bar.local"), Rtype::MX, recorder.clone())
        .unwrap();
    recorder.wait(1).await;

    let reports = recorder.reports.lock().unwrap();
    assert!(matches!(
        &reports[..],
        [Report::Failure(rcode)] if *rcode == Rcode::NXDOMAIN
    ));
}

#[tokio::test]
async fn capacity_bounds_inflight_lookups() {
    let socket =
        Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let addr = socket.local_addr().unwrap();
    let before_first_reply = Arc::new(AtomicUsize::new(0));
    let first_reply_sent = Arc::new(AtomicBool::new(false));

    {
        let socket = socket.clone();
        let before_first_reply = before_first_reply.clone();
        let first_reply_sent = first_reply_sent.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2000];
            loop {
                let Ok((len, from)) = socket.recv_from(&mut buf).await
                else {
                    break;
                };
                if !first_reply_sent.load(Ordering::SeqCst) {
                    before_first_reply.fetch_add(1, Ordering::SeqCst);
                }
                let Ok(query) =
                    Message::from_octets(buf[..len].to_vec())
                else {
                    continue;
                };
                let socket = socket.clone();
                let first_reply_sent = first_reply_sent.clone();
                tokio::spawn(async move {
                    sleep(Duration::from_millis(100)).await;
                    first_reply_sent.store(true, Ordering::SeqCst);
                    let _ = socket
                        .send_to(&a_response(&query), from)
                        .await;
                });
            }
        });
    }

    let context = Context::spawn(conf_for(addr), Hosts::new());
    context.set_capacity(2);
    context.set_attempts(1);
    context.set_timeout(Duration::from_secs(10));
    let recorder = Recorder::new();

    for _ in 0..5 {
        context
            .query(&name("example.com"), Rtype::A, recorder.clone())
            .unwrap();
    }
    recorder.wait(5).await;

    // With two in-flight slots, only two queries can have been sent
    // before the first answer freed a slot.
    assert!(before_first_reply.load(Ordering::SeqCst) <= 2);
    let reports = recorder.reports.lock().unwrap();
    assert_eq!(reports.len(), 5);
    assert!(reports
        .iter()
        .all(|report| matches!(report, Report::Resolved(_))));
}

#[tokio::test]
async fn cancel_reports_synchronously_and_only_once() {
    let (server, _) = udp_server(|_| None).await;
    let context = Context::spawn(conf_for(server), Hosts::new());
    context.set_attempts(1);
    context.set_timeout(Duration::from_millis(200));
    let recorder = Recorder::new();

    let op = context
        .query(&name("example.com"), Rtype::A, recorder.clone())
        .unwrap();
    // Let the first attempt go out.
    sleep(Duration::from_millis(50)).await;
    op.cancel();
    assert_eq!(recorder.len(), 1);

    // Well past the timeout, nothing else may have been reported and a
    // second cancel does nothing.
    sleep(Duration::from_millis(400)).await;
    op.cancel();
    let reports = recorder.reports.lock().unwrap();
    assert!(matches!(&reports[..], [Report::Cancelled]));
}

#[tokio::test]
async fn local_names_resolve_from_the_host_table() {
    // No server: everything has to come from the table.
    let context = Context::spawn(conf_for(bad_server()), local_hosts());
    let recorder = Recorder::new();

    context
        .query(&name("foo.local"), Rtype::A, recorder.clone())
        .unwrap();
    recorder.wait(1).await;

    let reports = recorder.reports.lock().unwrap();
    match &reports[..] {
        [Report::Resolved(answer)] => {
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
        other => panic!("unexpected reports: {:?}", other),
    }
}

#[tokio::test]
async fn reverse_lookups_resolve_from_the_host_table() {
    let context = Context::spawn(conf_for(bad_server()), local_hosts());
    let recorder = Recorder::new();

    context
        .query_reverse(
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7)),
            recorder.clone(),
        )
        .unwrap();
    recorder.wait(1).await;

    let reports = recorder.reports.lock().unwrap();
    match &reports[..] {
        [Report::Resolved(answer)] => {
            assert_eq!(answer.header_counts().ancount(), 1);
            let record = answer
                .answer()
                .unwrap()
                .limit_to::<Ptr<_>>()
                .next()
                .unwrap()
                .unwrap();
            assert_eq!(record.data().ptrdname().to_vec(), name("foo.local"));
        }
        other => panic!("unexpected reports: {:?}", other),
    }
}

#[tokio::test]
async fn engine_stops_when_context_drops() {
    let (server, _) = udp_server(|_| None).await;
    let (context, core) = Context::new(conf_for(server), Hosts::new());
    let engine = tokio::spawn(core.run());
    drop(context);
    timeout(Duration::from_secs(1), engine)
        .await
        .expect("engine kept running")
        .unwrap();
}

/// An address queries are never expected to reach.
fn bad_server() -> SocketAddr {
    SocketAddr::from(([192, 0, 2, 1], 53))
}
