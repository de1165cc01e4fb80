//! End-to-end dispatcher behavior over loopback sockets.
//!
//! The fake node lives on 127.0.0.2 and the caller on 127.0.0.1 so the
//! dispatcher's address-based direction check sees two distinct peers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use siplb_call_engine::{
    CallRecord, CallTable, Dispatcher, NodeRegistry, RecordPublisher, Registrar, Stats, SyncError,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Default)]
struct CapturePublisher {
    published: Mutex<Vec<(String, CallRecord)>>,
}

#[async_trait]
impl RecordPublisher for CapturePublisher {
    async fn publish(&self, call_id: &str, record: &CallRecord) -> Result<(), SyncError> {
        self.published.lock().push((call_id.to_string(), *record));
        Ok(())
    }
}

struct Harness {
    dispatcher: Dispatcher,
    table: Arc<CallTable>,
    registry: Arc<NodeRegistry>,
    registrar: Arc<Registrar>,
    stats: Arc<Stats>,
    publisher: Arc<CapturePublisher>,
    caller: UdpSocket,
    caller_addr: SocketAddr,
    node: UdpSocket,
    node_addr: SocketAddr,
}

async fn harness() -> Harness {
    let node = UdpSocket::bind("127.0.0.2:0").await.unwrap();
    let node_addr = node.local_addr().unwrap();
    let caller = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let caller_addr = caller.local_addr().unwrap();

    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let table = Arc::new(CallTable::new());
    let registry = Arc::new(NodeRegistry::new(
        Duration::from_secs(3),
        Duration::from_secs(10),
    ));
    registry.add_node(node_addr.ip());
    let registrar = Arc::new(Registrar::new());
    let stats = Arc::new(Stats::new());
    let publisher = Arc::new(CapturePublisher::default());

    let dispatcher = Dispatcher::new(
        socket,
        table.clone(),
        registry.clone(),
        registrar.clone(),
        publisher.clone(),
        None,
        stats.clone(),
        "testrealm".to_string(),
        node_addr.port(),
    );

    Harness {
        dispatcher,
        table,
        registry,
        registrar,
        stats,
        publisher,
        caller,
        caller_addr,
        node,
        node_addr,
    }
}

fn invite(call_id: &str) -> String {
    format!(
        "INVITE sip:5551000@example.com SIP/2.0\r\n\
         Via: SIP/2.0/UDP 203.0.113.5:5060;branch=z9hG4bK-1\r\n\
         To: <sip:5551000@example.com>\r\n\
         From: <sip:alice@example.com>;tag=1\r\n\
         Call-ID: {}\r\n\
         CSeq: 1 INVITE\r\n\
         Content-Length: 0\r\n\r\n",
        call_id
    )
}

fn in_call(method: &str, call_id: &str) -> String {
    format!(
        "{} sip:5551000@example.com SIP/2.0\r\n\
         Via: SIP/2.0/UDP 203.0.113.5:5060;branch=z9hG4bK-2\r\n\
         Call-ID: {}\r\n\
         CSeq: 2 {}\r\n\
         Content-Length: 0\r\n\r\n",
        method, call_id, method
    )
}

fn status_ok(call_id: &str) -> String {
    format!(
        "SIP/2.0 200 OK\r\n\
         Via: SIP/2.0/UDP 203.0.113.5:5060;branch=z9hG4bK-2\r\n\
         Call-ID: {}\r\n\
         CSeq: 2 INVITE\r\n\
         Content-Length: 0\r\n\r\n",
        call_id
    )
}

fn register(user: &str, call_id: &str, expires: u32, authorization: Option<&str>) -> String {
    let auth_line = match authorization {
        Some(line) => format!("{}\r\n", line),
        None => String::new(),
    };
    format!(
        "REGISTER sip:example.com SIP/2.0\r\n\
         Via: SIP/2.0/UDP 192.168.110.6:5060;branch=z9hG4bK-3;rport\r\n\
         Contact: <sip:{user}@192.168.110.6:5060>\r\n\
         To: <sip:{user}@example.com>\r\n\
         From: <sip:{user}@example.com>;tag=reg\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 1 REGISTER\r\n\
         Expires: {expires}\r\n\
         {auth_line}Content-Length: 0\r\n\r\n",
    )
}

async fn expect_datagram(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
    let mut buf = vec![0u8; 4096];
    let (len, from) = timeout(RECV_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for datagram")
        .expect("socket error");
    buf.truncate(len);
    (buf, from)
}

#[tokio::test]
async fn invite_opens_a_call_and_forwards_to_the_node() {
    let h = harness().await;
    let msg = invite("flow-1");
    h.dispatcher
        .handle_datagram(msg.as_bytes(), h.caller_addr)
        .await;

    let record = h.table.get("flow-1").expect("call record stored");
    assert_eq!(record.src, h.caller_addr);
    assert_eq!(record.dst, h.node_addr);
    assert!(!record.bye);

    let (forwarded, _) = expect_datagram(&h.node).await;
    assert_eq!(forwarded, msg.as_bytes());

    let published = h.publisher.published.lock();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "flow-1");
    assert!(!published[0].1.bye);

    assert_eq!(h.stats.snapshot().sip_invite, 1);
}

#[tokio::test]
async fn caller_messages_follow_the_record_to_the_node() {
    let h = harness().await;
    h.dispatcher
        .handle_datagram(invite("flow-2").as_bytes(), h.caller_addr)
        .await;
    expect_datagram(&h.node).await;

    let ack = in_call("ACK", "flow-2");
    h.dispatcher
        .handle_datagram(ack.as_bytes(), h.caller_addr)
        .await;
    let (forwarded, _) = expect_datagram(&h.node).await;
    assert_eq!(forwarded, ack.as_bytes());
    assert!(h.table.get("flow-2").is_some());
}

#[tokio::test]
async fn node_replies_are_forwarded_back_to_the_caller() {
    let h = harness().await;
    h.dispatcher
        .handle_datagram(invite("flow-3").as_bytes(), h.caller_addr)
        .await;
    expect_datagram(&h.node).await;

    let ok = status_ok("flow-3");
    h.dispatcher
        .handle_datagram(ok.as_bytes(), h.node_addr)
        .await;
    let (forwarded, _) = expect_datagram(&h.caller).await;
    assert_eq!(forwarded, ok.as_bytes());
}

#[tokio::test]
async fn bye_forwards_then_evicts_and_replicates_the_eviction() {
    let h = harness().await;
    h.dispatcher
        .handle_datagram(invite("flow-4").as_bytes(), h.caller_addr)
        .await;
    expect_datagram(&h.node).await;

    let bye = in_call("BYE", "flow-4");
    h.dispatcher
        .handle_datagram(bye.as_bytes(), h.caller_addr)
        .await;

    // The terminating message is still routed.
    let (forwarded, _) = expect_datagram(&h.node).await;
    assert_eq!(forwarded, bye.as_bytes());

    assert!(h.table.get("flow-4").is_none());

    let published = h.publisher.published.lock();
    assert_eq!(published.len(), 2);
    assert_eq!(published[1].0, "flow-4");
    assert!(published[1].1.bye);

    let snapshot = h.stats.snapshot();
    assert_eq!(snapshot.sip_bye, 1);
}

#[tokio::test]
async fn unknown_call_id_is_counted_not_forwarded() {
    let h = harness().await;
    h.dispatcher
        .handle_datagram(in_call("ACK", "nowhere").as_bytes(), h.caller_addr)
        .await;

    assert_eq!(h.stats.snapshot().sip_not_found, 1);
    let mut buf = [0u8; 64];
    assert!(h.node.try_recv_from(&mut buf).is_err());
}

#[tokio::test]
async fn runt_datagrams_are_silently_discarded() {
    let h = harness().await;
    h.dispatcher.handle_datagram(b"hi", h.caller_addr).await;
    h.dispatcher.handle_datagram(&[], h.caller_addr).await;

    assert!(h.table.get("hi").is_none());
    assert_eq!(h.stats.snapshot().sip_not_found, 0);
}

#[tokio::test]
async fn invite_routes_to_cursor_node_then_advances() {
    // Three-node scenario: the INVITE goes to the first node, the cursor
    // moves to the second.
    let h = harness().await;
    let second: std::net::IpAddr = "10.0.0.2".parse().unwrap();
    let third: std::net::IpAddr = "10.0.0.3".parse().unwrap();
    h.registry.add_node(second);
    h.registry.add_node(third);

    h.dispatcher
        .handle_datagram(invite("flow-5").as_bytes(), h.caller_addr)
        .await;

    let record = h.table.get("flow-5").unwrap();
    assert_eq!(record.dst, h.node_addr);
    assert_eq!(h.registry.pick().unwrap().1, second);
}

#[tokio::test]
async fn register_with_empty_password_gets_ok() {
    let h = harness().await;
    h.registrar.add_user("1001", "");

    h.dispatcher
        .handle_datagram(register("1001", "reg-1", 60, None).as_bytes(), h.caller_addr)
        .await;
    let (reply, _) = expect_datagram(&h.caller).await;
    let reply = String::from_utf8_lossy(&reply).into_owned();

    assert!(reply.starts_with("SIP/2.0 200 OK\r\n"));
    assert!(reply.contains("Call-ID: reg-1\r\n"));
    assert!(reply.contains("Expires: 60\r\n"));
    assert!(h.registrar.is_registered("1001"));
    // REGISTER never creates call state.
    assert!(h.table.is_empty());
}

#[tokio::test]
async fn register_with_expires_zero_unregisters() {
    let h = harness().await;
    h.registrar.add_user("1001", "");
    h.dispatcher
        .handle_datagram(register("1001", "reg-2", 60, None).as_bytes(), h.caller_addr)
        .await;
    expect_datagram(&h.caller).await;
    assert!(h.registrar.is_registered("1001"));

    h.dispatcher
        .handle_datagram(register("1001", "reg-3", 0, None).as_bytes(), h.caller_addr)
        .await;
    let (reply, _) = expect_datagram(&h.caller).await;
    assert!(String::from_utf8_lossy(&reply).starts_with("SIP/2.0 200 OK\r\n"));
    assert!(!h.registrar.is_registered("1001"));
}

#[tokio::test]
async fn register_with_bad_digest_gets_challenged() {
    let h = harness().await;
    h.registrar.add_user("1002", "secret");

    let auth = "Authorization: Digest username=\"1002\",realm=\"testrealm\",\
                nonce=\"26f2cc46\",uri=\"sip:example.com\",response=\"deadbeef\",algorithm=MD5";
    h.dispatcher
        .handle_datagram(
            register("1002", "reg-4", 60, Some(auth)).as_bytes(),
            h.caller_addr,
        )
        .await;
    let (reply, _) = expect_datagram(&h.caller).await;
    let reply = String::from_utf8_lossy(&reply).into_owned();

    assert!(reply.starts_with("SIP/2.0 401 Unauthorized\r\n"));
    assert!(reply.contains("WWW-Authenticate: Digest algorithm=MD5, realm=\"testrealm\""));
    // The challenge echoes the nonce the phone used.
    assert!(reply.contains("nonce=\"26f2cc46\""));
    assert!(!h.registrar.is_registered("1002"));
}
