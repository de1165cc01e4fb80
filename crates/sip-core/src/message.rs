//! SIP message synthesis.
//!
//! The balancer only ever originates three message shapes: the 200 OK and
//! 401 Unauthorized replies to REGISTER, and the OPTIONS probe used for
//! active node health checks. All of them are assembled as plain text lines
//! joined with CRLF.

use std::net::{IpAddr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::scan::RegisterFields;

/// Server header value advertised in replies.
pub const SERVER: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

const ALLOW: &str = "Allow: INVITE, ACK, CANCEL, OPTIONS, BYE, REFER, SUBSCRIBE, NOTIFY, INFO, PUBLISH";
const SUPPORTED: &str = "Supported: replaces, timer";

fn assemble(lines: &[String]) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(line);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out
}

/// 200 OK reply to a REGISTER, echoing the request's headers.
///
/// The Via line has any `rport` parameter rewritten to `received=<addr>` so
/// the phone learns the address its request arrived from.
pub fn register_ok(fields: &RegisterFields, call_id: &str, received: IpAddr) -> String {
    let via = fields
        .via
        .replace("rport", &format!("received={}", received));
    assemble(&[
        "SIP/2.0 200 OK".to_string(),
        via,
        fields.from.clone(),
        fields.to.clone(),
        format!("Call-ID: {}", call_id),
        fields.cseq.clone(),
        format!("Server: {}", SERVER),
        ALLOW.to_string(),
        SUPPORTED.to_string(),
        fields.contact.clone(),
        fields.content_length.clone(),
        fields.expires_line.clone(),
    ])
}

/// 401 Unauthorized reply carrying a digest challenge.
pub fn register_unauthorized(
    fields: &RegisterFields,
    call_id: &str,
    received: IpAddr,
    rport: u16,
    realm: &str,
    nonce: &str,
) -> String {
    let via = format!("{};received={};rport={}", fields.via, received, rport);
    assemble(&[
        "SIP/2.0 401 Unauthorized".to_string(),
        via,
        fields.from.clone(),
        fields.to.clone(),
        format!("Call-ID: {}", call_id),
        fields.cseq.clone(),
        format!("Server: {}", SERVER),
        ALLOW.to_string(),
        SUPPORTED.to_string(),
        format!(
            "WWW-Authenticate: Digest algorithm=MD5, realm=\"{}\", nonce=\"{}\"",
            realm, nonce
        ),
        fields.content_length.clone(),
    ])
}

/// Minimal OPTIONS request probing `remote` from `local`.
pub fn options_probe(service: &str, remote: IpAddr, local: SocketAddr, call_id: &str) -> String {
    assemble(&[
        format!("OPTIONS sip:{}@{} SIP/2.0", service, remote),
        format!("Via: SIP/2.0/UDP {}:{}", local.ip(), local.port()),
        "Max-Forwards: 70".to_string(),
        format!("To: <sip:{}@{}>", service, remote),
        format!("From: sipp <{}@{}:{}>", service, local.ip(), local.port()),
        format!("Call-ID: {}", call_id),
        "CSeq: 1 OPTIONS".to_string(),
        format!("Contact: <sip:{}@{}:{}>", service, local.ip(), local.port()),
        "Accept: application/sdp".to_string(),
        "Content-Length: 0".to_string(),
    ])
}

/// Call-ID for an outgoing probe: local endpoint plus a time-and-random
/// tail, unique enough that probe replies never collide with real calls.
pub fn generate_call_id(local: SocketAddr) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let salt: u32 = rand::thread_rng().gen_range(100_000..999_999);
    format!("{}-{}-{}", local.ip(), local.port(), millis as u64 + salt as u64)
}
