//! Substring-based SIP message scanning.
//!
//! Every routine here works on the raw datagram text: locate a fixed label,
//! take everything up to the next line break. Malformed input yields `None`
//! or an [`Error`](crate::Error), never a panic, since the dispatcher must
//! absorb garbage datagrams without interrupting its loop.

use crate::error::{Error, Result};

/// Datagrams shorter than this cannot carry a routable SIP message and are
/// discarded without further scanning.
pub const MIN_DATAGRAM_LEN: usize = 10;

/// First line of the message (request line or status line), without the
/// trailing line break.
pub fn first_line(msg: &str) -> &str {
    match msg.find('\n') {
        Some(idx) => msg[..idx].trim_end_matches('\r'),
        None => msg,
    }
}

/// Full header line starting at `label`, e.g. `header_line(msg, "Via:")`
/// yields `"Via: SIP/2.0/UDP 10.0.0.1:5060"`.
///
/// The label is searched anywhere in the message; SIP header names are
/// expected at line starts but the balancer does not enforce that.
pub fn header_line<'a>(msg: &'a str, label: &str) -> Option<&'a str> {
    let start = msg.find(label)?;
    let rest = &msg[start..];
    let end = rest.find('\n').unwrap_or(rest.len());
    Some(rest[..end].trim_end_matches('\r'))
}

/// Value of the header starting at `label`, with surrounding whitespace
/// removed.
pub fn header_value<'a>(msg: &'a str, label: &str) -> Option<&'a str> {
    let line = header_line(msg, label)?;
    Some(line[label.len()..].trim())
}

/// The Call-ID header value.
pub fn call_id(msg: &str) -> Option<&str> {
    header_value(msg, "Call-ID:").filter(|v| !v.is_empty())
}

/// Request-URI, the second token of the request line.
pub fn request_uri(msg: &str) -> Option<&str> {
    let line = first_line(msg);
    let mut parts = line.split_whitespace();
    parts.next()?;
    parts.next()
}

/// First double-quoted value following `key`, scanned within `text`.
///
/// Covers digest parameters of the form `key="value"`.
pub fn quoted_param<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    let start = text.find(key)?;
    let rest = &text[start + key.len()..];
    let open = rest.find('"')?;
    let rest = &rest[open + 1..];
    let close = rest.find('"')?;
    Some(&rest[..close])
}

/// User part of a `From:` header line.
///
/// `From: <sip:1001@192.168.110.1;transport=UDP>;tag=485af632` yields
/// `1001`. Falls back to the raw value when no angle brackets are present.
pub fn from_user(from_line: &str) -> Option<&str> {
    let inner = match (from_line.find('<'), from_line.find('>')) {
        (Some(open), Some(close)) if open + 1 < close => &from_line[open + 1..close],
        _ => from_line,
    };
    let before_at = inner.split('@').next()?;
    let user = match before_at.rfind(':') {
        Some(idx) => &before_at[idx + 1..],
        None => before_at,
    };
    if user.is_empty() {
        None
    } else {
        Some(user)
    }
}

/// Everything the REGISTER branch needs, scanned in one pass.
///
/// Header lines are kept verbatim so the reply can echo them back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterFields {
    pub request_uri: String,
    pub via: String,
    pub to: String,
    pub from: String,
    pub cseq: String,
    pub content_length: String,
    pub expires_line: String,
    pub expires: String,
    pub contact: String,
    pub user: String,
    pub nonce: Option<String>,
    pub response: Option<String>,
}

impl RegisterFields {
    pub fn scan(msg: &str) -> Result<Self> {
        let request_uri = request_uri(msg)
            .ok_or(Error::MalformedHeader("request line"))?
            .to_string();
        let via = header_line(msg, "Via:")
            .ok_or(Error::MissingHeader("Via"))?
            .to_string();
        let to = header_line(msg, "To:")
            .ok_or(Error::MissingHeader("To"))?
            .to_string();
        let from = header_line(msg, "From:")
            .ok_or(Error::MissingHeader("From"))?
            .to_string();
        let cseq = header_line(msg, "CSeq:")
            .ok_or(Error::MissingHeader("CSeq"))?
            .to_string();
        let content_length = header_line(msg, "Content-Length:")
            .ok_or(Error::MissingHeader("Content-Length"))?
            .to_string();
        let expires_line = header_line(msg, "Expires:")
            .ok_or(Error::MissingHeader("Expires"))?
            .to_string();
        let expires = expires_line["Expires:".len()..].trim().to_string();

        // Phones that omit Contact get one synthesized from the request URI.
        let contact = match header_line(msg, "Contact:") {
            Some(line) => line.to_string(),
            None => format!("Contact: <{}>", request_uri),
        };

        let user = from_user(&from)
            .ok_or(Error::MalformedHeader("From"))?
            .to_string();

        let nonce = quoted_param(msg, "nonce").map(str::to_string);
        let response = header_line(msg, "Authorization:")
            .and_then(|auth| quoted_param(auth, "response"))
            .map(str::to_string);

        Ok(Self {
            request_uri,
            via,
            to,
            from,
            cseq,
            content_length,
            expires_line,
            expires,
            contact,
            user,
            nonce,
            response,
        })
    }

    /// An `Expires: 0` REGISTER clears the binding instead of creating one.
    pub fn is_unregister(&self) -> bool {
        self.expires == "0"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTER: &str = "REGISTER sip:192.168.110.1;transport=UDP SIP/2.0\r\n\
        Via: SIP/2.0/UDP 192.168.110.6:5060;branch=z9hG4bK-d8754z;rport\r\n\
        Max-Forwards: 70\r\n\
        Contact: <sip:1001@192.168.110.6:5060;transport=UDP>\r\n\
        To: <sip:1001@192.168.110.1;transport=UDP>\r\n\
        From: <sip:1001@192.168.110.1;transport=UDP>;tag=485af632\r\n\
        Call-ID: ZDg0NWM3YjFmYmE1NmFlMw.\r\n\
        CSeq: 3 REGISTER\r\n\
        Expires: 60\r\n\
        Authorization: Digest username=\"1001\",realm=\"asterisk\",nonce=\"26f2cc46\",uri=\"sip:192.168.110.1\",response=\"a5be0271a5e1b9296396bc80448e2dfe\",algorithm=MD5\r\n\
        Content-Length: 0\r\n\r\n";

    #[test]
    fn first_line_stops_at_line_break() {
        assert_eq!(
            first_line(REGISTER),
            "REGISTER sip:192.168.110.1;transport=UDP SIP/2.0"
        );
        assert_eq!(first_line("OPTIONS sip:x SIP/2.0"), "OPTIONS sip:x SIP/2.0");
    }

    #[test]
    fn call_id_is_extracted() {
        assert_eq!(call_id(REGISTER), Some("ZDg0NWM3YjFmYmE1NmFlMw."));
        assert_eq!(call_id("INVITE sip:x SIP/2.0\r\nVia: x\r\n"), None);
    }

    #[test]
    fn header_lines_are_verbatim() {
        assert_eq!(
            header_line(REGISTER, "CSeq:"),
            Some("CSeq: 3 REGISTER")
        );
        assert_eq!(header_value(REGISTER, "Expires:"), Some("60"));
        assert_eq!(header_line(REGISTER, "Route:"), None);
    }

    #[test]
    fn quoted_params_are_extracted() {
        assert_eq!(quoted_param(REGISTER, "nonce"), Some("26f2cc46"));
        assert_eq!(
            quoted_param(REGISTER, "response"),
            Some("a5be0271a5e1b9296396bc80448e2dfe")
        );
        assert_eq!(quoted_param(REGISTER, "cnonce"), None);
    }

    #[test]
    fn user_part_of_from() {
        assert_eq!(
            from_user("From: <sip:1001@192.168.110.1;transport=UDP>;tag=1"),
            Some("1001")
        );
        assert_eq!(from_user("From: <sip:1001>"), Some("1001"));
        assert_eq!(from_user("From: <>"), None);
    }

    #[test]
    fn register_fields_scan() {
        let fields = RegisterFields::scan(REGISTER).unwrap();
        assert_eq!(fields.user, "1001");
        assert_eq!(fields.request_uri, "sip:192.168.110.1;transport=UDP");
        assert_eq!(fields.expires, "60");
        assert!(!fields.is_unregister());
        assert_eq!(fields.nonce.as_deref(), Some("26f2cc46"));
        assert_eq!(
            fields.response.as_deref(),
            Some("a5be0271a5e1b9296396bc80448e2dfe")
        );
        assert_eq!(
            fields.contact,
            "Contact: <sip:1001@192.168.110.6:5060;transport=UDP>"
        );
    }

    #[test]
    fn register_without_contact_synthesizes_one() {
        let msg = "REGISTER sip:10.0.0.1 SIP/2.0\r\n\
            Via: SIP/2.0/UDP 10.0.0.9:5060\r\n\
            To: <sip:1002@10.0.0.1>\r\n\
            From: <sip:1002@10.0.0.1>;tag=x\r\n\
            Call-ID: abc\r\n\
            CSeq: 1 REGISTER\r\n\
            Expires: 0\r\n\
            Content-Length: 0\r\n\r\n";
        let fields = RegisterFields::scan(msg).unwrap();
        assert_eq!(fields.contact, "Contact: <sip:10.0.0.1>");
        assert!(fields.is_unregister());
        assert_eq!(fields.nonce, None);
        assert_eq!(fields.response, None);
    }

    #[test]
    fn register_missing_header_is_an_error() {
        let msg = "REGISTER sip:10.0.0.1 SIP/2.0\r\nCall-ID: abc\r\n\r\n";
        assert_eq!(
            RegisterFields::scan(msg),
            Err(Error::MissingHeader("Via"))
        );
    }
}
