//! Minimal SIP message handling for the siplb balancer.
//!
//! This crate deliberately does not implement a SIP grammar. The balancer
//! only needs to recognize the request line and a handful of headers well
//! enough to route, so scanning is done with fixed-label substring search
//! to the next line break. Anything fancier belongs in a real SIP stack.

mod error;
pub mod message;
pub mod scan;

pub use error::{Error, Result};
pub use message::{register_ok, register_unauthorized, options_probe, generate_call_id};
pub use scan::{RegisterFields, MIN_DATAGRAM_LEN};
