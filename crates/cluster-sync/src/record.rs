use std::net::{IpAddr, SocketAddr};

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};

/// One routed call: the outside endpoint the INVITE came from, the node it
/// was handed to, and whether a BYE has been observed.
///
/// `bye` is set exactly once and never cleared; a record with `bye = true`
/// on the wire means "remove this call".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallRecord {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub bye: bool,
}

impl CallRecord {
    /// New open call from `src` towards `dst`.
    pub fn new(src: SocketAddr, dst: SocketAddr) -> Self {
        Self {
            src,
            dst,
            bye: false,
        }
    }

    /// Serialized size of this record.
    pub fn encoded_len(&self) -> usize {
        fn addr_len(addr: &SocketAddr) -> usize {
            match addr.ip() {
                IpAddr::V4(_) => 4,
                IpAddr::V6(_) => 16,
            }
        }
        // addr-len byte + address + 2-byte port, twice, + bye byte
        1 + addr_len(&self.src) + 2 + 1 + addr_len(&self.dst) + 2 + 1
    }

    /// Append the wire form to `buf`.
    pub fn write(&self, buf: &mut BytesMut) {
        fn put_endpoint(buf: &mut BytesMut, addr: &SocketAddr) {
            match addr.ip() {
                IpAddr::V4(ip) => {
                    buf.put_u8(4);
                    buf.put_slice(&ip.octets());
                }
                IpAddr::V6(ip) => {
                    buf.put_u8(16);
                    buf.put_slice(&ip.octets());
                }
            }
            buf.put_u16(addr.port());
        }
        put_endpoint(buf, &self.src);
        put_endpoint(buf, &self.dst);
        buf.put_u8(u8::from(self.bye));
    }

    /// Wire form as an owned buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write(&mut buf);
        buf.to_vec()
    }

    /// Decode a record, reconstructing each address strictly from its
    /// declared length byte. Trailing bytes are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        // Smallest possible record: two IPv4 endpoints.
        const MIN_LEN: usize = 1 + 4 + 2 + 1 + 4 + 2 + 1;
        if buf.len() < MIN_LEN {
            return Err(Error::ShortRecord(buf.len()));
        }

        let mut pos = 0;
        let src = read_endpoint(buf, &mut pos)?;
        let dst = read_endpoint(buf, &mut pos)?;
        let bye = *buf.get(pos).ok_or(Error::Truncated)? == 1;

        Ok(Self { src, dst, bye })
    }
}

fn read_endpoint(buf: &[u8], pos: &mut usize) -> Result<SocketAddr> {
    let len = *buf.get(*pos).ok_or(Error::Truncated)?;
    *pos += 1;

    let end = *pos + len as usize;
    let raw = buf.get(*pos..end).ok_or(Error::Truncated)?;
    let ip: IpAddr = match len {
        4 => <[u8; 4]>::try_from(raw).map_err(|_| Error::Truncated)?.into(),
        16 => <[u8; 16]>::try_from(raw).map_err(|_| Error::Truncated)?.into(),
        other => return Err(Error::BadAddressLength(other)),
    };
    *pos = end;

    let port_bytes = buf.get(*pos..*pos + 2).ok_or(Error::Truncated)?;
    let port = u16::from_be_bytes(
        <[u8; 2]>::try_from(port_bytes).map_err(|_| Error::Truncated)?,
    );
    *pos += 2;

    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_round_trip() {
        let record = CallRecord::new(
            "203.0.113.5:5060".parse().unwrap(),
            "10.0.0.1:5060".parse().unwrap(),
        );
        let bytes = record.encode();
        assert_eq!(bytes.len(), record.encoded_len());
        assert_eq!(bytes.len(), 15);
        assert_eq!(CallRecord::decode(&bytes).unwrap(), record);
    }

    #[test]
    fn ipv6_round_trip() {
        let mut record = CallRecord::new(
            "[2001:db8::5]:5060".parse().unwrap(),
            "[2001:db8::1]:40000".parse().unwrap(),
        );
        record.bye = true;
        let bytes = record.encode();
        assert_eq!(bytes.len(), 1 + 16 + 2 + 1 + 16 + 2 + 1);
        assert_eq!(CallRecord::decode(&bytes).unwrap(), record);
    }

    #[test]
    fn mixed_family_round_trip() {
        let record = CallRecord::new(
            "203.0.113.5:1024".parse().unwrap(),
            "[2001:db8::1]:5060".parse().unwrap(),
        );
        assert_eq!(CallRecord::decode(&record.encode()).unwrap(), record);
    }

    #[test]
    fn bye_flag_survives_the_wire() {
        let mut record = CallRecord::new(
            "203.0.113.5:5060".parse().unwrap(),
            "10.0.0.1:5060".parse().unwrap(),
        );
        record.bye = true;
        let decoded = CallRecord::decode(&record.encode()).unwrap();
        assert!(decoded.bye);
    }

    #[test]
    fn short_buffer_is_rejected() {
        let record = CallRecord::new(
            "203.0.113.5:5060".parse().unwrap(),
            "10.0.0.1:5060".parse().unwrap(),
        );
        let bytes = record.encode();
        for len in 0..bytes.len() {
            assert!(CallRecord::decode(&bytes[..len]).is_err());
        }
    }

    #[test]
    fn bad_address_length_is_rejected() {
        let mut bytes = CallRecord::new(
            "203.0.113.5:5060".parse().unwrap(),
            "10.0.0.1:5060".parse().unwrap(),
        )
        .encode();
        bytes[0] = 7;
        // Padding keeps the buffer above the minimum length so the address
        // check itself is what fails.
        bytes.extend_from_slice(&[0; 8]);
        assert!(matches!(
            CallRecord::decode(&bytes),
            Err(Error::BadAddressLength(7))
        ));
    }

    #[test]
    fn ports_are_big_endian() {
        let record = CallRecord::new(
            "1.2.3.4:258".parse().unwrap(), // 0x0102
            "5.6.7.8:5060".parse().unwrap(),
        );
        let bytes = record.encode();
        assert_eq!(&bytes[..7], &[4, 1, 2, 3, 4, 1, 2]);
    }
}
