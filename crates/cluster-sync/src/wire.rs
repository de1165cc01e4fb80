//! Batch datagram framing.
//!
//! Layout of a replication datagram:
//!
//! ```text
//! count                       1 byte, 0 = control message
//! repeated count times:
//!   call-id length            1 byte
//!   call-id bytes
//!   record length             1 byte
//!   record bytes              see CallRecord
//! ```
//!
//! A zero count is followed by the ASCII keyword `ALL`, a request for every
//! peer to dump its call table back onto the group.

use std::collections::HashMap;

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::record::CallRecord;

/// The full-sync control datagram.
pub const FULL_SYNC: [u8; 4] = [0, b'A', b'L', b'L'];

/// Batched datagrams stop growing past this point; well under any sane MTU.
pub const BATCH_SOFT_LIMIT: usize = 1000;

/// A decoded replication datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Call records to merge into the local table.
    Records(Vec<(String, CallRecord)>),
    /// A peer asked for the entire call table.
    FullSyncRequest,
}

fn check_entry(call_id: &str, record: &CallRecord) -> Result<()> {
    if call_id.is_empty() || call_id.len() > u8::MAX as usize {
        return Err(Error::Oversize(format!("call id of {} bytes", call_id.len())));
    }
    if record.encoded_len() > u8::MAX as usize {
        return Err(Error::Oversize(format!(
            "record of {} bytes",
            record.encoded_len()
        )));
    }
    Ok(())
}

fn put_entry(buf: &mut BytesMut, call_id: &str, record: &CallRecord) {
    buf.put_u8(call_id.len() as u8);
    buf.put_slice(call_id.as_bytes());
    buf.put_u8(record.encoded_len() as u8);
    record.write(buf);
}

/// Single-pair datagram for the low-latency INVITE/BYE path.
pub fn encode_single(call_id: &str, record: &CallRecord) -> Result<Vec<u8>> {
    check_entry(call_id, record)?;
    let mut buf = BytesMut::with_capacity(3 + call_id.len() + record.encoded_len());
    buf.put_u8(1);
    put_entry(&mut buf, call_id, record);
    Ok(buf.to_vec())
}

/// Decode a replication datagram into records or the full-sync flag.
pub fn decode(buf: &[u8]) -> Result<SyncEvent> {
    let count = *buf.first().ok_or(Error::Truncated)?;

    if count == 0 {
        let keyword = buf.get(1..4).ok_or(Error::Truncated)?;
        if keyword.eq_ignore_ascii_case(b"ALL") {
            return Ok(SyncEvent::FullSyncRequest);
        }
        return Err(Error::UnknownControl);
    }

    let mut records = Vec::with_capacity(count as usize);
    let mut pos = 1;
    for _ in 0..count {
        let id_len = *buf.get(pos).ok_or(Error::Truncated)? as usize;
        pos += 1;
        let id_raw = buf.get(pos..pos + id_len).ok_or(Error::Truncated)?;
        pos += id_len;

        let rec_len = *buf.get(pos).ok_or(Error::Truncated)? as usize;
        pos += 1;
        let rec_raw = buf.get(pos..pos + rec_len).ok_or(Error::Truncated)?;
        pos += rec_len;

        let call_id = String::from_utf8_lossy(id_raw).into_owned();
        records.push((call_id, CallRecord::decode(rec_raw)?));
    }

    Ok(SyncEvent::Records(records))
}

/// Staging area for a bulk reply to a full-sync request.
///
/// Entries accumulate under one key each; `drain_datagrams` then packs them
/// into as many datagrams as the soft size limit requires.
#[derive(Debug, Default)]
pub struct BatchBuffer {
    pending: HashMap<String, CallRecord>,
}

impl BatchBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage one record. Later stores for the same call id overwrite.
    pub fn store(&mut self, call_id: &str, record: CallRecord) -> Result<()> {
        check_entry(call_id, &record)?;
        self.pending.insert(call_id.to_string(), record);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Pack everything staged into wire datagrams and clear the buffer.
    pub fn drain_datagrams(&mut self) -> Vec<Vec<u8>> {
        let mut datagrams = Vec::new();
        let mut buf = BytesMut::new();
        buf.put_u8(0);
        let mut count: u8 = 0;

        for (call_id, record) in self.pending.drain() {
            put_entry(&mut buf, &call_id, &record);
            count += 1;
            if buf.len() > BATCH_SOFT_LIMIT || count == u8::MAX {
                buf[0] = count;
                datagrams.push(buf.to_vec());
                buf = BytesMut::new();
                buf.put_u8(0);
                count = 0;
            }
        }

        if count > 0 {
            buf[0] = count;
            datagrams.push(buf.to_vec());
        }
        datagrams
    }
}
