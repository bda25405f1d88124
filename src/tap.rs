//! TAP streaming sessions
//!
//! A connect request plus a live subscription (or a one-shot DUMP
//! backfill) becomes an ordered stream of tap messages. Sessions are
//! all-or-nothing: a malformed connect is rejected before streaming, and
//! any failure after that tears down the one session without touching the
//! store or other sessions.
//!
//! Partition state is re-checked per delivered event, not once at
//! subscribe time; events for partitions that are missing or not Active,
//! and mutations whose backing item is already gone, are dropped silently.

use crate::bucket::Bucket;
use crate::observer::Mutation;
use crate::protocol::{Opcode, Request, Status};
use crate::vbucket::VBState;
use crate::{Cas, Result, StoreError};
use bytes::BufMut;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;
use tracing::debug;

/// TAP_CONNECT extras flag bits
pub const TAP_CONNECT_FLAG_DUMP: u32 = 0x02;
pub const TAP_CONNECT_SUPPORT_ACK: u32 = 0x10;

/// Per-message flag bit (extras bytes [2..4]) asking the peer to ack
pub const TAP_FLAG_ACK: u16 = 0x01;

/// The fixed set of messages a session can emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TapMessage {
    Mutation {
        vbucket: u16,
        key: Vec<u8>,
        value: Vec<u8>,
        flags: u32,
        expiry: u32,
        cas: Cas,
    },
    Delete {
        vbucket: u16,
        key: Vec<u8>,
        cas: Cas,
    },
    /// Checkpoint marker, e.g. end of a backfill
    Opaque { vbucket: u16, flags: u16 },
    /// Keepalive on an otherwise idle live stream
    Noop,
}

impl TapMessage {
    pub fn opcode(&self) -> Opcode {
        match self {
            TapMessage::Mutation { .. } => Opcode::TapMutation,
            TapMessage::Delete { .. } => Opcode::TapDelete,
            TapMessage::Opaque { .. } => Opcode::TapOpaque,
            TapMessage::Noop => Opcode::Noop,
        }
    }

    pub fn requests_ack(&self) -> bool {
        match self {
            TapMessage::Opaque { flags, .. } => flags & TAP_FLAG_ACK != 0,
            _ => false,
        }
    }

    /// Frame as a wire request. Tap extras carry the engine-private length
    /// at bytes [0..2] and the tap flags word at [2..4]; mutations append
    /// the item flags and expiry.
    pub fn to_request(&self) -> Request {
        match self {
            TapMessage::Mutation {
                vbucket,
                key,
                value,
                flags,
                expiry,
                cas,
            } => {
                let mut req = Request::new(Opcode::TapMutation);
                req.vbucket = *vbucket;
                req.cas = *cas;
                let mut extras = Vec::with_capacity(16);
                extras.put_u16(0);
                extras.put_u16(0);
                extras.put_u32(0);
                extras.put_u32(*flags);
                extras.put_u32(*expiry);
                req.extras = extras;
                req.key = key.clone();
                req.body = value.clone();
                req
            }
            TapMessage::Delete { vbucket, key, cas } => {
                let mut req = Request::new(Opcode::TapDelete);
                req.vbucket = *vbucket;
                req.cas = *cas;
                let mut extras = Vec::with_capacity(8);
                extras.put_u16(0);
                extras.put_u16(0);
                extras.put_u32(0);
                req.extras = extras;
                req.key = key.clone();
                req
            }
            TapMessage::Opaque { vbucket, flags } => {
                let mut req = Request::new(Opcode::TapOpaque);
                req.vbucket = *vbucket;
                let mut extras = Vec::with_capacity(8);
                extras.put_u16(0);
                extras.put_u16(*flags);
                extras.put_u32(0);
                req.extras = extras;
                req
            }
            TapMessage::Noop => Request::new(Opcode::Noop),
        }
    }
}

/// A peer acknowledgement for an ack-requested checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapAck {
    pub status: Status,
}

#[derive(Debug, Clone)]
pub struct TapConfig {
    /// Depth of the live-event inbox registered with the observers
    pub inbox_capacity: usize,
    /// Keepalive period on a live stream
    pub noop_interval: Duration,
    /// How long to wait for an ack before failing the session
    pub ack_timeout: Duration,
}

impl Default for TapConfig {
    fn default() -> Self {
        TapConfig {
            inbox_capacity: 1024,
            noop_interval: Duration::from_secs(1),
            ack_timeout: Duration::from_secs(10),
        }
    }
}

/// Validate a TAP_CONNECT extras field. Anything but the supported flag
/// bits is a protocol violation.
pub fn parse_connect_flags(extras: &[u8]) -> Result<u32> {
    if extras.len() < 4 {
        return Err(StoreError::Protocol(
            "tap connect requires a 4-byte flags extras".to_string(),
        ));
    }
    let flags = u32::from_be_bytes(extras[..4].try_into().unwrap());
    let supported = TAP_CONNECT_FLAG_DUMP | TAP_CONNECT_SUPPORT_ACK;
    if flags & !supported != 0 {
        return Err(StoreError::Protocol(format!(
            "unsupported tap connect flags: {:#010x}",
            flags
        )));
    }
    Ok(flags)
}

/// Run one tap session to completion.
///
/// DUMP sessions backfill every Active partition in ascending key order,
/// emit an ack-requested checkpoint, optionally wait for the ack, and
/// finish. Default sessions stream live until the peer or the bucket goes
/// away.
pub fn do_tap(
    bucket: &Bucket,
    extras: &[u8],
    acks: Option<&Receiver<TapAck>>,
    sink: &Sender<TapMessage>,
    config: &TapConfig,
) -> Result<()> {
    let flags = parse_connect_flags(extras)?;
    if flags & TAP_CONNECT_FLAG_DUMP != 0 {
        dump(bucket, sink, acks, config)
    } else {
        stream_live(bucket, sink, config)
    }
}

fn transmit(sink: &Sender<TapMessage>, msg: TapMessage) -> Result<()> {
    sink.send(msg)
        .map_err(|_| StoreError::TapFatal("tap peer went away".to_string()))
}

fn dump(
    bucket: &Bucket,
    sink: &Sender<TapMessage>,
    acks: Option<&Receiver<TapAck>>,
    config: &TapConfig,
) -> Result<()> {
    for vb in bucket.vbuckets() {
        if vb.state() != VBState::Active {
            continue;
        }
        for item in vb.snapshot_items()? {
            transmit(
                sink,
                TapMessage::Mutation {
                    vbucket: vb.id(),
                    key: item.key,
                    value: item.value.unwrap_or_default(),
                    flags: item.flags,
                    expiry: item.expiry,
                    cas: item.cas,
                },
            )?;
        }
    }

    transmit(
        sink,
        TapMessage::Opaque {
            vbucket: 0,
            flags: TAP_FLAG_ACK,
        },
    )?;

    if let Some(acks) = acks {
        match acks.recv_timeout(config.ack_timeout) {
            Ok(ack) => {
                debug!(status = ?ack.status, "tap dump acked");
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => Err(StoreError::TapFatal(
                "timed out waiting for tap ack".to_string(),
            )),
            Err(RecvTimeoutError::Disconnected) => {
                Err(StoreError::TapFatal("tap ack source went away".to_string()))
            }
        }
    } else {
        Ok(())
    }
}

fn stream_live(bucket: &Bucket, sink: &Sender<TapMessage>, config: &TapConfig) -> Result<()> {
    let (tx, rx) = channel::bounded(config.inbox_capacity);
    bucket.subscribe(tx);
    let keepalive = channel::tick(config.noop_interval);

    loop {
        crossbeam::select! {
            recv(rx) -> event => match event {
                Ok(m) => {
                    if let Some(msg) = translate(bucket, &m)? {
                        transmit(sink, msg)?;
                    }
                }
                // Every observer went away: the bucket is closing
                Err(_) => return Ok(()),
            },
            recv(keepalive) -> _ => transmit(sink, TapMessage::Noop)?,
        }
    }
}

/// Turn an observer event into a wire message, or None when it must be
/// suppressed.
fn translate(bucket: &Bucket, m: &Mutation) -> Result<Option<TapMessage>> {
    let Some(vb) = bucket.vbucket(m.vbucket) else {
        return Ok(None);
    };
    if vb.state() != VBState::Active {
        return Ok(None);
    }
    if m.deleted {
        return Ok(Some(TapMessage::Delete {
            vbucket: m.vbucket,
            key: m.key.clone(),
            cas: m.cas,
        }));
    }
    // Re-fetch at delivery time; the event is a freshness hint, not a
    // snapshot. No backing item means nothing to send.
    match vb.get(&m.key)? {
        Some(item) => Ok(Some(TapMessage::Mutation {
            vbucket: m.vbucket,
            key: m.key.clone(),
            value: item.value.unwrap_or_default(),
            flags: item.flags,
            expiry: item.expiry,
            cas: item.cas,
        })),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Buf;

    #[test]
    fn test_connect_flags_require_four_bytes() {
        assert!(matches!(
            parse_connect_flags(&[]),
            Err(StoreError::Protocol(_))
        ));
        assert!(matches!(
            parse_connect_flags(&[0, 0]),
            Err(StoreError::Protocol(_))
        ));
        assert_eq!(parse_connect_flags(&[0, 0, 0, 0]).unwrap(), 0);
    }

    #[test]
    fn test_unsupported_connect_flags_rejected() {
        let takeover = 0x08u32.to_be_bytes();
        assert!(matches!(
            parse_connect_flags(&takeover),
            Err(StoreError::Protocol(_))
        ));
        let dump_ack = (TAP_CONNECT_FLAG_DUMP | TAP_CONNECT_SUPPORT_ACK).to_be_bytes();
        assert_eq!(
            parse_connect_flags(&dump_ack).unwrap(),
            TAP_CONNECT_FLAG_DUMP | TAP_CONNECT_SUPPORT_ACK
        );
    }

    #[test]
    fn test_opaque_carries_ack_bit_on_the_wire() {
        let msg = TapMessage::Opaque {
            vbucket: 0,
            flags: TAP_FLAG_ACK,
        };
        assert!(msg.requests_ack());

        let req = msg.to_request();
        let mut flags_field = &req.extras[2..4];
        assert_eq!(flags_field.get_u16() & TAP_FLAG_ACK, TAP_FLAG_ACK);
    }

    #[test]
    fn test_mutation_frames_value_and_metadata() {
        let msg = TapMessage::Mutation {
            vbucket: 5,
            key: b"k".to_vec(),
            value: b"v".to_vec(),
            flags: 9,
            expiry: 60,
            cas: 77,
        };
        assert!(!msg.requests_ack());

        let req = msg.to_request();
        assert_eq!(req.opcode, Opcode::TapMutation as u8);
        assert_eq!(req.vbucket, 5);
        assert_eq!(req.cas, 77);
        assert_eq!(req.extras.len(), 16);
        let mut tail = &req.extras[8..];
        assert_eq!(tail.get_u32(), 9);
        assert_eq!(tail.get_u32(), 60);
        assert_eq!(req.key, b"k".to_vec());
        assert_eq!(req.body, b"v".to_vec());
    }
}
