//! Item record and change-log encoding
//!
//! Every mutation is persisted as a serialized item in the changes
//! collection, keyed by the big-endian cas. The key index only ever stores
//! that cas pointer. An empty changes payload is a tombstone.

use crate::{Cas, Result, StoreError};
use bytes::{Buf, BufMut, BytesMut};

/// A single key/value record with its metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: Vec<u8>,

    /// None when the item was fetched metadata-only
    pub value: Option<Vec<u8>>,

    /// Opaque client flags
    pub flags: u32,

    /// Expiry time; 0 means no expiry
    pub expiry: u32,

    /// Version stamp, unique and strictly increasing per store
    pub cas: Cas,

    pub data_type: u8,
}

/// Fixed part of the serialized layout:
/// flags(4) expiry(4) cas(8) data_type(1) key_len(2) val_len(4)
const ITEM_HEADER_LEN: usize = 4 + 4 + 8 + 1 + 2 + 4;

impl Item {
    pub fn new(key: Vec<u8>, value: Vec<u8>, flags: u32, expiry: u32, cas: Cas) -> Self {
        Item {
            key,
            value: Some(value),
            flags,
            expiry,
            cas,
            data_type: 0,
        }
    }

    /// Serialize for the changes collection.
    ///
    /// Metadata-only items encode a zero-length value.
    pub fn encode(&self) -> Vec<u8> {
        let value = self.value.as_deref().unwrap_or(&[]);
        let mut buf = BytesMut::with_capacity(ITEM_HEADER_LEN + self.key.len() + value.len());
        buf.put_u32(self.flags);
        buf.put_u32(self.expiry);
        buf.put_u64(self.cas);
        buf.put_u8(self.data_type);
        buf.put_u16(self.key.len() as u16);
        buf.put_u32(value.len() as u32);
        buf.put_slice(&self.key);
        buf.put_slice(value);
        buf.to_vec()
    }

    /// Decode a changes-collection payload.
    ///
    /// With `with_value = false` the value bytes are skipped and `value`
    /// stays `None` (metadata-only fetch).
    pub fn decode(payload: &[u8], with_value: bool) -> Result<Item> {
        if payload.len() < ITEM_HEADER_LEN {
            return Err(StoreError::Corruption(format!(
                "item payload too short: {} bytes",
                payload.len()
            )));
        }
        let mut buf = payload;
        let flags = buf.get_u32();
        let expiry = buf.get_u32();
        let cas = buf.get_u64();
        let data_type = buf.get_u8();
        let key_len = buf.get_u16() as usize;
        let val_len = buf.get_u32() as usize;
        if buf.remaining() != key_len + val_len {
            return Err(StoreError::Corruption(format!(
                "item payload length mismatch: {} remaining, {} expected",
                buf.remaining(),
                key_len + val_len
            )));
        }
        let key = buf[..key_len].to_vec();
        buf.advance(key_len);
        let value = if with_value {
            Some(buf[..val_len].to_vec())
        } else {
            None
        };
        Ok(Item {
            key,
            value,
            flags,
            expiry,
            cas,
            data_type,
        })
    }
}

/// Big-endian cas encoding, the changes-collection key. Sorts in mutation
/// order.
pub fn cas_bytes(cas: Cas) -> [u8; 8] {
    cas.to_be_bytes()
}

pub fn cas_from_bytes(bytes: &[u8]) -> Result<Cas> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Corruption(format!("bad cas key length: {}", bytes.len())))?;
    Ok(Cas::from_be_bytes(arr))
}
