//! Binary-protocol request dispatch
//!
//! The command boundary in front of the core: wire requests come in
//! already framed, item-level calls go out to the vbucket, and the
//! response is handed back for the transport to encode. TAP_CONNECT is the
//! one verb that does not fit the request/response shape; it runs the
//! session against a sink and reports how the connect went.

use crate::bucket::Bucket;
use crate::protocol::{Opcode, Request, Response, Status};
use crate::tap::{do_tap, TapAck, TapConfig, TapMessage};
use crate::vbucket::{VBState, VBucket};
use crate::StoreError;
use bytes::{Buf, BufMut};
use crossbeam::channel::{Receiver, Sender};
use std::sync::Arc;

pub struct ReqHandler {
    bucket: Arc<Bucket>,
}

fn response_to(req: &Request, status: Status) -> Response {
    let mut res = Response::new(req.opcode, status);
    res.opaque = req.opaque;
    res
}

impl ReqHandler {
    pub fn new(bucket: Arc<Bucket>) -> ReqHandler {
        ReqHandler { bucket }
    }

    pub fn bucket(&self) -> &Arc<Bucket> {
        &self.bucket
    }

    pub fn handle(&self, req: &Request) -> Response {
        match Opcode::from_u8(req.opcode) {
            Some(Opcode::Get) => self.do_get(req),
            Some(Opcode::Set) => self.do_set(req),
            Some(Opcode::Delete) => self.do_delete(req),
            Some(Opcode::Flush) => self.do_flush(req),
            Some(Opcode::Noop) => response_to(req, Status::Success),
            // Needs a streaming connection; the server routes it there
            Some(Opcode::TapConnect) => response_to(req, Status::Einval),
            _ => response_to(req, Status::UnknownCommand),
        }
    }

    /// Run a tap session against `sink`, blocking until it finishes.
    ///
    /// A malformed connect is an EINVAL response and the connection lives
    /// on; any later failure marks the response fatal.
    pub fn handle_tap_connect(
        &self,
        req: &Request,
        acks: Option<&Receiver<TapAck>>,
        sink: &Sender<TapMessage>,
        config: &TapConfig,
    ) -> Response {
        match do_tap(&self.bucket, &req.extras, acks, sink, config) {
            Ok(()) => response_to(req, Status::Success),
            Err(StoreError::Protocol(msg)) => {
                let mut res = response_to(req, Status::Einval);
                res.body = msg.into_bytes();
                res
            }
            Err(e) => {
                let mut res = response_to(req, Status::InternalError);
                res.body = e.to_string().into_bytes();
                res.fatal = true;
                res
            }
        }
    }

    /// Writes go to any live partition; only missing or Dead partitions
    /// are refused. Whether a mutation is streamed is the tap feed's
    /// per-event decision, not ours.
    fn vbucket_for(&self, req: &Request) -> std::result::Result<Arc<VBucket>, Response> {
        match self.bucket.vbucket(req.vbucket) {
            Some(vb) if vb.state() != VBState::Dead => Ok(vb),
            _ => Err(response_to(req, Status::NotMyVbucket)),
        }
    }

    fn do_get(&self, req: &Request) -> Response {
        let vb = match self.vbucket_for(req) {
            Ok(vb) => vb,
            Err(res) => return res,
        };
        match vb.get(&req.key) {
            Ok(Some(item)) => {
                let mut res = response_to(req, Status::Success);
                let mut extras = Vec::with_capacity(4);
                extras.put_u32(item.flags);
                res.extras = extras;
                res.cas = item.cas;
                res.body = item.value.unwrap_or_default();
                res
            }
            Ok(None) => response_to(req, Status::KeyNotFound),
            Err(e) => self.storage_error(req, e),
        }
    }

    fn do_set(&self, req: &Request) -> Response {
        if req.key.is_empty() {
            return response_to(req, Status::Einval);
        }
        let quota = self.bucket.settings().quota_bytes;
        if quota > 0 && (req.key.len() + req.body.len()) as u64 > quota {
            return response_to(req, Status::TooBig);
        }
        let vb = match self.vbucket_for(req) {
            Ok(vb) => vb,
            Err(res) => return res,
        };
        let (flags, expiry) = if req.extras.len() >= 8 {
            let mut extras = &req.extras[..8];
            (extras.get_u32(), extras.get_u32())
        } else {
            (0, 0)
        };
        match vb.set(&req.key, &req.body, flags, expiry) {
            Ok(item) => {
                let mut res = response_to(req, Status::Success);
                res.cas = item.cas;
                res
            }
            Err(e) => self.storage_error(req, e),
        }
    }

    fn do_delete(&self, req: &Request) -> Response {
        if req.key.is_empty() {
            return response_to(req, Status::Einval);
        }
        let vb = match self.vbucket_for(req) {
            Ok(vb) => vb,
            Err(res) => return res,
        };
        match vb.delete(&req.key) {
            Ok(Some(cas)) => {
                let mut res = response_to(req, Status::Success);
                res.cas = cas;
                res
            }
            Ok(None) => response_to(req, Status::KeyNotFound),
            Err(e) => self.storage_error(req, e),
        }
    }

    fn do_flush(&self, req: &Request) -> Response {
        match self.bucket.flush() {
            Ok(()) => response_to(req, Status::Success),
            Err(e) => self.storage_error(req, e),
        }
    }

    /// Storage errors are surfaced to the one caller; the engine and the
    /// connection keep running.
    fn storage_error(&self, req: &Request, e: StoreError) -> Response {
        let mut res = response_to(req, Status::InternalError);
        res.body = e.to_string().into_bytes();
        res
    }
}
