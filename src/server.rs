//! Data-protocol TCP server
//!
//! Accepts connections and runs the framed request loop against the
//! default bucket. TAP_CONNECT takes the connection over: the blocking
//! session streams messages into a channel, a bridge thread frames them,
//! and this side's write half carries them out while peer acks flow back
//! through the read half.

use crate::bucket::Buckets;
use crate::dispatch::ReqHandler;
use crate::protocol::{
    read_request, read_response, write_request, write_response, Opcode, Request, Response, Status,
};
use crate::tap::{parse_connect_flags, TapAck, TapConfig, TapMessage};
use crate::{Result, StoreError};
use crossbeam::channel;
use std::sync::Arc;
use std::thread;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

pub struct Server {
    addr: String,
    buckets: Arc<Buckets>,
    default_bucket: String,
    tap_config: TapConfig,
}

impl Server {
    pub fn new(
        addr: impl Into<String>,
        buckets: Arc<Buckets>,
        default_bucket: impl Into<String>,
        tap_config: TapConfig,
    ) -> Server {
        Server {
            addr: addr.into(),
            buckets,
            default_bucket: default_bucket.into(),
            tap_config,
        }
    }

    /// Accept and serve connections indefinitely.
    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        info!(addr = %self.addr, "data protocol listening");

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let Some(bucket) = self.buckets.get(&self.default_bucket) else {
                        warn!(peer = %peer, "no default bucket; dropping connection");
                        continue;
                    };
                    let handler = ReqHandler::new(bucket);
                    let tap_config = self.tap_config.clone();
                    tokio::spawn(async move {
                        match handle_conn(stream, handler, tap_config).await {
                            Ok(()) => info!(peer = %peer, "connection closed"),
                            Err(e) => warn!(peer = %peer, error = %e, "connection failed"),
                        }
                    });
                }
                Err(e) => error!(error = %e, "accept failed"),
            }
        }
    }
}

async fn handle_conn(stream: TcpStream, handler: ReqHandler, tap_config: TapConfig) -> Result<()> {
    let (mut rd, mut wr) = stream.into_split();

    while let Some(req) = read_request(&mut rd).await? {
        if req.opcode == Opcode::TapConnect as u8 {
            // Reject malformed connects without giving up the connection
            if let Err(e) = parse_connect_flags(&req.extras) {
                let mut res = Response::new(req.opcode, Status::Einval);
                res.opaque = req.opaque;
                res.body = e.to_string().into_bytes();
                write_response(&mut wr, &res).await?;
                continue;
            }
            return run_tap(rd, wr, handler, req, tap_config).await;
        }

        let res = handler.handle(&req);
        let fatal = res.fatal;
        write_response(&mut wr, &res).await?;
        if fatal {
            break;
        }
    }
    Ok(())
}

/// Hand the connection to a tap session until it ends.
async fn run_tap(
    mut rd: OwnedReadHalf,
    mut wr: OwnedWriteHalf,
    handler: ReqHandler,
    req: Request,
    config: TapConfig,
) -> Result<()> {
    let (sink_tx, sink_rx) = channel::bounded::<TapMessage>(config.inbox_capacity);
    let (ack_tx, ack_rx) = channel::bounded::<TapAck>(16);

    // Peer acks arrive as response frames on the read half.
    let ack_reader = tokio::spawn(async move {
        loop {
            match read_response(&mut rd).await {
                Ok(Some(res)) => {
                    if ack_tx.try_send(TapAck { status: res.status }).is_err() {
                        break;
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
    });

    // The session is synchronous; run it off the runtime and bridge its
    // messages into an async-friendly channel for the writer below.
    let session = tokio::task::spawn_blocking(move || {
        handler.handle_tap_connect(&req, Some(&ack_rx), &sink_tx, &config)
    });

    let (wire_tx, mut wire_rx) = tokio::sync::mpsc::unbounded_channel::<Request>();
    thread::spawn(move || {
        for msg in sink_rx {
            if wire_tx.send(msg.to_request()).is_err() {
                break;
            }
        }
    });

    while let Some(frame) = wire_rx.recv().await {
        if let Err(e) = write_request(&mut wr, &frame).await {
            // Dropping the receiver fails the bridge, which fails the
            // session's next transmit
            warn!(error = %e, "tap write failed");
            break;
        }
    }
    drop(wire_rx);

    let res = session
        .await
        .map_err(|e| StoreError::TapFatal(e.to_string()))?;
    ack_reader.abort();

    if res.fatal {
        return Err(StoreError::TapFatal(
            String::from_utf8_lossy(&res.body).into_owned(),
        ));
    }
    Ok(())
}
