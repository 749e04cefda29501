//! One client connection: the framer pump and the request dispatcher.
//!
//! Bytes from the socket feed a [`FrameDecoder`]; each complete frame is
//! decoded into a request message and dispatched to the broker. Responses
//! for one inbound message are batched into a single outbound message;
//! deferred completions later produce their own single-response messages.
//! All outbound frames flow through the session's queue, so the writer
//! emits them in completion order with a single write in flight.

use crate::broker::Broker;
use crate::object::SessionId;
use log::{error, log_enabled, trace, warn};
use partake_proto::{
    decode_request_message, encode_frame, encode_response_message, FrameDecoder, FrameError,
    Request, RequestBody, Response, ResponseBody, ResponseMessage, WireError,
};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Transport failure; no further responses are attempted.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    /// Framing violation (overlong frame, EOF mid-frame).
    #[error(transparent)]
    Frame(#[from] FrameError),
    /// Undecodable message; protocol-fatal for the session.
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Serves one accepted connection to completion. The session must already be
/// registered with the broker; it is removed here on the way out, whatever
/// the outcome.
pub async fn serve(
    stream: UnixStream,
    broker: Rc<RefCell<Broker>>,
    sid: SessionId,
    mut outbox: mpsc::UnboundedReceiver<ResponseMessage>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut decoder = FrameDecoder::new();

    let result = loop {
        tokio::select! {
            // Outbound: one frame written at a time, in queue order.
            msg = outbox.recv() => {
                let Some(msg) = msg else { break Ok(()) };
                if let Err(err) = write_message(&mut writer, &msg).await {
                    // A failed write terminates the session; anything still
                    // queued is discarded.
                    break Err(err);
                }
            }
            // Inbound: fill the decoder, then drain complete frames.
            read = reader.read(decoder.read_buf()) => {
                let n = match read {
                    Ok(n) => n,
                    Err(err) => break Err(ConnectionError::Io(err)),
                };
                if n == 0 {
                    if decoder.has_partial() {
                        break Err(ConnectionError::Frame(FrameError::EofInMessage));
                    }
                    break Ok(()); // Clean EOF on a frame boundary.
                }
                decoder.advance(n);
                match drain_frames(&mut decoder, &broker, sid) {
                    Ok(false) => {}
                    Ok(true) => break Ok(()), // Quit: stop reading.
                    Err(err) => break Err(err),
                }
            }
        }
    };

    match &result {
        Ok(()) => {}
        Err(ConnectionError::Io(err)) => {
            error!("client {sid}: failed to read from or write to socket: {err}");
        }
        Err(err) => {
            warn!("client {sid}: fatal protocol error: {err}");
        }
    }

    // Drop pending continuations and tear down the session before flushing:
    // nothing may resume against a dead session.
    broker.borrow_mut().remove_session(sid);

    // On a clean end of stream, let queued responses (e.g. the reply to a
    // Quit) drain before closing. Transport and protocol errors just close.
    if result.is_ok() {
        while let Some(msg) = outbox.recv().await {
            if write_message(&mut writer, &msg).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    }
}

async fn write_message(
    writer: &mut (impl AsyncWriteExt + Unpin),
    msg: &ResponseMessage,
) -> Result<(), ConnectionError> {
    let payload = encode_response_message(msg)?;
    let frame = encode_frame(&payload)?;
    writer.write_all(&frame).await?;
    Ok(())
}

/// Processes every complete frame currently buffered. Returns `Ok(true)`
/// when the client sent Quit and the read stream should end.
fn drain_frames(
    decoder: &mut FrameDecoder,
    broker: &Rc<RefCell<Broker>>,
    sid: SessionId,
) -> Result<bool, ConnectionError> {
    loop {
        let payload = match decoder.next_frame()? {
            Some(payload) => payload,
            None => return Ok(false),
        };
        if handle_message(broker, sid, payload)? {
            return Ok(true);
        }
    }
}

/// Decodes and dispatches one request message; queues the batched response.
fn handle_message(
    broker: &Rc<RefCell<Broker>>,
    sid: SessionId,
    payload: &[u8],
) -> Result<bool, ConnectionError> {
    let msg = decode_request_message(payload)?;
    let now = Instant::now();
    let mut broker = broker.borrow_mut();
    let mut responses = Vec::with_capacity(msg.requests.len());
    let mut done = false;

    for request in msg.requests {
        if log_enabled!(log::Level::Trace) {
            trace!("client {sid}: request {:?}", request);
        }
        if let Some(response) = dispatch(&mut broker, sid, &request, now, &mut done) {
            responses.push(response);
        }
        if done {
            break;
        }
    }

    if !responses.is_empty() {
        broker.push_responses(sid, ResponseMessage { responses });
    }

    // Rehash tables at most once per request message, after the responses
    // have been queued, so the work lands off the critical path.
    broker.housekeeping(sid);

    Ok(done)
}

/// Dispatches one request. Returns `None` when the request was suspended
/// (its response will arrive later through the session's queue).
fn dispatch(
    broker: &mut Broker,
    sid: SessionId,
    request: &Request,
    now: Instant,
    done: &mut bool,
) -> Option<Response> {
    let seqno = request.seqno;
    let response = match &request.body {
        RequestBody::Ping => Response::success(seqno, ResponseBody::Ping),
        RequestBody::Hello { name, pid } => match broker.hello(sid, name, *pid) {
            Ok(session_id) => Response::success(seqno, ResponseBody::Hello { session_id }),
            Err(status) => Response::error(seqno, status),
        },
        RequestBody::Quit => {
            *done = true; // End of read stream.
            Response::success(seqno, ResponseBody::Quit)
        }
        RequestBody::GetSegment { segment } => match broker.get_segment(*segment) {
            Ok(spec) => Response::success(seqno, ResponseBody::GetSegment { spec }),
            Err(status) => Response::error(seqno, status),
        },
        RequestBody::Alloc { size, policy } => match broker.alloc(sid, *size, *policy) {
            Ok(mapping) => Response::success(seqno, ResponseBody::Alloc { mapping }),
            Err(status) => Response::error(seqno, status),
        },
        RequestBody::Open { key, policy, wait } => {
            match broker.open(sid, seqno, *key, *policy, *wait, now) {
                Some(Ok(mapping)) => Response::success(seqno, ResponseBody::Open { mapping }),
                Some(Err(status)) => Response::error(seqno, status),
                None => return None,
            }
        }
        RequestBody::Close { key } => match broker.close(sid, *key) {
            Ok(()) => Response::success(seqno, ResponseBody::Close),
            Err(status) => Response::error(seqno, status),
        },
        RequestBody::Share { key } => match broker.share(sid, *key) {
            Ok(()) => Response::success(seqno, ResponseBody::Share),
            Err(status) => Response::error(seqno, status),
        },
        RequestBody::Unshare { key, wait } => match broker.unshare(sid, seqno, *key, *wait) {
            Some(Ok(key)) => Response::success(seqno, ResponseBody::Unshare { key }),
            Some(Err(status)) => Response::error(seqno, status),
            None => return None,
        },
        RequestBody::CreateVoucher { key, count } => {
            match broker.create_voucher(sid, *key, *count, now) {
                Ok(key) => Response::success(seqno, ResponseBody::CreateVoucher { key }),
                Err(status) => Response::error(seqno, status),
            }
        }
        RequestBody::DiscardVoucher { key } => match broker.discard_voucher(sid, *key, now) {
            Ok(key) => Response::success(seqno, ResponseBody::DiscardVoucher { key }),
            Err(status) => Response::error(seqno, status),
        },
    };
    Some(response)
}
