//! Per-session transport: the socket read and write loops.
//!
//! Each session runs two concurrent duties. The read loop decodes and
//! dispatches inbound frames under a pong-refreshed deadline; the write
//! loop drains the session's bounded queue (coalescing adjacent frames
//! into one write burst) and emits the periodic liveness probe. Any
//! read/write failure, deadline expiry, or oversized frame terminates
//! the session; termination is idempotent and always ends in a hub
//! unregister.

use std::ops::ControlFlow;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};
use vellum_core::{codes, ClientId, DocumentKey, Frame, FrameKind, UpdatePayload};
use vellum_doclog::DocLogError;
use vellum_hub::SessionHandle;

use crate::auth::AuthClaims;
use crate::server::GatewayContext;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// Adjacent pending frames coalesced into one network write.
const COALESCE_BURST: usize = 16;

/// Run one authenticated session to completion.
pub async fn run_session(
    ws: WebSocketStream<TcpStream>,
    ctx: Arc<GatewayContext>,
    doc: DocumentKey,
    claims: AuthClaims,
    client: ClientId,
) {
    let (session, outbound) = SessionHandle::new(
        doc.clone(),
        claims.principal,
        client,
        claims.username,
        ctx.websocket.send_queue_depth,
    );
    if ctx.hub.register(Arc::clone(&session)).await.is_err() {
        return;
    }
    debug!(session = %session.id(), doc = %doc, principal = %session.principal(), "session attached");

    let (sink, stream) = ws.split();
    let writer = tokio::spawn(write_loop(
        sink,
        outbound,
        Arc::clone(&session),
        Arc::clone(&ctx),
    ));

    read_loop(stream, &ctx, &doc, &session).await;

    // Teardown is idempotent: whichever side failed first, the session
    // closes once and the room is asked to unregister it.
    session.close();
    let _ = ctx.hub.unregister(doc.clone(), session.id()).await;
    let _ = writer.await;
    debug!(session = %session.id(), doc = %doc, "session detached");
}

/// Inbound duty: decode, stamp, dispatch.
async fn read_loop(
    mut stream: WsStream,
    ctx: &Arc<GatewayContext>,
    doc: &DocumentKey,
    session: &Arc<SessionHandle>,
) {
    let cancel = session.cancelled();
    let shutdown = ctx.shutdown.clone();
    let pong_window = ctx.websocket.pong_window();
    let mut deadline = Instant::now() + pong_window;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = shutdown.cancelled() => break,
            next = tokio::time::timeout_at(deadline, stream.next()) => {
                match next {
                    Err(_) => {
                        debug!(session = %session.id(), "pong window expired");
                        break;
                    },
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        debug!(session = %session.id(), error = %e, "socket read failed");
                        break;
                    },
                    Ok(Some(Ok(message))) => match message {
                        Message::Pong(_) => {
                            deadline = Instant::now() + pong_window;
                        },
                        Message::Ping(_) => {
                            // Answered by the websocket layer on the
                            // next write flush.
                        },
                        Message::Close(_) => break,
                        Message::Text(text) => {
                            if handle_frame(ctx, doc, session, text.as_bytes()).await.is_break() {
                                break;
                            }
                        },
                        Message::Binary(binary) => {
                            if handle_frame(ctx, doc, session, &binary).await.is_break() {
                                break;
                            }
                        },
                        Message::Frame(_) => {},
                    },
                }
            }
        }
    }
}

/// Decode one inbound frame, stamp identity and time, dispatch by type.
///
/// `Break` means the session must be terminated (oversized or malformed
/// input); per-message faults inside a valid envelope answer with an
/// `error` frame instead.
async fn handle_frame(
    ctx: &Arc<GatewayContext>,
    doc: &DocumentKey,
    session: &Arc<SessionHandle>,
    raw: &[u8],
) -> ControlFlow<()> {
    if raw.len() > ctx.websocket.max_message_bytes {
        warn!(session = %session.id(), size = raw.len(), "oversized frame, terminating session");
        return ControlFlow::Break(());
    }

    let mut frame = match Frame::decode(raw) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(session = %session.id(), error = %e, "malformed frame, terminating session");
            return ControlFlow::Break(());
        },
    };

    frame.user_id = Some(session.principal().clone());
    frame.username = Some(session.username().to_owned());
    frame.timestamp = Utc::now();

    match frame.kind {
        FrameKind::Ping => {
            let _ = session.try_enqueue(Frame::pong());
        },
        FrameKind::UserTyping
        | FrameKind::CursorUpdate
        | FrameKind::Selection
        | FrameKind::YjsAwareness => {
            let _ = ctx
                .hub
                .broadcast(doc.clone(), frame, Some(session.id()))
                .await;
        },
        FrameKind::DocumentUpdate | FrameKind::YjsUpdate => {
            handle_update(ctx, doc, session, frame).await;
        },
        FrameKind::Unknown => {
            let _ = session.try_enqueue(Frame::error(
                codes::UNKNOWN_TYPE,
                "unrecognized frame type",
            ));
        },
        // Server-synthesized types are not accepted from clients.
        FrameKind::Pong
        | FrameKind::Error
        | FrameKind::UserJoined
        | FrameKind::UserLeft
        | FrameKind::CompilationStarted
        | FrameKind::CompilationCompleted
        | FrameKind::CompilationFailed => {},
    }
    ControlFlow::Continue(())
}

/// Persist a document delta, then relay it with the assigned version.
async fn handle_update(
    ctx: &Arc<GatewayContext>,
    doc: &DocumentKey,
    session: &Arc<SessionHandle>,
    frame: Frame,
) {
    let payload: UpdatePayload = match frame.payload_as() {
        Ok(payload) => payload,
        Err(_) => {
            let _ = session.try_enqueue(Frame::error(
                codes::INVALID_PAYLOAD,
                "update frames require a base64 `update` field",
            ));
            return;
        },
    };
    let delta = match payload.bytes() {
        Ok(delta) => delta,
        Err(_) => {
            let _ = session.try_enqueue(Frame::error(
                codes::INVALID_PAYLOAD,
                "update field is not valid base64",
            ));
            return;
        },
    };

    match ctx
        .log
        .append(
            doc,
            delta,
            session.principal().clone(),
            session.client().clone(),
        )
        .await
    {
        Ok(version) => {
            let relayed = UpdatePayload {
                update: payload.update,
                version: Some(version),
            };
            let mut out = frame;
            out.payload = serde_json::to_value(relayed).ok();
            let _ = ctx
                .hub
                .broadcast(doc.clone(), out, Some(session.id()))
                .await;
        },
        Err(e @ (DocLogError::EmptyDelta | DocLogError::DeltaTooLarge { .. })) => {
            let _ = session.try_enqueue(Frame::error(codes::UPDATE_REJECTED, e.to_string()));
        },
        Err(DocLogError::Storage(e)) => {
            warn!(doc = %doc, error = %e, "delta persist failed");
            let _ = session.try_enqueue(Frame::error(
                codes::UPDATE_REJECTED,
                "storage temporarily unavailable",
            ));
        },
    }
}

/// Outbound duty: drain the send queue and probe liveness.
async fn write_loop(
    mut sink: WsSink,
    mut outbound: mpsc::Receiver<Frame>,
    session: Arc<SessionHandle>,
    ctx: Arc<GatewayContext>,
) {
    let cancel = session.cancelled();
    let ping_interval = ctx.websocket.ping_interval();
    let write_wait = ctx.websocket.write_wait();
    let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                let mut batch = vec![frame];
                while batch.len() < COALESCE_BURST {
                    match outbound.try_recv() {
                        Ok(frame) => batch.push(frame),
                        Err(_) => break,
                    }
                }
                if write_batch(&mut sink, batch, write_wait).await.is_err() {
                    debug!(session = %session.id(), "socket write failed or timed out");
                    break;
                }
            }
            _ = ping.tick() => {
                let probe = sink.send(Message::Ping(Vec::new()));
                match tokio::time::timeout(write_wait, probe).await {
                    Ok(Ok(())) => {},
                    _ => {
                        debug!(session = %session.id(), "liveness probe write failed");
                        break;
                    },
                }
            }
        }
    }

    session.close();
    let _ = tokio::time::timeout(write_wait, sink.close()).await;
}

/// Feed a burst of frames, then flush once.
async fn write_batch(
    sink: &mut WsSink,
    batch: Vec<Frame>,
    write_wait: std::time::Duration,
) -> Result<(), ()> {
    for frame in batch {
        match frame.encode() {
            Ok(json) => {
                let fed = tokio::time::timeout(write_wait, sink.feed(Message::Text(json))).await;
                if !matches!(fed, Ok(Ok(()))) {
                    return Err(());
                }
            },
            Err(e) => {
                warn!(error = %e, "dropping unencodable outbound frame");
            },
        }
    }
    match tokio::time::timeout(write_wait, sink.flush()).await {
        Ok(Ok(())) => Ok(()),
        _ => Err(()),
    }
}
