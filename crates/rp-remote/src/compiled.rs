// SPDX-License-Identifier: MIT OR Apache-2.0
//! The compiled remote client and its worker.
//!
//! Structurally the twin of the sourced worker, with one extra phase: a
//! successful open dedicates the connection to the artifact body, which
//! the reader forwards chunk by chunk into the caller's
//! [`CompiledStream`] before resuming normal message polling.

use crate::backoff::{clock_seed, Backoff};
use crate::sourced::connect_round_robin;
use crate::stream::CompiledStream;
use crate::{event_kind, RemoteError};
use bytes::Bytes;
use rp_events::EventStream;
use rp_protocol::compiled::{self, OpenRequest, ServerMessage};
use rp_protocol::{Notification, RESULT_OK};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};
use uuid::Uuid;

const BODY_CHUNK: usize = 64 * 1024;

/// Reply delivered to a waiting open: `None` means the remote was lost.
type RawReply = Option<(u32, u64, Option<mpsc::Receiver<Bytes>>)>;
type Pending = (OpenRequest, oneshot::Sender<RawReply>);

/// What the reader task forwards to the worker.
enum ReaderMessage {
    Notify(Notification),
    OpenReply {
        id: u32,
        result: u32,
        stream_size: u64,
        body: Option<mpsc::Receiver<Bytes>>,
    },
}

/// Client for the compiled service.
#[derive(Debug)]
pub struct CompiledClient {
    requests: mpsc::Sender<Pending>,
    shutdown: watch::Sender<bool>,
    worker: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CompiledClient {
    /// Spawn the worker for `endpoint`; notifications are posted onto
    /// `events`.
    #[must_use]
    pub fn connect(endpoint: impl Into<String>, events: Arc<EventStream>) -> Self {
        let (requests, request_rx) = mpsc::channel(1);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(worker_loop(endpoint.into(), events, request_rx, shutdown_rx));
        Self {
            requests,
            shutdown,
            worker: tokio::sync::Mutex::new(Some(worker)),
        }
    }

    /// Terminate the worker, failing any in-flight call. Idempotent.
    pub async fn terminate(&self) {
        let _ = self.shutdown.send(true);
        if let Some(worker) = self.worker.lock().await.take() {
            let _ = worker.await;
        }
    }

    /// Open the static artifact for `(uuid, platform)`.
    pub async fn open_static(
        &self,
        uuid: Uuid,
        platform: u64,
    ) -> Result<Option<CompiledStream>, RemoteError> {
        self.open(OpenRequest {
            uuid,
            platform,
            dynamic: false,
        })
        .await
    }

    /// Open the dynamic (`.blob`) artifact for `(uuid, platform)`.
    pub async fn open_dynamic(
        &self,
        uuid: Uuid,
        platform: u64,
    ) -> Result<Option<CompiledStream>, RemoteError> {
        self.open(OpenRequest {
            uuid,
            platform,
            dynamic: true,
        })
        .await
    }

    async fn open(&self, request: OpenRequest) -> Result<Option<CompiledStream>, RemoteError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send((request, reply_tx))
            .await
            .map_err(|_| RemoteError::Unavailable)?;
        match reply_rx.await {
            Ok(Some((result, stream_size, body))) => {
                if result != RESULT_OK {
                    return Ok(None);
                }
                Ok(Some(CompiledStream::new(stream_size, body)))
            }
            Ok(None) | Err(_) => Err(RemoteError::Unavailable),
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

async fn read_loop(mut reader: OwnedReadHalf, tx: mpsc::Sender<ReaderMessage>) {
    loop {
        match compiled::read_server_message(&mut reader).await {
            Ok(ServerMessage::Notify(notification)) => {
                if tx.send(ReaderMessage::Notify(notification)).await.is_err() {
                    return;
                }
            }
            Ok(ServerMessage::OpenReply {
                id,
                result,
                stream_size,
            }) => {
                let body_rx = if result == RESULT_OK && stream_size > 0 {
                    let (body_tx, body_rx) = mpsc::channel(8);
                    if tx
                        .send(ReaderMessage::OpenReply {
                            id,
                            result,
                            stream_size,
                            body: Some(body_rx),
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                    // The connection now belongs to the body; forward it
                    // before polling for messages again.
                    if !copy_body(&mut reader, stream_size, body_tx).await {
                        return;
                    }
                    continue;
                } else {
                    None
                };
                if tx
                    .send(ReaderMessage::OpenReply {
                        id,
                        result,
                        stream_size,
                        body: body_rx,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(err) => {
                trace!(%err, "compiled connection closed");
                return;
            }
        }
    }
}

/// Copy exactly `remaining` body bytes into `tx`. A dropped receiver
/// keeps the copy running so the connection stays frame-aligned.
async fn copy_body(
    reader: &mut OwnedReadHalf,
    mut remaining: u64,
    tx: mpsc::Sender<Bytes>,
) -> bool {
    let mut buf = vec![0u8; BODY_CHUNK];
    let mut receiver_alive = true;
    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        match reader.read(&mut buf[..want]).await {
            Ok(0) | Err(_) => return false,
            Ok(n) => {
                remaining -= n as u64;
                if receiver_alive {
                    receiver_alive = tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_ok();
                }
            }
        }
    }
    true
}

async fn worker_loop(
    endpoint: String,
    events: Arc<EventStream>,
    mut requests: mpsc::Receiver<Pending>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(clock_seed());
    let mut pending: Option<Pending> = None;
    let mut addr_index = 0usize;

    'reconnect: loop {
        if *shutdown.borrow() {
            break;
        }
        let stream = match connect_round_robin(&endpoint, &mut addr_index).await {
            Ok(stream) => stream,
            Err(err) => {
                debug!(%endpoint, %err, "compiled connect failed, backing off");
                let delay = backoff.next_delay();
                tokio::select! {
                    () = tokio::time::sleep(delay) => continue 'reconnect,
                    _ = shutdown.changed() => break 'reconnect,
                }
            }
        };
        debug!(%endpoint, "compiled remote connected");
        backoff.reset();

        let (read_half, mut write_half) = stream.into_split();
        let (message_tx, mut messages) = mpsc::channel(16);
        let reader = tokio::spawn(read_loop(read_half, message_tx));
        let mut waiting: Option<Pending> = None;

        if let Some((request, reply_tx)) = pending.take() {
            if write_open(&mut write_half, &request).await {
                waiting = Some((request, reply_tx));
            } else {
                pending = Some((request, reply_tx));
                reader.abort();
                continue 'reconnect;
            }
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if let Some((_, reply_tx)) = waiting.take() {
                        let _ = reply_tx.send(None);
                    }
                    reader.abort();
                    break 'reconnect;
                }
                message = messages.recv() => match message {
                    Some(ReaderMessage::Notify(notification)) => {
                        events.post(
                            event_kind(notification.kind),
                            notification.uuid,
                            notification.platform,
                            notification.token,
                        );
                    }
                    Some(ReaderMessage::OpenReply { id, result, stream_size, body }) => {
                        match waiting.take() {
                            Some((request, reply_tx)) if request.reply_id() == id => {
                                let _ = reply_tx.send(Some((result, stream_size, body)));
                            }
                            other => {
                                warn!(id, "unexpected compiled reply, reconnecting");
                                if let Some((_, reply_tx)) = other {
                                    let _ = reply_tx.send(None);
                                }
                                reader.abort();
                                continue 'reconnect;
                            }
                        }
                    }
                    None => {
                        if let Some(interrupted) = waiting.take() {
                            pending = Some(interrupted);
                        }
                        break;
                    }
                },
                request = requests.recv(), if waiting.is_none() => match request {
                    Some((request, reply_tx)) => {
                        if write_open(&mut write_half, &request).await {
                            waiting = Some((request, reply_tx));
                        } else {
                            pending = Some((request, reply_tx));
                            reader.abort();
                            break;
                        }
                    }
                    None => {
                        reader.abort();
                        break 'reconnect;
                    }
                },
            }
        }
    }

    if let Some((_, reply_tx)) = pending.take() {
        let _ = reply_tx.send(None);
    }
    requests.close();
    while let Ok((_, reply_tx)) = requests.try_recv() {
        let _ = reply_tx.send(None);
    }
    debug!(%endpoint, "compiled worker terminated");
}

async fn write_open(writer: &mut OwnedWriteHalf, request: &OpenRequest) -> bool {
    match compiled::write_open_request(writer, request).await {
        Ok(()) => true,
        Err(err) => {
            debug!(%err, "compiled request write failed");
            false
        }
    }
}
