// SPDX-License-Identifier: MIT OR Apache-2.0
//! The sourced remote client and its worker.

use crate::backoff::{clock_seed, Backoff};
use crate::{event_kind, RemoteError};
use rp_core::ContentHash;
use rp_events::EventStream;
use rp_protocol::sourced::{
    self, ServerMessage, SourceChange, SourcedReply, SourcedRequest,
};
use rp_protocol::RESULT_OK;
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// A raw reply: `None` means "remote lost, treat as failure".
type RawReply = Option<(u32, u32, Vec<u8>)>;
type Pending = (SourcedRequest, oneshot::Sender<RawReply>);

/// Client for the sourced service.
///
/// All calls are serialized through the worker's depth-one request
/// channel; a call blocks (asynchronously) until its reply or until the
/// worker gives up on the connection.
#[derive(Debug)]
pub struct SourcedClient {
    requests: mpsc::Sender<Pending>,
    shutdown: watch::Sender<bool>,
    worker: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SourcedClient {
    /// Spawn the worker for `endpoint` (a `host:port` string).
    /// Notifications from the remote are posted onto `events`.
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

    async fn request(&self, request: SourcedRequest) -> Result<(u32, u32, Vec<u8>), RemoteError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send((request, tx))
            .await
            .map_err(|_| RemoteError::Unavailable)?;
        match rx.await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) | Err(_) => Err(RemoteError::Unavailable),
        }
    }

    /// `Ok(None)` when the remote answered FAILED (e.g. not found).
    async fn query(&self, request: SourcedRequest) -> Result<Option<SourcedReply>, RemoteError> {
        let reply_id = request.reply_id();
        let (result, _flags, body) = self.request(request).await?;
        if result != RESULT_OK {
            return Ok(None);
        }
        Ok(Some(SourcedReply::decode_body(reply_id, &body)?))
    }

    async fn command(&self, request: SourcedRequest) -> Result<(), RemoteError> {
        match self.query(request).await? {
            Some(_) => Ok(()),
            None => Err(RemoteError::Failed),
        }
    }

    /// Resolve a path to `(uuid, signature-hash)`.
    pub async fn lookup(
        &self,
        path: &str,
    ) -> Result<Option<(Uuid, ContentHash)>, RemoteError> {
        match self
            .query(SourcedRequest::Lookup { path: path.into() })
            .await?
        {
            Some(SourcedReply::Lookup { uuid, hash }) => Ok(Some((uuid, hash))),
            _ => Ok(None),
        }
    }

    /// Resolve a UUID back to its imported path.
    pub async fn reverse_lookup(&self, uuid: Uuid) -> Result<Option<String>, RemoteError> {
        match self.query(SourcedRequest::ReverseLookup { uuid }).await? {
            Some(SourcedReply::ReverseLookup { path }) => Ok(Some(path)),
            _ => Ok(None),
        }
    }

    /// Import a file on the server side.
    pub async fn import(
        &self,
        path: &str,
    ) -> Result<Option<(Uuid, ContentHash)>, RemoteError> {
        match self
            .query(SourcedRequest::Import { path: path.into() })
            .await?
        {
            Some(SourcedReply::Import { uuid, hash }) => Ok(Some((uuid, hash))),
            _ => Ok(None),
        }
    }

    /// Fetch the full change log of a source.
    pub async fn read(
        &self,
        uuid: Uuid,
    ) -> Result<Option<(ContentHash, Vec<SourceChange>)>, RemoteError> {
        match self.query(SourcedRequest::Read { uuid }).await? {
            Some(SourcedReply::Read { hash, changes }) => Ok(Some((hash, changes))),
            _ => Ok(None),
        }
    }

    /// Fetch the source hash for `(uuid, platform)`.
    pub async fn hash(
        &self,
        uuid: Uuid,
        platform: u64,
    ) -> Result<Option<ContentHash>, RemoteError> {
        match self.query(SourcedRequest::Hash { uuid, platform }).await? {
            Some(SourcedReply::Hash { hash }) => Ok(Some(hash)),
            _ => Ok(None),
        }
    }

    /// Enumerate direct dependencies of `(uuid, platform)`.
    pub async fn dependencies(
        &self,
        uuid: Uuid,
        platform: u64,
    ) -> Result<Option<Vec<(Uuid, u64)>>, RemoteError> {
        match self
            .query(SourcedRequest::Dependencies { uuid, platform })
            .await?
        {
            Some(SourcedReply::Dependencies { deps }) => Ok(Some(deps)),
            _ => Ok(None),
        }
    }

    /// Fetch a blob sidecar payload.
    pub async fn read_blob(
        &self,
        uuid: Uuid,
        platform: u64,
        key: u64,
    ) -> Result<Option<(u64, Vec<u8>)>, RemoteError> {
        match self
            .query(SourcedRequest::ReadBlob {
                uuid,
                platform,
                key,
            })
            .await?
        {
            Some(SourcedReply::ReadBlob { checksum, bytes }) => Ok(Some((checksum, bytes))),
            _ => Ok(None),
        }
    }

    /// Apply a value change to the server-side source.
    pub async fn set(
        &self,
        uuid: Uuid,
        key: u64,
        platform: u64,
        value: Vec<u8>,
    ) -> Result<(), RemoteError> {
        self.command(SourcedRequest::Set {
            uuid,
            key,
            platform,
            value,
        })
        .await
    }

    /// Apply an unset change to the server-side source.
    pub async fn unset(&self, uuid: Uuid, key: u64, platform: u64) -> Result<(), RemoteError> {
        self.command(SourcedRequest::Unset {
            uuid,
            key,
            platform,
        })
        .await
    }

    /// Delete a resource on the server.
    pub async fn delete(&self, uuid: Uuid) -> Result<(), RemoteError> {
        self.command(SourcedRequest::Delete { uuid }).await
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub(crate) async fn connect_round_robin(
    endpoint: &str,
    index: &mut usize,
) -> std::io::Result<TcpStream> {
    let addrs: Vec<_> = tokio::net::lookup_host(endpoint).await?.collect();
    if addrs.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "endpoint resolved to no addresses",
        ));
    }
    let addr = addrs[*index % addrs.len()];
    *index = index.wrapping_add(1);
    TcpStream::connect(addr).await
}

async fn read_loop(mut reader: OwnedReadHalf, tx: mpsc::Sender<ServerMessage>) {
    loop {
        match sourced::read_server_message(&mut reader).await {
            Ok(message) => {
                if tx.send(message).await.is_err() {
                    return;
                }
            }
            // Dropping the sender is how the worker learns the
            // connection is gone.
            Err(err) => {
                trace!(%err, "sourced connection closed");
                return;
            }
        }
    }
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
                debug!(%endpoint, %err, "sourced connect failed, backing off");
                let delay = backoff.next_delay();
                tokio::select! {
                    () = tokio::time::sleep(delay) => continue 'reconnect,
                    _ = shutdown.changed() => break 'reconnect,
                }
            }
        };
        debug!(%endpoint, "sourced remote connected");
        backoff.reset();

        let (read_half, mut write_half) = stream.into_split();
        let (message_tx, mut messages) = mpsc::channel(16);
        let reader = tokio::spawn(read_loop(read_half, message_tx));
        let mut waiting: Option<Pending> = None;

        // Re-issue the request the previous connection died under.
        if let Some((request, reply_tx)) = pending.take() {
            if write_request(&mut write_half, &request).await {
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
                    Some(ServerMessage::Notify(notification)) => {
                        events.post(
                            event_kind(notification.kind),
                            notification.uuid,
                            notification.platform,
                            notification.token,
                        );
                    }
                    Some(ServerMessage::Reply { id, result, flags, body }) => {
                        match waiting.take() {
                            Some((request, reply_tx)) if request.reply_id() == id => {
                                let _ = reply_tx.send(Some((result, flags, body)));
                            }
                            other => {
                                // A reply we were not waiting for: the
                                // connection is desynchronized.
                                warn!(id, "unexpected sourced reply, reconnecting");
                                if let Some((_, reply_tx)) = other {
                                    let _ = reply_tx.send(None);
                                }
                                reader.abort();
                                continue 'reconnect;
                            }
                        }
                    }
                    None => {
                        // Connection lost; keep the in-flight request for
                        // re-issue after reconnection.
                        if let Some(interrupted) = waiting.take() {
                            pending = Some(interrupted);
                        }
                        break;
                    }
                },
                request = requests.recv(), if waiting.is_none() => match request {
                    Some((request, reply_tx)) => {
                        if write_request(&mut write_half, &request).await {
                            waiting = Some((request, reply_tx));
                        } else {
                            pending = Some((request, reply_tx));
                            reader.abort();
                            break;
                        }
                    }
                    None => {
                        // Every client handle dropped.
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
    debug!(%endpoint, "sourced worker terminated");
}

async fn write_request(writer: &mut OwnedWriteHalf, request: &SourcedRequest) -> bool {
    match sourced::write_request(writer, request).await {
        Ok(()) => true,
        Err(err) => {
            debug!(%err, "sourced request write failed");
            false
        }
    }
}
