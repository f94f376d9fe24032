// SPDX-License-Identifier: MIT OR Apache-2.0
//! Server loops for the sourced and compiled services.
//!
//! Each accepted connection gets one task that owns the write half of
//! the socket; a companion reader task feeds decoded requests through a
//! channel so request handling and notification broadcast can be
//! selected over without tearing frames. Per the protocol contract, a
//! connection carries one reply per request in request order, and
//! notifications interleave only between (never inside) a request's
//! header/body sequence.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use rp_events::{EventKind, ResourceEvent};
use rp_protocol::sourced::{SourceChange, SourceChangePayload, SourcedReply, SourcedRequest};
use rp_protocol::{compiled, sourced, Notification, NotifyKind, ProtocolError};
use rp_runtime::ResourceModule;
use rp_source::ChangeValue;
use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Default port of the sourced service.
pub const DEFAULT_SOURCED_PORT: u16 = 7780;
/// Default port of the compiled service.
pub const DEFAULT_COMPILED_PORT: u16 = 7781;

/// Errors from daemon start-up.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// Neither the IPv4 nor the IPv6 listener could bind.
    #[error("could not bind port {port} on any address family")]
    Bind {
        /// The requested port.
        port: u16,
    },
}

/// Bind IPv4 and IPv6 listeners for `port`, keeping whichever succeed.
///
/// On hosts where the IPv6 socket is dual-stack, the IPv4 bind fails
/// with address-in-use and the single listener serves both families,
/// which is exactly the "whichever succeed" contract.
pub async fn bind_dual(port: u16) -> Result<Vec<TcpListener>, ServeError> {
    let mut listeners = Vec::new();
    match TcpListener::bind((Ipv6Addr::UNSPECIFIED, port)).await {
        Ok(listener) => listeners.push(listener),
        Err(err) => debug!(port, %err, "ipv6 bind failed"),
    }
    match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listeners.push(listener),
        Err(err) => debug!(port, %err, "ipv4 bind failed"),
    }
    if listeners.is_empty() {
        return Err(ServeError::Bind { port });
    }
    Ok(listeners)
}

fn notify_from_event(event: &ResourceEvent) -> Notification {
    Notification {
        kind: match event.kind {
            EventKind::Create => NotifyKind::Create,
            EventKind::Modify => NotifyKind::Modify,
            EventKind::Depends => NotifyKind::Depends,
            EventKind::Delete => NotifyKind::Delete,
        },
        uuid: event.uuid,
        platform: event.platform,
        token: event.token,
    }
}

// ---------------------------------------------------------------------------
// Sourced service
// ---------------------------------------------------------------------------

/// Accept sourced connections on `listener` until the task is aborted.
pub async fn serve_sourced(module: Arc<ResourceModule>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                debug!(%peer, "sourced client connected");
                tokio::spawn(sourced_connection(module.clone(), socket));
            }
            Err(err) => {
                warn!(%err, "sourced accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn sourced_connection(module: Arc<ResourceModule>, socket: TcpStream) {
    let mut notifications = module.events().subscribe();
    let (mut read_half, mut write_half) = socket.into_split();

    // Decoded requests flow through a depth-one channel: the reader may
    // be one request ahead, but replies still go out in request order.
    let (request_tx, mut requests) = mpsc::channel::<Result<SourcedRequest, ProtocolError>>(1);
    let reader = tokio::spawn(async move {
        loop {
            let request = sourced::read_request(&mut read_half).await;
            let failed = request.is_err();
            if request_tx.send(request).await.is_err() || failed {
                return;
            }
        }
    });

    loop {
        tokio::select! {
            request = requests.recv() => match request {
                Some(Ok(request)) => {
                    if !answer_sourced(&module, &mut write_half, request).await {
                        break;
                    }
                }
                Some(Err(err)) => {
                    // Parsing errors drop the connection.
                    debug!(%err, "sourced request error, closing connection");
                    break;
                }
                None => break,
            },
            event = notifications.recv() => match event {
                Ok(event) => {
                    let notification = notify_from_event(&event);
                    if sourced::write_notification(&mut write_half, &notification)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                // Lagged receivers lose oldest notifications; tokens let
                // the client notice. A closed stream ends broadcasting.
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    reader.abort();
}

/// Process one request and write its reply. Returns `false` when the
/// connection should close.
async fn answer_sourced(
    module: &Arc<ResourceModule>,
    writer: &mut OwnedWriteHalf,
    request: SourcedRequest,
) -> bool {
    let request_id = request.id();
    match process_sourced(module, request).await {
        Some(reply) => sourced::write_reply(writer, &reply).await.is_ok(),
        None => sourced::write_failure(writer, request_id).await.is_ok(),
    }
}

/// Run a request against the engine; `None` becomes a FAILED reply.
async fn process_sourced(
    module: &Arc<ResourceModule>,
    request: SourcedRequest,
) -> Option<SourcedReply> {
    let engine = module.engine().clone();
    let outcome = tokio::task::spawn_blocking(move || -> Option<SourcedReply> {
        match request {
            SourcedRequest::Lookup { path } => {
                let (uuid, hash) = engine.lookup(path.as_ref()).ok().flatten()?;
                Some(SourcedReply::Lookup { uuid, hash })
            }
            SourcedRequest::ReverseLookup { uuid } => {
                let path = engine.reverse_lookup(uuid).ok().flatten()?;
                Some(SourcedReply::ReverseLookup {
                    path: path.to_string_lossy().into_owned(),
                })
            }
            SourcedRequest::Import { path } => {
                match engine.import(path.as_ref()) {
                    Ok((uuid, hash)) => Some(SourcedReply::Import { uuid, hash }),
                    Err(err) => {
                        warn!(path = %path, %err, "remote import failed");
                        None
                    }
                }
            }
            SourcedRequest::Read { uuid } => {
                let source = engine.read_source(uuid).ok()?;
                let hash = source.source_hash();
                let changes = source.iter().map(wire_change).collect();
                Some(SourcedReply::Read { hash, changes })
            }
            SourcedRequest::Hash { uuid, platform: _ } => {
                let hash = engine.source_hash(uuid)?;
                Some(SourcedReply::Hash { hash })
            }
            SourcedRequest::Dependencies { uuid, platform } => {
                let deps = engine.dependencies(uuid, platform).ok()?;
                Some(SourcedReply::Dependencies { deps })
            }
            SourcedRequest::ReadBlob {
                uuid,
                platform,
                key,
            } => {
                let (checksum, bytes) = engine.read_blob(uuid, platform, key).ok()?;
                Some(SourcedReply::ReadBlob { checksum, bytes })
            }
            SourcedRequest::Set {
                uuid,
                key,
                platform,
                value,
            } => {
                engine.apply_set(uuid, key, platform, &value).ok()?;
                Some(SourcedReply::Set)
            }
            SourcedRequest::Unset {
                uuid,
                key,
                platform,
            } => {
                engine.apply_unset(uuid, key, platform).ok()?;
                Some(SourcedReply::Unset)
            }
            SourcedRequest::Delete { uuid } => {
                engine.delete(uuid).ok()?;
                Some(SourcedReply::Delete)
            }
        }
    })
    .await;
    outcome.unwrap_or(None)
}

fn wire_change(view: rp_source::ChangeView<'_>) -> SourceChange {
    SourceChange {
        timestamp: view.timestamp,
        key: view.key,
        platform: view.platform,
        payload: match view.value {
            ChangeValue::Value(bytes) => SourceChangePayload::Value(bytes.to_vec()),
            ChangeValue::Blob { checksum, size } => SourceChangePayload::Blob { checksum, size },
            ChangeValue::Unset => SourceChangePayload::Unset,
        },
    }
}

// ---------------------------------------------------------------------------
// Compiled service
// ---------------------------------------------------------------------------

/// Accept compiled connections on `listener` until the task is aborted.
pub async fn serve_compiled(module: Arc<ResourceModule>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                debug!(%peer, "compiled client connected");
                tokio::spawn(compiled_connection(module.clone(), socket));
            }
            Err(err) => {
                warn!(%err, "compiled accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn compiled_connection(module: Arc<ResourceModule>, socket: TcpStream) {
    let mut notifications = module.events().subscribe();
    let (mut read_half, mut write_half) = socket.into_split();

    let (request_tx, mut requests) = mpsc::channel::<Result<compiled::OpenRequest, ProtocolError>>(1);
    let reader = tokio::spawn(async move {
        loop {
            let request = compiled::read_request(&mut read_half).await;
            let failed = request.is_err();
            if request_tx.send(request).await.is_err() || failed {
                return;
            }
        }
    });

    loop {
        tokio::select! {
            request = requests.recv() => match request {
                Some(Ok(request)) => {
                    if !answer_compiled(&module, &mut write_half, request).await {
                        break;
                    }
                }
                Some(Err(err)) => {
                    debug!(%err, "compiled request error, closing connection");
                    break;
                }
                None => break,
            },
            event = notifications.recv() => match event {
                Ok(event) => {
                    let notification = notify_from_event(&event);
                    if compiled::write_notification(&mut write_half, &notification)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    reader.abort();
}

async fn answer_compiled(
    module: &Arc<ResourceModule>,
    writer: &mut OwnedWriteHalf,
    request: compiled::OpenRequest,
) -> bool {
    match module
        .open_local(request.uuid, request.platform, request.dynamic)
        .await
    {
        Ok(Some(artifact)) => {
            if compiled::write_open_reply(writer, request.reply_id(), artifact.size)
                .await
                .is_err()
            {
                return false;
            }
            // The connection is dedicated to the body until all
            // `artifact.size` bytes are out.
            let mut file = tokio::fs::File::from_std(artifact.file);
            match tokio::io::copy(&mut file, writer).await {
                Ok(copied) if copied == artifact.size => writer.flush().await.is_ok(),
                Ok(copied) => {
                    warn!(
                        uuid = %request.uuid,
                        expected = artifact.size,
                        copied,
                        "artifact changed size mid-stream, closing connection"
                    );
                    false
                }
                Err(_) => false,
            }
        }
        Ok(None) => compiled::write_open_failure(writer, request.id()).await.is_ok(),
        Err(err) => {
            warn!(uuid = %request.uuid, %err, "open failed");
            compiled::write_open_failure(writer, request.id()).await.is_ok()
        }
    }
}

// ---------------------------------------------------------------------------
// Pumps
// ---------------------------------------------------------------------------

/// Drain the event queue periodically so it cannot grow without bound;
/// connected clients are fed by the broadcast mirror.
pub async fn event_pump(module: Arc<ResourceModule>) {
    let mut tick = tokio::time::interval(Duration::from_millis(200));
    loop {
        tick.tick().await;
        for event in module.events().drain() {
            debug!(
                kind = ?event.kind,
                uuid = %event.uuid,
                platform = event.platform,
                token = event.token,
                "resource event"
            );
        }
    }
}

/// Poll the filesystem monitor and feed events into autoimport.
pub async fn autoimport_pump(
    module: Arc<ResourceModule>,
    mut monitor: Box<dyn rp_engine::FsMonitor>,
    interval: Duration,
) {
    let mut tick = tokio::time::interval(interval);
    loop {
        tick.tick().await;
        let events = monitor.poll();
        if events.is_empty() {
            continue;
        }
        let engine = module.engine().clone();
        let handled = tokio::task::spawn_blocking(move || {
            let mut imported = Vec::new();
            for event in &events {
                match engine.handle_fs_event(event) {
                    Ok(Some(uuid)) => imported.push(uuid),
                    Ok(None) => {}
                    Err(err) => {
                        warn!(path = %event.path.display(), %err, "autoimport failed");
                    }
                }
            }
            imported
        })
        .await
        .unwrap_or_default();
        for uuid in handled {
            info!(%uuid, "autoimported");
        }
    }
}
