//! Reconnecting push channel for project snapshots.
//!
//! [`ChannelManager::open`] starts one background connection per project and
//! hands back a [`SnapshotChannel`]. Consumers read a single continuous stream
//! of [`RawSnapshot`]s; dropped connections are re-established behind it with
//! [`Backoff`]. Nothing is deduplicated here, a reconnect may well redeliver
//! the snapshot that was last seen.

mod backoff;
mod ws;

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use studio_core::{ProjectId, RawSnapshot};

pub use backoff::{Backoff, ReconnectPolicy};
pub use ws::WsConnector;

/// Snapshots buffered between the connection task and the consumer.
const SNAPSHOT_BUFFER: usize = 32;

/// Connection-level failures. Always recovered by reconnecting.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },

    #[error("connection attempt timed out")]
    Timeout,

    #[error("connection dropped: {0}")]
    Dropped(String),
}

/// One inbound message on an established connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// The server closed the connection.
    Close,
}

pub type FrameStream = BoxStream<'static, Result<Frame, TransportError>>;

/// Opens push connections for a project.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, project_id: &ProjectId)
        -> BoxFuture<'static, Result<FrameStream, TransportError>>;
}

/// Connectivity as shown to the user. Only ever a transient indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Connecting,
    Connected,
    /// Waiting to retry after `attempt` consecutive failures.
    Reconnecting { attempt: u32 },
    Closed,
}

impl ChannelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Closed => "closed",
        }
    }
}

/// Creates [`SnapshotChannel`]s sharing one connector and reconnect policy.
pub struct ChannelManager<C> {
    connector: Arc<C>,
    policy: ReconnectPolicy,
}

impl<C> Clone for ChannelManager<C> {
    fn clone(&self) -> Self {
        Self {
            connector: Arc::clone(&self.connector),
            policy: self.policy.clone(),
        }
    }
}

impl<C: Connector> ChannelManager<C> {
    pub fn new(connector: C, policy: ReconnectPolicy) -> Self {
        Self {
            connector: Arc::new(connector),
            policy,
        }
    }

    /// Start delivering snapshots for `project_id`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(&self, project_id: ProjectId) -> SnapshotChannel {
        let (snapshot_tx, snapshots) = mpsc::channel(SNAPSHOT_BUFFER);
        let (status_tx, status) = watch::channel(ChannelStatus::Connecting);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(run_connection(
            Arc::clone(&self.connector),
            project_id.clone(),
            self.policy.clone(),
            snapshot_tx,
            status_tx,
            shutdown_rx,
        ));

        SnapshotChannel {
            project_id,
            snapshots,
            status,
            shutdown: Some(shutdown_tx),
            task,
        }
    }
}

/// An open push channel for one project.
///
/// The connection is released when the channel is closed or dropped.
pub struct SnapshotChannel {
    project_id: ProjectId,
    snapshots: mpsc::Receiver<RawSnapshot>,
    status: watch::Receiver<ChannelStatus>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SnapshotChannel {
    /// Next snapshot, across reconnects. `None` once the channel is closed.
    pub async fn next(&mut self) -> Option<RawSnapshot> {
        self.snapshots.recv().await
    }

    pub fn status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }

    /// Stop reconnecting and wait for the connection task to finish.
    pub async fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(e) = (&mut self.task).await {
            if !e.is_cancelled() {
                tracing::error!("Channel task for project {} panicked: {}", self.project_id, e);
            }
        }
    }
}

impl Drop for SnapshotChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum PumpEnd {
    Shutdown,
    ConsumerGone,
    Disconnected(String),
}

async fn run_connection<C: Connector>(
    connector: Arc<C>,
    project_id: ProjectId,
    policy: ReconnectPolicy,
    snapshots: mpsc::Sender<RawSnapshot>,
    status: watch::Sender<ChannelStatus>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut backoff = Backoff::new(policy.clone());

    loop {
        let attempt =
            tokio::time::timeout(policy.connect_timeout, connector.connect(&project_id));

        let outcome = tokio::select! {
            _ = &mut shutdown => break,
            outcome = attempt => outcome,
        };

        let reason = match outcome {
            Ok(Ok(frames)) => {
                tracing::info!("Push channel connected for project {}", project_id);
                backoff.reset();
                status.send_replace(ChannelStatus::Connected);

                match pump(frames, &snapshots, &mut shutdown).await {
                    PumpEnd::Shutdown => break,
                    PumpEnd::ConsumerGone => {
                        tracing::debug!("Snapshot consumer for project {} went away", project_id);
                        break;
                    }
                    PumpEnd::Disconnected(reason) => reason,
                }
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => TransportError::Timeout.to_string(),
        };

        let delay = backoff.next_delay();
        tracing::info!(
            "Push channel for project {} disconnected ({}), retrying in {:?}",
            project_id,
            reason,
            delay
        );
        status.send_replace(ChannelStatus::Reconnecting {
            attempt: backoff.attempt(),
        });

        tokio::select! {
            _ = &mut shutdown => break,
            _ = tokio::time::sleep(delay) => {}
        }
        status.send_replace(ChannelStatus::Connecting);
    }

    tracing::info!("Push channel for project {} closed", project_id);
    status.send_replace(ChannelStatus::Closed);
}

async fn pump(
    mut frames: FrameStream,
    snapshots: &mpsc::Sender<RawSnapshot>,
    shutdown: &mut oneshot::Receiver<()>,
) -> PumpEnd {
    loop {
        let frame = tokio::select! {
            _ = &mut *shutdown => return PumpEnd::Shutdown,
            frame = frames.next() => frame,
        };

        match frame {
            Some(Ok(Frame::Text(text))) => match serde_json::from_str(&text) {
                Ok(payload) => {
                    if snapshots.send(RawSnapshot::new(payload)).await.is_err() {
                        return PumpEnd::ConsumerGone;
                    }
                }
                Err(e) => {
                    tracing::warn!("Dropping unparseable push payload ({} bytes): {}", text.len(), e);
                }
            },
            Some(Ok(Frame::Close)) => return PumpEnd::Disconnected("closed by server".into()),
            Some(Err(e)) => return PumpEnd::Disconnected(e.to_string()),
            None => return PumpEnd::Disconnected("stream ended".into()),
        }
    }
}
