//! One live session per open project.
//!
//! A session owns the push channel, the reconciler and the in-flight
//! requests for a project. All mutation happens on a single task, so a
//! snapshot, a request result and a stale sweep never interleave within a
//! pass. The view layer only ever sees published [`ViewState`]s.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use studio_core::{Action, ActionId, ProjectId, RawSnapshot, Reconciler, Retired};

use crate::channel::{ChannelManager, ChannelStatus, Connector, SnapshotChannel};
use crate::client::{ClientError, Dispatcher};
use crate::view::{Notice, ViewProjection, ViewState};

const COMMAND_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Age after which a pending action is reported with an unknown outcome.
    pub stale_after: Duration,
    /// How often stale actions are swept when no snapshot arrives.
    pub sweep_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stale_after: studio_core::reconcile::DEFAULT_STALE_AFTER,
            sweep_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session for project {0} is closed")]
    Closed(ProjectId),
}

enum Command {
    Submit {
        action: Action,
        reply: oneshot::Sender<ActionId>,
    },
}

/// Handle to a running project session.
///
/// Dropping the handle stops the session; [`ProjectSession::close`] does the
/// same but waits for the push channel to shut down.
pub struct ProjectSession {
    project_id: ProjectId,
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<ViewState>,
    notices: mpsc::UnboundedReceiver<Notice>,
    backlog: VecDeque<Notice>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ProjectSession {
    /// Open the push channel for `project_id` and start reconciling.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open<C: Connector, D: Dispatcher>(
        project_id: ProjectId,
        channels: &ChannelManager<C>,
        dispatcher: Arc<D>,
        config: SessionConfig,
    ) -> Self {
        let channel = channels.open(project_id.clone());
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (view_tx, view) = watch::channel(ViewState::initial(project_id.clone()));
        let (notices_tx, notices) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (responses_tx, responses_rx) = mpsc::unbounded_channel();

        let status = channel.status();
        let session = SessionTask {
            reconciler: Reconciler::new(project_id.clone(), config.stale_after),
            dispatcher,
            responses: responses_tx,
            view: view_tx,
            notices: notices_tx,
            status: *status.borrow(),
            revision: 0,
        };

        let task = tokio::spawn(session.run(
            channel,
            status,
            commands_rx,
            responses_rx,
            shutdown_rx,
            config.sweep_interval,
        ));

        tracing::info!("Opened session for project {}", project_id);

        Self {
            project_id,
            commands: commands_tx,
            view,
            notices,
            backlog: VecDeque::new(),
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    /// Register `action` as pending and send its request.
    ///
    /// Returns once the action is pending, without waiting for the server.
    pub async fn submit(&self, action: Action) -> Result<ActionId, SessionError> {
        let (reply, id) = oneshot::channel();
        self.commands
            .send(Command::Submit { action, reply })
            .await
            .map_err(|_| self.closed())?;
        id.await.map_err(|_| self.closed())
    }

    /// Subscribe to published states.
    pub fn view(&self) -> watch::Receiver<ViewState> {
        self.view.clone()
    }

    pub fn current(&self) -> ViewState {
        self.view.borrow().clone()
    }

    /// Wait until the first snapshot has been applied.
    pub async fn wait_until_loaded(&self) -> Result<ViewState, SessionError> {
        let mut view = self.view.clone();
        let state = view
            .wait_for(|state| state.loaded)
            .await
            .map_err(|_| self.closed())?;
        Ok(state.clone())
    }

    /// Next resolved action. `None` once the session has stopped.
    pub async fn next_notice(&mut self) -> Option<Notice> {
        if let Some(notice) = self.backlog.pop_front() {
            return Some(notice);
        }
        self.notices.recv().await
    }

    /// Wait for the action `id` to be resolved.
    ///
    /// Notices for other actions received meanwhile stay queued for
    /// [`ProjectSession::next_notice`].
    pub async fn wait_for(&mut self, id: ActionId) -> Result<Notice, SessionError> {
        if let Some(position) = self.backlog.iter().position(|n| n.action().id == id) {
            if let Some(notice) = self.backlog.remove(position) {
                return Ok(notice);
            }
        }
        loop {
            match self.notices.recv().await {
                Some(notice) if notice.action().id == id => return Ok(notice),
                Some(other) => self.backlog.push_back(other),
                None => return Err(self.closed()),
            }
        }
    }

    /// Drive `projection` with every published state and notice until the
    /// session stops.
    pub async fn run_view<V: ViewProjection>(&mut self, projection: &mut V) {
        let mut states = self.view.clone();
        let initial = states.borrow_and_update().clone();
        projection.render(&initial);

        loop {
            tokio::select! {
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = states.borrow_and_update().clone();
                    projection.render(&state);
                }
                Some(notice) = self.next_notice() => projection.notify(&notice),
            }
        }

        while let Ok(notice) = self.notices.try_recv() {
            projection.notify(&notice);
        }
    }

    /// Stop the session and release the push channel.
    pub async fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(e) = (&mut self.task).await {
            if !e.is_cancelled() {
                tracing::error!("Session for project {} panicked: {}", self.project_id, e);
            }
        }
    }

    fn closed(&self) -> SessionError {
        SessionError::Closed(self.project_id.clone())
    }
}

impl Drop for ProjectSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ============================================================
// Session task
// ============================================================

type Response = (ActionId, Result<(), ClientError>);

struct SessionTask<D> {
    reconciler: Reconciler,
    dispatcher: Arc<D>,
    responses: mpsc::UnboundedSender<Response>,
    view: watch::Sender<ViewState>,
    notices: mpsc::UnboundedSender<Notice>,
    status: ChannelStatus,
    revision: u64,
}

impl<D: Dispatcher> SessionTask<D> {
    async fn run(
        mut self,
        mut channel: SnapshotChannel,
        mut status: watch::Receiver<ChannelStatus>,
        mut commands: mpsc::Receiver<Command>,
        mut responses: mpsc::UnboundedReceiver<Response>,
        mut shutdown: oneshot::Receiver<()>,
        sweep_interval: Duration,
    ) {
        let mut sweep = tokio::time::interval(sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut status_open = true;

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                snapshot = channel.next() => match snapshot {
                    Some(raw) => self.on_snapshot(&raw),
                    None => break,
                },
                command = commands.recv() => match command {
                    Some(Command::Submit { action, reply }) => {
                        let id = self.on_submit(action);
                        let _ = reply.send(id);
                    }
                    None => break,
                },
                Some((id, result)) = responses.recv() => self.on_response(id, result),
                changed = status.changed(), if status_open => {
                    if changed.is_err() {
                        status_open = false;
                        continue;
                    }
                    let next = *status.borrow_and_update();
                    if next != self.status {
                        self.status = next;
                        self.publish();
                    }
                }
                _ = sweep.tick() => self.on_sweep(),
            }
        }

        channel.close().await;
        self.status = ChannelStatus::Closed;
        self.publish();
        tracing::info!("Closed session for project {}", self.reconciler.project().id);
    }

    fn on_snapshot(&mut self, raw: &RawSnapshot) {
        let was_loaded = self.reconciler.is_loaded();
        // Malformed snapshots are logged by the reconciler and change nothing
        let Ok(reconciliation) = self.reconciler.apply(raw, Utc::now()) else {
            return;
        };
        if reconciliation.is_noop() && was_loaded {
            tracing::debug!("Snapshot for project {} changed nothing", self.reconciler.project().id);
            return;
        }
        self.publish();
        self.announce(reconciliation.retired);
    }

    fn on_submit(&mut self, action: Action) -> ActionId {
        let project_id = self.reconciler.project().id.clone();
        let id = self.reconciler.register(action.clone(), Utc::now());
        self.publish();

        let request = self.dispatcher.submit(project_id, action);
        let responses = self.responses.clone();
        tokio::spawn(async move {
            let result = request.await;
            // The session may be gone by now
            let _ = responses.send((id, result));
        });
        id
    }

    fn on_response(&mut self, id: ActionId, result: Result<(), ClientError>) {
        match result {
            Ok(()) => tracing::debug!("Request for {} accepted", id),
            Err(e) => match self.reconciler.fail(id, e.to_string(), Utc::now()) {
                Some(retired) => {
                    self.publish();
                    self.announce(vec![retired]);
                }
                None => tracing::debug!("Ignoring failure for already retired {}: {}", id, e),
            },
        }
    }

    fn on_sweep(&mut self) {
        let expired = self.reconciler.expire(Utc::now());
        if !expired.is_empty() {
            self.publish();
            self.announce(expired);
        }
    }

    fn publish(&mut self) {
        self.revision += 1;
        self.view.send_replace(ViewState {
            project: Arc::new(self.reconciler.project().clone()),
            pending: self.reconciler.pending().into(),
            status: self.status,
            loaded: self.reconciler.is_loaded(),
            revision: self.revision,
        });
    }

    fn announce(&self, retired: Vec<Retired>) {
        for r in retired {
            let _ = self.notices.send(Notice::from(r));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use futures::channel::mpsc as frames;
    use futures::future::BoxFuture;
    use futures::{FutureExt, StreamExt};
    use serde_json::json;
    use studio_core::{EntityId, UnknownReason};

    use crate::channel::{Frame, FrameStream, ReconnectPolicy, TransportError};

    type FrameSender = frames::UnboundedSender<Result<Frame, TransportError>>;

    /// Hands out one in-memory connection, then stays silent.
    struct MemoryConnector {
        connection: Mutex<Option<frames::UnboundedReceiver<Result<Frame, TransportError>>>>,
    }

    impl Connector for MemoryConnector {
        fn connect(
            &self,
            _project_id: &ProjectId,
        ) -> BoxFuture<'static, Result<FrameStream, TransportError>> {
            let connection = self.connection.lock().unwrap().take();
            async move {
                match connection {
                    Some(rx) => Ok(rx.boxed()),
                    None => Ok(futures::stream::pending().boxed()),
                }
            }
            .boxed()
        }
    }

    type Responder = oneshot::Sender<Result<(), ClientError>>;

    /// Passes every request to the test, which decides when and how it ends.
    struct GatedDispatcher {
        requests: mpsc::UnboundedSender<(Action, Responder)>,
    }

    impl Dispatcher for GatedDispatcher {
        fn submit(
            &self,
            _project_id: ProjectId,
            action: Action,
        ) -> BoxFuture<'static, Result<(), ClientError>> {
            let (responder, response) = oneshot::channel();
            let _ = self.requests.send((action, responder));
            async move { response.await.unwrap_or(Ok(())) }.boxed()
        }
    }

    struct Harness {
        session: ProjectSession,
        push: FrameSender,
        requests: mpsc::UnboundedReceiver<(Action, Responder)>,
    }

    impl Harness {
        fn open(config: SessionConfig) -> Self {
            let (push, connection) = frames::unbounded();
            let connector = MemoryConnector {
                connection: Mutex::new(Some(connection)),
            };
            let channels = ChannelManager::new(connector, ReconnectPolicy::default());
            let (requests_tx, requests) = mpsc::unbounded_channel();
            let dispatcher = Arc::new(GatedDispatcher {
                requests: requests_tx,
            });
            let session = ProjectSession::open(EntityId::from(7), &channels, dispatcher, config);
            Self {
                session,
                push,
                requests,
            }
        }

        fn push(&self, payload: serde_json::Value) {
            self.push
                .unbounded_send(Ok(Frame::Text(payload.to_string())))
                .unwrap();
        }

        async fn request(&mut self) -> (Action, Responder) {
            within(self.requests.recv()).await.expect("dispatcher dropped")
        }
    }

    async fn within<F: std::future::Future>(future: F) -> F::Output {
        tokio::time::timeout(Duration::from_secs(5), future)
            .await
            .expect("timed out")
    }

    fn one_haiku(critiques: usize) -> serde_json::Value {
        let critiques: Vec<_> = (0..critiques)
            .map(|_| json!({ "creativity": 5, "vocabulary_density": 5, "rizz_level": 5 }))
            .collect();
        json!({
            "project_id": 7,
            "name": "Seasons",
            "haikus": [{ "id": 1, "text": "old pond", "critiques": critiques }]
        })
    }

    fn critique() -> Action {
        Action::Critique {
            haiku_id: EntityId::from(1),
        }
    }

    #[tokio::test]
    async fn snapshot_completes_a_pending_action() {
        let mut h = Harness::open(SessionConfig::default());
        h.push(one_haiku(0));
        within(h.session.wait_until_loaded()).await.unwrap();

        let id = h.session.submit(critique()).await.unwrap();
        assert!(h.session.current().is_pending(&EntityId::from(1)));

        let (action, responder) = h.request().await;
        assert_eq!(action, critique());
        responder.send(Ok(())).unwrap();

        h.push(one_haiku(1));
        match within(h.session.wait_for(id)).await.unwrap() {
            Notice::Completed { action } => assert_eq!(action.id, id),
            other => panic!("expected completion, got {:?}", other),
        }
        assert!(h.session.current().pending.is_empty());
        assert_eq!(h.session.current().project.haikus[0].critiques.len(), 1);
    }

    #[tokio::test]
    async fn action_submitted_before_loading_is_not_completed_by_the_first_snapshot() {
        let mut h = Harness::open(SessionConfig::default());
        let id = h
            .session
            .submit(Action::CreateHaiku {
                description: "d".to_string(),
            })
            .await
            .unwrap();
        let (_, responder) = h.request().await;
        responder.send(Ok(())).unwrap();

        h.push(one_haiku(0));
        let loaded = within(h.session.wait_until_loaded()).await.unwrap();
        assert_eq!(loaded.pending.len(), 1);
        assert_eq!(loaded.pending[0].id, id);

        h.push(json!({
            "project_id": 7,
            "haikus": [{ "id": 1, "text": "old pond" }, { "id": 2, "text": "new" }]
        }));
        match within(h.session.wait_for(id)).await.unwrap() {
            Notice::Completed { action } => assert_eq!(action.id, id),
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn failed_request_is_reported() {
        let mut h = Harness::open(SessionConfig::default());
        h.push(one_haiku(0));
        within(h.session.wait_until_loaded()).await.unwrap();

        let id = h.session.submit(critique()).await.unwrap();
        let (_, responder) = h.request().await;
        responder
            .send(Err(ClientError::Server("500 Internal Server Error".into())))
            .unwrap();

        match within(h.session.wait_for(id)).await.unwrap() {
            Notice::Failed { reason, .. } => assert!(reason.contains("500")),
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(!h.session.current().is_pending(&EntityId::from(1)));
    }

    #[tokio::test]
    async fn unanswered_action_goes_stale() {
        let mut h = Harness::open(SessionConfig {
            stale_after: Duration::from_millis(50),
            sweep_interval: Duration::from_millis(10),
        });
        h.push(one_haiku(0));
        within(h.session.wait_until_loaded()).await.unwrap();

        let id = h.session.submit(critique()).await.unwrap();
        let (_, _responder) = h.request().await;

        match within(h.session.wait_for(id)).await.unwrap() {
            Notice::OutcomeUnknown { reason, .. } => assert_eq!(reason, UnknownReason::Stale),
            other => panic!("expected unknown outcome, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn malformed_snapshot_keeps_previous_state() {
        let h = Harness::open(SessionConfig::default());
        let mut view = h.session.view();
        h.push(one_haiku(0));
        within(view.wait_for(|s| s.loaded)).await.unwrap();
        let before = h.session.current();

        h.push(json!(["not", "a", "project"]));
        h.push(json!({ "project_id": 7, "name": "Renamed", "haikus": [] }));
        let after = within(view.wait_for(|s| s.project.name == "Renamed"))
            .await
            .unwrap()
            .clone();

        assert_eq!(before.project.haikus.len(), 1);
        assert!(after.project.haikus.is_empty());
        assert!(after.revision > before.revision);
    }

    #[tokio::test]
    async fn notices_for_other_actions_stay_queued() {
        let mut h = Harness::open(SessionConfig::default());
        h.push(json!({
            "project_id": 7,
            "haikus": [{ "id": 1, "text": "a" }, { "id": 2, "text": "b" }]
        }));
        within(h.session.wait_until_loaded()).await.unwrap();

        let first = h.session.submit(critique()).await.unwrap();
        let second = h
            .session
            .submit(Action::Critique {
                haiku_id: EntityId::from(2),
            })
            .await
            .unwrap();
        let (_, r1) = h.request().await;
        let (_, r2) = h.request().await;
        r1.send(Err(ClientError::Unauthorized)).unwrap();
        r2.send(Err(ClientError::Unauthorized)).unwrap();

        let resolved = within(h.session.wait_for(second)).await.unwrap();
        assert_eq!(resolved.action().id, second);
        let queued = within(h.session.next_notice()).await.unwrap();
        assert_eq!(queued.action().id, first);
    }

    #[tokio::test]
    async fn late_response_after_close_is_dropped() {
        let mut h = Harness::open(SessionConfig::default());
        h.push(one_haiku(0));
        within(h.session.wait_until_loaded()).await.unwrap();
        let mut view = h.session.view();

        h.session.submit(critique()).await.unwrap();
        let (_, responder) = h.request().await;

        within(h.session.close()).await;
        assert_eq!(view.borrow_and_update().status, ChannelStatus::Closed);

        // The request future is still alive and completes into nothing
        responder.send(Ok(())).unwrap();
        tokio::task::yield_now().await;
        assert!(view.has_changed().is_err());
    }

    #[tokio::test]
    async fn close_stops_the_session() {
        let h = Harness::open(SessionConfig::default());
        let commands = h.session.commands.clone();
        let view = h.session.view();
        within(h.session.close()).await;

        assert!(commands.is_closed());
        assert!(view.has_changed().is_err());
    }
}
