// Overlay engine task.
//
// The overlay is owned by a single task; pollers and HTTP handlers talk to
// it through `OverlayHandle`. Commands are applied strictly in arrival order,
// so no two reconciliation passes on the same layer ever interleave.

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::error::{EngineError, FetchFailure};
use crate::models::{EntityKind, LngLat, Snapshot};
use crate::overlay::{ApplyOutcome, EventOutcome, Overlay, OverlayStatus};
use crate::reconciler::ReconcileReport;
use crate::render::{EventKind, FeatureHandle, LayerEvent, RenderSurface};

const COMMAND_BUFFER: usize = 64;

pub enum OverlayCommand {
    Snapshot {
        kind: EntityKind,
        outcome: Result<Snapshot, FetchFailure>,
        reply: Option<oneshot::Sender<ApplyOutcome>>,
    },
    SetVisibility {
        kind: EntityKind,
        visible: bool,
        reply: oneshot::Sender<Option<ReconcileReport>>,
    },
    SetViewport {
        center: LngLat,
        zoom: f64,
        reply: oneshot::Sender<Option<ReconcileReport>>,
    },
    Pointer {
        handle: FeatureHandle,
        event: EventKind,
        reply: oneshot::Sender<Option<EventOutcome>>,
    },
    Event {
        event: LayerEvent,
        reply: oneshot::Sender<Option<EventOutcome>>,
    },
    ClosePopup {
        reply: oneshot::Sender<bool>,
    },
    Status {
        reply: oneshot::Sender<OverlayStatus>,
    },
    Scene {
        reply: oneshot::Sender<Option<Value>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable sender side of the engine.
#[derive(Clone)]
pub struct OverlayHandle {
    tx: mpsc::Sender<OverlayCommand>,
}

/// Creates the command channel. The receiver goes to `run_engine`.
pub fn channel() -> (OverlayHandle, mpsc::Receiver<OverlayCommand>) {
    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
    (OverlayHandle { tx }, rx)
}

impl OverlayHandle {
    async fn send(&self, command: OverlayCommand) -> Result<(), EngineError> {
        self.tx.send(command).await.map_err(|_| EngineError::Closed)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> OverlayCommand) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    /// Queues a fetch outcome without waiting for it to be applied.
    pub async fn submit(&self, kind: EntityKind, outcome: Result<Snapshot, FetchFailure>) -> Result<(), EngineError> {
        self.send(OverlayCommand::Snapshot {
            kind,
            outcome,
            reply: None,
        })
        .await
    }

    /// Like `submit`, but waits for the outcome.
    pub async fn apply(&self, kind: EntityKind, outcome: Result<Snapshot, FetchFailure>) -> Result<ApplyOutcome, EngineError> {
        self.request(|reply| OverlayCommand::Snapshot {
            kind,
            outcome,
            reply: Some(reply),
        })
        .await
    }

    pub async fn set_visibility(&self, kind: EntityKind, visible: bool) -> Result<Option<ReconcileReport>, EngineError> {
        self.request(|reply| OverlayCommand::SetVisibility { kind, visible, reply })
            .await
    }

    pub async fn set_viewport(&self, center: LngLat, zoom: f64) -> Result<Option<ReconcileReport>, EngineError> {
        self.request(|reply| OverlayCommand::SetViewport { center, zoom, reply })
            .await
    }

    pub async fn pointer(&self, handle: FeatureHandle, event: EventKind) -> Result<Option<EventOutcome>, EngineError> {
        self.request(|reply| OverlayCommand::Pointer { handle, event, reply })
            .await
    }

    pub async fn event(&self, event: LayerEvent) -> Result<Option<EventOutcome>, EngineError> {
        self.request(|reply| OverlayCommand::Event { event, reply }).await
    }

    pub async fn close_popup(&self) -> Result<bool, EngineError> {
        self.request(|reply| OverlayCommand::ClosePopup { reply }).await
    }

    pub async fn status(&self) -> Result<OverlayStatus, EngineError> {
        self.request(|reply| OverlayCommand::Status { reply }).await
    }

    pub async fn scene(&self) -> Result<Option<Value>, EngineError> {
        self.request(|reply| OverlayCommand::Scene { reply }).await
    }

    /// Tears the overlay down and stops the engine.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.request(|reply| OverlayCommand::Shutdown { reply }).await
    }
}

/// Runs until `Shutdown` arrives or every handle is dropped. The overlay is
/// torn down in both cases and returned for inspection.
pub async fn run_engine<R>(mut overlay: Overlay<R>, mut rx: mpsc::Receiver<OverlayCommand>) -> Overlay<R>
where
    R: RenderSurface,
{
    info!("engine.started");
    let mut shutdown_reply = None;

    while let Some(command) = rx.recv().await {
        match command {
            OverlayCommand::Snapshot { kind, outcome, reply } => {
                let applied = overlay.apply(kind, outcome);
                debug!(%kind, outcome = ?outcome_label(&applied), "engine.snapshot");
                if let Some(reply) = reply {
                    let _ = reply.send(applied);
                }
            }
            OverlayCommand::SetVisibility { kind, visible, reply } => {
                let _ = reply.send(overlay.set_visibility(kind, visible));
            }
            OverlayCommand::SetViewport { center, zoom, reply } => {
                let _ = reply.send(overlay.set_viewport(center, zoom));
            }
            OverlayCommand::Pointer { handle, event, reply } => {
                let _ = reply.send(overlay.dispatch(handle, event));
            }
            OverlayCommand::Event { event, reply } => {
                let _ = reply.send(overlay.handle_event(&event));
            }
            OverlayCommand::ClosePopup { reply } => {
                let _ = reply.send(overlay.close_popup());
            }
            OverlayCommand::Status { reply } => {
                let _ = reply.send(overlay.status());
            }
            OverlayCommand::Scene { reply } => {
                let _ = reply.send(overlay.surface().export());
            }
            OverlayCommand::Shutdown { reply } => {
                shutdown_reply = Some(reply);
                break;
            }
        }
    }

    overlay.teardown();
    info!("engine.stopped");
    if let Some(reply) = shutdown_reply {
        let _ = reply.send(());
    }
    overlay
}

fn outcome_label(outcome: &ApplyOutcome) -> &'static str {
    match outcome {
        ApplyOutcome::Applied(_) => "applied",
        ApplyOutcome::Buffered => "buffered",
        ApplyOutcome::Stored => "stored",
        ApplyOutcome::Retained => "retained",
        ApplyOutcome::Discarded => "discarded",
    }
}
