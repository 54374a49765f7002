// Map Session: owns the rendering surface and its lifecycle.
//
//   Uninitialized -> Initializing -> Ready -> Destroyed
//                         |
//                         +-> Errored (terminal, never retried)

use serde::Serialize;

use crate::error::{RenderError, SessionError};
use crate::render::{RenderSurface, Viewport};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "message", rename_all = "lowercase")]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    Destroyed,
    Errored(String),
}

#[derive(Debug)]
pub struct MapSession<R: RenderSurface> {
    surface: R,
    state: SessionState,
    credential: String,
    viewport: Viewport,
}

impl<R: RenderSurface> MapSession<R> {
    pub fn new(surface: R, credential: impl Into<String>, viewport: Viewport) -> Self {
        Self {
            surface,
            state: SessionState::Uninitialized,
            credential: credential.into(),
            viewport,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// True once the session can no longer become ready.
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, SessionState::Destroyed | SessionState::Errored(_))
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    /// Starts loading the renderer. A load failure moves the session to
    /// `Errored` and is reported as a user-visible message.
    pub fn initialize(&mut self) -> Result<(), SessionError> {
        match &self.state {
            SessionState::Uninitialized => {}
            SessionState::Destroyed => return Err(SessionError::Destroyed),
            SessionState::Errored(message) => return Err(SessionError::Errored(message.clone())),
            _ => return Err(SessionError::AlreadyInitialized),
        }

        self.state = SessionState::Initializing;
        let result = if self.credential.trim().is_empty() {
            Err(RenderError::Credential)
        } else {
            self.surface.load(&self.credential, self.viewport)
        };

        match result {
            Ok(()) => {
                tracing::info!("map_session.initializing");
                Ok(())
            }
            Err(err) => {
                let message = err.to_string();
                tracing::error!(error = %err, "map_session.errored");
                self.state = SessionState::Errored(message.clone());
                Err(SessionError::Errored(message))
            }
        }
    }

    /// Signals that the base style finished loading.
    ///
    /// Returns `true` on the single `Initializing -> Ready` transition and
    /// `false` if the session was already ready.
    pub fn mark_style_loaded(&mut self) -> Result<bool, SessionError> {
        match &self.state {
            SessionState::Initializing => {
                self.state = SessionState::Ready;
                tracing::info!("map_session.ready");
                Ok(true)
            }
            SessionState::Ready => Ok(false),
            SessionState::Uninitialized => Err(SessionError::NotInitializing),
            SessionState::Destroyed => Err(SessionError::Destroyed),
            SessionState::Errored(message) => Err(SessionError::Errored(message.clone())),
        }
    }

    /// Mutable surface access, only while the session is ready.
    pub fn surface_mut(&mut self) -> Option<&mut R> {
        if self.is_ready() {
            Some(&mut self.surface)
        } else {
            None
        }
    }

    pub fn surface(&self) -> &R {
        &self.surface
    }

    pub fn set_viewport(&mut self, viewport: Viewport) -> Result<(), RenderError> {
        self.viewport = viewport;
        match self.surface_mut() {
            Some(surface) => surface.set_viewport(viewport),
            None => Ok(()),
        }
    }

    /// Moves to `Destroyed`. Callers release their layers beforehand; the
    /// session cannot be revived afterwards.
    pub fn destroy(&mut self) {
        if self.state != SessionState::Destroyed {
            tracing::info!(previous = ?self.state, "map_session.destroyed");
            self.state = SessionState::Destroyed;
        }
    }
}
