use crate::models::{PlayerData, UserSnapshot};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurfaceId(pub u64);

/// Host-side handle to the DOM node (or equivalent) the game renders into.
#[derive(Clone, Debug)]
pub struct ContainerHandle {
    pub id: String,
    pub attached: bool,
}

impl ContainerHandle {
    pub fn attached(id: impl Into<String>) -> ContainerHandle {
        ContainerHandle {
            id: id.into(),
            attached: true,
        }
    }

    pub fn detached(id: impl Into<String>) -> ContainerHandle {
        ContainerHandle {
            id: id.into(),
            attached: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("caller is not authenticated")]
    NotAuthenticated,
    #[error("container {0} is not attached to the document")]
    ContainerDetached(String),
    #[error("no active session")]
    NoSession,
    #[error("render backend failure: {0}")]
    Backend(String),
}

/// Seam to the actual engine. The manager owns the lifecycle; the backend
/// owns surfaces and the shared registry.
pub trait RenderBackend {
    fn create_surface(
        &mut self,
        container: &ContainerHandle,
        width: u32,
        height: u32,
        debug: bool,
    ) -> Result<SurfaceId, SessionError>;

    fn resize_surface(&mut self, surface: SurfaceId, width: u32, height: u32)
        -> Result<(), SessionError>;

    fn write_registry(&mut self, surface: SurfaceId, player: &PlayerData)
        -> Result<(), SessionError>;

    fn destroy_surface(&mut self, surface: SurfaceId);
}

#[derive(Clone, Debug)]
pub struct GameSession {
    surface: SurfaceId,
    player_id: String,
    width: u32,
    height: u32,
    debug: bool,
}

impl GameSession {
    pub fn surface(&self) -> SurfaceId {
        self.surface
    }

    pub fn player_id(&self) -> &str {
        &self.player_id
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn debug(&self) -> bool {
        self.debug
    }
}

/// Owns at most one live game session. Any new session tears down the
/// previous one first, so two mounted views can never share an engine.
pub struct GameSessionManager<B> {
    backend: B,
    active: Option<GameSession>,
}

impl<B: RenderBackend> GameSessionManager<B> {
    pub fn new(backend: B) -> GameSessionManager<B> {
        GameSessionManager {
            backend,
            active: None,
        }
    }

    pub fn session(&self) -> Option<&GameSession> {
        self.active.as_ref()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn initialize(
        &mut self,
        user: Option<&UserSnapshot>,
        container: &ContainerHandle,
        width: u32,
        height: u32,
        debug: bool,
    ) -> Result<&GameSession, SessionError> {
        self.destroy();

        let user = user.ok_or(SessionError::NotAuthenticated)?;
        if !container.attached {
            return Err(SessionError::ContainerDetached(container.id.clone()));
        }

        let surface = self.backend.create_surface(container, width, height, debug)?;
        let player = PlayerData::for_user(user);
        if let Err(err) = self.backend.write_registry(surface, &player) {
            self.backend.destroy_surface(surface);
            return Err(err);
        }

        log::info!(
            "game session started for {} on container {}",
            player.username,
            container.id
        );

        Ok(self.active.insert(GameSession {
            surface,
            player_id: player.id,
            width,
            height,
            debug,
        }))
    }

    /// Overwrites the registry snapshot without restarting the engine.
    /// Safe to call repeatedly.
    pub fn inject_player_data(&mut self, player: &PlayerData) -> Result<(), SessionError> {
        let session = self.active.as_mut().ok_or(SessionError::NoSession)?;
        self.backend.write_registry(session.surface, player)?;
        session.player_id = player.id.clone();
        Ok(())
    }

    /// Resizes the existing surface in place. Never creates a second one.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), SessionError> {
        let session = self.active.as_mut().ok_or(SessionError::NoSession)?;
        self.backend.resize_surface(session.surface, width, height)?;
        session.width = width;
        session.height = height;
        Ok(())
    }

    /// Idempotent teardown. Must run on every navigation away, including
    /// after a failed initialize.
    pub fn destroy(&mut self) {
        if let Some(session) = self.active.take() {
            self.backend.destroy_surface(session.surface);
        }
    }

    /// Full teardown, then a fresh initialize.
    pub fn restart(
        &mut self,
        user: Option<&UserSnapshot>,
        container: &ContainerHandle,
        width: u32,
        height: u32,
        debug: bool,
    ) -> Result<&GameSession, SessionError> {
        self.destroy();
        self.initialize(user, container, width, height, debug)
    }
}
