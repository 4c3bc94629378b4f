//! Worker version records and their lifecycle state machine.
//!
//! A [`Registration`] holds at most one installing, one waiting and one
//! active worker version. The transitions here are pure bookkeeping; the
//! asynchronous work that drives them (precaching, eviction) lives in
//! [`crate::worker`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::http::Url;

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of one worker version instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(u64);

impl WorkerId {
    fn next() -> Self {
        Self(NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker#{}", self.0)
    }
}

/// Identifier of a controlled client (an open page).
pub type ClientId = Uuid;

/// What a worker version serves: its cache generation and app shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerScript {
    /// Cache generation identifier.
    pub version: String,
    /// URLs cached atomically at install.
    pub manifest: Vec<Url>,
    /// Page served for failed navigations.
    pub offline_url: Url,
}

/// Lifecycle state of a worker version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Precaching its manifest.
    Installing,
    /// Installed and waiting for the previous version's clients to go away.
    Installed,
    /// Evicting old generations and claiming clients.
    Activating,
    /// Serving traffic.
    Activated,
    /// Superseded or failed; never serves again.
    Redundant,
}

/// Returns whether a worker may move from `from` to `to`.
#[must_use]
pub const fn is_valid_transition(from: WorkerState, to: WorkerState) -> bool {
    use WorkerState::{Activated, Activating, Installed, Installing, Redundant};
    matches!(
        (from, to),
        (Installing, Installed)
            | (Installed, Activating)
            | (Activating, Activated)
            | (Installing | Installed | Activating | Activated, Redundant)
    )
}

/// One worker version.
#[derive(Debug, Clone)]
pub struct WorkerVersion {
    id: WorkerId,
    script: WorkerScript,
    state: WorkerState,
}

impl WorkerVersion {
    fn new(script: WorkerScript) -> Self {
        Self {
            id: WorkerId::next(),
            script,
            state: WorkerState::Installing,
        }
    }

    /// Returns the worker's identifier.
    #[must_use]
    pub const fn id(&self) -> WorkerId {
        self.id
    }

    /// Returns the worker's script.
    #[must_use]
    pub const fn script(&self) -> &WorkerScript {
        &self.script
    }

    /// Returns the worker's cache generation identifier.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.script.version
    }

    /// Returns the worker's current state.
    #[must_use]
    pub const fn state(&self) -> WorkerState {
        self.state
    }

    fn transition(&mut self, to: WorkerState) -> Result<StateChange> {
        if !is_valid_transition(self.state, to) {
            return Err(Error::InvalidState(format!(
                "{} cannot move from {:?} to {to:?}",
                self.id, self.state
            )));
        }
        let change = StateChange {
            worker: self.id,
            version: self.script.version.clone(),
            from: self.state,
            to,
        };
        self.state = to;
        Ok(change)
    }
}

/// A recorded state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChange {
    /// Worker that moved.
    pub worker: WorkerId,
    /// Its cache generation identifier.
    pub version: String,
    /// Previous state.
    pub from: WorkerState,
    /// New state.
    pub to: WorkerState,
}

/// Where a freshly installed worker ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Another version is active and still has clients; this one waits.
    Waiting,
    /// Nothing blocks activation.
    ReadyToActivate,
}

/// The installing, waiting and active worker versions for one scope, plus
/// the clients the active version controls.
#[derive(Debug, Default)]
pub struct Registration {
    installing: Option<WorkerVersion>,
    waiting: Option<WorkerVersion>,
    active: Option<WorkerVersion>,
    clients: HashMap<ClientId, Option<WorkerId>>,
    skip_waiting: bool,
}

impl Registration {
    /// Creates an empty registration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the installing worker, if any.
    #[must_use]
    pub const fn installing(&self) -> Option<&WorkerVersion> {
        self.installing.as_ref()
    }

    /// Returns the waiting worker, if any.
    #[must_use]
    pub const fn waiting(&self) -> Option<&WorkerVersion> {
        self.waiting.as_ref()
    }

    /// Returns the active worker, if any.
    #[must_use]
    pub const fn active(&self) -> Option<&WorkerVersion> {
        self.active.as_ref()
    }

    /// Starts installing `script`. A previous installing worker becomes
    /// redundant.
    pub fn begin_install(&mut self, script: WorkerScript) -> (WorkerId, Vec<StateChange>) {
        let mut changes = Vec::new();
        if let Some(mut stale) = self.installing.take()
            && let Ok(change) = stale.transition(WorkerState::Redundant)
        {
            changes.push(change);
        }
        let worker = WorkerVersion::new(script);
        let id = worker.id;
        self.installing = Some(worker);
        self.skip_waiting = false;
        (id, changes)
    }

    /// Marks the install of `id` as failed. The active worker is untouched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if `id` is not the installing worker.
    pub fn install_failed(&mut self, id: WorkerId) -> Result<StateChange> {
        let mut worker = self.take_installing(id)?;
        worker.transition(WorkerState::Redundant)
    }

    /// Marks the install of `id` as complete and moves it to waiting. A
    /// worker that was already waiting becomes redundant.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if `id` is not the installing worker.
    pub fn install_succeeded(
        &mut self,
        id: WorkerId,
    ) -> Result<(InstallOutcome, Vec<StateChange>)> {
        let mut worker = self.take_installing(id)?;
        let mut changes = vec![worker.transition(WorkerState::Installed)?];
        if let Some(mut previous) = self.waiting.replace(worker)
            && let Ok(change) = previous.transition(WorkerState::Redundant)
        {
            changes.push(change);
        }

        let outcome = if self.skip_waiting || self.active.is_none() || self.clients.is_empty() {
            InstallOutcome::ReadyToActivate
        } else {
            InstallOutcome::Waiting
        };
        Ok((outcome, changes))
    }

    fn take_installing(&mut self, id: WorkerId) -> Result<WorkerVersion> {
        match self.installing.take() {
            Some(worker) if worker.id == id => Ok(worker),
            other => {
                self.installing = other;
                Err(Error::InvalidState(format!("{id} is not installing")))
            }
        }
    }

    /// Requests that the next (or current) waiting worker skips waiting.
    /// Returns true if a worker is waiting right now.
    pub fn skip_waiting(&mut self) -> bool {
        self.skip_waiting = true;
        self.waiting.is_some()
    }

    /// Moves the waiting worker to activating. The previous active worker
    /// becomes redundant. Returns `None` when nothing is waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the waiting worker cannot activate.
    pub fn begin_activation(&mut self) -> Result<Option<(WorkerScript, Vec<StateChange>)>> {
        let Some(mut worker) = self.waiting.take() else {
            return Ok(None);
        };
        let mut changes = vec![worker.transition(WorkerState::Activating)?];
        if let Some(mut old) = self.active.take()
            && let Ok(change) = old.transition(WorkerState::Redundant)
        {
            changes.push(change);
        }
        let script = worker.script.clone();
        self.active = Some(worker);
        self.skip_waiting = false;
        Ok(Some((script, changes)))
    }

    /// Completes activation of the active worker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if no worker is activating.
    pub fn finish_activation(&mut self) -> Result<StateChange> {
        match self.active.as_mut() {
            Some(worker) if worker.state == WorkerState::Activating => {
                worker.transition(WorkerState::Activated)
            }
            _ => Err(Error::InvalidState("no worker is activating".into())),
        }
    }

    /// Makes the active worker the controller of every client. Returns the
    /// clients whose controller changed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the active worker is activated.
    pub fn claim(&mut self) -> Result<Vec<ClientId>> {
        let active = match &self.active {
            Some(worker) if worker.state == WorkerState::Activated => worker.id,
            _ => return Err(Error::InvalidState("claim requires an activated worker".into())),
        };
        let changed = self
            .clients
            .iter_mut()
            .filter(|(_, controller)| **controller != Some(active))
            .map(|(id, controller)| {
                *controller = Some(active);
                *id
            })
            .collect();
        Ok(changed)
    }

    /// Adds a client. A new page is controlled by the activated worker, if any.
    pub fn add_client(&mut self) -> ClientId {
        let id = Uuid::new_v4();
        let controller = self
            .active
            .as_ref()
            .filter(|w| w.state == WorkerState::Activated)
            .map(|w| w.id);
        self.clients.insert(id, controller);
        id
    }

    /// Removes a client. Returns true if a waiting worker may now activate.
    pub fn remove_client(&mut self, id: ClientId) -> bool {
        self.clients.remove(&id);
        self.waiting.is_some() && self.clients.is_empty()
    }

    /// Returns the worker controlling `client`.
    #[must_use]
    pub fn controller_of(&self, client: ClientId) -> Option<WorkerId> {
        self.clients.get(&client).copied().flatten()
    }

    /// Returns the number of open clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}
