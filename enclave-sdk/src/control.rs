//! Container management messages sent by the isolation backend to a guest.

use crate::error::{GuestError, GuestResult};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Acknowledges a control message once the guest has applied it.
pub type Ack = oneshot::Sender<GuestResult<()>>;

/// Where a script element's content comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptSource {
    Inline(String),
    Url(String),
}

/// A script element to inject into the container document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptElement {
    pub id: String,
    pub source: ScriptSource,
    pub integrity: Option<String>,
    pub cross_origin: Option<String>,
    /// Module script (`type="module"`) rather than a classic script.
    pub module: bool,
}

#[derive(Debug)]
pub enum ControlMessage {
    /// Writes entry source into the document and loads it.
    WriteDocument { source: String, ack: Ack },
    /// Fetches entry source from a URL and loads it.
    LoadUrl { url: String, ack: Ack },
    ApplyCsp { policy: String, ack: Ack },
    /// Starts periodic telemetry samples.
    InstallReporter { interval: Duration, ack: Ack },
    InjectScript { element: ScriptElement, ack: Ack },
    InjectStyles { id: String, css: String, ack: Ack },
    RemoveElement { id: String, ack: Ack },
    /// Runs `on_unload`, stops the reporter and closes the bus.
    Detach { ack: Ack },
}

/// Backend-side handle to a running guest.
#[derive(Debug)]
pub struct GuestHandle {
    control: mpsc::Sender<ControlMessage>,
    ready: Option<oneshot::Receiver<GuestResult<()>>>,
    task: JoinHandle<()>,
}

impl GuestHandle {
    pub(crate) fn new(
        control: mpsc::Sender<ControlMessage>,
        ready: oneshot::Receiver<GuestResult<()>>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            control,
            ready: Some(ready),
            task,
        }
    }

    /// Resolves once the guest has finished booting. Only the first call waits.
    pub async fn loaded(&mut self) -> GuestResult<()> {
        match self.ready.take() {
            Some(rx) => rx.await.map_err(|_| GuestError::Detached)?,
            None => Ok(()),
        }
    }

    /// Sends a control message and waits for its acknowledgement.
    pub async fn request(&self, build: impl FnOnce(Ack) -> ControlMessage) -> GuestResult<()> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(build(tx))
            .await
            .map_err(|_| GuestError::Detached)?;
        rx.await.map_err(|_| GuestError::Detached)?
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Kills the guest task without running `on_unload`.
    pub fn abort(&self) {
        self.task.abort();
    }
}
