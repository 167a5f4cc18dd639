pub mod handler;

use std::fmt::{self, Display};

use tokio::sync::{mpsc, watch};

/// Progress records written by the engine driver while it works.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// A project resource changed state, e.g. `Container wp-db-1  Started`.
    Resource {
        kind: &'static str,
        name: String,
        status: String,
    },
    /// One record of an image pull stream.
    Pull {
        service: String,
        layer: Option<String>,
        status: String,
        progress: Option<String>,
    },
    Message(String),
}

impl Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressEvent::Resource { kind, name, status } => {
                write!(f, "{} {}  {}", kind, name, status)
            }
            ProgressEvent::Pull {
                service,
                layer,
                status,
                progress,
            } => {
                write!(f, "{}", service)?;
                if let Some(layer) = layer {
                    write!(f, " {}", layer)?;
                }
                write!(f, " {}", status)?;
                if let Some(progress) = progress {
                    write!(f, " {}", progress)?;
                }
                Ok(())
            }
            ProgressEvent::Message(msg) => write!(f, "{}", msg),
        }
    }
}

/// Sending half of the progress channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ProgressWriter {
    tx: Option<mpsc::Sender<ProgressEvent>>,
}

impl ProgressWriter {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx: Some(tx) }, rx)
    }

    /// A writer that drops everything.
    pub fn discard() -> Self {
        Self { tx: None }
    }

    /// Best effort: once the reader is gone events are dropped.
    pub async fn send(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event).await;
        }
    }

    pub async fn resource(&self, kind: &'static str, name: &str, status: &str) {
        self.send(ProgressEvent::Resource {
            kind,
            name: name.to_string(),
            status: status.to_string(),
        })
        .await
    }
}

/// Fires once to ask background tasks to wind down.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

/// Receiving side of a [`ShutdownTrigger`].
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when triggered or when the trigger is dropped.
    pub async fn wait(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}
