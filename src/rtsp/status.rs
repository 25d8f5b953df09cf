//! Observable server status
//!
//! One [`StatusPublisher`] owns the sender side; the pipeline and the status
//! endpoint read snapshots through [`StatusHandle`].
//!
//! The publisher is shared by the accept loop, client tasks, the supervisor and
//! the pipeline, but it is the only writer of the value. Every update is a
//! `send_modify` closure, which runs under the channel's write lock, so updates
//! are serialized and readers never observe a half-applied change.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServerStatus {
    pub running: bool,
    pub client_count: usize,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    /// `rtsp://` URL clients should open, once bound
    pub url: Option<String>,
}

#[derive(Debug)]
pub struct StatusPublisher {
    tx: watch::Sender<ServerStatus>,
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusPublisher {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ServerStatus::default());
        Self { tx }
    }

    pub fn handle(&self) -> StatusHandle {
        StatusHandle {
            rx: self.tx.subscribe(),
        }
    }

    pub fn set_running(&self, url: Option<String>) {
        self.tx.send_modify(|s| {
            s.running = true;
            s.started_at = Some(Utc::now());
            s.url = url;
        });
    }

    pub fn set_stopped(&self) {
        self.tx.send_modify(|s| {
            s.running = false;
            s.client_count = 0;
        });
    }

    pub fn client_connected(&self) {
        self.tx.send_modify(|s| s.client_count += 1);
    }

    pub fn client_disconnected(&self) {
        self.tx
            .send_modify(|s| s.client_count = s.client_count.saturating_sub(1));
    }

    pub fn record_error(&self, err: impl ToString) {
        let msg = err.to_string();
        self.tx.send_modify(|s| s.last_error = Some(msg));
    }
}

/// Read side of the status channel
#[derive(Debug, Clone)]
pub struct StatusHandle {
    rx: watch::Receiver<ServerStatus>,
}

impl StatusHandle {
    pub fn get(&self) -> ServerStatus {
        self.rx.borrow().clone()
    }

    /// Wait for the next change. Returns false once the publisher is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}
