//! Fan-out of one session's output to many viewers
//!
//! A session keeps a set of viewer sinks rather than a single owner.
//! Broadcasting snapshots the set and then delivers without holding the
//! lock, so viewers may attach or detach mid-broadcast. Delivery uses
//! `try_send`: a viewer whose buffer is full misses that message while the
//! others proceed, and stays attached.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::{self, error::TrySendError};

/// Output messages buffered per viewer before it starts missing data
pub const VIEWER_BUFFER: usize = 256;

/// Identifier of one attached viewer, unique within the agent process
pub type ViewerId = u64;

static NEXT_VIEWER_ID: AtomicU64 = AtomicU64::new(1);

/// How a session's process ended
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
}

struct ViewerSinks {
    output: mpsc::Sender<Arc<str>>,
    exit: mpsc::Sender<ExitInfo>,
}

#[derive(Default)]
struct Inner {
    viewers: HashMap<ViewerId, Arc<ViewerSinks>>,
    /// Set once the session has ended; late attachers get this immediately
    closed: Option<ExitInfo>,
}

/// Receiving side handed to a viewer on attach
pub struct ViewerHandle {
    pub id: ViewerId,
    pub output: mpsc::Receiver<Arc<str>>,
    pub exit: mpsc::Receiver<ExitInfo>,
}

/// The set of viewers attached to one session
#[derive(Default)]
pub struct ViewerSet {
    inner: Mutex<Inner>,
}

impl ViewerSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a viewer. Never touches the underlying process.
    pub fn attach(&self) -> ViewerHandle {
        let id = NEXT_VIEWER_ID.fetch_add(1, Ordering::Relaxed);
        let (output_tx, output) = mpsc::channel(VIEWER_BUFFER);
        let (exit_tx, exit) = mpsc::channel(1);

        let mut inner = self.lock();
        match &inner.closed {
            Some(info) => {
                // Session already over: deliver the exit, then both sinks close
                let _ = exit_tx.try_send(info.clone());
            }
            None => {
                inner.viewers.insert(
                    id,
                    Arc::new(ViewerSinks {
                        output: output_tx,
                        exit: exit_tx,
                    }),
                );
            }
        }
        tracing::debug!(viewer_id = id, "Viewer attached");

        ViewerHandle { id, output, exit }
    }

    /// Remove exactly this viewer's sinks. Returns false if it was not attached.
    pub fn detach(&self, id: ViewerId) -> bool {
        let removed = self.lock().viewers.remove(&id).is_some();
        if removed {
            tracing::debug!(viewer_id = id, "Viewer detached");
        }
        removed
    }

    /// Number of attached viewers
    pub fn len(&self) -> usize {
        self.lock().viewers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the session has ended
    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    fn snapshot(&self) -> Vec<(ViewerId, Arc<ViewerSinks>)> {
        self.lock()
            .viewers
            .iter()
            .map(|(id, sinks)| (*id, Arc::clone(sinks)))
            .collect()
    }

    /// Push one chunk of output to every attached viewer.
    ///
    /// Returns the number of viewers that accepted it.
    pub fn broadcast_output(&self, data: &str) -> usize {
        if data.is_empty() {
            return 0;
        }
        let message: Arc<str> = Arc::from(data);
        let mut delivered = 0;

        for (id, sinks) in self.snapshot() {
            match sinks.output.try_send(Arc::clone(&message)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(viewer_id = id, "Viewer buffer full, dropping output chunk");
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::warn!(viewer_id = id, "Viewer output sink closed");
                }
            }
        }
        delivered
    }

    /// Deliver the exit to every viewer, then drop all sinks.
    ///
    /// Only the first call has any effect.
    pub fn broadcast_exit(&self, info: ExitInfo) {
        let viewers = {
            let mut inner = self.lock();
            if inner.closed.is_some() {
                return;
            }
            inner.closed = Some(info.clone());
            std::mem::take(&mut inner.viewers)
        };

        for (id, sinks) in viewers {
            if sinks.exit.try_send(info.clone()).is_err() {
                tracing::warn!(viewer_id = id, "Failed to deliver exit to viewer");
            }
        }
    }
}
