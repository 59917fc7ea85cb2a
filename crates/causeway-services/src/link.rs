//! Connection wrapper — one trusted (or handshaking) transport stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use causeway_core::wire::Frame;

/// Commands consumed by a link's writer task.
#[derive(Debug)]
pub enum LinkCmd {
    /// Encode and write one frame.
    Frame(Frame),
    /// Shut the transport down. Stream closure is the cancellation
    /// signal for everything pending on this connection.
    Shutdown,
}

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

struct LinkInner {
    serial: u64,
    tx: mpsc::UnboundedSender<LinkCmd>,
    packets: AtomicU64,
    established_at: Instant,
    last_activity: Mutex<Instant>,
}

/// Handle to one live transport's writer channel plus its accounting
/// state. Cheap to clone; the registry entry and the owning reader task
/// share the same inner state.
#[derive(Clone)]
pub struct Link {
    inner: Arc<LinkInner>,
}

impl Link {
    pub fn new(tx: mpsc::UnboundedSender<LinkCmd>) -> Self {
        let now = Instant::now();
        Self {
            inner: Arc::new(LinkInner {
                serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
                tx,
                packets: AtomicU64::new(0),
                established_at: now,
                last_activity: Mutex::new(now),
            }),
        }
    }

    /// Process-unique serial. Unregistration compares serials so a stale
    /// cleanup never evicts a replacement entry under the same key.
    pub fn serial(&self) -> u64 {
        self.inner.serial
    }

    /// Queue a frame for the writer task. Returns false if the transport
    /// is already gone; callers treat that the same as a closed stream.
    pub fn send(&self, frame: Frame) -> bool {
        self.touch();
        self.inner.packets.fetch_add(1, Ordering::Relaxed);
        self.inner.tx.send(LinkCmd::Frame(frame)).is_ok()
    }

    /// Ask the writer task to close the transport.
    pub fn close(&self) {
        let _ = self.inner.tx.send(LinkCmd::Shutdown);
    }

    /// Record activity (a frame sent or received).
    pub fn touch(&self) {
        *self
            .inner
            .last_activity
            .lock()
            .expect("link mutex poisoned") = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.inner
            .last_activity
            .lock()
            .expect("link mutex poisoned")
            .elapsed()
    }

    pub fn packets(&self) -> u64 {
        self.inner.packets.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> Duration {
        self.inner.established_at.elapsed()
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("serial", &self.serial())
            .field("packets", &self.packets())
            .finish()
    }
}
