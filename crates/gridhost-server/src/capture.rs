//! Per-session frame delivery.
//!
//! A session picks one [`CaptureStrategy`] when it opens and keeps it until
//! it closes. Windows call [`CaptureDispatcher::dispatch`] from their render
//! hook on the UI thread, so dispatch never encodes inline: the encoded
//! strategy hands frames to a worker through a single-frame slot where a
//! newer frame replaces one that has not been picked up yet.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::session::ClientId;

/// A rendered editor frame, tightly packed BGRA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// What a sink receives for each delivered frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Encoded {
        width: u32,
        height: u32,
        payload: Vec<u8>,
    },
    Raw(Frame),
}

/// Output of a capture session, usually the client's video stream.
pub trait FrameSink: Send + Sync {
    fn deliver(&self, delivery: Delivery);
}

/// Streaming encoder used by the encoded strategy. Encoders keep state
/// between frames.
pub trait FrameEncoder: Send {
    /// Called once before the first frame, when the session opens.
    fn start(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }

    fn encode(&mut self, frame: &Frame) -> Result<Vec<u8>, CaptureError>;
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("encoder failed to start: {0}")]
    Start(String),
    #[error("encoder failed: {0}")]
    Encode(String),
    #[error("failed to spawn encoder thread: {0}")]
    Spawn(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureKind {
    Encoded,
    Native,
}

pub enum CaptureStrategy {
    Encoded {
        encoder: Box<dyn FrameEncoder>,
        sink: Arc<dyn FrameSink>,
    },
    Native {
        sink: Arc<dyn FrameSink>,
    },
}

impl CaptureStrategy {
    pub fn encoded(encoder: impl FrameEncoder + 'static, sink: Arc<dyn FrameSink>) -> Self {
        Self::Encoded {
            encoder: Box::new(encoder),
            sink,
        }
    }

    pub fn native(sink: Arc<dyn FrameSink>) -> Self {
        Self::Native { sink }
    }

    pub fn kind(&self) -> CaptureKind {
        match self {
            Self::Encoded { .. } => CaptureKind::Encoded,
            Self::Native { .. } => CaptureKind::Native,
        }
    }
}

impl fmt::Debug for CaptureStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CaptureStrategy").field(&self.kind()).finish()
    }
}

#[derive(Debug, Default)]
struct CaptureCounters {
    delivered: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub delivered: u64,
    /// Frames replaced by a newer one before the encoder picked them up.
    pub dropped: u64,
    pub failed: u64,
}

#[derive(Default)]
struct SlotState {
    frame: Option<Frame>,
    closed: bool,
}

#[derive(Default)]
struct FrameSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

struct EncoderWorker {
    slot: Arc<FrameSlot>,
    handle: Option<JoinHandle<()>>,
}

enum Route {
    Encoded(EncoderWorker),
    Native(Arc<dyn FrameSink>),
}

/// The capture hook bound to one session.
pub struct CaptureDispatcher {
    id: ClientId,
    route: Route,
    counters: Arc<CaptureCounters>,
}

impl CaptureDispatcher {
    pub fn new(id: ClientId, strategy: CaptureStrategy) -> Result<Self, CaptureError> {
        let counters = Arc::new(CaptureCounters::default());
        let route = match strategy {
            CaptureStrategy::Native { sink } => Route::Native(sink),
            CaptureStrategy::Encoded { mut encoder, sink } => {
                encoder.start()?;
                let slot = Arc::new(FrameSlot::default());
                let worker_slot = Arc::clone(&slot);
                let worker_counters = Arc::clone(&counters);
                let handle = thread::Builder::new()
                    .name(format!("gridhost-encode-{}", id.0))
                    .spawn(move || encode_loop(id, worker_slot, encoder, sink, worker_counters))?;
                Route::Encoded(EncoderWorker {
                    slot,
                    handle: Some(handle),
                })
            }
        };
        Ok(Self {
            id,
            route,
            counters,
        })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn kind(&self) -> CaptureKind {
        match self.route {
            Route::Encoded(_) => CaptureKind::Encoded,
            Route::Native(_) => CaptureKind::Native,
        }
    }

    /// Hands a captured frame to the session's output. Never waits for an
    /// encode to finish.
    pub fn dispatch(&self, frame: Frame) {
        match &self.route {
            Route::Native(sink) => {
                sink.deliver(Delivery::Raw(frame));
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Route::Encoded(worker) => {
                let mut state = worker.slot.state.lock();
                if state.closed {
                    return;
                }
                if state.frame.replace(frame).is_some() {
                    let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if dropped % 100 == 0 {
                        tracing::debug!(id = ?self.id, dropped, "encoder lagging, dropping stale frames");
                    }
                }
                drop(state);
                worker.slot.ready.notify_one();
            }
        }
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for CaptureDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureDispatcher")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Drop for CaptureDispatcher {
    fn drop(&mut self) {
        if let Route::Encoded(worker) = &mut self.route {
            worker.slot.state.lock().closed = true;
            worker.slot.ready.notify_all();
            if let Some(handle) = worker.handle.take() {
                if handle.join().is_err() {
                    tracing::error!(id = ?self.id, "encoder thread panicked");
                }
            }
        }
    }
}

fn encode_loop(
    id: ClientId,
    slot: Arc<FrameSlot>,
    mut encoder: Box<dyn FrameEncoder>,
    sink: Arc<dyn FrameSink>,
    counters: Arc<CaptureCounters>,
) {
    loop {
        let frame = {
            let mut state = slot.state.lock();
            loop {
                if let Some(frame) = state.frame.take() {
                    break frame;
                }
                if state.closed {
                    return;
                }
                slot.ready.wait(&mut state);
            }
        };
        match encoder.encode(&frame) {
            Ok(payload) => {
                sink.deliver(Delivery::Encoded {
                    width: frame.width,
                    height: frame.height,
                    payload,
                });
                counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(?id, %err, "frame encode failed");
            }
        }
    }
}
