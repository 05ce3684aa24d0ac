//! In-memory transport for tests, demos, and simulations.
//!
//! [`MockConnection`] implements [`Connection`] over a pair of in-process
//! buffers: tests inject inbound frames and inspect everything the endpoint
//! wrote. Transport loss is scriptable with [`MockConnection::set_down`],
//! which makes sends fail and `is_closed` report true without tearing the
//! frame stream down, exactly like an outage on a reconnecting link.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::codec;
use crate::connection::Connection;
use crate::envelope::Envelope;
use crate::error::{Error, Result};

/// Scriptable in-memory [`Connection`].
pub struct MockConnection {
    frames_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    frames_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    sent: Mutex<Vec<Bytes>>,
    down: AtomicBool,
    fail_sends: AtomicBool,
    closed: AtomicBool,
    close_calls: AtomicUsize,
}

impl MockConnection {
    /// Create a connection that starts up and connected.
    #[must_use]
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            frames_tx: Mutex::new(Some(tx)),
            frames_rx: tokio::sync::Mutex::new(rx),
            sent: Mutex::new(Vec::new()),
            down: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
        })
    }

    /// Feed one raw frame to the reading side.
    pub fn inject(&self, frame: impl Into<Bytes>) {
        if let Some(tx) = self.frames_tx.lock().as_ref() {
            let _ = tx.send(frame.into());
        }
    }

    /// Encode and feed one envelope to the reading side.
    ///
    /// # Panics
    /// Panics if the envelope fails to encode; test inputs are expected to
    /// be encodable.
    pub fn inject_envelope(&self, envelope: &Envelope) {
        self.inject(codec::encode(envelope).expect("test envelope must encode"));
    }

    /// Everything written so far, as raw frames.
    #[must_use]
    pub fn sent_frames(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    /// Everything written so far, parsed back into envelopes.
    ///
    /// # Panics
    /// Panics if a written frame does not parse; the endpoint only writes
    /// frames it encoded itself.
    #[must_use]
    pub fn sent_envelopes(&self) -> Vec<Envelope> {
        self.sent
            .lock()
            .iter()
            .map(|frame| codec::parse(frame).expect("sent frame must parse"))
            .collect()
    }

    /// Forget everything written so far.
    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    /// Simulate transport loss (`true`) or recovery (`false`). While down,
    /// sends fail with [`Error::NotConnected`] and `is_closed` reports true,
    /// but the frame stream stays open so the link can come back.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Make writes fail with a transport error while the link still reports
    /// connected. Models a flaky wire rather than an outage.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// How many times [`Connection::close`] was called.
    #[must_use]
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn send(&self, frame: Bytes) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) || self.down.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::transport("simulated write failure"));
        }
        self.sent.lock().push(frame);
        Ok(())
    }

    async fn recv(&self) -> Option<Bytes> {
        self.frames_rx.lock().await.recv().await
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if !self.closed.swap(true, Ordering::SeqCst) {
            // Ends the frame stream: recv drains the buffer, then None.
            self.frames_tx.lock().take();
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.down.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConnection")
            .field("sent", &self.sent.lock().len())
            .field("down", &self.down.load(Ordering::SeqCst))
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}
