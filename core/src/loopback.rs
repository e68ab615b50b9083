//! In-memory bus connector.
//!
//! Stands in for the signaling relay when embedding the core without a
//! server, and drives the scenario tests. The [`LoopbackServer`] half sees
//! every frame the client sends and can push frames or drop the connection.

use crate::error::{Error, Result};
use crate::models::{EventKind, Frame};
use crate::network::{Connector, Link};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Default)]
struct Shared {
    to_client: Option<mpsc::UnboundedSender<String>>,
    from_client: Option<mpsc::UnboundedReceiver<String>>,
    received: Vec<String>,
    refuse: bool,
    opened: usize,
}

impl Shared {
    fn drain(&mut self) {
        if let Some(ref mut rx) = self.from_client {
            while let Ok(frame) = rx.try_recv() {
                self.received.push(frame);
            }
        }
    }
}

pub struct LoopbackConnector {
    shared: Arc<Mutex<Shared>>,
}

/// Server-side view of a [`LoopbackConnector`].
#[derive(Clone)]
pub struct LoopbackServer {
    shared: Arc<Mutex<Shared>>,
}

pub fn loopback() -> (LoopbackConnector, LoopbackServer) {
    let shared = Arc::new(Mutex::new(Shared::default()));
    (
        LoopbackConnector {
            shared: shared.clone(),
        },
        LoopbackServer { shared },
    )
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn open(&self, handshake: String) -> Result<Link> {
        let mut shared = self.shared.lock();
        if shared.refuse {
            return Err(Error::Network("connection refused".into()));
        }
        shared.drain();

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        shared.received.push(handshake);
        shared.to_client = Some(in_tx);
        shared.from_client = Some(out_rx);
        shared.opened += 1;

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

impl LoopbackServer {
    /// Delivers a frame to the client. False when no connection is open.
    pub fn push<T: Serialize>(&self, kind: EventKind, payload: &T) -> bool {
        let Ok(frame) = Frame::new(kind, payload).and_then(|f| f.encode()) else {
            return false;
        };
        self.push_raw(frame)
    }

    pub fn push_raw(&self, frame: String) -> bool {
        let shared = self.shared.lock();
        match shared.to_client {
            Some(ref tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Every frame received so far, handshakes included, oldest first.
    pub fn frames(&self) -> Vec<Frame> {
        let mut shared = self.shared.lock();
        shared.drain();
        shared
            .received
            .iter()
            .filter_map(|text| Frame::decode(text).ok())
            .collect()
    }

    pub fn frames_of(&self, kind: EventKind) -> Vec<Value> {
        self.frames()
            .into_iter()
            .filter(|f| f.kind == kind)
            .map(|f| f.payload)
            .collect()
    }

    /// Removes and returns frames received so far.
    pub fn take_frames(&self) -> Vec<Frame> {
        let mut shared = self.shared.lock();
        shared.drain();
        std::mem::take(&mut shared.received)
            .iter()
            .filter_map(|text| Frame::decode(text).ok())
            .collect()
    }

    /// Closes the current connection as if the network dropped it.
    pub fn drop_connection(&self) {
        let mut shared = self.shared.lock();
        shared.drain();
        shared.to_client = None;
        shared.from_client = None;
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.lock().refuse = refuse;
    }

    pub fn connections_opened(&self) -> usize {
        self.shared.lock().opened
    }

    pub fn is_open(&self) -> bool {
        self.shared.lock().to_client.is_some()
    }
}
