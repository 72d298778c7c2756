//! Test doubles for code built on this crate.
//!
//! Enabled for this crate's own tests and, for dependents, through the
//! `testing` feature.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;

use crate::lock;
use crate::robotcopy::{BrokerKind, BrokerMessage, BrokerResponse, MessageBroker};
use crate::storage::ViewStore;

/// A [`ViewStore`] whose every operation fails with `store offline`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingStore;

#[async_trait]
impl ViewStore for FailingStore {
    async fn find(&self, _collection: &str, _selector: &Value) -> Result<Vec<Value>> {
        anyhow::bail!("store offline")
    }

    async fn insert(&self, _collection: &str, _document: Value) -> Result<()> {
        anyhow::bail!("store offline")
    }
}

/// A broker that records every message and answers with a canned reply.
#[derive(Debug, Clone)]
pub struct RecordingBroker {
    kind: BrokerKind,
    reply: Result<Value, String>,
    sent: Arc<Mutex<Vec<BrokerMessage>>>,
}

impl RecordingBroker {
    /// Answer every message successfully with `reply`.
    pub fn replying(kind: BrokerKind, reply: Value) -> Self {
        Self {
            kind,
            reply: Ok(reply),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Answer every message with `success: false` and `error`.
    pub fn failing(kind: BrokerKind, error: impl Into<String>) -> Self {
        Self {
            kind,
            reply: Err(error.into()),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Messages received so far, oldest first.
    pub fn messages(&self) -> Vec<BrokerMessage> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl MessageBroker for RecordingBroker {
    fn kind(&self) -> BrokerKind {
        self.kind.clone()
    }

    async fn send(&self, message: BrokerMessage) -> Result<BrokerResponse> {
        let id = message.id.clone();
        lock(&self.sent).push(message);
        Ok(match &self.reply {
            Ok(reply) => BrokerResponse::ok(id, reply.clone()),
            Err(error) => BrokerResponse::failed(id, error.clone()),
        })
    }
}

/// One-shot gate: tasks wait until someone opens it. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Latch {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl Latch {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the latch is open (immediately if it already is).
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while waiting.
        let _ = rx.wait_for(|open| *open).await;
    }
}
