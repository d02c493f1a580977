//! Human review queue.
//!
//! A review is a suspended continuation: the requester holds a `oneshot`
//! receiver and a verdict arriving through [`ReviewQueue::respond`] wakes
//! it. Requests are persisted so a pending Layer 3 review outlives the
//! process and can be answered later from the CLI.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};

use crate::error::Result;
use crate::state::store::{ReviewRecord, ReviewRequest, ReviewStore, Verdict};
use crate::{alog, alog_debug};

#[derive(Clone, Default)]
pub struct ReviewQueue {
    waiting: Arc<Mutex<HashMap<String, oneshot::Sender<Verdict>>>>,
    requests: Arc<Mutex<HashMap<String, ReviewRequest>>>,
    store: Option<ReviewStore>,
}

impl ReviewQueue {
    /// In-memory queue; nothing survives the process.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(store: ReviewStore) -> Self {
        Self {
            store: Some(store),
            ..Self::default()
        }
    }

    pub fn store(&self) -> Option<&ReviewStore> {
        self.store.as_ref()
    }

    /// Enqueue `request` and return the receiver its verdict arrives on.
    ///
    /// A request whose id already carries a stored verdict resolves
    /// immediately with that verdict.
    pub async fn submit(&self, request: ReviewRequest) -> Result<oneshot::Receiver<Verdict>> {
        let (tx, rx) = oneshot::channel();
        if let Some(store) = &self.store {
            if let Some(ReviewRecord {
                verdict: Some(verdict),
                ..
            }) = store.load(&request.id)?
            {
                alog_debug!("ReviewQueue: '{}' already decided", request.id);
                let _ = tx.send(verdict);
                return Ok(rx);
            }
            store.save(&ReviewRecord {
                request: request.clone(),
                verdict: None,
                discarded: false,
            })?;
        }
        alog!("ReviewQueue: waiting on '{}' ({})", request.id, request.summary);
        self.waiting.lock().await.insert(request.id.clone(), tx);
        self.requests.lock().await.insert(request.id.clone(), request);
        Ok(rx)
    }

    /// Deliver a verdict. Returns true when a waiter in this process
    /// received it; the verdict is persisted either way.
    pub async fn respond(&self, id: &str, verdict: Verdict) -> Result<bool> {
        if let Some(store) = &self.store {
            if store.load(id)?.is_some() {
                store.record_verdict(id, verdict.clone())?;
            }
        }
        self.requests.lock().await.remove(id);
        let delivered = match self.waiting.lock().await.remove(id) {
            Some(tx) => tx.send(verdict).is_ok(),
            None => false,
        };
        alog!("ReviewQueue: verdict for '{}' delivered={}", id, delivered);
        Ok(delivered)
    }

    /// Drop a request whose branch was cancelled.
    pub async fn discard(&self, id: &str) -> Result<()> {
        self.waiting.lock().await.remove(id);
        self.requests.lock().await.remove(id);
        if let Some(store) = &self.store {
            if let Some(mut record) = store.load(id)? {
                if record.verdict.is_none() {
                    record.discarded = true;
                    store.save(&record)?;
                }
            }
        }
        alog_debug!("ReviewQueue: discarded '{}'", id);
        Ok(())
    }

    /// Requests still waiting in this process.
    pub async fn pending(&self) -> Vec<ReviewRequest> {
        let mut requests: Vec<ReviewRequest> =
            self.requests.lock().await.values().cloned().collect();
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        requests
    }
}

impl std::fmt::Debug for ReviewQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReviewQueue")
            .field("persistent", &self.store.is_some())
            .finish()
    }
}
