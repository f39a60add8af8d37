//! Module that connects several locks living in the same process.
//!
//! Calls are dispatched straight to the target's `DistributedLock::handle`.
//! Peers can be taken down to simulate crashes, calls can be delayed, and
//! every call is recorded.

use crate::{
    error::RemoteError,
    lock::DistributedLock,
    message::{PeerId, Reply, Request},
    registry::{PeerHandle, PeerRegistry},
    remote::{into_result, RemoteInvoker},
};
use futures::{future::BoxFuture, FutureExt};
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

#[derive(Default)]
struct Inner {
    locks: HashMap<PeerId, Arc<DistributedLock>>,
    down: HashSet<PeerId>,
    sent: Vec<(PeerId, &'static str)>,
    latency: Duration,
}

/// In-process transport shared by all the locks of a simulated group.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    inner: Arc<Mutex<Inner>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Address under which a peer is registered on this network.
    pub fn address_of(id: PeerId) -> String {
        format!("local:{id}")
    }

    /// Function that creates one lock per id, each knowing all the others, and
    /// attaches them to the network. Locks still need to be initialized.
    pub fn group(&self, ids: &[PeerId]) -> Vec<Arc<DistributedLock>> {
        ids.iter()
            .map(|id| {
                let registry: PeerRegistry = ids
                    .iter()
                    .filter(|other| *other != id)
                    .map(|other| (*other, Self::address_of(*other)))
                    .collect();
                let lock = Arc::new(DistributedLock::new(*id, registry, Arc::new(self.clone())));
                self.attach(lock.clone());
                lock
            })
            .collect()
    }

    pub fn attach(&self, lock: Arc<DistributedLock>) {
        let mut inner = self.inner();
        inner.down.remove(&lock.id());
        inner.locks.insert(lock.id(), lock);
    }

    /// Function that makes a peer unreachable, as if it had crashed.
    pub fn take_down(&self, id: PeerId) {
        self.inner().down.insert(id);
    }

    pub fn bring_up(&self, id: PeerId) {
        self.inner().down.remove(&id);
    }

    /// Function that delays the delivery of every following call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.inner().latency = latency;
    }

    /// Calls made so far as `(target, method)` pairs.
    pub fn sent(&self) -> Vec<(PeerId, &'static str)> {
        self.inner().sent.clone()
    }

    pub fn clear_sent(&self) {
        self.inner().sent.clear();
    }

    async fn dispatch(&self, peer: &PeerHandle, request: Request) -> Result<Reply, RemoteError> {
        let latency = {
            let mut inner = self.inner();
            inner.sent.push((peer.id, request.method()));
            inner.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let target = {
            let inner = self.inner();
            if inner.down.contains(&peer.id) {
                None
            } else {
                inner.locks.get(&peer.id).cloned()
            }
        };

        let Some(target) = target else {
            return Err(RemoteError::Unreachable {
                peer: peer.id,
                reason: "peer is down".to_string(),
            });
        };

        into_result(peer.id, target.handle(request).await)
    }
}

impl RemoteInvoker for LocalNetwork {
    fn call<'a>(
        &'a self,
        peer: &'a PeerHandle,
        request: Request,
    ) -> BoxFuture<'a, Result<Reply, RemoteError>> {
        self.dispatch(peer, request).boxed()
    }
}
