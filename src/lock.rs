//! Module that implements the token-passing lock.
//!
//! Every peer owns one `DistributedLock`. A single token circulates between
//! peers; whoever has it may enter the critical section. A peer that wants
//! the token broadcasts a timestamped request, and the holder hands the token
//! over on release to the next peer (in round-robin id order) whose request is
//! newer than its last recorded use.
//!
//! All state lives behind one mutex together with the membership view.
//! Decisions are taken while holding it, remote calls are made after it has
//! been dropped. Once the token has been surrendered, its delivery runs on a
//! spawned task, so dropping the caller's future can't lose it.

use crate::{
    error::{LockError, RemoteError},
    log,
    message::{ErrorKind, PeerId, Reply, Request, Response, Timestamp, TokenRecord},
    registry::{PeerHandle, PeerRegistry},
    remote::RemoteInvoker,
    state::{LockState, LockStatus, TokenState},
};
use color_print::cformat;
use futures::future::join_all;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::sync::{Mutex, Notify};

struct Shared {
    registry: PeerRegistry,
    state: LockState,
    departed: bool,
}

/// Token on its way to `successor`.
struct Handoff {
    successor: PeerHandle,
    token: TokenRecord,
}

/// Registration of a local task blocked in `acquire()`.
///
/// Dropped without claiming the token (the `acquire()` future was cancelled),
/// it withdraws the task and settles an idle token the task left behind.
struct Waiting {
    lock: Arc<DistributedLock>,
    claimed: bool,
}

impl Drop for Waiting {
    fn drop(&mut self) {
        if self.claimed {
            return;
        }
        self.lock.waiters.fetch_sub(1, Ordering::SeqCst);

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let lock = self.lock.clone();
            runtime.spawn(async move { lock.settle_idle_token().await });
        }
    }
}

pub struct DistributedLock {
    id: PeerId,
    shared: Mutex<Shared>,
    token_ready: Notify,
    /// Local tasks blocked in `acquire()`. Only increased under the mutex.
    waiters: AtomicUsize,
    invoker: Arc<dyn RemoteInvoker>,
}

impl DistributedLock {
    /// Function that creates the lock of peer `id`, knowing the peers in `registry`.
    pub fn new(id: PeerId, registry: PeerRegistry, invoker: Arc<dyn RemoteInvoker>) -> Self {
        let mut registry = registry;
        registry.remove(id);

        Self {
            id,
            shared: Mutex::new(Shared {
                registry,
                state: LockState::new(id),
                departed: false,
            }),
            token_ready: Notify::new(),
            waiters: AtomicUsize::new(0),
            invoker,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    fn waiting(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }

    /// Function that sets up the request table and elects the initial token owner.
    ///
    /// The membership must already be known: the lowest id of the group (or a
    /// peer alone in it) starts with the token.
    pub async fn initialize(self: &Arc<Self>) {
        let handoff = {
            let mut shared = self.shared.lock().await;
            let peers = shared.registry.list_peers();
            for pid in &peers {
                shared.state.add_peer(*pid);
            }

            let elected = peers.first().map_or(true, |lowest| self.id < *lowest);
            if elected && !shared.state.owns_token() {
                shared.state.create_token();
                log::info(&cformat!(
                    "Peer <bold>{}</bold> starts with the <yellow, bold>token</yellow, bold>.",
                    self.id
                ));
                self.grant_idle_token(&mut shared)
            } else {
                log::info(&cformat!(
                    "Peer <bold>{}</bold> starts without the token ({} other peers).",
                    self.id,
                    peers.len()
                ));
                None
            }
        };

        if let Some(handoff) = handoff {
            self.pass_token(handoff).await;
        }
    }

    /// Function that waits until this peer may enter the critical section.
    ///
    /// Cancelling the returned future withdraws the local wait; requests
    /// already broadcast stay recorded by the other peers.
    pub async fn acquire(self: &Arc<Self>) {
        let broadcast = {
            let mut shared = self.shared.lock().await;
            let time = shared.state.tick();
            shared.state.record_request(self.id, time);

            match shared.state.state {
                TokenState::TokenIdle => {
                    shared.state.state = TokenState::TokenHeld;
                    log::debug(&cformat!(
                        "Token already present, entering the critical section at time <bold>{time}</bold>."
                    ));
                    return;
                }
                TokenState::TokenHeld => {
                    self.waiters.fetch_add(1, Ordering::SeqCst);
                    None
                }
                TokenState::NoToken => {
                    self.waiters.fetch_add(1, Ordering::SeqCst);
                    Some((time, shared.registry.handles()))
                }
            }
        };
        let mut waiting = Waiting {
            lock: self.clone(),
            claimed: false,
        };

        if let Some((time, targets)) = broadcast {
            if targets.is_empty() {
                log::warn("Waiting for the token but no other peer is known.");
            }
            self.broadcast(time, targets).await;
        }

        self.wait_for_token(&mut waiting).await;
    }

    async fn wait_for_token(&self, waiting: &mut Waiting) {
        loop {
            {
                let mut shared = self.shared.lock().await;
                if shared.state.state == TokenState::TokenIdle {
                    shared.state.state = TokenState::TokenHeld;
                    self.waiters.fetch_sub(1, Ordering::SeqCst);
                    waiting.claimed = true;
                    log::debug(&cformat!(
                        "Entering the critical section at time <bold>{}</bold>.",
                        shared.state.clock
                    ));
                    return;
                }
            }
            self.token_ready.notified().await;
        }
    }

    /// Function that leaves the critical section and passes the token on if someone asked for it.
    pub async fn release(self: &Arc<Self>) -> Result<(), LockError> {
        let handoff = {
            let mut shared = self.shared.lock().await;
            if shared.state.state != TokenState::TokenHeld {
                return Err(LockError::NotHeld(shared.state.state.name()));
            }

            shared.state.state = TokenState::TokenIdle;
            let clock = shared.state.clock;
            if let Some(token) = shared.state.token.as_mut() {
                token.insert(self.id, clock);
            }

            let handoff = self.plan_handoff(&mut shared);
            if handoff.is_none() && self.waiting() > 0 {
                self.token_ready.notify_one();
            }
            handoff
        };

        if let Some(handoff) = handoff {
            self.pass_token(handoff).await;
        }
        Ok(())
    }

    /// Function that handles another peer asking for the token.
    pub async fn request_token(self: &Arc<Self>, time: Timestamp, pid: PeerId) -> Response {
        let handoff = {
            let mut shared = self.shared.lock().await;
            shared.state.merge(time);
            if !shared.registry.contains(pid) {
                log::warn(&cformat!(
                    "Ignoring a token request from unknown peer <bold>{pid}</bold>."
                ));
                return Response::err(ErrorKind::UnknownPeer, format!("peer {pid} is not registered"));
            }

            shared.state.record_request(pid, time);
            log::debug(&cformat!(
                "Peer <bold>{pid}</bold> asked for the token at time <bold>{time}</bold>."
            ));

            if shared.state.state == TokenState::TokenIdle && self.waiting() == 0 {
                self.plan_handoff(&mut shared)
            } else {
                None
            }
        };

        if let Some(handoff) = handoff {
            self.pass_token(handoff).await;
        }
        Response::ack()
    }

    /// Function that handles another peer handing the token over.
    pub async fn obtain_token(self: &Arc<Self>, token: TokenRecord) -> Response {
        let handoff = {
            let mut shared = self.shared.lock().await;
            if let Err(details) = shared.state.install_token(token) {
                log::error(&cformat!(
                    "<red, bold>Protocol violation</red, bold>: {details}. Keeping the local token."
                ));
                return Response::err(ErrorKind::ProtocolViolation, details);
            }

            log::info(&cformat!(
                "Received the <yellow, bold>token</yellow, bold> at time <bold>{}</bold>.",
                shared.state.clock
            ));
            self.grant_idle_token(&mut shared)
        };

        if let Some(handoff) = handoff {
            self.pass_token(handoff).await;
        }
        Response::ack()
    }

    /// Function that adds a peer that joined the group.
    pub async fn register_peer(&self, pid: PeerId, address: String) {
        if pid == self.id {
            return;
        }

        let mut shared = self.shared.lock().await;
        if shared.registry.insert(pid, address) {
            log::info(&cformat!("Peer <bold>{pid}</bold> joined."));
        }
        shared.state.add_peer(pid);
    }

    /// Function that forgets a peer that left the group.
    pub async fn unregister_peer(&self, pid: PeerId) {
        let mut shared = self.shared.lock().await;
        if Self::evict(&mut shared, pid) {
            log::info(&cformat!("Peer <bold>{pid}</bold> left."));
        }
    }

    /// Function that leaves the group, handing the token to the lowest remaining peer.
    pub async fn destroy(self: &Arc<Self>) {
        if self.state().await == TokenState::TokenHeld {
            if let Err(e) = self.release().await {
                log::error(&format!("{e}"));
            }
        }

        let (token, peers) = {
            let mut shared = self.shared.lock().await;
            shared.departed = true;
            let token = if shared.state.state == TokenState::TokenIdle {
                shared.state.surrender_token()
            } else {
                None
            };
            (token, shared.registry.handles())
        };

        let departure = tokio::spawn(self.clone().leave(token, peers));
        if let Err(e) = departure.await {
            log::error(&format!("Leaving the group failed: {e}"));
        }
    }

    async fn leave(self: Arc<Self>, token: Option<TokenRecord>, peers: Vec<PeerHandle>) {
        let mut remaining = Vec::with_capacity(peers.len());
        let mut token = token;
        for peer in peers {
            let Some(record) = token.take() else {
                remaining.push(peer);
                continue;
            };

            match self
                .invoker
                .call(&peer, Request::ObtainToken { token: record.clone() })
                .await
            {
                Ok(_) => {
                    log::info(&cformat!(
                        "Handed the <yellow, bold>token</yellow, bold> to peer <bold>{}</bold> before leaving.",
                        peer.id
                    ));
                    remaining.push(peer);
                }
                Err(e) => {
                    log::warn(&format!("{e}"));
                    let mut record = record;
                    record.remove(&peer.id);
                    token = Some(record);
                    if !Self::presumed_dead(&e) {
                        remaining.push(peer);
                    }
                }
            }
        }

        if token.is_some() {
            log::info("No peer left to take the token, discarding it.");
        }

        let notices = remaining.iter().map(|peer| {
            self.invoker
                .call(peer, Request::UnregisterPeer { pid: self.id })
        });
        for result in join_all(notices).await {
            if let Err(e) = result {
                log::debug(&format!("{e}"));
            }
        }

        log::info(&cformat!("Peer <bold>{}</bold> left the group.", self.id));
    }

    /// Function that dispatches a remote call to the matching handler.
    pub async fn handle(self: &Arc<Self>, request: Request) -> Response {
        if self.shared.lock().await.departed {
            return Response::err(ErrorKind::Departed, format!("peer {} left the group", self.id));
        }

        match request {
            Request::RequestToken { time, pid } => self.request_token(time, pid).await,
            Request::ObtainToken { token } => self.obtain_token(token).await,
            Request::RegisterPeer { pid, address } => {
                self.register_peer(pid, address).await;
                Response::ack()
            }
            Request::UnregisterPeer { pid } => {
                if pid == self.id {
                    return Response::err(ErrorKind::UnknownPeer, "a peer can't unregister itself");
                }
                self.unregister_peer(pid).await;
                Response::ack()
            }
            Request::Check => Response::Ok(Reply::Identity(self.id)),
        }
    }

    pub async fn state(&self) -> TokenState {
        self.shared.lock().await.state.state
    }

    /// Function that returns a snapshot of the lock for diagnostics.
    pub async fn display_status(&self) -> LockStatus {
        let shared = self.shared.lock().await;
        LockStatus {
            owner: self.id,
            state: shared.state.state,
            clock: shared.state.clock,
            requests: shared.state.requests.clone(),
            token: shared.state.token.clone(),
            peers: shared.registry.list_peers(),
        }
    }

    /// Picks the successor and gives the token up. Must run with the token idle.
    fn plan_handoff(&self, shared: &mut Shared) -> Option<Handoff> {
        let pid = shared.state.successor()?;
        let successor = shared.registry.peer(pid)?;
        let token = shared.state.surrender_token()?;
        Some(Handoff { successor, token })
    }

    /// Wakes a local waiter for an idle token, or plans to forward it to a candidate.
    fn grant_idle_token(&self, shared: &mut Shared) -> Option<Handoff> {
        if self.waiting() > 0 {
            self.token_ready.notify_one();
            None
        } else {
            self.plan_handoff(shared)
        }
    }

    /// Re-checks an idle token after a local waiter gave up.
    async fn settle_idle_token(self: &Arc<Self>) {
        let handoff = {
            let mut shared = self.shared.lock().await;
            if shared.departed || shared.state.state != TokenState::TokenIdle {
                return;
            }
            self.grant_idle_token(&mut shared)
        };

        if let Some(handoff) = handoff {
            self.pass_token(handoff).await;
        }
    }

    /// Delivers a surrendered token on its own task and waits for the outcome.
    async fn pass_token(self: &Arc<Self>, handoff: Handoff) {
        let delivery = tokio::spawn(self.clone().hand_off(handoff));
        if let Err(e) = delivery.await {
            log::error(&format!("Token handoff task failed: {e}"));
        }
    }

    async fn hand_off(self: Arc<Self>, handoff: Handoff) {
        let mut handoff = handoff;
        loop {
            let successor = handoff.successor.id;
            log::debug(&cformat!(
                "Passing the <yellow, bold>token</yellow, bold> to peer <bold>{successor}</bold>."
            ));

            let result = self
                .invoker
                .call(
                    &handoff.successor,
                    Request::ObtainToken {
                        token: handoff.token.clone(),
                    },
                )
                .await;

            let mut shared = self.shared.lock().await;
            match result {
                Ok(_) => {
                    log::info(&cformat!(
                        "Passed the <yellow, bold>token</yellow, bold> to peer <bold>{successor}</bold>."
                    ));
                    drop(shared);
                    if self.waiting() > 0 {
                        self.request_again().await;
                    }
                    return;
                }
                Err(e) if Self::presumed_dead(&e) => {
                    log::warn(&format!("{e}"));
                    shared.state.restore_token(handoff.token);
                    Self::evict(&mut shared, successor);

                    if self.waiting() > 0 {
                        self.token_ready.notify_one();
                        return;
                    }
                    match self.plan_handoff(&mut shared) {
                        Some(next) => handoff = next,
                        None => {
                            log::info("No other peer wants the token, keeping it.");
                            return;
                        }
                    }
                }
                Err(e) => {
                    log::error(&format!("Token handoff rejected, keeping the token: {e}"));
                    shared.state.restore_token(handoff.token);
                    if self.waiting() > 0 {
                        self.token_ready.notify_one();
                    }
                    return;
                }
            }
        }
    }

    /// Broadcasts a fresh request for tasks still waiting after the token left.
    async fn request_again(&self) {
        let (time, targets) = {
            let mut shared = self.shared.lock().await;
            if shared.state.owns_token() || self.waiting() == 0 {
                return;
            }
            let time = shared.state.tick();
            shared.state.record_request(self.id, time);
            (time, shared.registry.handles())
        };
        self.broadcast(time, targets).await;
    }

    async fn broadcast(&self, time: Timestamp, targets: Vec<PeerHandle>) {
        let calls = targets.iter().map(|peer| async move {
            let result = self
                .invoker
                .call(peer, Request::RequestToken { time, pid: self.id })
                .await;
            (peer.id, result)
        });

        for (pid, result) in join_all(calls).await {
            match result {
                Ok(_) => {}
                Err(e) if Self::presumed_dead(&e) => {
                    log::warn(&format!("{e}"));
                    let mut shared = self.shared.lock().await;
                    Self::evict(&mut shared, pid);
                }
                Err(e) => log::error(&format!("Token request to peer {pid} failed: {e}")),
            }
        }
    }

    fn presumed_dead(error: &RemoteError) -> bool {
        matches!(
            error,
            RemoteError::Unreachable { .. }
                | RemoteError::Remote {
                    kind: ErrorKind::Departed,
                    ..
                }
        )
    }

    fn evict(shared: &mut Shared, pid: PeerId) -> bool {
        if pid == shared.state.owner {
            return false;
        }
        let known = shared.registry.remove(pid);
        shared.state.remove_peer(pid);
        known
    }
}
