use crate::{
    lock::DistributedLock,
    log,
    message::{PeerId, Request},
    poisson::Poisson,
    registry::{PeerHandle, PeerRegistry},
    remote::{RemoteInvoker, TcpInvoker},
    server::Server,
};
use color_print::cformat;
use std::{
    collections::{BTreeMap, BTreeSet},
    error::Error,
    future::Future,
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::Notify,
    time::{sleep, Instant},
};

/// Everything a peer needs to join the group and run its workload.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub id: PeerId,
    pub address: String,
    /// The other members of the group.
    pub members: BTreeMap<PeerId, String>,
    /// How long to wait for the other members at startup.
    pub rendezvous_timeout: Duration,
    /// Critical sections per second.
    pub rate: f64,
    /// Time spent inside each critical section.
    pub hold_time: Duration,
    /// Critical sections to run, 0 for no limit.
    pub rounds: usize,
    pub seed: u64,
}

impl PeerConfig {
    pub fn new(id: PeerId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            members: BTreeMap::new(),
            rendezvous_timeout: Duration::from_secs(10),
            rate: crate::RATE,
            hold_time: Duration::from_millis(200),
            rounds: 0,
            seed: id,
        }
    }
}

pub struct Peer {
    pub config: PeerConfig,
    lock: Arc<DistributedLock>,
    invoker: Arc<TcpInvoker>,
}

impl Peer {
    pub fn new(config: PeerConfig) -> Self {
        let invoker = Arc::new(TcpInvoker::default());
        let registry: PeerRegistry = config
            .members
            .iter()
            .filter(|(id, _)| **id != config.id)
            .map(|(id, address)| (*id, address.clone()))
            .collect();
        let lock = Arc::new(DistributedLock::new(config.id, registry, invoker.clone()));

        Self {
            config,
            lock,
            invoker,
        }
    }

    pub fn lock(&self) -> Arc<DistributedLock> {
        self.lock.clone()
    }

    /// Function that announces this peer to every member until all of them
    /// answered or the timeout elapsed. Members that never answered are
    /// dropped from the group. Returns the number of members reached.
    pub async fn rendezvous(&self) -> usize {
        let deadline = Instant::now() + self.config.rendezvous_timeout;
        let mut pending: BTreeSet<PeerId> = self
            .config
            .members
            .keys()
            .copied()
            .filter(|id| *id != self.config.id)
            .collect();
        let total = pending.len();

        while !pending.is_empty() && Instant::now() < deadline {
            for id in pending.clone() {
                let handle = PeerHandle {
                    id,
                    address: self.config.members[&id].clone(),
                };
                let request = Request::RegisterPeer {
                    pid: self.config.id,
                    address: self.config.address.clone(),
                };

                match self.invoker.call(&handle, request).await {
                    Ok(_) => {
                        log::info(&cformat!("Reached peer <bold>{id}</bold>."));
                        pending.remove(&id);
                    }
                    Err(e) => log::debug(&format!("{e}")),
                }
            }

            if !pending.is_empty() {
                sleep(Duration::from_millis(250)).await;
            }
        }

        for id in &pending {
            log::warn(&cformat!(
                "Peer <bold>{id}</bold> never answered, leaving it out of the group."
            ));
            self.lock.unregister_peer(*id).await;
        }

        total - pending.len()
    }

    /// Function that runs critical sections at Poisson-distributed intervals
    /// until the rounds are done or `stop` is notified.
    ///
    /// `stop` is only observed between critical sections: a section that
    /// started is always held for `hold_time` and released.
    pub async fn work(&self, stop: &Notify) {
        let mut poisson = Poisson::new(self.config.rate, self.config.seed);
        let mut round = 0;

        while self.config.rounds == 0 || round < self.config.rounds {
            tokio::select! {
                _ = sleep(poisson.delay_for_next_event()) => {}
                _ = stop.notified() => return,
            }
            tokio::select! {
                _ = self.lock.acquire() => {}
                _ = stop.notified() => return,
            }

            round += 1;
            log::info(&cformat!(
                "Peer <bold>{}</bold> entered the <green, bold>critical section</green, bold> (round <bold>{round}</bold>).",
                self.config.id
            ));
            sleep(self.config.hold_time).await;

            if let Err(e) = self.lock.release().await {
                log::error(&format!("{e}"));
                return;
            }
            log::debug(&cformat!("Peer <bold>{}</bold> left the critical section.", self.config.id));
        }
    }

    /// Function that serves the lock, joins the group, runs the workload until
    /// it finishes or `shutdown` resolves, then leaves the group.
    pub async fn run<F>(&self, shutdown: F) -> Result<(), Box<dyn Error + Send + Sync>>
    where
        F: Future<Output = ()>,
    {
        let server = Server::bind(&self.config.address, self.lock.clone()).await?;
        log::info(&cformat!(
            "Peer <bold>{}</bold> listening on <bold>{}</bold>.",
            self.config.id,
            server.local_addr()?
        ));
        let server_thread = tokio::spawn(async move {
            if let Err(e) = server.run().await {
                log::error(&format!("{e}"));
            }
        });

        let reached = self.rendezvous().await;
        log::info(&cformat!("Group formed with <bold>{reached}</bold> other peers."));
        self.lock.initialize().await;

        let stop = Notify::new();
        let work = self.work(&stop);
        tokio::pin!(work);

        let finished = tokio::select! {
            _ = &mut work => true,
            _ = shutdown => false,
        };
        if finished {
            log::info("Workload finished.");
        } else {
            log::info("Shutting down.");
            stop.notify_one();
            work.await;
        }

        self.lock.destroy().await;
        println!("{}", self.lock.display_status().await);

        server_thread.abort();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_id_is_not_a_member_of_the_registry() {
        let mut config = PeerConfig::new(2, "127.0.0.1:0");
        config.members.insert(1, "127.0.0.1:7001".to_string());
        config.members.insert(2, "127.0.0.1:7002".to_string());

        let peer = Peer::new(config);
        let status = futures::executor::block_on(peer.lock().display_status());

        assert_eq!(status.peers, vec![1]);
    }

    #[tokio::test]
    async fn stop_lets_the_current_section_finish() {
        let mut config = PeerConfig::new(1, "127.0.0.1:0");
        config.rate = 50.;
        config.hold_time = Duration::from_millis(20);
        let peer = Peer::new(config);
        peer.lock().initialize().await;

        let stop = Notify::new();
        let work = peer.work(&stop);
        tokio::pin!(work);
        assert!(tokio::time::timeout(Duration::from_millis(150), &mut work)
            .await
            .is_err());

        stop.notify_one();
        tokio::time::timeout(Duration::from_secs(2), work)
            .await
            .expect("workload ignored the stop signal");
        assert_eq!(
            peer.lock().state().await,
            crate::state::TokenState::TokenIdle
        );
    }
}
