//! Bootstrap: concurrent dial of the configured seed peers

use crate::crypto::PeerId;
use crate::network::addrbook::PERMANENT_ADDR_TTL;
use crate::network::multiaddr::PeerAddrInfo;
use crate::network::swarm::Swarm;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("Bootstrap configuration error: {0}")]
    Configuration(String),
    #[error("All {attempts} bootstrap attempts failed, last error: {last}")]
    AllAttemptsFailed { attempts: usize, last: String },
    #[error("Bootstrap cancelled")]
    Cancelled,
}

pub struct Bootstrapper {
    swarm: Arc<Swarm>,
}

impl Bootstrapper {
    pub fn new(swarm: Arc<Swarm>) -> Self {
        Self { swarm }
    }

    /// Dial every seed concurrently and wait for all of them.
    ///
    /// Succeeds when at least one seed connected; returns the connected
    /// peers.
    pub async fn connect(
        &self,
        seeds: &[PeerAddrInfo],
        cancel: &CancellationToken,
    ) -> Result<Vec<PeerId>, BootstrapError> {
        if seeds.is_empty() {
            return Err(BootstrapError::Configuration(
                "no bootstrap peers given".to_string(),
            ));
        }

        // Spawn everything before awaiting anything
        let mut tasks = JoinSet::new();
        for seed in seeds {
            let swarm = self.swarm.clone();
            let seed = seed.clone();
            tasks.spawn(async move {
                swarm.address_book().add_info(&seed, PERMANENT_ADDR_TTL).await;
                log::info!("Bootstrapping to peer {}", seed.id);
                let result = swarm.connect(&seed).await;
                (seed.id, result)
            });
        }

        let attempts = seeds.len();
        let mut connected = Vec::new();
        let mut last_error = String::from("no attempt completed");

        loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    return Err(BootstrapError::Cancelled);
                }
                joined = tasks.join_next() => joined,
            };

            match joined {
                None => break,
                Some(Ok((peer, Ok(_)))) => {
                    log::info!("Bootstrap connection established with {}", peer);
                    connected.push(peer);
                }
                Some(Ok((peer, Err(e)))) => {
                    log::warn!("Bootstrap to {} failed: {}", peer, e);
                    last_error = e.to_string();
                }
                Some(Err(e)) => {
                    log::warn!("Bootstrap task failed: {}", e);
                    last_error = e.to_string();
                }
            }
        }

        if connected.is_empty() {
            return Err(BootstrapError::AllAttemptsFailed {
                attempts,
                last: last_error,
            });
        }

        log::info!("Bootstrapped to {}/{} peers", connected.len(), attempts);
        Ok(connected)
    }
}
