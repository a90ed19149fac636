//! Joining and staying joined.
//!
//! A fresh librarian knows only the seed addresses it was configured with:
//! it introduces itself to each, folds whatever peers they share into the
//! routing table, and then searches for its own id so the buckets near it
//! fill up. After that a background loop keeps quiet buckets warm with
//! random-target searches.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::core::id::Id;
use crate::core::peer::{Peer, PeerAddress};
use crate::core::routing_table::RoutingTable;
use crate::error::Error;
use crate::handler::observe_peer;
use crate::rpc::Client;
use crate::search::{Mode, Searcher};

/// How many stale buckets a single refresh tick will probe.
const REFRESH_TARGETS_PER_TICK: usize = 8;

#[derive(Clone)]
pub struct Introducer {
    client: Client,
    searcher: Searcher,
    routing_table: Arc<Mutex<RoutingTable>>,
    local: PeerAddress,
    num_peers: u32,
    healthcheck_timeout: Duration,
    refresh_interval: Duration,
}

impl Introducer {
    pub fn new(
        client: Client,
        searcher: Searcher,
        routing_table: Arc<Mutex<RoutingTable>>,
        local: PeerAddress,
        num_peers: u32,
        healthcheck_timeout: Duration,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            client,
            searcher,
            routing_table,
            local,
            num_peers,
            healthcheck_timeout,
            refresh_interval,
        }
    }

    /// Introduce ourselves to each seed, then run a self-search to populate
    /// the buckets near our own id. Seeds that do not answer are skipped;
    /// only when none answer does bootstrap fail.
    pub async fn bootstrap(&self, seeds: &[SocketAddr]) -> Result<(), Error> {
        let mut reached = 0usize;
        let mut last_error = None;
        for &seed in seeds {
            match self
                .client
                .introduce(seed, self.local.clone(), self.num_peers)
                .await
            {
                Ok((responder, peers)) => {
                    reached += 1;
                    debug!(%seed, shared = peers.len(), "seed answered introduce");
                    let now = Instant::now();
                    let mut table = self.routing_table.lock().await;
                    table.record_response(&responder, now);
                    for peer in peers {
                        let _ = table.push(Peer::new(peer));
                    }
                }
                Err(error) => {
                    warn!(%seed, %error, "seed did not answer introduce");
                    last_error = Some(error);
                }
            }
        }
        if reached == 0 {
            if let Some(error) = last_error {
                return Err(error.into());
            }
            // no seeds configured: a solo librarian is bootstrapped trivially
            return Ok(());
        }

        let local_id = self.local.peer_id;
        self.search_and_absorb(local_id).await?;
        info!(
            peers = self.routing_table.lock().await.num_peers(),
            "bootstrap complete"
        );
        Ok(())
    }

    /// One maintenance pass: search a random id inside every bucket that has
    /// not seen traffic for a full refresh interval.
    pub async fn refresh_tick(&self) {
        let targets = {
            let table = self.routing_table.lock().await;
            table.stale_bucket_targets(
                Instant::now(),
                self.refresh_interval,
                REFRESH_TARGETS_PER_TICK,
            )
        };
        for target in targets {
            debug!(target = %target.short_hex(), "refreshing stale bucket");
            if let Err(error) = self.search_and_absorb(target).await {
                debug!(%error, "bucket refresh lookup failed");
            }
            self.routing_table
                .lock()
                .await
                .mark_bucket_refreshed(target, Instant::now());
        }
    }

    /// Run the periodic refresh until the task is dropped.
    pub async fn run_refresh(self) {
        let mut ticker = interval(self.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick completes immediately; skip it so a freshly
        // bootstrapped table is not probed right away
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.refresh_tick().await;
        }
    }

    async fn search_and_absorb(&self, target: Id) -> Result<(), Error> {
        let seeds = {
            let table = self.routing_table.lock().await;
            table.peak(target, self.searcher.config().n_closest_responses)
        };
        let outcome = self.searcher.run(target, Mode::Peers, seeds).await?;
        for address in outcome.closest {
            observe_peer(
                Arc::clone(&self.routing_table),
                self.client.clone(),
                self.healthcheck_timeout,
                Peer::responded(address, Instant::now()),
            )
            .await;
        }
        Ok(())
    }
}
