//! Replicating store: find the closest peers to a key, then push the value
//! to enough of them.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;
use tracing::debug;

use crate::config::StoreConfig;
use crate::core::id::Id;
use crate::core::peer::PeerAddress;
use crate::core::storage::Document;
use crate::error::{Error, QueryError};
use crate::rpc::Client;
use crate::search::{Mode, Searcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    /// Enough peers confirmed storage.
    Replicated,
    /// The error budget was exceeded.
    Errored,
    /// Ran out of peers to try before reaching the replica target.
    Exhausted,
}

enum Step {
    Store(PeerAddress),
    Wait,
    Done,
}

struct ReplicationState {
    /// Closest peers first; each is tried at most once.
    pending: VecDeque<PeerAddress>,
    in_flight: usize,
    n_replicas: usize,
    max_errors: usize,
    stored: Vec<PeerAddress>,
    errors: Vec<QueryError>,
    finished: Option<Termination>,
}

impl ReplicationState {
    fn new(peers: Vec<PeerAddress>, config: &StoreConfig) -> Self {
        Self {
            pending: peers.into(),
            in_flight: 0,
            n_replicas: config.n_replicas,
            max_errors: config.n_max_errors,
            stored: Vec::new(),
            errors: Vec::new(),
            finished: None,
        }
    }

    fn evaluate(&mut self) {
        if self.finished.is_some() {
            return;
        }
        if self.stored.len() >= self.n_replicas {
            self.finished = Some(Termination::Replicated);
        } else if self.errors.len() >= self.max_errors {
            self.finished = Some(Termination::Errored);
        } else if self.pending.is_empty() && self.in_flight == 0 {
            self.finished = Some(Termination::Exhausted);
        }
    }

    fn next(&mut self) -> Step {
        self.evaluate();
        if self.finished.is_some() {
            return Step::Done;
        }
        match self.pending.pop_front() {
            Some(peer) => {
                self.in_flight += 1;
                Step::Store(peer)
            }
            None => Step::Wait,
        }
    }

    fn record_ok(&mut self, peer: PeerAddress) {
        self.in_flight -= 1;
        if self.finished.is_some() {
            return;
        }
        self.stored.push(peer);
        self.evaluate();
    }

    fn record_error(&mut self, error: QueryError) {
        self.in_flight -= 1;
        if self.finished.is_some() {
            return;
        }
        self.errors.push(error);
        self.evaluate();
    }
}

/// Replicates a value at the closest peers to its key.
#[derive(Clone)]
pub struct Storer {
    client: Client,
    searcher: Searcher,
    config: StoreConfig,
}

impl Storer {
    pub fn new(client: Client, searcher: Searcher, config: StoreConfig) -> Self {
        Self {
            client,
            searcher,
            config,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Search for the closest peers to `key`, then issue Store requests until
    /// the replica target is met. Returns the peers that confirmed storage;
    /// fewer than the target means replication was only partial and the
    /// caller decides whether that is acceptable.
    ///
    /// A Store acknowledged with `LeftExisting` counts as a replica the same
    /// as a fresh store; the value at a key is expected to be immutable and
    /// the bytes are not compared.
    pub async fn run(
        &self,
        key: Id,
        value: Document,
        seeds: Vec<PeerAddress>,
    ) -> Result<Vec<PeerAddress>, Error> {
        let outcome = self.searcher.run(key, Mode::Peers, seeds).await?;
        if outcome.exhausted && outcome.closest.len() < self.config.n_replicas {
            return Err(Error::LookupExhausted);
        }

        let state = Arc::new(Mutex::new(ReplicationState::new(
            outcome.closest,
            &self.config,
        )));
        let notify = Arc::new(Notify::new());

        let mut workers = JoinSet::new();
        for _ in 0..self.config.concurrency.max(1) {
            workers.spawn(worker(
                Arc::clone(&state),
                Arc::clone(&notify),
                self.client.clone(),
                key,
                value.clone(),
            ));
        }
        while workers.join_next().await.is_some() {}

        let mut state = state.lock().await;
        match state.finished {
            Some(Termination::Errored) => Err(Error::LookupErrored {
                errors: state.errors.len(),
            }),
            Some(Termination::Replicated) | Some(Termination::Exhausted) => {
                debug!(
                    key = %key.short_hex(),
                    replicas = state.stored.len(),
                    "replication finished"
                );
                Ok(std::mem::take(&mut state.stored))
            }
            None => Err(Error::Fatal("replication workers exited unfinished".into())),
        }
    }
}

async fn worker(
    state: Arc<Mutex<ReplicationState>>,
    notify: Arc<Notify>,
    client: Client,
    key: Id,
    value: Document,
) {
    loop {
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let step = { state.lock().await.next() };
        let peer = match step {
            Step::Done => {
                notify.notify_waiters();
                return;
            }
            Step::Wait => {
                notified.await;
                continue;
            }
            Step::Store(peer) => peer,
        };

        let result = client.store(&peer, key, value.clone()).await;
        {
            let mut state = state.lock().await;
            match result {
                Ok(_op) => state.record_ok(peer),
                Err(error) => {
                    debug!(peer = %peer.peer_id.short_hex(), %error, "store failed");
                    state.record_error(error);
                }
            }
        }
        notify.notify_waiters();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::SearchConfig;
    use crate::core::storage::StoreOp;
    use crate::message::{
        Request, Response, ResponseMetadata, SignedRequest, SignedResponse,
    };
    use crate::rpc::Connector;
    use crate::sign::Signer;
    use crate::test_support::test_support::{address_with_last_byte, id_with_last_byte};
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::net::SocketAddr;
    use std::sync::Mutex as StdMutex;
    use tokio::time::Duration;

    /// Peers that answer Find truthfully (everyone knows everyone) and
    /// acknowledge Store requests, except for a configurable set that
    /// refuses them.
    struct AckNet {
        signer: Signer,
        peers: Vec<PeerAddress>,
        refusing: HashSet<SocketAddr>,
        stored: StdMutex<HashMap<SocketAddr, Document>>,
    }

    impl AckNet {
        fn new(peers: Vec<PeerAddress>) -> Self {
            Self {
                signer: Signer::generate(),
                peers,
                refusing: HashSet::new(),
                stored: StdMutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl Connector for AckNet {
        async fn dispatch(
            &self,
            to: SocketAddr,
            signed: SignedRequest,
        ) -> Result<SignedResponse, QueryError> {
            let me = self
                .peers
                .iter()
                .find(|p| p.socket_addr() == to)
                .ok_or_else(|| QueryError::Transport(format!("nothing listening on {to}")))?;
            let metadata = ResponseMetadata {
                request_id: signed.request.metadata().request_id,
                pub_key: self.signer.pub_key().to_vec(),
            };
            let response = match &signed.request {
                Request::Find { key, num_peers, .. } => {
                    let mut closest: Vec<PeerAddress> = self
                        .peers
                        .iter()
                        .filter(|p| p.peer_id != me.peer_id)
                        .cloned()
                        .collect();
                    closest.sort_by(|p, q| key.compare_by_distance(&p.peer_id, &q.peer_id));
                    closest.truncate(*num_peers as usize);
                    Response::Found {
                        metadata,
                        peers: closest,
                        value: None,
                    }
                }
                Request::Store { value, .. } => {
                    if self.refusing.contains(&to) {
                        return Err(QueryError::Transport("store refused".into()));
                    }
                    self.stored.lock().unwrap().insert(to, value.clone());
                    Response::Stored {
                        metadata,
                        operation: StoreOp::Stored,
                    }
                }
                _ => return Err(QueryError::Transport("unexpected request kind".into())),
            };
            self.signer
                .sign_response(response)
                .map_err(|e| QueryError::Transport(e.to_string()))
        }
    }

    fn storer(net: Arc<AckNet>, config: StoreConfig) -> Storer {
        let client = Client::new(
            Arc::new(Signer::generate()),
            net,
            Duration::from_secs(3),
        );
        let searcher = Searcher::new(client.clone(), SearchConfig::default());
        Storer::new(client, searcher, config)
    }

    fn ring(n: u8, base_port: u16) -> Vec<PeerAddress> {
        (0..n)
            .map(|i| address_with_last_byte(i, base_port + i as u16))
            .collect()
    }

    #[tokio::test]
    async fn replicates_to_the_closest_peers() {
        let peers = ring(16, 9800);
        let net = Arc::new(AckNet::new(peers.clone()));
        let storer = storer(Arc::clone(&net), StoreConfig::default());

        let key = id_with_last_byte(5);
        let stored = storer
            .run(key, b"the document".to_vec(), peers[..2].to_vec())
            .await
            .unwrap();
        assert!(stored.len() >= 3);

        // the replicas really are the closest peers to the key
        let holder_ids: HashSet<Id> = stored.iter().map(|p| p.peer_id).collect();
        assert!(holder_ids.contains(&id_with_last_byte(5)));
        assert!(holder_ids.contains(&id_with_last_byte(4)));
    }

    #[tokio::test]
    async fn refusals_burn_the_error_budget() {
        let peers = ring(8, 9900);
        let mut net = AckNet::new(peers.clone());
        for p in &peers {
            net.refusing.insert(p.socket_addr());
        }
        let net = Arc::new(net);
        let storer = storer(Arc::clone(&net), StoreConfig::default());

        let result = storer
            .run(id_with_last_byte(2), b"x".to_vec(), peers.clone())
            .await;
        assert!(matches!(result, Err(Error::LookupErrored { .. })));
    }

    #[tokio::test]
    async fn too_few_reachable_peers_is_exhausted() {
        // a network of two peers cannot satisfy three replicas
        let peers = ring(2, 10_000);
        let net = Arc::new(AckNet::new(peers.clone()));
        let storer = storer(Arc::clone(&net), StoreConfig::default());

        let result = storer
            .run(id_with_last_byte(0), b"x".to_vec(), peers.clone())
            .await;
        assert!(matches!(result, Err(Error::LookupExhausted)));
    }
}
