//! A fully assembled peer: identity, routing table, local store, engines,
//! and the request handler, wired to a transport.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::Config;
use crate::core::id::Id;
use crate::core::peer::{Peer, PeerAddress};
use crate::core::routing_table::RoutingTable;
use crate::core::storage::{Document, KvStore, StoreOp};
use crate::error::Error;
use crate::handler::{observe_peer, Handler, Publication};
use crate::introduce::Introducer;
use crate::rpc::{Client, Connector};
use crate::search::{Mode, Searcher};
use crate::sign::Signer;
use crate::store::Storer;

pub struct Librarian {
    config: Config,
    signer: Arc<Signer>,
    local: PeerAddress,
    routing_table: Arc<Mutex<RoutingTable>>,
    storage: Arc<Mutex<KvStore>>,
    client: Client,
    searcher: Searcher,
    storer: Storer,
    introducer: Introducer,
    handler: Arc<Handler>,
}

impl Librarian {
    /// Start a librarian with a freshly generated identity key.
    pub fn new(
        name: impl Into<String>,
        public_address: SocketAddr,
        connector: Arc<dyn Connector>,
        config: Config,
    ) -> Self {
        Self::with_signer(Signer::generate(), name, public_address, connector, config)
    }

    /// Start a librarian with a persisted identity key.
    pub fn with_signer(
        signer: Signer,
        name: impl Into<String>,
        public_address: SocketAddr,
        connector: Arc<dyn Connector>,
        config: Config,
    ) -> Self {
        let signer = Arc::new(signer);
        let local = PeerAddress::new(signer.peer_id(), name, public_address);
        let routing_table = Arc::new(Mutex::new(RoutingTable::new(signer.peer_id(), config.k)));
        let storage = Arc::new(Mutex::new(KvStore::new()));
        let client = Client::new(Arc::clone(&signer), connector, config.rpc_timeout);
        let searcher = Searcher::new(client.clone(), config.search.clone());
        let storer = Storer::new(client.clone(), searcher.clone(), config.store.clone());
        let introducer = Introducer::new(
            client.clone(),
            searcher.clone(),
            Arc::clone(&routing_table),
            local.clone(),
            config.introduce_num_peers,
            config.healthcheck_timeout,
            config.refresh_interval,
        );
        let handler = Arc::new(Handler::new(
            Arc::clone(&signer),
            local.clone(),
            config.clone(),
            Arc::clone(&routing_table),
            Arc::clone(&storage),
            client.clone(),
            searcher.clone(),
            storer.clone(),
        ));
        Self {
            config,
            signer,
            local,
            routing_table,
            storage,
            client,
            searcher,
            storer,
            introducer,
            handler,
        }
    }

    /// The handler a transport should register under this peer's address.
    pub fn handler(&self) -> Arc<Handler> {
        Arc::clone(&self.handler)
    }

    pub fn address(&self) -> &PeerAddress {
        &self.local
    }

    pub fn peer_id(&self) -> Id {
        self.signer.peer_id()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Join the network through the given seed addresses.
    pub async fn bootstrap(&self, seeds: &[SocketAddr]) -> Result<(), Error> {
        self.introducer.bootstrap(seeds).await
    }

    /// Keep stale buckets fresh in the background; abort the handle to stop.
    pub fn spawn_refresh(&self) -> JoinHandle<()> {
        tokio::spawn(self.introducer.clone().run_refresh())
    }

    /// Fetch the document stored under `key`, from the local store if we
    /// hold it, otherwise through a value search of the network. A fetched
    /// document is cached locally.
    pub async fn get(&self, key: Id) -> Result<Document, Error> {
        if let Some(value) = self.storage.lock().await.get(&key).cloned() {
            return Ok(value);
        }
        let seeds = self.seeds(key).await;
        let outcome = self.searcher.run(key, Mode::Value, seeds).await?;
        match outcome.value {
            Some(value) => {
                self.storage.lock().await.put(key, value.clone());
                Ok(value)
            }
            None if outcome.exhausted => Err(Error::LookupExhausted),
            None => Err(Error::NotFound),
        }
    }

    /// Store the document locally and replicate it at the closest peers to
    /// `key`. Returns how many peers confirmed a replica; fewer than the
    /// configured target means partial replication and the caller decides
    /// whether to retry.
    pub async fn put(&self, key: Id, value: Document) -> Result<usize, Error> {
        let operation = self.storage.lock().await.put(key, value.clone());
        if operation == StoreOp::Stored {
            self.handler.publish(key, &value, self.peer_id());
        }
        let seeds = self.seeds(key).await;
        let stored = self.storer.run(key, value, seeds).await?;
        Ok(stored.len())
    }

    /// Find the closest peers to `key`, teaching the routing table about the
    /// responders along the way.
    pub async fn find(&self, key: Id) -> Result<Vec<PeerAddress>, Error> {
        let seeds = self.seeds(key).await;
        let outcome = self.searcher.run(key, Mode::Peers, seeds).await?;
        for address in &outcome.closest {
            observe_peer(
                Arc::clone(&self.routing_table),
                self.client.clone(),
                self.config.healthcheck_timeout,
                Peer::responded(address.clone(), Instant::now()),
            )
            .await;
        }
        Ok(outcome.closest)
    }

    /// Receive every value this peer accepts from now on. The matching
    /// policy (author/reader filters) belongs to the subscription component
    /// consuming this stream.
    pub fn subscribe_publications(&self) -> mpsc::UnboundedReceiver<Publication> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.handler.set_publication_sink(tx);
        rx
    }

    /// Whether this peer holds `key` locally. Debug/test helper.
    pub async fn has_local(&self, key: Id) -> bool {
        self.storage.lock().await.contains(&key)
    }

    pub async fn num_peers(&self) -> usize {
        self.routing_table.lock().await.num_peers()
    }

    pub async fn knows(&self, peer_id: Id) -> bool {
        self.routing_table.lock().await.contains(peer_id)
    }

    /// The routing table's peer set, for the persistence layer.
    pub async fn routing_snapshot(&self) -> Vec<PeerAddress> {
        self.routing_table.lock().await.snapshot()
    }

    /// The identity key material, for the persistence layer.
    pub fn identity_key_bytes(&self) -> Vec<u8> {
        self.signer.key_bytes()
    }

    async fn seeds(&self, key: Id) -> Vec<PeerAddress> {
        let table = self.routing_table.lock().await;
        table.peak(key, self.config.search.n_closest_responses)
    }
}
