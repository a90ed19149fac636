//! Server side of the protocol: verify, observe, dispatch.
//!
//! Every incoming request passes the signature gate before it can touch any
//! state. Valid requests may teach us about the sender (Introduce carries
//! its address) and are then served against the routing table, the local
//! store, or — for the client-facing Get/Put — a full lookup through the
//! engines.

use std::sync::Mutex as StdMutex;

use tokio::sync::{mpsc, Mutex};
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use std::sync::Arc;

use crate::config::Config;
use crate::core::id::Id;
use crate::core::peer::{Peer, PeerAddress};
use crate::core::routing_table::{PushResult, RoutingTable};
use crate::core::storage::{Document, KvStore, StoreOp};
use crate::error::Error;
use crate::message::{Request, Response, ResponseMetadata, SignedRequest, SignedResponse};
use crate::rpc::Client;
use crate::search::{Mode, Searcher};
use crate::sign::{self, Signer};
use crate::store::Storer;

/// A value accepted into the local store, announced to whoever subscribed.
/// Matching against author/reader filters is not this engine's business; the
/// hook just hands over everything that landed.
#[derive(Debug, Clone)]
pub struct Publication {
    pub key: Id,
    pub value: Document,
    pub from: Id,
}

pub struct Handler {
    signer: Arc<Signer>,
    local: PeerAddress,
    config: Config,
    routing_table: Arc<Mutex<RoutingTable>>,
    storage: Arc<Mutex<KvStore>>,
    client: Client,
    searcher: Searcher,
    storer: Storer,
    publications: StdMutex<Option<mpsc::UnboundedSender<Publication>>>,
}

impl Handler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        signer: Arc<Signer>,
        local: PeerAddress,
        config: Config,
        routing_table: Arc<Mutex<RoutingTable>>,
        storage: Arc<Mutex<KvStore>>,
        client: Client,
        searcher: Searcher,
        storer: Storer,
    ) -> Self {
        Self {
            signer,
            local,
            config,
            routing_table,
            storage,
            client,
            searcher,
            storer,
            publications: StdMutex::new(None),
        }
    }

    /// Route accepted Store/Put values to `sink`.
    pub fn set_publication_sink(&self, sink: mpsc::UnboundedSender<Publication>) {
        *self.publications.lock().unwrap() = Some(sink);
    }

    pub(crate) fn publish(&self, key: Id, value: &Document, from: Id) {
        let sink = self.publications.lock().unwrap();
        if let Some(sink) = sink.as_ref() {
            let _ = sink.send(Publication {
                key,
                value: value.clone(),
                from,
            });
        }
    }

    /// Handle one incoming request end to end. `InvalidRequest` failures
    /// happen before any state is touched.
    pub async fn handle(&self, signed: SignedRequest) -> Result<SignedResponse, Error> {
        let sender_id = sign::verify_request(&signed)?;
        let request = signed.request;
        debug!(
            op = request.op(),
            from = %sender_id.short_hex(),
            "handling request"
        );

        // a known sender gets its request counter bumped; unknown senders
        // enter the table only through Introduce, where they prove an address
        {
            let mut table = self.routing_table.lock().await;
            if let Some(peer) = table.find_mut(sender_id) {
                peer.record_request(Instant::now());
            }
        }

        let metadata = ResponseMetadata {
            request_id: request.metadata().request_id,
            pub_key: self.signer.pub_key().to_vec(),
        };

        let response = match request {
            Request::Ping { .. } => Response::Pong {
                metadata,
                message: "pong".into(),
            },

            Request::Introduce {
                self_address,
                num_peers,
                ..
            } => {
                if self_address.peer_id != sender_id {
                    return Err(Error::InvalidRequest(
                        "introduced peer id does not match public key".into(),
                    ));
                }
                observe_peer(
                    Arc::clone(&self.routing_table),
                    self.client.clone(),
                    self.config.healthcheck_timeout,
                    Peer::new(self_address),
                )
                .await;

                let peers = {
                    let table = self.routing_table.lock().await;
                    table
                        .peak(Id::new_random(), self.cap(num_peers))
                        .into_iter()
                        .filter(|p| p.peer_id != sender_id)
                        .collect()
                };
                Response::Introduced {
                    metadata,
                    self_address: self.local.clone(),
                    peers,
                }
            }

            Request::Find { key, num_peers, .. } => {
                let value = self.storage.lock().await.get(&key).cloned();
                match value {
                    Some(value) => Response::Found {
                        metadata,
                        peers: vec![],
                        value: Some(value),
                    },
                    None => {
                        let peers = {
                            let table = self.routing_table.lock().await;
                            table.peak(key, self.cap(num_peers))
                        };
                        Response::Found {
                            metadata,
                            peers,
                            value: None,
                        }
                    }
                }
            }

            Request::Store { key, value, .. } => {
                let operation = self.storage.lock().await.put(key, value.clone());
                if operation == StoreOp::Stored {
                    self.publish(key, &value, sender_id);
                }
                Response::Stored {
                    metadata,
                    operation,
                }
            }

            Request::Get { key, .. } => {
                let local = self.storage.lock().await.get(&key).cloned();
                let value = match local {
                    Some(value) => Some(value),
                    None => {
                        let seeds = self.seeds(key).await;
                        self.searcher.run(key, Mode::Value, seeds).await?.value
                    }
                };
                Response::Value { metadata, value }
            }

            Request::Put { key, value, .. } => {
                let operation = self.storage.lock().await.put(key, value.clone());
                if operation == StoreOp::Stored {
                    self.publish(key, &value, sender_id);
                }
                let seeds = self.seeds(key).await;
                let stored = self.storer.run(key, value, seeds).await?;
                Response::Put {
                    metadata,
                    operation,
                    n_replicas: stored.len() as u32,
                }
            }
        };

        self.signer.sign_response(response)
    }

    async fn seeds(&self, key: Id) -> Vec<PeerAddress> {
        let table = self.routing_table.lock().await;
        table.peak(key, self.config.search.n_closest_responses)
    }

    fn cap(&self, num_peers: u32) -> usize {
        (num_peers as usize).min(self.config.k)
    }
}

/// Fold a peer observation into the routing table. When the peer's bucket is
/// full and unsplittable, the bucket's least-recently-seen entry gets a
/// liveness ping in the background; the probe outcome decides which of the
/// two keeps the slot.
pub(crate) async fn observe_peer(
    routing_table: Arc<Mutex<RoutingTable>>,
    client: Client,
    healthcheck_timeout: Duration,
    peer: Peer,
) {
    let result = { routing_table.lock().await.push(peer.clone()) };
    if let PushResult::Dropped { lru } = result {
        tokio::spawn(async move {
            let probe = client.with_timeout(healthcheck_timeout);
            let alive = probe.ping(&lru.address).await.is_ok();
            if !alive {
                warn!(peer = %lru.id().short_hex(), "stale peer failed probe, evicting");
            }
            routing_table.lock().await.resolve_probe(lru, peer, alive);
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::id::RequestId;
    use crate::mem::MemNetwork;
    use crate::message::RequestMetadata;
    use crate::test_support::test_support::make_peer;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn new_handler(config: Config, net: &MemNetwork) -> (Arc<Handler>, Arc<Signer>, SocketAddr) {
        let signer = Arc::new(Signer::generate());
        let addr = SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            11_000 + (signer.peer_id().as_bytes()[0] as u16),
        );
        let local = PeerAddress::new(signer.peer_id(), "test-librarian", addr);
        let routing_table = Arc::new(Mutex::new(RoutingTable::new(signer.peer_id(), config.k)));
        let storage = Arc::new(Mutex::new(KvStore::new()));
        let client = Client::new(
            Arc::clone(&signer),
            Arc::new(net.clone()),
            config.rpc_timeout,
        );
        let searcher = Searcher::new(client.clone(), config.search.clone());
        let storer = Storer::new(client.clone(), searcher.clone(), config.store.clone());
        let handler = Arc::new(Handler::new(
            signer.clone(),
            local,
            config,
            routing_table,
            storage,
            client,
            searcher,
            storer,
        ));
        net.register(addr, Arc::clone(&handler));
        (handler, signer, addr)
    }

    fn signed_request(signer: &Signer, build: impl FnOnce(RequestMetadata) -> Request) -> SignedRequest {
        let metadata = RequestMetadata {
            request_id: RequestId::new_random(),
            pub_key: signer.pub_key().to_vec(),
        };
        signer.sign_request(build(metadata)).unwrap()
    }

    #[tokio::test]
    async fn ping_gets_a_pong() {
        let net = MemNetwork::new();
        let (handler, _signer, _) = new_handler(Config::default(), &net);
        let sender = Signer::generate();

        let signed = signed_request(&sender, |metadata| Request::Ping { metadata });
        let response = handler.handle(signed).await.unwrap();
        assert!(matches!(
            response.response,
            Response::Pong { ref message, .. } if message == "pong"
        ));
    }

    #[tokio::test]
    async fn tampered_request_is_rejected_without_touching_the_table() {
        let net = MemNetwork::new();
        let (handler, _signer, _) = new_handler(Config::default(), &net);
        let sender = Signer::generate();

        let mut signed = signed_request(&sender, |metadata| Request::Find {
            metadata,
            key: Id::from_hashed(&"original"),
            num_peers: 8,
        });
        // valid signature over the original request, then a tampered key
        if let Request::Find { key, .. } = &mut signed.request {
            *key = Id::from_hashed(&"tampered");
        }

        let result = handler.handle(signed).await;
        assert!(matches!(result, Err(Error::InvalidRequest(_))));
        assert_eq!(handler.routing_table.lock().await.num_peers(), 0);
    }

    #[tokio::test]
    async fn introduce_rejects_mismatched_peer_id() {
        let net = MemNetwork::new();
        let (handler, _signer, _) = new_handler(Config::default(), &net);
        let sender = Signer::generate();

        // claims an id that is not the hash of the sender's public key
        let bogus = PeerAddress::new(
            Id::new_random(),
            "imposter",
            "127.0.0.1:12002".parse().unwrap(),
        );
        let signed = signed_request(&sender, |metadata| Request::Introduce {
            metadata,
            self_address: bogus,
            num_peers: 8,
        });

        let result = handler.handle(signed).await;
        assert!(matches!(result, Err(Error::InvalidRequest(_))));
        assert_eq!(handler.routing_table.lock().await.num_peers(), 0);
    }

    #[tokio::test]
    async fn introduce_learns_the_sender_and_shares_peers() {
        let net = MemNetwork::new();
        let (handler, _signer, _) = new_handler(Config::default(), &net);

        // pre-populate with a couple of peers to share
        {
            let mut table = handler.routing_table.lock().await;
            table.push(make_peer(1, 12_101, 0x01));
            table.push(make_peer(2, 12_102, 0x02));
        }

        let sender = Signer::generate();
        let sender_address = PeerAddress::new(
            sender.peer_id(),
            "newcomer",
            "127.0.0.1:12103".parse().unwrap(),
        );
        let signed = signed_request(&sender, |metadata| Request::Introduce {
            metadata,
            self_address: sender_address.clone(),
            num_peers: 8,
        });

        let response = handler.handle(signed).await.unwrap();
        match response.response {
            Response::Introduced {
                self_address,
                peers,
                ..
            } => {
                assert_eq!(self_address.peer_id, handler.signer.peer_id());
                assert_eq!(peers.len(), 2);
                assert!(peers.iter().all(|p| p.peer_id != sender.peer_id()));
            }
            other => panic!("expected Introduced, got {other:?}"),
        }
        assert!(handler
            .routing_table
            .lock()
            .await
            .contains(sender.peer_id()));
    }

    #[tokio::test]
    async fn find_returns_value_or_closest_peers() {
        let net = MemNetwork::new();
        let (handler, _signer, _) = new_handler(Config::default(), &net);
        let sender = Signer::generate();

        {
            let mut table = handler.routing_table.lock().await;
            table.push(make_peer(1, 12_201, 0x01));
        }
        let key = Id::from_hashed(&"doc");

        // miss: closest peers come back
        let signed = signed_request(&sender, |metadata| Request::Find {
            metadata,
            key,
            num_peers: 8,
        });
        let response = handler.handle(signed).await.unwrap();
        match response.response {
            Response::Found { peers, value, .. } => {
                assert!(value.is_none());
                assert_eq!(peers.len(), 1);
            }
            other => panic!("expected Found, got {other:?}"),
        }

        // hit: the value comes back and no referrals are needed
        handler.storage.lock().await.put(key, b"doc-bytes".to_vec());
        let signed = signed_request(&sender, |metadata| Request::Find {
            metadata,
            key,
            num_peers: 8,
        });
        let response = handler.handle(signed).await.unwrap();
        match response.response {
            Response::Found { peers, value, .. } => {
                assert_eq!(value, Some(b"doc-bytes".to_vec()));
                assert!(peers.is_empty());
            }
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn store_keeps_first_write_and_publishes() {
        let net = MemNetwork::new();
        let (handler, _signer, _) = new_handler(Config::default(), &net);
        let sender = Signer::generate();
        let (tx, mut rx) = mpsc::unbounded_channel();
        handler.set_publication_sink(tx);

        let key = Id::from_hashed(&"stored-doc");
        let signed = signed_request(&sender, |metadata| Request::Store {
            metadata,
            key,
            value: b"v1".to_vec(),
        });
        let response = handler.handle(signed).await.unwrap();
        assert!(matches!(
            response.response,
            Response::Stored {
                operation: StoreOp::Stored,
                ..
            }
        ));

        let publication = rx.recv().await.unwrap();
        assert_eq!(publication.key, key);
        assert_eq!(publication.value, b"v1".to_vec());
        assert_eq!(publication.from, sender.peer_id());

        // a second write is left existing and not re-published
        let signed = signed_request(&sender, |metadata| Request::Store {
            metadata,
            key,
            value: b"v2".to_vec(),
        });
        let response = handler.handle(signed).await.unwrap();
        assert!(matches!(
            response.response,
            Response::Stored {
                operation: StoreOp::LeftExisting,
                ..
            }
        ));
        assert!(rx.try_recv().is_err());
        assert_eq!(
            handler.storage.lock().await.get(&key),
            Some(&b"v1".to_vec())
        );
    }

    #[tokio::test]
    async fn full_bucket_probes_and_evicts_unresponsive_lru() {
        // k=2 and nobody listening anywhere: liveness probes always fail, so
        // a full bucket admits newcomers by evicting its oldest entry.
        let config = Config {
            k: 2,
            healthcheck_timeout: Duration::from_millis(100),
            ..Config::default()
        };
        let net = MemNetwork::new();
        let (handler, signer, _) = new_handler(config, &net);

        // fill the non-self side of the tree: two peers whose first bit is
        // the opposite of ours, plus one on our side to force the split
        let local_first = signer.peer_id().get_bit_at(0);
        let other_first = 1 - local_first;
        let flip = |b: u8, port: u16| {
            let mut peer = make_peer(b, port, b);
            peer.address.peer_id = peer.address.peer_id.with_bit(0, other_first);
            peer
        };
        let oldest = flip(0x11, 12_301);
        {
            let mut table = handler.routing_table.lock().await;
            table.push(oldest.clone());
            table.push(flip(0x12, 12_302));
            let mut ours = make_peer(0x13, 12_303, 0x13);
            ours.address.peer_id = ours.address.peer_id.with_bit(0, local_first);
            table.push(ours);
        }

        let newcomer = flip(0x14, 12_304);
        observe_peer(
            Arc::clone(&handler.routing_table),
            handler.client.clone(),
            handler.config.healthcheck_timeout,
            newcomer.clone(),
        )
        .await;

        // wait for the probe task to fail its ping and resolve
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            {
                let table = handler.routing_table.lock().await;
                if table.contains(newcomer.id()) && !table.contains(oldest.id()) {
                    break;
                }
            }
            assert!(Instant::now() < deadline, "eviction did not happen in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
