//! Client shim: one call per Librarian operation.
//!
//! Each call builds the request with a fresh 32-byte request id, signs it,
//! applies the per-RPC timeout, and checks that the response echoes the
//! request id. The transport underneath is abstracted as a [`Connector`] so
//! the engine does not care whether bytes travel over a real wire or between
//! in-process peers.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::{timeout, Duration};
use tracing::warn;

use crate::core::id::{Id, RequestId};
use crate::core::peer::PeerAddress;
use crate::core::storage::{Document, StoreOp};
use crate::error::QueryError;
use crate::message::{Request, RequestMetadata, Response, SignedRequest, SignedResponse};
use crate::sign::{self, Signer};

/// Delivers a signed request to whatever is listening at an address and
/// returns its signed response.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn dispatch(
        &self,
        to: SocketAddr,
        request: SignedRequest,
    ) -> Result<SignedResponse, QueryError>;
}

/// What a Find query returned: referral addresses and, for value queries
/// against a peer that holds the key, the value itself.
#[derive(Debug)]
pub struct FindResult {
    pub peers: Vec<PeerAddress>,
    pub value: Option<Document>,
}

#[derive(Clone)]
pub struct Client {
    signer: Arc<Signer>,
    connector: Arc<dyn Connector>,
    timeout: Duration,
}

impl Client {
    pub fn new(signer: Arc<Signer>, connector: Arc<dyn Connector>, timeout: Duration) -> Self {
        Self {
            signer,
            connector,
            timeout,
        }
    }

    /// A copy of this client with a different per-RPC timeout, e.g. the
    /// shorter one used for liveness pings.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            signer: Arc::clone(&self.signer),
            connector: Arc::clone(&self.connector),
            timeout,
        }
    }

    pub fn peer_id(&self) -> Id {
        self.signer.peer_id()
    }

    pub fn signer(&self) -> &Arc<Signer> {
        &self.signer
    }

    fn request_metadata(&self) -> RequestMetadata {
        RequestMetadata {
            request_id: RequestId::new_random(),
            pub_key: self.signer.pub_key().to_vec(),
        }
    }

    async fn call(&self, to: SocketAddr, request: Request) -> Result<Response, QueryError> {
        let request_id = request.metadata().request_id;
        let signed = self
            .signer
            .sign_request(request)
            .map_err(|e| QueryError::Transport(e.to_string()))?;

        let response = match timeout(self.timeout, self.connector.dispatch(to, signed)).await {
            Ok(result) => result?,
            Err(_elapsed) => return Err(QueryError::Timeout),
        };

        sign::verify_response(&response)
            .map_err(|e| QueryError::Transport(format!("response rejected: {e}")))?;
        let response = response.response;
        if response.metadata().request_id != request_id {
            warn!(%to, "response echoed a foreign request id");
            return Err(QueryError::MismatchedRequestId);
        }
        Ok(response)
    }

    pub async fn ping(&self, to: &PeerAddress) -> Result<String, QueryError> {
        let request = Request::Ping {
            metadata: self.request_metadata(),
        };
        match self.call(to.socket_addr(), request).await? {
            Response::Pong { message, .. } => Ok(message),
            other => Err(unexpected("ping", &other)),
        }
    }

    /// Introduce ourselves to whatever peer answers at `to` (its id is often
    /// unknown yet, e.g. a configured seed). Returns the responder's own
    /// address alongside the peers it shared.
    pub async fn introduce(
        &self,
        to: SocketAddr,
        self_address: PeerAddress,
        num_peers: u32,
    ) -> Result<(PeerAddress, Vec<PeerAddress>), QueryError> {
        let request = Request::Introduce {
            metadata: self.request_metadata(),
            self_address,
            num_peers,
        };
        match self.call(to, request).await? {
            Response::Introduced {
                self_address,
                peers,
                ..
            } => Ok((self_address, peers)),
            other => Err(unexpected("introduce", &other)),
        }
    }

    pub async fn find(
        &self,
        to: &PeerAddress,
        key: Id,
        num_peers: u32,
    ) -> Result<FindResult, QueryError> {
        let request = Request::Find {
            metadata: self.request_metadata(),
            key,
            num_peers,
        };
        match self.call(to.socket_addr(), request).await? {
            Response::Found { peers, value, .. } => Ok(FindResult { peers, value }),
            other => Err(unexpected("find", &other)),
        }
    }

    pub async fn store(
        &self,
        to: &PeerAddress,
        key: Id,
        value: Document,
    ) -> Result<StoreOp, QueryError> {
        let request = Request::Store {
            metadata: self.request_metadata(),
            key,
            value,
        };
        match self.call(to.socket_addr(), request).await? {
            Response::Stored { operation, .. } => Ok(operation),
            other => Err(unexpected("store", &other)),
        }
    }

    pub async fn get(&self, to: &PeerAddress, key: Id) -> Result<Option<Document>, QueryError> {
        let request = Request::Get {
            metadata: self.request_metadata(),
            key,
        };
        match self.call(to.socket_addr(), request).await? {
            Response::Value { value, .. } => Ok(value),
            other => Err(unexpected("get", &other)),
        }
    }

    pub async fn put(
        &self,
        to: &PeerAddress,
        key: Id,
        value: Document,
    ) -> Result<(StoreOp, u32), QueryError> {
        let request = Request::Put {
            metadata: self.request_metadata(),
            key,
            value,
        };
        match self.call(to.socket_addr(), request).await? {
            Response::Put {
                operation,
                n_replicas,
                ..
            } => Ok((operation, n_replicas)),
            other => Err(unexpected("put", &other)),
        }
    }
}

fn unexpected(op: &str, response: &Response) -> QueryError {
    QueryError::Transport(format!("unexpected response kind to {op}: {response:?}"))
}
