//! In-process transport: a registry of handlers addressed by socket address.
//!
//! Lets a set of librarians run inside one process with no wire in between,
//! which is how the integration tests (and embedded deployments) assemble
//! networks. A real transport implements [`Connector`] the same way from the
//! outside.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::QueryError;
use crate::handler::Handler;
use crate::message::{SignedRequest, SignedResponse};
use crate::rpc::Connector;

#[derive(Clone, Default)]
pub struct MemNetwork {
    peers: Arc<Mutex<HashMap<SocketAddr, Arc<Handler>>>>,
}

impl MemNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, addr: SocketAddr, handler: Arc<Handler>) {
        self.peers.lock().unwrap().insert(addr, handler);
    }

    /// Take a peer off the network, e.g. to simulate a crash.
    pub fn deregister(&self, addr: &SocketAddr) {
        self.peers.lock().unwrap().remove(addr);
    }

    pub fn len(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl Connector for MemNetwork {
    async fn dispatch(
        &self,
        to: SocketAddr,
        request: SignedRequest,
    ) -> Result<SignedResponse, QueryError> {
        let handler = self.peers.lock().unwrap().get(&to).cloned();
        match handler {
            Some(handler) => handler
                .handle(request)
                .await
                .map_err(|e| QueryError::Transport(e.to_string())),
            None => Err(QueryError::Transport(format!("nothing listening on {to}"))),
        }
    }
}
