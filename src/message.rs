use serde::{Deserialize, Serialize};

use crate::core::id::{Id, RequestId};
use crate::core::peer::PeerAddress;
use crate::core::storage::{Document, StoreOp};
use crate::error::Error;

/// Carried by every request: a fresh 32-byte request id and the sender's
/// encoded public key. The hash of the public key is the sender's peer id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub request_id: RequestId,
    pub pub_key: Vec<u8>,
}

/// Carried by every response: the echoed request id and the responder's
/// encoded public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub request_id: RequestId,
    pub pub_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    Ping {
        metadata: RequestMetadata,
    },
    Introduce {
        metadata: RequestMetadata,
        self_address: PeerAddress,
        num_peers: u32,
    },
    Find {
        metadata: RequestMetadata,
        key: Id,
        num_peers: u32,
    },
    Store {
        metadata: RequestMetadata,
        key: Id,
        value: Document,
    },
    Get {
        metadata: RequestMetadata,
        key: Id,
    },
    Put {
        metadata: RequestMetadata,
        key: Id,
        value: Document,
    },
}

impl Request {
    pub fn metadata(&self) -> &RequestMetadata {
        match self {
            Request::Ping { metadata }
            | Request::Introduce { metadata, .. }
            | Request::Find { metadata, .. }
            | Request::Store { metadata, .. }
            | Request::Get { metadata, .. }
            | Request::Put { metadata, .. } => metadata,
        }
    }

    /// Name of the operation, for log fields.
    pub fn op(&self) -> &'static str {
        match self {
            Request::Ping { .. } => "ping",
            Request::Introduce { .. } => "introduce",
            Request::Find { .. } => "find",
            Request::Store { .. } => "store",
            Request::Get { .. } => "get",
            Request::Put { .. } => "put",
        }
    }

    /// The canonical marshalled bytes a signature binds to.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, Error> {
        rmp_serde::to_vec(self).map_err(|e| Error::Fatal(format!("marshal request: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    Pong {
        metadata: ResponseMetadata,
        message: String,
    },
    Introduced {
        metadata: ResponseMetadata,
        self_address: PeerAddress,
        peers: Vec<PeerAddress>,
    },
    Found {
        metadata: ResponseMetadata,
        peers: Vec<PeerAddress>,
        value: Option<Document>,
    },
    Stored {
        metadata: ResponseMetadata,
        operation: StoreOp,
    },
    Value {
        metadata: ResponseMetadata,
        value: Option<Document>,
    },
    Put {
        metadata: ResponseMetadata,
        operation: StoreOp,
        n_replicas: u32,
    },
}

impl Response {
    pub fn metadata(&self) -> &ResponseMetadata {
        match self {
            Response::Pong { metadata, .. }
            | Response::Introduced { metadata, .. }
            | Response::Found { metadata, .. }
            | Response::Stored { metadata, .. }
            | Response::Value { metadata, .. }
            | Response::Put { metadata, .. } => metadata,
        }
    }

    /// The canonical marshalled bytes a signature binds to.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, Error> {
        rmp_serde::to_vec(self).map_err(|e| Error::Fatal(format!("marshal response: {e}")))
    }
}

/// A request together with the sender's signature over its canonical bytes.
/// The transport carries the signature out of band (a metadata slot), which
/// this envelope models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedRequest {
    pub request: Request,
    pub signature: String,
}

/// A response together with the responder's signature over its canonical
/// bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedResponse {
    pub response: Response,
    pub signature: String,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::id::RequestId;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn metadata() -> RequestMetadata {
        RequestMetadata {
            request_id: RequestId::new_random(),
            pub_key: vec![2; 33],
        }
    }

    #[test]
    fn request_roundtrips_through_msgpack() {
        let request = Request::Find {
            metadata: metadata(),
            key: Id::from_hashed(&"some key"),
            num_peers: 8,
        };
        let bytes = request.canonical_bytes().unwrap();
        let back: Request = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(request, back);
    }

    #[test]
    fn canonical_bytes_are_deterministic() {
        let request = Request::Get {
            metadata: metadata(),
            key: Id::from_hashed(&"key"),
        };
        assert_eq!(
            request.canonical_bytes().unwrap(),
            request.canonical_bytes().unwrap()
        );
    }

    #[test]
    fn tampering_changes_canonical_bytes() {
        let request = Request::Find {
            metadata: metadata(),
            key: Id::from_hashed(&"original"),
            num_peers: 8,
        };
        let bytes = request.canonical_bytes().unwrap();

        let mut tampered = request.clone();
        if let Request::Find { key, .. } = &mut tampered {
            *key = Id::from_hashed(&"tampered");
        }
        assert_ne!(bytes, tampered.canonical_bytes().unwrap());
    }

    #[test]
    fn response_metadata_accessor() {
        let addr = PeerAddress::new(
            Id::new_random(),
            "responder",
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 20_100),
        );
        let request_id = RequestId::new_random();
        let response = Response::Introduced {
            metadata: ResponseMetadata {
                request_id,
                pub_key: vec![3; 33],
            },
            self_address: addr,
            peers: vec![],
        };
        assert_eq!(response.metadata().request_id, request_id);
    }
}
