//! Request signing and verification.
//!
//! Every request is signed with the sender's ECDSA P-256 key over the
//! request's canonical marshalled bytes; the base64 token travels in an
//! out-of-band metadata slot. A peer's id is the SHA-256 hash of its encoded
//! public key, so holding the key is what entitles a peer to its spot in the
//! id space.

use base64::prelude::*;
use p256::ecdsa::signature::{Signer as _, Verifier as _};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand_core::OsRng;

use crate::core::id::Id;
use crate::error::Error;
use crate::message::{Request, Response, SignedRequest, SignedResponse};

/// Holds the local private key and produces request/response signatures.
pub struct Signer {
    key: SigningKey,
    pub_key: Vec<u8>,
    peer_id: Id,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("peer_id", &self.peer_id.short_hex())
            .finish()
    }
}

impl Signer {
    /// Generate a fresh identity key.
    pub fn generate() -> Self {
        Self::from_key(SigningKey::random(&mut OsRng))
    }

    pub fn from_key(key: SigningKey) -> Self {
        let pub_key = key
            .verifying_key()
            .to_encoded_point(/*compress=*/ true)
            .as_bytes()
            .to_vec();
        let peer_id = peer_id_from_pub_key(&pub_key);
        Self {
            key,
            pub_key,
            peer_id,
        }
    }

    /// Rebuild a signer from persisted key bytes.
    pub fn from_key_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let key = SigningKey::from_slice(bytes)
            .map_err(|e| Error::Fatal(format!("load identity key: {e}")))?;
        Ok(Self::from_key(key))
    }

    /// The private key material, for the persistence layer.
    pub fn key_bytes(&self) -> Vec<u8> {
        self.key.to_bytes().to_vec()
    }

    /// The encoded (compressed SEC1) public key carried in metadata.
    pub fn pub_key(&self) -> &[u8] {
        &self.pub_key
    }

    /// The id this key entitles us to: sha256 of the encoded public key.
    pub fn peer_id(&self) -> Id {
        self.peer_id
    }

    /// Sign arbitrary bytes, producing the base64 token carried in metadata.
    pub fn sign_bytes(&self, message: &[u8]) -> String {
        let signature: Signature = self.key.sign(message);
        BASE64_URL_SAFE_NO_PAD.encode(signature.to_der().as_bytes())
    }

    pub fn sign_request(&self, request: Request) -> Result<SignedRequest, Error> {
        let signature = self.sign_bytes(&request.canonical_bytes()?);
        Ok(SignedRequest { request, signature })
    }

    pub fn sign_response(&self, response: Response) -> Result<SignedResponse, Error> {
        let signature = self.sign_bytes(&response.canonical_bytes()?);
        Ok(SignedResponse {
            response,
            signature,
        })
    }
}

/// The id a public key entitles its holder to.
pub fn peer_id_from_pub_key(pub_key: &[u8]) -> Id {
    Id::from_hashed(&pub_key)
}

/// Verify a base64 signature token binds `pub_key` to `message`.
pub fn verify_bytes(pub_key: &[u8], message: &[u8], token: &str) -> Result<(), Error> {
    let key = VerifyingKey::from_sec1_bytes(pub_key)
        .map_err(|_| Error::InvalidRequest("malformed public key".into()))?;
    let der = BASE64_URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|_| Error::InvalidRequest("malformed signature token".into()))?;
    let signature = Signature::from_der(&der)
        .map_err(|_| Error::InvalidRequest("malformed signature".into()))?;
    key.verify(message, &signature)
        .map_err(|_| Error::InvalidRequest("signature verification failed".into()))
}

/// Verify an incoming request and return the sender's peer id (the hash of
/// the metadata public key). Nothing about the request may be trusted before
/// this returns Ok.
pub fn verify_request(signed: &SignedRequest) -> Result<Id, Error> {
    let metadata = signed.request.metadata();
    let bytes = signed.request.canonical_bytes()?;
    verify_bytes(&metadata.pub_key, &bytes, &signed.signature)?;
    Ok(peer_id_from_pub_key(&metadata.pub_key))
}

/// Verify an incoming response and return the responder's peer id.
pub fn verify_response(signed: &SignedResponse) -> Result<Id, Error> {
    let metadata = signed.response.metadata();
    let bytes = signed.response.canonical_bytes()?;
    verify_bytes(&metadata.pub_key, &bytes, &signed.signature)?;
    Ok(peer_id_from_pub_key(&metadata.pub_key))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::id::RequestId;
    use crate::message::RequestMetadata;

    fn find_request(signer: &Signer) -> Request {
        Request::Find {
            metadata: RequestMetadata {
                request_id: RequestId::new_random(),
                pub_key: signer.pub_key().to_vec(),
            },
            key: Id::from_hashed(&"some key"),
            num_peers: 8,
        }
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let signer = Signer::generate();
        let signed = signer.sign_request(find_request(&signer)).unwrap();
        let sender = verify_request(&signed).unwrap();
        assert_eq!(sender, signer.peer_id());
    }

    #[test]
    fn peer_id_is_hash_of_pub_key() {
        let signer = Signer::generate();
        assert_eq!(
            signer.peer_id(),
            Id::from_hashed(&signer.pub_key().to_vec())
        );
    }

    #[test]
    fn tampered_field_fails_verification() {
        let signer = Signer::generate();
        let mut signed = signer.sign_request(find_request(&signer)).unwrap();
        if let Request::Find { key, .. } = &mut signed.request {
            *key = Id::from_hashed(&"tampered");
        }
        assert!(matches!(
            verify_request(&signed),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn signature_from_wrong_key_fails() {
        let signer = Signer::generate();
        let imposter = Signer::generate();
        let request = find_request(&signer);
        let signature = imposter.sign_bytes(&request.canonical_bytes().unwrap());
        let signed = SignedRequest { request, signature };
        assert!(matches!(
            verify_request(&signed),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn key_bytes_roundtrip() {
        let signer = Signer::generate();
        let restored = Signer::from_key_bytes(&signer.key_bytes()).unwrap();
        assert_eq!(signer.peer_id(), restored.peer_id());
    }
}
