use core::fmt::{self, Debug, Display, Formatter};
use core::str::FromStr;

use data_encoding::BASE32_NOPAD;
use libp2p_identity::{ed25519, PeerId};
use serde::de::Error as SerdeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const PUBLIC_KEY_LENGTH: usize = 32;

pub const SEED_LENGTH: usize = 32;

/// Suffix appended to a peer id to build its hostname.
pub const HOSTNAME_SUFFIX: &str = "atek.app";

// Multihash code of the identity hash, used by peer ids that inline the public key.
const IDENTITY_MULTIHASH_CODE: u8 = 0x00;

pub type Seed = [u8; SEED_LENGTH];

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IdentityError {
    #[error("invalid base32 encoding: {0}")]
    InvalidEncoding(data_encoding::DecodeError),
    #[error("expected a 32-byte public key, got {0} bytes")]
    InvalidLength(usize),
    #[error("bytes do not encode a valid ed25519 public key")]
    InvalidPublicKey,
    #[error("peer id {0} does not inline an ed25519 public key")]
    UnsupportedPeerId(PeerId),
}

/// Creates a keypair, deterministically from `seed` when one is given.
#[must_use]
pub fn create_keypair(seed: Option<&Seed>) -> Keypair {
    seed.map_or_else(Keypair::generate, |seed| Keypair::from_seed(*seed))
}

/// An ed25519 public key, the address of a peer on the network.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PublicKey([u8; PUBLIC_KEY_LENGTH]);

impl PublicKey {
    #[must_use]
    pub const fn from_bytes(bytes: [u8; PUBLIC_KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.0
    }

    /// Canonical peer id: the unpadded, lowercase base-32 form of the key.
    #[must_use]
    pub fn to_base32(&self) -> String {
        BASE32_NOPAD.encode(&self.0).to_ascii_lowercase()
    }

    #[must_use]
    pub fn hostname(&self) -> String {
        format!("{}.{HOSTNAME_SUFFIX}", self.to_base32())
    }

    #[must_use]
    pub fn url(&self) -> String {
        format!("http://{}", self.hostname())
    }

    pub fn to_libp2p(&self) -> Result<libp2p_identity::PublicKey, IdentityError> {
        let key = ed25519::PublicKey::try_from_bytes(&self.0)
            .map_err(|_| IdentityError::InvalidPublicKey)?;

        Ok(key.into())
    }

    pub fn to_peer_id(&self) -> Result<PeerId, IdentityError> {
        Ok(self.to_libp2p()?.to_peer_id())
    }

    /// Recovers the public key inlined in an ed25519 peer id.
    pub fn from_peer_id(peer_id: &PeerId) -> Result<Self, IdentityError> {
        let bytes = peer_id.to_bytes();

        let [IDENTITY_MULTIHASH_CODE, len, encoded @ ..] = bytes.as_slice() else {
            return Err(IdentityError::UnsupportedPeerId(*peer_id));
        };

        if usize::from(*len) != encoded.len() {
            return Err(IdentityError::UnsupportedPeerId(*peer_id));
        }

        let key = libp2p_identity::PublicKey::try_decode_protobuf(encoded)
            .map_err(|_| IdentityError::UnsupportedPeerId(*peer_id))?
            .try_into_ed25519()
            .map_err(|_| IdentityError::UnsupportedPeerId(*peer_id))?;

        Ok(Self(key.to_bytes()))
    }
}

impl Display for PublicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base32())
    }
}

impl Debug for PublicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey").field(&self.to_base32()).finish()
    }
}

impl FromStr for PublicKey {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = BASE32_NOPAD
            .decode(s.to_ascii_uppercase().as_bytes())
            .map_err(IdentityError::InvalidEncoding)?;

        let len = bytes.len();
        let bytes = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidLength(len))?;

        Ok(Self(bytes))
    }
}

impl From<[u8; PUBLIC_KEY_LENGTH]> for PublicKey {
    fn from(bytes: [u8; PUBLIC_KEY_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_base32())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        encoded.parse().map_err(SerdeError::custom)
    }
}

/// An ed25519 keypair identifying a node.
#[derive(Clone)]
pub struct Keypair {
    inner: ed25519::Keypair,
}

impl Keypair {
    #[must_use]
    pub fn generate() -> Self {
        Self {
            inner: ed25519::Keypair::generate(),
        }
    }

    #[must_use]
    pub fn from_seed(mut seed: Seed) -> Self {
        let secret = ed25519::SecretKey::try_from_bytes(&mut seed)
            .expect("a 32-byte seed is always a valid ed25519 secret key");

        Self {
            inner: secret.into(),
        }
    }

    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.inner.public().to_bytes())
    }

    /// Secret key followed by the public key, 64 bytes in total.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 64] {
        self.inner.to_bytes()
    }

    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.inner.sign(message)
    }

    #[must_use]
    pub fn to_libp2p(&self) -> libp2p_identity::Keypair {
        self.inner.clone().into()
    }
}

impl Debug for Keypair {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}
