// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Optional payload integrity: outbound publish payloads are wrapped before
//! they enter the queue, inbound payloads are verified at the commit point and
//! dropped on mismatch.

use crate::errors::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use tiny_keccak::{Hasher, Sha3};

/// Integrity wrap/unwrap of publish payloads.
pub trait Integrity: Send + Sync {
    /// Attach the integrity tag to an outbound payload.
    fn wrap(&self, payload: &[u8]) -> Bytes;
    /// Verify and strip the tag of an inbound payload.
    fn unwrap(&self, payload: &[u8]) -> Result<Bytes>;
}

/// Truncated keyed sha3-256 tag appended to the payload.
#[derive(Debug)]
pub struct Sha3Integrity {
    key: Vec<u8>,
}

/// Octets of the sha3-256 digest carried on the wire.
const TAG_LEN: usize = 16;

impl Sha3Integrity {
    /// New wrapper using the given shared key.
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    fn tag(&self, payload: &[u8]) -> [u8; TAG_LEN] {
        let mut sha3 = Sha3::v256();
        sha3.update(&self.key);
        sha3.update(payload);
        let mut digest = [0u8; 32];
        sha3.finalize(&mut digest);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&digest[..TAG_LEN]);
        tag
    }
}

impl Integrity for Sha3Integrity {
    fn wrap(&self, payload: &[u8]) -> Bytes {
        let mut out = BytesMut::with_capacity(payload.len() + TAG_LEN);
        out.put_slice(payload);
        out.put_slice(&self.tag(payload));
        out.freeze()
    }

    fn unwrap(&self, payload: &[u8]) -> Result<Bytes> {
        if payload.len() < TAG_LEN {
            return Err(Error::SecurityCheckFailed);
        }
        let (data, tag) = payload.split_at(payload.len() - TAG_LEN);
        if tag != self.tag(data) {
            return Err(Error::SecurityCheckFailed);
        }
        Ok(Bytes::copy_from_slice(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn wrap_then_unwrap_returns_the_payload() {
        let integrity = Sha3Integrity::new(&b"shared key"[..]);
        let wrapped = integrity.wrap(b"reading=21.5");
        assert_eq!(wrapped.len(), b"reading=21.5".len() + TAG_LEN);
        let unwrapped = integrity.unwrap(&wrapped).expect("tag matches");
        assert_eq!(&unwrapped[..], b"reading=21.5");
    }

    #[test]
    fn tampered_payloads_are_rejected() {
        let integrity = Sha3Integrity::new(&b"shared key"[..]);
        let mut wrapped = integrity.wrap(b"reading=21.5").to_vec();
        wrapped[0] ^= 0x01;
        assert_matches!(
            integrity.unwrap(&wrapped),
            Err(Error::SecurityCheckFailed)
        );
    }

    #[test]
    fn wrong_key_and_short_payloads_are_rejected() {
        let ours = Sha3Integrity::new(&b"key a"[..]);
        let theirs = Sha3Integrity::new(&b"key b"[..]);
        let wrapped = ours.wrap(b"x");
        assert_matches!(theirs.unwrap(&wrapped), Err(Error::SecurityCheckFailed));
        assert_matches!(ours.unwrap(b"tiny"), Err(Error::SecurityCheckFailed));
    }
}
