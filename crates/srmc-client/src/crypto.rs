use srmc_crypto::SecretKey;
use srmc_types::{IdentityId, KeyGrant};

use crate::error::ClientError;

/// The client's view of its identity's keys: the key announced last, plus
/// the one before it for frames the server sealed just ahead of a rotation.
pub struct ClientKeys {
    identity: IdentityId,
    active: (u64, SecretKey),
    previous: Option<(u64, SecretKey)>,
}

impl ClientKeys {
    pub fn new(identity: IdentityId, grant: &KeyGrant) -> Result<Self, ClientError> {
        Ok(Self {
            identity,
            active: (grant.epoch, decode_grant(grant)?),
            previous: None,
        })
    }

    pub fn identity(&self) -> &IdentityId {
        &self.identity
    }

    pub fn active_epoch(&self) -> u64 {
        self.active.0
    }

    /// Adopt a newly announced key. Re-announcing the active epoch is a no-op.
    pub fn install(&mut self, grant: &KeyGrant) -> Result<(), ClientError> {
        if grant.epoch == self.active.0 {
            return Ok(());
        }
        let next = (grant.epoch, decode_grant(grant)?);
        self.previous = Some(std::mem::replace(&mut self.active, next));
        Ok(())
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, ClientError> {
        srmc_crypto::seal(&self.active.1, self.identity.as_bytes(), plaintext)
            .map_err(|e| ClientError::Crypto(e.to_string()))
    }

    pub fn open(&self, frame: &[u8]) -> Result<Vec<u8>, ClientError> {
        let aad = self.identity.as_bytes();
        let opened = match srmc_crypto::open(&self.active.1, aad, frame) {
            Err(first) => match &self.previous {
                Some((_, key)) => srmc_crypto::open(key, aad, frame),
                None => Err(first),
            },
            ok => ok,
        };
        opened.map_err(|e| ClientError::Crypto(e.to_string()))
    }
}

fn decode_grant(grant: &KeyGrant) -> Result<SecretKey, ClientError> {
    SecretKey::from_base64(&grant.key).map_err(|e| ClientError::Protocol(format!("bad key grant: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant(epoch: u64, key: &SecretKey) -> KeyGrant {
        KeyGrant {
            epoch,
            key: key.to_base64(),
            expires_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn previous_key_still_opens_after_rotation() {
        let k1 = SecretKey::generate().unwrap();
        let k2 = SecretKey::generate().unwrap();
        let alice = IdentityId::from("alice");

        let mut keys = ClientKeys::new(alice.clone(), &grant(1, &k1)).unwrap();
        let old_frame = srmc_crypto::seal(&k1, alice.as_bytes(), b"early").unwrap();

        keys.install(&grant(2, &k2)).unwrap();
        assert_eq!(keys.active_epoch(), 2);
        assert_eq!(keys.open(&old_frame).unwrap(), b"early");

        let sealed = keys.seal(b"later").unwrap();
        assert_eq!(srmc_crypto::open(&k2, alice.as_bytes(), &sealed).unwrap(), b"later");
    }

    #[test]
    fn two_rotations_retire_the_oldest_key() {
        let k1 = SecretKey::generate().unwrap();
        let alice = IdentityId::from("alice");
        let mut keys = ClientKeys::new(alice.clone(), &grant(1, &k1)).unwrap();
        let old_frame = srmc_crypto::seal(&k1, alice.as_bytes(), b"stale").unwrap();

        keys.install(&grant(2, &SecretKey::generate().unwrap())).unwrap();
        keys.install(&grant(3, &SecretKey::generate().unwrap())).unwrap();
        assert!(matches!(keys.open(&old_frame), Err(ClientError::Crypto(_))));
    }

    #[test]
    fn reannouncing_active_epoch_keeps_previous() {
        let k1 = SecretKey::generate().unwrap();
        let k2 = SecretKey::generate().unwrap();
        let alice = IdentityId::from("alice");
        let mut keys = ClientKeys::new(alice.clone(), &grant(1, &k1)).unwrap();
        keys.install(&grant(2, &k2)).unwrap();
        keys.install(&grant(2, &k2)).unwrap();

        let old_frame = srmc_crypto::seal(&k1, alice.as_bytes(), b"x").unwrap();
        assert!(keys.open(&old_frame).is_ok());
    }

    #[test]
    fn frames_for_another_identity_do_not_open() {
        let k1 = SecretKey::generate().unwrap();
        let keys = ClientKeys::new("alice".into(), &grant(1, &k1)).unwrap();
        let frame = srmc_crypto::seal(&k1, b"bob", b"hi").unwrap();
        assert!(keys.open(&frame).is_err());
    }
}
