//! # Digital Signatures
//!
//! Every record that crosses the wire (gossip values, pings, pongs, prunes)
//! is authenticated with an Ed25519 signature by the identity it claims to
//! come from. The [`Signable`] trait captures that shape once so each
//! message type only has to say *which bytes* get signed.
//!
//! Malformed public keys and malformed signatures are both just "invalid":
//! callers get a boolean, never a reason.

use std::borrow::Cow;

use super::keys::{NodeIdentity, NodeKeypair, NodeSignature};

/// A message signed by the identity it names.
pub trait Signable {
    /// The identity that must have produced the signature.
    fn pubkey(&self) -> NodeIdentity;

    /// The exact bytes covered by the signature.
    fn signable_data(&self) -> Cow<'_, [u8]>;

    /// The attached signature.
    fn get_signature(&self) -> NodeSignature;

    /// Replaces the attached signature.
    fn set_signature(&mut self, signature: NodeSignature);

    /// Signs the message in place with `keypair`.
    fn sign(&mut self, keypair: &NodeKeypair) {
        let signature = keypair.sign(&self.signable_data());
        self.set_signature(signature);
    }

    /// Checks the attached signature against [`Signable::pubkey`].
    fn verify(&self) -> bool {
        self.pubkey()
            .verify(&self.signable_data(), &self.get_signature())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Note {
        from: NodeIdentity,
        body: Vec<u8>,
        signature: NodeSignature,
    }

    impl Signable for Note {
        fn pubkey(&self) -> NodeIdentity {
            self.from
        }

        fn signable_data(&self) -> Cow<'_, [u8]> {
            Cow::Borrowed(&self.body)
        }

        fn get_signature(&self) -> NodeSignature {
            self.signature
        }

        fn set_signature(&mut self, signature: NodeSignature) {
            self.signature = signature;
        }
    }

    #[test]
    fn signable_roundtrip() {
        let kp = NodeKeypair::generate();
        let mut note = Note {
            from: kp.identity(),
            body: b"hello".to_vec(),
            signature: NodeSignature::default(),
        };
        assert!(!note.verify());
        note.sign(&kp);
        assert!(note.verify());
    }

    #[test]
    fn tampered_body_fails() {
        let kp = NodeKeypair::generate();
        let mut note = Note {
            from: kp.identity(),
            body: b"hello".to_vec(),
            signature: NodeSignature::default(),
        };
        note.sign(&kp);
        note.body.push(b'!');
        assert!(!note.verify());
    }

    #[test]
    fn signature_by_other_key_fails() {
        let signer = NodeKeypair::generate();
        let claimed = NodeKeypair::generate();
        let mut note = Note {
            from: claimed.identity(),
            body: b"impersonation".to_vec(),
            signature: NodeSignature::default(),
        };
        note.sign(&signer);
        assert!(!note.verify());
    }
}
