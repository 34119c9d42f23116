//! Sigchain double with readable signatures.
//!
//! A claim is its payload followed by `|{signer}` for every signature, so
//! tests can check who signed what.

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::{ClaimError, NodeId};
use crate::ports::{Claim, Sigchain};

/// Records every claim added to the local sigchain.
#[derive(Debug)]
pub struct MockSigchain {
    own: NodeId,
    claims: Mutex<Vec<Claim>>,
}

impl MockSigchain {
    /// Sigchain of node `own`.
    pub fn new(own: NodeId) -> Self {
        Self {
            own,
            claims: Mutex::new(Vec::new()),
        }
    }

    /// Claims added so far.
    pub fn claims(&self) -> Vec<Claim> {
        self.claims.lock().clone()
    }

    fn signed(claim: &Claim, signer: &NodeId) -> Claim {
        let mut bytes = claim.0.clone();
        bytes.extend_from_slice(format!("|{}", signer.to_hex()).as_bytes());
        Claim(bytes)
    }
}

#[async_trait]
impl Sigchain for MockSigchain {
    async fn create_intermediary_claim(&self, target: &NodeId) -> Result<Claim, ClaimError> {
        let payload = Claim(format!("{}->{}", self.own.to_hex(), target.to_hex()).into_bytes());
        Ok(Self::signed(&payload, &self.own))
    }

    async fn verify_doubly_signed(&self, claim: &Claim, peer: &NodeId) -> Result<(), ClaimError> {
        let suffix = format!("|{}", peer.to_hex());
        if claim.0.ends_with(suffix.as_bytes()) {
            Ok(())
        } else {
            Err(ClaimError::Verification(format!(
                "claim is not signed by {}",
                peer.to_hex()
            )))
        }
    }

    async fn counter_sign(&self, claim: &Claim) -> Result<Claim, ClaimError> {
        Ok(Self::signed(claim, &self.own))
    }

    async fn add_claim(&self, claim: Claim) -> Result<(), ClaimError> {
        self.claims.lock().push(claim);
        Ok(())
    }
}
