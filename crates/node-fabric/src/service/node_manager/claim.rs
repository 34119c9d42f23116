//! Claim cross-signing over a pooled connection.
//!
//! ```text
//! initiator                         peer
//!    │── Request(intermediary) ──────►│
//!    │◄── Response(doubly signed,     │
//!    │             peer intermediary)─│
//!    │── CounterSigned(peer claim) ──►│
//! ```

use std::sync::Arc;

use tracing::debug;

use super::NodeManager;
use crate::domain::{ClaimError, NodeConnectionError, NodeId, NodeManagerError, RpcError};
use crate::ports::{ClaimChannel, ClaimMessage, PeerConnection};
use crate::service::OpContext;

impl NodeManager {
    /// Cross-sign a claim with `target`.
    ///
    /// The doubly signed claim is verified before it is added to the local
    /// sigchain. A connection-level failure of the exchange drops the
    /// pooled connection.
    pub async fn claim_node(&self, target: &NodeId, ctx: &OpContext) -> Result<(), NodeManagerError> {
        let ctx = self.op_context(ctx)?;
        let lease = self.connections.acquire_connection(target, &ctx).await?;
        let result = match ctx.run(self.exchange_claims(target, lease.connection())).await {
            Ok(result) => result.map_err(NodeManagerError::from),
            Err(interrupted) => Err(interrupted.into()),
        };
        let signal = match &result {
            Err(NodeManagerError::Claim(ClaimError::Rpc(e))) if e.is_connection_failure() => {
                Some(NodeConnectionError::Rpc(e.clone()))
            }
            _ => None,
        };
        lease.release(signal.as_ref()).await;
        match &result {
            Ok(()) => debug!(node_id = %target, "Claim exchanged"),
            Err(e) => debug!(node_id = %target, error = %e, "Claim exchange failed"),
        }
        result
    }

    async fn exchange_claims(
        &self,
        target: &NodeId,
        conn: Arc<dyn PeerConnection>,
    ) -> Result<(), ClaimError> {
        let mut channel = self
            .connections
            .ports()
            .rpc
            .open_claim_channel(conn.as_ref())
            .await?;
        let outcome = self.drive_claim(target, channel.as_mut()).await;
        if let Err(e) = channel.close().await {
            debug!(node_id = %target, error = %e, "Claim channel close failed");
        }
        outcome
    }

    async fn drive_claim(
        &self,
        target: &NodeId,
        channel: &mut dyn ClaimChannel,
    ) -> Result<(), ClaimError> {
        let request = self.sigchain.create_intermediary_claim(target).await?;
        channel.send(ClaimMessage::Request(request)).await?;

        let (doubly_signed, intermediary) = match channel.recv().await? {
            Some(ClaimMessage::Response {
                doubly_signed,
                intermediary,
            }) => (doubly_signed, intermediary),
            Some(_) => {
                return Err(ClaimError::UnexpectedMessage {
                    expected: "response",
                })
            }
            None => return Err(RpcError::StreamEnded.into()),
        };
        self.sigchain
            .verify_doubly_signed(&doubly_signed, target)
            .await?;

        let counter_signed = self.sigchain.counter_sign(&intermediary).await?;
        channel
            .send(ClaimMessage::CounterSigned(counter_signed))
            .await?;
        self.sigchain.add_claim(doubly_signed).await
    }
}
