use std::net::IpAddr;

use async_trait::async_trait;
use tracing::trace;

use crate::domain::TransportError;
use crate::ports::HostResolver;

/// Resolves host names with the system resolver through tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioHostResolver;

impl TokioHostResolver {
    /// Create a new resolver.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl HostResolver for TokioHostResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, TransportError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let resolved = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| TransportError::Resolve {
                host: host.to_string(),
                reason: e.to_string(),
            })?;

        let mut ips: Vec<IpAddr> = Vec::new();
        for addr in resolved {
            if !ips.contains(&addr.ip()) {
                ips.push(addr.ip());
            }
        }
        if ips.is_empty() {
            return Err(TransportError::Resolve {
                host: host.to_string(),
                reason: "no addresses".into(),
            });
        }
        trace!(host, resolved = ips.len(), "Host resolved");
        Ok(ips)
    }
}
