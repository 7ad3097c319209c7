//! Aggregate configuration for a pool node.

use std::time::Duration;

use crate::election::ElectionConfig;
use crate::lock::LockConfig;
use crate::membership::MembershipConfig;
use crate::transfer::TransferConfig;
use crate::transport::OutboundConfig;
use crate::ClusterError;

/// Everything a [`Node`](crate::Node) needs to know besides its identity
/// and transport.
#[derive(Debug, Clone, Default)]
pub struct ClusterConfig {
    pub membership: MembershipConfig,
    pub election: ElectionConfig,
    pub transfer: TransferConfig,
    pub locks: LockConfig,
    pub outbound: OutboundConfig,
}

impl ClusterConfig {
    /// Rejects settings that would stall the node.
    pub fn validate(&self) -> Result<(), ClusterError> {
        let nonzero = |what: &str, d: Duration| {
            if d.is_zero() {
                Err(ClusterError::Configuration(format!("{what} must be non-zero")))
            } else {
                Ok(())
            }
        };
        nonzero("cycle", self.membership.cycle)?;
        nonzero("initial allowed gap", self.membership.initial_allowed_gap)?;
        nonzero("liveness poll", self.transfer.liveness_poll)?;
        nonzero("audit period", self.locks.audit_period)?;
        nonzero("request timeout", self.outbound.request_timeout)?;
        if self.outbound.max_in_flight_per_peer == 0 {
            return Err(ClusterError::Configuration(
                "max in-flight requests per peer must be at least 1".into(),
            ));
        }
        if self.election.stable_cycles == 0 {
            return Err(ClusterError::Configuration(
                "election stability window must be at least one cycle".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ClusterConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_cycle_rejected() {
        let mut config = ClusterConfig::default();
        config.membership.cycle = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(ClusterError::Configuration(_))
        ));
    }

    #[test]
    fn zero_concurrency_rejected() {
        let mut config = ClusterConfig::default();
        config.outbound.max_in_flight_per_peer = 0;
        assert!(config.validate().is_err());
    }
}
