//! Server configuration file.
//!
//! Settings resolve in order: defaults, then the TOML file, then
//! environment variables and command-line flags. Durations are written in
//! milliseconds.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tessera_cluster::{
    ClusterConfig, ElectionConfig, LockConfig, MembershipConfig, OutboundConfig, PeerId,
    TransferConfig,
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid config file '{path}': {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid {what} '{value}'")]
    Invalid { what: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseraConfig {
    /// Address the peer listener binds to.
    pub bind: String,
    pub port: u16,
    /// Address other peers use to reach this one. Defaults to bind:port.
    pub advertise: String,
    /// Site address shared by every peer in the same site. Empty means the
    /// implicit default site.
    pub site: String,
    /// Peers to announce ourselves to until membership picks us up.
    pub seeds: Vec<String>,
    /// Fixed peer id. A fresh one is generated when empty.
    pub id: String,
    /// Shared secret for peer frames. Empty disables authentication.
    pub auth_pass: String,
    pub membership: MembershipSection,
    pub election: ElectionSection,
    pub transfer: TransferSection,
    pub locks: LockSection,
    pub outbound: OutboundSection,
}

impl Default for TesseraConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 7400,
            advertise: String::new(),
            site: String::new(),
            seeds: Vec::new(),
            id: String::new(),
            auth_pass: String::new(),
            membership: MembershipSection::default(),
            election: ElectionSection::default(),
            transfer: TransferSection::default(),
            locks: LockSection::default(),
            outbound: OutboundSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipSection {
    pub cycle_ms: u64,
    pub initial_allowed_gap_ms: u64,
    pub gap_adjust_ms: u64,
}

impl Default for MembershipSection {
    fn default() -> Self {
        let d = MembershipConfig::default();
        Self {
            cycle_ms: millis(d.cycle),
            initial_allowed_gap_ms: millis(d.initial_allowed_gap),
            gap_adjust_ms: millis(d.gap_adjust),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionSection {
    pub startup_cycles: u32,
    pub stable_cycles: u32,
}

impl Default for ElectionSection {
    fn default() -> Self {
        let d = ElectionConfig::default();
        Self {
            startup_cycles: d.startup_cycles,
            stable_cycles: d.stable_cycles,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSection {
    pub confirmed_timeout_ms: u64,
    pub unconfirmed_timeout_ms: u64,
    pub unconfirmed_grace_ms: u64,
    pub liveness_poll_ms: u64,
    pub forward_ttl: u32,
}

impl Default for TransferSection {
    fn default() -> Self {
        let d = TransferConfig::default();
        Self {
            confirmed_timeout_ms: millis(d.confirmed_timeout),
            unconfirmed_timeout_ms: millis(d.unconfirmed_timeout),
            unconfirmed_grace_ms: millis(d.unconfirmed_grace),
            liveness_poll_ms: millis(d.liveness_poll),
            forward_ttl: d.forward_ttl,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSection {
    pub audit_period_ms: u64,
    pub audit_grace_ms: u64,
    pub audit_retry_ms: u64,
    pub forward_ttl: u32,
    pub notify_retry_ms: u64,
    pub notify_attempts: u32,
}

impl Default for LockSection {
    fn default() -> Self {
        let d = LockConfig::default();
        Self {
            audit_period_ms: millis(d.audit_period),
            audit_grace_ms: millis(d.audit_grace),
            audit_retry_ms: millis(d.audit_retry),
            forward_ttl: d.forward_ttl,
            notify_retry_ms: millis(d.notify_retry),
            notify_attempts: d.notify_attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundSection {
    pub max_in_flight_per_peer: usize,
    pub request_timeout_ms: u64,
}

impl Default for OutboundSection {
    fn default() -> Self {
        let d = OutboundConfig::default();
        Self {
            max_in_flight_per_peer: d.max_in_flight_per_peer,
            request_timeout_ms: millis(d.request_timeout),
        }
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

fn resolve(what: &'static str, value: &str) -> Result<SocketAddr, ConfigError> {
    let invalid = || ConfigError::Invalid {
        what,
        value: value.to_string(),
    };
    value
        .to_socket_addrs()
        .map_err(|_| invalid())?
        .next()
        .ok_or_else(invalid)
}

impl TesseraConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        resolve("bind address", &format!("{}:{}", self.bind, self.port))
    }

    /// The address peers should dial.
    pub fn advertise_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.advertise.is_empty() {
            self.bind_addr()
        } else {
            resolve("advertise address", &self.advertise)
        }
    }

    pub fn site_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        if self.site.is_empty() {
            Ok(None)
        } else {
            resolve("site address", &self.site).map(Some)
        }
    }

    pub fn seed_addrs(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        self.seeds.iter().map(|s| resolve("seed address", s)).collect()
    }

    pub fn peer_id(&self) -> Result<PeerId, ConfigError> {
        if self.id.is_empty() {
            return Ok(PeerId::new());
        }
        PeerId::parse(&self.id).map_err(|_| ConfigError::Invalid {
            what: "peer id",
            value: self.id.clone(),
        })
    }

    pub fn to_cluster_config(&self) -> ClusterConfig {
        let ms = Duration::from_millis;
        ClusterConfig {
            membership: MembershipConfig {
                cycle: ms(self.membership.cycle_ms),
                initial_allowed_gap: ms(self.membership.initial_allowed_gap_ms),
                gap_adjust: ms(self.membership.gap_adjust_ms),
            },
            election: ElectionConfig {
                startup_cycles: self.election.startup_cycles,
                stable_cycles: self.election.stable_cycles,
            },
            transfer: TransferConfig {
                confirmed_timeout: ms(self.transfer.confirmed_timeout_ms),
                unconfirmed_timeout: ms(self.transfer.unconfirmed_timeout_ms),
                unconfirmed_grace: ms(self.transfer.unconfirmed_grace_ms),
                liveness_poll: ms(self.transfer.liveness_poll_ms),
                forward_ttl: self.transfer.forward_ttl,
            },
            locks: LockConfig {
                audit_period: ms(self.locks.audit_period_ms),
                audit_grace: ms(self.locks.audit_grace_ms),
                audit_retry: ms(self.locks.audit_retry_ms),
                forward_ttl: self.locks.forward_ttl,
                notify_retry: ms(self.locks.notify_retry_ms),
                notify_attempts: self.locks.notify_attempts,
            },
            outbound: OutboundConfig {
                max_in_flight_per_peer: self.outbound.max_in_flight_per_peer,
                request_timeout: ms(self.outbound.request_timeout_ms),
            },
        }
    }
}
