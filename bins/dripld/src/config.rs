use std::path::PathBuf;
use std::time::Duration;
use std::{fs, str::FromStr};

use serde::Deserialize;
use thiserror::Error;

use linkstats::{LinkAddr, LinkStatsConfig, MetricMode};
use mac::MacConfig;
use rpl::message::DagId;
use rpl::RplConfig;

use crate::constants::DEFAULT_CONFIG_FILE_PATH;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Error while reading TOML config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Error while deserializing TOML: {0}")]
    Deserialize(#[from] toml::de::Error),

    #[error("Invalid link-layer address: {0}")]
    Address(#[from] linkstats::LinkAddrParseError),

    #[error("Invalid DAG ID '{0}'")]
    DagId(String),

    #[error("At least one interface must be configured")]
    NoInterfaces,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub node: NodeSection,
    pub interfaces: Vec<InterfaceSection>,
    #[serde(default)]
    pub mac: MacSection,
    #[serde(default)]
    pub link_stats: LinkStatsSection,
    #[serde(default)]
    pub rpl: RplSection,
}

#[derive(Debug, Deserialize)]
pub struct NodeSection {
    /// Link-layer address, eight colon-separated hex octets.
    pub address: String,
    /// Operate as the DODAG root.
    #[serde(default)]
    pub root: bool,
    #[serde(default = "default_instance_id")]
    pub instance_id: u8,
    /// DODAG ID as 32 hex characters; required when `root` is set.
    pub dag_id: Option<String>,
}

fn default_instance_id() -> u8 {
    30
}

#[derive(Debug, Deserialize)]
pub struct InterfaceSection {
    pub if_id: u8,
    /// Nominal data rate in kbps.
    pub data_rate: u16,
    #[serde(default = "default_channel")]
    pub channel: i32,
}

fn default_channel() -> i32 {
    11
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MacSection {
    pub min_be: Option<u8>,
    pub max_be: Option<u8>,
    pub max_backoff: Option<u8>,
    pub max_frame_retries: Option<u8>,
    pub max_neighbor_queues: Option<usize>,
    pub max_packet_per_neighbor: Option<usize>,
    pub ack_wait_us: Option<u64>,
    pub after_ack_detected_wait_us: Option<u64>,
    pub sim_medium: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LinkStatsSection {
    /// `etx`, `etx-packet-count` or `lql`.
    pub metric: Option<String>,
    pub max_ifaces_per_neighbor: Option<usize>,
    pub max_neighbors: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RplSection {
    pub dio_interval_min: Option<u8>,
    pub dio_interval_doublings: Option<u8>,
    pub dio_redundancy: Option<u8>,
    pub max_rankinc: Option<u16>,
    pub min_hoprankinc: Option<u16>,
    pub default_lifetime: Option<u8>,
    pub lifetime_unit: Option<u16>,
    pub dao_delay_seconds: Option<u64>,
    pub dis_interval_seconds: Option<u32>,
    pub probing_interval_seconds: Option<u64>,
    pub probing_stale_interfaces_only: Option<bool>,
    pub poison_period_seconds: Option<u64>,
    pub weighted_interfaces: Option<bool>,
    pub if_weights_window_seconds: Option<u64>,
    pub if_weights_delay_seconds: Option<u64>,
    pub max_dag_per_instance: Option<usize>,
}

impl Config {
    pub fn read(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE_PATH));
        let s = fs::read_to_string(path)?;
        let c: Self = toml::from_str(&s)?;
        if c.interfaces.is_empty() {
            return Err(ConfigError::NoInterfaces);
        }
        Ok(c)
    }

    pub fn node_addr(&self) -> Result<LinkAddr, ConfigError> {
        Ok(LinkAddr::from_str(&self.node.address)?)
    }

    pub fn dag_id(&self) -> Result<DagId, ConfigError> {
        let raw = match &self.node.dag_id {
            Some(raw) => raw.clone(),
            None => return Ok(DagId::default()),
        };
        let cleaned: String = raw.chars().filter(|c| c.is_ascii_hexdigit()).collect();
        if cleaned.len() != 32 {
            return Err(ConfigError::DagId(raw));
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in cleaned.as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk).map_err(|_| ConfigError::DagId(raw.clone()))?;
            bytes[i] =
                u8::from_str_radix(hex, 16).map_err(|_| ConfigError::DagId(raw.clone()))?;
        }
        Ok(DagId::new(bytes))
    }

    pub fn mac_config(&self) -> MacConfig {
        let mut cfg = MacConfig::default();
        let m = &self.mac;
        if let Some(v) = m.min_be {
            cfg.min_be = v;
        }
        if let Some(v) = m.max_be {
            cfg.max_be = v;
        }
        if let Some(v) = m.max_backoff {
            cfg.max_backoff = v;
        }
        if let Some(v) = m.max_frame_retries {
            cfg.max_frame_retries = v;
        }
        if let Some(v) = m.max_neighbor_queues {
            cfg.max_neighbor_queues = v;
        }
        if let Some(v) = m.max_packet_per_neighbor {
            cfg.max_packet_per_neighbor = v;
        }
        if let Some(v) = m.ack_wait_us {
            cfg.ack_wait = Duration::from_micros(v);
        }
        if let Some(v) = m.after_ack_detected_wait_us {
            cfg.after_ack_detected_wait = Duration::from_micros(v);
        }
        if let Some(v) = m.sim_medium {
            cfg.sim_medium = v;
        }
        cfg
    }

    pub fn link_stats_config(&self) -> LinkStatsConfig {
        let mode = match self.link_stats.metric.as_deref() {
            Some("lql") => MetricMode::Lql,
            Some("etx-packet-count") => MetricMode::EtxPacketCount,
            _ => MetricMode::EtxEwma,
        };
        let mut cfg = LinkStatsConfig::for_mode(mode);
        if let Some(v) = self.link_stats.max_ifaces_per_neighbor {
            cfg.max_ifaces_per_neighbor = v;
        }
        if let Some(v) = self.link_stats.max_neighbors {
            cfg.max_neighbors = v;
        }
        cfg
    }

    pub fn rpl_config(&self) -> RplConfig {
        let mut cfg = RplConfig::default();
        let r = &self.rpl;
        if let Some(v) = r.dio_interval_min {
            cfg.dio_interval_min = v;
        }
        if let Some(v) = r.dio_interval_doublings {
            cfg.dio_interval_doublings = v;
        }
        if let Some(v) = r.dio_redundancy {
            cfg.dio_redundancy = v;
        }
        if let Some(v) = r.max_rankinc {
            cfg.max_rankinc = v;
        }
        if let Some(v) = r.min_hoprankinc {
            cfg.min_hoprankinc = v;
        }
        if let Some(v) = r.default_lifetime {
            cfg.default_lifetime = v;
        }
        if let Some(v) = r.lifetime_unit {
            cfg.lifetime_unit = v;
        }
        if let Some(v) = r.dao_delay_seconds {
            cfg.dao_delay = Duration::from_secs(v);
        }
        if let Some(v) = r.dis_interval_seconds {
            cfg.dis_interval = v;
        }
        if let Some(v) = r.probing_interval_seconds {
            cfg.probing_interval = Duration::from_secs(v);
        }
        if let Some(v) = r.probing_stale_interfaces_only {
            cfg.probing_stale_interfaces_only = v;
        }
        if let Some(v) = r.poison_period_seconds {
            cfg.poison_period = Duration::from_secs(v);
        }
        if let Some(v) = r.weighted_interfaces {
            cfg.weighted_interfaces = v;
        }
        if let Some(v) = r.if_weights_window_seconds {
            cfg.if_weights_window = Duration::from_secs(v);
        }
        if let Some(v) = r.if_weights_delay_seconds {
            cfg.if_weights_delay = Duration::from_secs(v);
        }
        if let Some(v) = r.max_dag_per_instance {
            cfg.max_dag_per_instance = v;
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_config() {
        let raw = r#"
            [node]
            address = "00:12:4b:00:06:0d:9b:21"
            root = true
            dag_id = "fd000000000000000000000000000001"

            [[interfaces]]
            if_id = 1
            data_rate = 250

            [[interfaces]]
            if_id = 2
            data_rate = 50
            channel = 5

            [rpl]
            dio_redundancy = 0
        "#;
        let cfg: Config = toml::from_str(raw).unwrap();
        assert!(cfg.node.root);
        assert_eq!(cfg.interfaces.len(), 2);
        assert_eq!(cfg.interfaces[1].channel, 5);
        assert!(cfg.node_addr().is_ok());
        assert_eq!(cfg.dag_id().unwrap().as_bytes()[0], 0xfd);
        assert_eq!(cfg.rpl_config().dio_redundancy, 0);
        assert_eq!(cfg.mac_config().min_be, 3);
    }

    #[test]
    fn rejects_bad_dag_id() {
        let raw = r#"
            [node]
            address = "00:00:00:00:00:00:00:01"
            dag_id = "zz"

            [[interfaces]]
            if_id = 1
            data_rate = 250
        "#;
        let cfg: Config = toml::from_str(raw).unwrap();
        assert!(cfg.dag_id().is_err());
    }
}
