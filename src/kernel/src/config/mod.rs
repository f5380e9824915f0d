//! Kernel configuration
//!
//! Settings come from TOML layers merged in order (built-in defaults, a
//! file, then overrides) before being deserialized into [`KernelConfig`].

use crate::network::addr::{Address, AddressMask};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;
use toml::Value;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    pub memory: MemoryConfig,
    pub packets: PacketConfig,
    pub network: NetworkConfig,
    pub interrupts: InterruptConfig,
    pub scheduler: SchedulerConfig,
    pub router: RouterConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryConfig {
    /// Start of the simulated RAM extent
    pub ram_base: u64,
    pub ram_size: u64,
    /// Backing memory reserved for each new context
    pub context_arena_size: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PacketConfig {
    pub pool_size: usize,
    pub queue_len: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    /// Prefix every context address is generated in
    pub system_mask: AddressMask,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InterruptConfig {
    /// Host signals handed out by interrupt allocation
    pub signals: Vec<i32>,
    /// Host clock period; zero leaves the clock to explicit raises
    pub clock_interval_us: u64,
    /// Install real signal handlers for allocated interrupts
    pub host_signals: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    pub clock_port: u16,
    pub timer_port: u16,
    pub control_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentBackend {
    /// SysV shared memory and signals to a separate host process
    Host,
    /// In-process segment driven through a peer handle
    Local,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RouterConfig {
    /// Address of the router's shared-memory interface
    pub address: Address,
    /// Prefix reachable through shared memory
    pub nonnative_mask: AddressMask,
    /// Send everything unmatched through shared memory
    pub default_route: bool,
    pub shm_key: i32,
    pub segment: SegmentBackend,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            memory: MemoryConfig::default(),
            packets: PacketConfig::default(),
            network: NetworkConfig::default(),
            interrupts: InterruptConfig::default(),
            scheduler: SchedulerConfig::default(),
            router: RouterConfig::default(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            ram_base: 0x0010_0000,
            ram_size: 16 * 1024 * 1024,
            context_arena_size: 64 * 1024,
        }
    }
}

impl Default for PacketConfig {
    fn default() -> Self {
        PacketConfig {
            pool_size: 256,
            queue_len: 16,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            system_mask: AddressMask::SYSTEM,
        }
    }
}

impl Default for InterruptConfig {
    fn default() -> Self {
        InterruptConfig {
            signals: vec![libc::SIGUSR1, libc::SIGUSR2],
            clock_interval_us: 0,
            host_signals: true,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            clock_port: 7000,
            timer_port: pktos_shared::timer::TIMER_FIXED_UDP_PORT,
            control_port: pktos_shared::control::CONTROL_FIXED_UDP_PORT,
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            address: Address::new([0x7e, 0x8f, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]),
            nonnative_mask: AddressMask::new(
                Address::new([0x7e, 0x8f, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
                16,
            ),
            default_route: true,
            shm_key: pktos_shared::shm::SHM_KEY,
            segment: SegmentBackend::Host,
        }
    }
}

impl KernelConfig {
    /// Build a configuration from TOML layers, later layers winning
    pub fn from_layers<'a, I>(layers: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut merged = Value::Table(toml::Table::new());
        for layer in layers {
            let table: toml::Table = toml::from_str(layer)?;
            merge_value(&mut merged, Value::Table(table));
        }
        Ok(merged.try_into()?)
    }

    /// Load a file on top of the defaults, then apply `overrides`
    pub fn load(path: &Path, overrides: Option<&str>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut layers = vec![text.as_str()];
        layers.extend(overrides);
        let config = Self::from_layers(layers)?;
        crate::info!(
            "config: loaded {} (pool {} packets, system mask {})",
            path.display(),
            config.packets.pool_size,
            config.network.system_mask
        );
        Ok(config)
    }
}

/// Merge `source` into `target`, recursing into tables key by key
fn merge_value(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Table(t), Value::Table(s)) => {
            for (k, v) in s {
                if let Some(existing) = t.get_mut(&k) {
                    merge_value(existing, v);
                } else {
                    t.insert(k, v);
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_system_constants() {
        let config = KernelConfig::default();
        assert_eq!(config.packets.pool_size, 256);
        assert_eq!(config.packets.queue_len, 16);
        assert_eq!(config.scheduler.timer_port, 4000);
        assert_eq!(config.router.shm_key as u32, 0xfeed2460);
        assert_eq!(config.network.system_mask.to_string(), "7e8e::/24");
    }

    #[test]
    fn later_layers_override_nested_keys() {
        let base = r#"
            [router]
            default_route = true
            segment = "host"
            [packets]
            pool_size = 32
        "#;
        let overrides = r#"
            [router]
            default_route = false
        "#;
        let config = KernelConfig::from_layers([base, overrides]).unwrap();
        assert!(!config.router.default_route);
        assert_eq!(config.router.segment, SegmentBackend::Host);
        assert_eq!(config.packets.pool_size, 32);
        assert_eq!(config.packets.queue_len, 16);
    }

    #[test]
    fn addresses_parse_from_text() {
        let config = KernelConfig::from_layers([r#"
            [router]
            address = "7e8f::2"
            nonnative_mask = "7e90::/16"
        "#])
        .unwrap();
        assert_eq!(config.router.address.to_string(), "7e8f::2");
        assert_eq!(config.router.nonnative_mask.len(), 16);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(KernelConfig::from_layers(["[packets]\nsize = 3"]).is_err());
    }
}
