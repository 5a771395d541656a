/***************************************/
/*        3rd party libraries          */
/***************************************/
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/***************************************/
/*           Local modules             */
/***************************************/
use crate::shared::{ElevatorId, Floor};

/***************************************/
/*       Public data structures        */
/***************************************/
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub building: BuildingConfig,
    #[serde(default)]
    pub elevator: ElevatorConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct BusConfig {
    pub url: String,
    pub cluster: bool,
    /// Seed nodes for cluster mode. Falls back to `url` when empty.
    pub cluster_nodes: Vec<String>,
    pub request_queue: String,
    pub key_prefix: String,
    /// Pending entries idle for longer than this are handed to the next consumer.
    pub redelivery_idle_ms: u64,
    /// Connect, read and write timeout of every bus call. Blocking reads get their
    /// block time on top.
    pub io_timeout_ms: u64,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct BuildingConfig {
    pub min_floor: Floor,
    pub max_floor: Floor,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ElevatorConfig {
    pub ids: Vec<ElevatorId>,
    pub initial_floor: Floor,
    pub tick_interval_ms: u64,
    pub door_hold_ms: u64,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct SchedulerConfig {
    pub id: String,
    pub consumer_group: String,
    pub block_timeout_ms: u64,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub factor: f64,
    pub max_delay_ms: u64,
    pub jitter_ratio: f64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/***************************************/
/*              Defaults               */
/***************************************/
impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            url: "redis://127.0.0.1:6379".to_string(),
            cluster: false,
            cluster_nodes: Vec::new(),
            request_queue: "elevator:requests:stream".to_string(),
            key_prefix: "elevator".to_string(),
            redelivery_idle_ms: 30_000,
            io_timeout_ms: 2000,
        }
    }
}

impl Default for BuildingConfig {
    fn default() -> Self {
        BuildingConfig {
            min_floor: 1,
            max_floor: 10,
        }
    }
}

impl Default for ElevatorConfig {
    fn default() -> Self {
        ElevatorConfig {
            ids: vec![1, 2, 3],
            initial_floor: 1,
            tick_interval_ms: 1000,
            door_hold_ms: 2000,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            id: "1".to_string(),
            consumer_group: "scheduler-group".to_string(),
            block_timeout_ms: 1000,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 5,
            base_delay_ms: 100,
            factor: 2.0,
            max_delay_ms: 5000,
            jitter_ratio: 0.25,
        }
    }
}

/***************************************/
/*             Public API              */
/***************************************/
impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let building = &self.building;
        if building.min_floor > building.max_floor {
            return Err(ConfigError::Invalid(format!(
                "min_floor ({}) is above max_floor ({})",
                building.min_floor, building.max_floor
            )));
        }
        if !building.contains(self.elevator.initial_floor) {
            return Err(ConfigError::Invalid(format!(
                "initial_floor {} is outside [{}, {}]",
                self.elevator.initial_floor, building.min_floor, building.max_floor
            )));
        }

        if self.elevator.ids.is_empty() {
            return Err(ConfigError::Invalid("no elevator ids configured".to_string()));
        }
        let mut seen = HashSet::new();
        for id in self.elevator.ids.iter() {
            if !seen.insert(id) {
                return Err(ConfigError::Invalid(format!("duplicate elevator id {}", id)));
            }
        }

        if self.elevator.tick_interval_ms == 0 || self.elevator.door_hold_ms == 0 {
            return Err(ConfigError::Invalid(
                "tick_interval_ms and door_hold_ms must be positive".to_string(),
            ));
        }
        if self.scheduler.block_timeout_ms == 0 || self.bus.io_timeout_ms == 0 {
            // A zero BLOCK waits forever on the broker side
            return Err(ConfigError::Invalid(
                "scheduler.block_timeout_ms and bus.io_timeout_ms must be positive".to_string(),
            ));
        }
        if self.scheduler.consumer_group.is_empty() {
            return Err(ConfigError::Invalid("consumer_group must not be empty".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".to_string()));
        }
        if self.retry.factor < 1.0 || !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            return Err(ConfigError::Invalid(
                "retry.factor must be >= 1 and retry.jitter_ratio within [0, 1]".to_string(),
            ));
        }

        Ok(())
    }
}

impl BusConfig {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

impl BuildingConfig {
    pub fn contains(&self, floor: Floor) -> bool {
        (self.min_floor..=self.max_floor).contains(&floor)
    }
}

impl ElevatorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn door_hold(&self) -> Duration {
        Duration::from_millis(self.door_hold_ms)
    }
}

impl SchedulerConfig {
    pub fn consumer_name(&self) -> String {
        format!("scheduler-{}", self.id)
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let config_str = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&config_str)
}

pub fn parse_config(config_str: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(config_str)?;
    config.validate()?;
    Ok(config)
}
