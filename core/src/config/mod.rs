pub mod settings;

use crate::error::TriggerError;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How partitions are mapped onto the worker pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AllocationMode {
    /// Any free worker handles any partition
    #[default]
    #[serde(rename = "pool", alias = "pooled")]
    Pool,
    /// Each partition is pinned to one worker by claim position
    #[serde(rename = "static")]
    Static,
}

/// Where commit advancement comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExplicitAckMode {
    #[default]
    #[serde(rename = "disable", alias = "disabled")]
    Disable,
    /// Handler result commits unless the response asks for no-ack
    #[serde(rename = "enable", alias = "enabled")]
    Enable,
    /// Only explicit ack control messages commit
    #[serde(rename = "explicitOnly", alias = "explicit_only", alias = "explicitonly")]
    ExplicitOnly,
}

/// Where a claim starts when the group has no committed offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitialOffset {
    Earliest,
    #[default]
    Latest,
}

/// Partition assignment strategy requested from the group coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceStrategy {
    #[default]
    Range,
    #[serde(alias = "round_robin")]
    RoundRobin,
    Sticky,
}

impl FromStr for AllocationMode {
    type Err = TriggerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "" | "pool" | "pooled" => Ok(Self::Pool),
            "static" => Ok(Self::Static),
            other => Err(TriggerError::invalid_config(format!(
                "Unknown worker allocation mode: {}",
                other
            ))),
        }
    }
}

impl FromStr for ExplicitAckMode {
    type Err = TriggerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "" | "disable" | "disabled" => Ok(Self::Disable),
            "enable" | "enabled" => Ok(Self::Enable),
            "explicitonly" | "explicit_only" => Ok(Self::ExplicitOnly),
            other => Err(TriggerError::invalid_config(format!(
                "Unknown explicit ack mode: {}",
                other
            ))),
        }
    }
}

impl FromStr for InitialOffset {
    type Err = TriggerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "" | "latest" => Ok(Self::Latest),
            "earliest" => Ok(Self::Earliest),
            other => Err(TriggerError::invalid_config(format!(
                "InitialOffset must be either 'earliest' or 'latest', not '{}'",
                other
            ))),
        }
    }
}

impl FromStr for BalanceStrategy {
    type Err = TriggerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "" | "range" => Ok(Self::Range),
            "roundrobin" | "round_robin" => Ok(Self::RoundRobin),
            "sticky" => Ok(Self::Sticky),
            other => Err(TriggerError::invalid_config(format!(
                "BalanceStrategy must be either 'range', 'roundrobin' or 'sticky', not '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for AllocationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pool => write!(f, "pool"),
            Self::Static => write!(f, "static"),
        }
    }
}

impl fmt::Display for ExplicitAckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disable => write!(f, "disable"),
            Self::Enable => write!(f, "enable"),
            Self::ExplicitOnly => write!(f, "explicitOnly"),
        }
    }
}

/// Trigger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub id: String,
    pub name: String,
    pub kind: String,
    #[serde(alias = "consumerGroup")]
    pub consumer_group: String,
    pub topics: Vec<String>,
    #[serde(alias = "initialOffset")]
    pub initial_offset: InitialOffset,
    #[serde(alias = "balanceStrategy")]
    pub balance_strategy: BalanceStrategy,
    #[serde(alias = "workerAllocationMode")]
    pub worker_allocation_mode: AllocationMode,
    #[serde(alias = "explicitAckMode")]
    pub explicit_ack_mode: ExplicitAckMode,
    /// Number of processed records left uncommitted behind the newest one
    #[serde(alias = "ackWindowSize")]
    pub ack_window_size: u64,
    #[serde(alias = "maxWaitHandlerDuringRebalance")]
    pub max_wait_handler_during_rebalance_ms: u64,
    #[serde(alias = "waitExplicitAckDuringRebalanceTimeout")]
    pub wait_explicit_ack_during_rebalance_timeout_ms: u64,
    #[serde(alias = "retryBackoff")]
    pub retry_backoff_ms: u64,
    /// Bound on each wait for a free worker; unset waits indefinitely
    #[serde(alias = "allocationTimeout")]
    pub allocation_timeout_ms: Option<u64>,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            id: "trigger".to_string(),
            name: "stream-trigger".to_string(),
            kind: "kafka-cluster".to_string(),
            consumer_group: String::new(),
            topics: Vec::new(),
            initial_offset: InitialOffset::Latest,
            balance_strategy: BalanceStrategy::Range,
            worker_allocation_mode: AllocationMode::Pool,
            explicit_ack_mode: ExplicitAckMode::Disable,
            ack_window_size: 0,
            max_wait_handler_during_rebalance_ms: 5000,
            wait_explicit_ack_during_rebalance_timeout_ms: 100,
            retry_backoff_ms: 2000,
            allocation_timeout_ms: None,
        }
    }
}

impl TriggerConfig {
    /// Load from a free-form attribute map, as attached to a function trigger definition
    pub fn from_attributes(attributes: &Map<String, Value>) -> Result<Self> {
        let mut attributes = attributes.clone();

        let window = attributes
            .remove("ackWindowSize")
            .or_else(|| attributes.remove("ack_window_size"));
        if let Some(value) = window {
            let size = parse_ack_window_size(&value)?;
            attributes.insert("ack_window_size".to_string(), Value::from(size));
        }

        let config: TriggerConfig = serde_json::from_value(Value::Object(attributes))
            .map_err(|e| TriggerError::invalid_config(format!("Failed to decode attributes: {}", e)))?;
        config.validate()?;

        Ok(config)
    }

    /// Reject configurations the engine cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.topics.is_empty() {
            return Err(TriggerError::invalid_config("Topics must be set"));
        }
        if self.consumer_group.is_empty() {
            return Err(TriggerError::invalid_config("Consumer group must be set"));
        }
        if self.explicit_ack_mode == ExplicitAckMode::Enable
            && self.worker_allocation_mode == AllocationMode::Pool
        {
            return Err(TriggerError::invalid_config(
                "Explicit ack mode 'enable' requires the static worker allocation mode",
            ));
        }
        if self.allocation_timeout_ms == Some(0) {
            return Err(TriggerError::invalid_config(
                "Allocation timeout must be positive when set",
            ));
        }
        Ok(())
    }

    /// Configuration as a flat map, for diagnostics
    pub fn to_map(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Ok(Map::new()),
        }
    }

    pub fn max_wait_handler_during_rebalance(&self) -> Duration {
        Duration::from_millis(self.max_wait_handler_during_rebalance_ms)
    }

    pub fn wait_explicit_ack_during_rebalance_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_explicit_ack_during_rebalance_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn allocation_timeout(&self) -> Option<Duration> {
        self.allocation_timeout_ms.map(Duration::from_millis)
    }
}

/// Whole milliseconds of `duration`, saturating at `u64::MAX`
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn parse_ack_window_size(value: &Value) -> Result<u64> {
    let size = match value {
        Value::String(s) => s.trim().parse::<i64>().map_err(|_| {
            TriggerError::invalid_config(format!(
                "Failed loading ack window size from trigger attributes. Unsupported string: {}",
                s
            ))
        })?,
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => i,
            (None, Some(f)) => f as i64,
            _ => {
                return Err(TriggerError::invalid_config(format!(
                    "Failed loading ack window size from trigger attributes. Unsupported number: {}",
                    n
                )))
            }
        },
        other => {
            return Err(TriggerError::invalid_config(format!(
                "Failed loading ack window size from trigger attributes. Unsupported type: {}",
                other
            )))
        }
    };

    if size < 0 {
        return Err(TriggerError::invalid_config(format!(
            "Invalid ack window size '{}', window size must be a positive number",
            size
        )));
    }

    Ok(size as u64)
}

/// Builder for TriggerConfig
#[derive(Debug, Default)]
pub struct TriggerConfigBuilder {
    config: TriggerConfig,
}

impl TriggerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id<S: Into<String>>(mut self, id: S) -> Self {
        self.config.id = id.into();
        self
    }

    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn kind<S: Into<String>>(mut self, kind: S) -> Self {
        self.config.kind = kind.into();
        self
    }

    pub fn consumer_group<S: Into<String>>(mut self, group: S) -> Self {
        self.config.consumer_group = group.into();
        self
    }

    pub fn topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.topics = topics.into_iter().map(|s| s.into()).collect();
        self
    }

    pub fn initial_offset(mut self, initial_offset: InitialOffset) -> Self {
        self.config.initial_offset = initial_offset;
        self
    }

    pub fn balance_strategy(mut self, strategy: BalanceStrategy) -> Self {
        self.config.balance_strategy = strategy;
        self
    }

    pub fn worker_allocation_mode(mut self, mode: AllocationMode) -> Self {
        self.config.worker_allocation_mode = mode;
        self
    }

    pub fn explicit_ack_mode(mut self, mode: ExplicitAckMode) -> Self {
        self.config.explicit_ack_mode = mode;
        self
    }

    pub fn ack_window_size(mut self, size: u64) -> Self {
        self.config.ack_window_size = size;
        self
    }

    pub fn max_wait_handler_during_rebalance(mut self, timeout: Duration) -> Self {
        self.config.max_wait_handler_during_rebalance_ms = millis(timeout);
        self
    }

    pub fn wait_explicit_ack_during_rebalance_timeout(mut self, timeout: Duration) -> Self {
        self.config.wait_explicit_ack_during_rebalance_timeout_ms = millis(timeout);
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.config.retry_backoff_ms = millis(backoff);
        self
    }

    pub fn allocation_timeout(mut self, timeout: Duration) -> Self {
        self.config.allocation_timeout_ms = Some(millis(timeout));
        self
    }

    pub fn build(self) -> TriggerConfig {
        self.config
    }
}
