use super::TriggerConfig;
use crate::Result;
use config::{Config, Environment};

impl TriggerConfig {
    /// Load from `FLUXMQ_TRIGGER_*` environment variables; `topics` is comma separated
    pub fn from_env() -> Result<Self> {
        let settings = Config::builder()
            .add_source(
                Environment::with_prefix("FLUXMQ_TRIGGER")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("topics"),
            )
            .build()
            .map_err(|e| crate::TriggerError::invalid_config(e.to_string()))?;

        let config = settings
            .try_deserialize::<TriggerConfig>()
            .map_err(|e| crate::TriggerError::invalid_config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }
}
