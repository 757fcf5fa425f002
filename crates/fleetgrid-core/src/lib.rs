pub mod config;
pub mod filter;

pub use config::{
    ApiConfig, ConfigError, EngineConfig, FleetConfig, NoneErrorAction, PercentRounding, SchedulerConfig,
    StoreConfig,
};
pub use filter::{FilterError, FilterSubject, TargetFilter};
