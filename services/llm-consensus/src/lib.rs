pub mod types;
pub mod providers;
pub mod normalizers;
pub mod aggregators;
pub mod sizing;
pub mod engine;
pub mod config;
pub mod observability;

pub use types::*;
pub use aggregators::aggregate;
pub use config::{EngineSettings, ProviderSettings};
pub use engine::{BatchPrediction, ConsensusEngine, ConsensusOptions, HealthReport};
pub use normalizers::normalize_signal;
pub use observability::{MetricsCollector, MetricsSnapshot};
pub use providers::{HealthThresholds, HealthTracker, ProviderKind, ProviderRegistry, RegisteredProvider};
pub use sizing::{kelly_stake, KellySizing};
