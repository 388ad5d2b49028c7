//! Domain entities with no I/O dependencies: configuration, origin trust,
//! and the simulation/session data model.

pub mod config;
pub mod origin;
pub mod state;

pub use config::BridgeConfig;
pub use origin::{OriginPolicy, DEFAULT_ALLOWED_ORIGINS};
pub use state::{
    ChipEvent, ComponentState, CustomChipData, FileUpdate, PerformanceMetrics, PinMode, PinState,
    PinValue, SessionState, SimulationState,
};
