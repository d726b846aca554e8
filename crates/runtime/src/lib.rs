//! Process-level helpers shared by the model crates and the CLI.
//!
//! Nothing in here touches model math. The crate owns the seeded random
//! generators used for dropout, memory statistics, recursive device/dtype
//! moves over nested tensor containers, throughput metrics, and the probes
//! that compare the installed accelerator stack against the validated
//! release.

pub mod error;
pub mod logging;
pub mod memory;
pub mod metrics;
pub mod rng;
pub mod transfer;
pub mod version;

pub use error::RuntimeError;
pub use logging::init_logging;
pub use memory::{memory_stats, to_gb_rounded, MemorySnapshot, MemoryStatsSource, ProcessMemory};
pub use metrics::{speed_metrics, speed_metrics_from_elapsed};
pub use rng::set_seed;
pub use transfer::{to_device_dtype, NestedTensors};
pub use version::{check_runtime_versions, ProbeConfig, Version, VersionReport};
