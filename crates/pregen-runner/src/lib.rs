//! Benchmark runner for world pregeneration on a modded game server.
//!
//! The runner provisions the server, then for every seed resets the world,
//! boots the server, asks it to pregenerate a fixed area and measures how long
//! that takes and how large the resulting cache database is.

pub mod bench;
pub mod config;
pub mod error;
pub mod process;
pub mod provision;
pub mod watch;

pub use bench::{
    pregen_start_command, thread_preset_command, BenchmarkResult, Delays, Orchestrator,
    Preparation, RunSettings, Timeouts,
};
pub use config::{
    default_config_toml, load_config, write_default_config, BenchmarkConfig, ServerLayout,
    DEFAULT_CONFIG_FILE, DEFAULT_SERVER_DIR,
};
pub use error::{ProcessError, ProvisionError, WatchError};
pub use process::{
    LaunchSpec, LiveServers, ProcessLauncher, ServerLauncher, ServerProcess, ServerSession,
};
pub use provision::{Artifact, ArtifactFetcher, Provisioner};
pub use watch::{
    format_elapsed, EchoTarget, LogWatcher, Phase, PhaseTracker, PregenTimer, SharedWriter,
};

pub use pregen_core::sha256_file;
