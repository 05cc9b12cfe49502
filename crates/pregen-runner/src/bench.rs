use anyhow::{Context, Result};
use serde::{Serialize, Serializer};
use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{BenchmarkConfig, ServerLayout};
use crate::error::WatchError;
use crate::process::{LaunchSpec, ServerLauncher, ServerSession, StopOutcome};
use crate::provision::{Artifact, ArtifactFetcher};
use crate::watch::{
    format_elapsed, EchoTarget, LogWatcher, PhaseTracker, PregenTimer, PREGEN_COMPLETE_MARKER,
    PREGEN_STARTED_MARKER, READY_MARKER,
};

/// Settle time after the ready marker before the first command.
pub const STARTUP_GRACE: Duration = Duration::from_secs(5);
/// Settle time between the thread-preset and pregen-start commands.
pub const COMMAND_SETTLE: Duration = Duration::from_secs(5);
/// Wait after pregen completes so the mod can finish writing its database.
pub const PRE_STOP_SETTLE: Duration = Duration::from_secs(30);

pub const PREGEN_DIMENSION: &str = "minecraft:overworld";

/// Fixed waits used where the server prints nothing to wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delays {
    pub startup_grace: Duration,
    pub command_settle: Duration,
    pub pre_stop_settle: Duration,
}

impl Default for Delays {
    fn default() -> Self {
        Self {
            startup_grace: STARTUP_GRACE,
            command_settle: COMMAND_SETTLE,
            pre_stop_settle: PRE_STOP_SETTLE,
        }
    }
}

impl Delays {
    pub fn none() -> Self {
        Self {
            startup_grace: Duration::ZERO,
            command_settle: Duration::ZERO,
            pre_stop_settle: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timeouts {
    pub startup: Option<Duration>,
    pub stop: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BenchmarkResult {
    pub seed: i64,
    /// Serialized as `H:MM:SS`, or null when the pregen start was never seen.
    #[serde(serialize_with = "serialize_elapsed")]
    pub elapsed: Option<Duration>,
    pub cache_size_bytes: u64,
}

fn serialize_elapsed<S: Serializer>(
    elapsed: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match elapsed {
        Some(d) => serializer.serialize_str(&format_elapsed(*d)),
        None => serializer.serialize_none(),
    }
}

impl BenchmarkResult {
    /// `H:MM:SS`, or an empty string when the pregen start was never seen.
    pub fn elapsed_display(&self) -> String {
        self.elapsed.map(format_elapsed).unwrap_or_default()
    }

    pub fn cache_size_mb(&self) -> f64 {
        self.cache_size_bytes as f64 / (1024.0 * 1024.0)
    }

    pub fn summary_line(&self) -> String {
        format!(
            "Seed {}: Elapsed Time: {}, Cache Size: {:.2} MB",
            self.seed,
            self.elapsed_display(),
            self.cache_size_mb()
        )
    }
}

pub fn thread_preset_command(preset: &str) -> String {
    format!("dh config common.threadPreset {}", preset)
}

pub fn pregen_start_command(radius: u32) -> String {
    format!("dh pregen start {} 0 0 {}", PREGEN_DIMENSION, radius)
}

/// Everything one benchmark session needs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub layout: ServerLayout,
    pub launch: LaunchSpec,
    pub seeds: Vec<i64>,
    pub thread_preset: String,
    pub generation_radius: u32,
    pub delays: Delays,
    pub timeouts: Timeouts,
    pub echo: EchoTarget,
}

impl RunSettings {
    pub fn from_config(
        config: &BenchmarkConfig,
        layout: ServerLayout,
        ram_gb: u32,
        echo: EchoTarget,
    ) -> Self {
        Self {
            launch: config.launch_spec(&layout, ram_gb),
            layout,
            seeds: config.seeds.clone(),
            thread_preset: config.thread_preset.clone(),
            generation_radius: config.generation_radius,
            delays: Delays::default(),
            timeouts: Timeouts {
                startup: config.startup_timeout(),
                stop: config.stop_timeout(),
            },
            echo,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preparation {
    pub loader_downloaded: bool,
    pub mod_downloaded: bool,
    pub bootstrapped: bool,
}

/// Drives the server through the per-seed pregeneration protocol.
pub struct Orchestrator<L: ServerLauncher> {
    settings: RunSettings,
    launcher: L,
    watcher: LogWatcher,
}

impl<L: ServerLauncher> Orchestrator<L> {
    pub fn new(settings: RunSettings, launcher: L) -> Self {
        let watcher = LogWatcher::new(settings.echo.clone());
        Self {
            settings,
            launcher,
            watcher,
        }
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Provisions the loader and mod, and makes sure the server's own config
    /// files exist with the EULA accepted and the whitelist enabled.
    ///
    /// The throwaway bootstrap launch runs when the loader was just fetched or
    /// when the generated config files are missing; patching runs every time.
    pub fn prepare<F: ArtifactFetcher>(
        &self,
        config: &BenchmarkConfig,
        fetcher: &F,
    ) -> Result<Preparation> {
        let layout = &self.settings.layout;
        let loader_downloaded = fetcher.ensure(&Artifact {
            label: "Fabric server",
            url: &config.fabric_download_url,
            dest: &layout.loader_jar,
            sha256: config.fabric_sha256.as_deref(),
        })?;

        let bootstrapped =
            loader_downloaded || !layout.eula.exists() || !layout.properties.exists();
        if bootstrapped {
            info!("starting the server once to generate its default config files");
            self.bootstrap()?;
        }
        patch_if_present(&layout.eula, "eula=", "eula=true")?;
        patch_if_present(&layout.properties, "white-list=", "white-list=true")?;

        let mod_downloaded = fetcher.ensure(&Artifact {
            label: "Distant Horizons",
            url: &config.dh_download_url,
            dest: &layout.mod_jar,
            sha256: config.dh_sha256.as_deref(),
        })?;

        Ok(Preparation {
            loader_downloaded,
            mod_downloaded,
            bootstrapped,
        })
    }

    /// Launches the server once and stops it. A fresh server usually exits on
    /// its own after writing `eula.txt`, which is not an error here.
    pub fn bootstrap(&self) -> Result<()> {
        let mut session = self.launcher.launch(&self.settings.launch)?;
        match self
            .watcher
            .await_marker(&mut session, &[READY_MARKER], self.settings.timeouts.startup)
        {
            Ok(_) => info!("server reached ready state during bootstrap"),
            Err(err) => match err.downcast_ref::<WatchError>() {
                Some(WatchError::StreamEnded { .. }) => {
                    info!("server exited during bootstrap (EULA not accepted yet)")
                }
                Some(WatchError::TimedOut { .. }) => {
                    warn!("server neither exited nor became ready during bootstrap")
                }
                None => return Err(err),
            },
        }
        session.stop(self.settings.timeouts.stop)?;
        Ok(())
    }

    /// Runs every configured seed in order. The first failure aborts the
    /// remaining seeds.
    pub fn run_all<F: FnMut(&BenchmarkResult)>(
        &self,
        mut on_result: F,
    ) -> Result<Vec<BenchmarkResult>> {
        let total = self.settings.seeds.len();
        let mut results = Vec::with_capacity(total);
        for (idx, seed) in self.settings.seeds.iter().copied().enumerate() {
            info!(seed, run = idx + 1, of = total, "benchmarking seed");
            let result = self
                .run_seed(seed)
                .with_context(|| format!("benchmark for seed {} failed", seed))?;
            on_result(&result);
            results.push(result);
        }
        Ok(results)
    }

    pub fn run_seed(&self, seed: i64) -> Result<BenchmarkResult> {
        let settings = &self.settings;
        let layout = &settings.layout;

        if pregen_core::remove_dir_if_exists(&layout.world_dir)? {
            info!(path = %layout.world_dir.display(), "deleted previous world");
        }
        patch_key(&layout.properties, "level-seed=", &format!("level-seed={}", seed))?;

        let mut session = self.launcher.launch(&settings.launch)?;
        let mut phases = PhaseTracker::default();

        let ready = self
            .watcher
            .await_marker(&mut session, &[READY_MARKER], settings.timeouts.startup)
            .context("server did not finish starting")?;
        phases.observe(&ready.line.text);
        info!(seed, phase = phases.phase().as_str(), "server ready");

        pause(settings.delays.startup_grace);
        session.send_command(&thread_preset_command(&settings.thread_preset))?;
        pause(settings.delays.command_settle);
        info!(seed, radius = settings.generation_radius, "starting pregen");
        session.send_command(&pregen_start_command(settings.generation_radius))?;

        let mut timer = PregenTimer::default();
        let first = self
            .watcher
            .await_marker(
                &mut session,
                &[PREGEN_STARTED_MARKER, PREGEN_COMPLETE_MARKER],
                None,
            )
            .context("pregen never started")?;
        phases.observe(&first.line.text);
        let complete = if first.is(PREGEN_STARTED_MARKER) {
            timer.start(first.line.at);
            info!(seed, phase = phases.phase().as_str(), "pregen started");
            let complete = self
                .watcher
                .await_marker(&mut session, &[PREGEN_COMPLETE_MARKER], None)
                .context("pregen never completed")?;
            phases.observe(&complete.line.text);
            complete
        } else {
            warn!(seed, "pregen completed without a start marker, elapsed time is unset");
            first
        };
        let elapsed = timer.finish(complete.line.at);
        info!(
            seed,
            phase = phases.phase().as_str(),
            elapsed = %elapsed.map(format_elapsed).unwrap_or_default(),
            "pregen complete, shutting down server"
        );

        pause(settings.delays.pre_stop_settle);
        let outcome = session.stop(settings.timeouts.stop)?;
        phases.mark_stopped();
        if outcome == StopOutcome::Killed {
            warn!(seed, "server had to be killed, cache size may be incomplete");
        }
        drop(session);

        let cache_size_bytes = match pregen_core::file_len(&layout.cache_db)? {
            Some(len) => len,
            None => {
                warn!(path = %layout.cache_db.display(), "cache database not found, reporting 0 bytes");
                0
            }
        };

        Ok(BenchmarkResult {
            seed,
            elapsed,
            cache_size_bytes,
        })
    }
}

fn pause(delay: Duration) {
    if !delay.is_zero() {
        thread::sleep(delay);
    }
}

fn patch_key(path: &Path, prefix: &str, new_line: &str) -> Result<()> {
    let replaced = pregen_core::update_config_line(path, prefix, new_line)?;
    if replaced == 0 {
        warn!(path = %path.display(), key = prefix, "key not present, nothing patched");
    }
    Ok(())
}

fn patch_if_present(path: &Path, prefix: &str, new_line: &str) -> Result<()> {
    if !path.exists() {
        warn!(path = %path.display(), key = prefix, "config file missing, nothing patched");
        return Ok(());
    }
    patch_key(path, prefix, new_line)
}
