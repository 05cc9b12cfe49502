use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::process::LaunchSpec;

pub const DEFAULT_CONFIG_FILE: &str = "dh-benchmark.toml";
pub const DEFAULT_SERVER_DIR: &str = "server";

pub const LOADER_JAR: &str = "fabric-server.jar";
pub const MOD_JAR: &str = "distant-horizons.jar";
pub const MODS_DIR: &str = "mods";
pub const WORLD_DIR: &str = "world";
pub const SERVER_PROPERTIES: &str = "server.properties";
pub const EULA_FILE: &str = "eula.txt";
pub const CACHE_DB: &str = "DistantHorizons.sqlite";

pub const DEFAULT_SEEDS: [i64; 5] = [
    5057296280818819649,
    2412466893128258733,
    3777092783861568240,
    -8505774097130463405,
    4753729061374190018,
];
pub const DEFAULT_THREAD_PRESET: &str = "I_PAID_FOR_THE_WHOLE_CPU";
pub const DEFAULT_GENERATION_RADIUS: u32 = 128;
pub const DEFAULT_FABRIC_URL: &str =
    "https://meta.fabricmc.net/v2/versions/loader/1.21.1/0.16.12/1.0.3/server/jar";
pub const DEFAULT_DH_URL: &str = "https://cdn.modrinth.com/data/uCdwusMi/versions/jkSxZOJh/DistantHorizons-neoforge-fabric-2.3.2-b-1.21.1.jar";

pub const THREAD_PRESETS: [&str; 5] = [
    "MINIMAL_IMPACT",
    "LOW_IMPACT",
    "BALANCED",
    "AGGRESSIVE",
    "I_PAID_FOR_THE_WHOLE_CPU",
];

const BASE_STARTUP_TIMEOUT: Duration = Duration::from_secs(120);
const BASE_STOP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BenchmarkConfig {
    pub ram_gb: Option<u32>,
    pub seeds: Vec<i64>,
    pub thread_preset: String,
    pub generation_radius: u32,
    pub fabric_download_url: String,
    pub dh_download_url: String,
    pub fabric_sha256: Option<String>,
    pub dh_sha256: Option<String>,
    pub extra_jvm_args: Vec<String>,
    pub java_path: String,
    pub echo_server_log: bool,
    pub timeout_scale: f64,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            ram_gb: None,
            seeds: DEFAULT_SEEDS.to_vec(),
            thread_preset: DEFAULT_THREAD_PRESET.to_string(),
            generation_radius: DEFAULT_GENERATION_RADIUS,
            fabric_download_url: DEFAULT_FABRIC_URL.to_string(),
            dh_download_url: DEFAULT_DH_URL.to_string(),
            fabric_sha256: None,
            dh_sha256: None,
            extra_jvm_args: Vec::new(),
            java_path: "java".to_string(),
            echo_server_log: true,
            timeout_scale: 1.0,
        }
    }
}

impl BenchmarkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.seeds.is_empty() {
            return Err(anyhow!("seeds must contain at least one seed"));
        }
        if self.generation_radius == 0 {
            return Err(anyhow!("generation_radius must be > 0"));
        }
        if !self.timeout_scale.is_finite() || self.timeout_scale < 0.0 {
            return Err(anyhow!(
                "timeout_scale must be a finite number >= 0, got {}",
                self.timeout_scale
            ));
        }
        if self.ram_gb == Some(0) {
            return Err(anyhow!("ram_gb must be > 0"));
        }
        if self.java_path.trim().is_empty() {
            return Err(anyhow!("java_path cannot be empty"));
        }
        for digest in [&self.fabric_sha256, &self.dh_sha256].into_iter().flatten() {
            pregen_core::normalize_sha256(digest)?;
        }
        if !THREAD_PRESETS.contains(&self.thread_preset.as_str()) {
            warn!(
                preset = %self.thread_preset,
                "unknown thread preset, sending it to the server as-is"
            );
        }
        Ok(())
    }

    /// Bound on waiting for the ready marker; `None` when `timeout_scale` is 0
    /// or scales the bound past what a `Duration` can hold.
    pub fn startup_timeout(&self) -> Option<Duration> {
        self.scaled(BASE_STARTUP_TIMEOUT)
    }

    /// Bound on waiting for exit after `stop`, before the process is killed.
    pub fn stop_timeout(&self) -> Option<Duration> {
        self.scaled(BASE_STOP_TIMEOUT)
    }

    fn scaled(&self, base: Duration) -> Option<Duration> {
        if self.timeout_scale == 0.0 {
            None
        } else {
            Duration::try_from_secs_f64(base.as_secs_f64() * self.timeout_scale).ok()
        }
    }

    pub fn launch_spec(&self, layout: &ServerLayout, ram_gb: u32) -> LaunchSpec {
        let mut args = vec![format!("-Xmx{}G", ram_gb)];
        args.extend(self.extra_jvm_args.iter().cloned());
        args.push("-jar".to_string());
        args.push(LOADER_JAR.to_string());
        args.push("nogui".to_string());
        LaunchSpec {
            program: self.java_path.clone(),
            args,
            working_dir: layout.root.clone(),
        }
    }
}

/// Loads the benchmark configuration, falling back to defaults when the file
/// does not exist.
pub fn load_config(path: &Path) -> Result<BenchmarkConfig> {
    let config = if path.exists() {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let parsed: BenchmarkConfig = toml::from_str(&raw)
            .with_context(|| format!("invalid benchmark config {}", path.display()))?;
        info!(path = %path.display(), "loaded benchmark config");
        parsed
    } else {
        info!(
            path = %path.display(),
            "config file not found, using defaults (run `pregen-bench init-config` to create one)"
        );
        BenchmarkConfig::default()
    };
    config.validate()?;
    Ok(config)
}

pub fn write_default_config(path: &Path, force: bool) -> Result<()> {
    if !force && path.exists() {
        return Err(anyhow!(
            "config file already exists (use --force): {}",
            path.display()
        ));
    }
    pregen_core::atomic_write_bytes(path, default_config_toml().as_bytes())
}

pub fn default_config_toml() -> String {
    let seeds = DEFAULT_SEEDS
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "\
# RAM allocated to the server in GB. When unset, pregen-bench asks on startup.
# ram_gb = 8

# World seeds to benchmark, in order.
seeds = [{seeds}]

# Distant Horizons thread preset used while generating.
# One of: {presets}.
thread_preset = \"{preset}\"

# Radius in chunks of the area generated around the world origin.
generation_radius = {radius}

fabric_download_url = \"{fabric}\"
dh_download_url = \"{dh}\"

# Optional sha256 digests checked after download (\"sha256:<hex>\" or bare hex).
# fabric_sha256 = \"\"
# dh_sha256 = \"\"

# Extra JVM arguments, e.g. [\"-XX:+UseG1GC\"].
extra_jvm_args = []

java_path = \"java\"

# Echo the server console while benchmarking.
echo_server_log = true

# Multiplier for the startup (120s) and shutdown (60s) timeouts. 0 waits forever.
timeout_scale = 1.0
",
        seeds = seeds,
        presets = THREAD_PRESETS.join(", "),
        preset = DEFAULT_THREAD_PRESET,
        radius = DEFAULT_GENERATION_RADIUS,
        fabric = DEFAULT_FABRIC_URL,
        dh = DEFAULT_DH_URL,
    )
}

/// Paths of one server installation, all derived from its root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerLayout {
    pub root: PathBuf,
    pub loader_jar: PathBuf,
    pub mod_jar: PathBuf,
    pub world_dir: PathBuf,
    pub cache_db: PathBuf,
    pub properties: PathBuf,
    pub eula: PathBuf,
}

impl ServerLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let mods_dir = root.join(MODS_DIR);
        let world_dir = root.join(WORLD_DIR);
        Self {
            loader_jar: root.join(LOADER_JAR),
            mod_jar: mods_dir.join(MOD_JAR),
            cache_db: world_dir.join("data").join(CACHE_DB),
            properties: root.join(SERVER_PROPERTIES),
            eula: root.join(EULA_FILE),
            world_dir,
            root,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_template_parses_to_defaults() {
        let parsed: BenchmarkConfig =
            toml::from_str(&default_config_toml()).expect("template must parse");
        assert_eq!(parsed, BenchmarkConfig::default());
        parsed.validate().expect("defaults are valid");
    }

    #[test]
    fn partial_config_keeps_defaults_for_missing_keys() {
        let parsed: BenchmarkConfig =
            toml::from_str("ram_gb = 12\nseeds = [1, -2]\n").expect("parse");
        assert_eq!(parsed.ram_gb, Some(12));
        assert_eq!(parsed.seeds, vec![1, -2]);
        assert_eq!(parsed.generation_radius, DEFAULT_GENERATION_RADIUS);
        assert_eq!(parsed.thread_preset, DEFAULT_THREAD_PRESET);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<BenchmarkConfig>("ram = 8\n").is_err());
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = BenchmarkConfig {
            seeds: Vec::new(),
            ..BenchmarkConfig::default()
        };
        assert!(cfg.validate().is_err());
        cfg.seeds = vec![1];
        cfg.timeout_scale = -1.0;
        assert!(cfg.validate().is_err());
        cfg.timeout_scale = 1.0;
        cfg.fabric_sha256 = Some("not-a-digest".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn huge_timeout_scale_means_unbounded() {
        let cfg = BenchmarkConfig {
            timeout_scale: 1e20,
            ..BenchmarkConfig::default()
        };
        cfg.validate().expect("finite scale is valid");
        assert_eq!(cfg.startup_timeout(), None);
        assert_eq!(cfg.stop_timeout(), None);
    }

    #[test]
    fn timeouts_scale_and_disable() {
        let mut cfg = BenchmarkConfig::default();
        assert_eq!(cfg.startup_timeout(), Some(Duration::from_secs(120)));
        cfg.timeout_scale = 0.5;
        assert_eq!(cfg.stop_timeout(), Some(Duration::from_secs(30)));
        cfg.timeout_scale = 0.0;
        assert_eq!(cfg.startup_timeout(), None);
        assert_eq!(cfg.stop_timeout(), None);
    }

    #[test]
    fn launch_spec_places_jvm_args_before_jar() {
        let cfg = BenchmarkConfig {
            extra_jvm_args: vec!["-XX:+UseG1GC".to_string()],
            ..BenchmarkConfig::default()
        };
        let layout = ServerLayout::new("srv");
        let spec = cfg.launch_spec(&layout, 6);
        assert_eq!(spec.program, "java");
        assert_eq!(
            spec.args,
            vec!["-Xmx6G", "-XX:+UseG1GC", "-jar", "fabric-server.jar", "nogui"]
        );
        assert_eq!(spec.working_dir, PathBuf::from("srv"));
    }

    #[test]
    fn layout_derives_paths_from_root() {
        let layout = ServerLayout::new("/opt/server");
        assert_eq!(
            layout.cache_db,
            PathBuf::from("/opt/server/world/data/DistantHorizons.sqlite")
        );
        assert_eq!(
            layout.mod_jar,
            PathBuf::from("/opt/server/mods/distant-horizons.jar")
        );
        assert_eq!(layout.properties, PathBuf::from("/opt/server/server.properties"));
    }
}
