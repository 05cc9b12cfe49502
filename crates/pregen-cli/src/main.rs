use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use pregen_runner::{
    BenchmarkConfig, BenchmarkResult, EchoTarget, LiveServers, Orchestrator, Preparation,
    ProcessLauncher, Provisioner, RunSettings, ServerLayout, DEFAULT_CONFIG_FILE,
    DEFAULT_SERVER_DIR,
};
use serde_json::{json, Value};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "pregen-bench",
    version,
    about = "Distant Horizons world pregeneration benchmark"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision the server and benchmark every configured seed.
    Run {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        #[arg(long, default_value = DEFAULT_SERVER_DIR)]
        server_dir: PathBuf,
        /// Server heap size in GB. Falls back to `ram_gb` in the config, then a prompt.
        #[arg(long)]
        ram_gb: Option<u32>,
        /// Do not echo the server console.
        #[arg(long)]
        quiet_server_log: bool,
        #[arg(long)]
        json: bool,
    },
    /// Write a config file with every option at its default.
    InitConfig {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        #[arg(long)]
        force: bool,
    },
    /// Show the resolved configuration and server layout without running anything.
    Describe {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        #[arg(long, default_value = DEFAULT_SERVER_DIR)]
        server_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            config,
            server_dir,
            ram_gb,
            quiet_server_log,
            json,
        } => {
            let cfg = pregen_runner::load_config(&config)?;
            let ram_gb = match ram_gb.or(cfg.ram_gb) {
                Some(0) => return Err(anyhow!("ram_gb must be > 0")),
                Some(v) => v,
                None => {
                    let answer = prompt_ram_gb(json)?;
                    match parse_ram_gb(&answer) {
                        Some(v) => v,
                        None if json => return Ok(Some(invalid_ram_payload(&answer))),
                        None => {
                            eprintln!(
                                "invalid RAM value {:?}: expected a whole number of gigabytes, exiting",
                                answer.trim()
                            );
                            return Ok(None);
                        }
                    }
                }
            };
            let echo = if json {
                EchoTarget::Stderr
            } else if quiet_server_log || !cfg.echo_server_log {
                EchoTarget::Silent
            } else {
                EchoTarget::Stdout
            };

            let layout = ServerLayout::new(&server_dir);
            let settings = RunSettings::from_config(&cfg, layout, ram_gb, echo);
            info!(
                ram_gb,
                seeds = settings.seeds.len(),
                command = %settings.launch.display_command(),
                "starting benchmark"
            );
            let live = LiveServers::default();
            install_shutdown_handler(live.clone());
            let orchestrator = Orchestrator::new(settings, ProcessLauncher::new(live));
            let started_at = Utc::now();
            let preparation = orchestrator.prepare(&cfg, &Provisioner::new()?)?;
            let results = orchestrator.run_all(|r| {
                info!(
                    seed = r.seed,
                    elapsed = %r.elapsed_display(),
                    cache_bytes = r.cache_size_bytes,
                    "seed finished"
                );
            })?;

            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "ram_gb": ram_gb,
                    "server_dir": server_dir.display().to_string(),
                    "started_at": started_at.to_rfc3339(),
                    "finished_at": Utc::now().to_rfc3339(),
                    "preparation": preparation_to_json(&preparation),
                    "results": results.iter().map(result_to_json).collect::<Result<Vec<_>>>()?,
                })));
            }
            println!("Benchmark completed. Results:");
            for result in &results {
                println!("{}", result.summary_line());
            }
        }
        Commands::InitConfig { config, force } => {
            pregen_runner::write_default_config(&config, force)?;
            println!("wrote: {}", config.display());
            println!("next: pregen-bench describe --config {}", config.display());
        }
        Commands::Describe {
            config,
            server_dir,
            json,
        } => {
            let cfg = pregen_runner::load_config(&config)?;
            let layout = ServerLayout::new(&server_dir);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "config_path": config.display().to_string(),
                    "config": config_to_json(&cfg),
                    "layout": layout_to_json(&layout)?,
                })));
            }
            print_description(&config, &cfg, &layout)?;
        }
    }
    Ok(None)
}

/// Kills any running server when the benchmark is interrupted or terminated.
fn install_shutdown_handler(live: LiveServers) {
    if let Err(err) = ctrlc::set_handler(move || {
        let killed = live.kill_all();
        warn!(killed, "interrupted, exiting");
        std::process::exit(130);
    }) {
        warn!(error = %err, "failed to install shutdown handler");
    }
}

/// Asks for the heap size once and returns the raw answer.
fn prompt_ram_gb(json_mode: bool) -> Result<String> {
    let question = "How much RAM do you want to allocate to the server? (in GB): ";
    if json_mode {
        eprint!("{}", question);
        io::stderr().flush()?;
    } else {
        print!("{}", question);
        io::stdout().flush()?;
    }
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(answer)
}

fn parse_ram_gb(raw: &str) -> Option<u32> {
    match raw.trim().parse::<u32>() {
        Ok(v) if v > 0 => Some(v),
        _ => None,
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn invalid_ram_payload(answer: &str) -> Value {
    json_error(
        "invalid_input",
        "RAM must be a whole number of gigabytes greater than 0".to_string(),
        json!({ "field": "ram_gb", "input": answer.trim() }),
    )
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. } | Commands::Describe { json, .. } => *json,
        Commands::InitConfig { .. } => false,
    }
}

fn result_to_json(result: &BenchmarkResult) -> Result<Value> {
    let mut value = serde_json::to_value(result)?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert(
            "elapsed_ms".to_string(),
            json!(result.elapsed.map(|d| d.as_millis() as u64)),
        );
        obj.insert(
            "cache_size_mb".to_string(),
            json!((result.cache_size_mb() * 100.0).round() / 100.0),
        );
    }
    Ok(value)
}

fn preparation_to_json(prep: &Preparation) -> Value {
    json!({
        "loader_downloaded": prep.loader_downloaded,
        "mod_downloaded": prep.mod_downloaded,
        "bootstrapped": prep.bootstrapped,
    })
}

fn config_to_json(cfg: &BenchmarkConfig) -> Value {
    json!({
        "ram_gb": cfg.ram_gb,
        "seeds": cfg.seeds,
        "thread_preset": cfg.thread_preset,
        "generation_radius": cfg.generation_radius,
        "fabric_download_url": cfg.fabric_download_url,
        "dh_download_url": cfg.dh_download_url,
        "extra_jvm_args": cfg.extra_jvm_args,
        "java_path": cfg.java_path,
        "echo_server_log": cfg.echo_server_log,
        "timeout_scale": cfg.timeout_scale,
        "startup_timeout_secs": cfg.startup_timeout().map(|d| d.as_secs()),
        "stop_timeout_secs": cfg.stop_timeout().map(|d| d.as_secs()),
    })
}

fn artifact_to_json(path: &Path) -> Result<Value> {
    let digest = if path.is_file() {
        Some(pregen_runner::sha256_file(path)?)
    } else {
        None
    };
    Ok(json!({
        "path": path.display().to_string(),
        "present": digest.is_some(),
        "sha256": digest,
    }))
}

fn layout_to_json(layout: &ServerLayout) -> Result<Value> {
    Ok(json!({
        "root": layout.root.display().to_string(),
        "loader": artifact_to_json(&layout.loader_jar)?,
        "mod": artifact_to_json(&layout.mod_jar)?,
        "world_dir": layout.world_dir.display().to_string(),
        "cache_db": layout.cache_db.display().to_string(),
        "server_properties_present": layout.properties.exists(),
        "eula_present": layout.eula.exists(),
    }))
}

fn print_description(
    config_path: &Path,
    cfg: &BenchmarkConfig,
    layout: &ServerLayout,
) -> Result<()> {
    println!("config: {}", config_path.display());
    match cfg.ram_gb {
        Some(ram) => println!("ram_gb: {}", ram),
        None => println!("ram_gb: (prompt)"),
    }
    println!("seeds: {:?}", cfg.seeds);
    println!("thread_preset: {}", cfg.thread_preset);
    println!("generation_radius: {}", cfg.generation_radius);
    println!("fabric_download_url: {}", cfg.fabric_download_url);
    println!("dh_download_url: {}", cfg.dh_download_url);
    println!("extra_jvm_args: {:?}", cfg.extra_jvm_args);
    match cfg.startup_timeout() {
        Some(t) => println!("startup_timeout: {}s", t.as_secs()),
        None => println!("startup_timeout: none"),
    }
    match cfg.stop_timeout() {
        Some(t) => println!("stop_timeout: {}s", t.as_secs()),
        None => println!("stop_timeout: none"),
    }
    let sample = cfg.launch_spec(layout, cfg.ram_gb.unwrap_or(8));
    println!("server_command: {}", sample.display_command());
    println!("server_dir: {}", layout.root.display());
    for (label, path) in [("loader", &layout.loader_jar), ("mod", &layout.mod_jar)] {
        if path.is_file() {
            let digest = pregen_runner::sha256_file(path)?;
            println!("{}: {} ({})", label, path.display(), digest);
        } else {
            println!("{}: {} (missing)", label, path.display());
        }
    }
    println!("cache_db: {}", layout.cache_db.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn parse_ram_gb_accepts_only_positive_integers() {
        assert_eq!(parse_ram_gb("8\n"), Some(8));
        assert_eq!(parse_ram_gb("  16  "), Some(16));
        assert_eq!(parse_ram_gb("0"), None);
        assert_eq!(parse_ram_gb("-4"), None);
        assert_eq!(parse_ram_gb("8G"), None);
        assert_eq!(parse_ram_gb("4.5"), None);
        assert_eq!(parse_ram_gb(""), None);
    }

    #[test]
    fn result_json_keeps_unset_elapsed_null() {
        let done = result_to_json(&BenchmarkResult {
            seed: 7,
            elapsed: Some(Duration::from_secs(10)),
            cache_size_bytes: 1024 * 1024,
        })
        .expect("json");
        assert_eq!(done["elapsed"], json!("0:00:10"));
        assert_eq!(done["elapsed_ms"], json!(10_000));
        assert_eq!(done["cache_size_mb"], json!(1.0));

        let unset = result_to_json(&BenchmarkResult {
            seed: 7,
            elapsed: None,
            cache_size_bytes: 0,
        })
        .expect("json");
        assert!(unset["elapsed"].is_null());
        assert!(unset["elapsed_ms"].is_null());
    }

    #[test]
    fn invalid_ram_answer_becomes_json_error() {
        let payload = invalid_ram_payload("eight\n");
        assert_eq!(payload["ok"], json!(false));
        assert_eq!(payload["error"]["code"], json!("invalid_input"));
        assert_eq!(payload["error"]["details"]["input"], json!("eight"));
        assert_eq!(parse_ram_gb("eight\n"), None);
    }

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "pregen-bench",
            "run",
            "--ram-gb",
            "12",
            "--server-dir",
            "/srv/mc",
            "--json",
        ])
        .expect("parse");
        match cli.command {
            Commands::Run {
                ram_gb,
                server_dir,
                json,
                config,
                ..
            } => {
                assert_eq!(ram_gb, Some(12));
                assert_eq!(server_dir, PathBuf::from("/srv/mc"));
                assert!(json);
                assert_eq!(config, PathBuf::from(DEFAULT_CONFIG_FILE));
            }
            _ => panic!("expected run"),
        }
    }
}
