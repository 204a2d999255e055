//! pkgrelay daemon entry point.
//!
//! Reads the TOML configuration, constructs one service per enabled mirror
//! with its dependencies passed explicitly (store, vault, state channel),
//! runs every sync loop on its own thread and binds the HTTP endpoint.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossbeam::channel::unbounded;
use pkgrelay::bower::{BowerConfig, BowerService};
use pkgrelay::composer::{ComposerConfig, ComposerService};
use pkgrelay::git::{GitConfig, GitService};
use pkgrelay::npm::{NpmConfig, NpmService};
use pkgrelay::service::MirrorService;
use pkgrelay::statics::{StaticMirrorConfig, StaticService};
use pkgrelay_config::Config;
use pkgrelay_httpd::{HttpServer, Mirrors};
use pkgrelay_state::{SseBroker, StateSender};
use pkgrelay_types::{MirrorKind, mirror_id};
use pkgrelay_vault::Vault;

#[derive(Parser, Debug)]
#[command(name = "pkgrelay", version)]
#[command(about = "Multi-protocol package-registry mirror")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "/etc/pkgrelay.toml")]
    file: PathBuf,

    /// Log level (overrides the configured one)
    #[arg(long)]
    log_level: Option<String>,

    /// Shortcut for --log-level debug
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every enabled mirror and the HTTP endpoint
    Serve,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.file)?;

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        cli.log_level.clone().unwrap_or_else(|| config.log_level.clone())
    };
    let filter = tracing_subscriber::EnvFilter::try_new(&level)
        .with_context(|| format!("unable to parse the log level: {level}"))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.cmd {
        Commands::Serve => serve(config),
    }
}

fn serve(config: Config) -> Result<()> {
    let (state_tx, state_rx) = unbounded();
    let broker = Arc::new(SseBroker::spawn(state_rx));

    let mut mirrors = Mirrors::default();
    let mut services: Vec<(String, Arc<dyn MirrorService>)> = Vec::new();

    for (code, conf) in &config.composer {
        if !conf.enabled {
            continue;
        }
        let id = mirror_id(MirrorKind::Composer, code);
        let svc = Arc::new(ComposerService::new(
            ComposerConfig {
                code: code.clone(),
                source_server: conf.server.clone(),
                public_server: config.public_server.clone(),
                data_dir: config.data_dir.join("composer"),
                sync_interval: conf.sync_interval,
            },
            StateSender::new(id.clone(), state_tx.clone()),
        ));
        svc.init().with_context(|| format!("unable to init {id}"))?;
        mirrors.composer.insert(code.clone(), Arc::clone(&svc));
        services.push((id, svc));
    }

    for (code, conf) in &config.npm {
        if !conf.enabled {
            continue;
        }
        let id = mirror_id(MirrorKind::Npm, code);
        let svc = Arc::new(NpmService::new(
            NpmConfig {
                code: code.clone(),
                source_server: conf.server.clone(),
                public_server: config.public_server.clone(),
                fallback_servers: conf.fallbacks.iter().map(|f| f.server.clone()).collect(),
                data_dir: config.data_dir.join("npm"),
                sync_interval: conf.sync_interval,
            },
            StateSender::new(id.clone(), state_tx.clone()),
            Vault::filesystem(config.cache_dir.join("npm")),
        ));
        svc.init().with_context(|| format!("unable to init {id}"))?;
        mirrors.npm.insert(code.clone(), Arc::clone(&svc));
        services.push((id, svc));
    }

    for (code, conf) in &config.git {
        if !conf.enabled {
            continue;
        }
        let id = mirror_id(MirrorKind::Git, code);
        let svc = Arc::new(GitService::new(
            GitConfig {
                code: code.clone(),
                server: conf.server.clone(),
                public_server: config.public_server.clone(),
                data_dir: config.data_dir.join("git"),
                binary: "git".to_string(),
                clone_template: conf.clone.clone(),
                sync_interval: conf.sync_interval,
            },
            StateSender::new(id.clone(), state_tx.clone()),
            Vault::filesystem(config.cache_dir.join("git")),
        ));
        svc.init().with_context(|| format!("unable to init {id}"))?;
        mirrors.git.push(Arc::clone(&svc));
        services.push((id, svc));
    }

    for (code, conf) in &config.bower {
        if !conf.enabled {
            continue;
        }
        let id = mirror_id(MirrorKind::Bower, code);
        let svc = Arc::new(BowerService::new(
            BowerConfig {
                code: code.clone(),
                source_server: conf.server.clone(),
                public_server: config.public_server.clone(),
                data_dir: config.data_dir.join("bower"),
                sync_interval: conf.sync_interval,
            },
            StateSender::new(id.clone(), state_tx.clone()),
        ));
        svc.init().with_context(|| format!("unable to init {id}"))?;
        mirrors.bower.insert(code.clone(), Arc::clone(&svc));
        services.push((id, svc));
    }

    for (code, conf) in &config.statics {
        if !conf.enabled {
            continue;
        }
        let id = mirror_id(MirrorKind::Static, code);
        let svc = Arc::new(StaticService::new(
            StaticMirrorConfig {
                code: code.clone(),
                source_server: conf.server.clone(),
                data_dir: config.data_dir.join("static"),
            },
            StateSender::new(id.clone(), state_tx.clone()),
            Vault::filesystem(config.cache_dir.join("static")),
        ));
        svc.init().with_context(|| format!("unable to init {id}"))?;
        mirrors.statics.insert(code.clone(), Arc::clone(&svc));
        services.push((id, svc));
    }

    let (shutdown_tx, shutdown_rx) = unbounded::<()>();
    let mut handles = Vec::new();
    for (id, svc) in services {
        tracing::info!(mirror = %id, "start sync loop");
        let rx = shutdown_rx.clone();
        let name = id.clone();
        let handle = std::thread::Builder::new()
            .name(id.clone())
            .spawn(move || {
                if let Err(err) = svc.serve(rx) {
                    tracing::error!(mirror = %name, error = %err, "mirror service stopped");
                }
            })
            .context("unable to spawn mirror thread")?;
        handles.push(handle);
    }

    let http = HttpServer::new(config.clone(), Arc::new(mirrors), broker);
    let result = http.run(&config.internal_server, shutdown_rx);

    // closing the channel wakes every sync loop
    drop(shutdown_tx);
    for handle in handles {
        let _ = handle.join();
    }

    result
}
