//! OneMount - mount a OneDrive as a local POSIX filesystem
//!
//! Single mount binary: content is fetched lazily on first access and
//! cached locally; metadata stays in sync through delta queries and an
//! optional push channel. Offline, the mount degrades to a read/write
//! cache that replays local changes on reconnection.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use onemount_core::config::Config;

mod mount;
mod stats;

/// Exit code after a clean signal-initiated shutdown.
const EXIT_SIGNAL: u8 = 128;

/// The short-flag character set, used to catch `onemount c` style misuse.
const SHORT_FLAGS: &str = "anflocwvdsieh";

#[derive(Debug, Parser)]
#[command(
    name = "onemount",
    version,
    about = "Mount a Microsoft OneDrive as a native Linux filesystem",
    disable_version_flag = true
)]
pub struct Cli {
    /// Directory to mount the drive at
    mountpoint: Option<PathBuf>,

    /// Run authentication only, then exit
    #[arg(short = 'a', long)]
    auth_only: bool,

    /// Headless authentication (no browser)
    #[arg(short = 'n', long)]
    no_browser: bool,

    /// YAML configuration file
    #[arg(short = 'f', long, value_name = "path")]
    config_file: Option<PathBuf>,

    /// Log level: fatal|error|warn|info|debug|trace
    #[arg(short = 'l', long, value_name = "level")]
    log: Option<String>,

    /// Log output: STDOUT, STDERR, or a file path
    #[arg(short = 'o', long, value_name = "output")]
    log_output: Option<String>,

    /// Cache directory
    #[arg(short = 'c', long, value_name = "path")]
    cache_dir: Option<PathBuf>,

    /// Delete the cache directory for this mount and exit
    #[arg(short = 'w', long)]
    wipe_cache: bool,

    /// Print version and exit
    #[arg(short = 'v', long)]
    version: bool,

    /// Verbose kernel bridge debug logs
    #[arg(short = 'd', long)]
    debug: bool,

    /// Walk the full remote tree in the background after mount
    #[arg(short = 's', long)]
    sync_tree: bool,

    /// Seconds between delta polls
    #[arg(short = 'i', long, value_name = "seconds")]
    delta_interval: Option<u64>,

    /// Days before unused cached content is evicted
    #[arg(short = 'e', long, value_name = "days")]
    cache_expiration: Option<u64>,

    /// Print statistics and exit without mounting
    #[arg(long)]
    stats: bool,
}

impl Cli {
    /// Merges the configuration file with command-line overrides.
    /// Command-line options win.
    fn effective_config(&self) -> anyhow::Result<Config> {
        let path = self
            .config_file
            .clone()
            .unwrap_or_else(Config::default_path);
        let mut config = if self.config_file.is_some() {
            Config::load(&path).with_context(|| format!("reading {}", path.display()))?
        } else {
            Config::load_or_default(&path)
        };

        if let Some(log) = &self.log {
            config.log = log.clone();
        }
        if let Some(output) = &self.log_output {
            config.log_output = output.clone();
        }
        if let Some(dir) = &self.cache_dir {
            config.cache_dir = dir.clone();
        }
        if self.sync_tree {
            config.sync_tree = true;
        }
        if let Some(interval) = self.delta_interval {
            config.delta_interval = interval;
        }
        if let Some(days) = self.cache_expiration {
            config.cache_expiration = days;
        }

        let errors = config.validate();
        if !errors.is_empty() {
            for error in &errors {
                eprintln!("config error: {error}");
            }
            anyhow::bail!("invalid configuration");
        }
        Ok(config)
    }
}

fn init_tracing(config: &Config, debug: bool) -> anyhow::Result<()> {
    // `fatal` is the quietest level the bridge knows; tracing tops out at
    // error
    let level = match config.log.as_str() {
        "fatal" => "error",
        other => other,
    };
    let mut filter = level.to_string();
    if debug {
        filter = format!("{filter},fuser=debug");
    }
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    match config.log_output.as_str() {
        "STDOUT" => builder.with_writer(std::io::stdout).init(),
        "STDERR" => builder.with_writer(std::io::stderr).init(),
        path => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {path}"))?;
            builder
                .with_writer(std::sync::Arc::new(file))
                .with_ansi(false)
                .init();
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.version {
        println!("onemount {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    // `onemount c` is almost always a mistyped `-c`
    if let Some(mountpoint) = &cli.mountpoint {
        let raw = mountpoint.to_string_lossy();
        if raw.len() == 1 && SHORT_FLAGS.contains(raw.chars().next().unwrap_or(' ')) {
            eprintln!("fatal: \"{raw}\" is not a mountpoint; did you mean \"-{raw}\"?");
            return ExitCode::from(1);
        }
    }

    let config = match cli.effective_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("fatal: {err:#}");
            return ExitCode::from(1);
        }
    };

    if let Err(err) = init_tracing(&config, cli.debug) {
        eprintln!("fatal: {err:#}");
        return ExitCode::from(1);
    }

    // modes that do not need a mountpoint
    if cli.wipe_cache && cli.mountpoint.is_none() {
        return match std::fs::remove_dir_all(&config.cache_dir) {
            Ok(()) => {
                println!("wiped {}", config.cache_dir.display());
                ExitCode::SUCCESS
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("fatal: wiping {}: {e}", config.cache_dir.display());
                ExitCode::from(1)
            }
        };
    }

    let Some(mountpoint) = cli.mountpoint.clone() else {
        eprintln!("fatal: a mountpoint is required (see --help)");
        return ExitCode::from(1);
    };
    let mountpoint = if mountpoint.is_absolute() {
        mountpoint
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(&mountpoint),
            Err(e) => {
                eprintln!("fatal: resolving mountpoint: {e}");
                return ExitCode::from(1);
            }
        }
    };

    if cli.wipe_cache {
        let dir = config.mount_cache_dir(&mountpoint);
        return match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                println!("wiped {}", dir.display());
                ExitCode::SUCCESS
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("fatal: wiping {}: {e}", dir.display());
                ExitCode::from(1)
            }
        };
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("fatal: starting runtime: {e}");
            return ExitCode::from(1);
        }
    };

    if cli.stats {
        return match runtime.block_on(stats::print_stats(&config, &mountpoint)) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("fatal: {e:#}");
                ExitCode::from(1)
            }
        };
    }

    if cli.auth_only {
        return match runtime.block_on(mount::verify_auth(&config, &mountpoint, cli.no_browser)) {
            Ok(account) => {
                println!("authenticated as {account}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("fatal: {e:#}");
                ExitCode::from(1)
            }
        };
    }

    match runtime.block_on(mount::run(config, mountpoint, cli.debug)) {
        Ok(mount::MountExit::Signal) => ExitCode::from(EXIT_SIGNAL),
        Ok(mount::MountExit::Finished) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("fatal: {e:#}");
            ExitCode::from(1)
        }
    }
}
