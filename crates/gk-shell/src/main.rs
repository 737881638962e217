// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Inspect and mutate a guest filesystem the way guest programs see it

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use gk_core::{ArchiveMount, KernelConfig, KernelFs, DT_DIR, DT_LNK, K_O_CREAT, K_O_RDONLY, K_O_TRUNC, K_O_WRONLY};
use gk_logging::{CliLoggingArgs, LoggingConfig};
use serde::Deserialize;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Operate on a guest filesystem through the guest-kernel layer")]
struct Cli {
    /// TOML config file (root, archives, relocation, fault injection, [logging])
    #[arg(long)]
    config: Option<PathBuf>,

    /// Native directory backing the guest root; overrides the config file
    #[arg(long)]
    root: Option<PathBuf>,

    /// Zip archive to overlay, as PATH or PATH=GUEST_DIR (repeatable)
    #[arg(long = "archive", value_parser = parse_archive_mount)]
    archives: Vec<ArchiveMount>,

    /// Guest uid used for reported permission bits
    #[arg(long, default_value_t = 1000)]
    uid: u32,

    #[command(flatten)]
    logging: CliLoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List a directory, native and archived entries merged
    Ls { path: String },
    /// Print node attributes
    Stat { path: String },
    /// Copy a file's contents to stdout
    Cat { path: String },
    /// Replace a file's contents with stdin
    Write { path: String },
    Rm { path: String },
    Rmdir { path: String },
    Mkdir { path: String },
    Mv { from: String, to: String },
    /// Set the modification time (seconds since the epoch; default now)
    Touch {
        path: String,
        #[arg(long)]
        mtime: Option<u64>,
    },
    /// Extract an archived file or directory tree to the native root
    Materialize { path: String },
}

#[derive(Debug, Default, Deserialize)]
struct ShellConfigFile {
    #[serde(default)]
    logging: LoggingConfig,
}

fn parse_archive_mount(value: &str) -> Result<ArchiveMount, String> {
    let (path, mount) = match value.split_once('=') {
        Some((path, mount)) => (path, mount.to_string()),
        None => (value, "/".to_string()),
    };
    if path.is_empty() {
        return Err("archive path is empty".to_string());
    }
    if !mount.starts_with('/') {
        return Err(format!("archive mount point must be absolute: {}", mount));
    }
    Ok(ArchiveMount {
        path: PathBuf::from(path),
        mount,
    })
}

fn load_config(cli: &Cli) -> Result<(KernelConfig, LoggingConfig)> {
    let (mut config, logging) = match &cli.config {
        Some(path) => {
            let content = std::fs::read_to_string(path).with_context(|| format!("reading config file {:?}", path))?;
            let file: ShellConfigFile =
                toml::from_str(&content).with_context(|| format!("parsing [logging] in {:?}", path))?;
            (KernelConfig::from_toml_str(&content)?, file.logging)
        }
        None => (KernelConfig::default(), LoggingConfig::default()),
    };
    if let Some(root) = &cli.root {
        config.root = root.clone();
    }
    config.archives.extend(cli.archives.iter().cloned());
    Ok((config, logging))
}

fn type_marker(entry_type: u32) -> char {
    match entry_type {
        DT_DIR => 'd',
        DT_LNK => 'l',
        _ => '-',
    }
}

fn format_mtime(mtime_ms: u64) -> String {
    i64::try_from(mtime_ms)
        .ok()
        .and_then(chrono::DateTime::<chrono::Utc>::from_timestamp_millis)
        .map(|time| time.to_rfc3339())
        .unwrap_or_else(|| "-".to_string())
}

fn run(fs: &KernelFs, command: Command, uid: u32) -> Result<()> {
    let mut stdout = io::stdout().lock();
    match command {
        Command::Ls { path } => {
            for entry in fs.list_dir(&path).with_context(|| format!("ls {}", path))? {
                writeln!(stdout, "{} {}", type_marker(entry.entry_type), entry.name)?;
            }
        }
        Command::Stat { path } => {
            let attrs = fs.stat(&path, uid).with_context(|| format!("stat {}", path))?;
            writeln!(
                stdout,
                "NODE={}\tMODE={:o}\tSIZE={}\tMTIME={}\tNATIVE={}",
                attrs.id.0,
                attrs.mode,
                attrs.len,
                format_mtime(attrs.mtime_ms),
                fs.native_path_of(&path)?.display()
            )?;
        }
        Command::Cat { path } => {
            let handle = fs.open(&path, K_O_RDONLY).with_context(|| format!("open {}", path))?;
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let count = fs.read(handle, &mut buf)?;
                if count == 0 {
                    break;
                }
                stdout.write_all(&buf[..count])?;
            }
            fs.close(handle)?;
        }
        Command::Write { path } => {
            let mut data = Vec::new();
            io::stdin().read_to_end(&mut data).context("reading stdin")?;
            let handle = fs
                .open(&path, K_O_WRONLY | K_O_CREAT | K_O_TRUNC)
                .with_context(|| format!("open {}", path))?;
            let mut written = 0;
            while written < data.len() {
                let count = fs.write(handle, &data[written..])?;
                if count == 0 {
                    return Err(anyhow!("short write to {}", path));
                }
                written += count;
            }
            fs.close(handle)?;
            debug!(path = %path, bytes = written, "wrote file");
        }
        Command::Rm { path } => fs.remove(&path).with_context(|| format!("rm {}", path))?,
        Command::Rmdir { path } => fs.remove_dir(&path).with_context(|| format!("rmdir {}", path))?,
        Command::Mkdir { path } => fs.mkdir(&path).with_context(|| format!("mkdir {}", path))?,
        Command::Mv { from, to } => fs.rename(&from, &to).with_context(|| format!("mv {} {}", from, to))?,
        Command::Touch { path, mtime } => {
            let mtime = match mtime {
                Some(secs) => secs,
                None => u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0),
            };
            if fs.stat(&path, uid).is_err() {
                let handle = fs.open(&path, K_O_WRONLY | K_O_CREAT).with_context(|| format!("touch {}", path))?;
                fs.close(handle)?;
            }
            fs.set_times(&path, 0, mtime).with_context(|| format!("touch {}", path))?;
        }
        Command::Materialize { path } => {
            materialize(fs, &path)?;
            writeln!(stdout, "{}", fs.native_path_of(&path)?.display())?;
        }
    }
    Ok(())
}

/// Directories are walked so every archived descendant lands natively
fn materialize(fs: &KernelFs, path: &str) -> Result<()> {
    fs.ensure_local(path).with_context(|| format!("materialize {}", path))?;
    if fs.stat(path, 0)?.is_dir {
        for entry in fs.list_dir(path)? {
            let child = Path::new(path).join(&entry.name);
            materialize(fs, &child.to_string_lossy())?;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let mut cli = Cli::parse();
    let (config, logging) = load_config(&cli)?;
    std::mem::take(&mut cli.logging).merged_with(&logging).init("gk-shell")?;

    info!(root = ?config.root, archives = config.archives.len(), "opening guest filesystem");
    let fs = KernelFs::from_config(config)?;
    run(&fs, cli.command, cli.uid)
}
