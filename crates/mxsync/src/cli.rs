//! `mxsync` command line interface

use anyhow::{Context, Result};
use bytes::BytesMut;
use clap::{Parser, Subcommand, ValueEnum};
use mxsync_rpc::{CompressionAlgorithm, Compressor, Envelope, FramedCodec, PayloadCompressor};
use mxsync_tree::{diff, Node, NodeId, Snapshot, TreeSync};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::explorer::SNAPSHOT_KIND;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "mxsync - model snapshot diff and sync tools")]
pub struct Args {
    /// Log level (overridden by RUST_LOG)
    #[arg(long, value_enum, default_value = "warn", global = true)]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the edits turning one snapshot into another
    Diff {
        old: PathBuf,
        new: PathBuf,

        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,

        /// Re-apply the edits to OLD and verify the result equals NEW
        #[arg(long)]
        check: bool,
    },

    /// Print a snapshot as an indented tree
    Show { snapshot: PathBuf },

    /// Report the frame size of a snapshot response
    Frame {
        snapshot: PathBuf,

        /// Force a compression algorithm instead of choosing by size
        #[arg(long, value_enum)]
        compression: Option<CompressionAlgorithm>,
    },
}

/// Outcome of a command that completed without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    CheckFailed,
}

pub fn run() -> Result<Outcome> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.as_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let stdout = io::stdout();
    let mut out = stdout.lock();
    execute(args.command, &mut out)
}

/// Run one command, writing its report to `out`
pub fn execute(command: Command, out: &mut dyn Write) -> Result<Outcome> {
    match command {
        Command::Diff {
            old,
            new,
            format,
            check,
        } => diff_files(&old, &new, format, check, out),
        Command::Show { snapshot } => {
            let tree = load(&snapshot)?;
            write_tree(&tree, out)?;
            Ok(Outcome::Success)
        }
        Command::Frame {
            snapshot,
            compression,
        } => frame_report(&snapshot, compression, out),
    }
}

fn load(path: &Path) -> Result<Node> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let tree = Snapshot::from_slice(&bytes)
        .with_context(|| format!("Failed to decode snapshot {}", path.display()))?;
    debug!("Loaded {} nodes from {}", tree.subtree_len(), path.display());
    Ok(tree)
}

fn diff_files(
    old_path: &Path,
    new_path: &Path,
    format: OutputFormat,
    check: bool,
    out: &mut dyn Write,
) -> Result<Outcome> {
    let old = load(old_path)?;
    let new = load(new_path)?;
    let edits = diff(Some(&old), &new).context("Failed to diff snapshots")?;
    info!("{} edits", edits.len());

    match format {
        OutputFormat::Text => {
            for edit in &edits {
                writeln!(out, "{edit}")?;
            }
        }
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, &edits)?;
            writeln!(out)?;
        }
    }

    if !check {
        return Ok(Outcome::Success);
    }

    let mut sync = TreeSync::new(());
    sync.sync_to(&old).context("Failed to load OLD")?;
    sync.apply(edits).context("Edits do not apply to OLD")?;
    if sync.root() == Some(&new) {
        writeln!(out, "check: ok")?;
        Ok(Outcome::Success)
    } else {
        writeln!(out, "check: result differs from NEW")?;
        Ok(Outcome::CheckFailed)
    }
}

fn write_tree(tree: &Node, out: &mut dyn Write) -> Result<()> {
    for (depth, node) in tree.walk() {
        let id = match node.id {
            NodeId::Entity(id) => id.to_string(),
            NodeId::ItemSpaces(_) => "-".to_string(),
        };
        write!(out, "{:indent$}{} {}", "", node.kind, id, indent = depth * 2)?;
        if let Some(name) = node.attributes.get("name").and_then(|v| v.as_str()) {
            write!(out, " {name}")?;
        }
        writeln!(out)?;
    }
    Ok(())
}

fn frame_report(
    path: &Path,
    compression: Option<CompressionAlgorithm>,
    out: &mut dyn Write,
) -> Result<Outcome> {
    let payload = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let tree = Snapshot::from_slice(&payload)
        .with_context(|| format!("Failed to decode snapshot {}", path.display()))?;

    let mut envelope = Envelope::request(SNAPSHOT_KIND, 1, payload);
    let raw = frame_len(&envelope)?;
    writeln!(out, "nodes: {}", tree.subtree_len())?;
    writeln!(out, "payload: {} bytes", envelope.payload.len())?;
    writeln!(out, "frame: {raw} bytes")?;

    let algorithm = compression.or_else(|| PayloadCompressor::default().choose(envelope.payload.len()));
    match algorithm {
        Some(algorithm) => {
            envelope.payload = Compressor::new(algorithm).compress(&envelope.payload)?;
            envelope.compression = algorithm.flag();
            let packed = frame_len(&envelope)?;
            writeln!(
                out,
                "{algorithm:?}: {packed} bytes ({:.1}%)",
                packed as f64 * 100.0 / raw as f64
            )?;
        }
        None => writeln!(out, "below compression threshold")?,
    }
    Ok(Outcome::Success)
}

fn frame_len(envelope: &Envelope) -> Result<usize> {
    let mut buf = BytesMut::new();
    FramedCodec::encode(envelope, &mut buf)?;
    Ok(buf.len())
}
