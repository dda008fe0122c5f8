//! VFS Gateway
//!
//! Command-line access to a sandboxed local directory tree.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use gateway::config::Config;
use gateway::protocol::{DataBlock, ResourceInfo};
use gateway::transfer::hash_stream;
use gateway::{
    DownloadTransfers, GatewayBuilder, LocalBackend, TransferHandler, UploadTransfers, VfsGateway,
};

/// VFS Gateway - sandboxed file operations and block-wise transfers.
#[derive(Parser, Debug)]
#[command(name = "vfs-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Sandbox root, overriding the configuration
    #[arg(short, long, global = true, value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Show a file or folder (the root when no path is given)
    Info {
        path: Option<String>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// List a folder
    Ls {
        #[arg(default_value = "")]
        path: String,

        /// Glob on child names, e.g. "*.txt"
        #[arg(long, short)]
        filter: Option<String>,
    },

    /// Create a folder below PARENT
    Mkdir { parent: String, name: String },

    /// Delete a file or folder
    Rm { path: String },

    /// Move a file or folder
    Mv { source: String, destination: String },

    /// Copy a file or folder
    Cp { source: String, destination: String },

    /// Download a file block by block
    Get {
        remote: String,
        local: PathBuf,

        /// Block size in bytes
        #[arg(long)]
        block_size: Option<u64>,
    },

    /// Upload a file block by block
    Put {
        local: PathBuf,
        remote: String,

        /// Replace an existing file
        #[arg(long)]
        overwrite: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };
    config.apply_env_overrides();
    if let Some(root) = &cli.root {
        config.gateway.root = Some(root.clone());
    }
    config.validate()?;

    let filter = if cli.verbose {
        "debug"
    } else {
        config.gateway.log_level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let gateway = Arc::new(
        GatewayBuilder::from_config(LocalBackend, &config)
            .build()
            .context("Failed to open gateway")?,
    );

    match cli.command {
        Commands::Info { path, json } => {
            let info = match path.as_deref() {
                None => gateway.root()?,
                Some(path) if gateway.is_folder_available(path)? => gateway.folder_info(path)?,
                Some(path) => gateway.file_info(path)?,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                print_info(&info);
            }
        }
        Commands::Ls { path, filter } => {
            let contents = gateway.folder_contents(&path, filter.as_deref())?;
            for entry in contents.folders.iter().chain(&contents.files) {
                print_entry(entry);
            }
        }
        Commands::Mkdir { parent, name } => {
            let created = gateway.create_folder(&parent, &name)?;
            println!("{}", created.full_name);
        }
        Commands::Rm { path } => {
            if gateway.is_folder_available(&path)? {
                gateway.delete_folder(&path)?;
            } else {
                gateway.delete_file(&path)?;
            }
        }
        Commands::Mv {
            source,
            destination,
        } => {
            let moved = if gateway.is_folder_available(&source)? {
                gateway.move_folder(&source, &destination)?
            } else {
                gateway.move_file(&source, &destination)?
            };
            println!("{}", moved.full_name);
        }
        Commands::Cp {
            source,
            destination,
        } => {
            let copied = if gateway.is_folder_available(&source)? {
                gateway.copy_folder(&source, &destination)?
            } else {
                gateway.copy_file(&source, &destination)?
            };
            println!("{}", copied.full_name);
        }
        Commands::Get {
            remote,
            local,
            block_size,
        } => {
            let bytes = download(gateway, &remote, &local, block_size)?;
            println!("{} bytes written to {}", bytes, local.display());
        }
        Commands::Put {
            local,
            remote,
            overwrite,
        } => {
            let bytes = upload(gateway, &local, &remote, overwrite)?;
            println!("{} bytes uploaded to {}", bytes, remote);
        }
    }

    Ok(())
}

fn download(
    gateway: Arc<VfsGateway<LocalBackend>>,
    remote: &str,
    local: &Path,
    block_size: Option<u64>,
) -> anyhow::Result<u64> {
    let downloads = DownloadTransfers::new(gateway);
    let token = downloads.request_download_token(remote, true, block_size)?;
    let id = token.transfer_id.clone();

    let mut file = File::create(local)
        .with_context(|| format!("Failed to create {}", local.display()))?;
    for block_number in 0..token.total_block_count {
        let block = match downloads.read_block(&id, block_number) {
            Ok(block) => block,
            Err(e) => {
                let _ = downloads.cancel_transfer(&id);
                return Err(e.into());
            }
        };
        file.write_all(&block.data)?;
    }
    file.flush()?;

    // Sequential sessions complete on their last block.
    if downloads.transfer_status(&id).is_ok() {
        downloads.complete_transfer(&id)?;
    }

    if let Some(expected) = &token.resource_hash {
        let actual = hash_stream(File::open(local)?)?;
        if &actual != expected {
            anyhow::bail!("Hash mismatch for {}: expected {}, got {}", remote, expected, actual);
        }
    }
    Ok(token.resource_length)
}

fn upload(
    gateway: Arc<VfsGateway<LocalBackend>>,
    local: &Path,
    remote: &str,
    overwrite: bool,
) -> anyhow::Result<u64> {
    let length = std::fs::metadata(local)
        .with_context(|| format!("Failed to read {}", local.display()))?
        .len();
    let expected = hash_stream(File::open(local)?)?;

    let uploads = UploadTransfers::new(gateway);
    let token = uploads.request_upload_token(remote, overwrite, length)?;
    let id = token.transfer_id.clone();

    let result = send_blocks(&uploads, &id, local, token.max_block_size)
        .and_then(|()| Ok(uploads.complete_transfer_with_hash(&id, &expected)?));
    match result {
        Ok(done) => Ok(done.transmitted_bytes),
        Err(e) => {
            let _ = uploads.cancel_transfer(&id);
            Err(e)
        }
    }
}

fn send_blocks(
    uploads: &UploadTransfers<LocalBackend>,
    transfer_id: &str,
    local: &Path,
    block_size: u64,
) -> anyhow::Result<()> {
    let mut file = File::open(local)?;
    let mut buffer = vec![0u8; usize::try_from(block_size)?];
    let mut offset = 0u64;
    let mut block_number = 0u64;

    loop {
        let filled = read_full(&mut file, &mut buffer)?;
        if filled == 0 {
            return Ok(());
        }
        uploads.write_block(&DataBlock {
            transfer_token_id: transfer_id.to_string(),
            block_number,
            offset,
            data: buffer[..filled].to_vec(),
            is_last_block: false,
        })?;
        offset += filled as u64;
        block_number += 1;
    }
}

fn read_full(reader: &mut impl Read, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

fn print_info(info: &ResourceInfo) {
    println!("name:      {}", info.name);
    println!("path:      {}", info.full_name);
    if let Some(parent) = &info.parent_folder_path {
        println!("parent:    {}", parent);
    }
    println!("kind:      {:?}", info.kind);
    if info.is_file() {
        println!("length:    {}", info.length);
        if let Some(content_type) = &info.content_type {
            println!("type:      {}", content_type);
        }
    }
    println!("modified:  {}", info.modified);
    println!("read-only: {}", info.read_only);
}

fn print_entry(info: &ResourceInfo) {
    if info.is_file() {
        println!("{:>12}  {}", info.length, info.name);
    } else {
        println!("{:>12}  {}/", "-", info.name);
    }
}
