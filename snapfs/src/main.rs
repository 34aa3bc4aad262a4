mod cli;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Commands};
use snapfs::authority::Authority;
use snapfs::cache::ClientCache;
use snapfs::config::{ProxyConfig, ServerConfig, load_config};
use snapfs::fs::FileService;
use snapfs::protocol::CoherenceClient;
use snapfs::transport::{QuicTransport, quic};
use snapfs::{OpenOption, SnapError};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

const READ_BATCH: usize = 64 * 1024;

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn connect(config_path: &Path) -> anyhow::Result<FileService> {
    let cfg: ProxyConfig = load_config(config_path)?;
    init_tracing(&cfg.log_level);

    let addr: SocketAddr = cfg
        .server_addr
        .parse()
        .with_context(|| format!("invalid server address {}", cfg.server_addr))?;
    let transport = QuicTransport::connect(addr)
        .await
        .with_context(|| format!("failed to reach authority at {addr}"))?;
    let coherence = CoherenceClient::new(Arc::new(transport), cfg.rpc_timeout());
    let cache = ClientCache::new(&cfg.cache, coherence).context("failed to prepare cache")?;
    Ok(FileService::new(cache, cfg.max_open_files))
}

async fn cat(service: &FileService, path: &str) -> anyhow::Result<()> {
    let fd = service.open(path, OpenOption::Read).await?;
    let mut stdout = tokio::io::stdout();
    loop {
        let chunk = service.read(fd, READ_BATCH).await?;
        if chunk.is_empty() {
            break;
        }
        stdout.write_all(&chunk).await?;
    }
    stdout.flush().await?;
    service.close(fd).await?;
    Ok(())
}

async fn put(service: &FileService, path: &str, src: &Path) -> anyhow::Result<()> {
    let data = tokio::fs::read(src)
        .await
        .with_context(|| format!("failed to read {}", src.display()))?;
    // sessions never truncate, so replace the file instead of overwriting it
    match service.unlink(path).await {
        Ok(()) | Err(SnapError::NoSuchFile(_)) => {}
        Err(e) => return Err(e.into()),
    }
    let fd = service.open(path, OpenOption::CreateNew).await?;
    for chunk in data.chunks(READ_BATCH) {
        service.write(fd, chunk).await?;
    }
    service.close(fd).await?;
    info!("stored {} bytes at {path}", data.len());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve { config } => {
            let cfg: ServerConfig = load_config(config)?;
            init_tracing(&cfg.log_level);
            let addr: SocketAddr = cfg
                .addr
                .parse()
                .with_context(|| format!("invalid listen address {}", cfg.addr))?;
            std::fs::create_dir_all(&cfg.root_dir)
                .with_context(|| format!("failed to create {}", cfg.root_dir.display()))?;
            info!("serving {}", cfg.root_dir.display());
            let authority = Arc::new(Authority::new(&cfg.root_dir, cfg.chunk_size));
            quic::serve(addr, authority).await?;
        }
        Commands::Cat { config, path } => {
            let service = connect(config).await?;
            cat(&service, path).await?;
        }
        Commands::Put { config, path, src } => {
            let service = connect(config).await?;
            put(&service, path, src).await?;
        }
        Commands::Rm { config, path } => {
            let service = connect(config).await?;
            service.unlink(path).await?;
        }
    }

    Ok(())
}
