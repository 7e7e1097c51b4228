use anyhow::Context;
use blockcache::{Config, Engine, LocalFsStore, OpenOptions};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "blockcache")]
#[command(about = "Block cache over a blob store", long_about = None)]
struct Cli {
    /// JSON engine configuration.
    #[arg(long, env = "BLOCKCACHE_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "BLOCKCACHE_BLOCK_SIZE_MB")]
    block_size_mb: Option<u64>,

    #[arg(long, env = "BLOCKCACHE_MEM_SIZE_MB")]
    mem_size_mb: Option<u64>,

    #[arg(long, env = "BLOCKCACHE_WORKERS")]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Sparse write, flush, reopen and verify on a local directory store")]
    DemoLocalfs {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },
    #[command(about = "Copy a local file into the store as NAME")]
    Put {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
        #[arg(value_name = "NAME")]
        name: String,
        #[arg(value_name = "SRC")]
        src: PathBuf,
    },
    #[command(about = "Print NAME from the store to stdout")]
    Cat {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
        #[arg(value_name = "NAME")]
        name: String,
    },
}

impl Cli {
    fn engine_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        if let Some(mb) = self.block_size_mb {
            config.block_size = mb * blockcache::config::MB;
        }
        if let Some(mb) = self.mem_size_mb {
            config.mem_size = mb * blockcache::config::MB;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        config.validate()?;
        Ok(config)
    }
}

async fn put(config: Config, dir: PathBuf, name: &str, src: PathBuf) -> anyhow::Result<()> {
    let data = tokio::fs::read(&src)
        .await
        .with_context(|| format!("read {}", src.display()))?;
    let engine = Engine::new(config, Arc::new(LocalFsStore::new(dir)))?;
    let h = engine
        .open_with(
            name,
            OpenOptions {
                create: true,
                truncate: true,
            },
        )
        .await?;
    engine.write(h, 0, &data).await?;
    engine.close(h).await?;
    engine.shutdown().await;
    tracing::info!(name, bytes = data.len(), "stored");
    Ok(())
}

async fn cat(config: Config, dir: PathBuf, name: &str) -> anyhow::Result<()> {
    let chunk = config.block_size as usize;
    let engine = Engine::new(config, Arc::new(LocalFsStore::new(dir)))?;
    let h = engine
        .open_with(
            name,
            OpenOptions {
                create: false,
                truncate: false,
            },
        )
        .await?;
    let mut stdout = tokio::io::stdout();
    let mut buf = vec![0u8; chunk];
    let mut offset = 0u64;
    loop {
        let n = engine.read(h, offset, &mut buf).await?;
        if n == 0 {
            break;
        }
        stdout.write_all(&buf[..n]).await?;
        offset += n as u64;
    }
    stdout.flush().await?;
    engine.close(h).await?;
    engine.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    let config = cli.engine_config()?;

    match cli.command {
        Commands::DemoLocalfs { dir } => {
            blockcache::demo::e2e_localfs_demo(dir).await?;
            println!("demo-localfs: OK");
        }
        Commands::Put { dir, name, src } => put(config, dir, &name, src).await?,
        Commands::Cat { dir, name } => cat(config, dir, &name).await?,
    }
    Ok(())
}
