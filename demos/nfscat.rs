use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing_subscriber::EnvFilter;

use nfs_mamont_client::protocol::rpc::{RpcHandler, TransportKind};
use nfs_mamont_client::{ClientConfig, NfsClient};

/// Prints a file from an NFS server, or copies a local file to it.
#[derive(Parser, Debug)]
#[command(name = "nfscat")]
struct Args {
    /// nfs://host[:port]/path of the remote file
    url: String,

    /// Seconds to wait for each reply
    #[arg(long, default_value_t = 2)]
    timeout: u64,

    /// Attempts per call, 0 retries forever
    #[arg(long, default_value_t = 5)]
    retries: u32,

    /// Try UDP before TCP
    #[arg(long)]
    udp: bool,

    #[arg(long, default_value_t = 0)]
    uid: u32,

    #[arg(long, default_value_t = 0)]
    gid: u32,

    /// Copy this local file to the URL instead of printing the URL
    #[arg(long, value_name = "FILE")]
    write: Option<PathBuf>,
}

/// Reports unanswered calls on stderr while the client keeps retrying.
struct Stderr;

impl RpcHandler for Stderr {
    fn timeout(&self, server: &str, attempt: u32) {
        eprintln!("nfscat: {server} not responding (attempt {attempt}), still trying");
    }

    fn ok(&self, server: &str) {
        eprintln!("nfscat: {server} ok");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let transport = if args.udp { TransportKind::Udp } else { TransportKind::Tcp };
    let config = ClientConfig::default()
        .with_timeout(Duration::from_secs(args.timeout))
        .with_retries(args.retries)
        .with_transport(transport)
        .with_identity(args.uid, args.gid, vec![args.gid]);
    let client = NfsClient::builder(config).handler(Arc::new(Stderr)).build();

    let res = match &args.write {
        Some(local) => upload(&client, local, &args.url).await,
        None => download(&client, &args.url).await,
    };
    client.close().await.context("closing the client")?;
    res
}

async fn download(client: &NfsClient, url: &str) -> anyhow::Result<()> {
    let file = client.open(url).await.with_context(|| format!("opening {url}"))?;
    if file.is_directory().await? {
        for name in file.read_dir().await? {
            println!("{name}");
        }
        return Ok(());
    }

    let mut stdout = tokio::io::stdout();
    let mut buf = vec![0u8; 64 * 1024];
    let mut offset = 0u64;
    loop {
        let n = file.read(&mut buf, offset).await.with_context(|| format!("reading {url}"))?;
        if n == 0 {
            break;
        }
        stdout.write_all(&buf[..n]).await?;
        offset += n as u64;
    }
    stdout.flush().await?;
    Ok(())
}

async fn upload(client: &NfsClient, local: &Path, url: &str) -> anyhow::Result<()> {
    let mut input = tokio::fs::File::open(local)
        .await
        .with_context(|| format!("opening {}", local.display()))?;
    let file = client.create(url, 0o644).await.with_context(|| format!("creating {url}"))?;
    if !file.is_file().await? {
        bail!("{url} is not a regular file");
    }

    let mut buf = vec![0u8; 64 * 1024];
    let mut offset = 0u64;
    loop {
        let n = input.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        file.write(&buf[..n], offset).await.with_context(|| format!("writing {url}"))?;
        offset += n as u64;
    }
    file.close().await.with_context(|| format!("committing {url}"))?;
    eprintln!("nfscat: wrote {offset} bytes to {url}");
    Ok(())
}
