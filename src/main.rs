mod cli;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use cli::{Cli, Command, ServerArgs};
use rtftp::{Client, Framing, Server, ServerConfig, TransferConfig, TransferSummary};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Cli::parse();
    let framing = if args.tcp { Framing::Stream } else { Framing::Datagram };
    let transfer = TransferConfig {
        block_size: args.block_size,
        timeout: Duration::from_millis(args.timeout),
        max_retries: args.retries,
    };
    transfer.validate()?;

    match args.command {
        Command::Serve { bind, port, directory, max_sessions, port_range } => {
            let config = ServerConfig {
                bind: (bind, port).into(),
                base_dir: directory,
                framing,
                max_sessions,
                port_range,
                transfer,
                ..ServerConfig::default()
            };
            serve(config).await
        }
        Command::Get { remote, local, server } => {
            let client = connect(&server, framing, transfer).await?;
            let local = local.unwrap_or_else(|| default_local(&remote));
            let summary = client
                .get(&remote, &local)
                .await
                .with_context(|| format!("Downloading {remote} failed"))?;
            report("received", &summary);
            Ok(())
        }
        Command::Put { local, remote, server } => {
            let client = connect(&server, framing, transfer).await?;
            let remote = match remote {
                Some(remote) => remote,
                None => default_remote(&local)?,
            };
            let summary = client
                .put(&local, &remote)
                .await
                .with_context(|| format!("Uploading {} failed", local.display()))?;
            report("sent", &summary);
            Ok(())
        }
        Command::Shell { server } => {
            let client = connect(&server, framing, transfer).await?;
            shell(client).await
        }
    }
}

async fn serve(config: ServerConfig) -> Result<()> {
    let handle = Server::bind(config).await?.spawn()?;
    tokio::signal::ctrl_c().await.context("Couldn't listen for Ctrl-C")?;
    handle.stop().await
}

async fn connect(server: &ServerArgs, framing: Framing, transfer: TransferConfig) -> Result<Client> {
    let addr: SocketAddr = tokio::net::lookup_host((server.host.as_str(), server.port))
        .await
        .with_context(|| format!("Couldn't resolve {}", server.host))?
        .next()
        .ok_or_else(|| anyhow!("No address found for {}", server.host))?;
    Ok(Client::new(addr, framing, transfer))
}

fn default_local(remote: &str) -> PathBuf {
    Path::new(remote)
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(remote))
}

fn default_remote(local: &Path) -> Result<String> {
    local
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("{} doesn't name a file", local.display()))
}

fn report(verb: &str, summary: &TransferSummary) {
    println!("Transfer complete. {} bytes {verb} in {} blocks.", summary.bytes, summary.blocks);
}

/// Reads `get`/`put` commands from stdin until `quit` or end of input.
async fn shell(client: Client) -> Result<()> {
    println!("Connected to {}. Commands: get <remote> [local], put <local> [remote], quit", client.server());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"tftp> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };

        let words: Vec<&str> = line.split_whitespace().collect();
        let outcome = match words.as_slice() {
            [] => continue,
            ["quit"] | ["exit"] => break,
            ["get", remote] => shell_get(&client, remote, default_local(remote)).await,
            ["get", remote, local] => shell_get(&client, remote, PathBuf::from(local)).await,
            ["put", local] => match default_remote(Path::new(local)) {
                Ok(remote) => shell_put(&client, Path::new(local), &remote).await,
                Err(e) => Err(e),
            },
            ["put", local, remote] => shell_put(&client, Path::new(local), remote).await,
            _ => Err(anyhow!("Unknown command '{line}'")),
        };
        if let Err(e) = outcome {
            println!("Error: {e:#}");
        }
    }
    Ok(())
}

async fn shell_get(client: &Client, remote: &str, local: PathBuf) -> Result<()> {
    let summary = client.get(remote, &local).await?;
    report("received", &summary);
    Ok(())
}

async fn shell_put(client: &Client, local: &Path, remote: &str) -> Result<()> {
    let summary = client.put(local, remote).await?;
    report("sent", &summary);
    Ok(())
}
