use anstyle::AnsiColor;
use clap::builder::styling::Styles;
use clap::{Args, Parser, Subcommand};
use rtftp::config::{self, DEFAULT_PORT};
use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::path::PathBuf;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default())
    .usage(AnsiColor::Green.on_default())
    .literal(AnsiColor::Cyan.on_default())
    .placeholder(AnsiColor::Red.on_default());

#[derive(Parser, Debug)]
#[command(name = "rtftp")]
#[command(about = "TFTP server and client over UDP or TCP", long_about = None)]
#[command(styles = STYLES)]
pub struct Cli {
    /// Use length-framed TCP instead of UDP
    #[arg(long, global = true)]
    pub tcp: bool,

    /// Timeout (ms)
    #[arg(short, long, global = true, default_value_t = 5000)]
    pub timeout: u64,

    /// Max retries per block
    #[arg(short, long, global = true, default_value_t = 5)]
    pub retries: u32,

    /// Data block size
    #[arg(long, global = true, default_value_t = 512)]
    pub block_size: usize,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve files from a directory
    Serve {
        /// Listen ip
        #[arg(short, long, default_value = "0.0.0.0")]
        bind: IpAddr,

        /// Listen port
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Work directory
        #[arg(short, long, default_value = ".")]
        directory: PathBuf,

        /// Max concurrent sessions
        #[arg(long, default_value_t = 10)]
        max_sessions: usize,

        /// Ports for session sockets, e.g. 50000-50100
        #[arg(long, value_parser = config::parse_port_range)]
        port_range: Option<RangeInclusive<u16>>,
    },

    /// Download a file
    Get {
        remote: String,

        /// Defaults to the remote file name
        local: Option<PathBuf>,

        #[command(flatten)]
        server: ServerArgs,
    },

    /// Upload a file
    Put {
        local: PathBuf,

        /// Defaults to the local file name
        remote: Option<String>,

        #[command(flatten)]
        server: ServerArgs,
    },

    /// Interactive get/put prompt
    Shell {
        #[command(flatten)]
        server: ServerArgs,
    },
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Server host
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    pub host: String,

    /// Server port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,
}
