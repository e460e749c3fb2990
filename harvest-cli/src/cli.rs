use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "harvest")]
#[command(about = "Download a complete HLS stream and merge it into one file")]
#[command(version)]
pub struct Args {
    /// Manifest URL (master or media playlist)
    pub url: String,

    /// Output file
    #[arg(short, long)]
    pub output: PathBuf,

    /// Concurrent segment downloads
    #[arg(short, long, env = "HARVEST_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// Accept invalid TLS certificates
    #[arg(long)]
    pub insecure: bool,

    /// Path to the ffmpeg binary
    #[arg(long, env = "HARVEST_FFMPEG")]
    pub ffmpeg: Option<PathBuf>,

    /// Proxy URL (http, https or socks5)
    #[arg(long, env = "HARVEST_PROXY")]
    pub proxy: Option<String>,

    /// Proxy username
    #[arg(long, requires = "proxy")]
    pub proxy_username: Option<String>,

    /// Proxy password
    #[arg(long, requires = "proxy_username")]
    pub proxy_password: Option<String>,

    /// Extra request header, `Name: value`. May be repeated
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// Override the User-Agent header
    #[arg(long)]
    pub user_agent: Option<String>,

    /// AES-128 key as hex
    #[arg(long, requires = "iv")]
    pub key: Option<String>,

    /// AES-128 IV as hex
    #[arg(long, requires = "key")]
    pub iv: Option<String>,

    /// Parent directory for the temporary job workspace
    #[arg(long)]
    pub workdir: Option<PathBuf>,

    /// Configuration file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short, long)]
    pub quiet: bool,
}
