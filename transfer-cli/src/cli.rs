use std::path::PathBuf;

use clap::{Parser, Subcommand};
use transfer_engine::ProxyType;

#[derive(Parser, Debug)]
#[command(
    name = "transfer",
    version,
    about = "Resumable chunked uploads to UPOS storage and ranged downloads"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (defaults to <config dir>/transfer/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Proxy URL (http://, https:// or socks5://)
    #[arg(long, global = true)]
    pub proxy: Option<String>,

    /// Proxy type (guessed from the URL scheme when omitted)
    #[arg(long, global = true, value_enum, requires = "proxy")]
    pub proxy_type: Option<ProxyType>,

    /// Proxy username
    #[arg(long, global = true, requires = "proxy")]
    pub proxy_username: Option<String>,

    /// Proxy password
    #[arg(long, global = true, requires = "proxy_username")]
    pub proxy_password: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Upload a local file and print the resulting content id as JSON
    Upload {
        /// File to upload
        file: PathBuf,

        /// Title the upload is published under
        #[arg(short, long)]
        title: Option<String>,

        /// Credential (cookie string) used for negotiation
        #[arg(long, env = "TRANSFER_COOKIE", hide_env_values = true)]
        cookie: Option<String>,

        /// Parts uploaded in parallel (default: negotiated)
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Retries per part (default: negotiated)
        #[arg(long)]
        max_retries: Option<u32>,

        /// Negotiation endpoint
        #[arg(long)]
        preupload_url: Option<String>,
    },

    /// Download a URL into a local file, resuming on stalls
    Download {
        /// Resource URL
        url: String,

        /// Destination file
        #[arg(short, long)]
        output: PathBuf,

        /// Extra request header, `Name: value` (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Extra query parameter, `key=value` (repeatable)
        #[arg(short = 'P', long = "param")]
        params: Vec<String>,

        /// Retries after a stall or failed request
        #[arg(long)]
        max_retries: Option<u32>,

        /// Seconds without data before a request counts as stalled
        #[arg(long)]
        stall_timeout: Option<u64>,
    },
}
