use clap::{Args, Parser, Subcommand};

/// fscrawl cli
#[derive(Parser)]
#[command(name = "fscrawl")]
#[command(about = "Crawl the FamilySearch tree into a crash-safe graph database")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// output directory
    #[arg(short, long, help = "Directory holding the crawl database")]
    pub outdir: String,

    /// basename for the database file
    #[arg(short, long, help = "Basename: the database lives at <outdir>/<basename>.db")]
    pub basename: String,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// seed person ids
    #[arg(
        short = 'i',
        long = "individual",
        help = "Seed FamilySearch person id (repeatable); ignored on resume"
    )]
    pub individuals: Vec<String>,

    /// hops from the seed set
    #[arg(long, default_value = "4", help = "Number of hops from the seed set")]
    pub hopcount: u32,

    /// authenticated session token
    #[arg(
        long,
        env = "FS_SESSION_TOKEN",
        help = "Already-established session token (login happens upstream)"
    )]
    pub session_token: String,

    /// API base url
    #[arg(
        long,
        default_value = "https://familysearch.org",
        help = "Base URL of the tree API"
    )]
    pub base_url: String,

    /// control file path
    #[arg(
        long,
        help = "Control file polled for pause/resume/stop commands"
    )]
    pub pause_file: Option<String>,

    /// metrics stream path
    #[arg(long, help = "JSON-lines metrics file ('-' for stdout)")]
    pub metrics_file: Option<String>,

    /// aggregate request rate cap
    #[arg(long, default_value = "5.0")]
    pub requests_per_second: f64,

    /// ids per persons request
    #[arg(long, default_value = "200")]
    pub person_batch_size: usize,

    #[arg(long, default_value = "20")]
    pub max_concurrent_person_requests: usize,

    #[arg(long, default_value = "10")]
    pub max_concurrent_relationship_requests: usize,

    /// politeness floor between batch dispatches
    #[arg(long, default_value = "0.0")]
    pub delay_between_batches: f64,

    #[arg(long, default_value = "5")]
    pub max_retries: u32,

    #[arg(long, default_value = "1.0")]
    pub backoff_base_seconds: f64,

    #[arg(long, default_value = "2.0")]
    pub backoff_multiplier: f64,

    #[arg(long, default_value = "60.0")]
    pub backoff_max_seconds: f64,

    /// per-request timeout
    #[arg(short, long, default_value = "30", help = "Timeout in seconds per request")]
    pub timeout: u64,

    /// verbose logging
    #[arg(short, long, help = "Increase log verbosity")]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start or continue a crawl
    Run(RunArgs),

    /// Continue a crawl from an existing database (seeds are ignored)
    Resume(RunArgs),

    /// Inspect a crawl database
    Checkpoint {
        #[command(flatten)]
        common: CommonArgs,

        /// print status as JSON
        #[arg(long, help = "Open the database read-only and print status JSON")]
        status: bool,
    },
}

impl Cli {
    /// parse args
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
