use fscrawl::cli::{Cli, Commands};
use fscrawl::error::CrawlError;
use fscrawl::{logging, orchestration};

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();

    let result = match &cli.command {
        Commands::Run(args) => {
            logging::init_logging(args.verbose);
            orchestration::run_crawl(args, false).await
        }
        Commands::Resume(args) => {
            logging::init_logging(args.verbose);
            orchestration::run_crawl(args, true).await
        }
        Commands::Checkpoint { common, status } => {
            logging::init_logging(false);
            if *status {
                orchestration::print_status(&common.outdir, &common.basename).await
            } else {
                Err(CrawlError::Config(
                    "checkpoint requires --status".to_string(),
                ))
            }
        }
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "run failed");
        eprintln!("fscrawl: {e}");
        std::process::exit(e.exit_code());
    }
}
