use std::fs::File;
use std::io;
use std::path::PathBuf;

use anyhow::Context;
use clap::{CommandFactory, Parser};
use clap_complete::{generate, Shell};
use serde::Serialize;
use tmd_crawler::{CrawlerConfig, ItemOrder, ResumePolicy, StaggerScope};
use tmd_store::{Account, ImageStatus, ProgressStore, Run, TweetStatus};

/// Timeline media downloader progress store
#[derive(Debug, Parser)]
#[command(version)]
pub struct Args {
    /// Path to the SQLite progress database
    #[arg(env = "TMD_DB", long, global = true, default_value = "tmd.db")]
    pub db: PathBuf,
    /// When quiet no logs are outputted
    #[arg(long, short, global = true)]
    pub quiet: bool,
    #[command(subcommand)]
    pub cmd: SubCommand,
}

#[derive(Debug, clap::Subcommand)]
pub enum SubCommand {
    /// Show what is known about an account
    Status { account: String },
    /// List the most recent runs
    Runs {
        #[arg(long)]
        account: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Delete stale interrupted runs
    Purge {
        /// Age in days, defaults to the configured run retention
        #[arg(long)]
        days: Option<u32>,
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Create or upgrade the database schema
    Migrate,
    /// Print the effective crawler configuration
    Config(ConfigArgs),
    #[command(hide = true)]
    Completion,
}

#[derive(Debug, Default, clap::Args)]
pub struct ConfigArgs {
    /// Optional crawler yaml configuration file
    #[arg(env = "TMD_CRAWLER_CONFIG", long)]
    pub crawler_config: Option<PathBuf>,
    /// Override the number of browser pages
    #[arg(long)]
    pub pool_size: Option<usize>,
    /// Override the number of concurrent workers
    #[arg(long)]
    pub max_workers: Option<usize>,
    /// Override the attempts per item
    #[arg(long)]
    pub max_retries: Option<u32>,
    #[arg(value_enum, long)]
    pub order: Option<ItemOrder>,
    /// Override what happens to an interrupted run
    #[arg(value_enum, long)]
    pub on_existing_run: Option<ResumePolicy>,
    #[arg(value_enum, long)]
    pub stagger: Option<StaggerScope>,
    /// Override the directory images are saved to
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
    /// No SIGINT handling, an interrupted run is left in progress
    #[arg(long)]
    pub no_sigint: bool,
}

impl TryFrom<&ConfigArgs> for CrawlerConfig {
    type Error = anyhow::Error;

    fn try_from(args: &ConfigArgs) -> Result<Self, Self::Error> {
        let mut conf = if let Some(path) = &args.crawler_config {
            let file = File::open(path)
                .with_context(|| format!("cannot open crawler config {}", path.display()))?;
            serde_yaml::from_reader(file)?
        } else {
            CrawlerConfig::default()
        };
        if let Some(pool_size) = args.pool_size {
            conf.pool_size = pool_size;
        }
        if let Some(max_workers) = args.max_workers {
            conf.max_workers = max_workers;
        }
        if let Some(max_retries) = args.max_retries {
            conf.max_retries = max_retries;
        }
        if let Some(order) = args.order {
            conf.order = order;
        }
        if let Some(policy) = args.on_existing_run {
            conf.on_existing_run = policy;
        }
        if let Some(stagger) = args.stagger {
            conf.stagger = stagger;
        }
        if let Some(output_dir) = &args.output_dir {
            conf.output_dir = output_dir.clone();
        }
        if args.no_sigint {
            conf.handle_sigint = false;
        }
        conf.validate()?;
        Ok(conf)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AccountStatus {
    account: Account,
    tweets_processed: u64,
    tweets_failed: u64,
    images: ImageTotals,
    resumable_run: Option<Run>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageTotals {
    downloaded: u64,
    failed: u64,
    skipped: u64,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if !args.quiet {
        env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or("tmd_crawler=info,tmd_store=warn"),
        )
        .init();
    }

    match &args.cmd {
        SubCommand::Status { account } => {
            let store = ProgressStore::open(&args.db)?;
            match status(&store, account)? {
                Some(status) => print!("{}", serde_yaml::to_string(&status)?),
                None => println!("No history for account {account}"),
            }
        }
        SubCommand::Runs { account, limit } => {
            let store = ProgressStore::open(&args.db)?;
            for run in store.list_runs(account.as_deref(), *limit)? {
                println!("{}", format_run(&run));
            }
        }
        SubCommand::Purge { days, config } => {
            let conf = CrawlerConfig::try_from(config)?;
            let days = days.unwrap_or(conf.run_retention_days);
            let store = ProgressStore::open(&args.db)?;
            let purged = store.purge_interrupted_runs(chrono_days(days))?;
            println!("Purged {purged} interrupted runs older than {days} days");
        }
        SubCommand::Migrate => {
            let store = ProgressStore::open(&args.db)?;
            println!(
                "{} is at schema version {}",
                args.db.display(),
                store.schema_version()?
            );
        }
        SubCommand::Config(config) => {
            let conf = CrawlerConfig::try_from(config)?;
            print!("{}", serde_yaml::to_string(&conf)?);
        }
        SubCommand::Completion => {
            generate(Shell::Bash, &mut Args::command(), "tmd", &mut io::stdout());
        }
    }

    Ok(())
}

fn status(store: &ProgressStore, account: &str) -> anyhow::Result<Option<AccountStatus>> {
    let Some(account) = store.account(account)? else {
        return Ok(None);
    };
    Ok(Some(AccountStatus {
        tweets_processed: store.tweet_count(account.id, Some(TweetStatus::Processed))?,
        tweets_failed: store.tweet_count(account.id, Some(TweetStatus::Failed))?,
        images: ImageTotals {
            downloaded: store.account_image_count(account.id, Some(ImageStatus::Downloaded))?,
            failed: store.account_image_count(account.id, Some(ImageStatus::Failed))?,
            skipped: store.account_image_count(account.id, Some(ImageStatus::Skipped))?,
        },
        resumable_run: store.find_resumable_run(&account.name)?,
        account,
    }))
}

fn format_run(run: &Run) -> String {
    format!(
        "{}  {:<12} {:<11} {:>5}/{:<5} {}",
        run.id,
        run.account,
        run.status.as_str(),
        run.processed_tweets,
        run.total_tweets,
        run.started_at.format("%Y-%m-%d %H:%M:%S"),
    )
}

fn chrono_days(days: u32) -> chrono::Duration {
    chrono::Duration::days(i64::from(days))
}
