//! blocksplit - split time-series blocks in object storage by label

use anyhow::{anyhow, bail, Context};
use blocksplit_core::block::{parse_selector, BlockReader, BlockWriterOptions};
use blocksplit_core::bucket::{BlockRef, Bucket, BucketConfig};
use blocksplit_core::config::path_or_content;
use blocksplit_core::import::{self, ImportOptions};
use blocksplit_core::inspect::{self, Table};
use blocksplit_core::scheduler::{ScheduleOptions, Scheduler};
use blocksplit_core::splitter::{BlockSplitter, SplitOptions};
use blocksplit_core::timeutil::{parse_duration, TimeOrDuration};
use blocksplit_core::{analyze, config, dump, RelabelRules, TimeRange};
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "blocksplit", author, version, about, long_about = None)]
struct Cli {
    /// Only log messages with the given severity or above
    #[arg(
        long = "log.level",
        global = true,
        default_value = "info",
        value_parser = ["error", "warn", "info", "debug"]
    )]
    log_level: String,

    /// Output format of log messages
    #[arg(
        long = "log.format",
        global = true,
        default_value = "text",
        value_parser = ["text", "json"]
    )]
    log_format: String,

    #[command(flatten)]
    objstore: ObjstoreArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct ObjstoreArgs {
    /// Path to the YAML object store configuration
    #[arg(long = "objstore.config-file", global = true)]
    config_file: Option<PathBuf>,

    /// Object store configuration as inline YAML; wins over the file
    #[arg(long = "objstore.config", global = true)]
    config: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List all blocks in the bucket
    Ls {
        /// Search nested folders for blocks
        #[arg(short, long)]
        recursive: bool,

        /// Only list blocks created before this time (RFC 3339 or a duration like -1d)
        #[arg(long = "max-time", allow_hyphen_values = true)]
        max_time: Option<TimeOrDuration>,
    },

    /// Print a table of block metadata
    Inspect {
        /// Search nested folders for blocks
        #[arg(short, long)]
        recursive: bool,

        /// Selector on block labels, `name="value"`; `*` matches any value
        #[arg(short = 'l', long = "selector")]
        selector: Vec<String>,

        /// Columns to sort by, in order of precedence
        #[arg(long = "sort-by", default_values_t = inspect::DEFAULT_SORT.map(String::from))]
        sort_by: Vec<String>,

        /// Only inspect blocks created before this time
        #[arg(long = "max-time", allow_hyphen_values = true)]
        max_time: Option<TimeOrDuration>,
    },

    /// Print the samples of one or more blocks
    Dump {
        /// Block ids, optionally prefixed with their folder
        #[arg(required = true)]
        ids: Vec<BlockRef>,

        /// Local directory blocks are downloaded to
        #[arg(long = "data-dir", default_value = config::DEFAULT_DATA_DIR)]
        data_dir: PathBuf,

        /// Only print samples at or after this time
        #[arg(long = "min-time", allow_hyphen_values = true)]
        min_time: Option<TimeOrDuration>,

        /// Only print samples at or before this time
        #[arg(long = "max-time", allow_hyphen_values = true)]
        max_time: Option<TimeOrDuration>,

        /// Series selector, e.g. `{job="api"}`
        #[arg(long = "match", default_value = "")]
        selector: String,
    },

    /// Analyze churn, label pair cardinality and find labels to split on
    Analyze {
        /// Block id to analyze, optionally prefixed with its folder
        id: BlockRef,

        /// How many items to show in each list
        #[arg(long, default_value_t = analyze::DEFAULT_LIMIT)]
        limit: usize,

        /// Local directory the block is downloaded to
        #[arg(long = "data-dir", default_value = config::DEFAULT_DATA_DIR)]
        data_dir: PathBuf,

        /// Series selector to analyze, e.g. `{job="api"}`
        #[arg(long = "match", default_value = "")]
        selector: String,
    },

    /// Import samples from text into blocks
    Import(ImportArgs),

    /// Split blocks by the labels named in `__meta_ext_labels`
    Split(SplitArgs),
}

#[derive(Args, Debug)]
struct ImportArgs {
    /// Text file to read samples from
    #[arg(short = 'f', long = "input-file")]
    input_file: PathBuf,

    /// Maximum block size; block boundaries are aligned to compatible ranges
    #[arg(long = "block-size", default_value = "2h")]
    block_size: String,

    /// Local directory blocks are written to
    #[arg(long = "data-dir", default_value = config::DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    /// Label stored in the metadata of every block, `name="value"` (repeated)
    #[arg(short = 'l', long = "label", required = true)]
    labels: Vec<String>,

    /// Upload imported blocks to object storage
    #[arg(long)]
    upload: bool,
}

#[derive(Args, Debug)]
struct SplitArgs {
    /// Path to the series relabel configuration
    #[arg(long = "relabel-config-file")]
    relabel_config_file: Option<PathBuf>,

    /// Series relabel configuration as inline YAML
    #[arg(long = "relabel-config")]
    relabel_config: Option<String>,

    /// Path to the block label relabel configuration
    #[arg(long = "meta-relabel-file")]
    meta_relabel_file: Option<PathBuf>,

    /// Block label relabel configuration as inline YAML
    #[arg(long = "meta-relabel")]
    meta_relabel: Option<String>,

    /// Path to the destination object store configuration
    #[arg(long = "dst.config-file")]
    dst_config_file: Option<PathBuf>,

    /// Destination object store configuration as inline YAML
    #[arg(long = "dst.config")]
    dst_config: Option<String>,

    /// Search nested folders for blocks
    #[arg(short, long)]
    recursive: bool,

    /// Local scratch directory
    #[arg(long = "data-dir", default_value = config::DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    /// Pause between bucket scans; 0 runs once and exits
    #[arg(short = 'w', long = "wait-interval", default_value = "5m")]
    wait_interval: String,

    /// Split locally without uploading outputs or deleting inputs
    #[arg(long = "dry-run")]
    dry_run: bool,

    /// Only split blocks created before this time
    #[arg(long = "max-time", allow_hyphen_values = true)]
    max_time: Option<TimeOrDuration>,

    /// Only split blocks whose metadata carries this source
    #[arg(long)]
    source: Option<String>,

    /// Pending samples per output block before an intermediate commit
    #[arg(long = "commit-threshold", default_value_t = config::COMMIT_THRESHOLD)]
    commit_threshold: usize,
}

fn init_logging(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_bucket(
    file: Option<&std::path::Path>,
    content: Option<&str>,
    flag: &str,
) -> anyhow::Result<Bucket> {
    let yaml = path_or_content(file, content)?
        .ok_or_else(|| anyhow!("no object store configuration, set --{} or --{}-file", flag, flag))?;
    let config = BucketConfig::from_yaml(&yaml)?;
    Ok(Bucket::from_config(&config)?)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level, &cli.log_format);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let bucket = load_bucket(
        cli.objstore.config_file.as_deref(),
        cli.objstore.config.as_deref(),
        "objstore.config",
    )
    .context("source bucket")?;

    match cli.command {
        Command::Ls {
            recursive,
            max_time,
        } => {
            let blocks = bucket
                .list_blocks(recursive, max_time.map(|t| t.resolve_now()))
                .await?;
            let mut out = std::io::stdout().lock();
            for block in &blocks {
                writeln!(out, "{}", inspect::ls_line(block))?;
            }
        }

        Command::Inspect {
            recursive,
            selector,
            sort_by,
            max_time,
        } => {
            let selector = inspect::parse_flag_labels(&selector)?;
            let infos =
                inspect::collect_metas(&bucket, recursive, max_time.map(|t| t.resolve_now()))
                    .await?;
            let table = Table::inspect(&infos, &selector, &sort_by, recursive)?;
            print!("{}", table.render());
        }

        Command::Dump {
            ids,
            data_dir,
            min_time,
            max_time,
            selector,
        } => {
            let range = TimeRange::new(
                min_time.map_or(i64::MIN, |t| t.resolve_now()),
                max_time.map_or(i64::MAX, |t| t.resolve_now()),
            );
            let matchers = parse_selector(&selector)?;

            tokio::fs::create_dir_all(&data_dir).await?;
            for block in &ids {
                let dir = bucket
                    .download(block, &data_dir)
                    .await
                    .with_context(|| format!("download block {}", block))?;
                let reader = BlockReader::open(&dir)?;
                let mut out = std::io::stdout().lock();
                let lines = dump::dump_samples(&reader, range, &matchers, &mut out)
                    .with_context(|| format!("dump block {}", block))?;
                out.flush()?;
                info!(block = %block, lines, "dumped block");
            }
        }

        Command::Analyze {
            id,
            limit,
            data_dir,
            selector,
        } => {
            let matchers = parse_selector(&selector)?;
            tokio::fs::create_dir_all(&data_dir).await?;
            let dir = bucket
                .download(&id, &data_dir)
                .await
                .with_context(|| format!("download block {}", id))?;
            let reader = BlockReader::open(&dir)?;
            let selector = (!selector.is_empty()).then_some(selector.as_str());
            let analysis = analyze::analyze(&reader, &matchers, selector, limit)
                .with_context(|| format!("analyze block {}", id))?;
            print!("{}", analysis.render());
        }

        Command::Import(args) => import_blocks(bucket, args).await?,

        Command::Split(args) => split(bucket, args).await?,
    }

    Ok(())
}

async fn import_blocks(bucket: Bucket, args: ImportArgs) -> anyhow::Result<()> {
    let labels = inspect::parse_flag_labels(&args.labels).context("parse block labels")?;
    let options = ImportOptions {
        max_block_duration: parse_duration(&args.block_size)?,
        labels: labels.to_map(),
        ..Default::default()
    };

    let input = tokio::fs::read_to_string(&args.input_file)
        .await
        .with_context(|| format!("read {}", args.input_file.display()))?;
    let data_dir = args.data_dir.clone();
    let metas = tokio::task::spawn_blocking(move || import::import_text(&input, &data_dir, &options))
        .await?
        .context("block creation")?;
    print!("{}", import::blocks_table(&metas).render());

    if args.upload {
        for meta in &metas {
            let start = std::time::Instant::now();
            bucket
                .upload(&args.data_dir.join(meta.ulid.to_string()))
                .await
                .with_context(|| format!("upload block {}", meta.ulid))?;
            info!(
                block = %meta.ulid,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "uploaded block"
            );
        }
    }
    Ok(())
}

async fn split(src: Bucket, args: SplitArgs) -> anyhow::Result<()> {
    let relabel = path_or_content(
        args.relabel_config_file.as_deref(),
        args.relabel_config.as_deref(),
    )?
    .ok_or_else(|| anyhow!("no relabel configuration, set --relabel-config or --relabel-config-file"))?;
    let relabel = RelabelRules::from_yaml(&relabel).context("relabel configuration")?;

    let meta_relabel = match path_or_content(
        args.meta_relabel_file.as_deref(),
        args.meta_relabel.as_deref(),
    )? {
        Some(yaml) => RelabelRules::from_yaml(&yaml).context("meta relabel configuration")?,
        None => RelabelRules::default(),
    };

    let dst = load_bucket(
        args.dst_config_file.as_deref(),
        args.dst_config.as_deref(),
        "dst.config",
    )
    .context("destination bucket")?;

    let interval_ms = parse_duration(&args.wait_interval)?;
    if interval_ms < 0 {
        bail!("--wait-interval must not be negative, got {}", args.wait_interval);
    }
    if args.commit_threshold == 0 {
        bail!("--commit-threshold must be positive");
    }
    if args.dry_run {
        warn!("dry-run: no blocks will be uploaded or deleted");
    }

    let options = SplitOptions {
        data_dir: args.data_dir,
        dry_run: args.dry_run,
        commit_threshold: args.commit_threshold,
        writer: BlockWriterOptions::default(),
    };
    let splitter = BlockSplitter::new(src, dst, relabel, meta_relabel, options);
    let scheduler = Scheduler::new(
        splitter,
        ScheduleOptions {
            recursive: args.recursive,
            max_time: args.max_time,
            source: args.source,
            interval: Duration::from_millis(interval_ms as u64),
        },
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt, finishing current block");
            on_signal.cancel();
        }
    });

    info!(
        interval = %args.wait_interval,
        dry_run = args.dry_run,
        "starting block splitter"
    );
    scheduler.run(cancel).await?;
    Ok(())
}
