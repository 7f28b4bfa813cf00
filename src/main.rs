use anyhow::{Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use depotsync::cli::{Cli, Commands, DropArgs, FstatArgs, IngestArgs, KeepArgs, TransferArgs};
use depotsync::config::Config;
use depotsync::depot::{CommandDepot, Depot};
use depotsync::error::SyncError;
use depotsync::filter::{fail, DropChecksum, DropHaveList, KeepCase, Progress};
use depotsync::record::COLUMNS_HEADER;
use depotsync::server::{run_server, store::CacheStore};
use depotsync::state::LocalState;
use depotsync::streaming::{entry_channel, read_into, Pipeline, RecordWriter, STAGE_CHANNEL_SIZE};
use depotsync::sync::query::query_range;
use depotsync::sync::{Reconciler, SyncReport, SyncRequest};
use depotsync::transfer::{CommandTransfer, TransferMode};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_level());

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::debug!("{:?}", e);
            match e.downcast_ref::<SyncError>() {
                Some(err) => eprintln!("error: {}", err),
                None => eprintln!("error: {:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(level: &str) {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into()))
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Sync(args) => {
            let request = SyncRequest::new(&args.dir).force(args.force);
            let request = with_options(request, args.prefix, args.at);
            let reconciler = reconciler(&config, &args.dir, request.prefix.as_deref())?;
            let report = reconciler.sync(&request).await?;
            log_report(&report);
        }
        Commands::Clean(args) => {
            let request = with_options(SyncRequest::new(&args.dir), args.prefix, args.at);
            let reconciler = reconciler(&config, &args.dir, request.prefix.as_deref())?;
            let report = reconciler.clean(&request, args.discard).await?;
            log_report(&report);
        }
        Commands::Fstat(args) => fstat(&config, args).await?,
        Commands::Head(args) => {
            let head = depot(&config)?.head(&args.prefix).await?;
            println!("{}", head);
        }
        Commands::Drop(args) => drop_stage(&config, args).await?,
        Commands::Keep(args) => keep_stage(&config, args).await?,
        Commands::Progress => {
            run_stage(Pipeline::new(config.pipeline_options()).filter(Progress::new("progress")))
                .await?
        }
        Commands::Fail => {
            let (tx, rx) = entry_channel(config.pipeline.channel_capacity);
            let reader = tokio::spawn(read_into(tokio::io::stdin(), tx));
            let failed = fail(rx).await;
            reader.await.context("stdin reader panicked")??;
            failed?;
        }
        Commands::Transfer(args) => transfer_stage(&config, args).await?,
        Commands::Serve(args) => {
            run_server(&args.listen, &args.store, config.credentials()).await?
        }
        Commands::Ingest(args) => ingest(&config, args).await?,
    }
    Ok(())
}

fn with_options(mut request: SyncRequest, prefix: Option<String>, at: Option<u64>) -> SyncRequest {
    if let Some(prefix) = prefix {
        request = request.prefix(prefix);
    }
    if let Some(at) = at {
        request = request.at(at);
    }
    request
}

fn depot(config: &Config) -> Result<Arc<dyn Depot>> {
    let command = config.depot.command.as_ref().ok_or_else(|| {
        SyncError::Config("depot.command is not set; it is needed to query the depot".to_string())
    })?;
    Ok(Arc::new(CommandDepot::new(
        command.clone(),
        config.depot.head_command.clone(),
    )))
}

fn transfer_command(config: &Config, prefix: &str, root: &Path) -> Result<CommandTransfer> {
    let command = config.transfer.command.as_ref().ok_or_else(|| {
        SyncError::Config("transfer.command is not set".to_string())
    })?;
    Ok(CommandTransfer::new(command, prefix, root)?
        .with_force_args(config.transfer.force_args.clone())
        .with_path_format(config.transfer.path_format.clone()))
}

fn reconciler(config: &Config, dir: &Path, prefix: Option<&str>) -> Result<Reconciler> {
    // The transfer command is bound to the prefix; fall back to the one on disk.
    let prefix = match prefix {
        Some(p) => p.to_string(),
        None => LocalState::open(dir)?
            .prefix()
            .map(str::to_string)
            .ok_or_else(|| {
                SyncError::Config(format!(
                    "{} has never been synced; give a depot prefix",
                    dir.display()
                ))
            })?,
    };
    let executor = transfer_command(config, prefix.trim_end_matches('/'), dir)?;
    Ok(
        Reconciler::new(depot(config)?, Arc::new(executor), config.pipeline_options())
            .with_service(config.service_client()?)
            .case_insensitive(config.pipeline.case_insensitive)
            .havelist(config.pipeline.havelist)
            .progress(true),
    )
}

fn log_report(report: &SyncReport) {
    tracing::info!(
        prefix = %report.prefix,
        changelist = report.to,
        queried = report.queried,
        dropped = report.dropped_pre,
        transferred = report.transferred_first,
        forced = report.transferred_second,
        failed_transfers = report.failed_transfers,
        cleaned = report.cleaned,
        "done"
    );
}

/// stdin -> pipeline -> stdout
async fn run_stage(pipeline: Pipeline) -> Result<()> {
    let (tx, rx) = entry_channel(STAGE_CHANNEL_SIZE);
    let reader = tokio::spawn(read_into(tokio::io::stdin(), tx));
    let drained = pipeline.spawn(rx).drain_to(tokio::io::stdout()).await;
    let read = reader.await.context("stdin reader panicked")?;

    // A reader error closes the pipeline cleanly, so it has to be checked first.
    let lines = read?;
    let (written, _) = drained?;
    tracing::debug!(read = lines, written, "stage done");
    Ok(())
}

async fn drop_stage(config: &Config, args: DropArgs) -> Result<()> {
    let mut pipeline = Pipeline::new(config.pipeline_options());
    if args.havelist {
        let state = LocalState::open(&args.root)?;
        pipeline = pipeline.filter(DropHaveList::new(state.have().clone()));
    }
    if args.checksum {
        pipeline = pipeline.filter(DropChecksum::new(&args.root));
    }
    run_stage(pipeline).await
}

async fn keep_stage(config: &Config, args: KeepArgs) -> Result<()> {
    let filter = KeepCase::new(&args.root, config.pipeline.case_insensitive);
    run_stage(Pipeline::new(config.pipeline_options()).filter(filter)).await
}

async fn transfer_stage(config: &Config, args: TransferArgs) -> Result<()> {
    let mode = if args.force {
        TransferMode::Force
    } else {
        TransferMode::Normal
    };
    let executor = transfer_command(config, args.prefix.trim_end_matches('/'), &args.root)?;
    run_stage(Pipeline::new(config.pipeline_options()).transfer(Arc::new(executor), mode)).await
}

async fn fstat(config: &Config, args: FstatArgs) -> Result<()> {
    let depot = depot(config)?;
    let service = config.service_client()?;
    let result = query_range(depot.as_ref(), service.as_ref(), &args.prefix, args.from, args.to).await?;

    let mut writer = RecordWriter::new(tokio::io::stdout());
    writer.write_comment(COLUMNS_HEADER).await?;
    for record in &result.records {
        writer.write_record(record).await?;
    }
    writer.flush().await
}

async fn ingest(config: &Config, args: IngestArgs) -> Result<()> {
    let depot = depot(config)?;
    let store = CacheStore::open(&args.store)?;
    let added = store.ingest(depot.as_ref(), &args.prefix, args.at).await?;
    tracing::info!(prefix = %args.prefix, changelist = args.at, added, "ingest");
    if let Some(keep) = args.keep {
        let removed = store.prune(&args.prefix, keep)?;
        tracing::info!(prefix = %args.prefix, removed, "pruned");
    }
    Ok(())
}
