use std::{process, sync::Arc, time::Duration};

use larder::{
    application::{
        diagnostics::Diagnostics,
        error::AppError,
        retrieval::{RetrievalConfig, RetrievalEngine, RetrieveOptions},
        token::OsTokenSource,
    },
    cache::{CacheAside, CacheConfig, FetchOptions, FetchRequest},
    config::{self, DequeueArgs, EnqueueArgs, FetchArgs, LockArgs, Settings, UnlockArgs},
    coordination::{
        AcquireOptions, DequeueOptions, DistributedMutex, LockConfig, QueueConfig,
        ReturnPredicate, WorkQueue,
    },
    domain::{
        condition::ConditionSet,
        key::{KeyColumn, join_identifier},
        record::key_part,
        task::TaskOptions,
    },
    infra::{db::PostgresStore, error::InfraError, kv::RedisStore, telemetry},
};
use serde::Serialize;
use serde_json::Value;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(error.exit_code());
    }
}

fn report_application_error(error: &AppError) {
    let chain = error.chain().join(": ");
    if dispatcher::has_been_set() {
        error!(error = %chain, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %chain, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging)?;

    let diagnostics = Diagnostics {
        test: cli_args.overrides.diagnostics.dry_run,
        verbose: cli_args.overrides.diagnostics.verbose,
    };
    if diagnostics.test {
        info!("dry run: no store will be written");
    }

    match cli_args.command {
        config::Command::Fetch(args) => run_fetch(&settings, *args, diagnostics).await,
        config::Command::Enqueue(args) => run_enqueue(&settings, args, diagnostics).await,
        config::Command::Dequeue(args) => run_dequeue(&settings, args, diagnostics).await,
        config::Command::Lock(args) => run_lock(&settings, args, diagnostics).await,
        config::Command::Unlock(args) => run_unlock(&settings, args, diagnostics).await,
    }
}

async fn connect_redis(settings: &Settings) -> Result<Arc<RedisStore>, AppError> {
    let store = RedisStore::connect(&settings.redis.url)
        .await
        .map_err(InfraError::from)?;
    Ok(Arc::new(store))
}

async fn connect_database(settings: &Settings) -> Result<Arc<PostgresStore>, AppError> {
    let url = settings.database.url.as_deref().ok_or_else(|| {
        InfraError::configuration("database.url must be set to fetch rows")
    })?;
    let pool = PostgresStore::connect(url, settings.database.max_connections.get())
        .await
        .map_err(InfraError::from)?;
    Ok(Arc::new(PostgresStore::new(pool)))
}

fn print_json<T: Serialize>(value: &T) -> Result<(), AppError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::unexpected(format!("failed to render output: {err}")))?;
    println!("{rendered}");
    Ok(())
}

fn parse_json(raw: &str, what: &str) -> Result<Value, AppError> {
    serde_json::from_str(raw).map_err(|err| AppError::validation(format!("invalid {what}: {err}")))
}

/// Targets are JSON when they parse as JSON and plain strings otherwise.
fn parse_target(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn target_identifier(target: &Value, delimiter: &str) -> String {
    match target {
        Value::Array(parts) => {
            let parts: Vec<String> = parts.iter().map(key_part).collect();
            join_identifier(&parts, delimiter)
        }
        scalar => key_part(scalar),
    }
}

async fn run_fetch(
    settings: &Settings,
    args: FetchArgs,
    diagnostics: Diagnostics,
) -> Result<(), AppError> {
    let key_columns = KeyColumn::parse_all(&args.key_columns)?;
    let conditions = match args.conditions.as_deref() {
        Some(raw) => ConditionSet::from_json(&parse_json(raw, "conditions")?)?,
        None => ConditionSet::default(),
    };
    let targets: Vec<Value> = args.targets.iter().map(|raw| parse_target(raw)).collect();
    let table_name = args
        .table
        .split_whitespace()
        .next()
        .unwrap_or(args.table.as_str());
    let namespace = args
        .namespace
        .clone()
        .unwrap_or_else(|| format!("cache:{table_name}:"));

    let kv = connect_redis(settings).await?;
    let db = connect_database(settings).await?;
    let engine = Arc::new(RetrievalEngine::new(
        db,
        RetrievalConfig::from(&settings.retrieval),
    ));
    let cache = CacheAside::new(engine, kv, CacheConfig::from(&settings.cache));

    if args.invalidate {
        let delimiter = settings.retrieval.key_delimiter.as_str();
        let ids: Vec<String> = targets
            .iter()
            .map(|target| target_identifier(target, delimiter))
            .collect();
        let removed = cache
            .invalidate(&namespace, &ids, diagnostics)
            .await
            .map_err(|err| InfraError::redis(err.to_string()))?;
        return print_json(&serde_json::json!({ "removed": removed }));
    }

    let request = FetchRequest {
        targets,
        key_columns,
        table: args.table.clone(),
        namespace: Some(namespace),
        columns: args.columns.clone(),
    };
    let options = FetchOptions {
        use_cache: args.no_cache.then_some(false),
        conditions,
        retrieve: RetrieveOptions {
            limit: args.limit,
            group_by_first: args.group_by_first,
            diagnostics,
            ..RetrieveOptions::default()
        },
        diagnostics,
        ..FetchOptions::default()
    };

    let result = cache.get_or_fetch(&request, &options).await?;
    print_json(&result)
}

async fn run_enqueue(
    settings: &Settings,
    args: EnqueueArgs,
    diagnostics: Diagnostics,
) -> Result<(), AppError> {
    let payload = parse_json(&args.payload, "payload")?;
    let options = TaskOptions {
        kind: args.kind,
        from: args.from,
        to: args.to,
        id: args.id,
        in_progress_queue: args.in_progress_queue,
        success_queue: args.success_queue,
        failure_queue: args.failure_queue,
        retry_limit: args.retry_limit,
        return_limit: args.return_limit,
        sleep_after_return_ms: args.sleep_after_return_ms,
        ..TaskOptions::default()
    };

    let kv = connect_redis(settings).await?;
    let queue = WorkQueue::new(
        kv,
        Arc::new(OsTokenSource),
        QueueConfig::from(&settings.queue),
    );
    let outcomes = queue
        .enqueue(&args.queues, payload, &options, diagnostics)
        .await;
    print_json(&outcomes)
}

async fn run_dequeue(
    settings: &Settings,
    args: DequeueArgs,
    diagnostics: Diagnostics,
) -> Result<(), AppError> {
    let predicate = match args.return_if.as_deref() {
        Some(raw) => ReturnPredicate::from_json(&parse_json(raw, "return predicate")?)?,
        None => ReturnPredicate::new(),
    };

    let kv = connect_redis(settings).await?;
    let queue = WorkQueue::new(
        kv,
        Arc::new(OsTokenSource),
        QueueConfig::from(&settings.queue),
    );
    let options = DequeueOptions {
        timeout: args.timeout_seconds.map(Duration::from_secs),
        queue_prefix: None,
        diagnostics,
    };
    let delivery = queue.dequeue(&args.queues, &predicate, &options).await;
    print_json(&delivery)
}

async fn run_lock(
    settings: &Settings,
    args: LockArgs,
    diagnostics: Diagnostics,
) -> Result<(), AppError> {
    let kv = connect_redis(settings).await?;
    let mutex = DistributedMutex::new(
        kv,
        Arc::new(OsTokenSource),
        LockConfig::from(&settings.lock),
    );
    let options = AcquireOptions {
        hold: args.hold_seconds.map(Duration::from_secs),
        max_wait: args.max_wait_ms.map(Duration::from_millis),
        tries: args.tries,
        random_delay: None,
        diagnostics,
    };
    let outcomes = mutex.acquire(&args.names, args.token, &options).await;
    print_json(&outcomes)
}

async fn run_unlock(
    settings: &Settings,
    args: UnlockArgs,
    diagnostics: Diagnostics,
) -> Result<(), AppError> {
    let kv = connect_redis(settings).await?;
    let mutex = DistributedMutex::new(
        kv,
        Arc::new(OsTokenSource),
        LockConfig::from(&settings.lock),
    );
    let outcome = mutex
        .release(&args.name, args.token.as_deref(), diagnostics)
        .await;
    print_json(&outcome)
}
