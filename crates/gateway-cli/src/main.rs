mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use gateway_core::config::build_memory_coordinator;
use gateway_core::driver::NoopDriver;
use gateway_core::gateway::{CreateTaskRequest, GatewayService};
use gateway_core::message::MessageBuffer;
use gateway_core::scheduler::{CreateScheduleRequest, ScheduleManager};
use gateway_db::models::TriggerPayload;
use gateway_db::pool;

use config::GatewayConfig;

#[derive(Parser)]
#[command(name = "agent-gateway", about = "Single-process agent runtime gateway")]
struct Cli {
    /// Database URL (overrides GATEWAY_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Workspace root for `.agent/` persisted state (overrides GATEWAY_WORKSPACE env var)
    #[arg(long, global = true)]
    workspace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a gateway config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/agent_gateway")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the gateway database (requires config file or env vars)
    DbInit,
    /// Submit one task and wait for it to settle, printing its messages.
    Run {
        /// Task input text
        input: String,
        /// Task type tag
        #[arg(long)]
        task_type: Option<String>,
        /// Priority, 0 (most urgent) to 4 (least)
        #[arg(long)]
        priority: Option<u8>,
        /// Max seconds to wait for the task to settle
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
    /// Durable schedule management
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommands,
    },
    /// Persistent memory inspection
    Memory {
        #[command(subcommand)]
        command: MemoryCommands,
    },
}

#[derive(Subcommand)]
enum ScheduleCommands {
    /// Create a one-shot or cron schedule
    Create {
        dedupe_key: String,
        input: String,
        #[arg(long)]
        task_type: Option<String>,
        #[arg(long)]
        priority: Option<u8>,
        /// Fire after this many seconds
        #[arg(long)]
        delay_seconds: Option<f64>,
        /// Fire at this RFC3339 UTC timestamp
        #[arg(long)]
        at: Option<DateTime<Utc>>,
        /// A 5-field UTC cron expression
        #[arg(long)]
        cron: Option<String>,
    },
    /// List all schedules
    List,
    /// Fetch a single schedule by id
    Get { schedule_id: uuid::Uuid },
    /// Cancel a schedule by id
    Cancel { schedule_id: uuid::Uuid },
}

#[derive(Subcommand)]
enum MemoryCommands {
    /// Full-text (or substring-fallback) search over persistent memory
    Search {
        query: String,
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
    /// Fetch a single memory block by id
    Get { block_id: String },
    /// Record a positive or negative feedback signal on a memory block
    Feedback {
        block_id: String,
        #[arg(value_enum)]
        direction: FeedbackArg,
    },
    /// Summary stats for the memory store
    Stats,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum FeedbackArg {
    Positive,
    Negative,
}

impl From<FeedbackArg> for gateway_core::memory::FeedbackDirection {
    fn from(value: FeedbackArg) -> Self {
        match value {
            FeedbackArg::Positive => Self::Positive,
            FeedbackArg::Negative => Self::Negative,
        }
    }
}

/// Execute the `init` command: write config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!("config file already exists at {}\nUse --force to overwrite.", path.display());
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection { url: db_url.to_string() },
        workspace: None,
        memory: config::MemorySection::default(),
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!();
    println!("Next: run `agent-gateway db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = GatewayConfig::resolve(cli_db_url, None)?;

    println!("Initializing agent-gateway database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&db_pool).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;
    println!("agent-gateway db-init complete.");
    Ok(())
}

async fn build_gateway(resolved: &GatewayConfig) -> anyhow::Result<(Arc<GatewayService>, sqlx::PgPool)> {
    let db_pool = pool::create_pool(&resolved.db_config).await?;

    let memory = build_memory_coordinator(&resolved.workspace, &resolved.memory_config, Some(db_pool.clone()))
        .await
        .context("failed to initialize memory coordinator")?;

    let buffer = Arc::new(MessageBuffer::new());
    let driver = Arc::new(NoopDriver);

    let gateway = GatewayService::new(driver, buffer, Some(memory));

    let scheduler = build_scheduler(db_pool.clone(), Arc::clone(&gateway));
    gateway.attach_scheduler(scheduler).await;

    Ok((gateway, db_pool))
}

/// Build a `ScheduleManager` whose `on_trigger` submits to `gateway`.
fn build_scheduler(db_pool: sqlx::PgPool, gateway: Arc<GatewayService>) -> Arc<ScheduleManager> {
    let on_trigger: gateway_core::scheduler::OnTrigger = Arc::new(move |row| {
        let gateway = Arc::clone(&gateway);
        Box::pin(async move {
            gateway
                .submit_task(CreateTaskRequest {
                    task_type: Some(row.task_type.clone()),
                    input: row.task_input.clone(),
                    priority: Some(row.priority as u8),
                })
                .await?;
            Ok(())
        })
    });
    Arc::new(ScheduleManager::new(db_pool, on_trigger))
}

async fn cmd_run(resolved: &GatewayConfig, input: String, task_type: Option<String>, priority: Option<u8>, timeout_secs: u64) -> anyhow::Result<()> {
    let (gateway, db_pool) = build_gateway(resolved).await?;
    gateway.start().await;

    let response = gateway
        .submit_task(CreateTaskRequest { task_type, input, priority })
        .await?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    let mut after_seq = 0;
    loop {
        let fetched = gateway
            .get_task(response.task_id, Some(after_seq))
            .await
            .context("task disappeared from the registry")?;

        for message in &fetched.messages.items {
            println!("[{}] {:?}", message.seq, message.body);
        }
        after_seq = fetched.messages.next_seq.saturating_sub(1);

        if matches!(
            fetched.task.status,
            gateway_core::task::TaskStatus::Success | gateway_core::task::TaskStatus::Failed | gateway_core::task::TaskStatus::Cancelled
        ) {
            println!("task {} settled: {}", fetched.task.id, fetched.task.status);
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            println!("timed out waiting for task {} to settle", response.task_id);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    gateway.stop().await;
    db_pool.close().await;
    Ok(())
}

async fn cmd_schedule(resolved: &GatewayConfig, command: ScheduleCommands) -> anyhow::Result<()> {
    let (gateway, db_pool) = build_gateway(resolved).await?;

    match command {
        ScheduleCommands::Create { dedupe_key, input, task_type, priority, delay_seconds, at, cron } => {
            let trigger = match (delay_seconds, at, cron) {
                (Some(delay_seconds), None, None) => TriggerPayload::Delay { delay_seconds },
                (None, Some(run_at), None) => TriggerPayload::At { run_at },
                (None, None, Some(expression)) => TriggerPayload::Cron { expression, timezone: "UTC".to_string() },
                _ => anyhow::bail!("exactly one of --delay-seconds, --at, or --cron must be given"),
            };
            let row = gateway
                .create_schedule(CreateScheduleRequest { dedupe_key, task_input: input, task_type, priority, trigger })
                .await?;
            println!("schedule {} created, next run at {}", row.schedule_id, row.next_run_at);
        }
        ScheduleCommands::List => {
            let rows = gateway.list_schedules().await?;
            for row in rows {
                println!("{} [{}] next_run_at={} dedupe_key={}", row.schedule_id, row.trigger_mode, row.next_run_at, row.dedupe_key);
            }
        }
        ScheduleCommands::Get { schedule_id } => match gateway.get_schedule(schedule_id).await? {
            Some(row) => println!("{} [{}] next_run_at={} dedupe_key={}", row.schedule_id, row.trigger_mode, row.next_run_at, row.dedupe_key),
            None => println!("no schedule with id {schedule_id}"),
        },
        ScheduleCommands::Cancel { schedule_id } => {
            let cancelled = gateway.cancel_schedule(schedule_id).await?;
            println!("schedule {schedule_id} cancelled: {cancelled}");
        }
    }

    db_pool.close().await;
    Ok(())
}

async fn cmd_memory(resolved: &GatewayConfig, command: MemoryCommands) -> anyhow::Result<()> {
    let (gateway, db_pool) = build_gateway(resolved).await?;

    match command {
        MemoryCommands::Search { query, limit } => {
            let hits = gateway.memory_search(&query, limit).await;
            for hit in hits {
                println!("{:.3} {} {}", hit.score, hit.entry.block_id, hit.entry.content);
            }
        }
        MemoryCommands::Get { block_id } => match gateway.memory_get(&block_id).await {
            Some(entry) => println!("{} {}", entry.block_id, entry.content),
            None => println!("no memory entry for {block_id}"),
        },
        MemoryCommands::Feedback { block_id, direction } => {
            gateway.memory_feedback(&block_id, direction.into()).await?;
            println!("feedback recorded for {block_id}");
        }
        MemoryCommands::Stats => {
            println!("{}", gateway.memory_stats().await);
        }
    }

    db_pool.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Init { db_url, force } => cmd_init(&db_url, force),
        Commands::DbInit => cmd_db_init(cli.database_url.as_deref()).await,
        Commands::Run { input, task_type, priority, timeout_secs } => {
            let resolved = GatewayConfig::resolve(cli.database_url.as_deref(), cli.workspace.as_deref())?;
            cmd_run(&resolved, input, task_type, priority, timeout_secs).await
        }
        Commands::Schedule { command } => {
            let resolved = GatewayConfig::resolve(cli.database_url.as_deref(), cli.workspace.as_deref())?;
            cmd_schedule(&resolved, command).await
        }
        Commands::Memory { command } => {
            let resolved = GatewayConfig::resolve(cli.database_url.as_deref(), cli.workspace.as_deref())?;
            cmd_memory(&resolved, command).await
        }
    };

    if let Err(err) = result {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
    Ok(())
}
