use std::path::PathBuf;

use anyhow::{anyhow, Context};
use bizdash_core::models::{OrderBy, PageRequest, Query, CREATED_AT_FIELD};
use bizdash_core::{init_tracing, DashboardConfig, DashboardCore, Notification, Role, SessionContext, SyncMode};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RoleArg {
    Owner,
    Manager,
    Employee,
}

impl From<RoleArg> for Role {
    fn from(value: RoleArg) -> Self {
        match value {
            RoleArg::Owner => Role::Owner,
            RoleArg::Manager => Role::Manager,
            RoleArg::Employee => Role::Employee,
        }
    }
}

#[derive(Parser)]
#[command(name = "bizdash", version, about = "Notification maintenance for the retail dashboard")]
struct Cli {
    #[arg(long, global = true, env = "BIZDASH_CONFIG", help = "YAML config file; BIZDASH_* variables override its values")]
    config: Option<PathBuf>,

    #[arg(long, global = true, env = "BIZDASH_USER", help = "Signed-in user id")]
    user: String,

    #[arg(long, global = true, env = "BIZDASH_ROLE", value_enum, default_value = "employee")]
    role: RoleArg,

    #[arg(long, global = true, env = "BIZDASH_SCOPE", help = "Tenant scope (store or branch)")]
    scope: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Create or refresh notifications for every qualifying subject")]
    Generate,
    #[command(about = "Delete all of the user's notifications in scope (owner or manager)")]
    Clear,
    #[command(about = "Remove notifications whose subject is resolved or gone")]
    Cleanup,
    #[command(about = "Clear, then generate from scratch (owner or manager)")]
    Regenerate,
    #[command(about = "Keep generating on the configured refresh period until interrupted")]
    Watch,
    #[command(about = "Page through the user's notifications, newest first")]
    List {
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long)]
        cursor: Option<String>,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CountResponse {
    removed: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = DashboardConfig::load(cli.config.as_deref()).context("failed to load config")?;
    if let Err(error) = init_tracing(&config.log_dir(), &config.log_filter) {
        eprintln!("logging disabled: {}", error);
    }

    let context = SessionContext::new(cli.user, cli.role.into(), cli.scope)?;
    let core = DashboardCore::init(config).context("failed to open dashboard store")?;

    let result = run(&core, &context, cli.command).await;
    if let Err(error) = core.close().await {
        tracing::warn!(error = %error, "store close failed");
    }
    result
}

async fn run(core: &DashboardCore, context: &SessionContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Generate => print_json(&core.generate_all(context).await?),
        Commands::Clear => print_json(&CountResponse {
            removed: core.clear_all(context).await?,
        }),
        Commands::Cleanup => print_json(&CountResponse {
            removed: core.cleanup_resolved(context).await?,
        }),
        Commands::Regenerate => print_json(&core.regenerate(context).await?),
        Commands::Watch => {
            let background = core.start_background_refresh(context).await?;
            tracing::info!(
                interval_secs = core.config().refresh_secs,
                scope = %context.scope,
                "watching for due notifications"
            );
            tokio::signal::ctrl_c()
                .await
                .map_err(|error| anyhow!("failed to wait for ctrl-c: {}", error))?;
            let runs = background.gate().completed_runs();
            background.stop();
            print_json(&serde_json::json!({ "runs": runs }))
        }
        Commands::List { limit, cursor } => {
            let query = Query::new()
                .where_eq("userId", context.user_id.clone())
                .order_by(OrderBy::desc(CREATED_AT_FIELD));
            let page = core
                .repository::<Notification>(context, SyncMode::Snapshot)
                .page(&query, PageRequest { limit, cursor })
                .await?;
            print_json(&page)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
