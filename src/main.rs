use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flatlink::{
    stats::PageRequest,
    urls::{NewUrl, UrlUpdate},
    Store, StoreConfig,
};

// ── Command line ───────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "flatlink", version, about = "Maintenance commands for the flatlink data directory")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the admin account, or promote and reactivate it if it exists
    SetupAdmin {
        #[arg(long, default_value = "admin")]
        username: String,
        /// Falls back to ADMIN_PASSWORD
        #[arg(long)]
        password: Option<String>,
    },
    /// Check the click table layout and migrate it if needed
    Migrate,
    /// Shorten a URL
    Create {
        url: String,
        #[arg(long)]
        code: Option<String>,
        #[arg(long)]
        title: Option<String>,
        #[arg(long = "user")]
        created_by: String,
    },
    /// List URLs with click totals
    List {
        #[arg(long)]
        user: Option<String>,
    },
    /// Print stats for a short code as JSON
    Stats {
        code: String,
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Rename a short code, moving its clicks along
    Rename { old: String, new: String },
    /// Delete a short URL
    Delete { code: String },
}

// ── Entry point ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env (ignore error if file is absent; env vars may already be set)
    dotenvy::dotenv().ok();

    // Initialise structured logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flatlink=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = StoreConfig::from_env()?;
    tracing::info!("Data directory: {}", config.data_dir.display());
    let store = Store::open(config);

    match cli.command {
        Command::SetupAdmin { username, password } => {
            let password = match password {
                Some(p) => p,
                None => std::env::var("ADMIN_PASSWORD")
                    .context("pass --password or set ADMIN_PASSWORD")?,
            };
            let created = store.users().ensure_admin(&username, &password).await?;
            if created {
                println!("Created admin account {username}");
            } else {
                println!("Admin account {username} is ready");
            }
        }

        Command::Migrate => {
            let clicks = store.migrate().await?;
            println!("Click ledger ready ({clicks} clicks)");
        }

        Command::Create {
            url,
            code,
            title,
            created_by,
        } => {
            let created = store
                .urls()
                .create_short_url(NewUrl {
                    original_url: url,
                    custom_code: code,
                    title,
                    created_by,
                })
                .await?;
            println!("{} -> {}", created.short_url, created.url.original_url);
        }

        Command::List { user } => {
            for entry in store.urls_with_stats(user.as_deref()).await? {
                println!(
                    "{}\t{}\t{} clicks\t{} visitors\t{}",
                    entry.url.short_code,
                    entry.url.created_by,
                    entry.click_count,
                    entry.unique_visitors,
                    entry.url.original_url
                );
            }
        }

        Command::Stats { code, page, limit } => {
            let limit = limit.unwrap_or(store.config().stats_page_limit);
            let page = PageRequest::from_page(page, limit)?;
            let stats = store.url_stats(&code, Some(page)).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }

        Command::Rename { old, new } => {
            let current = store
                .urls()
                .get_url_by_short_code(&old)
                .await?
                .with_context(|| format!("no URL with short code '{old}'"))?;
            let renamed = store
                .urls()
                .update_url(
                    &old,
                    UrlUpdate {
                        original_url: current.original_url,
                        title: None,
                        new_short_code: Some(new),
                    },
                )
                .await?;
            println!("Renamed {old} to {}", renamed.short_code);
        }

        Command::Delete { code } => {
            store.urls().delete_url(&code).await?;
            println!("Deleted {code}");
        }
    }

    Ok(())
}
