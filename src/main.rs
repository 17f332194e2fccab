use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use feedsweep::config::Config;
use feedsweep::feed::{RefreshEvent, RefreshRequest, Refresher};
use feedsweep::network::NetworkState;
use feedsweep::storage::{Database, DatabaseError};
use feedsweep::util::{clean_title, validate_feed_url};

/// Get the config directory path (~/.config/feedsweep/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedsweep"))
}

#[derive(Parser, Debug)]
#[command(name = "feedsweep", about = "Batch refresher for RSS and Atom feeds")]
struct Args {
    /// Config file (default: ~/.config/feedsweep/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Database file (default: ~/.config/feedsweep/feeds.db)
    #[arg(long, value_name = "FILE", global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to a feed
    Add {
        url: String,
        #[arg(long)]
        title: Option<String>,
        /// Only refresh this feed on Wi-Fi
        #[arg(long)]
        wifi_only: bool,
        /// Send a browser User-Agent to this feed
        #[arg(long)]
        impose_user_agent: bool,
    },
    /// Refresh one feed or all of them
    Refresh {
        #[arg(long, value_name = "ID")]
        feed: Option<i64>,
        /// Include wifi-only feeds on other networks
        #[arg(long)]
        override_wifi_only: bool,
        /// Active network: wifi, other or offline
        #[arg(long, default_value = "wifi")]
        network: NetworkState,
        /// Record this run as a scheduled refresh
        #[arg(long)]
        scheduled: bool,
    },
    /// List subscribed feeds and their refresh state
    List,
    /// Forget a feed's icon so the next refresh looks for it again
    ResetIcon { id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing for debug logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
    }

    // Set directory permissions on Unix (user-only access)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) =
            std::fs::set_permissions(&config_dir, std::fs::Permissions::from_mode(0o700))
        {
            tracing::warn!(
                path = %config_dir.display(),
                error = %e,
                "Failed to set config directory permissions to 0700"
            );
        }
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let db_path = args.db.clone().unwrap_or_else(|| config_dir.join("feeds.db"));
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!("Error: Another feedsweep process is using the database. Try again later.");
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open database: {}", e)),
    };

    match args.command {
        Command::Add {
            url,
            title,
            wifi_only,
            impose_user_agent,
        } => {
            let url = validate_feed_url(&url).context("Refusing to subscribe")?;
            let title = title
                .map(|t| clean_title(&t).into_owned())
                .unwrap_or_else(|| url.host_str().unwrap_or_default().to_string());
            let id = db
                .insert_feed(url.as_str(), &title)
                .await
                .context("Failed to add feed")?;
            db.set_feed_policy(id, wifi_only, impose_user_agent)
                .await
                .context("Failed to set feed policy")?;
            println!("Added feed {id}: {title} <{url}>");
        }
        Command::Refresh {
            feed,
            override_wifi_only,
            network,
            scheduled,
        } => {
            refresh(
                db,
                config,
                RefreshRequest {
                    feed_id: feed,
                    override_wifi_only,
                    scheduled,
                },
                network,
            )
            .await?;
        }
        Command::List => {
            let feeds = db
                .select_feeds(Default::default())
                .await
                .context("Failed to load feeds")?;
            if feeds.is_empty() {
                println!("No feeds yet. Add one with: feedsweep add <URL>");
            }
            for feed in feeds {
                let icon = match &feed.icon {
                    None => "-",
                    Some(bytes) if bytes.is_empty() => "none",
                    Some(_) => "yes",
                };
                println!(
                    "{:>4}  {:<10}  icon:{:<4}  {}  <{}>",
                    feed.id,
                    feed.fetch_mode.to_string(),
                    icon,
                    clean_title(&feed.title),
                    feed.url
                );
                if let Some(error) = &feed.error {
                    println!("      error: {}", clean_title(error));
                }
            }
        }
        Command::ResetIcon { id } => {
            if db.get_feed(id).await?.is_none() {
                anyhow::bail!("No feed with id {id}");
            }
            db.reset_icon(id).await.context("Failed to reset icon")?;
            println!("Icon for feed {id} will be looked up on the next refresh.");
        }
    }

    Ok(())
}

async fn refresh(
    db: Database,
    config: Config,
    request: RefreshRequest,
    network: NetworkState,
) -> Result<()> {
    let (event_tx, mut event_rx) = mpsc::channel::<RefreshEvent>(4);
    let refresher = Refresher::new(db, Arc::new(config)).with_events(event_tx);

    let token = refresher.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, stopping refresh");
            token.cancel();
        }
    });

    let summary = match refresher.refresh(request, network).await {
        Ok(summary) => summary,
        Err(feedsweep::feed::RefreshError::NetworkUnavailable) => {
            eprintln!("No network connection; nothing refreshed.");
            return Ok(());
        }
        Err(e) => return Err(e).context("Refresh failed"),
    };
    // Closes the event channel so the loop below ends.
    drop(refresher);

    for outcome in &summary.outcomes {
        match &outcome.error {
            Some(error) => println!("feed {:>4}: failed: {}", outcome.feed_id, error),
            None => println!("feed {:>4}: {} new", outcome.feed_id, outcome.new_entries),
        }
    }

    while let Some(event) = event_rx.recv().await {
        let RefreshEvent::Completed {
            new_entries,
            unread,
        } = event;
        match unread {
            Some(unread) => println!("{new_entries} new entries ({unread} unread)"),
            None => println!("{new_entries} new entries"),
        }
    }
    if summary.cancelled {
        println!("Refresh cancelled.");
    }
    Ok(())
}
