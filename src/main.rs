use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use std::path::Path;

use feedsnap::config::{config_dir, Config};
use feedsnap::feed::build_client;
use feedsnap::ingest::{IngestError, Ingestor};
use feedsnap::storage::{Database, DatabaseError, FeedItem, LAST_LOADED_URL};
use feedsnap::util::{single_line, strip_control_chars, strip_tags, truncate_to_width};

/// Display width of the title column in `list`
const TITLE_WIDTH: usize = 72;

#[derive(Parser, Debug)]
#[command(name = "feedsnap", about = "Snapshot an RSS feed into a local database")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download the feed and replace the stored items
    Refresh {
        /// Feed URL (defaults to `feed_url` from config.toml)
        #[arg(long)]
        url: Option<String>,

        /// Skip the download if this URL was the last one loaded successfully
        #[arg(long)]
        if_changed: bool,
    },
    /// List stored items, newest first
    List {
        /// Only items whose title contains TEXT (case-insensitive)
        #[arg(long, value_name = "TEXT")]
        search: Option<String>,
    },
    /// Show one item in full
    Show {
        /// Item id as printed by `list`
        id: i64,
    },
}

fn format_date(published_at: i64) -> String {
    if published_at == 0 {
        return "-".to_string();
    }
    match DateTime::from_timestamp_millis(published_at) {
        Some(utc) => utc.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string(),
        None => "-".to_string(),
    }
}

async fn open_database(path: &Path) -> Result<Database> {
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    match Database::open(path_str).await {
        Ok(db) => Ok(db),
        Err(DatabaseError::InstanceLocked) => {
            eprintln!("Error: The database is locked by another feedsnap process. Try again when it finishes.");
            std::process::exit(1);
        }
        Err(e) => Err(anyhow::anyhow!("Failed to open database: {}", e)),
    }
}

async fn refresh(
    db: &Database,
    config: &Config,
    url: Option<String>,
    if_changed: bool,
) -> Result<()> {
    let Some(url) = url.or_else(|| config.feed_url.clone()) else {
        eprintln!("Error: No feed URL. Pass --url or set feed_url in config.toml.");
        std::process::exit(2);
    };

    if if_changed {
        let last = db
            .get_preference(LAST_LOADED_URL)
            .await
            .context("Failed to read last loaded URL")?;
        if last.as_deref() == Some(url.as_str()) {
            tracing::info!(url = %url, "Feed URL unchanged, skipping refresh");
            println!("Already up to date with {}", url);
            return Ok(());
        }
    }

    let client = build_client().context("Failed to build HTTP client")?;
    let ingestor = Ingestor::new(db.clone(), client).with_mode(config.replace_mode);

    let handle = match ingestor.refresh(&url).await {
        Ok(handle) => handle,
        Err(IngestError::Busy) => anyhow::bail!("A refresh is already running"),
        Err(e) => return Err(anyhow::Error::new(e).context("Failed to start refresh")),
    };

    match handle.wait_detailed().await {
        Ok(summary) => {
            db.set_preference(LAST_LOADED_URL, &url)
                .await
                .context("Failed to record last loaded URL")?;
            println!(
                "Loaded {} items ({} with images) from {}",
                summary.items, summary.images, summary.url
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Refresh failed: {}", e);
            std::process::exit(1);
        }
    }
}

async fn list(db: &Database, search: Option<&str>) -> Result<()> {
    let items = db.query_items(search).await.context("Failed to load items")?;
    if items.is_empty() {
        println!("No items.");
        return Ok(());
    }

    for item in &items {
        let title = single_line(&item.title);
        println!(
            "{:>5}  {:<16}  {}",
            item.id,
            format_date(item.published_at),
            truncate_to_width(&title, TITLE_WIDTH)
        );
    }
    Ok(())
}

fn print_item(item: &FeedItem) {
    println!("{}", single_line(&item.title));
    println!("Link:      {}", strip_control_chars(&item.link));
    println!("Published: {}", format_date(item.published_at));
    match (&item.image_url, &item.image_content) {
        (Some(url), Some(bytes)) => {
            println!("Image:     {} ({} bytes)", strip_control_chars(url), bytes.len())
        }
        (Some(url), None) => println!("Image:     {} (not downloaded)", strip_control_chars(url)),
        (None, _) => {}
    }
    println!();
    println!("{}", strip_tags(&item.description));
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing for debug logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        tracing::info!(path = %config_dir.display(), "Created config directory");
    }

    // User-only access on Unix: the database holds whatever the feed served
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

    let config = Config::load(&config_dir.join("config.toml")).context("Failed to load config")?;
    let db = open_database(&config.database_path(&config_dir)).await?;

    match args.command {
        Command::Refresh { url, if_changed } => refresh(&db, &config, url, if_changed).await,
        Command::List { search } => list(&db, search.as_deref()).await,
        Command::Show { id } => {
            match db.get_item(id).await.context("Failed to load item")? {
                Some(item) => print_item(&item),
                None => {
                    eprintln!("No item with id {}", id);
                    std::process::exit(1);
                }
            }
            Ok(())
        }
    }
}
