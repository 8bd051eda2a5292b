use std::error::Error;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::future::BoxFuture;
use itertools::Itertools;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rocksync::cloud::auth::{AuthorizationPrompt, FileSecretStore};
use rocksync::cloud::{CloudMirror, DriveClient, GoogleAuth, MirrorLayout};
use rocksync::config::{Config, ConfigError};
use rocksync::doctor;
use rocksync::episode::EpisodeUrlCache;
use rocksync::feed::{FeedCache, FeedSource};
use rocksync::library::EpisodeLibrary;
use rocksync::scraper::{HttpSurfaceFactory, PageScraper};
use rocksync::state::{DeviceIdentity, LocalStateFile};
use rocksync::sync::{PlaybackSync, SharedConnectivity, SyncPolicy};

#[derive(Parser)]
#[command(name = "rocksync", version, about = "Fetch and cache .NET Rocks! episodes")]
struct Cli {
    /// Config file to use instead of the platform default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve an episode and print its details
    Info { episode: Option<u32> },
    /// Download one episode into the local cache
    Download { episode: Option<u32> },
    /// Download every episode from START to END
    DownloadRange { start: u32, end: u32 },
    /// Store metadata for START..=END in the cloud
    CacheMetadata { start: u32, end: u32 },
    /// Show the saved playback position and the local cache
    Status,
    /// Delete cached audio and the cached feed
    ClearCache,
    /// Sign in to Google Drive
    SignIn,
    /// Sign out of Google Drive and revoke the token
    SignOut,
    /// Check configuration and connectivity
    Doctor,
}

/// Asks the user to open the consent page and paste back where it sent them.
struct ConsolePrompt;

impl AuthorizationPrompt for ConsolePrompt {
    fn authorize<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Option<String>> {
        Box::pin(async move {
            println!("Open this URL in a browser and approve access:\n\n  {}\n", url);
            println!("Then paste the full URL you were redirected to:");

            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            let line = lines.next_line().await.ok().flatten()?;
            let line = line.trim().to_string();
            (!line.is_empty()).then_some(line)
        })
    }
}

struct Services {
    urls: EpisodeUrlCache,
    library: EpisodeLibrary,
    auth: Option<Arc<GoogleAuth>>,
    mirror: Option<Arc<CloudMirror>>,
}

fn build_services(config: &Config) -> Result<Services, Box<dyn Error>> {
    let urls = EpisodeUrlCache::new();
    let feed = FeedSource::new(FeedCache::new(config)?, urls.clone(), config.show.clone());
    let mut library = EpisodeLibrary::new(config, urls.clone())?.with_feed(Arc::new(feed));

    if config.scraper.enabled {
        let factory = Arc::new(HttpSurfaceFactory::new()?);
        library = library.with_scraper(Arc::new(PageScraper::new(factory, &config.scraper)));
    }

    let mut auth = None;
    let mut mirror = None;
    if config.cloud.enabled {
        let store = Arc::new(FileSecretStore::new(config.storage.data_dir()));
        let google = Arc::new(GoogleAuth::new(&config.cloud, store)?);
        let drive = DriveClient::new(google.clone());
        let cloud = Arc::new(CloudMirror::new(
            drive,
            MirrorLayout::new(&config.cloud, &config.show),
            config.show.clone(),
        ));
        library = library.with_mirror(cloud.clone());
        auth = Some(google);
        mirror = Some(cloud);
    }

    Ok(Services {
        urls,
        library,
        auth,
        mirror,
    })
}

fn init_logging() {
    // Log to a file so progress lines on the terminal stay readable
    let log_file = File::create(std::env::temp_dir().join("rocksync.log")).ok();

    if let Some(file) = log_file {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_ansi(false)
            .with_writer(file)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

fn print_progress(label: &str, fraction: f64) {
    print!("\r  {}: {:>3.0}%", label, fraction * 100.0);
    let _ = std::io::stdout().flush();
}

/// Cancelled on Ctrl-C so partial downloads are cleaned up.
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });
    token
}

async fn run(cli: Cli, config: Config) -> Result<(), Box<dyn Error>> {
    if let Command::Doctor = cli.command {
        let results = doctor::run_checks(&config).await;
        doctor::print_results(&results);
        return Ok(());
    }

    let services = build_services(&config)?;
    let library = &services.library;
    let cancel = interrupt_token();
    let default_episode = config.show.default_episode;

    match cli.command {
        Command::Info { episode } => {
            let resolution = library
                .info(episode.unwrap_or(default_episode), &cancel)
                .await;
            let episode = &resolution.episode;

            println!("Episode {}: {}", episode.number, episode.title);
            if let Some(date) = episode.publish_date {
                println!("Published: {}", date);
            }
            println!("Page:      {}", episode.page_url);
            match &episode.audio_url {
                Some(url) => println!("Audio:     {} (via {})", url, resolution.source),
                None => println!("Audio:     not found"),
            }
            if let Some(path) = library.cached_path(episode.number) {
                println!("Cached:    {}", path.display());
            }
            if !episode.description.is_empty() {
                println!("\n{}", episode.description);
            }
        }
        Command::Download { episode } => {
            let episode = episode.unwrap_or(default_episode);
            let label = format!("Episode {}", episode);
            let progress = |fraction: f64| print_progress(&label, fraction);
            let fetched = library.download(episode, &progress, &cancel).await?;
            println!();

            if fetched.was_cached() {
                println!("Already cached: {}", fetched.path.display());
            } else {
                println!("Saved {}", fetched.path.display());
            }
        }
        Command::DownloadRange { start, end } => {
            if end < start {
                return Err(format!("end ({}) is before start ({})", end, start).into());
            }
            let progress =
                |episode: u32, fraction: f64| print_progress(&format!("Episode {}", episode), fraction);
            let summary = library.download_range(start, end, &progress, &cancel).await;
            println!("\nDownload complete: {}", summary);
            for (episode, reason) in &summary.failed {
                println!("  {} failed: {}", episode, reason);
            }
        }
        Command::CacheMetadata { start, end } => {
            if end < start {
                return Err(format!("end ({}) is before start ({})", end, start).into());
            }
            let reports = library.cache_metadata_range(start, end, &cancel).await?;
            let total: usize = reports.iter().map(|r| r.episodes).sum();
            println!(
                "Cached {} episodes across {} group(s): {}",
                total,
                reports.len(),
                reports.iter().map(|r| r.group.key()).join(", ")
            );
        }
        Command::Status => {
            let mut sync = PlaybackSync::new(
                LocalStateFile::in_dir(&config.storage.data_dir()),
                Arc::new(SharedConnectivity::default()),
                DeviceIdentity::load_or_create(
                    &config.storage.data_dir(),
                    config.playback.device_name.as_deref(),
                ),
                SyncPolicy::from(&config.playback),
            );
            if let Some(mirror) = &services.mirror {
                sync = sync.with_remote(mirror.clone());
            }

            match sync.load().await {
                Some(state) => {
                    println!("{}", state.summary());
                    if let Some(percent) = state.progress_percent() {
                        println!("  {:.0}% played, last saved {}", percent, state.last_updated);
                    }
                }
                None => println!("No saved playback position"),
            }

            let cached = library.audio_cache().cached_episodes();
            if cached.is_empty() {
                println!("No episodes cached in {}", library.audio_cache().dir().display());
            } else {
                println!(
                    "{} episode(s) cached: {}",
                    cached.len(),
                    cached.iter().join(", ")
                );
            }
            println!("URL cache entries this session: {}", services.urls.len());
        }
        Command::ClearCache => {
            library.clear_cache().await;
            println!("Cache cleared");
        }
        Command::SignIn => {
            let auth = services
                .auth
                .as_ref()
                .ok_or("cloud sync is disabled; set [cloud] enabled = true")?;
            auth.initialize(&ConsolePrompt).await?;
            info!("signed in");
            println!("Signed in");
        }
        Command::SignOut => {
            if let Some(auth) = &services.auth {
                auth.sign_out().await;
            }
            println!("Signed out");
        }
        Command::Doctor => {}
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging();

    let config = match Config::load_or_default(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            if let ConfigError::ValidationError(_) | ConfigError::ParseError(_) = &e
                && let Ok(path) = Config::config_path()
            {
                eprintln!("\nCheck the config file at: {}", path.display());
            }
            std::process::exit(1);
        }
    };

    if let Err(e) = run(cli, config).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
