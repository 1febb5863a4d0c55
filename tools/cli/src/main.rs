//! SkyFerry CLI - Command line interface for cloud migrations.
//!
//! Signs in to the source and destination accounts, runs Drive and Photos
//! migrations into OneDrive, and inspects the transfer ledger.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use skyferry_common::{Origin, RemotePath};
use skyferry_storage::auth::{OAuthClient, OAuthConfig, SqliteTokenStore};
use skyferry_storage::{
    CredentialManager, DriveClient, GraphClient, HierarchyLookup, PhotosClient, ProviderKind,
    SourceProvider, TokenStore,
};
use skyferry_transfer::{RunReport, TransferConfig, TransferLedger, TransferOrchestrator};

#[derive(Parser)]
#[command(name = "skyferry")]
#[command(about = "SkyFerry - Migrate Google Drive and Google Photos to OneDrive")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

/// Account and storage settings, from flags or the environment.
#[derive(Args, Debug, Clone)]
struct Settings {
    /// Google OAuth client ID.
    #[arg(long, env = "GOOGLE_CLIENT_ID", default_value = "", global = true, hide_default_value = true)]
    google_client_id: String,

    /// Google OAuth client secret.
    #[arg(long, env = "GOOGLE_CLIENT_SECRET", default_value = "", global = true, hide_env_values = true, hide_default_value = true)]
    google_client_secret: String,

    /// Google redirect URL; defaults to {base-url}/auth/google/callback.
    #[arg(long, env = "GOOGLE_REDIRECT_URL", global = true)]
    google_redirect_url: Option<String>,

    /// Microsoft application (client) ID.
    #[arg(long, env = "MICROSOFT_CLIENT_ID", default_value = "", global = true, hide_default_value = true)]
    microsoft_client_id: String,

    /// Microsoft client secret.
    #[arg(long, env = "MICROSOFT_CLIENT_SECRET", default_value = "", global = true, hide_env_values = true, hide_default_value = true)]
    microsoft_client_secret: String,

    /// Microsoft redirect URL; defaults to {base-url}/auth/microsoft/callback.
    #[arg(long, env = "MICROSOFT_REDIRECT_URL", global = true)]
    microsoft_redirect_url: Option<String>,

    /// Microsoft tenant ID.
    #[arg(long, env = "MICROSOFT_TENANT_ID", default_value = "common", global = true)]
    microsoft_tenant_id: String,

    /// Base URL the consent callbacks are served from.
    #[arg(long, env = "SKYFERRY_BASE_URL", default_value = "http://localhost:3000", global = true)]
    base_url: String,

    /// Directory for the token database and the ledger.
    #[arg(long, env = "SKYFERRY_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Transfer configuration file (JSON).
    #[arg(long, env = "SKYFERRY_CONFIG", global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in to the source or destination account.
    Auth {
        #[command(subcommand)]
        action: AuthCommand,
    },

    /// Migrate a source into OneDrive.
    Migrate {
        /// Source to migrate.
        source: SourceArg,

        /// Delete source files you own once OneDrive has them.
        #[arg(long)]
        delete_after_transfer: bool,
    },

    /// Process the failed items of a source again.
    RetryFailed {
        /// Source whose failures to retry.
        source: SourceArg,
    },

    /// Inspect or edit the transfer ledger.
    Ledger {
        #[command(subcommand)]
        action: LedgerCommand,
    },

    /// Print shell completions.
    Completions {
        /// Target shell.
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum AuthCommand {
    /// Print the consent URL for a provider.
    Url {
        /// Provider to sign in to.
        provider: ProviderArg,

        /// Open the URL in the default browser.
        #[arg(long)]
        open: bool,
    },

    /// Exchange an authorization code and store the credential.
    Exchange {
        /// Provider the code came from.
        provider: ProviderArg,

        /// Authorization code from the callback.
        #[arg(long)]
        code: String,
    },

    /// Show stored credentials.
    Status,
}

#[derive(Subcommand)]
enum LedgerCommand {
    /// Show record counts.
    Stats,

    /// List failed items.
    Failed {
        /// Only show one source.
        #[arg(long)]
        source: Option<SourceArg>,
    },

    /// Forget a path so the next run checks it again.
    Forget {
        /// Path relative to the base folder, e.g. "Docs/report.pdf".
        path: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProviderArg {
    Google,
    Microsoft,
}

impl From<ProviderArg> for ProviderKind {
    fn from(arg: ProviderArg) -> Self {
        match arg {
            ProviderArg::Google => ProviderKind::Google,
            ProviderArg::Microsoft => ProviderKind::Microsoft,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SourceArg {
    Drive,
    Photos,
}

impl From<SourceArg> for Origin {
    fn from(arg: SourceArg) -> Self {
        match arg {
            SourceArg::Drive => Origin::GoogleDrive,
            SourceArg::Photos => Origin::GooglePhotos,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins unless --verbose is given
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let settings = cli.settings;
    match cli.command {
        Commands::Auth { action } => match action {
            AuthCommand::Url { provider, open } => cmd_auth_url(&settings, provider.into(), open),
            AuthCommand::Exchange { provider, code } => {
                cmd_auth_exchange(&settings, provider.into(), &code).await
            }
            AuthCommand::Status => cmd_auth_status(&settings).await,
        },

        Commands::Migrate {
            source,
            delete_after_transfer,
        } => cmd_migrate(&settings, source.into(), delete_after_transfer).await,

        Commands::RetryFailed { source } => cmd_retry_failed(&settings, source.into()).await,

        Commands::Ledger { action } => match action {
            LedgerCommand::Stats => cmd_ledger_stats(&settings).await,
            LedgerCommand::Failed { source } => {
                cmd_ledger_failed(&settings, source.map(Origin::from)).await
            }
            LedgerCommand::Forget { path } => cmd_ledger_forget(&settings, &path).await,
        },

        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "skyferry", &mut std::io::stdout());
            Ok(())
        }
    }
}

/// Resolve the data directory, creating it if needed.
fn data_dir(settings: &Settings) -> Result<PathBuf> {
    let dir = match &settings.data_dir {
        Some(dir) => dir.clone(),
        None => dirs::data_dir()
            .context("No data directory on this platform; pass --data-dir")?
            .join("skyferry"),
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create data directory {}", dir.display()))?;
    Ok(dir)
}

fn ledger_dir(settings: &Settings) -> Result<PathBuf> {
    Ok(data_dir(settings)?.join("ledger"))
}

fn open_token_store(settings: &Settings) -> Result<Arc<dyn TokenStore>> {
    let path = data_dir(settings)?.join("tokens.db");
    let store = SqliteTokenStore::open(&path)
        .with_context(|| format!("Failed to open token store {}", path.display()))?;
    Ok(Arc::new(store))
}

fn oauth_client(settings: &Settings, provider: ProviderKind) -> Result<OAuthClient> {
    let (id, secret, redirect) = match provider {
        ProviderKind::Google => (
            &settings.google_client_id,
            &settings.google_client_secret,
            &settings.google_redirect_url,
        ),
        ProviderKind::Microsoft => (
            &settings.microsoft_client_id,
            &settings.microsoft_client_secret,
            &settings.microsoft_redirect_url,
        ),
    };
    if id.is_empty() {
        anyhow::bail!("No {} client ID configured", provider);
    }

    let config = match redirect {
        Some(url) => OAuthConfig {
            client_id: id.clone(),
            client_secret: secret.clone(),
            redirect_url: url.clone(),
        },
        None => OAuthConfig::with_base_url(id.clone(), secret.clone(), &settings.base_url, provider),
    };

    let client = match provider {
        ProviderKind::Google => OAuthClient::google(&config),
        ProviderKind::Microsoft => OAuthClient::microsoft(&config, &settings.microsoft_tenant_id),
    };
    client.with_context(|| format!("Invalid {} OAuth settings", provider))
}

fn credential_manager(
    settings: &Settings,
    store: Arc<dyn TokenStore>,
    provider: ProviderKind,
) -> Result<Arc<CredentialManager>> {
    let client = Arc::new(oauth_client(settings, provider)?);
    Ok(Arc::new(CredentialManager::new(provider, store, client)))
}

async fn load_config(settings: &Settings) -> Result<TransferConfig> {
    match &settings.config {
        Some(path) => TransferConfig::load(path)
            .await
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(TransferConfig::default()),
    }
}

/// Print the consent URL.
fn cmd_auth_url(settings: &Settings, provider: ProviderKind, open: bool) -> Result<()> {
    let client = oauth_client(settings, provider)?;
    let (url, state) = client.authorization_url();

    println!("Open this URL to sign in to {}:", provider);
    println!("  {}", url);
    println!("State: {}", state);

    if open {
        open::that(&url).context("Failed to open browser")?;
    }
    Ok(())
}

/// Exchange an authorization code and store the credential.
async fn cmd_auth_exchange(settings: &Settings, provider: ProviderKind, code: &str) -> Result<()> {
    let store = open_token_store(settings)?;
    let client = Arc::new(oauth_client(settings, provider)?);

    let credential = client
        .exchange_code(code)
        .await
        .context("Failed to exchange authorization code")?;

    let manager = CredentialManager::new(provider, store, client);
    manager
        .store_consented(credential)
        .await
        .context("Failed to store credential")?;

    println!("Signed in to {}.", provider);
    Ok(())
}

/// Show stored credentials.
async fn cmd_auth_status(settings: &Settings) -> Result<()> {
    let store = open_token_store(settings)?;
    let now = Utc::now();

    for provider in ProviderKind::all() {
        let stored = store
            .load(provider.store_key())
            .await
            .with_context(|| format!("Failed to read {} credential", provider))?;

        match stored {
            None => println!("{}: not signed in", provider),
            Some(credential) => {
                let state = if credential.is_expired_at(now) {
                    "expired".to_string()
                } else {
                    format!("valid for {} min", (credential.expires_at - now).num_minutes())
                };
                println!(
                    "{}: {} (expires {}), refresh token: {}",
                    provider,
                    state,
                    credential.expires_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    if credential.refresh_token.is_some() { "yes" } else { "no" }
                );
            }
        }
    }
    Ok(())
}

/// Build the orchestrator for `origin` with both accounts wired in.
async fn build_orchestrator(
    settings: &Settings,
    origin: Origin,
    config: &TransferConfig,
) -> Result<TransferOrchestrator> {
    let store = open_token_store(settings)?;
    let google = credential_manager(settings, store.clone(), ProviderKind::Google)?;
    let microsoft = credential_manager(settings, store, ProviderKind::Microsoft)?;

    let destination = Arc::new(GraphClient::new(microsoft).context("Failed to create OneDrive client")?);
    let ledger = TransferLedger::load(ledger_dir(settings)?)
        .await
        .context("Failed to load ledger")?;

    let (source, hierarchy, owner): (Arc<dyn SourceProvider>, Option<Arc<dyn HierarchyLookup>>, _) =
        match origin {
            Origin::GoogleDrive => {
                let drive = Arc::new(DriveClient::new(google).context("Failed to create Drive client")?);
                let owner = if config.delete_after_transfer {
                    let email = drive
                        .user_email()
                        .await
                        .context("Failed to look up the Google account")?;
                    info!("Source files owned by {} will be deleted after transfer", email);
                    Some(email)
                } else {
                    None
                };
                let lookup: Arc<dyn HierarchyLookup> = drive.clone();
                (drive as Arc<dyn SourceProvider>, Some(lookup), owner)
            }
            Origin::GooglePhotos => {
                if config.delete_after_transfer {
                    warn!("The photo library does not allow deletion; items will be kept");
                }
                let photos = PhotosClient::new(google).context("Failed to create Photos client")?;
                (Arc::new(photos) as Arc<dyn SourceProvider>, None, None)
            }
        };

    TransferOrchestrator::new(source, destination, hierarchy, ledger, config, owner)
        .context("Failed to set up the migration")
}

/// Cancel the token on Ctrl-C.
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; finishing the current page before stopping");
            token.cancel();
        }
    });
    cancel
}

fn print_report(report: &RunReport) {
    println!("Run {} ({}):", report.run_id, report.origin);
    println!("  Pages:    {}", report.pages);
    println!("  Uploaded: {}", report.uploaded);
    println!("  Skipped:  {}", report.skipped);
    println!("  Failed:   {}", report.failed);
    if report.deleted > 0 {
        println!("  Deleted:  {}", report.deleted);
    }
    println!("  Duration: {:.1}s", report.duration.as_secs_f64());
    println!("  Ledger saves: {}", report.ledger_writes);
    if report.cancelled {
        println!("Stopped early; run again to continue.");
    }
    if report.failed > 0 {
        println!(
            "Some items failed; see `skyferry ledger failed` and `skyferry retry-failed {}`.",
            report.origin
        );
    }
}

/// Run a migration.
async fn cmd_migrate(settings: &Settings, origin: Origin, delete_after_transfer: bool) -> Result<()> {
    let mut config = load_config(settings).await?;
    config.delete_after_transfer |= delete_after_transfer;

    let mut orchestrator = build_orchestrator(settings, origin, &config).await?;
    let report = orchestrator
        .run(cancel_on_interrupt())
        .await
        .with_context(|| format!("{} migration stopped", origin))?;

    print_report(&report);
    Ok(())
}

/// Retry failed items.
async fn cmd_retry_failed(settings: &Settings, origin: Origin) -> Result<()> {
    let config = load_config(settings).await?;

    let mut orchestrator = build_orchestrator(settings, origin, &config).await?;
    let report = orchestrator
        .retry_failed(cancel_on_interrupt())
        .await
        .with_context(|| format!("Retrying failed {} items stopped", origin))?;

    print_report(&report);
    Ok(())
}

async fn open_ledger(settings: &Settings) -> Result<TransferLedger> {
    TransferLedger::load(ledger_dir(settings)?)
        .await
        .context("Failed to load ledger")
}

/// Show ledger counts.
async fn cmd_ledger_stats(settings: &Settings) -> Result<()> {
    let ledger = open_ledger(settings).await?;
    let stats = ledger.stats();

    println!("Ledger at {}:", ledger.dir().display());
    println!("  Succeeded: {}", stats.succeeded);
    println!("  Failed:    {}", stats.failed);
    for origin in [Origin::GoogleDrive, Origin::GooglePhotos] {
        if let Some(counts) = stats.per_origin.get(&origin) {
            println!(
                "  {}: {} succeeded, {} failed",
                origin, counts.succeeded, counts.failed
            );
        }
    }
    Ok(())
}

/// List failed ledger records.
async fn cmd_ledger_failed(settings: &Settings, origin: Option<Origin>) -> Result<()> {
    let ledger = open_ledger(settings).await?;
    let records = ledger.failed_records(origin);

    if records.is_empty() {
        println!("No failed items.");
        return Ok(());
    }

    for record in records {
        println!(
            "[{}] {} ({}): {}",
            record.origin,
            record.destination_path,
            record.source_file_id,
            record.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

/// Forget a ledger path.
async fn cmd_ledger_forget(settings: &Settings, path: &str) -> Result<()> {
    let path = RemotePath::parse(path).context("Invalid path")?;
    let mut ledger = open_ledger(settings).await?;

    if ledger.forget(&path) {
        ledger.persist().await.context("Failed to write ledger")?;
        println!("Forgot {}; the next run checks it again.", path);
    } else {
        println!("{} is not in the ledger.", path);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_migrate() {
        let cli = Cli::try_parse_from(["skyferry", "migrate", "photos", "--delete-after-transfer"])
            .unwrap();
        match cli.command {
            Commands::Migrate {
                source,
                delete_after_transfer,
            } => {
                assert!(matches!(source, SourceArg::Photos));
                assert!(delete_after_transfer);
            }
            _ => panic!("expected migrate"),
        }
    }

    #[test]
    fn test_settings_after_subcommand() {
        let cli = Cli::try_parse_from([
            "skyferry",
            "ledger",
            "stats",
            "--data-dir",
            "/tmp/skyferry-test",
        ])
        .unwrap();
        assert_eq!(cli.settings.data_dir, Some(PathBuf::from("/tmp/skyferry-test")));
    }

    #[test]
    fn test_redirect_derived_from_base_url() {
        let cli = Cli::try_parse_from([
            "skyferry",
            "--google-client-id",
            "id",
            "--base-url",
            "https://ferry.example.com/",
            "auth",
            "status",
        ])
        .unwrap();
        let client = oauth_client(&cli.settings, ProviderKind::Google).unwrap();
        let (url, _) = client.authorization_url();
        assert!(url.contains("redirect_uri=https%3A%2F%2Fferry.example.com%2Fauth%2Fgoogle%2Fcallback"));
    }

    #[test]
    fn test_missing_client_id_is_reported() {
        let cli = Cli::try_parse_from(["skyferry", "auth", "status"]).unwrap();
        let mut settings = cli.settings;
        settings.microsoft_client_id.clear();
        assert!(oauth_client(&settings, ProviderKind::Microsoft).is_err());
    }
}
