//! Certfleet - ACME certificates for a fleet of TLS servers

use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use certfleet_autocert::acme::{CertBundle, ChallengeServer, RenewalClient};
use certfleet_autocert::admin::{self, ocsp};
use certfleet_autocert::fleet::{self, Role};
use certfleet_cache::Cache;
use certfleet_config::{lint_config, BackingConfig, Config};

/// Certfleet - obtain, share and renew ACME certificates across a fleet
#[derive(Parser, Debug)]
#[command(name = "certfleet")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "CERTFLEET_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// ACME provider: letsencrypt, letsencrypt-staging or a directory URL
    #[arg(long, env = "CERTFLEET_PROVIDER", global = true)]
    provider: Option<String>,

    /// Contact email for the ACME account
    #[arg(long, env = "CERTFLEET_EMAIL", global = true)]
    email: Option<String>,

    /// Renew certificates this long before they expire (e.g. "720h")
    #[arg(long, env = "CERTFLEET_RENEW_BEFORE", value_parser = humantime::parse_duration, global = true)]
    renew_before: Option<Duration>,

    /// Directory for local-only cache entries
    #[arg(long, env = "CERTFLEET_LOCAL_DIR", global = true)]
    local_dir: Option<PathBuf>,

    /// Shared directory backing the certificate cache
    #[arg(long, env = "CERTFLEET_BACKING_DIR", global = true)]
    backing_dir: Option<PathBuf>,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve HTTP-01 challenges and keep certificates renewed
    Serve {
        /// Challenge listener address
        #[arg(long)]
        http_addr: Option<String>,

        /// Hosts to manage, replacing the configured list
        hosts: Vec<String>,
    },
    /// Print or save a cache entry
    Get {
        #[arg(long)]
        name: String,

        /// Write to this file instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Store a file under a cache name
    Put {
        #[arg(long)]
        name: String,

        #[arg(long)]
        file: PathBuf,
    },
    /// Check a certificate's validity window and names
    Validate {
        /// Host to check; without --pem the cached certificate is used
        #[arg(long, required_unless_present = "pem")]
        host: Option<String>,

        /// PEM bundle (private key and chain) to check
        #[arg(long)]
        pem: Option<PathBuf>,
    },
    /// Revoke a cached certificate
    Revoke {
        #[arg(long)]
        name: String,

        /// Sign with the ACME account key instead of the certificate key
        #[arg(long)]
        account_key: bool,

        /// Revocation reason, e.g. keyCompromise or 1
        #[arg(long)]
        reason: Option<String>,
    },
    /// Query the OCSP status of a cached certificate
    Status {
        #[arg(long)]
        name: String,

        /// Issuer certificate (PEM); defaults to the bundle's chain
        #[arg(long)]
        issuer: Option<PathBuf>,

        /// Responder URL; defaults to the certificate's
        #[arg(long)]
        url: Option<String>,
    },
    /// Validate the configuration file and exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format)?;

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Serve { http_addr, hosts } => serve(config, http_addr, hosts).await,
        Commands::Get { name, out } => get(&config, &name, out).await,
        Commands::Put { name, file } => put(&config, &name, file).await,
        Commands::Validate { host, pem } => validate(&config, host, pem).await,
        Commands::Revoke {
            name,
            account_key,
            reason,
        } => revoke(&config, &name, account_key, reason.as_deref()).await,
        Commands::Status { name, issuer, url } => status(&config, &name, issuer, url).await,
        Commands::Check => check(&config, cli.config.as_deref()),
    }
}

fn init_logging(verbose: bool, format: LogFormat) -> Result<()> {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    // Logs go to stderr so `get` can write entries to stdout.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

/// Configuration file (or defaults) with command-line overrides applied.
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path).context("Failed to load configuration file")?,
        None => Config::default(),
    };

    if let Some(provider) = &cli.provider {
        config.acme.provider = provider.clone();
    }
    if let Some(email) = &cli.email {
        config.acme.email = Some(email.clone());
    }
    if let Some(renew_before) = cli.renew_before {
        config.acme.renew_before = renew_before;
    }
    if let Some(dir) = &cli.local_dir {
        config.cache.local_dir = dir.clone();
    }
    if let Some(dir) = &cli.backing_dir {
        config.cache.backing = BackingConfig::Dir { path: dir.clone() };
    }

    config
        .validate()
        .context("Configuration validation failed")?;
    Ok(config)
}

fn check(config: &Config, path: Option<&std::path::Path>) -> Result<()> {
    let warnings = lint_config(config);
    for warning in &warnings {
        warn!("{}", warning);
    }

    info!("Configuration test successful:");
    info!("  - {} host(s)", config.hosts.len());
    info!("  - provider {}", config.acme.provider);
    info!("  - {} backing store", config.cache.backing.kind());

    println!(
        "certfleet: configuration {} test is successful ({} warning(s))",
        path.map(|p| p.display().to_string())
            .unwrap_or_else(|| "(defaults)".to_string()),
        warnings.len()
    );
    Ok(())
}

async fn serve(mut config: Config, http_addr: Option<String>, hosts: Vec<String>) -> Result<()> {
    if !hosts.is_empty() {
        config.hosts = hosts;
    }
    for warning in lint_config(&config) {
        warn!("{}", warning);
    }

    let hostname = fleet::local_hostname()?;
    let role = Role::for_host(&config, &hostname);
    info!(hostname = %hostname, role = ?role, "Starting certfleet");

    let (_cache, manager) = fleet::build_manager(&config, role)?;

    let address = http_addr.unwrap_or_else(|| config.challenge.address.clone());
    let address: SocketAddr = address
        .parse()
        .with_context(|| format!("Invalid challenge address '{address}'"))?;
    let server = ChallengeServer::bind(address, manager.http_handler())
        .await
        .with_context(|| format!("Failed to bind challenge server on {address}"))?;

    let shutdown = CancellationToken::new();
    let server_task = tokio::spawn(server.run(shutdown.clone()));

    let renewal = RenewalClient::new(manager.clone(), config.hosts.clone())
        .with_refresh_interval(config.renewal.refresh_interval)
        .with_stop_timeout(config.renewal.stop_timeout)
        .start(&shutdown)?;

    wait_for_signal().await?;
    info!("Shutting down");
    shutdown.cancel();

    if let Err(e) = renewal.stop().await {
        warn!(error = %e, "Renewal did not stop cleanly");
    }
    server_task
        .await
        .context("Challenge server task failed")?
        .context("Challenge server failed")?;

    info!("Certfleet stopped");
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
        let mut sigint = signal(SignalKind::interrupt()).context("Failed to listen for SIGINT")?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
    }

    Ok(())
}

async fn get(config: &Config, name: &str, out: Option<PathBuf>) -> Result<()> {
    let cache = fleet::open_cache(&config.cache, true)?;
    let data = cache
        .get(name)
        .await
        .with_context(|| format!("Failed to read cache entry '{name}'"))?;

    match out {
        Some(path) => {
            std::fs::write(&path, &data)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!(name = %name, path = %path.display(), bytes = data.len(), "Wrote cache entry");
        }
        None => std::io::stdout()
            .write_all(&data)
            .context("Failed to write to stdout")?,
    }
    Ok(())
}

async fn put(config: &Config, name: &str, file: PathBuf) -> Result<()> {
    let data =
        std::fs::read(&file).with_context(|| format!("Failed to read {}", file.display()))?;
    let cache = fleet::open_cache(&config.cache, false)?;
    cache
        .put(name, &data)
        .await
        .with_context(|| format!("Failed to store cache entry '{name}'"))?;
    info!(name = %name, bytes = data.len(), "Stored cache entry");
    Ok(())
}

async fn validate(config: &Config, host: Option<String>, pem: Option<PathBuf>) -> Result<()> {
    let report = match pem {
        Some(path) => {
            let data = std::fs::read(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            admin::validate_pem(&data, host.as_deref())?
        }
        None => {
            let host = host.ok_or_else(|| anyhow!("--host or --pem is required"))?;
            let cache = fleet::open_cache(&config.cache, true)?;
            admin::validate_host(&*cache, &host)
                .await
                .with_context(|| format!("Failed to check certificate for {host}"))?
        }
    };

    println!("{report}");
    if !report.is_valid() {
        bail!("certificate is not valid: {}", report.problems().join("; "));
    }
    Ok(())
}

async fn load_bundle(config: &Config, name: &str) -> Result<(Arc<certfleet_cache::CachingStore>, CertBundle)> {
    let cache = fleet::open_cache(&config.cache, true)?;
    let data = cache
        .get(name)
        .await
        .with_context(|| format!("Failed to read cache entry '{name}'"))?;
    let bundle = CertBundle::decode(&data)
        .with_context(|| format!("Cache entry '{name}' is not a certificate bundle"))?;
    Ok((cache, bundle))
}

async fn revoke(config: &Config, name: &str, account_key: bool, reason: Option<&str>) -> Result<()> {
    let reason = reason
        .map(|r| admin::parse_reason(r).ok_or_else(|| anyhow!("Unknown revocation reason '{r}'")))
        .transpose()?;
    let (cache, bundle) = load_bundle(config, name).await?;
    let leaf = bundle.leaf()?;
    info!(name = %name, serial = %leaf.serial, account_key, "Revoking certificate");

    if account_key {
        let manager = certfleet_autocert::Manager::builder_from_config(&config.acme)
            .cache(cache)
            .hosts(config.hosts.iter().cloned())
            .allow_issuance(false)
            .build()?;
        admin::revoke_with_account_key(&manager, &bundle, reason).await?;
    } else {
        let directory = certfleet_autocert::acme::resolve_directory_url(&config.acme.provider)?;
        let http = admin::http_client(&config.acme.user_agent, config.acme.root_ca.as_deref())?;
        admin::Revoker::new(http, directory)
            .revoke_with_certificate_key(&bundle, reason)
            .await?;
    }

    println!("certfleet: revoked {name} (serial {})", leaf.serial);
    Ok(())
}

async fn status(
    config: &Config,
    name: &str,
    issuer: Option<PathBuf>,
    url: Option<String>,
) -> Result<()> {
    let (_, bundle) = load_bundle(config, name).await?;

    let issuer_der = match issuer {
        Some(path) => {
            let pem = std::fs::read(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let der = rustls_pemfile::certs(&mut pem.as_slice())
                .next()
                .ok_or_else(|| anyhow!("No certificate in {}", path.display()))?
                .with_context(|| format!("Invalid PEM in {}", path.display()))?
                .to_vec();
            der
        }
        None => bundle
            .issuer_der()
            .ok_or_else(|| anyhow!("Bundle has no issuer certificate; pass --issuer"))?
            .to_vec(),
    };

    let http = admin::http_client(&config.acme.user_agent, config.acme.root_ca.as_deref())?;
    let status = ocsp::query_status(&http, bundle.leaf_der(), &issuer_der, url.as_deref())
        .await
        .context("OCSP query failed")?;

    println!("status:      {}", status.status);
    println!("this update: {}", status.this_update);
    if let Some(next) = status.next_update {
        println!("next update: {next}");
    }
    Ok(())
}
