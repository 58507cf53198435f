//! ScannerToolKit - command line front end
//!
//! Manage a local signature store and run recognitions against it from the
//! terminal.

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use scanner_toolkit::config::{self, ScannerConfig};
use scanner_toolkit::storage;
use scanner_toolkit::{
    BundleBuilder, Credential, QueryImage, ResultExtras, ResultType, ScanResult, Scanner, SearchOptions,
};

/// ScannerToolKit - on-device image recognition and barcode scanning
#[derive(Parser, Debug)]
#[command(name = "scanner-toolkit")]
#[command(about = "Recognize images and barcodes against a local signature store")]
struct Args {
    /// Signature store file (defaults to the platform cache directory)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// API key of the account owning the signatures
    #[arg(long, env = "SCANNER_API_KEY", global = true, default_value = "")]
    key: String,

    /// API secret of the account owning the signatures
    #[arg(long, env = "SCANNER_API_SECRET", global = true, default_value = "", hide_env_values = true)]
    secret: String,

    /// Configuration file (defaults to config.toml in the config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. "info" or "scanner_toolkit=debug"
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import a prebuilt signature bundle
    Import {
        /// Bundle directory
        bundle: PathBuf,
    },
    /// Print the number of stored signatures
    Count,
    /// List the stored identifiers
    Info,
    /// Synchronize the store with the service
    Sync,
    /// Match an image against the store
    Match {
        image: PathBuf,
        #[command(flatten)]
        options: MatchOptions,
    },
    /// Decode a barcode
    Decode {
        image: PathBuf,
        /// Formats to look for: ean8, ean13, qrcode, datamatrix
        #[arg(long, value_delimiter = ',', default_value = "ean8,ean13")]
        formats: Vec<String>,
    },
    /// Search an image on the server
    Search {
        image: PathBuf,
        /// Give up after this many seconds
        #[arg(long, default_value = "60")]
        timeout: u64,
    },
    /// Build a bundle from reference images, named after their file stems
    BuildBundle {
        /// Output directory
        output: PathBuf,
        images: Vec<PathBuf>,
        /// Bind the bundle to this API key
        #[arg(long)]
        api_key: Option<String>,
    },
    /// Print the proxy found in the environment
    DetectProxy,
}

#[derive(ClapArgs, Debug)]
struct MatchOptions {
    /// Disable partial matches
    #[arg(long)]
    no_partial: bool,
    /// Search smaller targets at extra cost
    #[arg(long)]
    small_target: bool,
    /// Report corners, homography and dimensions
    #[arg(long)]
    extras: bool,
}

impl MatchOptions {
    fn search_options(&self) -> SearchOptions {
        let mut options = SearchOptions::DEFAULT;
        if self.no_partial {
            options |= SearchOptions::NO_PARTIAL;
        }
        if self.small_target {
            options |= SearchOptions::SMALL_TARGET;
        }
        options
    }

    fn result_extras(&self) -> ResultExtras {
        if self.extras {
            ResultExtras::CORNERS | ResultExtras::HOMOGRAPHY | ResultExtras::DIMENSIONS
        } else {
            ResultExtras::NONE
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_new(&args.log_level).context("Invalid log filter")?)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match &args.command {
        Command::BuildBundle { output, images, api_key } => build_bundle(output, images, api_key.as_deref()),
        Command::DetectProxy => {
            detect_proxy();
            Ok(())
        }
        command => {
            let scanner = open_scanner(&args)?;
            let outcome = run(&scanner, command);
            scanner.close()?;
            outcome
        }
    }
}

/// Load configuration from file or fall back to defaults
fn load_or_default_config(path: Option<&Path>) -> Result<ScannerConfig> {
    if let Some(path) = path {
        return config::load_config(path);
    }
    if let Ok(config_dir) = storage::get_config_dir() {
        let config_path = config_dir.join("config.toml");
        if config_path.exists() {
            let config = config::load_config(&config_path)?;
            info!("Loaded configuration from {:?}", config_path);
            return Ok(config);
        }
    }
    info!("Using default configuration");
    Ok(ScannerConfig::default())
}

fn open_scanner(args: &Args) -> Result<Scanner> {
    let mut config = load_or_default_config(args.config.as_deref())?;
    config.runtime.notification_thread = true;
    let scanner = Scanner::new(config)?;

    if let Some(proxy) = Scanner::detect_proxy_settings() {
        if proxy.requires_auth {
            warn!("Proxy {}:{} requires authentication, not using it", proxy.host, proxy.port);
        } else {
            scanner.set_proxy_settings(Some(proxy.host.as_str()), proxy.port, None, None)?;
        }
    }

    let store = match &args.store {
        Some(path) => path.clone(),
        None => Scanner::cache_path_for("signatures.db")?,
    };
    scanner
        .open(&store, Credential::new(args.key.as_str(), args.secret.as_str()))
        .with_context(|| format!("Failed to open store {:?}", store))?;
    Ok(scanner)
}

fn run(scanner: &Scanner, command: &Command) -> Result<()> {
    match command {
        Command::Import { bundle } => {
            let imported = scanner.import_bundle(bundle)?;
            println!("Imported {} signatures ({} stored)", imported, scanner.count()?);
        }
        Command::Count => println!("{}", scanner.count()?),
        Command::Info => {
            for id in scanner.info()? {
                println!("{}", id);
            }
        }
        Command::Sync => {
            let operation = scanner.sync_with(|_| {}, |percent| eprint!("\rSyncing... {:>3}%", percent));
            let report = operation.wait();
            scanner.notifier().flush();
            eprintln!();
            let report = report?;
            println!(
                "Added {}, updated {}, removed {}, skipped {} ({} stored)",
                report.added,
                report.updated,
                report.removed,
                report.skipped,
                scanner.count()?
            );
        }
        Command::Match { image, options } => {
            let query = QueryImage::open(image)?;
            let result = scanner.search(&query, options.search_options(), options.result_extras())?;
            print_result(result.as_ref());
        }
        Command::Decode { image, formats } => {
            let query = QueryImage::open(image)?;
            let result = scanner.decode(&query, parse_formats(formats)?, ResultExtras::CORNERS)?;
            print_result(result.as_ref());
        }
        Command::Search { image, timeout } => {
            let query = QueryImage::open(image)?;
            let operation = scanner.api_search_in_background(&query);
            match operation.wait_timeout(Duration::from_secs(*timeout)) {
                Some(outcome) => print_result(outcome?.as_ref()),
                None => {
                    scanner.cancel_api_search(&operation);
                    bail!("Server search timed out after {}s", timeout);
                }
            }
        }
        Command::BuildBundle { .. } | Command::DetectProxy => {}
    }
    Ok(())
}

fn parse_formats(names: &[String]) -> Result<ResultType> {
    names.iter().try_fold(ResultType::NONE, |acc, name| {
        let format = match name.trim().to_ascii_lowercase().as_str() {
            "ean8" => ResultType::EAN8,
            "ean13" => ResultType::EAN13,
            "qrcode" | "qr" => ResultType::QRCODE,
            "datamatrix" => ResultType::DATAMATRIX,
            other => bail!("Unknown barcode format {:?}", other),
        };
        Ok(acc | format)
    })
}

fn print_result(result: Option<&ScanResult>) {
    let Some(result) = result else {
        println!("No match");
        return;
    };
    match result.text() {
        Some(text) => println!("{} [{:?}] {}", result.result_type().label(), result.origin(), text),
        None => println!("{} [{:?}] {} bytes", result.result_type().label(), result.origin(), result.data().len()),
    }
    if let Some(corners) = result.corners() {
        let points: Vec<String> = corners.iter().map(|p| format!("({:.1}, {:.1})", p.x, p.y)).collect();
        println!("  corners: {}", points.join(" "));
    }
    if let Some((width, height)) = result.dimensions() {
        println!("  reference: {}x{}", width, height);
    }
    if let Some(h) = result.homography() {
        println!("  homography: {:?}", h);
    }
}

fn build_bundle(output: &Path, images: &[PathBuf], api_key: Option<&str>) -> Result<()> {
    if images.is_empty() {
        bail!("No reference images given");
    }
    let mut builder = match api_key {
        Some(key) => BundleBuilder::new().api_key(key),
        None => BundleBuilder::new(),
    };
    for path in images {
        let id = builder
            .add_image_file(path)
            .with_context(|| format!("Failed to add {:?}", path))?;
        info!("Added {} from {:?}", id, path);
    }
    builder.write(output)?;
    println!("Wrote {} signatures to {:?}", builder.len(), output);
    Ok(())
}

fn detect_proxy() {
    match Scanner::detect_proxy_settings() {
        Some(proxy) => {
            println!("{}:{}", proxy.host, proxy.port);
            if let Some(username) = proxy.username {
                println!("authenticated as {}", username);
            }
        }
        None => println!("No proxy configured"),
    }
}
