use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use emberlm::config::Config;
use emberlm::inference::{BackendKind, BackendRegistry, GenerationRequest, InferenceBackend};
use emberlm::models::{format_bytes, Catalog, ModelDescriptor, ModelManager, ModelStatus};
use emberlm::CancelFlag;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "emberlm")]
#[command(about = "Run quantized language models locally", long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.config/emberlm/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List catalog models and their status
    List,
    /// Show the status of one model
    Status { model: String },
    /// Download and verify a model
    Pull { model: String },
    /// Delete an installed model
    Rm { model: String },
    /// Remove partial downloads
    Clean,
    /// Generate a completion
    Generate {
        /// Backend kind (local, lightweight, remote)
        #[arg(long)]
        backend: Option<String>,
        /// Catalog model name
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        max_tokens: Option<u32>,
        prompt: String,
    },
    /// Show the backends compiled into this build
    Backends,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "emberlm=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let catalog = config.catalog();

    match cli.command {
        Commands::List => list(&config, &catalog),
        Commands::Status { model } => {
            let descriptor = find_model(&catalog, &model)?;
            let manager = ModelManager::new(config.models.manager_config())?;
            println!("{}: {}", descriptor.name, manager.status(descriptor));
            Ok(())
        }
        Commands::Pull { model } => pull(&config, find_model(&catalog, &model)?).await,
        Commands::Rm { model } => {
            let descriptor = find_model(&catalog, &model)?;
            let manager = ModelManager::new(config.models.manager_config())?;
            if manager.delete_model(descriptor)? {
                println!("Deleted {}", descriptor.name);
            } else {
                println!("{} is not installed", descriptor.name);
            }
            Ok(())
        }
        Commands::Clean => {
            let manager = ModelManager::new(config.models.manager_config())?;
            let freed = manager.clean_cache()?;
            println!("Freed {}", format_bytes(freed));
            Ok(())
        }
        Commands::Generate {
            backend,
            model,
            max_tokens,
            prompt,
        } => {
            let kind = match backend {
                Some(name) => name.parse::<BackendKind>()?,
                None => config.backend.kind()?,
            };
            let model = model.unwrap_or_else(|| config.backend.model.clone());
            generate(&config, &catalog, kind, &model, prompt, max_tokens).await
        }
        Commands::Backends => {
            for kind in BackendKind::ALL {
                let marker = if kind.is_available() { "available" } else { "not built" };
                println!("{:<12} {marker}", kind.as_str());
            }
            Ok(())
        }
    }
}

fn find_model<'a>(catalog: &'a Catalog, name: &str) -> anyhow::Result<&'a ModelDescriptor> {
    if let Some(descriptor) = catalog.find(name) {
        return Ok(descriptor);
    }

    match catalog.suggest(name) {
        Some(suggestion) => bail!("Unknown model '{name}'. Did you mean '{suggestion}'?"),
        None => bail!(
            "Unknown model '{name}'. Available: {}",
            catalog.names().join(", ")
        ),
    }
}

fn list(config: &Config, catalog: &Catalog) -> anyhow::Result<()> {
    let mut manager_config = config.models.manager_config();
    // Hashing every installed model would make listing slow
    manager_config.verify_checksum = false;
    let manager = ModelManager::new(manager_config)?;

    for descriptor in catalog.entries() {
        let status = manager.status(descriptor);
        let marker = if status == ModelStatus::Available { "*" } else { " " };
        println!(
            "{marker} {:<26} {:>10}  {:<10} {}",
            descriptor.name,
            format_bytes(descriptor.size_bytes),
            status.as_str(),
            descriptor.description
        );
    }
    Ok(())
}

fn progress_bar(descriptor: &ModelDescriptor) -> anyhow::Result<ProgressBar> {
    let bar = ProgressBar::new(descriptor.size_bytes);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .context("invalid progress template")?
            .progress_chars("#>-"),
    );
    bar.set_message(descriptor.name.to_string());
    Ok(bar)
}

/// Download `descriptor` if needed, drawing a progress bar on stderr
async fn ensure_model(
    config: &Config,
    descriptor: &ModelDescriptor,
) -> anyhow::Result<(ModelManager, PathBuf)> {
    let bar = progress_bar(descriptor)?;
    let callback_bar = bar.clone();
    let manager_config = config
        .models
        .manager_config()
        .with_progress_callback(move |progress| {
            callback_bar.set_length(progress.total_bytes);
            callback_bar.set_position(progress.downloaded_bytes);
        });
    let manager = ModelManager::new(manager_config)?;

    let cancel = CancelFlag::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let result = manager
        .ensure_available_with_cancel(descriptor, Some(&cancel))
        .await;
    match result {
        Ok(path) => {
            bar.finish_and_clear();
            Ok((manager, path))
        }
        Err(e) => {
            bar.abandon();
            Err(e.into())
        }
    }
}

async fn pull(config: &Config, descriptor: &ModelDescriptor) -> anyhow::Result<()> {
    let (_, path) = ensure_model(config, descriptor).await?;
    println!("{} ready at {}", descriptor.name, path.display());
    Ok(())
}

async fn generate(
    config: &Config,
    catalog: &Catalog,
    kind: BackendKind,
    model: &str,
    prompt: String,
    max_tokens: Option<u32>,
) -> anyhow::Result<()> {
    let mut settings = config.backend.settings.clone();
    let mut _pin = None;

    if kind == BackendKind::Remote {
        let remote_model = if config.remote.model.is_empty() {
            model
        } else {
            config.remote.model.as_str()
        };
        settings.model_path = Some(PathBuf::from(remote_model));
    } else {
        let descriptor = find_model(catalog, model)?;
        let (manager, path) = ensure_model(config, descriptor).await?;
        _pin = Some(manager.pin(descriptor));
        settings.model_path = Some(path);
    }

    let mut registry = BackendRegistry::new();
    let backend = registry
        .create(kind, settings, &config.remote)
        .with_context(|| format!("Failed to start the {kind} backend"))?;
    tracing::info!(
        "Generating with {} on the {kind} backend",
        backend.model_name().unwrap_or_else(|| model.to_string())
    );

    let cancel = CancelFlag::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let mut request = GenerationRequest::new(prompt).with_cancel(cancel);
    if let Some(max_tokens) = max_tokens {
        request = request.with_max_tokens(max_tokens);
    }
    let response = registry.generate(&request).await?;

    println!("{}", response.text);
    eprintln!(
        "[{} tokens, {} ms, {}, confidence {:.2}]",
        response.token_count,
        response.processing_time_ms,
        response.finish_reason,
        response.confidence
    );
    Ok(())
}
