use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

use duet_agent::config::Config;
use duet_agent::error::UiError;
use duet_agent::health::{HealthProbe, HealthStatus};
use duet_agent::logsink::LogSink;
use duet_agent::models::{format_size, ModelCatalog};
use duet_agent::orchestrator::{ImageServerControl, ResourceOrchestrator, TextServerControl};
use duet_agent::registry::{GenerationRegistry, GenerationStatus, GenerationUpdate};
use duet_agent::supervisor::diffusion::{DiffusionSupervisor, ImageGenerationConfig};
use duet_agent::supervisor::llama::LlamaSupervisor;
use duet_agent::supervisor::{ServerConfig, ServerEvent};
use duet_agent::system::HostProbe;

const INITIAL_RESTART_BACKOFF: Duration = Duration::from_secs(1);
const MAX_RESTART_BACKOFF: Duration = Duration::from_secs(60);
const CRASH_POLL_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Parser)]
#[command(
    name = "duetd",
    about = "duet agent — run text and image inference side-by-side on one workstation",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the text server and keep it alive
    Serve {
        /// Model id or path to serve (defaults to the first local model)
        #[arg(long)]
        model: Option<String>,

        /// Layers to offload to the GPU
        #[arg(long)]
        gpu_layers: Option<u32>,
    },
    /// Generate one image, pausing the text server if memory is tight
    Generate {
        /// Text prompt
        #[arg(long)]
        prompt: String,

        /// Things the image must not contain
        #[arg(long)]
        negative: Option<String>,

        #[arg(long)]
        width: Option<u32>,

        #[arg(long)]
        height: Option<u32>,

        #[arg(long)]
        steps: Option<u32>,

        /// Fixed seed; omit for a random one
        #[arg(long)]
        seed: Option<i64>,

        /// Where to write the PNG
        #[arg(long, default_value = "out.png")]
        out: PathBuf,
    },
    /// Show what is serving on the configured ports
    Status,
    /// Print the tail of a server's log
    Logs {
        #[arg(value_enum)]
        server: ServerKind,

        #[arg(long, default_value_t = 100)]
        lines: usize,
    },
    /// Model management commands
    Models {
        #[command(subcommand)]
        command: ModelCommands,
    },
}

#[derive(Subcommand)]
enum ModelCommands {
    /// List locally available models
    List,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ServerKind {
    Llama,
    Diffusion,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Serve { model, gpu_layers } => {
            run_serve(&config, model, gpu_layers).await?;
        }

        Commands::Generate {
            prompt,
            negative,
            width,
            height,
            steps,
            seed,
            out,
        } => {
            let mut request = ImageGenerationConfig::new(prompt);
            request.negative_prompt = negative;
            request.width = width;
            request.height = height;
            request.steps = steps;
            request.seed = seed;
            run_generate(&config, request, out).await?;
        }

        Commands::Status => {
            run_status(&config).await?;
        }

        Commands::Logs { server, lines } => {
            let file = match server {
                ServerKind::Llama => "llama-server.log",
                ServerKind::Diffusion => "sd-server.log",
            };
            let sink = LogSink::new(config.log_dir.join(file));
            for line in sink.tail(lines) {
                println!("{line}");
            }
        }

        Commands::Models { command } => match command {
            ModelCommands::List => {
                let catalog = ModelCatalog::new(&config.model_dir);
                let local = catalog.list()?;
                if local.is_empty() {
                    println!("No local models found in {}", config.model_dir.display());
                } else {
                    println!("Local models ({}):", config.model_dir.display());
                    for m in &local {
                        println!(
                            "  {} — {} ({})",
                            m.name,
                            m.path.display(),
                            format_size(m.size_bytes)
                        );
                    }
                }
            }
        },
    }

    Ok(())
}

async fn run_serve(
    config: &Config,
    model_arg: Option<String>,
    gpu_layers: Option<u32>,
) -> Result<()> {
    let catalog = Arc::new(ModelCatalog::new(&config.model_dir));
    let llama = Arc::new(LlamaSupervisor::new(config, Arc::clone(&catalog)));

    // 1. Determine which model to serve
    let model_id = match model_arg {
        Some(m) => m,
        None => {
            let local = catalog.list()?;
            if local.is_empty() {
                anyhow::bail!(
                    "No models found in {}. Specify --model or place a .gguf file there.",
                    config.model_dir.display()
                );
            }
            if local.len() > 1 {
                println!("Multiple models found, using first one: {}", local[0].name);
                println!("Use --model to specify a different one.");
            }
            local[0].name.clone()
        }
    };
    tracing::info!("serving model: {}", model_id);

    let mut server_config = ServerConfig::new(model_id, config.llama_port);
    server_config.gpu_layers = Some(gpu_layers.unwrap_or(config.gpu_layers));

    // 2. Surface lifecycle events as they happen
    let mut events = llama.subscribe();
    let event_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ServerEvent::Started) => tracing::info!("text server is ready"),
                Ok(ServerEvent::Stopped) => tracing::info!("text server stopped"),
                Ok(ServerEvent::Crashed {
                    message,
                    exit_code,
                    signal,
                    ..
                }) => {
                    tracing::error!(
                        "text server crashed: {} (code {:?}, signal {:?})",
                        message,
                        exit_code,
                        signal
                    );
                }
                Ok(ServerEvent::Restarted(info)) => {
                    tracing::info!("text server restarted (pid {:?})", info.pid);
                }
                Ok(ServerEvent::BinaryLog { .. }) | Ok(ServerEvent::Progress { .. }) => {}
                Ok(ServerEvent::StatusChanged { new, old }) => {
                    tracing::debug!("text server: {} -> {}", old, new);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // 3. Start it
    llama.start(server_config).await?;
    println!(
        "Text server is running on port {}. Press Ctrl+C to stop.",
        config.llama_port
    );

    // 4. Crash policy lives here, not in the supervisor: restart with
    //    exponential backoff.
    let monitor_llama = Arc::clone(&llama);
    let monitor_task = tokio::spawn(async move {
        let mut backoff = INITIAL_RESTART_BACKOFF;
        let mut interval = tokio::time::interval(CRASH_POLL_INTERVAL);
        loop {
            interval.tick().await;
            if !monitor_llama.has_crashed() {
                continue;
            }
            tracing::warn!("text server is down, restarting in {:?}", backoff);
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_RESTART_BACKOFF);
            match monitor_llama.restart().await {
                Ok(_) => {
                    backoff = INITIAL_RESTART_BACKOFF;
                }
                Err(e) => {
                    tracing::error!("restart failed: {}", e);
                }
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for Ctrl+C");

    tracing::info!("shutting down...");
    println!("\nShutting down...");
    monitor_task.abort();
    llama.stop().await?;
    event_task.abort();

    Ok(())
}

async fn run_generate(config: &Config, request: ImageGenerationConfig, out: PathBuf) -> Result<()> {
    let catalog = Arc::new(ModelCatalog::new(&config.model_dir));
    let llama = Arc::new(LlamaSupervisor::new(config, Arc::clone(&catalog)));
    let diffusion = Arc::new(DiffusionSupervisor::new(config, Arc::clone(&catalog)));
    let system = Arc::new(HostProbe::from_config(config));
    let orchestrator = ResourceOrchestrator::new(
        Arc::clone(&llama) as Arc<dyn TextServerControl>,
        Arc::clone(&diffusion) as Arc<dyn ImageServerControl>,
        system,
        catalog,
    );
    let registry = GenerationRegistry::new();

    if orchestrator.would_need_offload() {
        println!("Memory is tight: the text server will be paused during generation.");
    }

    let id = registry.create(request.clone());
    registry.update(
        &id,
        GenerationUpdate {
            status: Some(GenerationStatus::Running),
            ..Default::default()
        },
    );

    let outcome = orchestrator.orchestrate(request).await;
    let result = match outcome {
        Ok(result) => {
            registry.update(
                &id,
                GenerationUpdate {
                    status: Some(GenerationStatus::Complete),
                    result: Some(result.clone()),
                    ..Default::default()
                },
            );
            result
        }
        Err(e) => {
            registry.update(
                &id,
                GenerationUpdate {
                    status: Some(GenerationStatus::Error),
                    error: Some(e.to_string()),
                    ..Default::default()
                },
            );
            let ui = UiError::from(&e);
            eprintln!("{}: {}", ui.title, ui.message);
            if let Some(remediation) = &ui.remediation {
                eprintln!("  hint: {}", remediation);
            }
            let _ = diffusion.stop().await;
            registry.destroy();
            return Err(e.into());
        }
    };

    std::fs::write(&out, &result.image)?;
    println!(
        "Saved {} ({}x{}, seed {}, {} ms)",
        out.display(),
        result.width,
        result.height,
        result.seed,
        result.time_taken_ms
    );

    diffusion.stop().await?;
    registry.destroy();
    Ok(())
}

async fn run_status(config: &Config) -> Result<()> {
    let probe = HealthProbe::new();
    println!("Agent status:");
    for (name, port) in [
        ("text server (llama-server)", config.llama_port),
        ("image server (sd-server)", config.sd_port),
    ] {
        let health = probe.probe(port, Duration::from_secs(2)).await;
        let verdict = match health {
            HealthStatus::Ok => "serving",
            HealthStatus::Loading => "loading model",
            HealthStatus::Error => "unhealthy",
            HealthStatus::Unknown => "not running",
        };
        println!("  {name} on port {port}: {verdict}");
    }

    let catalog = ModelCatalog::new(&config.model_dir);
    let local = catalog.list()?;
    println!("Local models: {}", local.len());
    Ok(())
}
