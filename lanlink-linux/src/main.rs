// LanLink: discover LLM servers on the LAN, stream chats and pulls, recover partial responses.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use lanlink_core::{
    ChatMessage, PowerStateProvider, Provider, RecoveryStore, Role, StreamEvent, StreamKind,
};
use lanlink_linux::config::{self, Config};
use lanlink_linux::{
    watch_power, DiscoveryEngine, DiscoverySettings, FileRecoveryStore, HttpValidator,
    MdnsBrowser, StreamRequest, StreamingEngine, SysfsPowerProvider,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lanlink", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Browse the LAN and print validated endpoints as JSON snapshots.
    Discover {
        /// Treat the scan as user-initiated (clears the set, ignores background suppression).
        #[arg(long)]
        user_initiated: bool,
        /// Stop after this many seconds instead of waiting for Ctrl-C.
        #[arg(long, value_name = "SECS")]
        duration: Option<u64>,
    },
    /// Stream a chat completion to stdout.
    Chat {
        /// Server base URL, e.g. http://192.168.1.20:11434. Defaults to the provider's hosted API.
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long, default_value = "ollama")]
        provider: Provider,
        #[arg(long)]
        model: String,
        #[arg(long, env = "LANLINK_TOKEN", hide_env_values = true)]
        token: Option<String>,
        #[arg(long)]
        system: Option<String>,
        message: String,
    },
    /// Pull a model on an Ollama server, printing progress.
    Pull {
        #[arg(long)]
        endpoint: String,
        name: String,
    },
    /// Print partial responses left behind by interrupted streams.
    Recover {
        /// Delete the entries after printing them.
        #[arg(long)]
        clear: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load();
    init_logging(&cfg.log_filter);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        match cli.command {
            Command::Discover {
                user_initiated,
                duration,
            } => discover(&cfg, user_initiated, duration.map(Duration::from_secs)).await,
            Command::Chat {
                endpoint,
                provider,
                model,
                token,
                system,
                message,
            } => {
                let api_base = api_base(&cfg, provider, endpoint.as_deref())?;
                let mut messages = Vec::new();
                if let Some(system) = system {
                    messages.push(ChatMessage::new(Role::System, system));
                }
                messages.push(ChatMessage::user(message));
                let kind = StreamKind::Chat {
                    provider,
                    model,
                    messages,
                };
                stream(&cfg, kind, api_base, token).await
            }
            Command::Pull { endpoint, name } => {
                let api_base = api_base(&cfg, Provider::Ollama, Some(&endpoint))?;
                stream(&cfg, StreamKind::Pull { name }, api_base, None).await
            }
            Command::Recover { clear } => recover(&cfg, clear),
        }
    })
}

/// RUST_LOG wins over the configured filter. Logs go to stderr; stdout carries output.
fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn api_base(cfg: &Config, provider: Provider, endpoint: Option<&str>) -> anyhow::Result<String> {
    let Some(endpoint) = endpoint else {
        return match provider {
            Provider::Ollama => bail!("--endpoint is required for ollama"),
            Provider::OpenAi => Ok(cfg.openai_base_url.clone()),
            Provider::OpenRouter => Ok(cfg.openrouter_base_url.clone()),
        };
    };
    let url = url::Url::parse(endpoint).with_context(|| format!("invalid endpoint {endpoint}"))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        bail!("endpoint must be an http(s) URL with a host: {endpoint}");
    }
    Ok(provider.api_base_for(url.as_str()))
}

async fn discover(cfg: &Config, user_initiated: bool, duration: Option<Duration>) -> anyhow::Result<()> {
    let power: Arc<dyn PowerStateProvider> = Arc::new(SysfsPowerProvider::new());
    let engine = DiscoveryEngine::spawn(
        Arc::new(MdnsBrowser::new(&cfg.service_type)?),
        Arc::new(HttpValidator::new()?),
        power.clone(),
        DiscoverySettings {
            min_poll_interval: cfg.min_poll_interval(),
        },
    );

    let stop = CancellationToken::new();
    let watcher_engine = engine.clone();
    tokio::spawn(watch_power(
        power,
        cfg.power_check_interval(),
        stop.clone(),
        move |_| {
            let _ = watcher_engine.notify_power_changed();
        },
    ));

    let mut snapshots = engine.subscribe().await?;
    engine.start_discovery(user_initiated)?;
    tracing::info!(service = %cfg.service_type, "browsing");

    let deadline = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    let signal = shutdown_signal();
    tokio::pin!(deadline, signal);
    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            snapshot = snapshots.next() => match snapshot {
                Some(snapshot) => {
                    serde_json::to_writer(&mut stdout, &snapshot)?;
                    writeln!(stdout)?;
                    stdout.flush()?;
                }
                None => break,
            },
            _ = &mut deadline => break,
            r = &mut signal => {
                r?;
                break;
            }
        }
    }

    stop.cancel();
    engine.stop_discovery()?;
    let status = engine.status().await?;
    tracing::info!(?status, endpoints = engine.snapshot().await?.len(), "discovery finished");
    Ok(())
}

async fn stream(
    cfg: &Config,
    kind: StreamKind,
    api_base: String,
    token: Option<String>,
) -> anyhow::Result<()> {
    let store = Arc::new(FileRecoveryStore::open(&cfg.recovery_dir)?);
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()?;
    let engine = StreamingEngine::new(client, store);
    let mut handle = engine.open_stream(StreamRequest {
        id: None,
        kind,
        api_base,
        token,
    });
    let id = handle.id();

    let mut stdout = std::io::stdout();
    let signal = shutdown_signal();
    tokio::pin!(signal);
    loop {
        let event = tokio::select! {
            event = handle.next() => event,
            r = &mut signal => {
                r?;
                handle.cancel();
                eprintln!("\ninterrupted; partial response kept as {id} (see `lanlink recover`)");
                return Ok(());
            }
        };
        match event {
            Some(StreamEvent::Delta(text)) => {
                write!(stdout, "{text}")?;
                stdout.flush()?;
            }
            Some(StreamEvent::Progress(p)) => match (p.completed, p.total) {
                (Some(done), Some(total)) if total > 0 => {
                    eprintln!("{} {:>3}%", p.status, done * 100 / total)
                }
                _ => eprintln!("{}", p.status),
            },
            Some(StreamEvent::Done) => {
                writeln!(stdout)?;
                return Ok(());
            }
            Some(StreamEvent::Error(e)) => {
                writeln!(stdout)?;
                bail!("stream {id} failed: {e}");
            }
            None => return Ok(()),
        }
    }
}

fn recover(cfg: &Config, clear: bool) -> anyhow::Result<()> {
    let store = FileRecoveryStore::open(&cfg.recovery_dir)
        .with_context(|| format!("opening {}", cfg.recovery_dir.display()))?;
    let pending = lanlink_core::recover_partial_responses(&store)?;
    if pending.is_empty() {
        eprintln!("no partial responses in {}", store.dir().display());
    }
    for (id, text) in &pending {
        println!("{id}\t{}", serde_json::to_string(text)?);
        if clear {
            store.remove(id)?;
        }
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
