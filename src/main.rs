use std::time::Duration;

use clap::{Parser, Subcommand};
use config::Config;
use serde::Deserialize;
use tracing::{error, info, warn};
use zaptv::{
    catalog::{self, ChannelRef, ProviderConfig, StreamFormat, XtreamClient},
    create_app,
    metrics::MonitoringConfig,
    player::{attempt_sequence, settle_delay, DeliveryUrls, PlayerConfig},
    proxy::ProxyConfig,
    remux::RemuxConfig,
    transcoder::{Transcoder, TranscoderConfig, TuningMode},
    AppState,
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Latency tuning mode (overrides config)
    #[arg(long, global = true)]
    mode: Option<ModeArg>,

    /// Path to configuration file
    #[arg(long, default_value = "config.toml", global = true)]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the delivery server (default)
    Serve,
    /// Print the attempts a player would make for a stream id
    Plan {
        stream_id: String,
        #[arg(long)]
        format: Option<FormatArg>,
        /// Pretend proxy usage is disabled
        #[arg(long)]
        no_proxy: bool,
    },
    /// Check provider credentials and list live channels
    Channels {
        #[arg(long)]
        category: Option<String>,
        /// Read channels from an m3u_plus file instead of the provider API
        #[arg(long)]
        m3u: Option<String>,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
enum ModeArg {
    #[default]
    LowLatency,
    Smooth,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum FormatArg {
    M3u8,
    Ts,
}

impl From<FormatArg> for StreamFormat {
    fn from(f: FormatArg) -> Self {
        match f {
            FormatArg::M3u8 => StreamFormat::Segmented,
            FormatArg::Ts => StreamFormat::TransportStream,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct Settings {
    server: ServerConfig,
    transcoding: TranscodingConfig,
    remux: RemuxConfig,
    proxy: ProxyConfig,
    player: PlayerConfig,
    provider: ProviderConfig,
    monitoring: MonitoringConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ServerConfig {
    host: String,
    port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3005,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct TranscodingConfig {
    #[serde(default)]
    mode: ModeArg,
    #[serde(flatten)]
    ffmpeg: TranscoderConfig,
}

fn load_settings(path: &str) -> anyhow::Result<Settings> {
    let settings = Config::builder()
        .add_source(config::File::with_name(path).required(false))
        // e.g. ZAPTV__SERVER__PORT=8080
        .add_source(config::Environment::with_prefix("ZAPTV").separator("__"))
        .build()?;
    Ok(settings.try_deserialize()?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let settings = load_settings(&args.config)?;
    info!(
        "Configuration loaded from {}: server={}:{} remux_root={} use_proxy={} provider={}",
        args.config,
        settings.server.host,
        settings.server.port,
        settings.remux.root.display(),
        settings.player.use_proxy,
        catalog::normalize_server(&settings.provider.server)
    );

    let tuning_mode = match args.mode.unwrap_or(settings.transcoding.mode) {
        ModeArg::LowLatency => TuningMode::LowLatency,
        ModeArg::Smooth => TuningMode::Smooth,
    };

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(settings, tuning_mode).await,
        Command::Plan {
            stream_id,
            format,
            no_proxy,
        } => {
            plan(&settings, &stream_id, format.map(Into::into), no_proxy);
            Ok(())
        }
        Command::Channels { category, m3u } => channels(&settings, category.as_deref(), m3u.as_deref()).await,
    }
}

async fn serve(settings: Settings, tuning_mode: TuningMode) -> anyhow::Result<()> {
    info!(
        "Starting server in {:?} mode (encoder: {})",
        tuning_mode, settings.transcoding.ffmpeg.video_encoder
    );

    let transcoder = Transcoder::new(settings.transcoding.ffmpeg, tuning_mode);
    let state = AppState::new(settings.proxy, transcoder, settings.remux, settings.monitoring)?;
    let app = create_app(state.clone());

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutdown requested");
        })
        .await?;

    state.remux().shutdown(Duration::from_secs(5)).await;
    Ok(())
}

fn backend_base(settings: &Settings) -> String {
    if !settings.player.backend_base.is_empty() {
        return settings.player.backend_base.clone();
    }
    let host = match settings.server.host.as_str() {
        "0.0.0.0" | "::" => "127.0.0.1",
        other => other,
    };
    format!("http://{}:{}", host, settings.server.port)
}

fn plan(settings: &Settings, stream_id: &str, format: Option<StreamFormat>, no_proxy: bool) {
    let mut player = settings.player.clone();
    if no_proxy {
        player.use_proxy = false;
    }
    let urls = DeliveryUrls::new(settings.provider.clone(), &backend_base(settings));
    let channel = ChannelRef {
        id: stream_id.to_string(),
        display_name: stream_id.to_string(),
        preferred_format: format.unwrap_or(settings.provider.format),
    };
    if !settings.provider.is_complete() {
        warn!("Provider settings incomplete; direct URLs will not be usable");
    }

    let attempts = attempt_sequence(channel.preferred_format, player.use_proxy);
    for (index, attempt) in attempts.iter().enumerate() {
        let budget = player.probe_budget(attempt);
        println!(
            "#{index} {:<14} settle={:>4}ms probe={}ms/{}ms early_fallback={} {}",
            attempt.label(),
            settle_delay(&player, &attempts, index).as_millis(),
            budget.initial_delay_ms,
            budget.timeout_ms,
            player.early_fallback_for(attempt).is_some(),
            urls.for_attempt(&channel, attempt)
        );
    }
}

async fn channels(settings: &Settings, category: Option<&str>, m3u: Option<&str>) -> anyhow::Result<()> {
    let list = match m3u {
        Some(path) => {
            let text = tokio::fs::read_to_string(path).await?;
            catalog::parse_m3u(&text)
        }
        None => {
            if !settings.provider.is_complete() {
                anyhow::bail!("provider server, username and password must be configured");
            }
            let client = XtreamClient::new(settings.proxy.build_client()?, settings.provider.clone());
            client.authenticate().await?;
            if category.is_none() {
                for cat in client.live_categories().await? {
                    println!("[{}] {}", cat.id, cat.name);
                }
            }
            client.live_streams(category).await?
        }
    };

    for ch in &list {
        println!("{:>8}  {:<5} {}", ch.id, ch.preferred_format.extension(), ch.display_name);
    }
    info!("Listed {} channels", list.len());
    Ok(())
}
