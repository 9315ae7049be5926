/// Wake-word remote trigger service binary
///
/// Listens for the configured wake-word and asks a remote assistant server
/// to open its microphone each time it is heard.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use wakeword_remote::{
    capture_config, init_logging, list_input_devices, CpalSource, DetectorAdapter, HttpRemoteNotifier,
    LogNotifier, RemoteNotifier, Session, SessionConfig,
};

#[derive(Parser)]
#[command(name = "wakeword-remote")]
#[command(about = "Wake-word listener that triggers a remote microphone", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Keyword files, comma separated
    #[arg(long, value_delimiter = ',')]
    keyword_paths: Vec<PathBuf>,

    /// Spotter model parameter file
    #[arg(long)]
    model_path: Option<PathBuf>,

    /// Detection sensitivity (0.0 - 1.0)
    #[arg(long)]
    sensitivity: Option<f32>,

    /// Input device index (see --show-audio-devices)
    #[arg(long)]
    input_device: Option<usize>,

    /// Capture buffer size in samples (at least the spotter's frame length)
    #[arg(long)]
    frame_length: Option<usize>,

    /// Cooldown after a trigger (seconds)
    #[arg(long)]
    cooldown: Option<f64>,

    /// Record the session to this WAV file
    #[arg(long)]
    output_path: Option<PathBuf>,

    /// Maximum recorded duration (seconds)
    #[arg(long)]
    max_recording_secs: Option<u64>,

    /// Remote server address
    #[arg(long)]
    host: Option<String>,

    /// Remote user ID
    #[arg(long)]
    user_id: Option<String>,

    /// Language hint for the remote action
    #[arg(long)]
    language: Option<String>,

    /// Target device hint
    #[arg(long)]
    device_id: Option<String>,

    /// Target channel hint
    #[arg(long)]
    channel_id: Option<String>,

    /// Remote request timeout (seconds)
    #[arg(long)]
    remote_timeout: Option<f64>,

    /// List input devices and exit
    #[arg(long)]
    show_audio_devices: bool,
}

#[tokio::main]
async fn main() {
    init_logging();

    let cli = Cli::parse();

    if cli.show_audio_devices {
        if let Err(e) = show_audio_devices() {
            error!("Failed to list audio devices: {:#}", e);
            std::process::exit(1);
        }
        return;
    }

    info!("Starting wake-word remote trigger service");

    let config = match load_config(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config).await {
        error!("{:#}", e);
        std::process::exit(1);
    }

    info!("Wake-word remote trigger service stopped");
}

async fn run(config: SessionConfig) -> Result<()> {
    let detector = build_detector(&config).context("Failed to create keyword spotter")?;
    let capture = capture_config(&config, &detector)?;
    let source = CpalSource::open(capture).context("Failed to open audio input")?;
    let notifier = build_notifier(&config)?;

    let mut session = Session::new(config, detector, Box::new(source), notifier);

    if let Err(e) = session.start() {
        session.shutdown().await;
        return Err(e).context("Failed to start session");
    }

    let report = session
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
        })
        .await;

    if let Some(dispatch) = report.dispatch {
        info!(
            "Remote actions: {} succeeded, {} failed",
            dispatch.succeeded, dispatch.failed
        );
    }

    Ok(())
}

fn show_audio_devices() -> Result<()> {
    for device in list_input_devices()? {
        println!("{}", device);
    }
    Ok(())
}

/// Load configuration: file, then environment, then command line
fn load_config(cli: &Cli) -> Result<SessionConfig> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::from_file(path)
            .with_context(|| format!("Cannot load {}", path.display()))?,
        None => SessionConfig::default(),
    };

    config.apply_env()?;

    if !cli.keyword_paths.is_empty() {
        config.keyword_paths = cli.keyword_paths.clone();
    }
    if let Some(path) = &cli.model_path {
        config.model_path = Some(path.clone());
    }
    if let Some(sensitivity) = cli.sensitivity {
        config.sensitivity = sensitivity;
    }
    if let Some(index) = cli.input_device {
        config.input_device = Some(index);
    }
    if let Some(frame_length) = cli.frame_length {
        config.frame_length = frame_length;
    }
    if let Some(cooldown) = cli.cooldown {
        config.cooldown_secs = cooldown;
    }
    if let Some(path) = &cli.output_path {
        config.recording.output_path = Some(path.clone());
        config.recording.enabled = true;
    }
    if let Some(secs) = cli.max_recording_secs {
        config.recording.max_duration_secs = secs;
    }
    if let Some(host) = &cli.host {
        config.remote.host = Some(host.clone());
    }
    if let Some(user_id) = &cli.user_id {
        config.remote.user_id = Some(user_id.clone());
    }
    if let Some(language) = &cli.language {
        config.remote.language = language.clone();
    }
    if let Some(device_id) = &cli.device_id {
        config.remote.device_id = Some(device_id.clone());
    }
    if let Some(channel_id) = &cli.channel_id {
        config.remote.channel_id = Some(channel_id.clone());
    }
    if let Some(secs) = cli.remote_timeout {
        config.remote.timeout_secs = secs;
    }

    config.validate()?;
    Ok(config)
}

#[cfg(feature = "porcupine")]
fn build_detector(config: &SessionConfig) -> Result<DetectorAdapter> {
    use wakeword_remote::PorcupineSpotter;

    let access_key = config
        .access_key
        .as_deref()
        .context("PORCUPINE_ACCESS_KEY is required")?;

    let spotter = PorcupineSpotter::new(
        access_key,
        config.model_path.as_deref(),
        &config.keyword_paths,
        config.sensitivity,
    )?;

    Ok(DetectorAdapter::new(Box::new(spotter), config.keyword_paths.len()))
}

#[cfg(not(feature = "porcupine"))]
fn build_detector(config: &SessionConfig) -> Result<DetectorAdapter> {
    use wakeword_remote::frame::DEFAULT_FRAME_LENGTH;
    use wakeword_remote::EnergySpotter;

    warn!("Built without the porcupine feature, falling back to the energy-threshold spotter");

    let spotter = EnergySpotter::new(config.sensitivity, config.sample_rate, DEFAULT_FRAME_LENGTH);

    Ok(DetectorAdapter::new(Box::new(spotter), 1))
}

fn build_notifier(config: &SessionConfig) -> Result<Arc<dyn RemoteNotifier>> {
    if config.remote.is_configured() {
        Ok(Arc::new(HttpRemoteNotifier::new(&config.remote)?))
    } else {
        warn!("Remote server not configured (host, user ID and token), wake events are only logged");
        Ok(Arc::new(LogNotifier))
    }
}
