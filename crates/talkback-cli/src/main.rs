use std::path::PathBuf;
use std::sync::Arc;

use clap::{CommandFactory, Parser};
use tracing::{info, warn};

use talkback_agent::{ConversationOptions, ConversationOrchestrator};
use talkback_core::config::Config;
use talkback_core::error::TalkbackError;
use talkback_core::metrics::InMemoryRecorder;
use talkback_media::{CaptureGate, Transcriber};

mod logging;
mod setup;

#[derive(Parser, Debug)]
#[command(
    name = "talkback",
    about = "Hands-free spoken conversation with an AI assistant",
    long_about = "Hands-free spoken conversation with an AI assistant.\n\n\
        Microphone and speaker support needs a build with `--features device`; \
        without it the session stops at setup with an audio device error.",
    version
)]
struct Cli {
    /// Deepgram API key
    #[arg(long)]
    dp_key: String,

    /// OpenAI API key
    #[arg(long)]
    ooi_key: String,

    /// Config file path (default: ~/.talkback/config.json)
    #[arg(short, long)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// System prompt sent with every reply request
    #[arg(long)]
    system_prompt: Option<String>,

    /// Phrase that ends the conversation
    #[arg(long)]
    exit_keyword: Option<String>,
}

impl Cli {
    /// Fold command-line overrides into the loaded config.
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(keyword) = &self.exit_keyword {
            config
                .conversation
                .get_or_insert_with(Default::default)
                .exit_keyword = Some(keyword.clone());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .as_deref()
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);
    let mut config = Config::load(&config_path)?;
    cli.apply_overrides(&mut config);

    logging::init(config.logging.as_ref(), cli.verbose)?;
    info!(config = %config_path.display(), "Talkback v{}", env!("CARGO_PKG_VERSION"));

    let (warnings, errors) = config.validate();
    for warning in &warnings {
        warn!("{warning}");
    }
    if !errors.is_empty() {
        return Err(TalkbackError::Config(errors.join("; ")).into());
    }

    let credentials = setup::Credentials::new(&cli.dp_key, &cli.ooi_key)?;
    let replies = Arc::new(setup::reply_generator(
        &config,
        &credentials,
        cli.system_prompt.as_deref(),
    ));
    let speech = setup::speech_synthesizer(&config, &credentials)?;

    let gate = CaptureGate::new();
    let (source, sink, _capture) = setup::open_devices(&config, gate.clone())?;

    let transcriber = setup::transcriber(&config, &credentials);
    let transcripts = transcriber.start(source).await?;

    let mut orchestrator = ConversationOrchestrator::new(
        gate,
        replies,
        speech,
        sink,
        Arc::new(InMemoryRecorder::new()),
        ConversationOptions::from_config(&config),
    );
    let end = orchestrator.run(transcripts).await;
    info!(end = ?end, "Session finished");

    Ok(())
}
