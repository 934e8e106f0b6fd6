//! chatpilot - automated chat partner CLI

mod browser;
mod config;
mod menu;
mod utils;

use chatpilot_agent::{
    ChangeDetector, FileTranscriptStore, ResponseGenerator, RunParams, TranscriptStore,
    TurnController, TurnEvent,
};
use chatpilot_ai::providers::google::GoogleProvider;
use clap::Parser;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;

use crate::menu::MenuChoice;

/// chatpilot - drives a web chat conversation with a generative model
#[derive(Parser, Debug)]
#[command(name = "chatpilot")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Model to use (default: gemini-2.0-flash)
    #[arg(short, long)]
    model: Option<String>,

    /// Config file (default: ~/.config/chatpilot/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of turns; with --conversation and --counterpart runs once without the menu
    #[arg(short = 'n', long)]
    iterations: Option<u32>,

    /// Conversation (chat) id
    #[arg(long)]
    conversation: Option<String>,

    /// Counterpart (character) id
    #[arg(long)]
    counterpart: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Setup tracing
    let level = if args.verbose {
        "chatpilot=debug"
    } else {
        "chatpilot=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    let config_path = args.config.clone().unwrap_or_else(config::Config::config_path);

    // Initialize config and exit
    if args.init_config {
        match config::Config::init(&config_path) {
            Ok(path) => {
                println!("Config file created at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let mut cfg = config::Config::load_from(&config_path);
    if let Some(model) = args.model {
        cfg.model.id = model;
    }

    let Some(api_key) = cfg.api_key() else {
        eprintln!("Error: No API key found for the model backend");
        eprintln!();
        eprintln!("Set your API key with: export GEMINI_API_KEY=your-key");
        eprintln!("Or add it to config file: chatpilot --init-config");
        std::process::exit(1);
    };

    let model = chatpilot_ai::models::resolve_model(&cfg.model.id);
    let provider = Arc::new(GoogleProvider::new(api_key));
    let generator = ResponseGenerator::new(provider, model, cfg.generator_config());

    let transcripts = Arc::new(FileTranscriptStore::new(cfg.transcripts_dir()));
    let mut controller = TurnController::new(
        ChangeDetector::new(cfg.detector_config()),
        generator,
        transcripts.clone(),
        cfg.controller_config(),
    );
    let driver = browser::BrowserDriver::from_config(&cfg);

    let (printed_tx, printed_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_events(controller.subscribe(), printed_tx));

    // Ctrl-C aborts the current run, not the process
    let cancel = controller.cancel_handle();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nAborting run...");
            cancel.lock().cancel();
        }
    });

    let mut session = Session {
        controller: &mut controller,
        driver: &driver,
        transcripts: transcripts.as_ref(),
        reset_logs: cfg.run.reset_logs,
        reset_done: HashSet::new(),
        printed: printed_rx,
    };

    let result = match (args.iterations, args.conversation, args.counterpart) {
        (Some(iterations), Some(conversation), Some(counterpart)) => {
            let params = menu::parse_params(&iterations.to_string(), &counterpart, &conversation)
                .map_err(anyhow::Error::msg)?;
            let ok = session.run(&params).await;
            if !ok {
                printer.abort();
                std::process::exit(1);
            }
            Ok(())
        }
        (None, None, None) => run_menu(&mut session).await,
        _ => Err(anyhow::anyhow!(
            "--iterations, --conversation and --counterpart must be given together"
        )),
    };

    printer.abort();
    result
}

/// One interactive session: the controller plus what has been reset so far
struct Session<'a> {
    controller: &'a mut TurnController,
    driver: &'a browser::BrowserDriver,
    transcripts: &'a FileTranscriptStore,
    reset_logs: bool,
    reset_done: HashSet<String>,
    /// Signalled once the printer has shown a run's last event
    printed: mpsc::UnboundedReceiver<()>,
}

impl Session<'_> {
    /// Run once and report; returns whether the run succeeded
    async fn run(&mut self, params: &RunParams) -> bool {
        if self.reset_logs && self.reset_done.insert(params.conversation_id.clone()) {
            if let Err(e) = self.transcripts.reset(&params.conversation_id) {
                tracing::warn!("Failed to reset logs for {}: {}", params.conversation_id, e);
            }
        }

        let report = self.controller.execute(self.driver, params).await;

        // Every run ends with exactly one terminal event
        self.printed.recv().await;

        if report.formatted_transcript.is_some() {
            println!(
                "\nChat logs saved to {}",
                self.transcripts
                    .formatted_path(&report.conversation_id)
                    .display()
            );
        }

        match report.outcome {
            Ok(summary) => {
                println!(
                    "Run {} finished: {} turns with {}",
                    &summary.run_id[..8],
                    summary.turns_completed,
                    summary.partner
                );
                true
            }
            Err(e) => {
                eprintln!("Run failed: {}", e);
                false
            }
        }
    }
}

async fn run_menu(session: &mut Session<'_>) -> anyhow::Result<()> {
    use std::io::{self, BufRead};

    let mut params: Option<RunParams> = None;

    loop {
        {
            let mut stdout = io::stdout();
            menu::print_menu(&mut stdout)?;
        }

        let mut input = String::new();
        if io::stdin().lock().read_line(&mut input)? == 0 {
            // EOF
            break;
        }
        println!();

        match MenuChoice::parse(&input) {
            MenuChoice::Start => match &params {
                Some(p) => {
                    session.run(p).await;
                }
                None => println!("Set the parameters first"),
            },
            MenuChoice::SetParameters => {
                let stdin = io::stdin();
                let mut stdin = stdin.lock();
                let mut stdout = io::stdout();
                match menu::prompt_parameters(&mut stdin, &mut stdout)? {
                    Some(p) => params = Some(p),
                    None => break,
                }
            }
            MenuChoice::Exit => break,
            MenuChoice::Invalid => println!("Invalid choice"),
        }
    }

    Ok(())
}

async fn print_events(
    mut receiver: broadcast::Receiver<TurnEvent>,
    printed: mpsc::UnboundedSender<()>,
) {
    loop {
        match receiver.recv().await {
            Ok(event) => match event {
                TurnEvent::ProfileLoaded { profile } => {
                    println!(
                        "Profile: {} - {}",
                        profile,
                        utils::truncate_chars(&profile.bio, 120)
                    );
                }
                TurnEvent::ActionDelivered { action, .. } => {
                    println!("{}", utils::describe_action(&action));
                }
                TurnEvent::MessageReceived { message, .. } => {
                    println!("{}", utils::describe_message(&message));
                }
                TurnEvent::RetryScheduled {
                    attempt,
                    delay_ms,
                    error,
                } => {
                    println!(
                        "[Model call {} failed, retrying in {}s: {}]",
                        attempt,
                        delay_ms / 1000,
                        utils::truncate_chars(&error, 200)
                    );
                }
                TurnEvent::RunEnd { .. } | TurnEvent::Error { .. } => {
                    let _ = printed.send(());
                }
                _ => {}
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "event printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
