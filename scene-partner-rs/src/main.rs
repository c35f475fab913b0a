//! scene-partner-rs: rehearse a dialogue script opposite synthesized voices.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

use scene_partner::api::{self, ApiState};
use scene_partner::capture;
use scene_partner::config::{CaptureBackendKind, Config};
use scene_partner::orchestrator::{RehearsalEvent, RehearsalSettings, TurnOrchestrator};
use scene_partner::playback;
use scene_partner::{CueListener, HttpSynthesizer, RehearsalError, ScriptLine, ScriptModel};

#[derive(Parser, Debug)]
#[command(
    name = "scene-partner-rs",
    about = "Rehearse a script opposite synthesized voices"
)]
struct Args {
    /// Path to config.yaml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the characters that speak in a script
    Characters {
        /// Parsed script (JSON)
        script: PathBuf,
    },
    /// Rehearse a script, playing every character but your own
    Rehearse {
        /// Parsed script (JSON)
        script: PathBuf,

        /// The character you are playing
        #[arg(long)]
        character: String,

        /// Cue capture backend (overrides config)
        #[arg(long, value_enum)]
        backend: Option<CaptureBackendKind>,

        /// Speech synthesis endpoint (overrides config)
        #[arg(long)]
        endpoint: Option<String>,

        /// Also serve the HTTP control API
        #[arg(long)]
        serve: bool,

        /// Control API port (overrides config)
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging (keep recognizer and socket internals quiet)
    let filter = if args.verbose {
        EnvFilter::new("debug,whisper_rs=info,tungstenite=info,tokio_tungstenite=info,hyper=info")
    } else {
        EnvFilter::new("info,whisper_rs=warn,tungstenite=warn,tokio_tungstenite=warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match args.command {
        Command::Characters { script } => {
            let script = ScriptModel::load(&script)?;
            for character in script.characters() {
                println!("{character}");
            }
        }
        Command::Rehearse {
            script,
            character,
            backend,
            endpoint,
            serve,
            port,
        } => {
            let mut config = Config::load(args.config.as_deref());
            if let Some(backend) = backend {
                config.capture.backend = backend;
            }
            if let Some(endpoint) = endpoint {
                config.synthesis.endpoint = endpoint;
            }
            if serve {
                config.api.enabled = true;
            }
            if let Some(port) = port {
                config.api.port = port;
            }
            rehearse(config, &script, character).await?;
        }
    }

    Ok(())
}

async fn rehearse(
    config: Config,
    script_path: &Path,
    character: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let script = Arc::new(ScriptModel::load(script_path)?);
    if !script.has_character(&character) {
        eprintln!("Characters in this script: {}", script.characters().join(", "));
        return Err(RehearsalError::UnknownCharacter(character).into());
    }

    let synth = Arc::new(HttpSynthesizer::new(&config.synthesis)?);
    let backend = capture::build_backend(&config).await;
    let listener = CueListener::new(backend, config.rehearsal.cue_timeout());
    let (orchestrator, mut events) = TurnOrchestrator::new(
        synth,
        playback::default_player(),
        listener,
        RehearsalSettings::from(&config.rehearsal),
    );

    if config.api.enabled {
        let state = ApiState {
            orchestrator: orchestrator.clone(),
            script: Arc::clone(&script),
            character: character.clone(),
        };
        api::start_api(state, config.api.port).await;
    }

    println!("Playing {character}. Commands: p = play, n or Enter = next, r = restart, q = quit");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = stdin.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "p" => {
                        if let Err(e) = orchestrator.spawn(Arc::clone(&script), &character) {
                            println!("{e}");
                        }
                    }
                    "" | "n" => {
                        orchestrator.manual_next();
                    }
                    "r" => orchestrator.restart(),
                    "q" => break,
                    other => println!("Unknown command '{other}'"),
                }
            }
            Some(event) = events.recv() => print_event(&script, &event),
        }
    }

    orchestrator.restart();
    info!("Bye");
    Ok(())
}

fn print_event(script: &ScriptModel, event: &RehearsalEvent) {
    match event {
        RehearsalEvent::Countdown { step } => println!("{step}"),
        RehearsalEvent::LineStarted { index, is_user, .. } => {
            let Ok(line) = script.line_at(*index) else {
                return;
            };
            if let Some(action) = &line.action {
                println!("      [{action}]");
            }
            println!("{}", line_heading(line, *is_user));
            if *is_user {
                println!("      cue: \"{}\"", line.cue_phrase);
            }
        }
        RehearsalEvent::PlaybackSkipped { index } => println!("      (no audio for line {index})"),
        RehearsalEvent::CueResolved { outcome, .. } => println!("      → {outcome}"),
        RehearsalEvent::Finished => println!("End of scene. r to restart."),
        RehearsalEvent::Restarted => println!("Back to the top."),
        RehearsalEvent::StateChanged { .. } => {}
    }
}

fn line_heading(line: &ScriptLine, is_user: bool) -> String {
    let speaker = if is_user {
        format!("YOU ({})", line.character)
    } else {
        line.character.clone()
    };
    match &line.emotion {
        Some(emotion) => format!("[{:>3}] {speaker} ({emotion}): {}", line.index, line.dialog),
        None => format!("[{:>3}] {speaker}: {}", line.index, line.dialog),
    }
}
