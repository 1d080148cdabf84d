use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch, Mutex};

use voice_turn_agent::audio::{MicrophoneSource, RodioPlayback};
use voice_turn_agent::conversation::{builtin_personas, ConversationState, Persona, RecordStore};
use voice_turn_agent::effects::VoiceEffectRunner;
use voice_turn_agent::metrics::MetricsCollector;
use voice_turn_agent::pipeline::{BackendClient, Greeting, RemotePipeline};
use voice_turn_agent::server;
use voice_turn_agent::service::AgentService;
use voice_turn_agent::settings::{default_settings_path, load_settings, save_settings, AppSettings};
use voice_turn_agent::state_machine::Event;
use voice_turn_agent::{run_state_loop, StateLoopHandle, UiState, UiStatus};

#[derive(Parser)]
#[command(author, version, about = "Hands-free voice conversations with persona agents", long_about = None)]
struct Cli {
    /// Settings file (defaults to ~/.config/voice-turn-agent/settings.json)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP backend for one persona
    Serve {
        #[arg(long)]
        bind: Option<String>,
        #[arg(long)]
        persona: Option<String>,
    },
    /// Talk to a persona through the microphone and speakers
    Talk {
        #[arg(long)]
        persona: Option<String>,
        /// Send turns to a running backend instead of calling providers directly
        #[arg(long)]
        backend: Option<String>,
    },
    /// List available personas
    Personas,
    /// Write a settings file with the defaults if none exists yet
    Init,
    /// Print the conversations a persona has recorded
    Records {
        #[arg(long)]
        persona: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let settings_path = match cli.settings {
        Some(path) => path,
        None => default_settings_path()?,
    };
    let settings = load_settings(&settings_path);
    log::debug!("Settings loaded from {:?}", settings_path);

    match cli.command {
        Command::Serve { bind, persona } => {
            let persona = pick_persona(&settings, persona)?;
            let bind = bind.unwrap_or_else(|| settings.bind_address.clone());
            let addr: SocketAddr = bind
                .parse()
                .with_context(|| format!("Invalid bind address {}", bind))?;

            let service = Arc::new(AgentService::from_settings(&settings, persona));
            server::serve(addr, service).await?;
        }
        Command::Talk { persona, backend } => {
            let persona = pick_persona(&settings, persona)?;
            let backend = backend.or_else(|| settings.backend_url.clone());
            talk(&settings, persona, backend).await?;
        }
        Command::Personas => {
            let mut personas = builtin_personas();
            for extra in &settings.personas {
                personas.retain(|p| p.name != extra.name);
                personas.push(extra.clone());
            }
            for p in personas {
                println!("{:<12} {}", p.name, p.title);
            }
        }
        Command::Init => {
            if settings_path.exists() {
                println!("Settings already exist at {}", settings_path.display());
            } else {
                save_settings(&settings_path, &settings)?;
                println!("Wrote default settings to {}", settings_path.display());
            }
        }
        Command::Records { persona } => {
            let persona = pick_persona(&settings, persona)?;
            let Some(file) = persona.records_file.as_deref() else {
                bail!("Persona '{}' does not record conversations", persona.name);
            };
            let store = RecordStore::new(settings.data_dir());
            let records = store.load(file);
            if records.is_empty() {
                println!("No records in {}", store.path_for(file).display());
            }
            for record in records {
                println!("{}", record);
            }
        }
    }

    Ok(())
}

fn pick_persona(settings: &AppSettings, name: Option<String>) -> anyhow::Result<Persona> {
    let name = name.unwrap_or_else(|| settings.persona.clone());
    match settings.resolve_persona(&name) {
        Some(persona) => Ok(persona),
        None => bail!("Unknown persona '{}'. Run `voice-turn-agent personas` to list them.", name),
    }
}

async fn talk(settings: &AppSettings, persona: Persona, backend: Option<String>) -> anyhow::Result<()> {
    let pipeline: Arc<dyn RemotePipeline> = match backend {
        Some(url) => {
            log::info!("Using backend at {}", url);
            Arc::new(BackendClient::new(&url, persona.clone()))
        }
        None => Arc::new(AgentService::from_settings(settings, persona.clone())),
    };

    let playback = RodioPlayback::new().context("Audio output unavailable")?;
    let metrics = Arc::new(Mutex::new(MetricsCollector::new()));
    let runner = VoiceEffectRunner::new(
        Arc::new(MicrophoneSource::new()),
        Arc::new(playback),
        pipeline.clone(),
        settings.turn.clone(),
        metrics,
    );

    let (tx, rx) = mpsc::channel::<Event>(32);
    let (ui_tx, mut ui_rx) = watch::channel(UiState::default());
    let handle = StateLoopHandle::new(tx.clone());
    let state_loop = tokio::spawn(run_state_loop(rx, tx, runner, ui_tx));

    println!("{} ({})", persona.title, persona.name);
    println!("Speak after the prompt. Enter ends a turn early, q stops.");

    let greeting = match pipeline.greeting().await {
        Ok(greeting) => greeting,
        Err(e) => {
            log::warn!("Greeting audio unavailable: {}", e);
            persona.greeting.clone().map(|speech| Greeting { speech, audio: None })
        }
    };

    handle
        .send(Event::Start {
            initial_state: ConversationState::new(persona.initial_state.clone()),
            greeting,
        })
        .await?;

    let stdin_handle = handle.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let event = match line.trim() {
                "" => Event::FinishTurn,
                "q" | "quit" | "stop" => {
                    let _ = stdin_handle.send(Event::Stop).await;
                    Event::Exit
                }
                other => {
                    println!("Unknown command {:?}", other);
                    continue;
                }
            };
            if stdin_handle.send(event).await.is_err() {
                break;
            }
        }
    });

    let signal_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = signal_handle.send(Event::Stop).await;
            let _ = signal_handle.send(Event::Exit).await;
        }
    });

    let mut shown = UiState::default();
    while ui_rx.changed().await.is_ok() {
        let ui = ui_rx.borrow_and_update().clone();
        show(&shown, &ui);

        let done = matches!(ui.status, UiStatus::Closed { .. })
            || (ui.status == UiStatus::Idle && shown.status != UiStatus::Idle);
        shown = ui;
        if done {
            let _ = handle.send(Event::Exit).await;
            break;
        }
    }

    let final_state = state_loop.await?;
    if let Some(session) = final_state.session() {
        println!(
            "Conversation ended after {} turn(s): {}",
            session.turns,
            session.conversation.as_value()
        );
    }
    Ok(())
}

fn show(previous: &UiState, current: &UiState) {
    if current.transcript != previous.transcript {
        if let Some(text) = &current.transcript {
            println!("you>   {}", text);
        }
    }
    if current.reply != previous.reply {
        if let Some(text) = &current.reply {
            println!("agent> {}", text);
        }
    }
    if current.notice != previous.notice {
        if let Some(notice) = &current.notice {
            println!("!      {}", notice);
        }
    }
    if current.status != previous.status {
        if let UiStatus::Listening { .. } = current.status {
            println!("(listening)");
        }
    }
}
