//! Voicedesk console entry point.
//!
//! Reads commands from stdin and prints session status and transcript
//! events as they arrive. Logs go to stderr through `tracing`.

mod commands;
mod settings;
mod state;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use anyhow::Context;
use parking_lot::Mutex;
use settings::{default_settings_path, load_settings};
use state::AppState;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use voicedesk_core::{
    ChatBackend, ChatSession, GeminiChat, LiveConnector, SegmentKind, Speaker, VoiceAgent,
};

use commands::{Command, HELP};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("voicedesk=info,voicedesk_core=info")),
        )
        .init();

    info!("Voicedesk starting");

    let settings_path = default_settings_path();
    let app_settings = load_settings(&settings_path);
    info!(
        path = %settings_path.display(),
        has_api_key = app_settings.effective_api_key().is_some(),
        live_model = %app_settings.live_model,
        "settings loaded"
    );
    if app_settings.effective_api_key().is_none() {
        warn!("no API key configured; voice sessions will be rejected by the server");
    }

    let agent = Arc::new(VoiceAgent::new(
        app_settings.session_config(),
        Arc::new(LiveConnector::new()),
    ));

    let chat = match app_settings.effective_api_key() {
        Some(key) => {
            let backend = GeminiChat::new(key)
                .context("building chat client")?
                .with_model(app_settings.chat_model.clone());
            let backend: Box<dyn ChatBackend> = Box::new(backend);
            Some(Arc::new(Mutex::new(ChatSession::new(backend))))
        }
        None => None,
    };

    let state = AppState {
        agent: Arc::clone(&agent),
        chat,
        settings: Arc::new(Mutex::new(app_settings)),
        settings_path,
        status_events_seen: Arc::new(AtomicUsize::new(0)),
        final_segments_seen: Arc::new(AtomicUsize::new(0)),
        tool_requests_seen: Arc::new(AtomicUsize::new(0)),
    };

    // ── Forward agent events → console ────────────────────────────────────
    let mut status_rx = agent.subscribe_status();
    let status_seen = Arc::clone(&state.status_events_seen);
    tokio::spawn(async move {
        loop {
            match status_rx.recv().await {
                Ok(event) => {
                    status_seen.fetch_add(1, Ordering::Relaxed);
                    let caption = event
                        .feedback
                        .as_ref()
                        .map(|f| f.visual.caption.as_str())
                        .unwrap_or_default();
                    match &event.detail {
                        Some(detail) => println!("[{}] {caption} ({detail})", event.status),
                        None => println!("[{}] {caption}", event.status),
                    }
                }
                Err(RecvError::Lagged(n)) => warn!("status receiver lagged by {n}"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut transcript_rx = agent.subscribe_transcripts();
    let finals_seen = Arc::clone(&state.final_segments_seen);
    tokio::spawn(async move {
        loop {
            match transcript_rx.recv().await {
                Ok(event) if event.kind == SegmentKind::Final => {
                    finals_seen.fetch_add(1, Ordering::Relaxed);
                    let who = match event.speaker {
                        Speaker::User => "you",
                        Speaker::Agent => "agent",
                    };
                    println!("{who}: {}", event.text);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("transcript receiver lagged by {n}"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        let command = match Command::parse(&line) {
            Ok(c) => c,
            Err(msg) if msg.is_empty() => continue,
            Err(msg) => {
                println!("{msg}");
                continue;
            }
        };
        if command == Command::Quit {
            break;
        }
        dispatch(&state, command).await;
    }

    if agent.is_running() {
        if let Err(e) = commands::stop_session(&state).await {
            warn!("stop on exit failed: {e}");
        }
    }
    info!("Voicedesk exiting");
    Ok(())
}

async fn dispatch(state: &AppState, command: Command) {
    match command {
        Command::Start { device } => {
            if let Err(e) = commands::start_session(state, device).await {
                println!("start failed: {e}");
            }
        }
        Command::StartWav(path) => {
            if let Err(e) = commands::start_wav_session(state, path).await {
                println!("start failed: {e}");
            }
        }
        Command::Stop => match commands::stop_session(state).await {
            Ok(outcome) => println!("session ended: {:?}", outcome.trigger),
            Err(e) => println!("stop failed: {e}"),
        },
        Command::Status => {
            let (status, diag) = commands::get_status(state);
            println!("status: {status}");
            match serde_json::to_string_pretty(&diag) {
                Ok(json) => println!("{json}"),
                Err(e) => warn!("diagnostics serialise failed: {e}"),
            }
        }
        Command::Devices => {
            let (inputs, outputs) = commands::list_audio_devices();
            for (label, devices) in [("input", inputs), ("output", outputs)] {
                println!("{label} devices:");
                for d in devices {
                    let mut flags = Vec::new();
                    if d.is_default {
                        flags.push("default");
                    }
                    if d.is_recommended {
                        flags.push("recommended");
                    }
                    if d.is_loopback_like {
                        flags.push("loopback");
                    }
                    println!("  {} {}", d.name, flags.join(","));
                }
            }
        }
        Command::Chat(text) => match commands::send_chat(state, text).await {
            Ok(Some(turn)) => {
                println!("agent: {}", turn.reply.content);
                for request in &turn.requests {
                    println!("  tool request: {request:?}");
                }
                for (tool, reason) in &turn.rejected {
                    println!("  rejected call {tool}: {reason}");
                }
            }
            Ok(None) => {}
            Err(e) => println!("{e}"),
        },
        Command::Tools => {
            for tool in commands::list_tools() {
                let params: Vec<_> = tool.parameters.properties.keys().cloned().collect();
                println!("{}({}): {}", tool.name, params.join(", "), tool.description);
            }
        }
        Command::Settings => match serde_json::to_string_pretty(&commands::get_runtime_settings(state)) {
            Ok(json) => println!("{json}"),
            Err(e) => warn!("settings serialise failed: {e}"),
        },
        Command::SetInputDevice(device) => {
            match commands::set_preferred_input_device(state, device) {
                Ok(()) => println!("preferred input device saved"),
                Err(e) => println!("could not save settings: {e}"),
            }
        }
        Command::Help => println!("{HELP}"),
        Command::Quit => {}
    }
}
