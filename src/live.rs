use chrono::{DateTime, Local};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::audio::capture::MicrophoneCapture;
use crate::audio::render::SpeakerOutput;
use crate::config::Config;
use crate::error::{Result, TokiError};
use crate::net::client::WebSocketConnector;
use crate::net::protocol::session_url;
use crate::session::{Devices, Phase, Session, SessionHandle, SessionObserver, SessionStatus};
use crate::speech::CommandSynthesizer;

/// Prints transcripts and errors to the terminal.
struct ConsoleObserver;

impl SessionObserver for ConsoleObserver {
    fn on_transcript(&mut self, text: &str, is_user: bool) {
        let who = if is_user { "you" } else { "tutor" };
        println!("{}", transcript_line(Local::now(), who, text));
    }

    fn on_error(&mut self, message: &str) {
        eprintln!("{}", transcript_line(Local::now(), "error", message));
    }
}

fn transcript_line(at: DateTime<Local>, who: &str, text: &str) -> String {
    format!("[{}] {who}: {text}", at.format("%H:%M:%S"))
}

fn describe(status: &SessionStatus) -> String {
    let mut flags = Vec::new();
    if status.is_listening() {
        flags.push("listening");
    }
    if status.is_speaking() {
        flags.push("speaking");
    }
    if status.is_processing() {
        flags.push("processing");
    }
    if flags.is_empty() {
        format!("{:?}", status.phase)
    } else {
        format!("{:?} ({})", status.phase, flags.join(", "))
    }
}

/// What a line typed at the prompt asks for.
#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Nothing,
    Toggle,
    Status,
    Quit,
    Say(&'a str),
}

fn parse_input(line: &str) -> Input<'_> {
    match line.trim() {
        "" => Input::Nothing,
        "/toggle" => Input::Toggle,
        "/status" => Input::Status,
        "/quit" | "/exit" => Input::Quit,
        text => Input::Say(text),
    }
}

/// Apply one line of input. Returns `false` when the user asked to quit.
fn handle_input(handle: &SessionHandle, line: &str) -> Result<bool> {
    match parse_input(line) {
        Input::Nothing => {}
        Input::Toggle => handle.toggle()?,
        Input::Status => println!("{}", describe(&handle.status())),
        Input::Quit => return Ok(false),
        Input::Say(text) => match handle.send_text(text) {
            Err(TokiError::NotConnected) => {
                eprintln!("not connected; type /toggle to connect");
            }
            other => other?,
        },
    }
    Ok(true)
}

/// Run an interactive tutoring session (`toki live`) until `/quit` or Ctrl+C.
pub async fn run_live(config: Config) -> Result<()> {
    // Surface a bad endpoint before touching any device.
    let url = session_url(&config.server.url, &config.learner)?;
    tracing::info!("tutoring endpoint: {url}");

    let devices = Devices {
        connector: Box::new(WebSocketConnector::new(config.server.url.clone())),
        capture: Box::new(MicrophoneCapture::new(&config.audio)),
        render: Box::new(SpeakerOutput::new(&config.audio)),
        synthesizer: Box::new(CommandSynthesizer::new(&config.fallback)),
    };
    let (session, handle) = Session::new(&config, devices, Box::new(ConsoleObserver));
    let session_task = tokio::spawn(session.run());

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received Ctrl+C, shutting down...");
        let _ = shutdown_tx.send(());
    });

    println!("Connecting... speak when the session is active. Type to send text; /toggle, /status, /quit.");
    handle.connect()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut status_rx = handle.subscribe();
    let mut last_phase = Phase::Idle;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if !handle_input(&handle, &line)? {
                        break;
                    }
                }
                Ok(None) => {
                    tracing::debug!("stdin closed, voice only from here on");
                    stdin_open = false;
                }
                Err(e) => {
                    tracing::warn!("failed to read stdin: {e}");
                    stdin_open = false;
                }
            },
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = *status_rx.borrow_and_update();
                if status.phase != last_phase {
                    last_phase = status.phase;
                    match status.phase {
                        Phase::Active => println!("Session active. Go ahead and speak."),
                        Phase::Closed => println!("Connection closed. Type /toggle to reconnect."),
                        Phase::Idle => println!("Disconnected. Type /toggle to reconnect."),
                        Phase::Connecting | Phase::Closing => {}
                    }
                }
            }
            _ = &mut shutdown_rx => {
                tracing::info!("shutting down gracefully");
                break;
            }
        }
    }

    match handle.shutdown() {
        Ok(()) | Err(TokiError::SessionClosed) => {}
        Err(e) => return Err(e),
    }
    session_task
        .await
        .map_err(|e| TokiError::Other(format!("session task failed: {e}")))?;

    tracing::info!("session ended");
    Ok(())
}
