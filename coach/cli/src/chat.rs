//! Interactive chat loop
//!
//! Reads lines from stdin on a separate task and drives the controller from
//! this one. Replies are polled on a short frame interval, the same way a
//! GUI surface would poll between frames.

use std::time::Duration;

use anyhow::Result;
use coach_core::session::format_elapsed;
use coach_core::{
    CoachEvent, HandoffRequest, InputMode, MessageStatus, Persona, Session, SessionController,
    SessionId, SessionType,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::render::Renderer;

/// Poll interval while a reply streams
const FRAME: Duration = Duration::from_millis(16);

const HELP: &str = "\
Commands:
  /1 /2 /3     send a suggested reply
  /retry       resend the last undelivered message
  /stop        stop the current reply
  /human       ask for a human coach
  /dismiss     hide crisis resources
  /time        show the session timer
  /end         end the session and quit
  /help        this text";

/// A typed line, parsed
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Message(String),
    QuickReply(usize),
    Retry,
    Stop,
    Human,
    Dismiss,
    Time,
    End,
    Help,
    Unknown(String),
}

fn parse_input(line: &str) -> Option<Input> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Some(Input::Message(line.to_string()));
    };
    Some(match command {
        "retry" => Input::Retry,
        "stop" => Input::Stop,
        "human" => Input::Human,
        "dismiss" => Input::Dismiss,
        "time" => Input::Time,
        "end" | "quit" | "exit" => Input::End,
        "help" | "?" => Input::Help,
        other => match other.parse::<usize>() {
            Ok(n) if n > 0 => Input::QuickReply(n),
            _ => Input::Unknown(other.to_string()),
        },
    })
}

/// How the chat should begin
pub enum Opening {
    /// Start a new session
    New,
    /// Resume a stored session
    Resume(SessionId),
}

/// Defaults for a new session
pub struct StartParams {
    pub participant_id: String,
    pub persona: Persona,
    pub session_type: SessionType,
}

/// Run one chat until the participant ends it or stdin closes
pub async fn run(
    mut controller: SessionController,
    mut events: mpsc::UnboundedReceiver<CoachEvent>,
    mut renderer: Renderer,
    opening: Opening,
    start: StartParams,
) -> Result<()> {
    match opening {
        Opening::New => {
            controller
                .start_session(
                    &start.participant_id,
                    start.persona,
                    start.session_type,
                    InputMode::Text,
                )
                .await?;
        }
        Opening::Resume(id) => {
            controller.resume_stored(&id).await?;
        }
    }
    println!("Type a message, or /help.");

    let mut lines = spawn_stdin_reader();
    let mut frame = tokio::time::interval(FRAME);

    loop {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line else {
                    debug!("stdin closed");
                    break;
                };
                let Some(input) = parse_input(&line) else { continue };
                if handle_input(&mut controller, input).await? {
                    break;
                }
            }
            result = tokio::signal::ctrl_c() => {
                result?;
                if controller.cancel_streaming().await {
                    info!("Reply stopped by Ctrl-C");
                } else {
                    break;
                }
            }
            _ = frame.tick() => {
                controller.poll_streaming();
            }
        }
        drain(&mut events, &mut renderer);
    }

    if controller.session().is_some_and(Session::is_active) {
        controller.end_session().await?;
    }
    controller.flush().await;
    drain(&mut events, &mut renderer);
    Ok(())
}

/// Returns true when the chat should end
async fn handle_input(controller: &mut SessionController, input: Input) -> Result<bool> {
    match input {
        Input::Message(text) => {
            if let Err(e) = controller.send_message(&text) {
                println!("  ({e})");
            }
        }
        Input::QuickReply(n) => {
            let id = controller.quick_replies().get(n - 1).map(|r| r.id.clone());
            match id {
                Some(id) => {
                    if let Err(e) = controller.choose_quick_reply(&id) {
                        println!("  ({e})");
                    }
                }
                None => println!("  (no suggestion {n})"),
            }
        }
        Input::Retry => {
            let failed = controller
                .messages()
                .iter()
                .rev()
                .find(|m| m.status == MessageStatus::Failed)
                .map(|m| m.id.clone());
            match failed {
                Some(id) => {
                    if let Err(e) = controller.retry_message(&id) {
                        println!("  ({e})");
                    }
                }
                None => println!("  (nothing to retry)"),
            }
        }
        Input::Stop => {
            if !controller.cancel_streaming().await {
                println!("  (no reply in progress)");
            }
        }
        Input::Human => match controller.request_handoff() {
            Ok(HandoffRequest::Deferred) => println!("  (after this reply)"),
            Ok(HandoffRequest::Evaluated(_)) => {}
            Err(e) => println!("  ({e})"),
        },
        Input::Dismiss => controller.dismiss_crisis(),
        Input::Time => println!("  {}", format_elapsed(controller.elapsed_seconds())),
        Input::End => return Ok(true),
        Input::Help => println!("{HELP}"),
        Input::Unknown(command) => {
            warn!(command = %command, "Unknown command");
            println!("  (unknown command /{command}; /help lists them)");
        }
    }
    Ok(false)
}

fn drain(events: &mut mpsc::UnboundedReceiver<CoachEvent>, renderer: &mut Renderer) {
    while let Ok(event) = events.try_recv() {
        renderer.render(&event);
    }
}

fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    break;
                }
            }
        }
    });
    rx
}
