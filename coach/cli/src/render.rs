//! Event rendering
//!
//! Prints [`CoachEvent`]s to stdout as a plain transcript. Diagnostics go to
//! the log, not the transcript.

use std::io::{self, Write};

use coach_core::session::format_elapsed;
use coach_core::{CoachEvent, MessageRole, MessageStatus, NotifyLevel, Persona, QuickReply};
use tracing::debug;

/// Writes the transcript for one chat
pub struct Renderer {
    coach_name: &'static str,
    /// A reply is being printed token by token
    mid_reply: bool,
}

impl Renderer {
    pub fn new(persona: Persona) -> Self {
        Self {
            coach_name: persona.display_name(),
            mid_reply: false,
        }
    }

    pub fn render(&mut self, event: &CoachEvent) {
        match event {
            CoachEvent::SessionStarted { session } => {
                self.coach_name = session.persona.display_name();
                println!(
                    "── {} session with {} ({}) ──",
                    session.session_type, self.coach_name, session.id
                );
            }
            CoachEvent::SessionResumed {
                session,
                message_count,
            } => {
                self.coach_name = session.persona.display_name();
                println!("── Resumed {} ({message_count} messages) ──", session.id);
            }
            CoachEvent::SessionEnded { session } => {
                self.end_line();
                println!(
                    "── Session ended after {} ──",
                    format_elapsed(session.duration_seconds.unwrap_or(0))
                );
                if let Some(summary) = &session.summary {
                    println!("{summary}");
                }
            }
            CoachEvent::MessageAppended { message } => {
                if message.role == MessageRole::Assistant && message.is_streaming {
                    self.end_line();
                    print!("{}: ", self.coach_name);
                    flush();
                    self.mid_reply = true;
                }
            }
            CoachEvent::MessageStatusChanged { status, .. } => {
                if *status == MessageStatus::Failed {
                    self.end_line();
                    println!("  (not delivered; /retry to send again)");
                }
            }
            CoachEvent::Token { text, .. } => {
                print!("{text}");
                flush();
            }
            CoachEvent::DiagnosticsUpdated { diagnostics, .. } => {
                debug!(
                    style = %diagnostics.style_used,
                    emotion = %diagnostics.emotion_detected,
                    goal = %diagnostics.goal_link,
                    "Reply diagnostics"
                );
            }
            CoachEvent::StreamFinished { .. } => self.end_line(),
            CoachEvent::StreamTruncated { .. } => {
                self.end_line();
                println!("  (reply cut off)");
            }
            CoachEvent::StreamCancelled { kept, .. } => {
                self.end_line();
                if *kept {
                    println!("  (stopped)");
                }
            }
            CoachEvent::StreamFailed { error, .. } => {
                self.end_line();
                println!("  ! {error}");
            }
            CoachEvent::CrisisDetected { resources, .. } => {
                self.end_line();
                println!();
                println!("If you are in crisis, please reach out now:");
                for resource in resources {
                    let contact = match (&resource.phone, &resource.text_number) {
                        (Some(phone), _) => format!("call {phone}"),
                        (None, Some(number)) => format!("text {number}"),
                        (None, None) => String::new(),
                    };
                    println!("  • {} {contact} ({})", resource.name, resource.available);
                }
                println!("(/dismiss to hide)");
                println!();
            }
            CoachEvent::HandoffOptions => {
                self.end_line();
                println!("A human coach can take over. Reply here or book a session in the app.");
            }
            CoachEvent::QuickReplies { replies } => print_quick_replies(replies),
            CoachEvent::Notify { level, message } => {
                self.end_line();
                let marker = match level {
                    NotifyLevel::Info => "i",
                    NotifyLevel::Warning => "!",
                    NotifyLevel::Error => "x",
                };
                println!("  [{marker}] {message}");
            }
        }
    }

    fn end_line(&mut self) {
        if std::mem::take(&mut self.mid_reply) {
            println!();
        }
    }
}

fn print_quick_replies(replies: &[QuickReply]) {
    if replies.is_empty() {
        return;
    }
    let options: Vec<String> = replies
        .iter()
        .enumerate()
        .map(|(i, r)| format!("[{}] {}", i + 1, r.text))
        .collect();
    println!("  {}", options.join("   "));
}

fn flush() {
    let _ = io::stdout().flush();
}
