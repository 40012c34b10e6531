// src/console.rs
//! Terminal rendering of controller events
//!
//! The main thread owns the [`Console`] and feeds it every [`UiEvent`]
//! drained from the controller's queue. Prompts are answered on stdin;
//! end of input dismisses them so a waiting worker is never stranded.

use indicatif::{ProgressBar, ProgressStyle};
use pkgmux::checkpoint::{Answer, Prompt, PromptRequest};
use pkgmux::ui::{Notification, Severity, UiEvent};
use std::io::{self, BufRead, Write};
use tracing::debug;

/// Progress bar resolution
const PROGRESS_STEPS: u64 = 1000;

/// Renders events on stdout and reads prompt answers from stdin
#[derive(Default)]
pub struct Console {
    progress: Option<ProgressBar>,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&mut self, event: UiEvent) {
        match event {
            UiEvent::ActivityChanged(activity) => debug!("local activity is now {}", activity),
            UiEvent::StartWorking { activity, .. } => {
                self.say(&format!(":: {}", activity.as_ref().replace('_', " ")))
            }
            UiEvent::PleaseWait(true) => self.say("Waiting for the daemon..."),
            UiEvent::PleaseWait(false) => {}
            UiEvent::Notify(notification) => self.notify(&notification),
            UiEvent::Prompt(request) => self.prompt(request),
            UiEvent::Terminal(text) => self.with_bar_hidden(|| {
                print!("{}", text.replace("\r\n", "\n"));
                let _ = io::stdout().flush();
            }),
            UiEvent::Progress { fraction, text } => self.progress(fraction, text),
            UiEvent::ProgressReset => self.reset_progress(),
            UiEvent::ApplicationProcessing { name, action, .. } => {
                self.say(&format!("{}: {}", action, name))
            }
            UiEvent::ApplicationProcessed {
                name,
                action,
                outcome,
                ..
            } if outcome.is_success() => self.say(&format!("{}: {} done", action, name)),
            UiEvent::ApplicationAbort { app, action } => {
                self.say(&format!("{} of {} was not requested", action, app))
            }
            UiEvent::ApplicationsManaged { success, activity } => {
                let verdict = if success { "completed" } else { "failed" };
                self.say(&format!("{} {}", activity.as_ref().replace('_', " "), verdict));
            }
            UiEvent::RepositoriesUpdated { result, message } => {
                if result == 0 {
                    self.say("Repositories updated");
                } else if message.is_empty() {
                    self.say(&format!("Repositories update failed ({})", result));
                } else {
                    self.say(&format!("Repositories update failed: {}", message));
                }
            }
            UiEvent::UnsupportedApplications { manual, apps } => {
                for app in manual.iter().chain(apps.iter()) {
                    self.say(&format!("warning: {} is no longer supported", app));
                }
            }
            other => debug!("ignoring {:?}", other),
        }
    }

    fn say(&self, line: &str) {
        match &self.progress {
            Some(pb) => pb.println(line),
            None => println!("{}", line),
        }
    }

    fn with_bar_hidden<T>(&self, f: impl FnOnce() -> T) -> T {
        match &self.progress {
            Some(pb) => pb.suspend(f),
            None => f(),
        }
    }

    fn notify(&self, notification: &Notification) {
        let prefix = match notification.severity {
            Severity::Info => "",
            Severity::Warning => "warning: ",
            Severity::Error => "error: ",
        };
        let mut line = format!("{}{}", prefix, notification.message);
        if notification.show_log {
            line.push_str(" (see the output above)");
        }
        self.say(&line);
    }

    fn progress(&mut self, fraction: f64, text: Option<String>) {
        let pb = self.progress.get_or_insert_with(|| {
            let pb = ProgressBar::new(PROGRESS_STEPS);
            let style = ProgressStyle::default_bar()
                .template("[{bar:30.cyan/blue}] {percent:>3}% {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-");
            pb.set_style(style);
            pb
        });
        pb.set_position((fraction.clamp(0.0, 1.0) * PROGRESS_STEPS as f64) as u64);
        if let Some(text) = text {
            pb.set_message(text);
        }
    }

    fn reset_progress(&mut self) {
        if let Some(pb) = self.progress.take() {
            pb.finish_and_clear();
        }
    }

    fn prompt(&self, request: PromptRequest) {
        let PromptRequest { prompt, responder } = request;
        let stdin = io::stdin();
        let answer = self.with_bar_hidden(|| {
            ask(&prompt, &mut stdin.lock(), &mut io::stdout().lock())
        });
        match answer {
            Ok(Some(answer)) => responder.resolve(answer),
            Ok(None) => responder.dismiss(),
            Err(e) => {
                debug!("cannot read prompt answer: {}", e);
                responder.dismiss();
            }
        }
    }
}

/// Show `prompt` and read one answer line
///
/// Returns `None` at end of input.
pub fn ask<R: BufRead, W: Write>(
    prompt: &Prompt,
    input: &mut R,
    output: &mut W,
) -> io::Result<Option<Answer>> {
    match prompt {
        Prompt::Confirm { message } => {
            writeln!(output, "{}", message)?;
            write!(output, "Continue? [y/N]: ")?;
        }
        Prompt::License {
            license,
            applications,
        } => {
            writeln!(output)?;
            writeln!(output, "License {} applies to:", license)?;
            for application in applications {
                writeln!(output, "  {}", application)?;
            }
            write!(output, "Accept? [y/N/a(lways)]: ")?;
        }
        Prompt::Error { message } => {
            writeln!(output, "error: {}", message)?;
            write!(output, "Press Enter to continue")?;
        }
    }
    output.flush()?;

    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        writeln!(output)?;
        return Ok(None);
    }
    Ok(Some(parse_answer(prompt, &line)))
}

fn parse_answer(prompt: &Prompt, line: &str) -> Answer {
    let line = line.trim().to_lowercase();
    match prompt {
        Prompt::Confirm { .. } => match line.as_str() {
            "y" | "yes" => Answer::Confirmed,
            _ => Answer::Declined,
        },
        Prompt::License { .. } => match line.as_str() {
            "y" | "yes" => Answer::Accepted { forever: false },
            "a" | "always" => Answer::Accepted { forever: true },
            _ => Answer::Declined,
        },
        Prompt::Error { .. } => Answer::Acknowledged,
    }
}
