//! Line-oriented driver for the selection tables, used when `TEST_CONSOLE=1`
//! replaces the keyboard with scripted stdin.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::app::{App, Mode};
use crate::event::AppEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Select,
    SelectAll,
    SelectNone,
    Up,
    Down,
    /// Hold the queue for a while before the next instruction.
    Wait(Duration),
    /// Block until the table has this many rows; discovery also fails past it.
    Expect(usize),
    Confirm,
    Clear,
    Filter(String),
}

pub fn parse(line: &str) -> Result<Instruction, String> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
    match word {
        "select" => Ok(Instruction::Select),
        "select-all" => Ok(Instruction::SelectAll),
        "select-none" => Ok(Instruction::SelectNone),
        "up" => Ok(Instruction::Up),
        "down" => Ok(Instruction::Down),
        "---" => Ok(Instruction::Confirm),
        "clear" => Ok(Instruction::Clear),
        "wait" => parse_duration(rest.trim()).map(Instruction::Wait),
        "expect" => rest
            .trim()
            .parse()
            .map(Instruction::Expect)
            .map_err(|_| format!("invalid count '{}'", rest.trim())),
        _ => Ok(Instruction::Filter(line.to_string())),
    }
}

/// Accepts `250ms`, `3s`, `1m`, or bare milliseconds.
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    let invalid = || format!("invalid duration '{text}'");
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let value: u64 = digits.parse().map_err(|_| invalid())?;
    match unit {
        "" | "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        _ => Err(invalid()),
    }
}

/// Applies queued instructions as soon as the app is ready for them.
#[derive(Debug, Default)]
pub struct ConsoleDriver {
    queue: VecDeque<Instruction>,
    paused_until: Option<Instant>,
}

impl ConsoleDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, instruction: Instruction) {
        self.queue.push_back(instruction);
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    /// Apply everything the current state allows. Instructions wait while no
    /// table is on screen, so a script can run ahead of the session.
    pub fn drain(&mut self, app: &mut App) {
        let now = Instant::now();
        while let Some(instruction) = self.queue.front() {
            if let Some(until) = self.paused_until {
                if now < until {
                    return;
                }
                self.paused_until = None;
            }
            if !selecting(&app.mode) {
                return;
            }
            if let Instruction::Expect(count) = instruction {
                if app.table.rows.len() < *count {
                    return;
                }
            }
            let Some(instruction) = self.queue.pop_front() else {
                return;
            };
            tracing::debug!(?instruction, "console_instruction");
            apply(app, instruction, now, &mut self.paused_until);
        }
    }

    /// Register an expectation the moment it is read, before rows arrive.
    pub fn announce(&self, app: &mut App, instruction: &Instruction) {
        if let Instruction::Expect(count) = instruction {
            if app.mode == Mode::Discovery {
                app.expect(*count);
            }
        }
    }
}

fn selecting(mode: &Mode) -> bool {
    matches!(
        mode,
        Mode::Discovery | Mode::LocalDisks | Mode::DistributedDisks | Mode::Uplinks
    )
}

fn apply(app: &mut App, instruction: Instruction, now: Instant, paused: &mut Option<Instant>) {
    match instruction {
        Instruction::Select => app.table.toggle(),
        Instruction::SelectAll => app.table.select_all(),
        Instruction::SelectNone => app.table.select_none(),
        Instruction::Up => app.table.up(),
        Instruction::Down => app.table.down(),
        Instruction::Wait(duration) => *paused = Some(now + duration),
        Instruction::Expect(_) => {}
        Instruction::Confirm => app.confirm(),
        Instruction::Clear => app.table.set_filter(""),
        Instruction::Filter(text) => app.table.set_filter(&text),
    }
}

/// Read instructions from stdin until EOF.
pub fn spawn_stdin_task(tx: mpsc::UnboundedSender<AppEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "console_read_failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let event = match parse(&line) {
                Ok(instruction) => AppEvent::Console(instruction),
                Err(e) => {
                    tracing::warn!(line = %line, error = %e, "console_parse_failed");
                    continue;
                }
            };
            if tx.send(event).is_err() {
                break;
            }
        }
    })
}
