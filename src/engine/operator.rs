//! Line-based operator console.

use super::{ApprovalOutcome, TradingEngine};
use crate::exchange::{ApprovalId, OrderId};
use crate::risk::{ApprovalDecision, VerdictOutcome};
use crate::strategy::Admission;
use std::sync::Arc;
use std::io::BufRead;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Supported console commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    Help,
    Status,
    Approve { id: ApprovalId, note: Option<String> },
    Deny { id: ApprovalId, note: Option<String> },
    Pause,
    Resume,
    ClearHalt,
    Cancel(OrderId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandParseError {
    Empty,
    UnknownCommand(String),
    MissingArgument(&'static str),
}

impl std::fmt::Display for CommandParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "empty command"),
            Self::UnknownCommand(cmd) => write!(f, "unknown command `{cmd}` (try `help`)"),
            Self::MissingArgument(name) => write!(f, "missing argument `{name}`"),
        }
    }
}

impl std::error::Error for CommandParseError {}

/// Parse one console line.
pub fn parse_command(line: &str) -> Result<OperatorCommand, CommandParseError> {
    let mut parts = line.split_whitespace();
    let Some(command) = parts.next() else {
        return Err(CommandParseError::Empty);
    };

    match command.to_ascii_lowercase().as_str() {
        "help" | "?" => Ok(OperatorCommand::Help),
        "status" => Ok(OperatorCommand::Status),
        "pause" => Ok(OperatorCommand::Pause),
        "resume" => Ok(OperatorCommand::Resume),
        "clear-halt" | "clear_halt" => Ok(OperatorCommand::ClearHalt),
        "approve" | "deny" => {
            let id = parts
                .next()
                .map(ApprovalId::new)
                .ok_or(CommandParseError::MissingArgument("approval id"))?;
            let note = parts.collect::<Vec<_>>().join(" ");
            let note = (!note.is_empty()).then_some(note);
            if command.eq_ignore_ascii_case("approve") {
                Ok(OperatorCommand::Approve { id, note })
            } else {
                Ok(OperatorCommand::Deny { id, note })
            }
        }
        "cancel" => parts
            .next()
            .map(|id| OperatorCommand::Cancel(OrderId::new(id)))
            .ok_or(CommandParseError::MissingArgument("order id")),
        other => Err(CommandParseError::UnknownCommand(other.to_string())),
    }
}

#[must_use]
pub const fn command_help() -> &'static str {
    "Commands\n\
    status                 - portfolio, approvals and open orders\n\
    approve <id> [note]    - approve a pending trade\n\
    deny <id> [note]       - deny a pending trade\n\
    pause                  - stop admitting new trades\n\
    resume                 - admit trades again\n\
    clear-halt             - lift a halt after verifying the ledger\n\
    cancel <order id>      - cancel an open order\n\
    help                   - this text"
}

/// Run a command against the engine and describe the result.
pub async fn execute(engine: &TradingEngine, command: OperatorCommand) -> String {
    match command {
        OperatorCommand::Help => command_help().to_string(),
        OperatorCommand::Status => engine.status().await.to_string(),
        OperatorCommand::Approve { id, note } => {
            decide(engine, &id, ApprovalDecision::Approve, note).await
        }
        OperatorCommand::Deny { id, note } => {
            decide(engine, &id, ApprovalDecision::Deny, note).await
        }
        OperatorCommand::Pause => match engine.pause() {
            Ok(true) => "Trading paused".to_string(),
            Ok(false) => "Trading already paused".to_string(),
            Err(e) => format!("Pause failed: {e}"),
        },
        OperatorCommand::Resume => match engine.resume() {
            Ok(true) => "Trading resumed".to_string(),
            Ok(false) => "Trading was not paused".to_string(),
            Err(e) => format!("Resume failed: {e}"),
        },
        OperatorCommand::ClearHalt => match engine.clear_halt().await {
            Ok(true) => "Halt cleared".to_string(),
            Ok(false) => "Trading is not halted".to_string(),
            Err(e) => format!("Halt kept: {e}"),
        },
        OperatorCommand::Cancel(order_id) => match engine.cancel_order(&order_id).await {
            Ok(order) => format!("Order {} is {}", order.id, order.status),
            Err(e) => format!("Cancel failed: {e}"),
        },
    }
}

async fn decide(
    engine: &TradingEngine,
    id: &ApprovalId,
    decision: ApprovalDecision,
    note: Option<String>,
) -> String {
    match engine.resolve_approval(id, decision, note).await {
        Ok(ApprovalOutcome::Denied) => format!("Approval {id} denied"),
        Ok(ApprovalOutcome::Unchanged(status)) => {
            format!("Approval {id} was already settled ({status:?})")
        }
        Ok(ApprovalOutcome::Admitted(Admission::Executed(order))) => {
            format!("Approval {id} granted, order {} is {}", order.id, order.status)
        }
        Ok(ApprovalOutcome::Admitted(Admission::Rejected(verdict))) => match verdict.outcome {
            VerdictOutcome::Reject(reason) => {
                format!("Approval {id} granted but risk now rejects the trade: {reason}")
            }
            _ => format!("Approval {id} granted but the trade was not admitted"),
        },
        Ok(ApprovalOutcome::Admitted(Admission::ApprovalRequired(_))) => {
            format!("Approval {id} granted but the trade needs a fresh approval")
        }
        Err(e) => format!("Approval {id} not applied: {e}"),
    }
}

/// Read commands from stdin until shutdown or end of input.
///
/// Stdin is read on a plain thread so a pending read never holds up
/// runtime shutdown.
pub async fn run_console(engine: Arc<TradingEngine>, mut shutdown: watch::Receiver<bool>) {
    let (tx, mut lines) = mpsc::channel::<String>(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Console read failed");
                    break;
                }
            }
        }
    });
    info!("Operator console ready, type `help` for commands");

    loop {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let reply = match parse_command(&line) {
                    Ok(command) => {
                        info!(?command, "Operator command");
                        execute(&engine, command).await
                    }
                    Err(e) => e.to_string(),
                };
                println!("{reply}");
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("Operator console closed");
}
