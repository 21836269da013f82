//! Authorization guard for parsed mention commands
//!
//! A pure decision over already-loaded state. The sole authorization
//! predicate is a case-insensitive match between the mention author's handle
//! and the bot's configured commander handle - there is no multi-party
//! approval. Duplicate-delivery protection is closed atomically at the store
//! (mention claim); the guard only sees mentions that were claimed.

use crate::command::{Command, TradeAmount};
use crate::model::{Bot, BotStatus, TradeDirection};

/// An admitted command, ready for the execution engine
#[derive(Debug, Clone, PartialEq)]
pub enum ExecCommand {
    Trade {
        direction: TradeDirection,
        token: String,
        amount: TradeAmount,
    },
    Withdraw {
        destination: String,
        amount_sol: f64,
    },
}

/// Outcome of the authorization check
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Execute this command
    Admit(ExecCommand),
    /// Side-effect-free status reply, bypasses execution entirely
    FastPath,
    /// Do not execute; reason is audit-logged and surfaced in the reply
    Reject { reason: String },
}

/// Normalize a social handle for comparison: strip a leading '@', fold case
fn normalize_handle(handle: &str) -> String {
    handle.trim().trim_start_matches('@').to_lowercase()
}

/// Decide whether a parsed command may execute
pub fn authorize(bot: &Bot, author_handle: &str, command: &Command) -> Decision {
    match command {
        Command::Unrecognized { reason } => {
            return Decision::Reject {
                reason: format!("unrecognized command: {}", reason),
            }
        }
        Command::StatusQuery => return Decision::FastPath,
        _ => {}
    }

    if normalize_handle(author_handle) != normalize_handle(&bot.commander_handle) {
        return Decision::Reject {
            reason: "not authorized".into(),
        };
    }

    if bot.status != BotStatus::Active {
        return Decision::Reject {
            reason: format!("bot is {}", bot.status.as_str()),
        };
    }

    match command {
        Command::Trade {
            direction,
            token,
            amount,
        } => Decision::Admit(ExecCommand::Trade {
            direction: *direction,
            token: token.clone(),
            amount: *amount,
        }),
        Command::Withdraw {
            destination,
            amount_sol,
        } => Decision::Admit(ExecCommand::Withdraw {
            destination: destination.clone(),
            amount_sol: *amount_sol,
        }),
        // Handled above
        Command::StatusQuery | Command::Unrecognized { .. } => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn test_bot(status: BotStatus) -> Bot {
        Bot {
            id: "bot-1".into(),
            name: "testbot".into(),
            personality: String::new(),
            commander_handle: "Commander".into(),
            post_interval_secs: 3600,
            poll_interval_secs: 60,
            status,
            created_at: Utc::now(),
        }
    }

    fn buy_command() -> Command {
        Command::Trade {
            direction: TradeDirection::Buy,
            token: "So11111111111111111111111111111111111111112".into(),
            amount: TradeAmount::Sol(1.0),
        }
    }

    #[test]
    fn test_commander_admitted() {
        let bot = test_bot(BotStatus::Active);
        let decision = authorize(&bot, "commander", &buy_command());
        assert!(matches!(decision, Decision::Admit(ExecCommand::Trade { .. })));
    }

    #[test]
    fn test_handle_match_is_case_insensitive() {
        let bot = test_bot(BotStatus::Active);
        for handle in ["COMMANDER", "Commander", "@commander", " @CoMmAnDeR "] {
            let decision = authorize(&bot, handle, &buy_command());
            assert!(
                matches!(decision, Decision::Admit(_)),
                "rejected handle {:?}",
                handle
            );
        }
    }

    #[test]
    fn test_non_commander_always_rejected() {
        let bot = test_bot(BotStatus::Active);
        let decision = authorize(&bot, "somebody_else", &buy_command());
        assert_eq!(
            decision,
            Decision::Reject {
                reason: "not authorized".into()
            }
        );
    }

    #[test]
    fn test_inactive_bot_rejected() {
        for status in [BotStatus::Paused, BotStatus::Suspended] {
            let bot = test_bot(status);
            let decision = authorize(&bot, "commander", &buy_command());
            match decision {
                Decision::Reject { reason } => {
                    assert_eq!(reason, format!("bot is {}", status.as_str()))
                }
                other => panic!("expected Reject, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_unrecognized_rejected_even_for_commander() {
        let bot = test_bot(BotStatus::Active);
        let cmd = Command::Unrecognized {
            reason: "no token address found".into(),
        };
        match authorize(&bot, "commander", &cmd) {
            Decision::Reject { reason } => assert!(reason.contains("no token address found")),
            other => panic!("expected Reject, got {:?}", other),
        }
    }

    #[test]
    fn test_status_query_fast_path_for_anyone() {
        let bot = test_bot(BotStatus::Paused);
        assert_eq!(
            authorize(&bot, "random_user", &Command::StatusQuery),
            Decision::FastPath
        );
    }
}
