//! Command parsing for inbound mentions
//!
//! `parse` is pure and total: it never fails, never touches the network or
//! the store, and surfaces every malformed input as `Unrecognized` with a
//! human-readable reason.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::model::TradeDirection;

/// Upper bound on any amount accepted from a mention. Stops overflow and
/// griefing via absurd values; real balance checks happen at execution.
pub const MAX_AMOUNT: f64 = 1_000_000.0;

/// Base-58 address shape for the target chain
const ADDRESS_MIN_LEN: usize = 32;
const ADDRESS_MAX_LEN: usize = 44;

lazy_static! {
    static ref AMOUNT_RE: Regex =
        Regex::new(r"(?i)\b(\d+(?:\.\d+)?)\s*(sol|tokens?)\b").expect("amount regex");
    static ref STATUS_RE: Regex =
        Regex::new(r"(?i)\b(status|balance|portfolio)\b").expect("status regex");
    static ref BUY_RE: Regex = Regex::new(r"(?i)\bbuy\b").expect("buy regex");
    static ref SELL_RE: Regex = Regex::new(r"(?i)\bsell\b").expect("sell regex");
    static ref WITHDRAW_RE: Regex = Regex::new(r"(?i)\bwithdraw\b").expect("withdraw regex");
}

/// Amount of a trade, in SOL or in tokens - exactly one
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeAmount {
    Sol(f64),
    Tokens(f64),
}

/// Parsed mention command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Trade {
        direction: TradeDirection,
        token: String,
        amount: TradeAmount,
    },
    Withdraw {
        destination: String,
        amount_sol: f64,
    },
    StatusQuery,
    Unrecognized {
        reason: String,
    },
}

impl Command {
    /// Short label stored on the mention row
    pub fn type_name(&self) -> &'static str {
        match self {
            Command::Trade { .. } => "trade",
            Command::Withdraw { .. } => "withdraw",
            Command::StatusQuery => "status",
            Command::Unrecognized { .. } => "unrecognized",
        }
    }

    pub fn is_executable(&self) -> bool {
        matches!(self, Command::Trade { .. } | Command::Withdraw { .. })
    }
}

/// Check that a string has the target chain's base-58 address shape
pub fn is_chain_address(s: &str) -> bool {
    if s.len() < ADDRESS_MIN_LEN || s.len() > ADDRESS_MAX_LEN {
        return false;
    }
    bs58::decode(s).into_vec().is_ok()
}

/// Parse raw mention text into a typed command
pub fn parse(text: &str) -> Command {
    let text = text.trim();
    if text.is_empty() {
        return Command::Unrecognized {
            reason: "empty mention".into(),
        };
    }

    let wants_buy = BUY_RE.is_match(text);
    let wants_sell = SELL_RE.is_match(text);
    let wants_withdraw = WITHDRAW_RE.is_match(text);

    let verb_count = [wants_buy, wants_sell, wants_withdraw]
        .iter()
        .filter(|v| **v)
        .count();

    if verb_count == 0 {
        if STATUS_RE.is_match(text) {
            return Command::StatusQuery;
        }
        return Command::Unrecognized {
            reason: "no recognizable command".into(),
        };
    }
    if verb_count > 1 {
        return Command::Unrecognized {
            reason: "more than one command verb".into(),
        };
    }

    let (sol_amount, token_amount) = match extract_amounts(text) {
        Ok(amounts) => amounts,
        Err(reason) => return Command::Unrecognized { reason },
    };

    if wants_withdraw {
        let amount_sol = match (sol_amount, token_amount) {
            (Some(sol), None) => sol,
            (None, Some(_)) => {
                return Command::Unrecognized {
                    reason: "withdrawal amount must be in SOL".into(),
                }
            }
            _ => {
                return Command::Unrecognized {
                    reason: "amount not parseable".into(),
                }
            }
        };
        let destination = match find_address(text) {
            Some(addr) => addr,
            None => {
                return Command::Unrecognized {
                    reason: "no destination address found".into(),
                }
            }
        };
        return Command::Withdraw {
            destination,
            amount_sol,
        };
    }

    // Buy or sell
    let amount = match (sol_amount, token_amount) {
        (Some(sol), None) => TradeAmount::Sol(sol),
        (None, Some(tokens)) => TradeAmount::Tokens(tokens),
        (Some(_), Some(_)) => {
            return Command::Unrecognized {
                reason: "amount given in both SOL and tokens".into(),
            }
        }
        (None, None) => {
            return Command::Unrecognized {
                reason: "amount not parseable".into(),
            }
        }
    };

    let token = match find_address(text) {
        Some(addr) => addr,
        None => {
            return Command::Unrecognized {
                reason: "no token address found".into(),
            }
        }
    };

    let direction = if wants_buy {
        TradeDirection::Buy
    } else {
        TradeDirection::Sell
    };

    Command::Trade {
        direction,
        token,
        amount,
    }
}

/// Extract at most one SOL amount and one token amount from the text
fn extract_amounts(text: &str) -> std::result::Result<(Option<f64>, Option<f64>), String> {
    let mut sol = None;
    let mut tokens = None;

    for cap in AMOUNT_RE.captures_iter(text) {
        let value: f64 = cap[1]
            .parse()
            .map_err(|_| "amount not parseable".to_string())?;
        if !value.is_finite() || value <= 0.0 {
            return Err("amount must be positive".into());
        }
        if value > MAX_AMOUNT {
            return Err(format!("amount exceeds the maximum of {}", MAX_AMOUNT));
        }

        let unit = cap[2].to_ascii_lowercase();
        let slot = if unit == "sol" { &mut sol } else { &mut tokens };
        if slot.is_some() {
            return Err("more than one amount given".into());
        }
        *slot = Some(value);
    }

    Ok((sol, tokens))
}

/// Find the first base-58 address-shaped word, skipping @handles
fn find_address(text: &str) -> Option<String> {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_ascii_alphanumeric()))
        .filter(|w| !w.is_empty())
        .find(|w| is_chain_address(w))
        .map(|w| w.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "So11111111111111111111111111111111111111112";
    const DEST: &str = "4wTV1YmiEkRvAtNtsSGPtUrqRYQMe5SKy2uB4Jjaxnjf";

    #[test]
    fn test_buy_in_sol() {
        let cmd = parse(&format!("@bot buy 2 SOL of {}", TOKEN));
        assert_eq!(
            cmd,
            Command::Trade {
                direction: TradeDirection::Buy,
                token: TOKEN.into(),
                amount: TradeAmount::Sol(2.0),
            }
        );
    }

    #[test]
    fn test_sell_in_tokens() {
        let cmd = parse(&format!("sell 1500 tokens of {}", TOKEN));
        assert_eq!(
            cmd,
            Command::Trade {
                direction: TradeDirection::Sell,
                token: TOKEN.into(),
                amount: TradeAmount::Tokens(1500.0),
            }
        );
    }

    #[test]
    fn test_withdraw() {
        let cmd = parse(&format!("@bot withdraw 0.5 sol to {}", DEST));
        assert_eq!(
            cmd,
            Command::Withdraw {
                destination: DEST.into(),
                amount_sol: 0.5,
            }
        );
    }

    #[test]
    fn test_status_query() {
        assert_eq!(parse("@bot what's your status?"), Command::StatusQuery);
        assert_eq!(parse("balance please"), Command::StatusQuery);
    }

    #[test]
    fn test_unrecognized_chatter() {
        match parse("gm fren, nice posts lately") {
            Command::Unrecognized { reason } => {
                assert_eq!(reason, "no recognizable command")
            }
            other => panic!("expected Unrecognized, got {:?}", other),
        }
    }

    #[test]
    fn test_both_amount_units_rejected() {
        match parse(&format!("buy 2 SOL 100 tokens of {}", TOKEN)) {
            Command::Unrecognized { reason } => {
                assert_eq!(reason, "amount given in both SOL and tokens")
            }
            other => panic!("expected Unrecognized, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_token_address() {
        match parse("buy 2 SOL of that hot new coin") {
            Command::Unrecognized { reason } => {
                assert_eq!(reason, "no token address found")
            }
            other => panic!("expected Unrecognized, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_amount() {
        match parse(&format!("buy some of {}", TOKEN)) {
            Command::Unrecognized { reason } => assert_eq!(reason, "amount not parseable"),
            other => panic!("expected Unrecognized, got {:?}", other),
        }
    }

    #[test]
    fn test_huge_amount_rejected() {
        match parse(&format!("buy 99999999 SOL of {}", TOKEN)) {
            Command::Unrecognized { reason } => {
                assert!(reason.contains("exceeds the maximum"))
            }
            other => panic!("expected Unrecognized, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_amount_rejected() {
        match parse(&format!("buy 0 SOL of {}", TOKEN)) {
            Command::Unrecognized { reason } => assert_eq!(reason, "amount must be positive"),
            other => panic!("expected Unrecognized, got {:?}", other),
        }
    }

    #[test]
    fn test_conflicting_verbs_rejected() {
        match parse(&format!("buy or sell 1 SOL of {}", TOKEN)) {
            Command::Unrecognized { reason } => {
                assert_eq!(reason, "more than one command verb")
            }
            other => panic!("expected Unrecognized, got {:?}", other),
        }
    }

    #[test]
    fn test_address_shape() {
        assert!(is_chain_address(TOKEN));
        assert!(is_chain_address(DEST));
        assert!(!is_chain_address("tooshort"));
        assert!(!is_chain_address(&"l".repeat(40))); // 'l' is outside the base-58 alphabet
        assert!(!is_chain_address(&"A".repeat(45)));
    }

    #[test]
    fn test_handle_not_mistaken_for_address() {
        // An @handle of address-ish length must not be picked up as the token
        let cmd = parse("buy 1 SOL of @someverylongbothandlethatkeepsgoing1");
        assert!(matches!(cmd, Command::Unrecognized { .. }));
    }

    #[test]
    fn test_command_json_round_trip() {
        let cmd = parse(&format!("buy 2 SOL of {}", TOKEN));
        let json = serde_json::to_string(&cmd).unwrap();
        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cmd);
    }
}
