//! Line protocol parsing.
//!
//! ```text
//! poll <scope> <since>        envelope JSON
//! set <scope> <key> <json>    ok | error
//! watch <scope> [since]       push envelopes for the scope until unwatch
//! unwatch <scope>
//! quit
//! ```

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Poll { scope: String, since: u64 },
    Set { scope: String, key: String, value: Value },
    Watch { scope: String, since: u64 },
    Unwatch { scope: String },
    Quit,
}

impl Command {
    /// Parses one input line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim_start();

        let command = match verb {
            "poll" => {
                let mut args = rest.split_whitespace();
                let scope = required(args.next(), "scope")?;
                let since = parse_since(args.next().unwrap_or("0"))?;
                Self::Poll { scope, since }
            }
            "set" => {
                let (scope, rest) = rest
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| anyhow!("usage: set <scope> <key> <json>"))?;
                let (key, json) = rest
                    .trim_start()
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| anyhow!("usage: set <scope> <key> <json>"))?;
                let value = serde_json::from_str(json.trim())
                    .with_context(|| format!("invalid JSON value for '{key}'"))?;
                Self::Set {
                    scope: scope.to_string(),
                    key: key.to_string(),
                    value,
                }
            }
            "watch" => {
                let mut args = rest.split_whitespace();
                let scope = required(args.next(), "scope")?;
                let since = parse_since(args.next().unwrap_or("0"))?;
                Self::Watch { scope, since }
            }
            "unwatch" => Self::Unwatch {
                scope: required(rest.split_whitespace().next(), "scope")?,
            },
            "quit" | "exit" => Self::Quit,
            other => bail!("unknown command '{other}'"),
        };
        Ok(Some(command))
    }
}

fn required(arg: Option<&str>, name: &str) -> Result<String> {
    arg.map(str::to_string)
        .ok_or_else(|| anyhow!("missing <{name}>"))
}

fn parse_since(raw: &str) -> Result<u64> {
    raw.parse()
        .with_context(|| format!("invalid sequence '{raw}'"))
}
