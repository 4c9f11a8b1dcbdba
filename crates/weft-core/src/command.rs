//! Operator command front-end.
//!
//! Parses chat-style operator text into one of four verbs. The regex path is
//! definitive; an optional natural-language fallback is consulted only when no
//! regex matches. The fallback is an injected collaborator so the core stays
//! total and testable without a model client.

use async_trait::async_trait;
use regex::Regex;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommandParseError {
    #[error("command cannot be empty")]
    Empty,
    #[error("not a command: '{0}'")]
    NotACommand(String),
    #[error("fallback parser failed: {0}")]
    Fallback(String),
}

/// The verbs the control plane understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandVerb {
    WorkOnIssue { issue: u64 },
    Status { issue: u64 },
    Stop { issue: u64 },
    ListAgents,
}

#[derive(Debug, Clone)]
pub struct ParsedCommand {
    pub verb: CommandVerb,
    pub raw: String,
    pub repository: Option<String>,
    /// True when the fallback (not the regex path) produced the verb.
    pub natural_language: bool,
}

/// Optional natural-language fallback, consulted only on regex miss.
#[async_trait]
pub trait NaturalLanguageParser: Send + Sync {
    async fn parse(&self, text: &str) -> anyhow::Result<Option<CommandVerb>>;
}

pub struct CommandParser {
    default_repository: Option<String>,
    fallback: Option<Arc<dyn NaturalLanguageParser>>,
    work_on_issue: Regex,
    status: Regex,
    stop: Regex,
    list_agents: Regex,
}

impl CommandParser {
    pub fn new(
        default_repository: Option<String>,
        fallback: Option<Arc<dyn NaturalLanguageParser>>,
    ) -> Self {
        let default_repository =
            default_repository.or_else(|| std::env::var("GITHUB_DEFAULT_REPO").ok());

        Self {
            default_repository,
            fallback,
            work_on_issue: Regex::new(r"^work\s+on\s+issue\s+#?(\d+)$").expect("static regex"),
            status: Regex::new(r"^(?:check\s+)?status\s+(?:of\s+)?issue\s+#?(\d+)$")
                .expect("static regex"),
            stop: Regex::new(r"^(?:stop|cancel)\s+(?:work\s+(?:on\s+)?)?issue\s+#?(\d+)$")
                .expect("static regex"),
            list_agents: Regex::new(r"^(?:list|show)\s+(?:active\s+)?agents$")
                .expect("static regex"),
        }
    }

    /// Regex-only parse. Total: never consults the fallback.
    pub fn parse(&self, text: &str) -> Result<ParsedCommand, CommandParseError> {
        let raw = text.trim();
        if raw.is_empty() {
            return Err(CommandParseError::Empty);
        }

        let normalized = raw.to_lowercase();
        let verb = self
            .match_verb(&normalized)
            .ok_or_else(|| CommandParseError::NotACommand(raw.to_string()))?;

        Ok(ParsedCommand {
            verb,
            raw: raw.to_string(),
            repository: self.default_repository.clone(),
            natural_language: false,
        })
    }

    /// Parse with the natural-language fallback. The regex path is tried
    /// first and is definitive when it matches.
    pub async fn parse_with_fallback(
        &self,
        text: &str,
    ) -> Result<ParsedCommand, CommandParseError> {
        match self.parse(text) {
            Ok(parsed) => Ok(parsed),
            Err(CommandParseError::NotACommand(raw)) => {
                let Some(fallback) = &self.fallback else {
                    return Err(CommandParseError::NotACommand(raw));
                };

                let verb = fallback
                    .parse(&raw)
                    .await
                    .map_err(|err| CommandParseError::Fallback(err.to_string()))?
                    .ok_or(CommandParseError::NotACommand(raw.clone()))?;

                Ok(ParsedCommand {
                    verb,
                    raw,
                    repository: self.default_repository.clone(),
                    natural_language: true,
                })
            }
            Err(err) => Err(err),
        }
    }

    fn match_verb(&self, normalized: &str) -> Option<CommandVerb> {
        if let Some(caps) = self.work_on_issue.captures(normalized) {
            return issue_number(&caps).map(|issue| CommandVerb::WorkOnIssue { issue });
        }
        if let Some(caps) = self.status.captures(normalized) {
            return issue_number(&caps).map(|issue| CommandVerb::Status { issue });
        }
        if let Some(caps) = self.stop.captures(normalized) {
            return issue_number(&caps).map(|issue| CommandVerb::Stop { issue });
        }
        if self.list_agents.is_match(normalized) {
            return Some(CommandVerb::ListAgents);
        }
        None
    }
}

fn issue_number(caps: &regex::Captures<'_>) -> Option<u64> {
    caps.get(1)?.as_str().parse().ok()
}
