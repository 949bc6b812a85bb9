use crate::PatternConfig;
use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};

/// Transient classification of one piece of process output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutputClassification {
    pub is_prompt: bool,
    pub is_server_ready: bool,
}

/// Stateless heuristic classifiers over process output text.
///
/// These are heuristics, not a protocol: false negatives fail safe. An
/// undetected prompt leaves the interactive loop waiting, bounded by the
/// overall timeout; an undetected ready banner falls through to the
/// background strategy's soft-success path.
pub struct OutputClassifier {
    prompt: Vec<Regex>,
    ready: Vec<Regex>,
    long_running: Vec<String>,
}

impl OutputClassifier {
    /// Compile the classifier from a pattern table
    pub fn from_config(config: &PatternConfig) -> Result<Self> {
        Ok(Self {
            prompt: compile(&config.prompt_patterns)?,
            ready: compile(&config.ready_patterns)?,
            long_running: config
                .long_running_commands
                .iter()
                .map(|c| c.to_lowercase())
                .collect(),
        })
    }

    /// Compile the classifier from the stock pattern tables
    pub fn stock() -> Result<Self> {
        Self::from_config(&PatternConfig::default())
    }

    /// Detect if `text` is an interactive prompt requiring user input
    pub fn is_interactive_prompt(&self, text: &str) -> bool {
        let stripped = text.trim();
        if stripped.is_empty() {
            return false;
        }
        self.prompt.iter().any(|pattern| pattern.is_match(stripped))
    }

    /// Detect if `text` indicates a server has successfully started
    pub fn is_server_ready(&self, text: &str) -> bool {
        let stripped = text.trim();
        if stripped.is_empty() {
            return false;
        }
        self.ready.iter().any(|pattern| pattern.is_match(stripped))
    }

    /// Detect if `command` is a known long-running server invocation
    pub fn is_long_running_command(&self, command: &str) -> bool {
        let lower = command.to_lowercase();
        self.long_running.iter().any(|known| lower.contains(known))
    }

    /// Classify one piece of output against both line classifiers
    pub fn classify(&self, text: &str) -> OutputClassification {
        OutputClassification {
            is_prompt: self.is_interactive_prompt(text),
            is_server_ready: self.is_server_ready(text),
        }
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .with_context(|| format!("invalid classifier pattern: {pattern}"))
        })
        .collect()
}
