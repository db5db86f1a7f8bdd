//! In-memory fakes for the command boundary (testing only)
//!
//! Provides `ScriptedExecutor`, a `CommandExecutor` that answers commands from
//! a script instead of spawning processes.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::Result;
use crate::exec::{CommandExecutor, CommandOutput, CommandSpec};

#[derive(Debug)]
struct Rule {
    pattern: String,
    responses: VecDeque<CommandOutput>,
}

/// Scripted command executor.
///
/// Each rule matches when its pattern is a substring of the space-joined argv.
/// Rules are checked in insertion order, first match wins. A rule hands out its
/// queued responses in order and keeps repeating the last one. Commands matching
/// no rule succeed with empty output.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the responses for commands containing `pattern`.
    pub fn when(&self, pattern: &str, responses: Vec<CommandOutput>) -> &Self {
        self.rules.lock().unwrap().push(Rule {
            pattern: pattern.to_string(),
            responses: responses.into(),
        });
        self
    }

    /// Script a single repeating response.
    pub fn always(&self, pattern: &str, response: CommandOutput) -> &Self {
        self.when(pattern, vec![response])
    }

    /// Every command executed so far, in order.
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Space-joined argv of every command executed so far.
    pub fn call_lines(&self) -> Vec<String> {
        self.calls().iter().map(CommandSpec::display).collect()
    }

    /// Number of executed commands containing `pattern`.
    pub fn count(&self, pattern: &str) -> usize {
        self.call_lines()
            .iter()
            .filter(|line| line.contains(pattern))
            .count()
    }

    /// Index of the first executed command containing `pattern`.
    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.call_lines()
            .iter()
            .position(|line| line.contains(pattern))
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn execute(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(cmd.clone());

        let line = cmd.display();
        let mut rules = self.rules.lock().unwrap();
        let Some(rule) = rules.iter_mut().find(|r| line.contains(&r.pattern)) else {
            return Ok(CommandOutput::success(""));
        };

        let response = if rule.responses.len() > 1 {
            rule.responses.pop_front()
        } else {
            rule.responses.front().cloned()
        };
        Ok(response.unwrap_or_default())
    }
}
