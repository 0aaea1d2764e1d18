//! Shared test doubles: a scripted command channel, an opener that hands
//! out pre-built channels, and a stub stage whose phases leave tracks in
//! the channel log.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use groundwork::{
    ChannelOpener, CommandChannel, Config, Criticality, CredentialVault, ExecOutput,
    SessionError, SessionParams, Stage, StageError, StageGroup,
};

pub fn ok(stdout: &str) -> ExecOutput {
    ExecOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: 0,
    }
}

pub fn fail(code: i32, stderr: &str) -> ExecOutput {
    ExecOutput {
        stdout: String::new(),
        stderr: stderr.to_string(),
        exit_code: code,
    }
}

/// A config that passes validation, pointed at a documentation address.
pub fn test_config() -> Config {
    Config {
        address: "203.0.113.7".to_string(),
        site_name: "shop.example.com".to_string(),
        ..Config::default()
    }
}

enum Response {
    Output(ExecOutput),
    Disconnect,
}

struct Rule {
    needle: String,
    response: Response,
    consumed: bool,
}

struct Inner {
    rules: Vec<Rule>,
    log: Vec<String>,
}

/// In-memory channel scripted with substring rules.
///
/// Each executed command is appended to a shared log. The first
/// unconsumed rule whose needle the command contains decides the result
/// and is then spent, so the same query can be scripted with different
/// answers across phases. Unmatched commands succeed: `echo` round-trips
/// its argument (which keeps the connection probe honest) and everything
/// else returns empty output with exit zero.
///
/// Clones share the rule list and the log, so a test can keep a handle
/// for assertions after moving a clone into the pipeline runner.
#[derive(Clone)]
pub struct ScriptedChannel {
    inner: Arc<Mutex<Inner>>,
}

impl ScriptedChannel {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                rules: Vec::new(),
                log: Vec::new(),
            })),
        }
    }

    /// Script the next command containing `needle` to produce `output`.
    pub fn on(self, needle: &str, output: ExecOutput) -> Self {
        self.push(needle, Response::Output(output));
        self
    }

    /// Script the next command containing `needle` to kill the transport.
    pub fn on_disconnect(self, needle: &str) -> Self {
        self.push(needle, Response::Disconnect);
        self
    }

    fn push(&self, needle: &str, response: Response) {
        self.inner.lock().unwrap().rules.push(Rule {
            needle: needle.to_string(),
            response,
            consumed: false,
        });
    }

    /// Every command executed so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.inner.lock().unwrap().log.clone()
    }

    /// Whether any executed command contained `needle`.
    pub fn saw(&self, needle: &str) -> bool {
        self.commands().iter().any(|cmd| cmd.contains(needle))
    }
}

impl CommandChannel for ScriptedChannel {
    fn run(&mut self, command: &str) -> Result<ExecOutput, SessionError> {
        let mut inner = self.inner.lock().unwrap();
        inner.log.push(command.to_string());

        for rule in &mut inner.rules {
            if rule.consumed || !command.contains(&rule.needle) {
                continue;
            }
            rule.consumed = true;
            return match &rule.response {
                Response::Output(output) => Ok(output.clone()),
                Response::Disconnect => Err(SessionError::Closed),
            };
        }

        if let Some(rest) = command.strip_prefix("echo ") {
            return Ok(ExecOutput {
                stdout: format!("{rest}\n"),
                stderr: String::new(),
                exit_code: 0,
            });
        }
        Ok(ExecOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        })
    }
}

/// Opener that hands out pre-built channels in order and records the
/// parameters of every open, so reconnects are observable.
pub struct ScriptedOpener {
    channels: VecDeque<ScriptedChannel>,
    pub opens: Vec<SessionParams>,
}

impl ScriptedOpener {
    pub fn new(channels: Vec<ScriptedChannel>) -> Self {
        Self {
            channels: channels.into_iter().collect(),
            opens: Vec::new(),
        }
    }

    pub fn single(channel: ScriptedChannel) -> Self {
        Self::new(vec![channel])
    }
}

impl ChannelOpener for ScriptedOpener {
    fn open(&mut self, params: &SessionParams) -> Result<Box<dyn CommandChannel>, SessionError> {
        self.opens.push(params.clone());
        match self.channels.pop_front() {
            Some(channel) => Ok(Box::new(channel)),
            None => Err(SessionError::Closed),
        }
    }
}

/// Stage whose phases run marker commands (`check <name>`, `apply
/// <name>`, `verify <name>`) over the channel, so tests can assert which
/// phases ran and in what order.
pub struct StubStage {
    name: &'static str,
    criticality: Criticality,
    satisfied: bool,
    fail_apply: bool,
    fail_verify: bool,
}

impl StubStage {
    /// Unsatisfied stage whose apply and verify both pass.
    pub fn passing(name: &'static str) -> Self {
        Self {
            name,
            criticality: Criticality::Critical,
            satisfied: false,
            fail_apply: false,
            fail_verify: false,
        }
    }

    /// Stage whose idempotency check already holds.
    pub fn satisfied(name: &'static str) -> Self {
        Self {
            satisfied: true,
            ..Self::passing(name)
        }
    }

    /// Stage whose action fails.
    pub fn failing(name: &'static str) -> Self {
        Self {
            fail_apply: true,
            ..Self::passing(name)
        }
    }

    /// Stage whose action passes but whose verification disagrees.
    pub fn failing_verify(name: &'static str) -> Self {
        Self {
            fail_verify: true,
            ..Self::passing(name)
        }
    }

    pub fn advisory(mut self) -> Self {
        self.criticality = Criticality::Advisory;
        self
    }
}

impl Stage for StubStage {
    fn name(&self) -> &'static str {
        self.name
    }

    fn group(&self) -> StageGroup {
        StageGroup::Hardening
    }

    fn criticality(&self) -> Criticality {
        self.criticality
    }

    fn is_satisfied(
        &self,
        _config: &Config,
        chan: &mut dyn CommandChannel,
        _vault: &mut CredentialVault,
    ) -> Result<bool, StageError> {
        chan.run(&format!("check {}", self.name))?;
        Ok(self.satisfied)
    }

    fn apply(
        &self,
        _config: &Config,
        chan: &mut dyn CommandChannel,
        _vault: &mut CredentialVault,
    ) -> Result<(), StageError> {
        chan.run(&format!("apply {}", self.name))?;
        if self.fail_apply {
            return Err(StageError::action(format!("{} apply refused", self.name)));
        }
        Ok(())
    }

    fn verify(
        &self,
        _config: &Config,
        chan: &mut dyn CommandChannel,
        _vault: &mut CredentialVault,
    ) -> Result<(), StageError> {
        chan.run(&format!("verify {}", self.name))?;
        if self.fail_verify {
            return Err(StageError::verify("stub expectation", "stub reality"));
        }
        Ok(())
    }
}
