use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{Autonomy, Config};
use crate::error::AgentError;
use crate::executor::{self, ExecOutcome};
use crate::history::{History, StepAction};
use crate::llm::{LanguageModel, Plan, parse_plan};
use crate::prompts;
use crate::safety::SafetyPolicy;

/// Where the loop currently is, surfaced to the interaction layer so the
/// user can follow along.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Planning,
    Classifying,
    Executing,
    AwaitingConfirmation,
    Concluding,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Planning => "planning",
            Phase::Classifying => "classifying",
            Phase::Executing => "executing",
            Phase::AwaitingConfirmation => "awaiting confirmation",
            Phase::Concluding => "concluding",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    AwaitingConfirmation,
    Succeeded,
    Failed,
    Aborted,
}

/// Terminal outcome of one task run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub status: RunStatus,
    pub reason: String,
    pub steps_taken: usize,
}

/// Everything the loop needs from a user interface. The console implements
/// this for interactive runs; tests drive the loop with scripted answers.
pub trait Interaction {
    fn notify(&mut self, phase: Phase, content: &str);
    fn confirm(&mut self, prompt: &str) -> Result<bool>;
    /// Ask the user a free-form question. `None` means no answer is
    /// available (end of input, or an unattended run).
    fn clarify(&mut self, question: &str) -> Result<Option<String>>;
}

pub struct AgentLoop<'a> {
    cfg: &'a Config,
    model: &'a dyn LanguageModel,
    policy: &'a SafetyPolicy,
    ui: &'a mut dyn Interaction,
    history: &'a mut History,
    interrupt: watch::Receiver<bool>,
    workdir: PathBuf,
    status: RunStatus,
    steps_taken: usize,
    idle_steps: usize,
    last_command: Option<String>,
}

impl<'a> AgentLoop<'a> {
    pub fn new(
        cfg: &'a Config,
        model: &'a dyn LanguageModel,
        policy: &'a SafetyPolicy,
        ui: &'a mut dyn Interaction,
        history: &'a mut History,
        interrupt: watch::Receiver<bool>,
        workdir: PathBuf,
    ) -> Self {
        Self {
            cfg,
            model,
            policy,
            ui,
            history,
            interrupt,
            workdir,
            status: RunStatus::Running,
            steps_taken: 0,
            idle_steps: 0,
            last_command: None,
        }
    }

    /// Drive one task to a terminal status. Never panics on model or command
    /// failures; every ending is a `RunReport`.
    pub async fn run(&mut self, task: &str) -> Result<RunReport> {
        self.history.push_user(prompts::task_prompt(task));
        info!(%task, model = self.model.name(), "run started");

        loop {
            if *self.interrupt.borrow() {
                return Ok(self.finish(
                    RunStatus::Aborted,
                    AgentError::UserAborted("interrupted".to_string()).to_string(),
                ));
            }
            if self.steps_taken >= self.cfg.max_steps {
                return Ok(self.finish(
                    RunStatus::Failed,
                    AgentError::BudgetExhausted(format!(
                        "step budget exhausted after {} commands",
                        self.steps_taken
                    ))
                    .to_string(),
                ));
            }
            if self.idle_steps >= self.cfg.max_idle_steps {
                return Ok(self.finish(
                    RunStatus::Failed,
                    AgentError::BudgetExhausted(format!(
                        "no progress detected after {} idle steps",
                        self.idle_steps
                    ))
                    .to_string(),
                ));
            }

            self.history
                .compact(self.cfg.history_max_messages, self.cfg.history_max_chars);

            self.ui.notify(Phase::Planning, "thinking");
            let response = match self.plan().await {
                Ok(text) => text,
                Err(AgentError::UserAborted(reason)) => {
                    return Ok(self.finish(
                        RunStatus::Aborted,
                        AgentError::UserAborted(reason).to_string(),
                    ));
                }
                Err(err) => {
                    return Ok(self.finish(RunStatus::Failed, err.to_string()));
                }
            };
            self.history.push_assistant(response.clone());

            let Some(plan) = parse_plan(&response) else {
                if !self.handle_malformed(&response)? {
                    return Ok(self.finish(
                        RunStatus::Aborted,
                        AgentError::UserAborted("no answer to clarification".to_string())
                            .to_string(),
                    ));
                }
                continue;
            };

            match plan {
                Plan::FinalAnswer { summary, success } => {
                    self.ui.notify(Phase::Concluding, &summary);
                    self.history
                        .record_step(StepAction::FinalAnswer(summary.clone()), None, None);
                    let status = if success {
                        RunStatus::Succeeded
                    } else {
                        RunStatus::Failed
                    };
                    return Ok(self.finish(status, summary));
                }
                Plan::Clarification { question } => {
                    self.history
                        .record_step(StepAction::Clarification(question.clone()), None, None);
                    match self.ui.clarify(&question)? {
                        Some(answer) => self.history.push_user(answer),
                        None => {
                            return Ok(self.finish(
                                RunStatus::Aborted,
                                AgentError::UserAborted(
                                    "no answer to clarification".to_string(),
                                )
                                .to_string(),
                            ));
                        }
                    }
                }
                Plan::Command { command, thought } => {
                    if let Some(t) = &thought {
                        debug!(thought = %t, "model reasoning");
                    }
                    match self.handle_command(command).await? {
                        Some(report) => return Ok(report),
                        None => {}
                    }
                }
            }
        }
    }

    /// Returns `Some(report)` when the command ends the run (blocked or
    /// rejected), `None` when the loop should continue.
    async fn handle_command(&mut self, command: String) -> Result<Option<RunReport>> {
        use crate::safety::SafetyVerdict;

        self.ui.notify(Phase::Classifying, &command);
        let verdict = self.policy.classify(&command, &self.workdir);

        match &verdict {
            SafetyVerdict::Blocked(reason) => {
                warn!(%command, %reason, "command blocked");
                self.history.record_step(
                    StepAction::Command(command.clone()),
                    Some(verdict.clone()),
                    None,
                );
                return Ok(Some(self.finish(
                    RunStatus::Failed,
                    AgentError::CommandBlocked(reason.clone()).to_string(),
                )));
            }
            SafetyVerdict::Dangerous(reason) => {
                let needs_confirmation =
                    self.cfg.autonomy == Autonomy::Interactive || self.cfg.safe_mode;
                if needs_confirmation {
                    self.status = RunStatus::AwaitingConfirmation;
                    self.ui.notify(Phase::AwaitingConfirmation, &command);
                    let prompt = format!("run `{command}`? ({reason})");
                    let approved = self.ui.confirm(&prompt)?;
                    self.status = RunStatus::Running;
                    if !approved {
                        self.history.record_step(
                            StepAction::Command(command.clone()),
                            Some(verdict.clone()),
                            None,
                        );
                        return Ok(Some(self.finish(
                            RunStatus::Aborted,
                            AgentError::UserAborted("command rejected".to_string())
                                .to_string(),
                        )));
                    }
                }
            }
            SafetyVerdict::Safe => {}
        }

        self.ui.notify(Phase::Executing, &command);
        let timeout = Duration::from_secs(self.cfg.command_timeout_secs);
        let mut interrupt = self.interrupt.clone();
        // The executor owns interrupt handling so the process group gets the
        // same TERM, grace, KILL teardown as a timeout.
        let outcome =
            executor::execute(&command, &self.workdir, timeout, Some(&mut interrupt)).await;
        let result = match outcome {
            Ok(ExecOutcome::Finished(r)) => r,
            Ok(ExecOutcome::Interrupted) => {
                return Ok(Some(self.finish(
                    RunStatus::Aborted,
                    AgentError::UserAborted("interrupted during execution".to_string())
                        .to_string(),
                )));
            }
            Err(err) => {
                return Ok(Some(self.finish(RunStatus::Failed, format!("{err:#}"))));
            }
        };

        self.steps_taken += 1;
        let idle = result.timed_out
            || self.last_command.as_deref() == Some(command.as_str())
            || (result.exit_code != 0 && result.stderr.trim().is_empty());
        if idle {
            self.idle_steps += 1;
        } else {
            self.idle_steps = 0;
        }

        self.workdir = result.workdir.clone();
        let observation = prompts::observation(&command, &result);
        self.history.record_step(
            StepAction::Command(command.clone()),
            Some(verdict),
            Some(result),
        );
        self.history.push_user(observation);
        self.last_command = Some(command);
        Ok(None)
    }

    /// One reasoning call, retried once, each attempt bounded by the
    /// configured timeout and interruptible.
    async fn plan(&mut self) -> Result<String, AgentError> {
        let automatic = self.cfg.autonomy == Autonomy::Automatic;
        let system_prompt = prompts::agent_system_prompt(automatic, &self.workdir);
        let timeout = Duration::from_secs(self.cfg.llm_timeout_secs);
        let mut interrupt = self.interrupt.clone();

        let mut last_error = String::new();
        for attempt in 0..2 {
            let call = self.model.generate(&system_prompt, &self.history.messages);
            tokio::select! {
                res = tokio::time::timeout(timeout, call) => match res {
                    Ok(Ok(text)) => return Ok(text),
                    Ok(Err(err)) => {
                        warn!(attempt, error = %err, "reasoning call failed");
                        last_error = format!("{err:#}");
                    }
                    Err(_) => {
                        warn!(attempt, ?timeout, "reasoning call timed out");
                        last_error = format!("no response within {timeout:?}");
                    }
                },
                Ok(_) = interrupt.wait_for(|v| *v) => {
                    return Err(AgentError::UserAborted("interrupted".to_string()));
                }
            }
        }
        Err(AgentError::ReasoningUnavailable(last_error))
    }

    /// A response with no decodable plan is never guessed at. The user gets
    /// the raw text and a chance to redirect; the step counts as idle.
    fn handle_malformed(&mut self, response: &str) -> Result<bool> {
        warn!("response carried no decodable plan");
        self.idle_steps += 1;
        let question = format!(
            "{}\n\nNote: {}. How should I proceed?",
            response.trim(),
            AgentError::ReasoningMalformed
        );
        match self.ui.clarify(&question)? {
            Some(answer) => {
                self.history.push_user(answer);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn finish(&mut self, status: RunStatus, reason: String) -> RunReport {
        info!(from = ?self.status, ?status, %reason, steps = self.steps_taken, "run finished");
        self.status = status;
        RunReport {
            status,
            reason,
            steps_taken: self.steps_taken,
        }
    }
}
