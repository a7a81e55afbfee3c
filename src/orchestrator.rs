use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Write};

use crate::config::HarnessConfig;
use crate::db::{ensure_schema, reset_schema, Connector, EngineKind, EngineSession};
use crate::error::HarnessError;
use crate::executor::{self, ExecutionError};
use crate::loader::{LoadError, RequestDir};
use crate::model::Model;
use crate::report::Presenter;
use crate::seed::{self, Fixtures, SeedPlan};

pub const DEFAULT_PREVIEW_LIMIT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    SchemaVerifying,
    Seeding,
    ExecutingFiles,
    Resetting,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Connecting => "connecting",
            Phase::SchemaVerifying => "schema verification",
            Phase::Seeding => "seeding",
            Phase::ExecutingFiles => "executing files",
            Phase::Resetting => "reset",
        })
    }
}

/// An unrecoverable error and where it happened.
#[derive(Debug)]
pub struct FatalFailure {
    pub phase: Phase,
    pub engine: Option<EngineKind>,
    pub error: HarnessError,
}

impl FatalFailure {
    fn new(phase: Phase, error: HarnessError) -> Self {
        Self {
            phase,
            engine: error.engine(),
            error,
        }
    }
}

impl fmt::Display for FatalFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.engine {
            Some(engine) => write!(f, "{} failed on {}: {}", self.phase, engine, self.error),
            None => write!(f, "{} failed: {}", self.phase, self.error),
        }
    }
}

#[derive(Debug)]
pub enum RunState {
    Idle,
    Connecting,
    SchemaVerifying,
    Seeding,
    ExecutingFiles,
    Done,
    Failed(FatalFailure),
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed(_))
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunState::Idle => "idle",
            RunState::Connecting => "connecting",
            RunState::SchemaVerifying => "schema-verifying",
            RunState::Seeding => "seeding",
            RunState::ExecutingFiles => "executing-files",
            RunState::Done => "done",
            RunState::Failed(_) => "failed",
        })
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Request directory; `None` stops after schema (and seeding).
    pub requests: Option<RequestDir>,
    pub preview_limit: usize,
    /// Clear and reinsert fixtures before executing files.
    pub seed: Option<SeedPlan>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            requests: None,
            preview_limit: DEFAULT_PREVIEW_LIMIT,
            seed: None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineTally {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Per-statement outcomes of the `ExecutingFiles` phase.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub requests: usize,
    pub tallies: BTreeMap<EngineKind, EngineTally>,
    pub failures: Vec<ExecutionError>,
    pub rejected: Vec<LoadError>,
}

impl RunSummary {
    pub fn tally(&self, engine: EngineKind) -> EngineTally {
        self.tallies.get(&engine).copied().unwrap_or_default()
    }

    /// Any statement or loader failure.
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty() || !self.rejected.is_empty()
    }

    fn entry(&mut self, engine: EngineKind) -> &mut EngineTally {
        self.tallies.entry(engine).or_default()
    }
}

#[derive(Debug)]
pub struct RunOutcome {
    /// `Done` or `Failed`.
    pub state: RunState,
    pub summary: RunSummary,
}

impl RunOutcome {
    /// 0 when the run reached `Done`, 1 when it failed, 2 when `strict` and
    /// any statement or file failed.
    pub fn exit_code(&self, strict: bool) -> u8 {
        match self.state {
            RunState::Done if strict && self.summary.has_failures() => 2,
            RunState::Done => 0,
            _ => 1,
        }
    }
}

pub struct Orchestrator<'a, W: Write> {
    connector: &'a dyn Connector,
    config: &'a HarnessConfig,
    model: Model,
    options: RunOptions,
    presenter: &'a mut Presenter<W>,
    /// Open sessions, in `EngineKind::ALL` order.
    sessions: Vec<Box<dyn EngineSession>>,
    summary: RunSummary,
    state: RunState,
}

impl<'a, W: Write> Orchestrator<'a, W> {
    pub fn new(
        connector: &'a dyn Connector,
        config: &'a HarnessConfig,
        model: Model,
        options: RunOptions,
        presenter: &'a mut Presenter<W>,
    ) -> Self {
        Self {
            connector,
            config,
            model,
            options,
            presenter,
            sessions: Vec::new(),
            summary: RunSummary::default(),
            state: RunState::Idle,
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Advance by one transition. Terminal states stay where they are.
    pub async fn step(&mut self) {
        let current = std::mem::replace(&mut self.state, RunState::Idle);
        let next = match current {
            RunState::Idle => RunState::Connecting,
            RunState::Connecting => self.connect().await,
            RunState::SchemaVerifying => self.verify_schema().await,
            RunState::Seeding => self.seed().await,
            RunState::ExecutingFiles => self.execute_files().await,
            terminal => terminal,
        };
        match &next {
            RunState::Failed(failure) => tracing::error!(%failure, "run failed"),
            state => tracing::info!(%state, "state transition"),
        }
        self.state = next;
    }

    /// Drive the machine to `Done` or `Failed`, then release both sessions.
    pub async fn run(mut self) -> RunOutcome {
        while !self.state.is_terminal() {
            self.step().await;
        }
        self.close_sessions().await;
        if let RunState::Failed(failure) = &self.state {
            reported(self.presenter.fatal(failure));
        }
        RunOutcome {
            state: self.state,
            summary: self.summary,
        }
    }

    async fn connect(&mut self) -> RunState {
        for kind in EngineKind::ALL {
            match self.connector.connect(kind, self.config.engine(kind)).await {
                Ok(session) => self.sessions.push(session),
                Err(error) => return RunState::Failed(FatalFailure::new(Phase::Connecting, error)),
            }
        }
        RunState::SchemaVerifying
    }

    async fn verify_schema(&mut self) -> RunState {
        for session in self.sessions.iter_mut() {
            let kind = session.kind();
            match ensure_schema(session.as_mut(), &self.model, self.config.engine(kind)).await {
                Ok(report) => reported(self.presenter.schema_verified(kind, &report)),
                Err(error) => {
                    return RunState::Failed(FatalFailure::new(Phase::SchemaVerifying, error))
                }
            }
        }
        if self.options.seed.is_some() {
            RunState::Seeding
        } else {
            RunState::ExecutingFiles
        }
    }

    async fn seed(&mut self) -> RunState {
        let Some(plan) = &self.options.seed else {
            return RunState::ExecutingFiles;
        };
        let fixtures = Fixtures::generate(plan);
        for session in self.sessions.iter_mut() {
            let kind = session.kind();
            match seed::seed(session.as_mut(), &self.model, &fixtures).await {
                Ok(counts) => reported(self.presenter.seeded(kind, &counts)),
                Err(error) => return RunState::Failed(FatalFailure::new(Phase::Seeding, error)),
            }
        }
        RunState::ExecutingFiles
    }

    async fn execute_files(&mut self) -> RunState {
        let Some(dir) = &self.options.requests else {
            return RunState::Done;
        };
        let requests = match dir.iter() {
            Ok(requests) => requests,
            Err(error) => {
                return RunState::Failed(FatalFailure::new(Phase::ExecutingFiles, error))
            }
        };
        reported(self.presenter.run_header(dir.path()));

        for request in requests {
            self.summary.requests += 1;
            let request = match request {
                Ok(request) => request,
                Err(error) => {
                    tracing::warn!(%error, "request file rejected");
                    reported(self.presenter.rejected(&error));
                    self.summary.rejected.push(error);
                    continue;
                }
            };
            reported(self.presenter.request_header(&request));

            for session in self.sessions.iter_mut() {
                let kind = session.kind();
                let (Some(file), Some(statement)) =
                    (request.file_for(kind), request.statement_for(kind))
                else {
                    self.summary.entry(kind).skipped += 1;
                    reported(self.presenter.skipped(kind));
                    continue;
                };

                match executor::execute(
                    session.as_mut(),
                    file,
                    statement,
                    self.options.preview_limit,
                )
                .await
                {
                    Ok(execution) => {
                        self.summary.entry(kind).succeeded += 1;
                        reported(self.presenter.present(file, kind, &execution));
                    }
                    Err(error) => {
                        tracing::warn!(engine = %kind, file, error = %error.error, "statement failed");
                        self.summary.entry(kind).failed += 1;
                        reported(self.presenter.execution_error(&error));
                        self.summary.failures.push(error);
                    }
                }
            }
        }

        reported(self.presenter.summary(&self.summary));
        RunState::Done
    }

    async fn close_sessions(&mut self) {
        for session in self.sessions.drain(..) {
            let kind = session.kind();
            session.close().await;
            tracing::debug!(engine = %kind, "session closed");
        }
    }
}

/// Drop every harness table on both engines, dependents first.
pub async fn reset<W: Write>(
    connector: &dyn Connector,
    config: &HarnessConfig,
    model: &Model,
    presenter: &mut Presenter<W>,
) -> Result<(), FatalFailure> {
    let mut sessions: Vec<Box<dyn EngineSession>> = Vec::new();
    let mut result = Ok(());

    for kind in EngineKind::ALL {
        match connector.connect(kind, config.engine(kind)).await {
            Ok(session) => sessions.push(session),
            Err(error) => {
                result = Err(FatalFailure::new(Phase::Connecting, error));
                break;
            }
        }
    }

    if result.is_ok() {
        for session in sessions.iter_mut() {
            let kind = session.kind();
            match reset_schema(session.as_mut(), model, config.engine(kind)).await {
                Ok(dropped) => reported(presenter.reset_done(kind, &dropped)),
                Err(error) => {
                    result = Err(FatalFailure::new(Phase::Resetting, error));
                    break;
                }
            }
        }
    }

    for session in sessions {
        session.close().await;
    }
    if let Err(failure) = &result {
        reported(presenter.fatal(failure));
    }
    result
}

/// The report stream is best effort; a broken pipe must not abort the run.
fn reported(result: io::Result<()>) {
    if let Err(e) = result {
        tracing::warn!(error = %e, "failed to write report");
    }
}
