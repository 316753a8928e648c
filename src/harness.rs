/// Wiring for one test run: a shared start-slot scheduler plus per-case
/// runners, session manager, readiness poller, and cluster helpers.
use crate::cluster::ClusterHelper;
use crate::command::{CommandError, CommandResult, CommandRunner, CommandSpec};
use crate::config::HarnessConfig;
use crate::kubectl::KubectlSource;
use crate::process_tree::ProcessTreeTerminator;
use crate::readiness::{ReadinessPoller, WaitError};
use crate::reporter::{Reporter, TracingReporter};
use crate::scheduler::StartSlotScheduler;
use crate::session::{Session, SessionError, SessionManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// State shared by every case in a run. Build once, hand out cases.
pub struct Harness {
    config: HarnessConfig,
    scheduler: Arc<StartSlotScheduler>,
}

impl Harness {
    pub fn new(config: HarnessConfig) -> Self {
        let scheduler = Arc::new(StartSlotScheduler::from_config(&config.scheduler));
        Self { config, scheduler }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<StartSlotScheduler> {
        &self.scheduler
    }

    /// A case logging through `tracing` against the configured profile.
    pub fn case(&self, name: &str) -> TestCase {
        let profile = self.config.cluster.profile.clone();
        self.case_with_reporter(Arc::new(TracingReporter::new(name)), profile)
    }

    pub fn case_with_reporter(
        &self,
        reporter: Arc<dyn Reporter>,
        profile: impl Into<String>,
    ) -> TestCase {
        let profile = profile.into();
        let runner = CommandRunner::from_config(reporter.clone(), &self.config.runner);
        let terminator =
            ProcessTreeTerminator::from_config(&self.config.teardown, reporter.clone());
        let sessions = SessionManager::new(reporter.clone(), terminator.clone());
        let cluster = ClusterHelper::new(runner.clone(), &self.config.cluster, profile.clone());
        let source = KubectlSource::new(
            self.config.cluster.kubectl.display().to_string(),
            profile,
            reporter.clone(),
        );
        let poller = ReadinessPoller::new(source.clone(), reporter.clone())
            .with_config(&self.config.readiness)
            .with_diagnostics(source);

        TestCase {
            reporter,
            scheduler: self.scheduler.clone(),
            runner,
            sessions,
            terminator,
            cluster,
            poller,
            cancel: CancellationToken::new(),
        }
    }
}

/// Everything a single test case needs; owned by that case alone.
pub struct TestCase {
    reporter: Arc<dyn Reporter>,
    scheduler: Arc<StartSlotScheduler>,
    runner: CommandRunner,
    sessions: SessionManager,
    terminator: ProcessTreeTerminator,
    cluster: ClusterHelper,
    poller: ReadinessPoller<KubectlSource, KubectlSource>,
    cancel: CancellationToken,
}

impl TestCase {
    pub fn reporter(&self) -> &Arc<dyn Reporter> {
        &self.reporter
    }

    pub fn terminator(&self) -> &ProcessTreeTerminator {
        &self.terminator
    }

    pub fn cluster(&self) -> &ClusterHelper {
        &self.cluster
    }

    /// Cancelling this abandons in-flight commands and sessions of the case.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn wait_for_start_slot(&self) -> Option<Instant> {
        self.scheduler
            .wait_for_start_slot(self.reporter.as_ref())
            .await
    }

    pub async fn run(&self, spec: &CommandSpec) -> Result<CommandResult, CommandError> {
        self.runner.run_with_cancel(spec, &self.cancel).await
    }

    pub fn start(&self, spec: &CommandSpec) -> Result<Session, SessionError> {
        self.sessions.start_with_cancel(spec, &self.cancel)
    }

    pub async fn wait_ready(
        &self,
        namespace: &str,
        selector: &str,
        timeout: Duration,
    ) -> Result<Vec<String>, WaitError> {
        self.poller.wait_ready(namespace, selector, timeout).await
    }

    /// Post-mortem logs on failure, profile deletion, cancellation.
    pub async fn finish(&self, test: &str) {
        self.cluster.cleanup_with_logs(test, &self.cancel).await;
    }
}
