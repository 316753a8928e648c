/// Per-profile cluster helpers used around a test case: host status,
/// profile deletion, and post-mortem log collection.
use crate::command::{CommandRunner, CommandSpec};
use crate::config::ClusterConfig;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct ClusterHelper {
    runner: CommandRunner,
    target: String,
    profile: String,
    cleanup: bool,
    post_mortem_logs: bool,
}

impl ClusterHelper {
    pub fn new(runner: CommandRunner, config: &ClusterConfig, profile: impl Into<String>) -> Self {
        Self {
            runner,
            target: config.target.display().to_string(),
            profile: profile.into(),
            cleanup: config.cleanup,
            post_mortem_logs: config.post_mortem_logs,
        }
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    fn target<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(self.target.clone()).args(args)
    }

    /// Host status of the profile, e.g. "Running" or "Stopped".
    ///
    /// A failing status command is expected for stopped clusters, so the
    /// error is only logged and whatever stdout it produced is returned.
    pub async fn host_status(&self, cancel: &CancellationToken) -> String {
        let spec = self.target(["status", "--format={{.Host}}", "-p", self.profile.as_str()]);
        let rr = match self.runner.run_with_cancel(&spec, cancel).await {
            Ok(rr) => rr,
            Err(e) => {
                self.runner
                    .reporter()
                    .log(&format!("status error: {e} (may be ok)"));
                e.into_result()
            }
        };
        rr.stdout_str().trim().to_string()
    }

    /// Delete the profile (unless cleanup is disabled), then cancel `cancel`.
    pub async fn cleanup(&self, cancel: &CancellationToken) {
        let reporter = self.runner.reporter();
        if self.cleanup {
            let spec = self.target(["delete", "-p", self.profile.as_str()]);
            if let Err(e) = self.runner.run(&spec).await {
                reporter.log(&format!("failed cleanup: {e}"));
            }
        } else {
            reporter.log(&format!(
                "skipping cleanup of {} (cleanup disabled)",
                self.profile
            ));
        }
        cancel.cancel();
    }

    /// Collect problem logs if the test failed, then clean up.
    pub async fn cleanup_with_logs(&self, test: &str, cancel: &CancellationToken) {
        let reporter = self.runner.reporter();
        if reporter.failed() && self.post_mortem_logs {
            reporter.log(&format!("{test} failed, collecting logs ..."));
            let spec = self.target(["-p", self.profile.as_str(), "logs", "--problems"]);
            let rr = match self.runner.run(&spec).await {
                Ok(rr) => rr,
                Err(e) => {
                    reporter.log(&format!("failed logs error: {e}"));
                    e.into_result()
                }
            };
            reporter.log(&format!("{test} logs: {}", rr.stdout_str()));
            reporter.log(&format!("Sorry that {test} failed :("));
        }
        self.cleanup(cancel).await;
    }
}
