/// Readiness polling: wait until a label-selected group of cluster resources
/// is either finished successfully or has been running continuously for a
/// minimum uptime.
///
/// The poller queries immediately and then once per interval until the
/// deadline. Query failures and empty listings are not errors; they only
/// reset the stability window. On timeout the names seen so far are returned
/// inside the error and a diagnostic dump is triggered.
use crate::command::CommandError;
use crate::config::ReadinessConfig;
use crate::reporter::Reporter;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Lifecycle phase reported for a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Pending,
    /// Active, not yet terminal.
    Running,
    /// Finished successfully; will not be restarted.
    Succeeded,
    Failed,
    Unknown(String),
}

impl Phase {
    pub fn parse(s: &str) -> Self {
        match s {
            "Pending" => Phase::Pending,
            "Running" => Phase::Running,
            "Succeeded" => Phase::Succeeded,
            "Failed" => Phase::Failed,
            other => Phase::Unknown(other.to_string()),
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Pending => write!(f, "Pending"),
            Phase::Running => write!(f, "Running"),
            Phase::Succeeded => write!(f, "Succeeded"),
            Phase::Failed => write!(f, "Failed"),
            Phase::Unknown(s) => write!(f, "{s}"),
        }
    }
}

/// One diagnostic condition entry on a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Condition {
    pub kind: String,
    pub reason: String,
    pub message: String,
}

/// Snapshot of one resource from a single poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceObservation {
    pub name: String,
    pub uid: String,
    pub phase: Phase,
    pub conditions: Vec<Condition>,
}

impl ResourceObservation {
    pub fn new(name: impl Into<String>, phase: Phase) -> Self {
        Self {
            name: name.into(),
            uid: String::new(),
            phase,
            conditions: Vec::new(),
        }
    }

    /// Human-readable status line, e.g.
    /// `"dns-1" [abc] Pending: Ready:ContainersNotReady (containers not ready)`.
    pub fn status_message(&self) -> String {
        let mut out = format!("{:?} [{}] {}", self.name, self.uid, self.phase);
        for (i, c) in self.conditions.iter().enumerate() {
            if !c.reason.is_empty() {
                out.push_str(if i == 0 { ": " } else { " / " });
                out.push_str(&format!("{}:{}", c.kind, c.reason));
            }
            if !c.message.is_empty() {
                out.push_str(&format!(" ({})", c.message));
            }
        }
        out
    }
}

/// Errors from a resource status query. The poller absorbs these.
#[derive(Debug)]
pub enum SourceError {
    Command(CommandError),
    Parse(serde_json::Error),
    Unavailable(String),
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::Command(e) => write!(f, "status query failed: {e}"),
            SourceError::Parse(e) => write!(f, "malformed status response: {e}"),
            SourceError::Unavailable(msg) => write!(f, "status source unavailable: {msg}"),
        }
    }
}

impl std::error::Error for SourceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SourceError::Command(e) => Some(e),
            SourceError::Parse(e) => Some(e),
            SourceError::Unavailable(_) => None,
        }
    }
}

impl From<CommandError> for SourceError {
    fn from(e: CommandError) -> Self {
        SourceError::Command(e)
    }
}

impl From<serde_json::Error> for SourceError {
    fn from(e: serde_json::Error) -> Self {
        SourceError::Parse(e)
    }
}

/// Lists the resources matching a label selector in a namespace.
pub trait ResourceSource: Send + Sync {
    fn list(
        &self,
        namespace: &str,
        selector: &str,
    ) -> impl Future<Output = Result<Vec<ResourceObservation>, SourceError>> + Send;
}

/// Produces post-mortem output for resources that never became ready.
pub trait ResourceDiagnostics: Send + Sync {
    fn dump(&self, namespace: &str, names: &[String]) -> impl Future<Output = ()> + Send;
}

/// Diagnostics that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDiagnostics;

impl ResourceDiagnostics for NoDiagnostics {
    async fn dump(&self, _namespace: &str, _names: &[String]) {}
}

/// Readiness wait failure.
#[derive(Debug)]
pub enum WaitError {
    Timeout {
        selector: String,
        timeout: Duration,
        /// Every resource name observed, ready or not.
        names: Vec<String>,
    },
}

impl WaitError {
    pub fn names(&self) -> &[String] {
        match self {
            WaitError::Timeout { names, .. } => names,
        }
    }
}

impl std::fmt::Display for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitError::Timeout {
                selector, timeout, ..
            } => write!(
                f,
                "{selector} within {timeout:?}: timed out waiting for the condition"
            ),
        }
    }
}

impl std::error::Error for WaitError {}

/// Per-invocation polling state.
struct ReadinessTracker {
    min_uptime: Duration,
    /// When the group was first seen fully running, if it still is.
    running_since: Option<Instant>,
    last_messages: HashMap<String, String>,
    found: BTreeSet<String>,
}

impl ReadinessTracker {
    fn new(min_uptime: Duration) -> Self {
        Self {
            min_uptime,
            running_since: None,
            last_messages: HashMap::new(),
            found: BTreeSet::new(),
        }
    }

    fn reset(&mut self) {
        self.running_since = None;
    }

    fn names(&self) -> Vec<String> {
        self.found.iter().cloned().collect()
    }

    /// Evaluate one snapshot. Returns true once the wait is satisfied.
    fn observe(
        &mut self,
        now: Instant,
        selector: &str,
        items: &[ResourceObservation],
        reporter: &dyn Reporter,
    ) -> bool {
        if items.is_empty() {
            self.reset();
            return false;
        }

        for item in items {
            self.found.insert(item.name.clone());
            let msg = item.status_message();
            // Prevent spamming logs with identical messages
            if self.last_messages.get(&item.name) != Some(&msg) {
                reporter.log(&msg);
                self.last_messages.insert(item.name.clone(), msg);
            }
        }

        for item in items {
            match item.phase {
                Phase::Succeeded => return true,
                Phase::Running => {}
                _ => {
                    if let Some(since) = self.running_since {
                        reporter.log(&format!(
                            "WARNING: {selector} was running {:?} ago - may be unstable",
                            now - since
                        ));
                    }
                    self.reset();
                    return false;
                }
            }
        }

        let since = *self.running_since.get_or_insert(now);
        now - since >= self.min_uptime
    }
}

/// Waits for labeled resources to become ready.
pub struct ReadinessPoller<S, D = NoDiagnostics> {
    source: S,
    diagnostics: D,
    reporter: Arc<dyn Reporter>,
    interval: Duration,
    min_uptime: Duration,
}

impl<S: ResourceSource> ReadinessPoller<S, NoDiagnostics> {
    pub fn new(source: S, reporter: Arc<dyn Reporter>) -> Self {
        Self {
            source,
            diagnostics: NoDiagnostics,
            reporter,
            interval: Duration::from_millis(500),
            min_uptime: Duration::from_secs(5),
        }
    }
}

impl<S: ResourceSource, D: ResourceDiagnostics> ReadinessPoller<S, D> {
    pub fn with_diagnostics<D2: ResourceDiagnostics>(
        self,
        diagnostics: D2,
    ) -> ReadinessPoller<S, D2> {
        ReadinessPoller {
            source: self.source,
            diagnostics,
            reporter: self.reporter,
            interval: self.interval,
            min_uptime: self.min_uptime,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_min_uptime(mut self, min_uptime: Duration) -> Self {
        self.min_uptime = min_uptime;
        self
    }

    pub fn with_config(self, config: &ReadinessConfig) -> Self {
        self.with_interval(config.poll_interval())
            .with_min_uptime(config.min_uptime())
    }

    /// Poll until the resources matching `selector` in `namespace` are ready
    /// or `timeout` elapses. Returns the distinct resource names observed.
    pub async fn wait_ready(
        &self,
        namespace: &str,
        selector: &str,
        timeout: Duration,
    ) -> Result<Vec<String>, WaitError> {
        self.reporter.log(&format!(
            "(dbg) waiting for pods with labels {selector:?} in namespace {namespace:?} ..."
        ));
        let start = Instant::now();
        let mut tracker = ReadinessTracker::new(self.min_uptime);

        let outcome = tokio::time::timeout(
            timeout,
            self.poll_until_ready(namespace, selector, &mut tracker),
        )
        .await;
        let names = tracker.names();

        match outcome {
            Ok(()) => {
                self.reporter.log(&format!(
                    "(dbg) pods {selector} up and healthy within {:?}",
                    start.elapsed()
                ));
                tracing::info!(selector, namespace, count = names.len(), "resources ready");
                Ok(names)
            }
            Err(_) => {
                let err = WaitError::Timeout {
                    selector: selector.to_string(),
                    timeout,
                    names,
                };
                self.reporter
                    .log(&format!("pod {selector:?} failed to start: {err}"));
                tracing::warn!(
                    selector,
                    namespace,
                    timeout_secs = timeout.as_secs_f64(),
                    "readiness wait timed out"
                );
                self.diagnostics.dump(namespace, err.names()).await;
                Err(err)
            }
        }
    }

    async fn poll_until_ready(
        &self,
        namespace: &str,
        selector: &str,
        tracker: &mut ReadinessTracker,
    ) {
        loop {
            match self.source.list(namespace, selector).await {
                Ok(items) => {
                    if tracker.observe(Instant::now(), selector, &items, self.reporter.as_ref()) {
                        return;
                    }
                }
                Err(e) => {
                    // Retried on the next tick, e.g. while the apiserver is rescheduled.
                    self.reporter.log(&format!(
                        "WARNING: pod list for {namespace:?} {selector:?} returned: {e}"
                    ));
                    tracker.reset();
                }
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::MemoryReporter;
    use std::sync::Mutex;

    /// Replays one scripted response per poll, repeating the last forever.
    struct ScriptedSource {
        script: Vec<Result<Vec<ResourceObservation>, String>>,
        polls: Mutex<usize>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<Vec<ResourceObservation>, String>>) -> Self {
            Self {
                script,
                polls: Mutex::new(0),
            }
        }

        fn polls(&self) -> usize {
            *self.polls.lock().unwrap()
        }
    }

    impl ResourceSource for &ScriptedSource {
        async fn list(
            &self,
            _namespace: &str,
            _selector: &str,
        ) -> Result<Vec<ResourceObservation>, SourceError> {
            let mut polls = self.polls.lock().unwrap();
            let idx = (*polls).min(self.script.len() - 1);
            *polls += 1;
            self.script[idx].clone().map_err(SourceError::Unavailable)
        }
    }

    #[derive(Default)]
    struct RecordingDiagnostics {
        dumped: Mutex<Vec<Vec<String>>>,
    }

    impl ResourceDiagnostics for &RecordingDiagnostics {
        async fn dump(&self, _namespace: &str, names: &[String]) {
            self.dumped.lock().unwrap().push(names.to_vec());
        }
    }

    fn running(names: &[&str]) -> Result<Vec<ResourceObservation>, String> {
        Ok(names
            .iter()
            .map(|n| ResourceObservation::new(*n, Phase::Running))
            .collect())
    }

    fn pending(names: &[&str]) -> Result<Vec<ResourceObservation>, String> {
        Ok(names
            .iter()
            .map(|n| ResourceObservation::new(*n, Phase::Pending))
            .collect())
    }

    /// Paused-clock sleeps land on millisecond ticks; allow for rounding.
    fn assert_elapsed(start: Instant, expected: Duration) {
        let elapsed = start.elapsed();
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(50),
            "elapsed {elapsed:?}, expected {expected:?}"
        );
    }

    fn poller<'a>(
        source: &'a ScriptedSource,
        reporter: Arc<MemoryReporter>,
    ) -> ReadinessPoller<&'a ScriptedSource> {
        ReadinessPoller::new(source, reporter)
            .with_interval(Duration::from_millis(500))
            .with_min_uptime(Duration::from_secs(5))
    }

    #[test]
    fn test_status_message_formats_conditions() {
        let obs = ResourceObservation {
            name: "coredns-1".to_string(),
            uid: "u-1".to_string(),
            phase: Phase::Pending,
            conditions: vec![
                Condition {
                    kind: "PodScheduled".to_string(),
                    reason: "Unschedulable".to_string(),
                    message: "0/1 nodes are available".to_string(),
                },
                Condition {
                    kind: "Ready".to_string(),
                    reason: "ContainersNotReady".to_string(),
                    message: String::new(),
                },
            ],
        };
        assert_eq!(
            obs.status_message(),
            "\"coredns-1\" [u-1] Pending: PodScheduled:Unschedulable (0/1 nodes are available) / Ready:ContainersNotReady"
        );
    }

    #[test]
    fn test_phase_parse_and_display() {
        assert_eq!(Phase::parse("Running"), Phase::Running);
        assert_eq!(Phase::parse("Succeeded"), Phase::Succeeded);
        assert_eq!(Phase::parse("Weird"), Phase::Unknown("Weird".to_string()));
        assert_eq!(Phase::Unknown("Weird".to_string()).to_string(), "Weird");
        assert_eq!(Phase::Failed.to_string(), "Failed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_running_succeeds_after_stability_window() {
        let source = ScriptedSource::new(vec![running(&["a", "b", "c"])]);
        let reporter = Arc::new(MemoryReporter::new());
        let start = Instant::now();
        let names = poller(&source, reporter.clone())
            .wait_ready("default", "app=web", Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(names, vec!["a", "b", "c"]);
        assert_elapsed(start, Duration::from_secs(5));
        assert_eq!(source.polls(), 11);
        assert!(reporter.contains("up and healthy"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_polls_do_not_count_toward_window() {
        let mut script = vec![pending(&["web-0"]); 4];
        script.extend(vec![running(&["web-0"]); 12]);
        let source = ScriptedSource::new(script);
        let reporter = Arc::new(MemoryReporter::new());
        let start = Instant::now();
        let names = poller(&source, reporter)
            .wait_ready("default", "app=web", Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(names, vec!["web-0"]);
        // Running from t=2s, stable 5s later.
        assert_elapsed(start, Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_regression_resets_window() {
        // Running for 4.5s, one pending blip, then running for good.
        let mut script = vec![running(&["web-0"]); 10];
        script.push(pending(&["web-0"]));
        script.push(running(&["web-0"]));
        let source = ScriptedSource::new(script);
        let reporter = Arc::new(MemoryReporter::new());
        let start = Instant::now();
        poller(&source, reporter.clone())
            .wait_ready("default", "app=web", Duration::from_secs(30))
            .await
            .unwrap();

        // Blip at t=5.0s, window restarts at t=5.5s.
        assert_elapsed(start, Duration::from_millis(10_500));
        assert!(reporter.contains("may be unstable"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flapping_resource_never_succeeds() {
        let script: Vec<_> = (0..100)
            .map(|i| {
                if i % 2 == 0 {
                    running(&["flaky"])
                } else {
                    pending(&["flaky"])
                }
            })
            .collect();
        let source = ScriptedSource::new(script);
        let reporter = Arc::new(MemoryReporter::new());
        let err = poller(&source, reporter)
            .wait_ready("default", "app=flaky", Duration::from_secs(20))
            .await
            .unwrap_err();
        assert_eq!(err.names(), ["flaky".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeded_resource_short_circuits() {
        let source = ScriptedSource::new(vec![Ok(vec![
            ResourceObservation::new("job-1", Phase::Succeeded),
            ResourceObservation::new("job-2", Phase::Pending),
        ])]);
        let reporter = Arc::new(MemoryReporter::new());
        let start = Instant::now();
        let names = poller(&source, reporter)
            .wait_ready("default", "job=batch", Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(names, vec!["job-1", "job-2"]);
        assert_elapsed(start, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_errors_are_retried() {
        let mut script = vec![running(&["api"]); 4];
        script.push(Err("connection refused".to_string()));
        script.push(running(&["api"]));
        let source = ScriptedSource::new(script);
        let reporter = Arc::new(MemoryReporter::new());
        let start = Instant::now();
        poller(&source, reporter.clone())
            .wait_ready("kube-system", "component=api", Duration::from_secs(30))
            .await
            .unwrap();

        // Error at t=2.0s resets the window; restart at t=2.5s.
        assert_elapsed(start, Duration::from_millis(7500));
        assert!(reporter.contains("WARNING: pod list for \"kube-system\""));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_listing_resets_window() {
        let mut script = vec![running(&["api"]); 8];
        script.push(Ok(Vec::new()));
        script.push(running(&["api"]));
        let source = ScriptedSource::new(script);
        let reporter = Arc::new(MemoryReporter::new());
        let start = Instant::now();
        let names = poller(&source, reporter)
            .wait_ready("kube-system", "component=api", Duration::from_secs(30))
            .await
            .unwrap();

        // Window started at t=0, emptied at t=4.0s, restarts at t=4.5s.
        assert_elapsed(start, Duration::from_millis(9500));
        assert_eq!(names, vec!["api"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mixed_snapshot_resets_window() {
        let mixed = Ok(vec![
            ResourceObservation::new("web-0", Phase::Running),
            ResourceObservation::new("web-1", Phase::Pending),
        ]);
        let mut script = vec![running(&["web-0", "web-1"]); 6];
        script.push(mixed);
        script.push(running(&["web-0", "web-1"]));
        let source = ScriptedSource::new(script);
        let reporter = Arc::new(MemoryReporter::new());
        let start = Instant::now();
        poller(&source, reporter.clone())
            .wait_ready("default", "app=web", Duration::from_secs(30))
            .await
            .unwrap();

        // Pending web-1 at t=3.0s resets the group window; restart at t=3.5s.
        assert_elapsed(start, Duration::from_millis(8500));
        assert!(reporter.contains("may be unstable"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistently_mixed_snapshot_never_succeeds() {
        let source = ScriptedSource::new(vec![Ok(vec![
            ResourceObservation::new("web-0", Phase::Running),
            ResourceObservation::new("web-1", Phase::Pending),
        ])]);
        let reporter = Arc::new(MemoryReporter::new());
        let err = poller(&source, reporter)
            .wait_ready("default", "app=web", Duration::from_secs(10))
            .await
            .unwrap_err();
        assert_eq!(err.names(), ["web-0".to_string(), "web-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_resources_times_out_with_dump() {
        let source = ScriptedSource::new(vec![Ok(Vec::new())]);
        let diagnostics = RecordingDiagnostics::default();
        let reporter = Arc::new(MemoryReporter::new());
        let start = Instant::now();
        let err = poller(&source, reporter.clone())
            .with_diagnostics(&diagnostics)
            .wait_ready("default", "app=ghost", Duration::from_secs(2))
            .await
            .unwrap_err();

        assert_elapsed(start, Duration::from_secs(2));
        assert!(err.names().is_empty());
        let msg = err.to_string();
        assert!(msg.contains("app=ghost within 2s"));
        assert!(msg.contains("timed out"));
        assert_eq!(*diagnostics.dumped.lock().unwrap(), vec![Vec::<String>::new()]);
        assert!(reporter.contains("failed to start"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_unready_names() {
        let source = ScriptedSource::new(vec![pending(&["b", "a"])]);
        let diagnostics = RecordingDiagnostics::default();
        let reporter = Arc::new(MemoryReporter::new());
        let err = poller(&source, reporter)
            .with_diagnostics(&diagnostics)
            .wait_ready("default", "app=stuck", Duration::from_secs(3))
            .await
            .unwrap_err();
        assert_eq!(err.names(), ["a".to_string(), "b".to_string()]);
        assert_eq!(diagnostics.dumped.lock().unwrap()[0], vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_status_lines_are_logged_once() {
        let source = ScriptedSource::new(vec![running(&["solo"])]);
        let reporter = Arc::new(MemoryReporter::new());
        poller(&source, reporter.clone())
            .wait_ready("default", "app=solo", Duration::from_secs(30))
            .await
            .unwrap();
        let status_lines = reporter
            .lines()
            .iter()
            .filter(|l| l.starts_with("\"solo\""))
            .count();
        assert_eq!(status_lines, 1);
    }
}
