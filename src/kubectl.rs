/// `kubectl`-backed resource status source and post-mortem diagnostics.
use crate::command::{CommandRunner, CommandSpec};
use crate::readiness::{
    Condition, Phase, ResourceDiagnostics, ResourceObservation, ResourceSource, SourceError,
};
use crate::reporter::{NullReporter, Reporter};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: PodMetadata,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Deserialize)]
struct PodMetadata {
    name: String,
    #[serde(default)]
    uid: String,
}

#[derive(Debug, Default, Deserialize)]
struct PodStatus {
    #[serde(default)]
    phase: String,
    #[serde(default)]
    conditions: Vec<PodCondition>,
}

#[derive(Debug, Deserialize)]
struct PodCondition {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

impl From<Pod> for ResourceObservation {
    fn from(pod: Pod) -> Self {
        ResourceObservation {
            name: pod.metadata.name,
            uid: pod.metadata.uid,
            phase: Phase::parse(&pod.status.phase),
            conditions: pod
                .status
                .conditions
                .into_iter()
                .map(|c| Condition {
                    kind: c.kind,
                    reason: c.reason,
                    message: c.message,
                })
                .collect(),
        }
    }
}

/// Parse `kubectl get pods -o json` output, preserving listing order.
pub fn parse_pod_list(json: &[u8]) -> Result<Vec<ResourceObservation>, serde_json::Error> {
    let list: PodList = serde_json::from_slice(json)?;
    Ok(list.items.into_iter().map(ResourceObservation::from).collect())
}

/// Queries pods through `kubectl --context <context>`.
#[derive(Clone)]
pub struct KubectlSource {
    kubectl: String,
    context: String,
    /// Runs the per-poll listing without "(dbg) Run" noise.
    query_runner: CommandRunner,
    /// Runs diagnostics, logging every command.
    runner: CommandRunner,
}

impl KubectlSource {
    pub fn new(
        kubectl: impl Into<String>,
        context: impl Into<String>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            kubectl: kubectl.into(),
            context: context.into(),
            query_runner: CommandRunner::new(Arc::new(NullReporter)),
            runner: CommandRunner::new(reporter),
        }
    }

    fn kubectl<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(self.kubectl.clone())
            .arg("--context")
            .arg(self.context.clone())
            .args(args)
    }

    /// Run a diagnostic command and log its stdout. Returns false on failure.
    async fn log_command(&self, spec: CommandSpec) -> bool {
        let reporter = self.runner.reporter();
        match self.runner.run(&spec).await {
            Ok(rr) => {
                reporter.log(&format!("(dbg) {}:\n{}", rr.command(), rr.stdout_str()));
                true
            }
            Err(e) => {
                reporter.log(&format!("{}: {}", e.result().command(), e));
                false
            }
        }
    }
}

impl ResourceSource for KubectlSource {
    async fn list(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<ResourceObservation>, SourceError> {
        let spec = self.kubectl(["get", "pods", "-n", namespace, "-l", selector, "-o", "json"]);
        let rr = self.query_runner.run(&spec).await?;
        Ok(parse_pod_list(&rr.stdout)?)
    }
}

impl ResourceDiagnostics for KubectlSource {
    async fn dump(&self, namespace: &str, names: &[String]) {
        // If listing fails, kubectl itself is unusable; skip the rest.
        if !self
            .log_command(self.kubectl(["get", "po", "-A", "--show-labels"]))
            .await
        {
            return;
        }
        for name in names {
            self.log_command(self.kubectl(["describe", "po", name.as_str(), "-n", namespace]))
                .await;
            self.log_command(self.kubectl(["logs", name.as_str(), "-n", namespace]))
                .await;
        }
    }
}
