//! One pass over every configured cluster
//!
//! Each topic is probed in turn, its latency compared against the cluster's
//! budget, and failing or slow clusters are reported. A failing cluster never
//! stops the sweep and nothing is retried within a sweep.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::alerts::IncidentReporter;
use crate::broker::{Connector, Credentials, Endpoint, TopicName};
use crate::config::{Config, TopicConfig};
use crate::probe::{LatencyProber, ProbeError, RoundTripResult, reported_latency};

pub const DEFAULT_LATENCY_BUDGET_MS: u64 = 2400;

/// First non-zero of the topic override and the configured default, else 2400 ms
pub fn effective_budget(topic_ms: Option<u64>, default_ms: Option<u64>) -> Duration {
    let millis = topic_ms
        .filter(|ms| *ms > 0)
        .or(default_ms.filter(|ms| *ms > 0))
        .unwrap_or(DEFAULT_LATENCY_BUDGET_MS);
    Duration::from_millis(millis)
}

/// A latency equal to the budget is still within it
pub fn exceeds_budget(latency: Duration, budget: Duration) -> bool {
    latency > budget
}

/// Anything that can run one round trip against a topic
#[async_trait]
pub trait LatencyProbe: Send + Sync {
    async fn measure(
        &self,
        endpoint: &Endpoint,
        topic: &TopicName,
        credentials: &Credentials,
    ) -> RoundTripResult;
}

#[async_trait]
impl<C> LatencyProbe for LatencyProber<C>
where
    C: Connector + 'static,
{
    async fn measure(
        &self,
        endpoint: &Endpoint,
        topic: &TopicName,
        credentials: &Credentials,
    ) -> RoundTripResult {
        LatencyProber::measure(self, endpoint, topic, credentials).await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    WithinBudget,
    OverBudget,
    ProbeFailed(ProbeError),
}

/// What one sweep found for one cluster
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterReport {
    pub cluster: String,
    /// Measured latency, the failure sentinel when the probe failed
    pub latency: Duration,
    pub budget: Duration,
    pub verdict: Verdict,
}

impl ClusterReport {
    fn new(cluster: String, result: RoundTripResult, budget: Duration) -> Self {
        let latency = reported_latency(&result);
        let verdict = match result {
            Err(e) => Verdict::ProbeFailed(e),
            Ok(latency) if exceeds_budget(latency, budget) => Verdict::OverBudget,
            Ok(_) => Verdict::WithinBudget,
        };

        Self {
            cluster,
            latency,
            budget,
            verdict,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.verdict == Verdict::WithinBudget
    }

    /// Incident text for this cluster, `None` when it is healthy
    pub fn alert_message(&self) -> Option<String> {
        match &self.verdict {
            Verdict::WithinBudget => None,
            Verdict::OverBudget => Some(format!(
                "cluster {} latency {:?} over budget {:?}",
                self.cluster, self.latency, self.budget
            )),
            Verdict::ProbeFailed(e) => Some(format!("cluster {} probe error: {e}", self.cluster)),
        }
    }
}

impl fmt::Display for ClusterReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.verdict {
            Verdict::WithinBudget => write!(
                f,
                "{}: {:?} (budget {:?})",
                self.cluster, self.latency, self.budget
            ),
            Verdict::OverBudget => write!(
                f,
                "{}: {:?} over budget {:?}",
                self.cluster, self.latency, self.budget
            ),
            Verdict::ProbeFailed(e) => write!(f, "{}: failed ({e})", self.cluster),
        }
    }
}

/// Reporting name of a topic: its configured name, else the endpoint host
pub fn cluster_name(topic: &TopicConfig) -> String {
    if let Some(name) = topic.name.as_ref().filter(|name| !name.is_empty()) {
        return name.clone();
    }

    Endpoint::parse(&topic.pulsar_url)
        .map(|endpoint| endpoint.display_name())
        .unwrap_or_else(|_| topic.pulsar_url.clone())
}

pub struct SweepDriver<P, R> {
    prober: P,
    reporter: R,
}

impl<P: LatencyProbe, R: IncidentReporter> SweepDriver<P, R> {
    pub fn new(prober: P, reporter: R) -> Self {
        Self { prober, reporter }
    }

    pub fn prober(&self) -> &P {
        &self.prober
    }

    pub fn reporter(&self) -> &R {
        &self.reporter
    }

    /// Probe every topic of `config` in order and report the unhealthy ones
    #[instrument(skip_all, fields(monitor = %config.name))]
    pub async fn run_sweep(&self, config: &Config) -> Vec<ClusterReport> {
        info!("sweeping {} clusters", config.topics.len());

        let mut reports = Vec::with_capacity(config.topics.len());
        for topic in &config.topics {
            let report = self.probe_topic(config, topic).await;

            if let Some(message) = report.alert_message() {
                warn!("{message}");
                self.reporter.report_incident(&message).await;
            } else {
                debug!("{report}");
            }

            reports.push(report);
        }

        let unhealthy = reports.iter().filter(|report| !report.is_healthy()).count();
        info!("sweep finished, {unhealthy} of {} clusters unhealthy", reports.len());

        reports
    }

    async fn probe_topic(&self, config: &Config, topic: &TopicConfig) -> ClusterReport {
        let cluster = cluster_name(topic);
        let budget = effective_budget(topic.latency_budget_ms, config.latency_budget_ms);
        debug!("probing {cluster} against budget {budget:?}");

        let endpoint = match Endpoint::parse(&topic.pulsar_url) {
            Ok(endpoint) => endpoint,
            Err(e) => return ClusterReport::new(cluster, Err(ProbeError::Setup(e)), budget),
        };
        let topic_name = match TopicName::parse(&topic.topic_name) {
            Ok(topic_name) => topic_name,
            Err(e) => return ClusterReport::new(cluster, Err(ProbeError::Setup(e)), budget),
        };

        let result = self
            .prober
            .measure(&endpoint, &topic_name, &topic.credentials(config))
            .await;
        info!("{cluster} latency {:?}", reported_latency(&result));

        ClusterReport::new(cluster, result, budget)
    }
}
