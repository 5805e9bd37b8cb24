// src/filter/chain.rs
use super::context::RequestContext;
use crate::error::GatewayError;
use crate::metrics::MetricsCollector;
use async_trait::async_trait;
use futures::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Pre,
    Route,
    Post,
    Error,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pre => "pre",
            Phase::Route => "route",
            Phase::Post => "post",
            Phase::Error => "error",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of the request pipeline.
///
/// `execute` may return an error, or place one in the context directly;
/// both move the chain to the error phase.
#[async_trait]
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;

    fn phase(&self) -> Phase;

    fn order(&self) -> i32;

    fn applies(&self, _ctx: &RequestContext) -> bool {
        true
    }

    async fn execute(&self, ctx: &mut RequestContext) -> anyhow::Result<()>;
}

/// How a chain run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOutcome {
    Completed,
    /// The error phase ran.
    CompletedWithError,
}

struct FilterEntry {
    name: String,
    order: i32,
    filter: Arc<dyn Filter>,
}

/// Filters grouped by phase. Mutable only until it is shared behind an `Arc`.
#[derive(Default)]
pub struct FilterChain {
    pre: Vec<FilterEntry>,
    route: Vec<FilterEntry>,
    post: Vec<FilterEntry>,
    error: Vec<FilterEntry>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain")
            .field("pre", &self.names(Phase::Pre))
            .field("route", &self.names(Phase::Route))
            .field("post", &self.names(Phase::Post))
            .field("error", &self.names(Phase::Error))
            .finish()
    }
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register under the filter's own name, phase and order.
    pub fn register(&mut self, filter: Arc<dyn Filter>) {
        let name = filter.name().to_string();
        let phase = filter.phase();
        let order = filter.order();
        self.register_as(name, phase, order, filter);
    }

    /// Register with explicit placement. Equal orders keep registration
    /// sequence.
    pub fn register_as(
        &mut self,
        name: impl Into<String>,
        phase: Phase,
        order: i32,
        filter: Arc<dyn Filter>,
    ) {
        let name = name.into();
        debug!(filter = %name, %phase, order, "Registered filter");
        let entries = self.phase_mut(phase);
        entries.push(FilterEntry { name, order, filter });
        // stable sort keeps ties in registration order
        entries.sort_by_key(|entry| entry.order);
    }

    pub fn names(&self, phase: Phase) -> Vec<&str> {
        self.phase_entries(phase)
            .iter()
            .map(|entry| entry.name.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pre.len() + self.route.len() + self.post.len() + self.error.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn run(&self, ctx: &mut RequestContext) -> ChainOutcome {
        if ctx.has_error() {
            // failed before the first filter, e.g. while reading the body
            self.run_error_phase(ctx).await;
            return ChainOutcome::CompletedWithError;
        }
        for phase in [Phase::Pre, Phase::Route, Phase::Post] {
            if ctx.response_sent() {
                debug!(%phase, "Response already sent, skipping phase");
                break;
            }
            if !self.run_phase(phase, ctx).await {
                self.run_error_phase(ctx).await;
                return ChainOutcome::CompletedWithError;
            }
        }
        ChainOutcome::Completed
    }

    /// Runs one non-error phase. Returns false once the context carries an
    /// error.
    async fn run_phase(&self, phase: Phase, ctx: &mut RequestContext) -> bool {
        for entry in self.phase_entries(phase) {
            if ctx.response_sent() {
                break;
            }
            if !entry.filter.applies(ctx) {
                continue;
            }

            if let Err(failure) = Self::execute(entry, ctx).await {
                error!(filter = %entry.name, %phase, "Filter failed: {}", failure);
                if let Some(metrics) = &self.metrics {
                    metrics.record_filter_failure(&entry.name);
                }
                ctx.set_error(failure);
            }
            if ctx.has_error() {
                return false;
            }
        }
        true
    }

    async fn run_error_phase(&self, ctx: &mut RequestContext) {
        for entry in &self.error {
            if !entry.filter.applies(ctx) {
                continue;
            }
            if let Err(failure) = Self::execute(entry, ctx).await {
                // the original error stays in the slot
                warn!(filter = %entry.name, "Error filter failed: {}", failure);
                if let Some(metrics) = &self.metrics {
                    metrics.record_filter_failure(&entry.name);
                }
            }
        }
    }

    async fn execute(entry: &FilterEntry, ctx: &mut RequestContext) -> Result<(), GatewayError> {
        let outcome = AssertUnwindSafe(entry.filter.execute(ctx)).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(GatewayError::FilterExecutionFailure {
                filter: entry.name.clone(),
                reason: format!("{:#}", e),
            }),
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panicked".to_string());
                Err(GatewayError::FilterExecutionFailure {
                    filter: entry.name.clone(),
                    reason,
                })
            }
        }
    }

    fn phase_entries(&self, phase: Phase) -> &[FilterEntry] {
        match phase {
            Phase::Pre => &self.pre,
            Phase::Route => &self.route,
            Phase::Post => &self.post,
            Phase::Error => &self.error,
        }
    }

    fn phase_mut(&mut self, phase: Phase) -> &mut Vec<FilterEntry> {
        match phase {
            Phase::Pre => &mut self.pre,
            Phase::Route => &mut self.route,
            Phase::Post => &mut self.post,
            Phase::Error => &mut self.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::context::InboundRequest;
    use hyper::{Method, StatusCode, Uri};
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    #[derive(Clone, Copy)]
    enum Action {
        Nothing,
        SendResponse,
        Fail,
        SendThenFail,
        Panic,
        Handle,
    }

    struct Recording {
        name: &'static str,
        phase: Phase,
        order: i32,
        applies: bool,
        action: Action,
        log: Log,
    }

    impl Recording {
        fn new(name: &'static str, phase: Phase, order: i32, log: &Log) -> Self {
            Self {
                name,
                phase,
                order,
                applies: true,
                action: Action::Nothing,
                log: log.clone(),
            }
        }

        fn action(mut self, action: Action) -> Self {
            self.action = action;
            self
        }

        fn skipped(mut self) -> Self {
            self.applies = false;
            self
        }

        fn boxed(self) -> Arc<dyn Filter> {
            Arc::new(self)
        }
    }

    #[async_trait]
    impl Filter for Recording {
        fn name(&self) -> &str {
            self.name
        }

        fn phase(&self) -> Phase {
            self.phase
        }

        fn order(&self) -> i32 {
            self.order
        }

        fn applies(&self, _ctx: &RequestContext) -> bool {
            self.applies
        }

        async fn execute(&self, ctx: &mut RequestContext) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(self.name.to_string());
            match self.action {
                Action::Nothing => Ok(()),
                Action::SendResponse => {
                    ctx.set_response_status(StatusCode::UNAUTHORIZED);
                    ctx.set_response_sent();
                    Ok(())
                }
                Action::SendThenFail => {
                    ctx.set_response_sent();
                    anyhow::bail!("rejected")
                }
                Action::Fail => anyhow::bail!("boom"),
                Action::Panic => panic!("filter exploded"),
                Action::Handle => {
                    ctx.set_response_status(StatusCode::IM_A_TEAPOT);
                    ctx.mark_error_handled();
                    Ok(())
                }
            }
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::new(InboundRequest::new(Method::GET, Uri::from_static("/")))
    }

    fn log() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_ascending_order_with_stable_ties() {
        let log = log();
        let mut chain = FilterChain::new();
        chain.register(Recording::new("late", Phase::Pre, 20, &log).boxed());
        chain.register(Recording::new("tie-first", Phase::Pre, 10, &log).boxed());
        chain.register(Recording::new("tie-second", Phase::Pre, 10, &log).boxed());

        let outcome = chain.run(&mut ctx()).await;
        assert_eq!(outcome, ChainOutcome::Completed);
        assert_eq!(entries(&log), vec!["tie-first", "tie-second", "late"]);
    }

    #[tokio::test]
    async fn test_phases_run_in_fixed_order() {
        let log = log();
        let mut chain = FilterChain::new();
        chain.register(Recording::new("post", Phase::Post, 0, &log).boxed());
        chain.register(Recording::new("error", Phase::Error, 0, &log).boxed());
        chain.register(Recording::new("route", Phase::Route, 0, &log).boxed());
        chain.register(Recording::new("pre", Phase::Pre, 0, &log).boxed());

        chain.run(&mut ctx()).await;
        assert_eq!(entries(&log), vec!["pre", "route", "post"]);
    }

    #[tokio::test]
    async fn test_non_applying_filter_never_executes() {
        let log = log();
        let mut chain = FilterChain::new();
        chain.register(Recording::new("skip-me", Phase::Pre, 0, &log).skipped().boxed());
        chain.register(Recording::new("run-me", Phase::Pre, 1, &log).boxed());

        chain.run(&mut ctx()).await;
        assert_eq!(entries(&log), vec!["run-me"]);
    }

    #[tokio::test]
    async fn test_response_sent_skips_route_and_post() {
        let log = log();
        let mut chain = FilterChain::new();
        chain.register(Recording::new("auth", Phase::Pre, 0, &log).action(Action::SendResponse).boxed());
        chain.register(Recording::new("after-auth", Phase::Pre, 1, &log).boxed());
        chain.register(Recording::new("route", Phase::Route, 0, &log).boxed());
        chain.register(Recording::new("post", Phase::Post, 0, &log).boxed());

        let mut ctx = ctx();
        assert_eq!(chain.run(&mut ctx).await, ChainOutcome::Completed);
        assert_eq!(entries(&log), vec!["auth"]);
        assert_eq!(ctx.response_status(), Some(StatusCode::UNAUTHORIZED));
    }

    #[tokio::test]
    async fn test_failure_jumps_to_error_phase() {
        let log = log();
        let mut chain = FilterChain::new();
        chain.register(Recording::new("broken", Phase::Pre, 0, &log).action(Action::Fail).boxed());
        chain.register(Recording::new("never", Phase::Pre, 1, &log).boxed());
        chain.register(Recording::new("route", Phase::Route, 0, &log).boxed());
        chain.register(Recording::new("error-a", Phase::Error, 0, &log).boxed());
        chain.register(Recording::new("error-b", Phase::Error, 5, &log).action(Action::Handle).boxed());

        let mut ctx = ctx();
        assert_eq!(chain.run(&mut ctx).await, ChainOutcome::CompletedWithError);
        assert_eq!(entries(&log), vec!["broken", "error-a", "error-b"]);
        assert!(ctx.error_handled());
        match ctx.error() {
            Some(GatewayError::FilterExecutionFailure { filter, reason }) => {
                assert_eq!(filter, "broken");
                assert_eq!(reason, "boom");
            }
            other => panic!("unexpected error slot: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_error_filters_still_run_after_response_sent() {
        let log = log();
        let mut chain = FilterChain::new();
        chain.register(Recording::new("reject", Phase::Pre, 0, &log).action(Action::SendThenFail).boxed());
        chain.register(Recording::new("route", Phase::Route, 0, &log).boxed());
        chain.register(Recording::new("error", Phase::Error, 0, &log).boxed());

        let mut ctx = ctx();
        assert_eq!(chain.run(&mut ctx).await, ChainOutcome::CompletedWithError);
        assert_eq!(entries(&log), vec!["reject", "error"]);
        assert!(ctx.response_sent());
    }

    #[tokio::test]
    async fn test_panicking_filter_is_captured() {
        let log = log();
        let mut chain = FilterChain::new();
        chain.register(Recording::new("explodes", Phase::Route, 0, &log).action(Action::Panic).boxed());
        chain.register(Recording::new("post", Phase::Post, 0, &log).boxed());

        let mut ctx = ctx();
        assert_eq!(chain.run(&mut ctx).await, ChainOutcome::CompletedWithError);
        assert_eq!(entries(&log), vec!["explodes"]);
        match ctx.error() {
            Some(GatewayError::FilterExecutionFailure { reason, .. }) => {
                assert_eq!(reason, "filter exploded")
            }
            other => panic!("unexpected error slot: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_register_as_overrides_placement() {
        let log = log();
        let mut chain = FilterChain::new();
        chain.register(Recording::new("a", Phase::Pre, 5, &log).boxed());
        chain.register_as("moved", Phase::Pre, 1, Recording::new("b", Phase::Post, 99, &log).boxed());

        assert_eq!(chain.names(Phase::Pre), vec!["moved", "a"]);
        assert!(chain.names(Phase::Post).is_empty());
        assert_eq!(chain.len(), 2);
    }
}
