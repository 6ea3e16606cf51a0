//! The coverage run: trace, workload, wait, read, tear down, segment,
//! correlate, aggregate.

use crate::config::CoverageConfig;
use crate::correlate::{EventCorrelator, SegmentedObject};
use crate::coverage::{aggregate, CoverageResult};
use crate::diagnostics::{Diagnostic, DiagnosticSink, LogSink, NoopSink, Outcome, Stage};
use crate::error::{ConfigError, SessionError, WorkloadError};
use crate::filter::ExcludeFilter;
use crate::gateway::{DatabaseGateway, SqlcmdGateway};
use crate::runner::{CommandRunner, ProcessRunner};
use crate::segment::SourceSegmenter;
use crate::trace::{FixedDelay, TraceFactory, TraceSession, TraceSource, WaitPolicy, XEventTrace};
use crate::types::{ObjectRef, SourceObject};

use log::debug;
use rayon::prelude::*;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

pub struct CodeCoverage {
    config: CoverageConfig,
    filter: ExcludeFilter,
    gateway: Arc<dyn DatabaseGateway>,
    tracer: Box<dyn TraceFactory>,
    runner: Box<dyn ProcessRunner>,
    wait: Box<dyn WaitPolicy>,
    sink: Arc<dyn DiagnosticSink>,
    session: Option<TraceSession>,
    /// Diagnostics of the run in progress
    pending: Vec<Diagnostic>,
    result: Arc<CoverageResult>,
}

pub struct CodeCoverageBuilder {
    config: CoverageConfig,
    gateway: Arc<dyn DatabaseGateway>,
    tracer: Option<Box<dyn TraceFactory>>,
    runner: Option<Box<dyn ProcessRunner>>,
    wait: Option<Box<dyn WaitPolicy>>,
    sink: Option<Arc<dyn DiagnosticSink>>,
}

impl CodeCoverageBuilder {
    pub fn trace_factory(mut self, factory: impl TraceFactory + 'static) -> Self {
        self.tracer = Some(Box::new(factory));
        self
    }

    pub fn runner(mut self, runner: impl ProcessRunner + 'static) -> Self {
        self.runner = Some(Box::new(runner));
        self
    }

    pub fn wait_policy(mut self, wait: impl WaitPolicy + 'static) -> Self {
        self.wait = Some(Box::new(wait));
        self
    }

    pub fn sink(mut self, sink: impl DiagnosticSink + 'static) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    pub fn build(self) -> CodeCoverage {
        let tracer: Box<dyn TraceFactory> = match self.tracer {
            Some(tracer) => tracer,
            None => {
                let gateway = self.gateway.clone();
                let scope = self.config.trace_scope;
                let latency = self.config.effective_dispatch_latency();
                let factory = move || -> Box<dyn TraceSource> {
                    Box::new(XEventTrace::new(gateway.clone(), scope, latency))
                };
                Box::new(factory)
            }
        };
        let wait: Box<dyn WaitPolicy> = match self.wait {
            Some(wait) => wait,
            None => Box::new(FixedDelay(self.config.effective_dispatch_latency())),
        };
        let sink: Arc<dyn DiagnosticSink> = match self.sink {
            Some(sink) => sink,
            None if self.config.logging => Arc::new(LogSink),
            None => Arc::new(NoopSink),
        };

        CodeCoverage {
            filter: self.config.exclude_filter(),
            result: Arc::new(CoverageResult::empty(self.config.database.clone())),
            config: self.config,
            gateway: self.gateway,
            tracer,
            runner: self.runner.unwrap_or_else(|| Box::new(CommandRunner)),
            wait,
            sink,
            session: None,
            pending: vec![],
        }
    }
}

impl CodeCoverage {
    /// Validates `config` and wires up `sqlcmd` plus an Extended Events trace.
    pub fn connect(config: CoverageConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let gateway = Arc::new(SqlcmdGateway::new(&config));
        Ok(Self::builder(config, gateway).build())
    }

    pub fn builder(config: CoverageConfig, gateway: Arc<dyn DatabaseGateway>) -> CodeCoverageBuilder {
        CodeCoverageBuilder {
            config,
            gateway,
            tracer: None,
            runner: None,
            wait: None,
            sink: None,
        }
    }

    pub fn config(&self) -> &CoverageConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    /// Begins tracing. Returns as soon as the server side session is running.
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.session.is_some() {
            return Err(SessionError::AlreadyActive);
        }
        self.sink
            .progress(&format!("Starting trace on '{}'", self.config.database));
        let session = TraceSession::start(self.tracer.create())?;
        debug!("Trace session '{}' started", session.name());
        self.pending.clear();
        self.session = Some(session);
        Ok(())
    }

    /// Waits out the dispatch latency, then measures and publishes.
    ///
    /// Without a running session this hands back an empty result carrying the
    /// problem and leaves [`CodeCoverage::results`] alone.
    pub fn stop(&mut self) -> Arc<CoverageResult> {
        let Some(session) = self.session.take() else {
            let d = Diagnostic::error(Stage::Session, SessionError::NotStarted.to_string());
            self.sink.emit(&d);
            return Arc::new(
                CoverageResult::empty(self.config.database.clone()).with_diagnostics(vec![d]),
            );
        };
        self.wait.wait();
        self.measure(session)
    }

    /// Full cycle with a T-SQL batch as the workload.
    pub fn cover(&mut self, command: &str) -> Arc<CoverageResult> {
        if let Err(e) = self.start() {
            return self.abort(e);
        }
        self.sink.progress("Running workload command");
        if let Err(e) = self.gateway.execute(command) {
            let d = Diagnostic::error(Stage::Workload, WorkloadError::from(e).to_string());
            self.record(Outcome::with((), vec![d]));
        }
        self.stop()
    }

    /// Full cycle with an external process as the workload.
    pub fn cover_workload(
        &mut self,
        executable: &Path,
        arguments: &str,
        working_dir: Option<&Path>,
    ) -> Arc<CoverageResult> {
        if let Err(e) = self.start() {
            return self.abort(e);
        }
        self.sink
            .progress(&format!("Running workload {}", executable.display()));
        let problem = match self.runner.run(executable, arguments, working_dir) {
            Ok(run) if run.success() => {
                debug!("Workload took {}ms", run.time_ms);
                None
            }
            Ok(run) => Some(Diagnostic::warning(
                Stage::Workload,
                format!("workload exited with code {}", run.exit_code),
            )),
            Err(e) => Some(Diagnostic::error(Stage::Workload, e.to_string())),
        };
        self.record(Outcome::with((), problem.into_iter().collect()));
        self.stop()
    }

    /// The last published result, or an empty one before the first run.
    pub fn results(&self) -> Arc<CoverageResult> {
        self.result.clone()
    }

    fn abort(&mut self, error: SessionError) -> Arc<CoverageResult> {
        let d = Diagnostic::error(Stage::Session, error.to_string());
        self.sink.emit(&d);
        let result = CoverageResult::empty(self.config.database.clone()).with_diagnostics(vec![d]);
        match error {
            // the running session and its eventual result are untouched
            SessionError::AlreadyActive => Arc::new(result),
            _ => self.publish(result),
        }
    }

    fn measure(&mut self, mut session: TraceSession) -> Arc<CoverageResult> {
        let start = Instant::now();
        let events = session.read_events();
        let events = self.record(events);
        let teardown = session.finish();
        self.record(Outcome::with((), teardown));

        self.sink.progress("Fetching and segmenting module sources");
        let objects = self.collect_sources();
        let objects = self.record(objects);

        let mut correlator = EventCorrelator::new(objects);
        correlator.apply_all(&events);
        let (objects, summary) = correlator.finish();
        let summary = self.record(summary);

        let diagnostics = std::mem::take(&mut self.pending);
        let result = aggregate(self.config.database.clone(), objects, summary, diagnostics);
        debug!(
            "Measured {} objects in {}ms",
            result.objects.len(),
            start.elapsed().as_millis()
        );
        self.publish(result)
    }

    /// Lists the measurable modules, fetches their text and segments it.
    /// Fetching goes through the gateway in as few round trips as it
    /// supports; segmentation of the fetched texts runs in parallel.
    fn collect_sources(&self) -> Outcome<Vec<SegmentedObject>> {
        let mut diagnostics = vec![];
        let listed = match self.gateway.list_objects() {
            Ok(listed) => listed,
            Err(e) => {
                diagnostics.push(Diagnostic::error(
                    Stage::SourceFetch,
                    format!("could not list modules: {}", e),
                ));
                return Outcome::with(vec![], diagnostics);
            }
        };

        let wanted: Vec<ObjectRef> = listed
            .into_iter()
            .filter(|o| !self.filter.is_excluded(&o.name))
            .collect();
        let fetched = self.gateway.fetch_object_sources(&wanted);
        let sources: Vec<SourceObject> = wanted
            .into_iter()
            .zip(fetched)
            .filter_map(|(o, text)| match text {
                Ok(text) => Some(SourceObject::new(o, text)),
                Err(e) => {
                    diagnostics
                        .push(Diagnostic::error(Stage::SourceFetch, e.to_string()).for_object(o.name));
                    None
                }
            })
            .collect();

        let segmenter = SourceSegmenter::new(&self.filter);
        let segmented: Vec<(SegmentedObject, Option<Diagnostic>)> = sources
            .into_par_iter()
            .map(|source| match segmenter.segment(&source.name, &source.text) {
                Ok(spans) => (SegmentedObject::new(source, spans), None),
                Err(e) => {
                    let d = Diagnostic::error(Stage::Segmentation, e.to_string())
                        .for_object(source.name.clone());
                    (SegmentedObject::new(source, vec![]), Some(d))
                }
            })
            .collect();

        let mut objects = Vec::with_capacity(segmented.len());
        for (object, problem) in segmented {
            objects.push(object);
            diagnostics.extend(problem);
        }
        Outcome::with(objects, diagnostics)
    }

    fn record<T>(&mut self, outcome: Outcome<T>) -> T {
        for d in &outcome.diagnostics {
            self.sink.emit(d);
        }
        outcome.drain_into(&mut self.pending)
    }

    fn publish(&mut self, result: CoverageResult) -> Arc<CoverageResult> {
        self.sink.progress(&format!("Coverage {}", result.overall));
        self.result = Arc::new(result);
        self.result.clone()
    }
}
