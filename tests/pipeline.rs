use serde_json::{json, Value};
use sqlcover::config::CoverageConfig;
use sqlcover::diagnostics::{Diagnostic, DiagnosticSink, Severity, Stage};
use sqlcover::engine::CodeCoverage;
use sqlcover::error::{GatewayError, SessionError, WorkloadError};
use sqlcover::gateway::DatabaseGateway;
use sqlcover::runner::{ProcessRunner, WorkloadRun};
use sqlcover::trace::{NoWait, TraceSource, WaitPolicy};
use sqlcover::types::{ObjectKind, ObjectRef, RawEvent};
use sqlcover::CoverageResult;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const PROC1: &str = "CREATE PROCEDURE dbo.Proc1\nAS\nBEGIN\n    SELECT 1;\n    SELECT 2;\n    SELECT 3;\nEND\n";
const HELPER: &str =
    "CREATE PROCEDURE dbo.InternalHelper AS\nBEGIN\n    UPDATE dbo.T SET x = 1;\n    DELETE FROM dbo.T;\nEND";
const BROKEN: &str = "CREATE PROCEDURE dbo.Broken AS\nPRINT 'never closed";
const REPORT: &str =
    "CREATE FUNCTION dbo.Report() RETURNS int AS\nBEGIN\n    DECLARE @n int = 1;\n    RETURN @n;\nEND";

const STEP2_TWICE: &str = "EXEC dbo.Proc1 @step = 2";
const STEP2_ONCE: &str = "EXEC dbo.Proc1 @step = 2, @repeat = 0";
const RUN_HELPER: &str = "EXEC dbo.InternalHelper";
const DYNAMIC: &str = "EXEC sp_executesql N'SELECT 1'";

/// In-memory stand-in for the database server and its event dispatcher.
#[derive(Default)]
struct Server {
    objects: Vec<(ObjectRef, Option<&'static str>)>,
    /// batch -> statements it runs, as (object id, statement text)
    scripts: HashMap<&'static str, Vec<(i64, &'static str)>>,
    tracing: AtomicBool,
    pending: Mutex<Vec<RawEvent>>,
    dispatched: Mutex<Vec<RawEvent>>,
    clock: AtomicUsize,
    batches_run: AtomicUsize,
    fetched: Mutex<Vec<String>>,
    sessions_dropped: AtomicUsize,
    fail_create: AtomicBool,
    fail_stop: AtomicBool,
}

impl Server {
    fn new() -> Arc<Self> {
        let object = |id, name: &str, kind| ObjectRef {
            object_id: id,
            name: name.to_string(),
            kind,
        };
        let mut server = Server {
            objects: vec![
                (object(1, "dbo.Proc1", ObjectKind::Procedure), Some(PROC1)),
                (object(2, "dbo.InternalHelper", ObjectKind::Procedure), Some(HELPER)),
                (object(3, "dbo.Broken", ObjectKind::Procedure), Some(BROKEN)),
                (object(4, "dbo.Report", ObjectKind::Function), Some(REPORT)),
                (object(5, "dbo.Encrypted", ObjectKind::Procedure), None),
            ],
            ..Server::default()
        };
        server.scripts.insert(STEP2_TWICE, vec![(1, "SELECT 2;"), (1, "SELECT 2;")]);
        server.scripts.insert(STEP2_ONCE, vec![(1, "SELECT 2;")]);
        server.scripts.insert(
            RUN_HELPER,
            vec![(2, "UPDATE dbo.T SET x = 1;"), (2, "DELETE FROM dbo.T;")],
        );
        server.scripts.insert(DYNAMIC, vec![(999, "SELECT 1")]);
        Arc::new(server)
    }

    fn source(&self, object_id: i64) -> &'static str {
        self.objects
            .iter()
            .find(|(o, _)| o.object_id == object_id)
            .and_then(|(_, text)| *text)
            .unwrap_or("SELECT 1")
    }

    fn run(&self, batch: &str) -> Result<(), GatewayError> {
        let statements = self.scripts.get(batch).ok_or_else(|| GatewayError::Failed {
            code: Some(1),
            stderr: format!("Could not find stored procedure '{}'", batch),
        })?;
        self.batches_run.fetch_add(1, Ordering::SeqCst);
        if !self.tracing.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut pending = self.pending.lock().unwrap();
        for (object_id, statement) in statements {
            // ASCII sources, so UTF-16 offsets equal byte positions; XE reports bytes
            let start = self.source(*object_id).find(statement).unwrap() as i64 * 2;
            let tick = self.clock.fetch_add(1, Ordering::SeqCst);
            pending.push(RawEvent {
                object_id: *object_id,
                offset: start,
                offset_end: Some(start + statement.len() as i64 * 2),
                timestamp: format!("2024-05-01T12:{:02}:{:02}Z", tick / 60 % 60, tick % 60),
            });
        }
        Ok(())
    }

    fn dispatch(&self) {
        let events = std::mem::take(&mut *self.pending.lock().unwrap());
        self.dispatched.lock().unwrap().extend(events);
    }
}

struct FakeGateway(Arc<Server>);

impl DatabaseGateway for FakeGateway {
    fn database(&self) -> &str {
        "Shop"
    }

    fn execute(&self, command: &str) -> Result<(), GatewayError> {
        self.0.run(command)
    }

    fn query_json(&self, _query: &str) -> Result<Value, GatewayError> {
        Ok(json!([]))
    }

    fn list_objects(&self) -> Result<Vec<ObjectRef>, GatewayError> {
        Ok(self.0.objects.iter().map(|(o, _)| o.clone()).collect())
    }

    fn fetch_object_source(&self, object: &ObjectRef) -> Result<String, GatewayError> {
        self.0.fetched.lock().unwrap().push(object.name.clone());
        self.0
            .objects
            .iter()
            .find(|(o, _)| o.object_id == object.object_id)
            .and_then(|(_, text)| text.map(str::to_string))
            .ok_or_else(|| GatewayError::MissingDefinition(object.name.clone()))
    }
}

struct FakeTrace(Arc<Server>);

impl TraceSource for FakeTrace {
    fn name(&self) -> &str {
        "fake_session"
    }

    fn start(&mut self) -> Result<(), SessionError> {
        if self.0.fail_create.load(Ordering::SeqCst) {
            return Err(SessionError::Create {
                session: "fake_session".to_string(),
                source: GatewayError::Failed {
                    code: Some(1),
                    stderr: "permission denied".to_string(),
                },
            });
        }
        self.0.pending.lock().unwrap().clear();
        self.0.dispatched.lock().unwrap().clear();
        self.0.tracing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn read_raw(&mut self) -> Result<Vec<RawEvent>, SessionError> {
        Ok(self.0.dispatched.lock().unwrap().clone())
    }

    fn stop(&mut self) -> Result<(), SessionError> {
        self.0.tracing.store(false, Ordering::SeqCst);
        if self.0.fail_stop.load(Ordering::SeqCst) {
            return Err(SessionError::Lifecycle {
                session: "fake_session".to_string(),
                action: "stopped",
                source: GatewayError::Encoding,
            });
        }
        Ok(())
    }

    fn drop_session(&mut self) -> Result<(), SessionError> {
        self.0.sessions_dropped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Waiting out the latency lets the server flush its buffered events.
struct Dispatch(Arc<Server>);

impl WaitPolicy for Dispatch {
    fn wait(&self) {
        self.0.dispatch();
    }
}

/// Treats the argument string as a batch the external process sends.
struct ScriptRunner(Arc<Server>);

impl ProcessRunner for ScriptRunner {
    fn run(
        &self,
        executable: &Path,
        arguments: &str,
        _working_dir: Option<&Path>,
    ) -> Result<WorkloadRun, WorkloadError> {
        if !executable.starts_with("/opt/tests") {
            return Err(WorkloadError::Spawn {
                executable: executable.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            });
        }
        let exit_code = match self.0.run(arguments) {
            Ok(()) => 0,
            Err(_) => 2,
        };
        Ok(WorkloadRun {
            exit_code,
            time_ms: 5,
        })
    }
}

#[derive(Default, Clone)]
struct Collect(Arc<Mutex<Vec<Diagnostic>>>);

impl DiagnosticSink for Collect {
    fn emit(&self, diagnostic: &Diagnostic) {
        self.0.lock().unwrap().push(diagnostic.clone());
    }
}

fn engine(server: &Arc<Server>, exclude: &[&str]) -> CodeCoverage {
    let mut config = CoverageConfig::new("localhost", "Shop");
    config.exclude = exclude.iter().map(|p| p.to_string()).collect();
    let traced = server.clone();
    CodeCoverage::builder(config, Arc::new(FakeGateway(server.clone())))
        .trace_factory(move || -> Box<dyn TraceSource> { Box::new(FakeTrace(traced.clone())) })
        .runner(ScriptRunner(server.clone()))
        .wait_policy(Dispatch(server.clone()))
        .build()
}

fn hit_pattern(result: &CoverageResult) -> BTreeMap<String, Vec<bool>> {
    result
        .objects
        .iter()
        .map(|(name, o)| (name.clone(), o.spans.iter().map(|s| s.executed).collect()))
        .collect()
}

fn has(result: &CoverageResult, stage: Stage, object: Option<&str>) -> bool {
    result
        .diagnostics
        .iter()
        .any(|d| d.stage == stage && d.object.as_deref() == object)
}

#[test]
fn statement_run_twice_counts_once() {
    let server = Server::new();
    let mut coverage = engine(&server, &[]);
    let result = coverage.cover(STEP2_TWICE);

    let proc1 = result.object("dbo.Proc1").unwrap();
    assert_eq!(
        proc1.spans.iter().map(|s| s.executed).collect::<Vec<_>>(),
        vec![false, true, false]
    );
    assert_eq!((proc1.stats.hits, proc1.stats.total), (1, 3));
    assert!((proc1.stats.percentage - 100.0 / 3.0).abs() < 1e-9);
    assert_eq!(result.correlation.matched, 2);
    assert!(Arc::ptr_eq(&result, &coverage.results()));
}

#[test]
fn repeated_events_do_not_change_the_percentage() {
    let server = Server::new();
    let mut coverage = engine(&server, &[]);
    let once = coverage.cover(STEP2_ONCE);
    let twice = coverage.cover(STEP2_TWICE);
    assert_eq!(hit_pattern(&once), hit_pattern(&twice));
    assert_eq!(once.overall, twice.overall);
}

#[test]
fn excluded_objects_never_show_up() {
    let server = Server::new();
    let mut coverage = engine(&server, &["Internal*"]);
    let result = coverage.cover(RUN_HELPER);

    assert!(result.object("dbo.InternalHelper").is_none());
    assert!(!server
        .fetched
        .lock()
        .unwrap()
        .iter()
        .any(|n| n == "dbo.InternalHelper"));
    // Proc1 (3) and Report (2); Broken has no spans
    assert_eq!((result.overall.hits, result.overall.total), (0, 5));
    assert_eq!(result.correlation.discarded, 2);

    let mut unfiltered = engine(&server, &[]);
    let result = unfiltered.cover(RUN_HELPER);
    assert_eq!(result.object("InternalHelper").unwrap().stats.hits, 2);
    assert_eq!((result.overall.hits, result.overall.total), (2, 7));
}

#[test]
fn command_and_process_workloads_agree() {
    let server = Server::new();
    let mut coverage = engine(&server, &[]);
    let direct = coverage.cover(STEP2_ONCE);
    let external = coverage.cover_workload(Path::new("/opt/tests/run-suite"), STEP2_ONCE, None);
    assert_eq!(hit_pattern(&direct), hit_pattern(&external));
    assert!(external.diagnostics.iter().all(|d| d.stage != Stage::Workload));
}

#[test]
fn bad_sources_only_affect_their_own_object() {
    let server = Server::new();
    let sink = Collect::default();
    let config = CoverageConfig::new("localhost", "Shop");
    let traced = server.clone();
    let mut coverage = CodeCoverage::builder(config, Arc::new(FakeGateway(server.clone())))
        .trace_factory(move || -> Box<dyn TraceSource> { Box::new(FakeTrace(traced.clone())) })
        .wait_policy(Dispatch(server.clone()))
        .sink(sink.clone())
        .build();
    let result = coverage.cover(STEP2_ONCE);

    let broken = result.object("dbo.Broken").unwrap();
    assert!(broken.spans.is_empty());
    assert_eq!(broken.stats.percentage, 0.0);
    assert!(has(&result, Stage::Segmentation, Some("dbo.Broken")));

    assert!(result.object("dbo.Encrypted").is_none());
    assert!(has(&result, Stage::SourceFetch, Some("dbo.Encrypted")));

    assert_eq!(result.object("dbo.Proc1").unwrap().stats.hits, 1);
    assert_eq!(result.object("dbo.Report").unwrap().stats.total, 2);
    assert_eq!(sink.0.lock().unwrap().len(), result.diagnostics.len());
}

#[test]
fn spans_partition_each_object_in_order() {
    let server = Server::new();
    let mut coverage = engine(&server, &[]);
    let result = coverage.cover(STEP2_ONCE);
    for object in result.objects.values() {
        let text = server.source(object.object_id);
        for pair in object.spans.windows(2) {
            assert!(pair[0].end_offset <= pair[1].start_offset, "{}", object.name);
        }
        for (i, span) in object.spans.iter().enumerate() {
            assert_eq!(span.ordinal, i);
            assert!(span.start_offset < span.end_offset);
            assert!(span.end_offset <= text.len());
            assert!(span.start_line <= span.end_line);
        }
    }
}

#[test]
fn reading_before_dispatch_misses_events() {
    let server = Server::new();
    let mut config = CoverageConfig::new("localhost", "Shop");
    config.dispatch_latency_ms = 1;
    let traced = server.clone();
    let mut hasty = CodeCoverage::builder(config, Arc::new(FakeGateway(server.clone())))
        .trace_factory(move || -> Box<dyn TraceSource> { Box::new(FakeTrace(traced.clone())) })
        .wait_policy(NoWait)
        .build();
    let early = hasty.cover(STEP2_ONCE);
    assert_eq!(early.correlation.events, 0);
    assert_eq!(early.object("dbo.Proc1").unwrap().stats.hits, 0);

    let mut patient = engine(&server, &[]);
    let late = patient.cover(STEP2_ONCE);
    assert_eq!(late.correlation.events, 1);
    assert_eq!(late.object("dbo.Proc1").unwrap().stats.hits, 1);
}

#[test]
fn second_start_is_rejected() {
    let server = Server::new();
    let mut coverage = engine(&server, &[]);
    coverage.start().unwrap();
    assert!(matches!(coverage.start(), Err(SessionError::AlreadyActive)));

    let refused = coverage.cover(STEP2_ONCE);
    assert!(refused.objects.is_empty());
    assert!(has(&refused, Stage::Session, None));
    assert!(coverage.results().objects.is_empty());
    assert!(coverage.results().diagnostics.is_empty());
    assert!(coverage.is_running());

    server.run(STEP2_ONCE).unwrap();
    let result = coverage.stop();
    assert!(!coverage.is_running());
    assert_eq!(result.object("dbo.Proc1").unwrap().stats.hits, 1);
    assert_eq!(server.sessions_dropped.load(Ordering::SeqCst), 1);
}

#[test]
fn stop_without_start_returns_an_empty_result() {
    let server = Server::new();
    let mut coverage = engine(&server, &[]);
    let result = coverage.stop();
    assert!(result.objects.is_empty());
    assert_eq!(result.diagnostics.len(), 1);
    assert_eq!(result.diagnostics[0].severity, Severity::Error);
    assert_eq!(*coverage.results(), CoverageResult::empty("Shop"));
}

#[test]
fn failed_trace_creation_skips_the_workload() {
    let server = Server::new();
    server.fail_create.store(true, Ordering::SeqCst);
    let mut coverage = engine(&server, &[]);
    let result = coverage.cover(STEP2_ONCE);

    assert_eq!(server.batches_run.load(Ordering::SeqCst), 0);
    assert!(result.objects.is_empty());
    assert!(has(&result, Stage::Session, None));
    assert!(Arc::ptr_eq(&result, &coverage.results()));
    assert!(!coverage.is_running());
}

#[test]
fn workload_failures_still_measure() {
    let server = Server::new();
    let mut coverage = engine(&server, &[]);

    let result = coverage.cover("EXEC dbo.DoesNotExist");
    assert!(has(&result, Stage::Workload, None));
    assert_eq!(result.object("dbo.Proc1").unwrap().stats.total, 3);

    let result = coverage.cover_workload(Path::new("/usr/bin/missing"), STEP2_ONCE, None);
    assert!(has(&result, Stage::Workload, None));
    assert!(!result.objects.is_empty());

    let result = coverage.cover_workload(
        &PathBuf::from("/opt/tests/run-suite"),
        "EXEC dbo.DoesNotExist",
        Some(Path::new("/tmp")),
    );
    let workload = result
        .diagnostics
        .iter()
        .find(|d| d.stage == Stage::Workload)
        .unwrap();
    assert_eq!(workload.severity, Severity::Warning);
}

#[test]
fn stop_failure_keeps_captured_results() {
    let server = Server::new();
    server.fail_stop.store(true, Ordering::SeqCst);
    let mut coverage = engine(&server, &[]);
    let result = coverage.cover(STEP2_ONCE);

    assert_eq!(result.object("dbo.Proc1").unwrap().stats.hits, 1);
    assert!(has(&result, Stage::Session, None));
    assert_eq!(server.sessions_dropped.load(Ordering::SeqCst), 1);
}

#[test]
fn dynamic_sql_events_are_discarded_quietly() {
    let server = Server::new();
    let mut coverage = engine(&server, &[]);
    let result = coverage.cover(DYNAMIC);
    assert_eq!(result.correlation.events, 1);
    assert_eq!(result.correlation.discarded, 1);
    assert!(!has(&result, Stage::Correlation, None));
    assert_eq!(result.overall.hits, 0);
}
