//! Work dispatcher: fans units of work out over a fixed-size worker pool.
//!
//! Each worker hosts its own long-lived Chain, so every stage's resources
//! are acquired once per worker and amortized across all the units it
//! handles. Units are pulled from a shared queue; completion order is
//! unspecified and nothing downstream may depend on it. A worker whose
//! chain fails to initialize is fatal to the run - a misconfigured worker
//! must not silently skip units - while per-unit failures are recorded and
//! processing continues.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::chain::config::ChainConfig;
use crate::chain::context::Context;
use crate::chain::orchestrator::Chain;
use crate::chain::stage::{FinalizeReason, Stage};
use crate::track::TrackData;

/// Builds one worker's stage sequence; called once per worker
pub type StageFactory = dyn Fn() -> Vec<Box<dyn Stage>> + Send + Sync;

/// Sink receiving each successfully processed unit's final context
pub type OutputSink = dyn Fn(&TrackData, &Context) + Send + Sync;

/// Per-unit record in the run report
#[derive(Debug, Clone)]
pub struct UnitReport {
    pub track_id: String,
    pub worker: usize,
    pub success: bool,
    pub failed_stage: Option<String>,
    pub reason: String,
}

/// Aggregate outcome of a dispatcher run
#[derive(Debug)]
pub struct RunReport {
    pub units: Vec<UnitReport>,
    /// Worker initialize failures; non-empty means the run aborted
    pub startup_failures: Vec<String>,
}

impl RunReport {
    pub fn aborted(&self) -> bool {
        !self.startup_failures.is_empty()
    }

    pub fn completed(&self) -> usize {
        self.units.iter().filter(|u| u.success).count()
    }

    pub fn failed(&self) -> usize {
        self.units.len() - self.completed()
    }
}

/// Distributes units of work across worker-hosted chains
pub struct Dispatcher {
    config: ChainConfig,
    workers: usize,
}

impl Dispatcher {
    pub fn new(config: ChainConfig, workers: usize) -> Self {
        Self {
            config,
            workers: workers.max(1),
        }
    }

    /// Run every unit through a per-worker chain, discarding contexts
    pub fn run(&self, factory: &StageFactory, units: &[TrackData]) -> RunReport {
        self.run_with_sink(factory, units, &AtomicBool::new(false), &|_, _| {})
    }

    /// Full-control run: an external cancel flag (observed between units)
    /// and an output sink invoked with each successful unit's final context
    pub fn run_with_sink(
        &self,
        factory: &StageFactory,
        units: &[TrackData],
        cancel: &AtomicBool,
        sink: &OutputSink,
    ) -> RunReport {
        let next_unit = AtomicUsize::new(0);
        let abort = AtomicBool::new(false);
        let reports: Mutex<Vec<UnitReport>> = Mutex::new(Vec::with_capacity(units.len()));
        let startup_failures: Mutex<Vec<String>> = Mutex::new(Vec::new());

        log::info!(
            "dispatching {} units across {} workers",
            units.len(),
            self.workers
        );

        std::thread::scope(|scope| {
            for worker in 0..self.workers {
                let next_unit = &next_unit;
                let abort = &abort;
                let reports = &reports;
                let startup_failures = &startup_failures;
                let config = &self.config;

                scope.spawn(move || {
                    let mut chain = Chain::new(factory());

                    if let Err(e) = chain.initialize(config) {
                        log::error!("worker {} failed to initialize: {}", worker, e);
                        if let Ok(mut failures) = startup_failures.lock() {
                            failures.push(format!("worker {}: {}", worker, e));
                        }
                        // One misconfigured worker means they all are; stop
                        // the siblings from pulling further units
                        abort.store(true, Ordering::SeqCst);
                        chain.finalize(FinalizeReason::StartupFailure);
                        return;
                    }

                    let mut cancelled = false;
                    loop {
                        if abort.load(Ordering::SeqCst) {
                            break;
                        }
                        if cancel.load(Ordering::SeqCst) {
                            cancelled = true;
                            break;
                        }
                        let index = next_unit.fetch_add(1, Ordering::SeqCst);
                        if index >= units.len() {
                            break;
                        }

                        let track = &units[index];
                        let mut context = Context::new();
                        let outcome = chain.run(track, &mut context);
                        if outcome.success {
                            sink(track, &context);
                        }

                        if let Ok(mut reports) = reports.lock() {
                            reports.push(UnitReport {
                                track_id: track.track_id.clone(),
                                worker,
                                success: outcome.success,
                                failed_stage: outcome.failed_stage,
                                reason: outcome.reason,
                            });
                        }
                    }

                    // Every worker finalizes every stage before exiting,
                    // whatever state the run stopped in
                    chain.finalize(if cancelled {
                        FinalizeReason::Cancelled
                    } else {
                        FinalizeReason::RunComplete
                    });
                });
            }
        });

        let report = RunReport {
            units: reports.into_inner().unwrap_or_default(),
            startup_failures: startup_failures.into_inner().unwrap_or_default(),
        };

        if report.aborted() {
            log::error!(
                "run aborted at startup: {}",
                report.startup_failures.join("; ")
            );
        } else {
            log::info!(
                "run finished: {} units succeeded, {} failed",
                report.completed(),
                report.failed()
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::stage::StageOutcome;
    use crate::types::{InitError, InitResult, ProcessError, ProcessResult};
    use chrono::{TimeZone, Utc};
    use ndarray::Array1;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn track(id: &str) -> TrackData {
        TrackData {
            track_id: id.to_string(),
            instr_mode: crate::types::InstrumentMode::Lrm,
            start_time: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            lat_nadir: Array1::zeros(2),
            lon_nadir: Array1::zeros(2),
            altitude: Array1::zeros(2),
            tracker_range: Array1::zeros(2),
            geo_corrections: Array1::zeros(2),
            retracker_correction: Array1::zeros(2),
        }
    }

    struct Counting {
        init_calls: Arc<AtomicUsize>,
        finalize_calls: Arc<AtomicUsize>,
        fail_on: Option<String>,
        fail_init: bool,
    }

    impl Stage for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn initialize(&mut self, _config: &ChainConfig) -> InitResult<()> {
            self.init_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_init {
                return Err(InitError::MissingConfig("counting:dem".to_string()));
            }
            Ok(())
        }

        fn process(
            &mut self,
            t: &TrackData,
            _context: &mut Context,
        ) -> ProcessResult<StageOutcome> {
            if self.fail_on.as_deref() == Some(t.track_id.as_str()) {
                return Err(ProcessError::InvalidInput("scripted failure".to_string()));
            }
            Ok(StageOutcome::Completed)
        }

        fn finalize(&mut self, _reason: FinalizeReason) {
            self.finalize_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_all_units_processed_and_failures_isolated() {
        let init_calls = Arc::new(AtomicUsize::new(0));
        let finalize_calls = Arc::new(AtomicUsize::new(0));
        let units: Vec<_> = (0..7).map(|i| track(&format!("T{:03}", i))).collect();

        let dispatcher = Dispatcher::new(ChainConfig::default(), 3);
        let report = {
            let init_calls = init_calls.clone();
            let finalize_calls = finalize_calls.clone();
            dispatcher.run(
                &move || {
                    vec![Box::new(Counting {
                        init_calls: init_calls.clone(),
                        finalize_calls: finalize_calls.clone(),
                        fail_on: Some("T003".to_string()),
                        fail_init: false,
                    }) as Box<dyn Stage>]
                },
                &units,
            )
        };

        assert!(!report.aborted());
        assert_eq!(report.units.len(), 7);
        assert_eq!(report.failed(), 1);
        let failed: Vec<_> = report.units.iter().filter(|u| !u.success).collect();
        assert_eq!(failed[0].track_id, "T003");

        // Chains are built once per worker, and all of them finalize
        assert_eq!(init_calls.load(Ordering::SeqCst), 3);
        assert_eq!(finalize_calls.load(Ordering::SeqCst), 3);

        // No unit was processed twice
        let ids: HashSet<_> = report.units.iter().map(|u| u.track_id.clone()).collect();
        assert_eq!(ids.len(), 7);
    }

    #[test]
    fn test_worker_init_failure_aborts_run_but_finalizes() {
        let init_calls = Arc::new(AtomicUsize::new(0));
        let finalize_calls = Arc::new(AtomicUsize::new(0));
        let units: Vec<_> = (0..20).map(|i| track(&format!("U{:03}", i))).collect();

        let dispatcher = Dispatcher::new(ChainConfig::default(), 2);
        let report = {
            let init_calls = init_calls.clone();
            let finalize_calls = finalize_calls.clone();
            dispatcher.run(
                &move || {
                    vec![Box::new(Counting {
                        init_calls: init_calls.clone(),
                        finalize_calls: finalize_calls.clone(),
                        fail_on: None,
                        fail_init: true,
                    }) as Box<dyn Stage>]
                },
                &units,
            )
        };

        assert!(report.aborted());
        assert!(report.startup_failures[0].contains("counting:dem"));
        // Every worker finalized its stage despite the failed initialize
        assert_eq!(finalize_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cancel_stops_between_units() {
        let init_calls = Arc::new(AtomicUsize::new(0));
        let finalize_calls = Arc::new(AtomicUsize::new(0));
        let units: Vec<_> = (0..50).map(|i| track(&format!("C{:03}", i))).collect();

        let cancel = AtomicBool::new(true); // cancelled before the first pull
        let dispatcher = Dispatcher::new(ChainConfig::default(), 2);
        let report = {
            let init_calls = init_calls.clone();
            let finalize_calls = finalize_calls.clone();
            dispatcher.run_with_sink(
                &move || {
                    vec![Box::new(Counting {
                        init_calls: init_calls.clone(),
                        finalize_calls: finalize_calls.clone(),
                        fail_on: None,
                        fail_init: false,
                    }) as Box<dyn Stage>]
                },
                &units,
                &cancel,
                &|_, _| {},
            )
        };

        assert!(report.units.is_empty());
        assert!(!report.aborted());
        // Finalize still ran in every worker
        assert_eq!(finalize_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_sink_sees_only_successful_units() {
        let init_calls = Arc::new(AtomicUsize::new(0));
        let finalize_calls = Arc::new(AtomicUsize::new(0));
        let units: Vec<_> = (0..4).map(|i| track(&format!("S{:03}", i))).collect();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Dispatcher::new(ChainConfig::default(), 1);
        let report = {
            let init_calls = init_calls.clone();
            let finalize_calls = finalize_calls.clone();
            let seen = seen.clone();
            dispatcher.run_with_sink(
                &move || {
                    vec![Box::new(Counting {
                        init_calls: init_calls.clone(),
                        finalize_calls: finalize_calls.clone(),
                        fail_on: Some("S002".to_string()),
                        fail_init: false,
                    }) as Box<dyn Stage>]
                },
                &units,
                &AtomicBool::new(false),
                &move |t, _ctx| seen.lock().unwrap().push(t.track_id.clone()),
            )
        };

        assert_eq!(report.completed(), 3);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(!seen.contains(&"S002".to_string()));
    }
}
