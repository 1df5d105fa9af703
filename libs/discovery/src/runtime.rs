//! Background loops
//!
//! [`RegistryRuntime`] drives the time-based parts of the engine on the
//! tokio runtime: lease sweeps, circuit timer promotion, periodic health
//! rescoring and, when configured, active probes and snapshot saves.
//!
//! Every tick runs as its own task and is awaited by its loop, so a
//! panicking tick is logged and the loop carries on. Intervals are read
//! once at start; restart the runtime to pick up new intervals after a
//! configuration reload.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::engine::DiscoveryEngine;
use crate::probe::HealthProbeRunner;
use crate::snapshot::{self, SnapshotFormat};

/// Periodic snapshot destination
#[derive(Debug, Clone)]
pub struct SnapshotSchedule {
    pub path: PathBuf,
    pub format: SnapshotFormat,
    pub interval: Duration,
}

impl SnapshotSchedule {
    pub fn new(path: impl Into<PathBuf>, format: SnapshotFormat, interval: Duration) -> Self {
        Self {
            path: path.into(),
            format,
            interval,
        }
    }

    /// Export the engine and write the file
    pub fn save(&self, engine: &DiscoveryEngine) -> crate::Result<usize> {
        let bytes = engine.export_as(self.format)?;
        snapshot::save(&self.path, &bytes)?;
        Ok(bytes.len())
    }
}

pub struct RegistryRuntime {
    engine: Arc<DiscoveryEngine>,
    probes: Option<Arc<HealthProbeRunner>>,
    snapshots: Option<SnapshotSchedule>,
}

impl RegistryRuntime {
    pub fn new(engine: Arc<DiscoveryEngine>) -> Self {
        Self {
            engine,
            probes: None,
            snapshots: None,
        }
    }

    pub fn with_probes(mut self, runner: HealthProbeRunner) -> Self {
        self.probes = Some(Arc::new(runner));
        self
    }

    pub fn with_snapshots(mut self, schedule: SnapshotSchedule) -> Self {
        self.snapshots = Some(schedule);
        self
    }

    /// Spawn the loops; must be called inside a tokio runtime
    pub fn start(self) -> RuntimeHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = self.engine.config();
        let mut tasks = Vec::new();

        tasks.push(spawn_loop(
            "lease-sweep",
            config.lease.sweep_interval,
            self.engine.clone(),
            shutdown_rx.clone(),
            |engine| async move {
                let report = engine.sweep();
                if !report.evicted.is_empty() || report.faults > 0 {
                    debug!(
                        "Sweep evicted {} nodes with {} faults",
                        report.evicted.len(),
                        report.faults
                    );
                }
            },
        ));

        tasks.push(spawn_loop(
            "circuit-timers",
            config.circuit.timer_poll_interval,
            self.engine.clone(),
            shutdown_rx.clone(),
            |engine| async move {
                engine.pump_timers();
            },
        ));

        if config.features.health_scoring {
            tasks.push(spawn_loop(
                "health-rescore",
                config.health.rescore_interval,
                self.engine.clone(),
                shutdown_rx.clone(),
                |engine| async move {
                    engine.rescore_all();
                },
            ));
        }

        if let Some(runner) = self.probes.clone() {
            tasks.push(spawn_loop(
                "health-probes",
                config.health.probe_interval,
                self.engine.clone(),
                shutdown_rx.clone(),
                move |engine| {
                    let runner = runner.clone();
                    async move {
                        runner.run_once(&engine).await;
                    }
                },
            ));
        }

        if let Some(schedule) = self.snapshots.clone() {
            let schedule = Arc::new(schedule);
            tasks.push(spawn_loop(
                "snapshots",
                schedule.interval,
                self.engine.clone(),
                shutdown_rx.clone(),
                move |engine| {
                    let schedule = schedule.clone();
                    async move {
                        if let Err(e) = schedule.save(&engine) {
                            error!("Periodic snapshot to {} failed: {}", schedule.path.display(), e);
                        }
                    }
                },
            ));
        }

        info!("Registry runtime started with {} loops", tasks.len());
        RuntimeHandle {
            engine: self.engine,
            snapshots: self.snapshots,
            shutdown: shutdown_tx,
            tasks,
        }
    }
}

/// Running loops; dropping it without `shutdown` leaves them running
pub struct RuntimeHandle {
    engine: Arc<DiscoveryEngine>,
    snapshots: Option<SnapshotSchedule>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RuntimeHandle {
    pub fn engine(&self) -> &Arc<DiscoveryEngine> {
        &self.engine
    }

    pub fn loops(&self) -> usize {
        self.tasks.len()
    }

    /// Stop every loop, wait for them, then write a final snapshot
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Runtime loop ended abnormally: {}", e);
            }
        }
        if let Some(schedule) = &self.snapshots {
            match schedule.save(&self.engine) {
                Ok(bytes) => info!("Final snapshot written to {} ({} bytes)", schedule.path.display(), bytes),
                Err(e) => error!("Final snapshot to {} failed: {}", schedule.path.display(), e),
            }
        }
        info!("Registry runtime stopped");
    }
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    engine: Arc<DiscoveryEngine>,
    mut shutdown: watch::Receiver<bool>,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<DiscoveryEngine>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let job = tokio::spawn(tick(engine.clone()));
                    if let Err(e) = job.await {
                        error!("{} tick failed: {}", name, e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("{} loop stopped", name);
    })
}
