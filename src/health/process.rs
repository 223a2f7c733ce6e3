//! CPU and memory monitoring of OS processes hosting local providers
//!
//! A reading above either threshold is a warning. Enough warnings escalate to
//! critical. Whether a healthy reading forgets earlier warnings is governed by
//! [`WarningDecay`]; stopping and restarting a monitor always does.

use crate::error::{LifecycleError, LifecycleResult};
use crate::events::{EventBus, HealthAlert, LifecycleEvent};
use crate::notify::{Notification, NotificationSink, TracingSink};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What a healthy reading does to the warning counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningDecay {
    /// Warnings accumulate until the monitor is restarted
    #[default]
    Never,
    /// A reading under both thresholds clears the counter
    ResetOnHealthy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessMonitorConfig {
    pub interval: Duration,
    pub cpu_threshold_pct: f32,
    pub memory_threshold_pct: f32,
    pub critical_threshold: u32,
    pub warning_decay: WarningDecay,
}

impl Default for ProcessMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            cpu_threshold_pct: 90.0,
            memory_threshold_pct: 90.0,
            critical_threshold: 3,
            warning_decay: WarningDecay::Never,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessHealth {
    pub pid: u32,
    pub status: ProcessStatus,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub warnings: u32,
    pub last_check: DateTime<Utc>,
}

impl ProcessHealth {
    fn new(pid: u32) -> Self {
        Self {
            pid,
            status: ProcessStatus::Healthy,
            cpu_percent: 0.0,
            memory_percent: 0.0,
            warnings: 0,
            last_check: Utc::now(),
        }
    }
}

/// One resource reading, both values in percent
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessSample {
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

/// Source of resource readings for a pid
pub trait ProcessSampler: Send + Sync {
    fn sample(&self, pid: u32) -> LifecycleResult<ProcessSample>;
}

/// Reads process usage through `sysinfo`.
///
/// CPU is normalised by the number of logical CPUs. The first reading of a
/// process reports zero CPU because usage is measured between refreshes.
pub struct SysinfoSampler {
    system: Mutex<System>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu_all();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSampler for SysinfoSampler {
    fn sample(&self, pid: u32) -> LifecycleResult<ProcessSample> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        let target = Pid::from_u32(pid);
        system.refresh_memory();
        system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);

        let process = system
            .process(target)
            .ok_or_else(|| LifecycleError::internal(format!("process {pid} not found")))?;

        let cpus = system.cpus().len().max(1) as f32;
        let total_memory = system.total_memory();
        let memory_percent = if total_memory == 0 {
            0.0
        } else {
            (process.memory() as f64 / total_memory as f64 * 100.0) as f32
        };

        Ok(ProcessSample {
            cpu_percent: process.cpu_usage() / cpus,
            memory_percent,
        })
    }
}

impl std::fmt::Debug for SysinfoSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysinfoSampler").finish_non_exhaustive()
    }
}

/// Per-pid resource monitor with owned sampling loops
pub struct ProcessMonitor {
    config: ProcessMonitorConfig,
    bus: EventBus,
    sampler: Arc<dyn ProcessSampler>,
    notifier: Arc<dyn NotificationSink>,
    health: Mutex<HashMap<u32, ProcessHealth>>,
    loops: Mutex<HashMap<u32, JoinHandle<()>>>,
}

impl ProcessMonitor {
    pub fn new(config: ProcessMonitorConfig, bus: EventBus) -> Self {
        Self {
            config,
            bus,
            sampler: Arc::new(SysinfoSampler::new()),
            notifier: Arc::new(TracingSink),
            health: Mutex::new(HashMap::new()),
            loops: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn ProcessSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Begin sampling `pid` with a fresh warning counter.
    ///
    /// Does nothing if `pid` is already monitored. The loop ends by itself if
    /// sampling fails, e.g. because the process exited.
    pub fn start(self: &Arc<Self>, pid: u32) {
        let mut loops = self.loops.lock().unwrap_or_else(PoisonError::into_inner);
        if loops.get(&pid).is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(pid, "No async runtime, process monitoring not started");
            return;
        };

        self.health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pid, ProcessHealth::new(pid));

        let weak = Arc::downgrade(self);
        let interval = self.config.interval;
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // First tick completes immediately, skip it

            loop {
                ticker.tick().await;
                let Some(monitor) = weak.upgrade() else { break };
                if monitor.sample_now(pid).is_err() {
                    monitor.end_loop(pid);
                    break;
                }
            }
        });

        loops.insert(pid, handle);
        info!(pid, interval_secs = interval.as_secs(), "Started process monitoring");
    }

    fn end_loop(&self, pid: u32) {
        self.loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pid);
        info!(pid, "Process monitoring ended after sampling failure");
    }

    /// Stop sampling `pid` and forget its health
    pub fn stop(&self, pid: u32) {
        let handle = self
            .loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pid);
        if let Some(handle) = handle {
            handle.abort();
            info!(pid, "Stopped process monitoring");
        }
        self.health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pid);
    }

    /// Stop every loop. Safe to call repeatedly.
    pub fn stop_all(&self) {
        let loops: Vec<(u32, JoinHandle<()>)> = self
            .loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, handle) in &loops {
            handle.abort();
        }
        self.health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        if !loops.is_empty() {
            info!(stopped = loops.len(), "Stopped all process monitors");
        }
    }

    pub fn is_monitoring(&self, pid: u32) -> bool {
        self.loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pid)
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn get_health(&self, pid: u32) -> Option<ProcessHealth> {
        self.health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pid)
            .cloned()
    }

    /// Take one reading for `pid`, update its health and publish the outcome.
    ///
    /// A sampling failure is notified and returned; the stored health is left
    /// untouched.
    pub fn sample_now(&self, pid: u32) -> LifecycleResult<ProcessHealth> {
        let sample = match self.sampler.sample(pid) {
            Ok(sample) => sample,
            Err(e) => {
                warn!(pid, error = %e, "Process sampling failed");
                self.notifier.notify(
                    Notification::error("Process monitoring failed", &e.to_string()).for_pid(pid),
                );
                return Err(e);
            }
        };

        let (health, escalated) = self.apply_sample(pid, sample);

        match health.status {
            ProcessStatus::Healthy => {
                debug!(pid, cpu = health.cpu_percent, memory = health.memory_percent, "Process healthy");
            }
            ProcessStatus::Warning => {
                warn!(
                    pid,
                    cpu = health.cpu_percent,
                    memory = health.memory_percent,
                    warnings = health.warnings,
                    "Process resource usage over threshold"
                );
                self.bus.publish(LifecycleEvent::HealthWarning(HealthAlert::Process(
                    health.clone(),
                )));
                self.notifier.notify(
                    Notification::warning("Process resource warning", &usage_summary(&health))
                        .for_pid(pid),
                );
            }
            ProcessStatus::Critical if escalated => {
                error!(
                    pid,
                    cpu = health.cpu_percent,
                    memory = health.memory_percent,
                    warnings = health.warnings,
                    "Process health critical"
                );
                self.bus.publish(LifecycleEvent::HealthCritical(HealthAlert::Process(
                    health.clone(),
                )));
                self.notifier.notify(
                    Notification::critical("Process health critical", &usage_summary(&health))
                        .for_pid(pid)
                        .with_context(serde_json::json!({
                            "cpu_percent": health.cpu_percent,
                            "memory_percent": health.memory_percent,
                            "warnings": health.warnings,
                        })),
                );
            }
            ProcessStatus::Critical => {
                debug!(pid, warnings = health.warnings, "Process still critical");
            }
        }

        Ok(health)
    }

    /// Returns the updated health and whether it just became critical
    fn apply_sample(&self, pid: u32, sample: ProcessSample) -> (ProcessHealth, bool) {
        let mut all = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        let health = all.entry(pid).or_insert_with(|| ProcessHealth::new(pid));
        let was_critical = health.status == ProcessStatus::Critical;

        let over_threshold = sample.cpu_percent > self.config.cpu_threshold_pct
            || sample.memory_percent > self.config.memory_threshold_pct;

        health.cpu_percent = sample.cpu_percent;
        health.memory_percent = sample.memory_percent;
        health.last_check = Utc::now();

        if over_threshold {
            health.warnings += 1;
            health.status = if health.warnings >= self.config.critical_threshold {
                ProcessStatus::Critical
            } else {
                ProcessStatus::Warning
            };
        } else {
            if self.config.warning_decay == WarningDecay::ResetOnHealthy {
                health.warnings = 0;
            }
            health.status = ProcessStatus::Healthy;
        }

        let escalated = health.status == ProcessStatus::Critical && !was_critical;
        (health.clone(), escalated)
    }
}

fn usage_summary(health: &ProcessHealth) -> String {
    format!(
        "pid {} using {:.1}% CPU and {:.1}% memory ({} consecutive warnings)",
        health.pid, health.cpu_percent, health.memory_percent, health.warnings
    )
}

impl Drop for ProcessMonitor {
    fn drop(&mut self) {
        for (_, handle) in self
            .loops
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
        {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for ProcessMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessMonitor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
