// FILE: src/engine/pipeline.rs
//! Metadata Pipeline
//!
//! A bounded crossbeam queue feeds a fixed pool of worker threads. Each
//! worker runs tasks through the [`Indexer`] and hands the result to a single
//! fan-out thread, which clears the in-flight entry and calls every listener.
//!
//! Submission never blocks: a full queue drops the task.

use crate::config::PipelineConfig;
use crate::engine::{Indexer, MetadataResult, MetadataTask};
use crate::error::{GalleryError, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub type ResultListener = Arc<dyn Fn(&MetadataResult) + Send + Sync>;

/// What happened to a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Accepted,
    /// An equivalent task is still pending.
    Duplicate,
    /// Queue full; the task was dropped.
    Saturated,
    Stopped,
}

enum Job {
    Run(MetadataTask),
    Stop,
}

struct Shared {
    pending: DashMap<String, Instant>,
    listeners: RwLock<Vec<ResultListener>>,
    stop: AtomicBool,
    /// Accepted tasks whose listeners have not run yet.
    in_flight: AtomicUsize,
}

struct Running {
    jobs: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
    fan_out: JoinHandle<()>,
}

pub struct MetadataPipeline {
    indexer: Indexer,
    config: PipelineConfig,
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl MetadataPipeline {
    pub fn new(indexer: Indexer, config: PipelineConfig) -> Self {
        Self {
            indexer,
            config,
            shared: Arc::new(Shared {
                pending: DashMap::new(),
                listeners: RwLock::new(Vec::new()),
                stop: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn indexer(&self) -> &Indexer {
        &self.indexer
    }

    pub fn add_listener<F>(&self, listener: F) -> Result<()>
    where
        F: Fn(&MetadataResult) + Send + Sync + 'static,
    {
        let mut listeners = self.shared.listeners.write().map_err(|_| GalleryError::poisoned())?;
        listeners.push(Arc::new(listener));
        Ok(())
    }

    pub fn queue_index(&self, full_path: PathBuf, relative_path: String, folder_key: String, force: bool) -> Enqueue {
        self.submit(MetadataTask::index(full_path, relative_path, folder_key, force))
    }

    pub fn queue_delete(&self, full_path: PathBuf, relative_path: String, folder_key: String) -> Enqueue {
        self.submit(MetadataTask::delete(full_path, relative_path, folder_key))
    }

    pub fn submit(&self, task: MetadataTask) -> Enqueue {
        if self.shared.stop.load(Ordering::SeqCst) {
            return Enqueue::Stopped;
        }
        let jobs = match self.ensure_started() {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!("[Pipeline] Failed to start workers: {}", e);
                return Enqueue::Stopped;
            }
        };

        let key = task.dedup_key();
        match self.shared.pending.entry(key.clone()) {
            Entry::Occupied(_) if !task.force => return Enqueue::Duplicate,
            Entry::Occupied(mut slot) => {
                slot.insert(Instant::now());
            }
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
            }
        }
        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);

        match jobs.try_send(Job::Run(task)) {
            Ok(()) => Enqueue::Accepted,
            Err(TrySendError::Full(_)) => {
                self.release(&key);
                tracing::warn!("[Pipeline] {}, dropping {}", GalleryError::QueueSaturated, key);
                Enqueue::Saturated
            }
            Err(TrySendError::Disconnected(_)) => {
                self.release(&key);
                Enqueue::Stopped
            }
        }
    }

    fn release(&self, key: &str) {
        self.shared.pending.remove(key);
        self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Starts the pool on first use and returns the job sender.
    fn ensure_started(&self) -> Result<Sender<Job>> {
        let mut running = self.running.lock().map_err(|_| GalleryError::poisoned())?;
        if let Some(r) = running.as_ref() {
            return Ok(r.jobs.clone());
        }

        let (job_tx, job_rx) = bounded::<Job>(self.config.queue_capacity.max(1));
        let (result_tx, result_rx) = unbounded::<(String, MetadataResult)>();

        let mut workers = Vec::with_capacity(self.config.workers);
        for id in 0..self.config.workers.max(1) {
            let rx = job_rx.clone();
            let tx = result_tx.clone();
            let indexer = self.indexer.clone();
            let shared = Arc::clone(&self.shared);
            let poll = self.config.poll_interval;
            let handle = std::thread::Builder::new()
                .name(format!("gallerydex-worker-{}", id))
                .spawn(move || worker_loop(id, rx, tx, indexer, shared, poll))?;
            workers.push(handle);
        }
        drop(result_tx);

        let shared = Arc::clone(&self.shared);
        let poll = self.config.poll_interval;
        let fan_out = std::thread::Builder::new()
            .name("gallerydex-results".into())
            .spawn(move || fan_out_loop(result_rx, shared, poll))?;

        tracing::info!("[Pipeline] Started {} workers (queue capacity {})", workers.len(), self.config.queue_capacity);
        *running = Some(Running { jobs: job_tx.clone(), workers, fan_out });
        Ok(job_tx)
    }

    pub fn pending_len(&self) -> usize {
        self.shared.pending.len()
    }

    /// Waits until every accepted task has been delivered to the listeners.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.shared.in_flight.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        true
    }

    /// Stops accepting work, wakes the workers and joins every thread with
    /// a bounded wait. A task already running is allowed to finish.
    pub fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        let running = match self.running.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(running) = running else { return };

        for _ in &running.workers {
            if running.jobs.send_timeout(Job::Stop, Duration::from_millis(100)).is_err() {
                break;
            }
        }
        drop(running.jobs);

        for handle in running.workers {
            join_with_timeout(handle, self.config.shutdown_timeout, "worker");
        }
        join_with_timeout(running.fan_out, self.config.shutdown_timeout, "result");
        tracing::info!("[Pipeline] Shut down");
    }
}

impl Drop for MetadataPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    id: usize,
    jobs: Receiver<Job>,
    results: Sender<(String, MetadataResult)>,
    indexer: Indexer,
    shared: Arc<Shared>,
    poll: Duration,
) {
    loop {
        match jobs.recv_timeout(poll) {
            Ok(Job::Run(task)) => {
                let key = task.dedup_key();
                if shared.stop.load(Ordering::SeqCst) {
                    shared.pending.remove(&key);
                    shared.in_flight.fetch_sub(1, Ordering::SeqCst);
                    continue;
                }
                let started = Instant::now();
                let result = catch_unwind(AssertUnwindSafe(|| indexer.process(&task)))
                    .unwrap_or_else(|_| MetadataResult::failed(&task, "worker panicked while processing task"));
                tracing::debug!(
                    "[Pipeline] processed {} for {} in {}ms",
                    task.action.as_str(),
                    task.full_path.display(),
                    started.elapsed().as_millis()
                );
                if results.send((key, result)).is_err() {
                    break;
                }
            }
            Ok(Job::Stop) => break,
            Err(RecvTimeoutError::Timeout) => {
                if shared.stop.load(Ordering::SeqCst) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    tracing::debug!("[Pipeline] Worker {} exiting", id);
}

fn fan_out_loop(results: Receiver<(String, MetadataResult)>, shared: Arc<Shared>, poll: Duration) {
    loop {
        match results.recv_timeout(poll) {
            Ok((key, result)) => {
                shared.pending.remove(&key);
                deliver(&shared, &result);
                shared.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            Err(RecvTimeoutError::Timeout) => continue,
            // Every worker is gone and the channel is drained.
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn deliver(shared: &Shared, result: &MetadataResult) {
    let listeners: Vec<ResultListener> = match shared.listeners.read() {
        Ok(l) => l.clone(),
        Err(_) => return,
    };
    for listener in listeners {
        if catch_unwind(AssertUnwindSafe(|| listener(result))).is_err() {
            tracing::warn!("[Pipeline] Result listener panicked for {}", result.full_path.display());
        }
    }
}

fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration, what: &str) {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            tracing::warn!("[Pipeline] {} thread did not stop within {:?}, detaching", what, timeout);
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    let _ = handle.join();
}
