//! Active download task
//!
//! A `Task` exists only while its identifier is active: it owns the resolved
//! option snapshot, the in-memory info and status, and the worker driving
//! the engine. All lifecycle transitions are serialized through an internal
//! control lock, and every committed transition is written through to the
//! persistence store before the call returns.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineOptions;
use crate::engine::{DownloadEngine, FetchOutcome, ProgressFn};
use crate::error::{Result, TaskError};
use crate::ident::TaskId;
use crate::state::{SpeedCalculator, TaskInfo, TaskState, TaskStatus};
use crate::store::TaskStore;

/// Worker handle and cancellation token, owned by the control lock.
///
/// The pair is taken together: cancelling without awaiting the join handle
/// would let a transition commit while the worker still holds the file.
#[derive(Default)]
struct Control {
    cancel: Option<CancellationToken>,
    worker: Option<JoinHandle<()>>,
}

pub struct Task {
    pub id: TaskId,
    pub url: String,
    options: EngineOptions,
    info: RwLock<TaskInfo>,
    status: RwLock<TaskStatus>,
    store: Arc<dyn TaskStore>,
    engine: Arc<dyn DownloadEngine>,
    control: tokio::sync::Mutex<Control>,
    flush_interval: Duration,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        url: String,
        options: EngineOptions,
        info: TaskInfo,
        status: TaskStatus,
        store: Arc<dyn TaskStore>,
        engine: Arc<dyn DownloadEngine>,
        flush_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            url,
            options,
            info: RwLock::new(info),
            status: RwLock::new(status),
            store,
            engine,
            control: tokio::sync::Mutex::new(Control::default()),
            flush_interval,
        })
    }

    /// Current status snapshot.
    pub fn status(&self) -> TaskStatus {
        self.status.read().clone()
    }

    /// Current resource metadata snapshot.
    pub fn info(&self) -> TaskInfo {
        self.info.read().clone()
    }

    pub fn state(&self) -> TaskState {
        self.status.read().state
    }

    /// Transition to Running and spawn the worker.
    ///
    /// Idempotent while a worker is already live. Fails with the
    /// invalid-state kind when the task is in a state `start` cannot leave.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut control = self.control.lock().await;

        if let Some(worker) = &control.worker {
            if !worker.is_finished() {
                tracing::debug!(task = %self.id.short(), "start on live worker, ignoring");
                return Ok(());
            }
        }
        // reap a worker that already ran to completion
        control.worker = None;
        control.cancel = None;

        let state = self.state();
        if !state.can_start() {
            return Err(TaskError::invalid_state(format!(
                "cannot start task {} from state {:?}",
                self.id, state
            )));
        }

        self.status.write().mark_started();
        self.persist_status().await?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = Arc::clone(self);
        let handle = tokio::spawn(async move {
            task.run_worker(token).await;
        });
        control.cancel = Some(cancel);
        control.worker = Some(handle);

        tracing::info!(task = %self.id.short(), url = %self.url, "task started");
        Ok(())
    }

    /// Suspend a running transfer, preserving the byte offset.
    pub async fn pause(&self) -> Result<()> {
        let mut control = self.control.lock().await;

        match self.state() {
            TaskState::Running => {}
            TaskState::Paused => return Err(TaskError::task_paused(&self.id)),
            other => return Err(TaskError::task_not_running(&self.id, other)),
        }

        self.stop_worker(&mut control).await;

        // the worker may have finished in the window before cancellation;
        // only a still-running task pauses
        {
            let mut status = self.status.write();
            if status.state == TaskState::Running {
                status.mark_paused();
            }
        }
        self.persist_status().await?;

        tracing::info!(task = %self.id.short(), "task paused");
        Ok(())
    }

    /// Stop the task for good. A no-op on an already-terminal task.
    pub async fn halt(&self) -> Result<()> {
        let mut control = self.control.lock().await;

        if self.state().is_terminal() {
            self.stop_worker(&mut control).await;
            return Ok(());
        }

        self.stop_worker(&mut control).await;
        {
            let mut status = self.status.write();
            if !status.state.is_terminal() {
                status.mark_halted();
            }
        }
        self.persist_status().await?;

        tracing::info!(task = %self.id.short(), "task halted");
        Ok(())
    }

    /// Mark the transfer finished and release the worker.
    ///
    /// Tolerates a worker that already completed on its own; the call then
    /// just reaps the handle and flushes the final status.
    pub async fn finish(&self) -> Result<()> {
        let mut control = self.control.lock().await;

        match self.state() {
            TaskState::Finished => {
                self.stop_worker(&mut control).await;
                self.persist_status().await?;
                return Ok(());
            }
            TaskState::Running => {}
            other => return Err(TaskError::task_not_running(&self.id, other)),
        }

        self.stop_worker(&mut control).await;
        {
            let mut status = self.status.write();
            if status.state != TaskState::Finished {
                status.mark_finished();
            }
        }
        self.persist_info().await?;
        self.persist_status().await?;

        tracing::info!(task = %self.id.short(), "task finished");
        Ok(())
    }

    /// Cancel the worker and wait for it to return.
    async fn stop_worker(&self, control: &mut Control) {
        if let Some(cancel) = control.cancel.take() {
            cancel.cancel();
        }
        if let Some(worker) = control.worker.take() {
            if let Err(e) = worker.await {
                tracing::warn!(task = %self.id.short(), error = %e, "worker panicked");
            }
        }
    }

    async fn run_worker(self: Arc<Self>, cancel: CancellationToken) {
        if let Err(e) = self.drive(cancel).await {
            tracing::warn!(task = %self.id.short(), error = %e, "transfer failed");
            self.status.write().mark_errored(e.to_string());
            if let Err(e) = self.persist_status().await {
                tracing::warn!(task = %self.id.short(), error = %e, "failed to persist error status");
            }
        }
    }

    /// Drive the engine: probe, then fetch with bounded retries, flushing
    /// progress to the store on an interval while the transfer runs.
    async fn drive(self: &Arc<Self>, cancel: CancellationToken) -> Result<()> {
        self.probe_if_needed().await;

        let dest = self.dest_path();
        let mut attempt: u32 = 0;
        loop {
            let offset = self.status.read().resume_offset();
            let progress = self.progress_fn();
            let fetch = self.engine.fetch(
                &self.url,
                &dest,
                offset,
                &self.options,
                Some(progress),
                cancel.clone(),
            );
            tokio::pin!(fetch);

            let mut flush = tokio::time::interval(self.flush_interval);
            flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            flush.reset(); // skip the immediate first tick

            let outcome = loop {
                tokio::select! {
                    out = &mut fetch => break out,
                    _ = flush.tick() => {
                        if let Err(e) = self.persist_status().await {
                            tracing::warn!(task = %self.id.short(), error = %e, "progress flush failed");
                        }
                    }
                }
            };

            match outcome {
                Ok(FetchOutcome::Completed { bytes }) => {
                    {
                        let mut status = self.status.write();
                        status.downloaded_bytes = bytes;
                        status.mark_finished();
                    }
                    self.persist_info().await?;
                    self.persist_status().await?;
                    tracing::info!(task = %self.id.short(), bytes, "transfer complete");
                    return Ok(());
                }
                Ok(FetchOutcome::Cancelled { bytes }) => {
                    // whoever cancelled owns the transition and final flush
                    self.status.write().update_progress(bytes, None, None);
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;
                    if cancel.is_cancelled() || attempt > self.options.retries {
                        return Err(e);
                    }
                    tracing::warn!(
                        task = %self.id.short(),
                        error = %e,
                        attempt,
                        retries = self.options.retries,
                        "transfer attempt failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
                }
            }
        }
    }

    /// Fill in resource metadata from the engine when it is still missing.
    /// Probe failures are not fatal; the fetch itself decides the outcome.
    async fn probe_if_needed(self: &Arc<Self>) {
        let need_probe = {
            let info = self.info.read();
            info.total_bytes.is_none() && info.content_type.is_none()
        };
        if !need_probe {
            return;
        }

        match self.engine.probe(&self.url, &self.options).await {
            Ok(probe) => {
                {
                    let mut info = self.info.write();
                    if info.title.is_none() {
                        info.title = probe.title.clone();
                    }
                    if probe.file_name.is_some() {
                        info.file_name = probe.file_name.clone();
                    }
                    info.content_type = probe.content_type.clone();
                    info.total_bytes = probe.total_bytes;
                }
                {
                    let mut status = self.status.write();
                    if status.total_bytes.is_none() {
                        status.total_bytes = probe.total_bytes;
                    }
                }
                if let Err(e) = self.persist_info().await {
                    tracing::warn!(task = %self.id.short(), error = %e, "failed to persist probe result");
                }
            }
            Err(e) => {
                tracing::debug!(task = %self.id.short(), error = %e, "probe failed, continuing without metadata");
            }
        }
    }

    fn progress_fn(self: &Arc<Self>) -> ProgressFn {
        let task = Arc::clone(self);
        let speed = Mutex::new(SpeedCalculator::default_window());
        Box::new(move |downloaded, total| {
            let rate = {
                let mut calc = speed.lock();
                calc.record(downloaded);
                calc.speed_bytes_per_sec()
            };
            task.status.write().update_progress(downloaded, total, rate);
        })
    }

    fn dest_path(&self) -> PathBuf {
        let file_name = self
            .info
            .read()
            .file_name
            .clone()
            .unwrap_or_else(|| format!("{}.bin", self.id.short()));
        self.options.output_dir.join(file_name)
    }

    async fn persist_status(&self) -> Result<()> {
        let snapshot = self.status();
        self.store.put_status(&self.id, &snapshot).await
    }

    async fn persist_info(&self) -> Result<()> {
        let snapshot = self.info();
        self.store.put_info(&self.id, &snapshot).await
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("state", &self.state())
            .finish()
    }
}
