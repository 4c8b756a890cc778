//! Bounded concurrent execution of capture tasks.
//!
//! Two layered counted permits bound the work: a global semaphore caps
//! cross-stream parallelism, and one semaphore per `(ip, channel)`
//! combo caps parallelism against a single stream. A task acquires
//! Global first, then PerCombo; both are released in reverse order on
//! every exit path.
//!
//! Ownership of a task is the conditional `pending -> playing` update
//! in the store, never an in-memory lock, so several engine instances
//! can share one database. Losing that race is an expected outcome and
//! is silently skipped.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use parkwatch_detect::{annotate::annotate_frame, encode_jpeg, regions_for_frame, Detector};
use parkwatch_frame_source::{Error as FrameError, FrameSource};
use parkwatch_store::{BlobStore, NewSnapshot, NewSpaceState, Store};
use parkwatch_types::{detected_variant, screenshot_rel_path, ComboKey, Task};

use crate::{EngineConfig, Error, Result};

const SUBMIT_QUEUE_DEPTH: usize = 1024;

pub(crate) struct EngineShared {
    pub(crate) store: Arc<Store>,
    pub(crate) blobs: Arc<BlobStore>,
    pub(crate) frames: Arc<dyn FrameSource>,
    pub(crate) detector: Arc<dyn Detector>,
    pub(crate) cfg: EngineConfig,
    pub(crate) change_tx: mpsc::Sender<i64>,
    global: Semaphore,
    combos: Mutex<HashMap<ComboKey, Arc<Semaphore>>>,
}

impl EngineShared {
    fn combo_semaphore(&self, combo: &ComboKey) -> Arc<Semaphore> {
        let mut combos = self.combos.lock();
        combos
            .entry(combo.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.cfg.max_workers_per_combo)))
            .clone()
    }
}

/// Handle to the running engine. Cloned freely; `shutdown` drains once.
#[derive(Clone)]
pub struct ExecutionEngine {
    shared: Arc<EngineShared>,
    submit_tx: mpsc::Sender<i64>,
    shutdown_tx: watch::Sender<bool>,
    dispatcher: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<Store>,
        blobs: Arc<BlobStore>,
        frames: Arc<dyn FrameSource>,
        detector: Arc<dyn Detector>,
        change_tx: mpsc::Sender<i64>,
        cfg: EngineConfig,
    ) -> Self {
        let shared = Arc::new(EngineShared {
            global: Semaphore::new(cfg.max_combo_concurrency),
            combos: Mutex::new(HashMap::new()),
            store,
            blobs,
            frames,
            detector,
            cfg,
            change_tx,
        });
        let (submit_tx, submit_rx) = mpsc::channel(SUBMIT_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = tokio::spawn(dispatch_loop(shared.clone(), submit_rx, shutdown_rx));
        ExecutionEngine {
            shared,
            submit_tx,
            shutdown_tx,
            dispatcher: Arc::new(Mutex::new(Some(dispatcher))),
        }
    }

    /// Queue one task for execution. Backpressures when the queue is
    /// full.
    pub async fn submit(&self, task_id: i64) -> Result<()> {
        if *self.shutdown_tx.borrow() {
            return Err(Error::ShuttingDown);
        }
        self.submit_tx
            .send(task_id)
            .await
            .map_err(|_| Error::ShuttingDown)
    }

    pub async fn submit_all(&self, task_ids: &[i64]) -> Result<usize> {
        for id in task_ids {
            self.submit(*id).await?;
        }
        Ok(task_ids.len())
    }

    /// Cooperative drain: stop accepting work, give in-flight tasks
    /// `drain_grace` to finish, then abandon them (the stuck-`playing`
    /// sweep recovers abandoned tasks later).
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        // Queued-but-unstarted acquisitions fail immediately.
        self.shared.global.close();
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn dispatch_loop(
    shared: Arc<EngineShared>,
    mut submit_rx: mpsc::Receiver<i64>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut workers: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            maybe_id = submit_rx.recv() => {
                match maybe_id {
                    Some(task_id) => {
                        workers.spawn(run_task(shared.clone(), task_id));
                    }
                    None => break,
                }
            }
            Some(joined) = workers.join_next(), if !workers.is_empty() => {
                if let Err(e) = joined {
                    if !e.is_cancelled() {
                        error!("task worker panicked: {e}");
                    }
                }
            }
        }
    }

    info!(in_flight = workers.len(), "engine draining");
    let deadline = tokio::time::Instant::now() + shared.cfg.drain_grace;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                warn!(abandoned = workers.len(), "drain grace expired; abandoning tasks");
                workers.abort_all();
                while workers.join_next().await.is_some() {}
                break;
            }
            joined = workers.join_next() => {
                match joined {
                    None => break,
                    Some(Err(e)) if !e.is_cancelled() => error!("task worker panicked: {e}"),
                    Some(_) => {}
                }
            }
        }
    }
}

async fn run_task(shared: Arc<EngineShared>, task_id: i64) {
    // The combo is needed before any permit is taken; read the row
    // without claiming it.
    let task = match shared.store.clone().run(move |s| s.get_task(task_id)).await {
        Ok(Some(t)) => t,
        Ok(None) => {
            warn!(task_id, "submitted task does not exist");
            return;
        }
        Err(e) => {
            error!(task_id, "task lookup failed: {e}");
            return;
        }
    };
    let combo = task.combo();

    let _global = match shared.global.acquire().await {
        Ok(permit) => permit,
        // Closed on shutdown.
        Err(_) => return,
    };
    let combo_sem = shared.combo_semaphore(&combo);
    let _combo = match combo_sem.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };
    // Permits drop in reverse acquisition order at function exit.

    if let Err(e) = run_claimed(&shared, task_id).await {
        // Store failures leave the task in its prior state; the reaper
        // makes it eligible again.
        error!(task_id, combo = %combo, "task aborted: {e}");
    }
}

enum CaptureOutcome {
    Completed(i64),
    LostRace,
    Failed(String),
}

async fn run_claimed(shared: &Arc<EngineShared>, task_id: i64) -> Result<()> {
    let claimed = shared
        .store
        .clone()
        .run(move |s| s.claim_task(task_id, Utc::now()))
        .await?;
    let Some(task) = claimed else {
        debug!(task_id, "claim lost; task owned elsewhere or already gone");
        return Ok(());
    };

    let deadline = shared.cfg.deadline_for(task.window_secs());
    let outcome = match tokio::time::timeout(deadline, capture_and_detect(shared, &task)).await {
        Ok(result) => result?,
        Err(_elapsed) => CaptureOutcome::Failed("deadline".to_string()),
    };

    match outcome {
        CaptureOutcome::Completed(snapshot_id) => {
            debug!(task_id, snapshot_id, "capture complete");
            if shared.change_tx.send(snapshot_id).await.is_err() {
                warn!(snapshot_id, "change engine gone; snapshot left undiffed");
            }
        }
        CaptureOutcome::LostRace => {
            debug!(task_id, "completion lost the status race");
        }
        CaptureOutcome::Failed(reason) => {
            info!(task_id, "capture failed: {reason}");
            shared
                .store
                .clone()
                .run(move |s| s.fail_task(task_id, &reason, Utc::now()))
                .await?;
        }
    }
    Ok(())
}

async fn capture_and_detect(shared: &Arc<EngineShared>, task: &Task) -> Result<CaptureOutcome> {
    let connect_timeout = shared.cfg.rtsp_connect_timeout;
    let read_timeout = shared.cfg.read_timeout_for(task.window_secs());

    // Transport failures are retried with a short backoff; decoder
    // failures and timeouts are not.
    let mut attempt = 0u32;
    let frame = loop {
        match shared
            .frames
            .grab_frame(&task.rtsp_url, connect_timeout, read_timeout)
            .await
        {
            Ok(frame) => break frame,
            Err(FrameError::Timeout) => {
                return Ok(CaptureOutcome::Failed("timeout".to_string()));
            }
            Err(e) if e.is_transient() && attempt < shared.cfg.task_retry_count => {
                attempt += 1;
                debug!(task_id = task.id, attempt, "transport retry after: {e}");
                tokio::time::sleep(shared.cfg.retry_backoff).await;
            }
            Err(e) => {
                return Ok(CaptureOutcome::Failed(e.to_string()));
            }
        }
    };

    let spaces = {
        let ip = task.ip.clone();
        let channel = task.channel.clone();
        shared
            .store
            .clone()
            .run(move |s| s.spaces_for_combo(&ip, &channel))
            .await?
    };

    // Inference, annotation, and the JPEG writes are all CPU- or
    // disk-bound; keep them off the runtime.
    let image_rel = screenshot_rel_path(
        &task.date,
        &task.ip,
        task.start_ts,
        task.end_ts,
        &task.channel,
    );
    let detected_rel = detected_variant(&image_rel);
    let blocking = {
        let shared = shared.clone();
        let image_rel = image_rel.clone();
        let detected_rel = detected_rel.clone();
        tokio::task::spawn_blocking(move || -> std::result::Result<Vec<NewSpaceState>, String> {
            let regions = regions_for_frame(&spaces, frame.width(), frame.height());
            let observations = shared
                .detector
                .detect(&frame, &regions)
                .map_err(|e| e.to_string())?;
            let annotated = annotate_frame(&frame, &regions, &observations)
                .map_err(|e| e.to_string())?;
            shared
                .blobs
                .put(&image_rel, &encode_jpeg(&frame).map_err(|e| e.to_string())?)
                .map_err(|e| e.to_string())?;
            shared
                .blobs
                .put(
                    &detected_rel,
                    &encode_jpeg(&annotated).map_err(|e| e.to_string())?,
                )
                .map_err(|e| e.to_string())?;
            Ok(observations
                .into_iter()
                .map(|o| NewSpaceState {
                    space_id: o.space_id,
                    occupied: o.occupied,
                    confidence: o.confidence,
                })
                .collect())
        })
    };
    let states = match blocking.await? {
        Ok(states) => states,
        Err(reason) => return Ok(CaptureOutcome::Failed(reason)),
    };

    let snap = NewSnapshot {
        ip: task.ip.clone(),
        channel: task.channel.clone(),
        image_path: image_rel.clone(),
        detected_image_path: detected_rel,
        detected_at: Utc::now(),
    };
    let task_id = task.id;
    let completed = shared
        .store
        .clone()
        .run(move |s| s.complete_task(task_id, &image_rel, &snap, &states, Utc::now()))
        .await?;
    match completed {
        Some(snapshot_id) => Ok(CaptureOutcome::Completed(snapshot_id)),
        None => Ok(CaptureOutcome::LostRace),
    }
}
