//! Acquisition engine: the signal/data handshake.
//!
//! One acquisition runs two loops against the hardware:
//!
//! ```text
//! Signal loop (caller task)            Trigger server task
//! -------------------------            -------------------
//! 1. SignalTree::run (pre-ack)
//! 2. SignalRequest::Trigger   ------>  3. DAQ sweep + camera exposure
//!                                      4. record position for frame_id
//! 5. await ack (bounded)      <------
//! 6. frame_id += 1
//! 7. SignalTree::run_response
//! 8. frame_id_completed += 1
//!    ...
//! 9. SignalRequest::Shutdown  ------>  stop, raise the shutdown flag
//!
//! Data loop task                       Frame server task
//! --------------                       -----------------
//! 1. DataRequest::GetData     ------>  2. poll the camera for new frames
//! 3. write to sink            <------     (everything left once shutdown is raised)
//! 4. DataTree::run
//!    ... until the final batch
//! ```
//!
//! Both request channels hold a single slot and every request carries a oneshot reply,
//! so each side always waits for the other's acknowledgement. The shutdown flag is only
//! raised after the last trigger was acknowledged, and the frame server drains the
//! camera once more after seeing it, so no frame is lost.
//!
//! A data loop that fails (sink write, lost frame server) raises a failure flag; the
//! signal loop checks it before every tick and stops triggering.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinError;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::{AppResult, DaqError};
use crate::features::{DataTree, SignalTree};
use crate::hardware::capabilities::{Camera, Daq};
use crate::hardware::{Frame, StagePosition};
use crate::microscope::Microscope;
use crate::sink::DataSink;

/// Stage position recorded for every triggered frame id.
type FrameLedger = Arc<Mutex<BTreeMap<u64, StagePosition>>>;

/// Interval between camera polls while waiting for frames.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

// =============================================================================
// Messages
// =============================================================================

/// Requests from the signal loop to the trigger server.
#[derive(Debug)]
pub enum SignalRequest {
    /// Output one sweep and expose one frame
    Trigger {
        /// Frame id assigned to this trigger
        frame_id: u64,
        /// Stage position during the exposure
        position: StagePosition,
        /// Acknowledgement
        reply: oneshot::Sender<AppResult<()>>,
    },
    /// No further triggers will follow
    Shutdown,
}

impl SignalRequest {
    /// Create a trigger request and the receiver for its acknowledgement.
    pub fn trigger(frame_id: u64, position: StagePosition) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (reply, rx) = oneshot::channel();
        (
            SignalRequest::Trigger {
                frame_id,
                position,
                reply,
            },
            rx,
        )
    }
}

/// Requests from the data loop to the frame server.
#[derive(Debug)]
pub enum DataRequest {
    /// Frames acquired since the previous request
    GetData {
        /// Reply with the batch
        reply: oneshot::Sender<AppResult<DataBatch>>,
    },
}

impl DataRequest {
    /// Create a data request and the receiver for its batch.
    pub fn get_data() -> (Self, oneshot::Receiver<AppResult<DataBatch>>) {
        let (reply, rx) = oneshot::channel();
        (DataRequest::GetData { reply }, rx)
    }
}

/// One reply of the frame server.
#[derive(Debug)]
pub enum DataBatch {
    /// Frames with their stage positions; possibly empty
    Frames(Vec<(Frame, StagePosition)>),
    /// The last frames of the acquisition
    Final(Vec<(Frame, StagePosition)>),
}

// =============================================================================
// Counters
// =============================================================================

/// Frame counters shared by both loops.
///
/// `frame_id` counts acknowledged triggers; `frame_id_completed` counts ticks whose
/// post-acknowledgement pass finished. At every observable point
/// `frame_id_completed <= frame_id <= frame_id_completed + 1`.
///
/// The microscope owns one instance for its lifetime; [`run`] resets it.
#[derive(Debug, Default)]
pub struct FrameCounters {
    frame_id: AtomicU64,
    completed: AtomicU64,
}

impl FrameCounters {
    /// Acknowledged triggers.
    pub fn frame_id(&self) -> u64 {
        self.frame_id.load(Ordering::SeqCst)
    }

    /// Completed ticks.
    pub fn frame_id_completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// `(frame_id_completed, frame_id)` read at one instant.
    ///
    /// Retries until `frame_id_completed` is unchanged around the `frame_id` read, so
    /// readers on other tasks see a pair that satisfies the ordering invariant.
    pub fn snapshot(&self) -> (u64, u64) {
        loop {
            let completed = self.frame_id_completed();
            let frame_id = self.frame_id();
            if self.frame_id_completed() == completed {
                return (completed, frame_id);
            }
        }
    }

    fn reset(&self) {
        self.completed.store(0, Ordering::SeqCst);
        self.frame_id.store(0, Ordering::SeqCst);
    }

    fn acknowledge(&self) {
        self.frame_id.fetch_add(1, Ordering::SeqCst);
    }

    fn complete(&self) {
        let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        debug_assert_eq!(completed, self.frame_id());
    }
}

/// What the engine hands back to the microscope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOutcome {
    /// Acknowledged triggers
    pub frames_triggered: u64,
    /// Ticks whose post-acknowledgement pass finished
    pub frames_completed: u64,
    /// Frames written to the sink
    pub frames_written: u64,
    /// Whether the data tree ran to completion
    pub data_tree_finished: bool,
}

// =============================================================================
// Engine
// =============================================================================

/// Run both trees against the prepared hardware until the signal tree finishes, the
/// acquisition is aborted or an error occurs.
///
/// The caller owns hardware preparation and teardown.
pub async fn run(
    scope: &mut Microscope,
    mut signal: SignalTree,
    data: DataTree,
    sink: Box<dyn DataSink>,
) -> AppResult<EngineOutcome> {
    let timeouts = scope.settings().timeouts.clone();
    let devices = scope.devices().clone();
    let counters = scope.frame_counters();
    counters.reset();
    let ledger: FrameLedger = Arc::new(Mutex::new(BTreeMap::new()));

    let (signal_tx, signal_rx) = mpsc::channel(1);
    let (data_tx, data_rx) = mpsc::channel(1);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let (failed_tx, mut failed_rx) = watch::channel(false);

    let trigger_task = tokio::spawn(
        trigger_server(
            devices.daq.clone(),
            devices.camera.clone(),
            ledger.clone(),
            signal_rx,
            shutdown_tx.clone(),
        )
        .instrument(info_span!("trigger_server")),
    );
    let frame_task = tokio::spawn(
        frame_server(devices.camera.clone(), ledger, data_rx, shutdown_rx, timeouts.data_poll())
            .instrument(info_span!("frame_server")),
    );
    let data_task = tokio::spawn(
        data_loop(data, sink, data_tx, failed_tx).instrument(info_span!("data_loop")),
    );

    let mut abort = scope.abort_receiver();
    let signal_result = signal_loop(
        scope,
        &mut signal,
        &signal_tx,
        &counters,
        timeouts.ack(),
        &mut abort,
        &mut failed_rx,
    )
    .await;

    match &signal_result {
        Ok(()) => {
            if signal_tx.send(SignalRequest::Shutdown).await.is_err() {
                warn!("Trigger server gone before shutdown");
                shutdown_tx.send_replace(true);
            }
        }
        Err(_) => {
            // The trigger server may be stuck inside a device call.
            trigger_task.abort();
            shutdown_tx.send_replace(true);
        }
    }
    drop(signal_tx);

    let data_result = data_task
        .await
        .map_err(|e| DaqError::ChannelClosed(format!("data loop stopped: {e}")))?;
    report_join("trigger server", trigger_task.await);
    report_join("frame server", frame_task.await);

    // The data loop's own error explains why the signal loop stopped
    let data_result = match data_result {
        Err(e) if *failed_rx.borrow() => return Err(e),
        other => other,
    };
    signal_result?;
    let (frames_written, data_tree_finished) = data_result?;

    let outcome = EngineOutcome {
        frames_triggered: counters.frame_id(),
        frames_completed: counters.frame_id_completed(),
        frames_written,
        data_tree_finished,
    };
    info!(
        triggered = outcome.frames_triggered,
        written = outcome.frames_written,
        data_tree_finished,
        "Engine stopped"
    );
    Ok(outcome)
}

/// Log a server task that panicked; cancellation is expected after an error.
fn report_join(task: &str, joined: Result<(), JoinError>) {
    match joined {
        Err(e) if !e.is_cancelled() => warn!(task, error = %e, "Server task failed"),
        _ => {}
    }
}

async fn signal_loop(
    scope: &mut Microscope,
    tree: &mut SignalTree,
    signal_tx: &mpsc::Sender<SignalRequest>,
    counters: &FrameCounters,
    ack_timeout: Duration,
    abort: &mut watch::Receiver<bool>,
    data_failed: &mut watch::Receiver<bool>,
) -> AppResult<()> {
    tree.reset();
    loop {
        if *data_failed.borrow_and_update() {
            error!(frame_id = counters.frame_id(), "Data loop failed, no further triggers");
            tree.force_end();
            tree.cleanup(scope).await;
            return Err(DaqError::ChannelClosed("data loop stopped".into()));
        }
        if *abort.borrow_and_update() {
            info!("Acquisition aborted");
            tree.force_end();
            tree.cleanup(scope).await;
        }
        if tree.is_finished() {
            return Ok(());
        }

        tree.run(scope).await?;
        if !tree.awaiting_response() {
            continue;
        }
        if scope.take_skip_trigger() {
            debug!("Trigger skipped");
            tree.run_response(scope).await?;
            continue;
        }

        let frame_id = counters.frame_id();
        let (request, ack) = SignalRequest::trigger(frame_id, scope.position());
        signal_tx
            .send(request)
            .await
            .map_err(|_| DaqError::ChannelClosed("trigger server stopped".into()))?;

        let acknowledged = match timeout(ack_timeout, ack).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DaqError::ChannelClosed("trigger acknowledgement dropped".into())),
            Err(_) => {
                error!(frame_id, timeout_ms = ack_timeout.as_millis() as u64, "Trigger not acknowledged");
                Err(DaqError::AckTimeout {
                    frame_id,
                    timeout: ack_timeout,
                })
            }
        };
        if let Err(e) = acknowledged {
            tree.force_end();
            tree.cleanup(scope).await;
            return Err(e);
        }

        scope.record_trigger(frame_id);
        counters.acknowledge();
        tree.run_response(scope).await?;
        counters.complete();
    }
}

async fn trigger_server(
    daq: Arc<dyn Daq>,
    camera: Arc<dyn Camera>,
    ledger: FrameLedger,
    mut requests: mpsc::Receiver<SignalRequest>,
    shutdown: Arc<watch::Sender<bool>>,
) {
    while let Some(request) = requests.recv().await {
        match request {
            SignalRequest::Trigger {
                frame_id,
                position,
                reply,
            } => {
                ledger.lock().insert(frame_id, position);
                let result = match daq.run_acquisition().await {
                    Ok(()) => camera.trigger().await,
                    Err(e) => Err(e),
                };
                if reply.send(result).is_err() {
                    warn!(frame_id, "Signal loop dropped the acknowledgement");
                }
            }
            SignalRequest::Shutdown => break,
        }
    }
    debug!("Trigger server stopped");
    shutdown.send_replace(true);
}

async fn frame_server(
    camera: Arc<dyn Camera>,
    ledger: FrameLedger,
    mut requests: mpsc::Receiver<DataRequest>,
    shutdown: watch::Receiver<bool>,
    poll: Duration,
) {
    while let Some(DataRequest::GetData { reply }) = requests.recv().await {
        let finishing = *shutdown.borrow();
        let batch = if finishing {
            collect(camera.as_ref(), &ledger).await.map(DataBatch::Final)
        } else {
            poll_frames(camera.as_ref(), &ledger, &shutdown, poll)
                .await
                .map(DataBatch::Frames)
        };
        let done = finishing || batch.is_err();
        if reply.send(batch).is_err() || done {
            break;
        }
    }
    debug!("Frame server stopped");
}

/// Wait up to `poll` for at least one frame.
async fn poll_frames(
    camera: &dyn Camera,
    ledger: &FrameLedger,
    shutdown: &watch::Receiver<bool>,
    poll: Duration,
) -> AppResult<Vec<(Frame, StagePosition)>> {
    let deadline = Instant::now() + poll;
    loop {
        let frames = collect(camera, ledger).await?;
        if !frames.is_empty() || Instant::now() >= deadline || *shutdown.borrow() {
            return Ok(frames);
        }
        sleep(POLL_INTERVAL).await;
    }
}

async fn collect(camera: &dyn Camera, ledger: &FrameLedger) -> AppResult<Vec<(Frame, StagePosition)>> {
    let ids = camera.read_available_frames().await?;
    let mut frames = Vec::with_capacity(ids.len());
    for id in ids {
        let frame = camera.take_frame(id).await?;
        let position = ledger.lock().remove(&id).unwrap_or_else(|| {
            warn!(frame_id = id, "No stage position recorded for frame");
            StagePosition::default()
        });
        frames.push((frame, position));
    }
    Ok(frames)
}

/// Returns frames written and whether the data tree finished.
///
/// Any error ends the loop and raises `failed`.
async fn data_loop(
    tree: DataTree,
    sink: Box<dyn DataSink>,
    requests: mpsc::Sender<DataRequest>,
    failed: watch::Sender<bool>,
) -> AppResult<(u64, bool)> {
    let result = pump_frames(tree, sink, requests).await;
    if let Err(e) = &result {
        error!(error = %e, "Data loop failed");
        failed.send_replace(true);
    }
    result
}

async fn pump_frames(
    mut tree: DataTree,
    mut sink: Box<dyn DataSink>,
    requests: mpsc::Sender<DataRequest>,
) -> AppResult<(u64, bool)> {
    let mut written = 0u64;
    let mut tree_error: Option<DaqError> = None;

    loop {
        let (request, reply) = DataRequest::get_data();
        requests
            .send(request)
            .await
            .map_err(|_| DaqError::ChannelClosed("frame server stopped".into()))?;
        let batch = reply
            .await
            .map_err(|_| DaqError::ChannelClosed("frame server dropped the reply".into()))??;

        let (frames, last) = match batch {
            DataBatch::Frames(frames) => (frames, false),
            DataBatch::Final(frames) => (frames, true),
        };

        if !frames.is_empty() {
            for (frame, position) in &frames {
                sink.write(frame, position)?;
                written += 1;
            }
            if tree_error.is_none() {
                let frames: Vec<Frame> = frames.into_iter().map(|(frame, _)| frame).collect();
                if let Err(e) = tree.run(&frames) {
                    tree_error = Some(e);
                }
            }
        }

        if last {
            break;
        }
    }

    sink.close()?;
    match tree_error {
        Some(e) => Err(e),
        None => Ok((written, tree.is_finished())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::capabilities::Camera;
    use crate::hardware::synthetic::SyntheticCamera;
    use tracing_test::traced_test;

    #[test]
    fn test_counters_order() {
        let counters = FrameCounters::default();
        counters.acknowledge();
        assert_eq!(counters.frame_id(), 1);
        assert_eq!(counters.frame_id_completed(), 0);
        counters.complete();
        assert_eq!(counters.frame_id_completed(), 1);
        counters.acknowledge();
        assert_eq!(counters.snapshot(), (1, 2));
        counters.reset();
        assert_eq!(counters.snapshot(), (0, 0));
    }

    #[tokio::test]
    async fn test_frame_server_drains_after_shutdown() {
        let camera: Arc<dyn Camera> = Arc::new(SyntheticCamera::new(4, 4));
        camera.arm(0.01).await.unwrap();
        camera.trigger().await.unwrap();
        camera.trigger().await.unwrap();

        let ledger: FrameLedger = Arc::new(Mutex::new(BTreeMap::from([(0, StagePosition::default())])));
        let (tx, rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(true);
        let server = tokio::spawn(frame_server(camera, ledger, rx, shutdown_rx, Duration::from_millis(5)));

        let (request, reply) = DataRequest::get_data();
        tx.send(request).await.unwrap();
        match reply.await.unwrap().unwrap() {
            DataBatch::Final(frames) => assert_eq!(frames.len(), 2),
            DataBatch::Frames(_) => panic!("expected the final batch"),
        }
        server.await.unwrap();
        drop(shutdown_tx);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_only_panicked_servers_are_reported() {
        let cancelled = tokio::spawn(std::future::pending::<()>());
        cancelled.abort();
        report_join("frame server", cancelled.await);
        assert!(!logs_contain("Server task failed"));

        let panicked = tokio::spawn(async { panic!("sweep buffer poisoned") });
        report_join("trigger server", panicked.await);
        assert!(logs_contain("Server task failed"));
        assert!(logs_contain("trigger server"));
    }

    #[tokio::test]
    async fn test_poll_returns_empty_after_deadline() {
        let camera = SyntheticCamera::new(4, 4);
        let ledger: FrameLedger = Arc::default();
        let (_tx, rx) = watch::channel(false);
        let frames = poll_frames(&camera, &ledger, &rx, Duration::from_millis(5)).await.unwrap();
        assert!(frames.is_empty());
    }
}
