//! Expert distribution recorder
//!
//! The recorder is the context object the engine runtime constructs once and
//! shares (`Arc<ExpertDistributionRecorder>`) with every MoE layer and with the
//! control plane.
//!
//! ## Hot path
//!
//! `record_new_token` runs once per layer per step. While idle it performs one
//! atomic load and returns: no lock, no device copy, no barrier, no
//! allocation. While recording it copies the routing tensor to the host and
//! then blocks on a device barrier before appending records.
//!
//! ## Concurrency
//!
//! All mutable state sits behind one mutex. The lock is held across the copy
//! and barrier of an active record call, so `stop`, `reset`, `start` and `dump`
//! never interleave with an in-flight batch; they wait for it instead. `dump`
//! holds the lock across aggregation, write and reset so the artifact and the
//! reset observe the same session.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use expert_distribution::{ExpertDistributionRecorder, RecorderConfig, TopkIds};
//!
//! let dir = std::env::temp_dir();
//! let recorder = Arc::new(ExpertDistributionRecorder::with_host_device(
//!     RecorderConfig::new().with_output_dir(&dir),
//! ));
//!
//! recorder.start();
//! recorder.set_current_layer(0);
//! let ids = TopkIds::from_rows(&[[1u32, 2], [2, 3]]).unwrap();
//! recorder.record_new_token(&ids).unwrap();
//! let report = recorder.dump().unwrap();
//!
//! assert_eq!(report.rows, 3);
//! assert!(!recorder.is_recording());
//! # std::fs::remove_file(report.path).unwrap();
//! ```

use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::aggregate::ExpertCounts;
use crate::config::{RecorderConfig, UnsetLayerPolicy};
use crate::device::{HostDevice, RoutingDevice};
use crate::dump::{
    artifact_path, wall_clock_timestamp, write_artifact, write_counts, DumpReport,
};
use crate::error::{DistributionError, Result};
use crate::layer::{LayerContext, LayerId, LayerKey};
use crate::state::RecordingState;
use crate::store::ActivationLog;
use crate::tensor::TopkIds;

/// Point-in-time view of the recorder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecorderStatus {
    /// Current state
    pub state: RecordingState,
    /// Layer currently producing routing decisions
    pub current_layer: Option<LayerId>,
    /// Layers with records in the open session
    pub layers: usize,
    /// Records (tokens x layers) in the open session
    pub records: usize,
    /// Sessions started since construction
    pub sessions_started: u64,
    /// Artifacts written since construction
    pub dumps_written: u64,
}

#[derive(Debug, Default)]
struct RecorderInner {
    state: RecordingState,
    layer: LayerContext,
    log: ActivationLog,
    warned_unset: bool,
    sessions_started: u64,
    dumps_written: u64,
}

impl RecorderInner {
    /// Drop session data and layer context; the state is left to the caller
    fn clear_session(&mut self) {
        tracing::info!("Resetting expert distribution record...");
        self.log.clear();
        self.layer.clear();
        self.warned_unset = false;
    }
}

/// Records which experts the router selects, per layer and per token
pub struct ExpertDistributionRecorder {
    /// Mirror of `inner.state` readable without the lock
    recording: AtomicBool,
    inner: Mutex<RecorderInner>,
    device: Arc<dyn RoutingDevice>,
    config: RecorderConfig,
}

impl ExpertDistributionRecorder {
    /// Create a recorder reading routing tensors through `device`
    #[must_use]
    pub fn new(config: RecorderConfig, device: Arc<dyn RoutingDevice>) -> Self {
        Self {
            recording: AtomicBool::new(false),
            inner: Mutex::new(RecorderInner::default()),
            device,
            config,
        }
    }

    /// Create a recorder for host-resident routing tensors
    #[must_use]
    pub fn with_host_device(config: RecorderConfig) -> Self {
        Self::new(config, Arc::new(HostDevice::new()))
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Name of the device backend
    #[must_use]
    pub fn device_name(&self) -> &str {
        self.device.name()
    }

    /// Acquire the state lock, recovering from poison if needed.
    fn lock_inner(&self) -> MutexGuard<'_, RecorderInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Model-layer integration
    // =========================================================================

    /// Announce the layer whose routing decisions come next
    ///
    /// Overwrites the previous value unconditionally.
    pub fn set_current_layer(&self, layer: impl Into<LayerId>) {
        self.lock_inner().layer.set(layer);
    }

    /// Record one batch of top-k routing decisions for the current layer
    ///
    /// Idle: returns `Ok(())` immediately. Recording: copies `ids` to the host,
    /// waits on the configured device barrier, then appends one record per
    /// token under the current layer in row order.
    ///
    /// # Errors
    ///
    /// - `LayerNotSet` if recording, no layer was set, and the policy is
    ///   [`UnsetLayerPolicy::Reject`]. Nothing is copied in that case.
    /// - `DataShapeMismatch` if `num_tokens * k` overflows. Nothing is copied
    ///   in that case.
    /// - `Device` if the copy or barrier fails, or the copy returns the wrong
    ///   number of ids. Nothing is appended in that case.
    pub fn record_new_token(&self, ids: &TopkIds) -> Result<()> {
        if !self.recording.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut inner = self.lock_inner();
        if !inner.state.is_recording() {
            return Ok(());
        }

        let key = inner.layer.key();
        if key == LayerKey::Unset {
            match self.config.unset_layer_policy {
                UnsetLayerPolicy::Reject => return Err(DistributionError::LayerNotSet),
                UnsetLayerPolicy::FileUnderUnset => {
                    if !inner.warned_unset {
                        tracing::warn!(
                            "Recording routing decisions before any layer was set; \
                             filing them under the 'unset' layer"
                        );
                        inner.warned_unset = true;
                    }
                },
            }
        }

        let [num_tokens, k] = ids.shape();
        let expected = num_tokens
            .checked_mul(k)
            .ok_or_else(|| DistributionError::DataShapeMismatch {
                data_size: ids.data().len(),
                shape: vec![num_tokens, k],
                expected: usize::MAX,
            })?;

        let host_ids = self.device.copy_to_host(ids)?;
        self.device.synchronize(self.config.sync_scope)?;

        if host_ids.len() != expected {
            return Err(DistributionError::Device {
                reason: format!(
                    "{} returned {} ids for a [{num_tokens}, {k}] batch",
                    self.device.name(),
                    host_ids.len()
                ),
            });
        }

        inner.log.append_batch(key, num_tokens, k, &host_ids);
        tracing::debug!(layer = %key, num_tokens, k, "recorded routing batch");
        Ok(())
    }

    // =========================================================================
    // Control plane
    // =========================================================================

    /// Open a new session, discarding any data not yet dumped
    pub fn start(&self) {
        let mut inner = self.lock_inner();
        let transition = inner.state.start();
        inner.clear_session();
        inner.sessions_started += 1;
        self.recording.store(true, Ordering::Release);
        tracing::info!(
            session = inner.sessions_started,
            previous = %transition.from,
            "expert distribution recording started"
        );
    }

    /// Stop capturing; recorded data stays available for `dump`
    pub fn stop(&self) {
        let mut inner = self.lock_inner();
        let transition = inner.state.stop();
        self.recording.store(false, Ordering::Release);
        if !transition.redundant {
            tracing::info!(
                records = inner.log.num_records(),
                "expert distribution recording stopped"
            );
        }
    }

    /// Return to idle with an empty log and no layer context
    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        self.reset_locked(&mut inner);
    }

    fn reset_locked(&self, inner: &mut RecorderInner) {
        inner.state.reset();
        self.recording.store(false, Ordering::Release);
        inner.clear_session();
    }

    /// Write the session's counts to the configured directory, then reset
    ///
    /// # Errors
    ///
    /// Returns `Io` if the artifact cannot be written. The session is left
    /// untouched in that case, so a retry can still dump it.
    pub fn dump(&self) -> Result<DumpReport> {
        self.dump_to(&self.config.output_dir)
    }

    /// Same as [`dump`](Self::dump) with an explicit directory
    ///
    /// # Errors
    ///
    /// Returns `Io` if the artifact cannot be written, including when a file
    /// with the same name already exists.
    pub fn dump_to(&self, dir: &Path) -> Result<DumpReport> {
        let path = artifact_path(dir, self.config.rank, &wall_clock_timestamp());
        self.dump_with(|counts| write_artifact(&path, counts))
    }

    /// Write the session's counts as CSV into `writer`, then reset
    ///
    /// `label` names the destination in the report and in errors.
    ///
    /// # Errors
    ///
    /// Returns `Io` if a write fails. The session is left untouched.
    pub fn dump_to_writer<W: Write>(&self, writer: W, label: &Path) -> Result<DumpReport> {
        self.dump_with(|counts| write_counts(writer, label, counts))
    }

    /// Aggregate, write and reset under one lock; reset only on success
    fn dump_with<F>(&self, write: F) -> Result<DumpReport>
    where
        F: FnOnce(&ExpertCounts) -> Result<DumpReport>,
    {
        let mut inner = self.lock_inner();
        let counts = ExpertCounts::from_log(&inner.log);

        let report = write(&counts)?;
        inner.dumps_written += 1;
        tracing::info!(
            path = %report.path.display(),
            layers = report.layers,
            rows = report.rows,
            total_activations = report.total_activations,
            "dumped expert distribution"
        );

        self.reset_locked(&mut inner);
        Ok(report)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// `true` while a session is capturing
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    /// Layer currently producing routing decisions
    #[must_use]
    pub fn current_layer(&self) -> Option<LayerId> {
        self.lock_inner().layer.current()
    }

    /// Copy of the open session's records
    #[must_use]
    pub fn snapshot(&self) -> ActivationLog {
        self.lock_inner().log.clone()
    }

    /// Counts for the open session without dumping or resetting
    #[must_use]
    pub fn counts(&self) -> ExpertCounts {
        ExpertCounts::from_log(&self.lock_inner().log)
    }

    /// Current state, layer and session sizes
    #[must_use]
    pub fn status(&self) -> RecorderStatus {
        let inner = self.lock_inner();
        RecorderStatus {
            state: inner.state,
            current_layer: inner.layer.current(),
            layers: inner.log.num_layers(),
            records: inner.log.num_records(),
            sessions_started: inner.sessions_started,
            dumps_written: inner.dumps_written,
        }
    }
}

impl std::fmt::Debug for ExpertDistributionRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpertDistributionRecorder")
            .field("recording", &self.recording.load(Ordering::Relaxed))
            .field("device", &self.device.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceCall, MockDevice, SyncScope};

    fn mock_recorder(config: RecorderConfig) -> (ExpertDistributionRecorder, Arc<MockDevice>) {
        let device = Arc::new(MockDevice::new());
        let recorder = ExpertDistributionRecorder::new(config, device.clone());
        (recorder, device)
    }

    fn batch(rows: &[[u32; 2]]) -> TopkIds {
        TopkIds::from_rows(rows).unwrap()
    }

    #[test]
    fn test_new_recorder_is_reset() {
        let (recorder, _) = mock_recorder(RecorderConfig::default());
        let status = recorder.status();
        assert_eq!(status.state, RecordingState::Idle);
        assert_eq!(status.current_layer, None);
        assert_eq!(status.records, 0);
        assert!(!recorder.is_recording());
    }

    #[test]
    fn test_idle_record_touches_nothing() {
        let (recorder, device) = mock_recorder(RecorderConfig::default());
        recorder.set_current_layer(0);
        for _ in 0..100 {
            recorder.record_new_token(&batch(&[[1, 2]])).unwrap();
        }
        assert_eq!(device.call_count(), 0);
        assert!(recorder.snapshot().is_empty());
    }

    #[test]
    fn test_idle_record_without_layer_is_ok() {
        let (recorder, device) = mock_recorder(RecorderConfig::default());
        assert!(recorder.record_new_token(&batch(&[[1, 2]])).is_ok());
        assert_eq!(device.call_count(), 0);
    }

    #[test]
    fn test_recording_copies_then_synchronizes() {
        let (recorder, device) =
            mock_recorder(RecorderConfig::default().with_sync_scope(SyncScope::Stream));
        recorder.start();
        recorder.set_current_layer(3);
        recorder.record_new_token(&batch(&[[1, 2], [2, 3]])).unwrap();

        assert_eq!(
            device.calls(),
            vec![
                DeviceCall::CopyToHost { num_tokens: 2, k: 2 },
                DeviceCall::Synchronize {
                    scope: SyncScope::Stream
                },
            ]
        );
        let log = recorder.snapshot();
        let records = log.layer(&LayerKey::Layer(LayerId(3))).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].experts(), &[2, 3]);
    }

    #[test]
    fn test_unset_layer_rejected_by_default() {
        let (recorder, device) = mock_recorder(RecorderConfig::default());
        recorder.start();
        let err = recorder.record_new_token(&batch(&[[1, 2]])).unwrap_err();
        assert!(matches!(err, DistributionError::LayerNotSet));
        assert_eq!(device.call_count(), 0);
        assert!(recorder.snapshot().is_empty());
    }

    #[test]
    fn test_unset_layer_filed_when_tolerated() {
        let (recorder, _) = mock_recorder(
            RecorderConfig::default().with_unset_layer_policy(UnsetLayerPolicy::FileUnderUnset),
        );
        recorder.start();
        recorder.record_new_token(&batch(&[[1, 2]])).unwrap();
        recorder.record_new_token(&batch(&[[3, 4]])).unwrap();
        assert_eq!(recorder.snapshot().layer(&LayerKey::Unset).unwrap().len(), 2);
    }

    #[test]
    fn test_device_failure_appends_nothing() {
        let device = Arc::new(MockDevice::new().with_sync_failure());
        let recorder = ExpertDistributionRecorder::new(RecorderConfig::default(), device);
        recorder.start();
        recorder.set_current_layer(0);
        let err = recorder.record_new_token(&batch(&[[1, 2]])).unwrap_err();
        assert!(matches!(err, DistributionError::Device { .. }));
        assert!(recorder.snapshot().is_empty());
        assert!(recorder.is_recording());
    }

    #[test]
    fn test_copy_failure_skips_barrier() {
        let device = Arc::new(MockDevice::new().with_copy_failure());
        let recorder = ExpertDistributionRecorder::new(RecorderConfig::default(), device.clone());
        recorder.start();
        recorder.set_current_layer(0);

        let err = recorder.record_new_token(&batch(&[[1, 2]])).unwrap_err();

        assert!(matches!(err, DistributionError::Device { .. }));
        assert_eq!(device.sync_count(), 0);
        assert!(recorder.snapshot().is_empty());
    }

    #[test]
    fn test_overflowing_shape_is_rejected_without_copy() {
        let (recorder, device) = mock_recorder(RecorderConfig::default());
        recorder.start();
        recorder.set_current_layer(0);
        let json = format!(
            r#"{{"data":[],"num_tokens":{},"k":2}}"#,
            usize::MAX / 2 + 1
        );
        let ids: TopkIds = serde_json::from_str(&json).unwrap();

        let err = recorder.record_new_token(&ids).unwrap_err();

        assert!(matches!(err, DistributionError::DataShapeMismatch { .. }));
        assert_eq!(device.call_count(), 0);
        assert!(recorder.snapshot().is_empty());
        assert!(recorder.is_recording());
    }

    #[test]
    fn test_inconsistent_shape_is_device_error() {
        let (recorder, _) = mock_recorder(RecorderConfig::default());
        recorder.start();
        recorder.set_current_layer(0);
        let ids: TopkIds =
            serde_json::from_str(r#"{"data":[1,2,3],"num_tokens":2,"k":2}"#).unwrap();

        let err = recorder.record_new_token(&ids).unwrap_err();

        assert!(matches!(err, DistributionError::Device { .. }));
        assert!(recorder.snapshot().is_empty());
    }

    #[test]
    fn test_stop_keeps_data_and_blocks_new_records() {
        let (recorder, device) = mock_recorder(RecorderConfig::default());
        recorder.start();
        recorder.set_current_layer(0);
        recorder.record_new_token(&batch(&[[1, 2]])).unwrap();
        recorder.stop();
        device.clear_calls();

        recorder.record_new_token(&batch(&[[5, 6]])).unwrap();
        assert_eq!(device.call_count(), 0);
        assert_eq!(recorder.snapshot().num_records(), 1);
        assert_eq!(recorder.status().state, RecordingState::Idle);
    }

    #[test]
    fn test_redundant_stop_is_harmless() {
        let (recorder, _) = mock_recorder(RecorderConfig::default());
        recorder.stop();
        recorder.stop();
        assert!(!recorder.is_recording());
    }

    #[test]
    fn test_start_discards_previous_session() {
        let (recorder, _) = mock_recorder(RecorderConfig::default());
        recorder.start();
        recorder.set_current_layer(0);
        recorder.record_new_token(&batch(&[[1, 2]])).unwrap();
        recorder.start();

        assert!(recorder.is_recording());
        assert!(recorder.snapshot().is_empty());
        assert_eq!(recorder.current_layer(), None);
        assert_eq!(recorder.status().sessions_started, 2);
    }

    #[test]
    fn test_reset_from_recording() {
        let (recorder, _) = mock_recorder(RecorderConfig::default());
        recorder.start();
        recorder.set_current_layer(2);
        recorder.record_new_token(&batch(&[[1, 2]])).unwrap();
        recorder.reset();
        recorder.reset();

        let status = recorder.status();
        assert_eq!(status.state, RecordingState::Idle);
        assert_eq!(status.current_layer, None);
        assert_eq!(status.records, 0);
        assert!(!recorder.is_recording());
    }

    #[test]
    fn test_failed_dump_keeps_session() {
        let (recorder, _) = mock_recorder(RecorderConfig::default());
        recorder.start();
        recorder.set_current_layer(0);
        recorder.record_new_token(&batch(&[[1, 2]])).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let err = recorder.dump_to(&missing).unwrap_err();

        assert!(matches!(err, DistributionError::Io { .. }));
        assert!(recorder.is_recording());
        assert_eq!(recorder.current_layer(), Some(LayerId(0)));
        assert_eq!(recorder.snapshot().num_records(), 1);
        assert_eq!(recorder.status().dumps_written, 0);
    }

    #[test]
    fn test_failed_write_after_open_keeps_session() {
        struct FailingSink;

        impl Write for FailingSink {
            fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "no space left"))
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let (recorder, _) = mock_recorder(RecorderConfig::default());
        recorder.start();
        recorder.set_current_layer(2);
        recorder.record_new_token(&batch(&[[1, 2], [3, 4]])).unwrap();

        let err = recorder
            .dump_to_writer(FailingSink, Path::new("sink.csv"))
            .unwrap_err();

        assert!(matches!(err, DistributionError::Io { .. }));
        assert!(recorder.is_recording());
        assert_eq!(recorder.current_layer(), Some(LayerId(2)));
        assert_eq!(recorder.snapshot().num_records(), 2);
        assert_eq!(recorder.status().dumps_written, 0);
    }

    #[test]
    fn test_dump_to_writer_resets() {
        let (recorder, _) = mock_recorder(RecorderConfig::default());
        recorder.start();
        recorder.set_current_layer(0);
        recorder.record_new_token(&batch(&[[1, 1]])).unwrap();

        let mut out = Vec::new();
        let report = recorder
            .dump_to_writer(&mut out, Path::new("memory"))
            .unwrap();

        assert_eq!(report.rows, 1);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "layer_id,expert_id,count\n0,1,2\n"
        );
        assert!(!recorder.is_recording());
        assert!(recorder.snapshot().is_empty());
    }

    #[test]
    fn test_dump_never_overwrites_existing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let (recorder, _) = mock_recorder(RecorderConfig::default());
        recorder.start();
        recorder.set_current_layer(0);
        recorder.record_new_token(&batch(&[[1, 2]])).unwrap();
        let first = recorder.dump_to(dir.path()).unwrap();

        recorder.start();
        recorder.set_current_layer(0);
        recorder.record_new_token(&batch(&[[3, 4]])).unwrap();
        let err = write_artifact(&first.path, &recorder.counts()).unwrap_err();

        assert!(matches!(err, DistributionError::Io { .. }));
        assert_eq!(
            std::fs::read_to_string(&first.path).unwrap(),
            "layer_id,expert_id,count\n0,1,1\n0,2,1\n"
        );
    }

    #[test]
    fn test_counts_do_not_reset() {
        let (recorder, _) = mock_recorder(RecorderConfig::default());
        recorder.start();
        recorder.set_current_layer(1);
        recorder.record_new_token(&batch(&[[4, 4]])).unwrap();
        assert_eq!(recorder.counts().count(LayerKey::Layer(LayerId(1)), 4), 2);
        assert!(recorder.is_recording());
    }

    #[test]
    fn test_shared_across_threads() {
        let recorder = Arc::new(ExpertDistributionRecorder::with_host_device(
            RecorderConfig::default(),
        ));
        recorder.start();
        recorder.set_current_layer(0);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let r = Arc::clone(&recorder);
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        r.record_new_token(&TopkIds::from_rows(&[[0u32, 1]]).unwrap())
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(recorder.snapshot().num_records(), 100);
        assert_eq!(recorder.counts().layer_total(LayerKey::Layer(LayerId(0))), 200);
    }
}
