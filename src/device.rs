//! Device abstraction for reading routing decisions on the host
//!
//! Abstracts the device-to-host copy and the synchronization barrier so the
//! recorder can be exercised without accelerator hardware.
//!
//! # Architecture
//!
//! ```text
//! ExpertDistributionRecorder
//!    │
//!    └─► Arc<dyn RoutingDevice>
//!              │
//!              ├─► HostDevice (CPU-resident routing tensors)
//!              ├─► <accelerator adapter> (production)
//!              └─► MockDevice (testing)
//! ```
//!
//! The barrier is the dominant cost of an active recording session. With
//! [`SyncScope::Device`] the calling thread waits for *all* outstanding device
//! work, not only the kernel that produced the routing tensor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{DistributionError, Result};
use crate::tensor::{ExpertId, TopkIds};

/// How much outstanding device work a barrier waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncScope {
    /// Every queue on the device
    #[default]
    Device,
    /// Only the queue that produced the routing tensor
    Stream,
}

impl std::str::FromStr for SyncScope {
    type Err = DistributionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "device" => Ok(Self::Device),
            "stream" => Ok(Self::Stream),
            other => Err(DistributionError::InvalidConfig(format!(
                "unknown sync scope '{other}' (expected 'device' or 'stream')"
            ))),
        }
    }
}

impl std::fmt::Display for SyncScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Device => write!(f, "device"),
            Self::Stream => write!(f, "stream"),
        }
    }
}

/// Trait for backends that hold routing tensors
///
/// Implementations must be Send + Sync so one device handle can be shared by
/// every layer's forward pass and the control plane.
pub trait RoutingDevice: Send + Sync {
    /// Copy a routing tensor into host memory (row-major)
    ///
    /// The copy may be asynchronous; callers must [`synchronize`](Self::synchronize)
    /// before trusting the returned values.
    ///
    /// # Errors
    ///
    /// Returns `Device` if the transfer cannot be issued.
    fn copy_to_host(&self, ids: &TopkIds) -> Result<Vec<ExpertId>>;

    /// Block until outstanding work in `scope` has completed
    ///
    /// # Errors
    ///
    /// Returns `Device` if the backend reports an execution failure.
    fn synchronize(&self, scope: SyncScope) -> Result<()>;

    /// Backend name for diagnostics
    fn name(&self) -> &str;
}

/// Routing tensors already resident in host memory
///
/// The copy is a clone and the barrier returns immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostDevice;

impl HostDevice {
    /// Create a host device
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl RoutingDevice for HostDevice {
    fn copy_to_host(&self, ids: &TopkIds) -> Result<Vec<ExpertId>> {
        Ok(ids.data().to_vec())
    }

    fn synchronize(&self, _scope: SyncScope) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "host"
    }
}

/// Call record for MockDevice
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    /// Device-to-host copy
    CopyToHost {
        /// Tokens in the copied batch
        num_tokens: usize,
        /// Routing width of the copied batch
        k: usize,
    },
    /// Synchronization barrier
    Synchronize {
        /// Barrier scope requested
        scope: SyncScope,
    },
}

/// Mock device for testing the recorder without hardware
///
/// Records every call for verification. Uses interior mutability (Mutex) so it
/// can sit behind `Arc<dyn RoutingDevice>`.
pub struct MockDevice {
    /// Recorded calls
    calls: Mutex<Vec<DeviceCall>>,
    /// Monotonic call counter
    call_counter: AtomicUsize,
    /// Whether copies should fail
    copy_should_fail: bool,
    /// Whether barriers should fail
    sync_should_fail: bool,
}

impl MockDevice {
    /// Create a mock that succeeds on every call
    #[must_use]
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            call_counter: AtomicUsize::new(0),
            copy_should_fail: false,
            sync_should_fail: false,
        }
    }

    /// Configure copies to fail
    #[must_use]
    pub fn with_copy_failure(mut self) -> Self {
        self.copy_should_fail = true;
        self
    }

    /// Configure barriers to fail
    #[must_use]
    pub fn with_sync_failure(mut self) -> Self {
        self.sync_should_fail = true;
        self
    }

    /// Acquire the calls lock, recovering from poison if needed.
    fn lock_calls(&self) -> std::sync::MutexGuard<'_, Vec<DeviceCall>> {
        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn record(&self, call: DeviceCall) {
        self.lock_calls().push(call);
        self.call_counter.fetch_add(1, Ordering::SeqCst);
    }

    /// Get all recorded calls
    #[must_use]
    pub fn calls(&self) -> Vec<DeviceCall> {
        self.lock_calls().clone()
    }

    /// Get number of calls
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.call_counter.load(Ordering::SeqCst)
    }

    /// Get number of barriers taken
    #[must_use]
    pub fn sync_count(&self) -> usize {
        self.lock_calls()
            .iter()
            .filter(|c| matches!(c, DeviceCall::Synchronize { .. }))
            .count()
    }

    /// Clear recorded calls
    pub fn clear_calls(&self) {
        self.lock_calls().clear();
        self.call_counter.store(0, Ordering::SeqCst);
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingDevice for MockDevice {
    fn copy_to_host(&self, ids: &TopkIds) -> Result<Vec<ExpertId>> {
        self.record(DeviceCall::CopyToHost {
            num_tokens: ids.num_tokens(),
            k: ids.k(),
        });
        if self.copy_should_fail {
            return Err(DistributionError::Device {
                reason: "MockDevice configured to fail copies".to_string(),
            });
        }
        Ok(ids.data().to_vec())
    }

    fn synchronize(&self, scope: SyncScope) -> Result<()> {
        self.record(DeviceCall::Synchronize { scope });
        if self.sync_should_fail {
            return Err(DistributionError::Device {
                reason: "MockDevice configured to fail synchronization".to_string(),
            });
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

impl std::fmt::Debug for MockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDevice")
            .field("calls", &self.lock_calls().len())
            .field("call_counter", &self.call_counter.load(Ordering::SeqCst))
            .field("copy_should_fail", &self.copy_should_fail)
            .field("sync_should_fail", &self.sync_should_fail)
            .finish()
    }
}
