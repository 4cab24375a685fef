//! Memory quota collaborator.
//!
//! The transport reserves its footprint against a `MemoryOwner` and
//! registers reclaimers the owner may invoke under pressure: a benign
//! pass (give back memory without hurting calls) and a destructive pass
//! (abort work to survive). `UnconstrainedMemory` is the stock owner for
//! callers without a quota system.

/// Which reclamation pass a reclaimer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclamationPass {
    /// Reclaim only memory whose loss is invisible to callers.
    Benign,
    /// Reclaim by aborting live work.
    Destructive,
}

/// Token for one reclamation sweep; dropping it tells the owner the
/// reclaimer is done and pressure may be re-evaluated.
pub struct ReclamationSweep {
    on_finish: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl ReclamationSweep {
    pub fn new(on_finish: Box<dyn FnOnce() + Send + 'static>) -> Self {
        Self {
            on_finish: Some(on_finish),
        }
    }
}

impl Drop for ReclamationSweep {
    fn drop(&mut self) {
        if let Some(on_finish) = self.on_finish.take() {
            on_finish();
        }
    }
}

impl std::fmt::Debug for ReclamationSweep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ReclamationSweep")
    }
}

/// A reclaimer is invoked with a sweep under pressure, or with `None`
/// when the owner shuts down without ever needing it.
pub type Reclaimer = Box<dyn FnOnce(Option<ReclamationSweep>) + Send + 'static>;

/// Memory accounting contract consumed by the transport.
pub trait MemoryOwner: Send + Sync {
    /// Account for `bytes` of new footprint.
    fn reserve(&self, bytes: usize);

    /// Return previously reserved footprint.
    fn release(&self, bytes: usize);

    /// Register a reclaimer for a pass. At most one reclaimer per pass
    /// is registered by the transport at a time.
    fn post_reclaimer(&self, pass: ReclamationPass, reclaimer: Reclaimer);

    /// Current pressure in [0.0, 1.0]; sizes receive windows down as
    /// memory tightens.
    fn memory_pressure(&self) -> f64 {
        0.0
    }
}

/// No-quota owner: reservations are free and reclaimers never fire.
#[derive(Debug, Default)]
pub struct UnconstrainedMemory;

impl MemoryOwner for UnconstrainedMemory {
    fn reserve(&self, _bytes: usize) {}
    fn release(&self, _bytes: usize) {}
    fn post_reclaimer(&self, _pass: ReclamationPass, _reclaimer: Reclaimer) {
        // Dropped: no pressure will ever materialize.
    }
}
