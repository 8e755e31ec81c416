use heap::OS_PAGE_SIZE;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid runtime settings: {0}")]
pub struct SettingsError(&'static str);

/// Overrides for [`RuntimeSettings`]. Every `None` keeps the default.
#[derive(Debug, Default, Clone)]
pub struct RuntimeCreateInfo {
    pub blob_size: Option<usize>,
    pub buffer_size: Option<usize>,
    pub max_handler_blobs: Option<usize>,
    pub normalize_fingerprints: Option<bool>,
    pub invocation_threshold: Option<u32>,
    pub backedge_threshold: Option<u32>,
    pub osr_threshold: Option<u32>,
    pub counter_budget: Option<usize>,
    pub stack_limit: Option<usize>,
    pub stack_reserve: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Size of one signature handler blob. Rounded up to whole pages.
    pub blob_size: usize,
    /// Scratch buffer a single handler must fit into.
    pub buffer_size: usize,
    /// Upper bound on handler blobs; exceeding it is fatal.
    pub max_handler_blobs: usize,
    /// Collapse calling-convention-equivalent fingerprints before lookup.
    pub normalize_fingerprints: bool,
    /// Invocation count at which a method is queued for compilation.
    pub invocation_threshold: u32,
    /// Back-edge count at which the counter overflows into the runtime.
    pub backedge_threshold: u32,
    /// Back-edge count at which an on-stack-replacement compile is requested.
    pub osr_threshold: u32,
    /// Maximum number of methods that may carry counters.
    pub counter_budget: usize,
    /// Maximum interpreted call depth.
    pub stack_limit: usize,
    /// Extra frames granted while a stack overflow is being delivered.
    pub stack_reserve: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            blob_size: 32 * 1024,
            buffer_size: 1024,
            max_handler_blobs: 64,
            normalize_fingerprints: true,
            invocation_threshold: 10_000,
            backedge_threshold: 7_000,
            osr_threshold: 14_000,
            counter_budget: 1 << 20,
            stack_limit: 1024,
            stack_reserve: 16,
        }
    }
}

impl RuntimeSettings {
    pub const MAX_BLOB_SIZE: usize = 1 << 30;

    pub fn new(info: RuntimeCreateInfo) -> Result<Self, SettingsError> {
        let mut settings = Self::default();

        info.blob_size.inspect(|&val| settings.blob_size = val);
        info.buffer_size.inspect(|&val| settings.buffer_size = val);
        info.max_handler_blobs
            .inspect(|&val| settings.max_handler_blobs = val);
        info.normalize_fingerprints
            .inspect(|&val| settings.normalize_fingerprints = val);
        info.invocation_threshold
            .inspect(|&val| settings.invocation_threshold = val);
        info.backedge_threshold
            .inspect(|&val| settings.backedge_threshold = val);
        info.osr_threshold.inspect(|&val| settings.osr_threshold = val);
        info.counter_budget.inspect(|&val| settings.counter_budget = val);
        info.stack_limit.inspect(|&val| settings.stack_limit = val);
        info.stack_reserve.inspect(|&val| settings.stack_reserve = val);

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.blob_size == 0 || self.buffer_size == 0 {
            return Err(SettingsError("sizes must be > 0"));
        }
        // handler handles address blobs with 32-bit offsets
        if self.blob_size > Self::MAX_BLOB_SIZE {
            return Err(SettingsError("blob_size must not exceed 1 GiB"));
        }
        let blob_capacity = self.blob_size.checked_next_multiple_of(OS_PAGE_SIZE);
        if blob_capacity.is_none_or(|capacity| self.buffer_size > capacity) {
            return Err(SettingsError("buffer_size must fit into a blob"));
        }
        if self.max_handler_blobs == 0 {
            return Err(SettingsError("max_handler_blobs must be > 0"));
        }
        if self.invocation_threshold == 0 || self.backedge_threshold == 0 {
            return Err(SettingsError("thresholds must be > 0"));
        }
        if self.osr_threshold < self.backedge_threshold {
            return Err(SettingsError(
                "osr_threshold must not be below backedge_threshold",
            ));
        }
        if self.stack_limit == 0 {
            return Err(SettingsError("stack_limit must be > 0"));
        }
        if self.stack_reserve == 0 {
            return Err(SettingsError("stack_reserve must be > 0"));
        }
        Ok(())
    }
}
