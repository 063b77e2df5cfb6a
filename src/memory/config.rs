use super::size_class::SizeClassConfig;

/// What the manager does when the pool for a request's class is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExhaustionPolicy {
    /// Return `Exhausted` to the caller. Pool pressure stays visible.
    #[default]
    Fail,
    /// Serve the request from the fallback allocator. The record is tagged
    /// with the exhausted class and counted in `exhaustion_spills`.
    Fallback,
}

/// How double frees, invalid and unknown addresses are surfaced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MisusePolicy {
    /// Log at `warn` and return the error.
    #[default]
    Report,
    /// Panic at the offending call.
    Panic,
}

/// What teardown does with outstanding allocations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LeakPolicy {
    /// Log every leak at `warn` and return them in the report.
    #[default]
    Report,
    /// Log, then panic listing the leak count.
    Panic,
}

/// Construction-time configuration for a memory manager. All fields have
/// sensible defaults.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Ascending size classes. Default: 16..=512 bytes in powers of two,
    /// 1024 blocks each.
    pub size_classes: Vec<SizeClassConfig>,

    /// Default: [`ExhaustionPolicy::Fail`].
    pub exhaustion_policy: ExhaustionPolicy,

    /// Default: [`MisusePolicy::Report`].
    pub misuse_policy: MisusePolicy,

    /// Default: [`LeakPolicy::Report`].
    pub leak_policy: LeakPolicy,

    /// Reserve a pool's arena on the first request for its class instead of
    /// at construction. Ignored by the shared manager, whose pools are
    /// always created up front. Default: false.
    pub lazy_pools: bool,

    /// Fill freed payloads with `0xDD` (debug builds only). Default: false.
    pub poison_freed: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            size_classes: SizeClassConfig::powers_of_two(16, 512, 1024),
            exhaustion_policy: ExhaustionPolicy::default(),
            misuse_policy: MisusePolicy::default(),
            leak_policy: LeakPolicy::default(),
            lazy_pools: false,
            poison_freed: false,
        }
    }
}

impl ManagerConfig {
    #[must_use]
    pub fn with_size_classes(mut self, classes: impl IntoIterator<Item = SizeClassConfig>) -> Self {
        self.size_classes = classes.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_exhaustion_policy(mut self, policy: ExhaustionPolicy) -> Self {
        self.exhaustion_policy = policy;
        self
    }

    #[must_use]
    pub fn with_misuse_policy(mut self, policy: MisusePolicy) -> Self {
        self.misuse_policy = policy;
        self
    }

    #[must_use]
    pub fn with_leak_policy(mut self, policy: LeakPolicy) -> Self {
        self.leak_policy = policy;
        self
    }

    #[must_use]
    pub fn with_lazy_pools(mut self, lazy: bool) -> Self {
        self.lazy_pools = lazy;
        self
    }

    #[must_use]
    pub fn with_poison_freed(mut self, poison: bool) -> Self {
        self.poison_freed = poison;
        self
    }
}
