//! Fluent construction of a [`Scheduler`].

use std::sync::Arc;

use crate::config::SchedulerConfig;
use crate::core::{ContextPropagator, OwnerKey, Scheduler, SchedulerError};

/// Builder for [`Scheduler`].
///
/// ```rust,no_run
/// use std::cell::RefCell;
/// use prometheus_model_mutex::builders::SchedulerBuilder;
/// use prometheus_model_mutex::core::LocalKeyPropagator;
///
/// thread_local! {
///     static LOCALE: RefCell<String> = RefCell::new(String::from("en"));
/// }
///
/// let scheduler = SchedulerBuilder::<u64>::new()
///     .with_propagator(LocalKeyPropagator::new(&LOCALE))
///     .build()?;
/// # scheduler.shutdown();
/// # Ok::<(), prometheus_model_mutex::core::SchedulerError>(())
/// ```
pub struct SchedulerBuilder<K: OwnerKey> {
    config: SchedulerConfig,
    propagators: Vec<Arc<dyn ContextPropagator>>,
    _owner: std::marker::PhantomData<fn(K)>,
}

impl<K: OwnerKey> Default for SchedulerBuilder<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: OwnerKey> SchedulerBuilder<K> {
    /// Builder with default configuration and no context propagation.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: SchedulerConfig::default(),
            propagators: Vec::new(),
            _owner: std::marker::PhantomData,
        }
    }

    /// Builder starting from `MODEL_MUTEX_*` environment variables.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvalidConfig`] if a variable is malformed.
    pub fn from_env() -> Result<Self, SchedulerError> {
        let config = SchedulerConfig::from_env().map_err(SchedulerError::InvalidConfig)?;
        Ok(Self::new().with_config(config))
    }

    /// Replace the configuration.
    #[must_use]
    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Adjust the configuration in place.
    #[must_use]
    pub fn configure(mut self, f: impl FnOnce(SchedulerConfig) -> SchedulerConfig) -> Self {
        self.config = f(self.config);
        self
    }

    /// Append a context propagator. Propagators attach in the order they are
    /// added and detach in reverse.
    #[must_use]
    pub fn with_propagator(mut self, propagator: impl ContextPropagator) -> Self {
        self.propagators.push(Arc::new(propagator));
        self
    }

    /// Append an already shared context propagator.
    #[must_use]
    pub fn with_shared_propagator(mut self, propagator: Arc<dyn ContextPropagator>) -> Self {
        self.propagators.push(propagator);
        self
    }

    /// Validate the configuration and start the scheduler.
    ///
    /// # Errors
    ///
    /// As for [`Scheduler::new`].
    pub fn build(self) -> Result<Scheduler<K>, SchedulerError> {
        tracing::debug!(propagators = self.propagators.len(), "Building scheduler");
        Scheduler::with_propagators(self.config, self.propagators)
    }
}
