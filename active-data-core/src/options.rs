//! Manager configuration.
//!
//! [`Options`] is the full snapshot returned by
//! [`Manager::options`](crate::Manager::options); [`OptionsPatch`] is the
//! partial update accepted by [`Manager::set_options`](crate::Manager::set_options).
//! Both serialize with camelCase names so configuration can live in JSON:
//!
//! ```json
//! { "immediateReaction": true, "maxIterations": 20, "timeLimit": 16 }
//! ```
//!
//! Callbacks (`after_run`, `get_time`) cannot be serialized and are set
//! through the builder methods on [`OptionsPatch`].

use std::fmt;
use std::rc::Rc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Callback invoked after every completed drain.
pub type Hook = Rc<dyn Fn()>;

/// Millisecond clock used for time-slicing drain passes.
#[derive(Clone)]
pub struct Clock(Rc<dyn Fn() -> f64>);

impl Clock {
    /// Wrap a function returning the current time in milliseconds.
    pub fn new<F>(now: F) -> Self
    where
        F: Fn() -> f64 + 'static,
    {
        Self(Rc::new(now))
    }

    /// Monotonic clock measuring milliseconds since its creation.
    pub fn monotonic() -> Self {
        let origin = Instant::now();
        Self::new(move || origin.elapsed().as_secs_f64() * 1000.0)
    }

    /// Current time in milliseconds.
    pub fn now(&self) -> f64 {
        (self.0)()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::monotonic()
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Clock(..)")
    }
}

/// Snapshot of a manager's configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Options {
    /// When false, `run` and `run_deferred` do nothing. Pending reactions are kept.
    pub enabled: bool,

    /// Flush synchronously on write instead of deferring to the executor.
    pub immediate_reaction: bool,

    /// Number of drain passes after which a non-empty queue is a runaway graph.
    pub max_iterations: usize,

    /// Virtual key registering a dependency on every property of a container.
    pub watch_key: String,

    /// Virtual key registering a dependency on the whole reachable graph.
    pub watch_deep_key: String,

    /// Milliseconds a single pass may spend before yielding to a deferred pass.
    pub time_limit: f64,

    /// Called after every completed drain.
    #[serde(skip)]
    pub after_run: Option<Hook>,

    /// Time source for `time_limit`.
    #[serde(skip)]
    pub get_time: Clock,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            enabled: true,
            immediate_reaction: false,
            max_iterations: 10,
            watch_key: "$$watch".to_owned(),
            watch_deep_key: "$$watchDeep".to_owned(),
            time_limit: 50.0,
            after_run: None,
            get_time: Clock::default(),
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("enabled", &self.enabled)
            .field("immediate_reaction", &self.immediate_reaction)
            .field("max_iterations", &self.max_iterations)
            .field("watch_key", &self.watch_key)
            .field("watch_deep_key", &self.watch_deep_key)
            .field("time_limit", &self.time_limit)
            .field("after_run", &self.after_run.is_some())
            .finish()
    }
}

/// Partial update of [`Options`]. Unset fields keep their current value.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OptionsPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub immediate_reaction: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watch_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watch_deep_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<f64>,
    /// `Some(None)` clears the callback.
    #[serde(skip)]
    pub after_run: Option<Option<Hook>>,
    #[serde(skip)]
    pub get_time: Option<Clock>,
}

impl OptionsPatch {
    /// Empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a patch from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn immediate_reaction(mut self, immediate: bool) -> Self {
        self.immediate_reaction = Some(immediate);
        self
    }

    pub fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    pub fn watch_key(mut self, key: impl Into<String>) -> Self {
        self.watch_key = Some(key.into());
        self
    }

    pub fn watch_deep_key(mut self, key: impl Into<String>) -> Self {
        self.watch_deep_key = Some(key.into());
        self
    }

    pub fn time_limit(mut self, millis: f64) -> Self {
        self.time_limit = Some(millis);
        self
    }

    pub fn after_run<F>(mut self, callback: F) -> Self
    where
        F: Fn() + 'static,
    {
        self.after_run = Some(Some(Rc::new(callback)));
        self
    }

    pub fn clear_after_run(mut self) -> Self {
        self.after_run = Some(None);
        self
    }

    pub fn get_time(mut self, clock: Clock) -> Self {
        self.get_time = Some(clock);
        self
    }

    pub(crate) fn apply_to(self, options: &mut Options) {
        if let Some(enabled) = self.enabled {
            options.enabled = enabled;
        }
        if let Some(immediate) = self.immediate_reaction {
            options.immediate_reaction = immediate;
        }
        if let Some(max_iterations) = self.max_iterations {
            options.max_iterations = max_iterations;
        }
        if let Some(key) = self.watch_key {
            options.watch_key = key;
        }
        if let Some(key) = self.watch_deep_key {
            options.watch_deep_key = key;
        }
        if let Some(limit) = self.time_limit {
            options.time_limit = limit;
        }
        if let Some(after_run) = self.after_run {
            options.after_run = after_run;
        }
        if let Some(clock) = self.get_time {
            options.get_time = clock;
        }
    }
}

impl fmt::Debug for OptionsPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptionsPatch")
            .field("enabled", &self.enabled)
            .field("immediate_reaction", &self.immediate_reaction)
            .field("max_iterations", &self.max_iterations)
            .field("watch_key", &self.watch_key)
            .field("watch_deep_key", &self.watch_deep_key)
            .field("time_limit", &self.time_limit)
            .field("after_run", &self.after_run.as_ref().map(Option::is_some))
            .field("get_time", &self.get_time.is_some())
            .finish()
    }
}
