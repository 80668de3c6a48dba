use super::core::ConcurrencyService;
use crate::error::Result;
use crate::fault::FaultHandler;

use std::env;
use std::sync::OnceLock;
use std::time::Duration;

/// Environment variable gating whether spawned workers run on their own
/// threads. Read once per process.
pub const MULTITHREADED_VAR: &str = "ENVIRO_MULTITHREADED";

const DEFAULT_THREAD_FLUSH_TIME: Duration = Duration::from_millis(2000);
const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(250);
const DEFAULT_MONITOR_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Returns the process-wide multithreading flag.
///
/// Unset means enabled; the empty string, `0`, `false`, `off` and `no`
/// disable it.
pub fn multithreading_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();

    *ENABLED.get_or_init(|| parse_flag(env::var(MULTITHREADED_VAR).ok().as_deref()))
}

fn parse_flag(value: Option<&str>) -> bool {
    match value {
        None => true,
        Some(value) => !matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "" | "0" | "false" | "off" | "no"
        ),
    }
}

/// Service configuration, assembled by [`ServiceBuilder`].
#[derive(Clone, Debug)]
pub(crate) struct Config {
    pub(crate) multithreaded: bool,
    pub(crate) thread_flush_time: Duration,
    pub(crate) kill_grace: Duration,
    pub(crate) monitor_poll_interval: Duration,
    pub(crate) fault_handler: FaultHandler,
    pub(crate) dedicated_resolver: bool,
    pub(crate) forced_termination: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            multithreaded: multithreading_enabled(),
            thread_flush_time: DEFAULT_THREAD_FLUSH_TIME,
            kill_grace: DEFAULT_KILL_GRACE,
            monitor_poll_interval: DEFAULT_MONITOR_POLL_INTERVAL,
            fault_handler: FaultHandler::logging(),
            dedicated_resolver: false,
            forced_termination: false,
        }
    }
}

/// Builder for configuring and creating a [`ConcurrencyService`].
///
/// # Examples
///
/// ```rust,ignore
/// let service = ServiceBuilder::new()
///     .kill_grace(Duration::from_millis(100))
///     .dedicated_resolver(true)
///     .build()?;
/// ```
pub struct ServiceBuilder {
    config: Config,
}

impl ServiceBuilder {
    /// Creates a builder with the default configuration.
    ///
    /// Multithreading follows [`multithreading_enabled`].
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Whether spawned workers get their own thread. When disabled, spawned
    /// actions run synchronously on the caller.
    pub fn multithreaded(mut self, enabled: bool) -> Self {
        self.config.multithreaded = enabled;
        self
    }

    /// Budget for tearing down the environment a finished worker owns.
    pub fn thread_flush_time(mut self, timeout: Duration) -> Self {
        self.config.thread_flush_time = timeout;
        self
    }

    /// How long `kill` waits after interrupting a worker before escalating.
    pub fn kill_grace(mut self, grace: Duration) -> Self {
        self.config.kill_grace = grace;
        self
    }

    /// Sleep between monitor evaluations while a worker waits on monitors.
    ///
    /// # Panics
    ///
    /// Panics if `interval` is zero.
    pub fn monitor_poll_interval(mut self, interval: Duration) -> Self {
        assert!(!interval.is_zero(), "monitor_poll_interval must be > 0");

        self.config.monitor_poll_interval = interval;
        self
    }

    /// Handler used for workers that carry no handler of their own.
    pub fn fault_handler(mut self, handler: FaultHandler) -> Self {
        self.config.fault_handler = handler;
        self
    }

    /// Resolve asynchronous results on a dedicated resolver worker instead of
    /// the calling worker. Ignored when multithreading is disabled.
    pub fn dedicated_resolver(mut self, enabled: bool) -> Self {
        self.config.dedicated_resolver = enabled;
        self
    }

    /// Lets `kill` forcibly terminate a worker's OS thread when it ignores
    /// its interrupt. Without this, such a worker is detached and abandoned.
    ///
    /// # Safety
    ///
    /// Forced termination stops a thread wherever it is: locks it holds stay
    /// locked, destructors may not run, and on Unix the cancellation unwinds
    /// through Rust frames, which is undefined behavior for frames holding
    /// values with destructors. Only enable this when every action that may
    /// be killed tolerates it.
    pub unsafe fn allow_forced_termination(mut self) -> Self {
        self.config.forced_termination = true;
        self
    }

    /// Builds the service.
    ///
    /// Fails only if the dedicated resolver worker cannot be started.
    pub fn build(self) -> Result<ConcurrencyService> {
        ConcurrencyService::with_config(self.config)
    }
}

impl Default for ServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}
