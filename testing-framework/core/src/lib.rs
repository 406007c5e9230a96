pub mod config;
pub mod constants;
pub mod env;
pub mod steps;
pub mod telemetry;

use std::{env as std_env, time::Duration};

pub use config::{
    BackendKind, ClusterSpec, ConfigError, EnvironmentSpec, ExposePort, Step, WaitCondition,
    WaitSelector,
};
pub use env::{
    EnvError, EnvironmentVariableBroker, expand_env, host_key, port_key, sanitize_resource_name,
};
pub use steps::{ClusterHandle, DynError, NoopStepRunner, StepRunner};

/// Environment variable that doubles every timeout on slow hosts.
pub const SLOW_ENV_VAR: &str = "SLOW_TEST_ENV";

/// Returns true when the slow-host multiplier is active.
#[must_use]
pub fn slow_test_env() -> bool {
    std_env::var(SLOW_ENV_VAR).is_ok_and(|value| value == "true")
}

/// Scale a timeout for slow environments.
#[must_use]
pub fn adjust_timeout(duration: Duration) -> Duration {
    if slow_test_env() {
        duration.saturating_mul(2)
    } else {
        duration
    }
}
