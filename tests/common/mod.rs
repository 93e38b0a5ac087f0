//! Shared fixtures for integration tests

#![allow(dead_code, reason = "not every test binary uses every fixture")]

use compliance_lake::{
    build_stack, DataLakeStack, Environment, MemoryControlPlane, Provisioner, ProvisionerConfig,
    StackConfig,
};
use std::sync::{Arc, Once};

static TRACING_INIT: Once = Once::new();

pub const ACCOUNT: &str = "123456789012";

/// Install a test subscriber once per test binary
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "compliance_lake=debug".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn env() -> Environment {
    Environment::new(ACCOUNT, "aws", "us-east-1")
        .unwrap()
        .with_execution_role(format!("arn:aws:iam::{ACCOUNT}:role/cdk-hnb659fds-cfn-exec-role"))
}

/// Engine settings with millisecond backoff so retry tests stay fast
pub fn fast_config() -> ProvisionerConfig {
    ProvisionerConfig {
        backoff_start_ms: 1,
        backoff_max_ms: 4,
        max_attempts: 3,
        ..ProvisionerConfig::default()
    }
}

pub fn stack_config() -> StackConfig {
    StackConfig::new("us-east-1", "rodrigo")
}

pub fn stack(config: &StackConfig) -> DataLakeStack {
    build_stack(config, env()).unwrap()
}

pub fn backend() -> Arc<MemoryControlPlane> {
    Arc::new(MemoryControlPlane::new(env()))
}

pub fn provisioner(backend: &Arc<MemoryControlPlane>) -> Provisioner {
    init_tracing();
    Provisioner::new(Arc::<MemoryControlPlane>::clone(backend), fast_config())
}
