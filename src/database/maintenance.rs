// 数据库重置：先重置、再写入初始数据，每一步都有超时

use std::future::Future;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::{SeedData, Store, StoreResult};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
    pub attempted: bool,
    pub succeeded: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl StepReport {
    fn skipped(reason: &str) -> Self {
        Self {
            attempted: false,
            succeeded: false,
            output: None,
            error: Some(reason.to_string()),
            elapsed_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResetReport {
    pub reset: StepReport,
    pub seed: StepReport,
}

impl ResetReport {
    pub fn succeeded(&self) -> bool {
        self.reset.succeeded && self.seed.succeeded
    }
}

async fn run_step<F>(name: &str, limit: Duration, step: F) -> StepReport
where
    F: Future<Output = StoreResult<String>>,
{
    let started = Instant::now();
    let outcome = tokio::time::timeout(limit, step).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(Ok(output)) => {
            tracing::info!("Database {} finished in {}ms: {}", name, elapsed_ms, output);
            StepReport {
                attempted: true,
                succeeded: true,
                output: Some(output),
                error: None,
                elapsed_ms,
            }
        }
        Ok(Err(e)) => {
            tracing::error!("Database {} failed: {}", name, e);
            StepReport {
                attempted: true,
                succeeded: false,
                output: None,
                error: Some(e.to_string()),
                elapsed_ms,
            }
        }
        Err(_) => {
            tracing::error!("Database {} timed out after {:?}", name, limit);
            StepReport {
                attempted: true,
                succeeded: false,
                output: None,
                error: Some(format!("timed out after {}s", limit.as_secs())),
                elapsed_ms,
            }
        }
    }
}

/// 重置失败时不再写入初始数据
pub async fn reset_and_seed(store: &dyn Store, seed: &SeedData, step_timeout: Duration) -> ResetReport {
    let reset = run_step("reset", step_timeout, store.reset()).await;
    if !reset.succeeded {
        return ResetReport {
            reset,
            seed: StepReport::skipped("reset failed, seed not attempted"),
        };
    }
    let seed = run_step("seed", step_timeout, store.seed(seed)).await;
    ResetReport { reset, seed }
}
