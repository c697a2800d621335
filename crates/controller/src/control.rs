//! Control-path operations
//!
//! Everything here touches hardware only inside
//! [`ResourceArbiter::acquire_for_control`], so it is safe to call while a run
//! is active.

use crate::camac::{BranchDriver, BranchTiming, CamacReply, CrateController};
use crate::config::{BranchConfig, MonitorPoint};
use crate::drivers::Readable;
use common::{ResourceArbiter, Transport};
use std::time::Duration;
use tracing::{info, warn};

impl BranchConfig {
    pub fn timing(&self) -> BranchTiming {
        BranchTiming {
            settle: Duration::from_secs(self.settle_secs),
            retry: Duration::from_secs(self.retry_secs),
        }
    }
}

/// Bring configured branches and crates on line, then initialize every module
///
/// Blocks until every configured crate is on line.
pub fn bring_up<T: Transport>(
    arbiter: &ResourceArbiter<T>,
    branches: &[BranchConfig],
    modules: &mut [Box<dyn Readable>],
) -> common::Result<()> {
    let mut transport = arbiter.acquire_for_control();

    for branch in branches {
        let mut driver = BranchDriver::with_timing(&mut *transport, branch.branch, branch.timing());
        driver.initialize_branch()?;
        for crate_number in &branch.crates {
            driver.initialize_crate(*crate_number)?;
        }
    }

    for module in modules.iter_mut() {
        module.initialize(&mut *transport)?;
    }
    info!(
        "Brought up {} branches and {} modules",
        branches.len(),
        modules.len()
    );
    Ok(())
}

/// Run every module's end-of-run teardown, logging failures
pub fn end_run<T: Transport>(arbiter: &ResourceArbiter<T>, modules: &mut [Box<dyn Readable>]) {
    let mut transport = arbiter.acquire_for_control();
    for module in modules.iter_mut() {
        if let Err(e) = module.on_end_run(&mut *transport) {
            warn!("End of run for {} failed: {}", module.name(), e);
        }
    }
}

/// Execute one monitor cycle per point, in one control hold
pub fn poll_monitor<T: Transport>(
    arbiter: &ResourceArbiter<T>,
    points: &[MonitorPoint],
) -> Vec<(MonitorPoint, common::Result<CamacReply>)> {
    let mut transport = arbiter.acquire_for_control();
    points
        .iter()
        .map(|point| {
            let reply = CrateController::new(&mut *transport, point.branch, point.crate_number)
                .and_then(|mut crate_| crate_.execute(point.n, point.a, point.f, 0))
                .map_err(common::Error::from)
                .and_then(|reply| reply.into_result("monitor poll"));
            (*point, reply)
        })
        .collect()
}
