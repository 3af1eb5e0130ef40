// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host syscall backend running simulated processes on threads
//! OWNERS: @runtime @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below + tests/host_backend.rs + tests/ipc_e2e
//!
//! PUBLIC API:
//!   - HostKernel: kernel context behind one lock, shared by all handles
//!   - HostProcess: per-process handle implementing ProcessCtl + VmShare
//!
//! Kernel entry is serialised by a single mutex, which stands in for "interrupts disabled"
//! on a real core. A process that sleeps parks its thread on a condition variable until the
//! scheduler moves it out of the Sleeping state. The timer follows the host monotonic clock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use nexus_abi::{
    MemoryShare, Pid, ProcessCtl, ProcessEvent, ProcessInfo, ProcessState, Result, ShareOutcome,
    SysError, TimerInfo, VmShare,
};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::config::KernelConfig;
use crate::context::KernelContext;
use crate::manager::SleepOutcome;

const SLEEP_POLL: Duration = Duration::from_millis(5);

/// Kernel shared by every simulated process.
pub struct HostKernel {
    ctx: Mutex<KernelContext>,
    changed: Condvar,
    boot: Instant,
}

impl HostKernel {
    /// Wraps an existing context.
    pub fn new(ctx: KernelContext) -> Arc<Self> {
        Arc::new(Self { ctx: Mutex::new(ctx), changed: Condvar::new(), boot: Instant::now() })
    }

    /// Boots a kernel with host memory sized from `config`.
    pub fn from_config(config: KernelConfig) -> Arc<Self> {
        Self::new(KernelContext::with_host_memory(config))
    }

    /// Enters the kernel, bringing the timer up to date first.
    fn enter(&self) -> MutexGuard<'_, KernelContext> {
        let mut ctx = self.ctx.lock();
        self.sync_clock(&mut ctx);
        ctx
    }

    fn sync_clock(&self, ctx: &mut KernelContext) {
        let hz = u128::from(ctx.config().tick_hz);
        let ticks = self.boot.elapsed().as_millis().saturating_mul(hz) / 1000;
        if ctx.advance_to(u64::try_from(ticks).unwrap_or(u64::MAX)) > 0 {
            let _ = ctx.procs_mut().execute_next();
        }
    }

    /// Runs `f` inside the kernel and wakes every parked process afterwards.
    pub fn with_context<R>(&self, f: impl FnOnce(&mut KernelContext) -> R) -> R {
        let result = f(&mut self.enter());
        self.changed.notify_all();
        result
    }

    /// Creates a process and returns its handle.
    pub fn spawn(self: &Arc<Self>, parent: Pid, command: &str) -> Result<HostProcess> {
        let pid = self.with_context(|ctx| ctx.spawn(parent, command))?;
        Ok(HostProcess { pid, kernel: Arc::clone(self) })
    }

    /// Handle for an existing process.
    pub fn process(self: &Arc<Self>, pid: Pid) -> Result<HostProcess> {
        if self.enter().procs().exists(pid) {
            Ok(HostProcess { pid, kernel: Arc::clone(self) })
        } else {
            Err(SysError::NotFound)
        }
    }

    /// Terminates `pid` and reschedules.
    pub fn kill(&self, pid: Pid, status: i32) -> Result<()> {
        self.with_context(|ctx| -> Result<()> {
            ctx.kill(pid, status)?;
            let _ = ctx.procs_mut().execute_next();
            Ok(())
        })
    }

    /// Delivers interrupt `vector` to its watchers.
    pub fn raise_irq(&self, vector: u32) -> usize {
        self.with_context(|ctx| {
            let delivered = ctx.raise_irq(vector);
            let _ = ctx.procs_mut().execute_next();
            delivered
        })
    }

    /// Snapshot of every process.
    pub fn snapshot(&self) -> Vec<ProcessInfo> {
        self.enter().procs().snapshot()
    }

    /// Pages currently held by shares.
    pub fn used_pages(&self) -> usize {
        self.enter().memory().used_pages()
    }
}

/// Handle through which one simulated process makes system calls.
#[derive(Clone)]
pub struct HostProcess {
    pid: Pid,
    kernel: Arc<HostKernel>,
}

impl HostProcess {
    /// The kernel this process runs on.
    pub fn kernel(&self) -> &Arc<HostKernel> {
        &self.kernel
    }

    /// Terminates the process.
    pub fn exit(self, status: i32) -> Result<()> {
        self.kernel.kill(self.pid, status)
    }
}

impl core::fmt::Debug for HostProcess {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HostProcess").field("pid", &self.pid).finish()
    }
}

impl ProcessCtl for HostProcess {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn wakeup(&self, pid: Pid) -> Result<()> {
        self.kernel.with_context(|ctx| -> Result<()> {
            let _ = ctx.procs_mut().wakeup(pid)?;
            let _ = ctx.procs_mut().execute_next();
            Ok(())
        })
    }

    fn resume(&self, pid: Pid) -> Result<()> {
        self.kernel.with_context(|ctx| -> Result<()> {
            ctx.procs_mut().resume(pid)?;
            let _ = ctx.procs_mut().execute_next();
            Ok(())
        })
    }

    fn yield_now(&self) -> Result<()> {
        self.kernel.with_context(|ctx| -> Result<()> {
            if !ctx.procs().exists(self.pid) {
                return Err(SysError::NotFound);
            }
            let _ = ctx.procs_mut().execute_next();
            Ok(())
        })?;
        std::thread::yield_now();
        Ok(())
    }

    fn enter_sleep(&self, deadline: Option<u64>) -> Result<()> {
        let mut ctx = self.kernel.enter();
        match ctx.procs_mut().sleep(self.pid, deadline)? {
            SleepOutcome::PendingWakeup => return Ok(()),
            SleepOutcome::Slept => {}
        }
        let _ = ctx.procs_mut().execute_next();
        loop {
            match ctx.procs().state(self.pid) {
                None => return Err(SysError::NotFound),
                Some(ProcessState::Sleeping) => {}
                Some(_) => return Ok(()),
            }
            let _ = self.kernel.changed.wait_for(&mut ctx, SLEEP_POLL);
            self.kernel.sync_clock(&mut ctx);
        }
    }

    fn info(&self, pid: Pid) -> Result<ProcessInfo> {
        self.kernel.enter().info(pid)
    }

    fn timer(&self) -> Result<TimerInfo> {
        Ok(self.kernel.enter().timer())
    }

    fn next_event(&self) -> Option<ProcessEvent> {
        self.kernel.enter().next_event(self.pid)
    }

    fn watch_irq(&self, vector: u32) -> Result<()> {
        Ok(self.kernel.enter().procs_mut().watch_irq(self.pid, vector)?)
    }
}

impl VmShare for HostProcess {
    fn share_create(&self, pid: Pid, message_size: usize) -> Result<ShareOutcome> {
        self.kernel.with_context(|ctx| -> Result<ShareOutcome> {
            let outcome = ctx.share_create(self.pid, pid, message_size)?;
            let _ = ctx.procs_mut().execute_next();
            Ok(outcome)
        })
    }

    fn share_read(&self, pid: Pid) -> Result<MemoryShare> {
        self.kernel.enter().share_read(self.pid, pid)
    }

    fn share_delete(&self, pid: Pid) -> Result<()> {
        self.kernel.with_context(|ctx| -> Result<()> {
            ctx.share_delete(self.pid, pid)?;
            let _ = ctx.procs_mut().execute_next();
            Ok(())
        })
    }
}
