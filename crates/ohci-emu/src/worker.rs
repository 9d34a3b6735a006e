//! Per-class workers.
//!
//! One control worker and one bulk worker scan their ED lists the way OHCI hardware does
//! (ControlCurrentED/BulkCurrentED walk, CLF/BLF snapping the walk back to the head). A small pool
//! of interrupt workers services the periodic schedule: each worker claims one interrupt ED at a
//! time and polls it at the rate implied by the HCCA interrupt tree.
//!
//! Workers start parked. The register facade drives them through a [`WorkerGate`]: enabling a
//! class wakes its workers, disabling it blocks the writer until every worker of the class has
//! parked (and dropped its current ED).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::controller::{lock, Shared};
use crate::descriptor::{
    check_descriptor_ptr, walk_ed_list, EndpointDescriptor, TransferClass, TransferDescriptor,
    MAX_ED_VISITS, TD_SIZE,
};
use crate::error::DescriptorError;
use crate::hcca::{Hcca, INTERRUPT_TABLE_LEN};
use crate::native::PipeId;
use crate::regs::InterruptFlags;
use crate::transfer::{self, Attempt, Job};

/// Longest interrupt polling period, in frames.
pub const MAX_CYCLE_TIME: u8 = INTERRUPT_TABLE_LEN as u8;

/// Polling period for an ED reachable from `reachable` of the 32 interrupt table slots.
///
/// Rounds `32 / reachable` down to a power of two: one slot polls every 32 frames, 16 or more
/// slots poll every frame.
pub fn cycle_time(reachable: usize) -> u8 {
    let k = reachable.clamp(1, INTERRUPT_TABLE_LEN);
    (INTERRUPT_TABLE_LEN / k.next_power_of_two()) as u8
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    Control,
    Bulk,
    Interrupt(usize),
}

impl WorkerKind {
    pub fn class(self) -> TransferClass {
        match self {
            Self::Control => TransferClass::Control,
            Self::Bulk => TransferClass::Bulk,
            Self::Interrupt(_) => TransferClass::Interrupt,
        }
    }
}

/// Snapshot of one worker's state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerStatus {
    pub kind: WorkerKind,
    /// ED being executed (control/bulk) or claimed (interrupt); 0 when idle.
    pub current_ed: u32,
    pub current_td: u32,
    pub pipe: Option<PipeId>,
    /// Blocked on a native completion.
    pub waiting: bool,
    /// Polling period of the claimed ED in frames; 0 for control/bulk workers.
    pub cycle: u8,
}

const NO_PIPE: u32 = u32::MAX;

/// Live worker state, readable from any thread.
#[derive(Debug)]
pub(crate) struct WorkerRecord {
    kind: WorkerKind,
    /// Interrupt ED this worker is trying to hold; compared by sibling workers.
    claim: AtomicU32,
    current_ed: AtomicU32,
    current_td: AtomicU32,
    pipe: AtomicU32,
    waiting: AtomicBool,
    cycle: AtomicU8,
}

impl WorkerRecord {
    pub fn new(kind: WorkerKind) -> Self {
        Self {
            kind,
            claim: AtomicU32::new(0),
            current_ed: AtomicU32::new(0),
            current_td: AtomicU32::new(0),
            pipe: AtomicU32::new(NO_PIPE),
            waiting: AtomicBool::new(false),
            cycle: AtomicU8::new(0),
        }
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    pub fn current_ed(&self) -> u32 {
        self.current_ed.load(Ordering::SeqCst)
    }

    fn bind(&self, ed: u32, td: u32) {
        self.current_ed.store(ed, Ordering::SeqCst);
        self.current_td.store(td, Ordering::SeqCst);
    }

    fn set_td(&self, td: u32) {
        self.current_td.store(td, Ordering::SeqCst);
    }

    fn unbind(&self) {
        self.claim.store(0, Ordering::SeqCst);
        self.current_ed.store(0, Ordering::SeqCst);
        self.current_td.store(0, Ordering::SeqCst);
        self.pipe.store(NO_PIPE, Ordering::SeqCst);
        self.cycle.store(0, Ordering::SeqCst);
    }

    pub fn begin_wait(&self, pipe: PipeId) {
        self.pipe.store(u32::from(pipe.0), Ordering::SeqCst);
        self.waiting.store(true, Ordering::SeqCst);
    }

    pub fn end_wait(&self) {
        self.waiting.store(false, Ordering::SeqCst);
    }

    pub fn status(&self) -> WorkerStatus {
        let pipe = self.pipe.load(Ordering::SeqCst);
        WorkerStatus {
            kind: self.kind,
            current_ed: self.current_ed.load(Ordering::SeqCst),
            current_td: self.current_td.load(Ordering::SeqCst),
            pipe: (pipe != NO_PIPE).then_some(PipeId(pipe as u8)),
            waiting: self.waiting.load(Ordering::SeqCst),
            cycle: self.cycle.load(Ordering::SeqCst),
        }
    }
}

/// Claim words of the interrupt worker pool.
///
/// A worker publishes the ED it wants in its own claim word, then compares against every
/// sibling's word. On a match it retracts and backs off, so two racing workers may both lose but
/// never both win. Releasing a claim only clears the worker's own word.
#[derive(Debug)]
pub(crate) struct InterruptPool {
    records: Vec<Arc<WorkerRecord>>,
}

impl InterruptPool {
    pub fn new(workers: usize) -> Self {
        Self {
            records: (0..workers)
                .map(|i| Arc::new(WorkerRecord::new(WorkerKind::Interrupt(i))))
                .collect(),
        }
    }

    pub fn records(&self) -> &[Arc<WorkerRecord>] {
        &self.records
    }

    /// Claims `ed` for worker `me` unless a sibling already holds it.
    pub fn try_claim(&self, me: usize, ed: u32) -> bool {
        let record = &self.records[me];
        record.claim.store(ed, Ordering::SeqCst);
        let taken = self
            .records
            .iter()
            .enumerate()
            .any(|(i, r)| i != me && r.claim.load(Ordering::SeqCst) == ed);
        if taken {
            record.claim.store(0, Ordering::SeqCst);
            return false;
        }
        record.current_ed.store(ed, Ordering::SeqCst);
        true
    }
}

#[derive(Debug, Default)]
struct GateState {
    enabled: bool,
    parked: bool,
    kicked: bool,
    shutdown: bool,
}

/// Enable/disable handshake between the register facade and one worker.
#[derive(Debug, Default)]
pub(crate) struct WorkerGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl WorkerGate {
    fn state(&self) -> MutexGuard<'_, GateState> {
        lock(&self.state)
    }

    pub fn enable(&self) {
        let mut st = self.state();
        st.enabled = true;
        st.kicked = true;
        self.cond.notify_all();
    }

    /// Wakes the worker for another pass if it is sleeping between passes.
    pub fn kick(&self) {
        let mut st = self.state();
        st.kicked = true;
        self.cond.notify_all();
    }

    pub fn request_disable(&self) {
        let mut st = self.state();
        st.enabled = false;
        self.cond.notify_all();
    }

    /// Blocks until the worker has parked after [`WorkerGate::request_disable`].
    pub fn wait_parked(&self) {
        let mut st = self.state();
        while !st.parked && !st.shutdown {
            st = match self.cond.wait(st) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    pub fn shutdown(&self) {
        let mut st = self.state();
        st.shutdown = true;
        st.enabled = false;
        self.cond.notify_all();
    }

    pub fn is_enabled(&self) -> bool {
        let st = self.state();
        st.enabled && !st.shutdown
    }

    /// Worker side: returns immediately while enabled, otherwise runs `on_park`, reports the
    /// worker parked and sleeps until re-enabled. Returns false on shutdown.
    fn park_until_enabled(&self, on_park: impl FnOnce()) -> bool {
        {
            let st = self.state();
            if st.shutdown {
                return false;
            }
            if st.enabled {
                return true;
            }
        }
        on_park();

        let mut st = self.state();
        st.parked = true;
        self.cond.notify_all();
        while !st.enabled && !st.shutdown {
            st = match self.cond.wait(st) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        st.parked = false;
        !st.shutdown
    }

    /// Worker side: sleeps for `delay` unless kicked, disabled or shut down first.
    fn pause(&self, delay: Duration) {
        let st = self.state();
        let mut st = match self
            .cond
            .wait_timeout_while(st, delay, |s| !s.kicked && s.enabled && !s.shutdown)
        {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        };
        st.kicked = false;
    }
}

fn schedule_fault(ctx: &Shared, class: TransferClass, err: DescriptorError) {
    warn!(?class, %err, "schedule fault");
    ctx.with_regs(|regs| {
        regs.raise(InterruptFlags::UE);
        regs.set_current_ed(class, 0);
    });
}

struct Step {
    next: u32,
    attempted: bool,
}

/// Visits one ED of a control/bulk list, executing its head TD if it is runnable.
fn step(
    ctx: &Shared,
    class: TransferClass,
    ed_addr: u32,
    record: &WorkerRecord,
) -> Result<Step, DescriptorError> {
    let mem = &*ctx.mem;
    let ed = EndpointDescriptor::read(mem, ed_addr)?;
    if !ed.runnable() || ed.control.isochronous() {
        return Ok(Step {
            next: ed.next,
            attempted: false,
        });
    }
    let td_addr = check_descriptor_ptr(mem, ed.head.addr, TD_SIZE)?;
    let td = TransferDescriptor::read(mem, td_addr)?;

    record.bind(ed_addr, td_addr);
    let job = Job {
        class,
        ed_addr,
        ed,
        td_addr,
        td,
        cycle: 0,
    };
    let result = transfer::execute(ctx, &job, record);
    record.unbind();
    let attempt = result?;
    trace!(?class, ed = format_args!("{ed_addr:#x}"), ?attempt, "ED visited");

    Ok(Step {
        next: ed.next,
        attempted: attempt != Attempt::Aborted,
    })
}

/// One scan pass over the control or bulk list. Returns true when any TD was attempted.
fn list_pass(ctx: &Shared, class: TransferClass, gate: &WorkerGate, record: &WorkerRecord) -> bool {
    let mut attempted = false;
    let mut seen = HashSet::new();

    loop {
        if !gate.is_enabled() {
            // Disabled mid-pass: leave the fill bit as the host stack last wrote it.
            return attempted;
        }
        let (current, restarted) = ctx.with_regs(|regs| {
            let current = regs.current_ed(class);
            if current != 0 || !regs.list_filled(class) {
                return (current, false);
            }
            let head = regs.list_head(class);
            regs.set_list_filled(class, false);
            regs.set_current_ed(class, head);
            (head, true)
        });
        if current == 0 {
            break;
        }
        if restarted {
            seen.clear();
        }
        if seen.len() >= MAX_ED_VISITS {
            schedule_fault(ctx, class, DescriptorError::ListTooLong(MAX_ED_VISITS));
            return attempted;
        }
        if !seen.insert(current) {
            schedule_fault(ctx, class, DescriptorError::Cycle(current));
            return attempted;
        }

        match step(ctx, class, current, record) {
            Ok(step) => {
                attempted |= step.attempted;
                ctx.with_regs(|regs| {
                    // The host stack may have repositioned the walk meanwhile.
                    if regs.current_ed(class) == current {
                        regs.set_current_ed(class, step.next);
                    }
                });
            }
            Err(err) => {
                schedule_fault(ctx, class, err);
                return attempted;
            }
        }
    }

    if attempted {
        // TDs may remain queued; scan the list again like hardware does after CLF/BLF.
        ctx.with_regs(|regs| regs.set_list_filled(class, true));
    }
    attempted
}

/// Thread body of the control and bulk workers.
pub(crate) fn run_list_worker(
    ctx: Arc<Shared>,
    class: TransferClass,
    gate: Arc<WorkerGate>,
    record: Arc<WorkerRecord>,
) {
    debug!(?class, "worker started");
    loop {
        let parked = gate.park_until_enabled(|| {
            record.unbind();
            ctx.with_regs(|regs| regs.set_current_ed(class, 0));
            trace!(?class, "worker parked");
        });
        if !parked {
            break;
        }
        let active = list_pass(&ctx, class, &gate, &record);
        gate.pause(ctx.config.backoff.delay(active));
    }
    debug!(?class, "worker stopped");
}

/// An interrupt ED held by one interrupt worker.
#[derive(Clone, Copy, Debug)]
struct Claim {
    ed: u32,
    cycle: u8,
    idle_left: u32,
}

struct InterruptWorker {
    ctx: Arc<Shared>,
    index: usize,
    pool: Arc<InterruptPool>,
    claim: Option<Claim>,
}

impl InterruptWorker {
    fn me(&self) -> &WorkerRecord {
        &self.pool.records()[self.index]
    }

    fn release(&mut self) {
        if let Some(claim) = self.claim.take() {
            trace!(
                worker = self.index,
                ed = format_args!("{:#x}", claim.ed),
                "interrupt ED released"
            );
        }
        self.me().unbind();
    }

    /// Looks for a runnable interrupt ED no sibling has claimed, starting at this worker's share
    /// of the table so the pool spreads across the tree.
    fn find_claim(&mut self) -> Result<Option<Claim>, DescriptorError> {
        let mem = &*self.ctx.mem;
        let Some(hcca) = Hcca::at(mem, self.ctx.with_regs(|regs| regs.hcca())) else {
            return Ok(None);
        };
        let start = self.index * INTERRUPT_TABLE_LEN / self.pool.records().len();
        for i in 0..INTERRUPT_TABLE_LEN {
            let slot = (start + i) % INTERRUPT_TABLE_LEN;
            let head = hcca.interrupt_head(mem, slot)?;
            for ed_addr in walk_ed_list(mem, head)? {
                let ed = EndpointDescriptor::read(mem, ed_addr)?;
                if !ed.runnable() || ed.control.isochronous() {
                    continue;
                }
                if !self.pool.try_claim(self.index, ed_addr) {
                    continue;
                }
                let cycle = match hcca.reachable_slots(mem, ed_addr) {
                    Ok(reachable) => cycle_time(reachable),
                    Err(err) => {
                        self.me().unbind();
                        return Err(err);
                    }
                };
                self.me().cycle.store(cycle, Ordering::SeqCst);
                debug!(
                    worker = self.index,
                    ed = format_args!("{ed_addr:#x}"),
                    cycle,
                    "interrupt ED claimed"
                );
                return Ok(Some(Claim {
                    ed: ed_addr,
                    cycle,
                    idle_left: self.ctx.config.interrupt_idle_cycles,
                }));
            }
        }
        Ok(None)
    }

    /// Executes the claimed ED once. Returns the polling period for the next wake.
    fn poll(&mut self) -> Result<Option<Duration>, DescriptorError> {
        if self.claim.is_none() {
            self.claim = self.find_claim()?;
        }
        let Some(mut claim) = self.claim else {
            return Ok(None);
        };

        let mem = &*self.ctx.mem;
        let ed = EndpointDescriptor::read(mem, claim.ed)?;
        let attempt = if ed.runnable() && !ed.control.isochronous() {
            let td_addr = check_descriptor_ptr(mem, ed.head.addr, TD_SIZE)?;
            let td = TransferDescriptor::read(mem, td_addr)?;
            let job = Job {
                class: TransferClass::Interrupt,
                ed_addr: claim.ed,
                ed,
                td_addr,
                td,
                cycle: claim.cycle,
            };
            self.me().set_td(td_addr);
            self.ctx
                .with_regs(|regs| regs.set_current_ed(TransferClass::Interrupt, claim.ed));
            let result = transfer::execute(&self.ctx, &job, self.me());
            self.ctx
                .with_regs(|regs| regs.set_current_ed(TransferClass::Interrupt, 0));
            self.me().set_td(0);
            Some(result?)
        } else {
            None
        };

        match attempt {
            Some(Attempt::Completed) => {
                claim.idle_left = self.ctx.config.interrupt_idle_cycles;
            }
            Some(Attempt::Aborted) => return Ok(Some(Duration::ZERO)),
            Some(Attempt::Retired) => {
                // The ED is halted now; hand it back until the host stack recovers it.
                self.release();
                return Ok(Some(Duration::from_millis(u64::from(claim.cycle))));
            }
            Some(Attempt::Queued) | None => {
                claim.idle_left = claim.idle_left.saturating_sub(1);
                if claim.idle_left == 0 {
                    self.release();
                    return Ok(Some(Duration::from_millis(u64::from(claim.cycle))));
                }
            }
        }
        self.claim = Some(claim);
        Ok(Some(Duration::from_millis(u64::from(claim.cycle))))
    }
}

/// Thread body of interrupt worker `index`.
pub(crate) fn run_interrupt_worker(
    ctx: Arc<Shared>,
    index: usize,
    gate: Arc<WorkerGate>,
    pool: Arc<InterruptPool>,
) {
    debug!(worker = index, "interrupt worker started");
    let mut worker = InterruptWorker {
        ctx,
        index,
        pool,
        claim: None,
    };
    loop {
        let parked = gate.park_until_enabled(|| worker.release());
        if !parked {
            break;
        }
        let backoff = worker.ctx.config.backoff;
        let delay = match worker.poll() {
            Ok(Some(period)) => period.max(backoff.delay(true)),
            Ok(None) => backoff.delay(false),
            Err(err) => {
                worker.release();
                schedule_fault(&worker.ctx, TransferClass::Interrupt, err);
                backoff.delay(false)
            }
        };
        gate.pause(delay);
    }
    worker.release();
    debug!(worker = index, "interrupt worker stopped");
}
