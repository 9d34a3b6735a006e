//! Transfer execution: one ED/TD pair becomes one native transfer attempt.
//!
//! A worker hands [`execute`] the TD at the head of a runnable ED. The engine programs the native
//! pipe, starts the transfer, blocks on the completion slot armed for that pipe (with the
//! class timeout), and finally folds the outcome back into the TD and ED:
//!
//! | outcome                        | TD                          | queue                         |
//! |--------------------------------|-----------------------------|-------------------------------|
//! | success                        | CC=NoError, EC=0, CBP+=n    | retired, toggle carried       |
//! | stall                          | CC=Stall, EC=3              | retired, ED halted            |
//! | device gone / control timeout  | CC=DNR, EC=3                | retired, ED halted            |
//! | native error / start failure   | CC=DNR, EC=3                | stays queued (self-halt past threshold) |
//! | NAK, bulk / interrupt timeout  | CC=DNR, EC=3                | stays queued                  |
//! | aborted                        | untouched                   | untouched                     |

use std::collections::HashMap;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::controller::{lock, Shared};
use crate::descriptor::{
    ConditionCode, EndpointDescriptor, TransferClass, TransferDescriptor, TransferDirection,
    TD_ERROR_COUNT_EXCEEDED,
};
use crate::done::{self, Retire};
use crate::error::{DescriptorError, MemoryError};
use crate::native::{
    DeviceRoute, LinkSpeed, NativeCompletion, NativeStatus, PipeDirection, PipeId, PipeKind,
    PipeSetup,
};
use crate::usb::{SetupPacket, SETUP_PACKET_LEN};
use crate::worker::WorkerRecord;

/// One TD to execute on behalf of its ED.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Job {
    pub class: TransferClass,
    pub ed_addr: u32,
    pub ed: EndpointDescriptor,
    pub td_addr: u32,
    pub td: TransferDescriptor,
    /// Polling period in frames; only meaningful for the interrupt class.
    pub cycle: u8,
}

/// What happened to the TD.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Attempt {
    /// Transfer succeeded and the TD was retired.
    Completed,
    /// Transfer failed and the TD was retired with its ED halted.
    Retired,
    /// Transfer failed; the TD is still queued for another try.
    Queued,
    /// The wait was abandoned; nothing was written back.
    Aborted,
}

#[derive(Debug)]
enum Outcome {
    Success(NativeCompletion),
    Stall,
    NotResponding,
    Failed,
    /// The device is busy (NAK) or the wait ran out; retried without counting as a failure.
    Busy,
    Aborted,
}

impl From<NativeCompletion> for Outcome {
    fn from(completion: NativeCompletion) -> Self {
        match completion.status {
            NativeStatus::Ok => Self::Success(completion),
            NativeStatus::Stall => Self::Stall,
            NativeStatus::Nak => Self::Busy,
            NativeStatus::Error => Self::Failed,
            NativeStatus::DeviceGone => Self::NotResponding,
            NativeStatus::Aborted => Self::Aborted,
        }
    }
}

/// Control transfer stage, derived from the TD direction and remaining length.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ControlStage {
    Setup,
    DataIn,
    DataOut,
    StatusIn,
    StatusOut,
}

impl ControlStage {
    fn classify(dir: TransferDirection, len: usize) -> Self {
        match (dir, len) {
            (TransferDirection::Setup, _) => Self::Setup,
            (TransferDirection::In, 0) => Self::StatusIn,
            (TransferDirection::In, _) => Self::DataIn,
            (TransferDirection::Out, 0) => Self::StatusOut,
            (TransferDirection::Out, _) => Self::DataOut,
        }
    }
}

enum Start {
    Setup(SetupPacket),
    Send(Vec<u8>),
    Receive(usize),
}

/// A fully prepared native request.
struct Request {
    pipe: PipeId,
    address: u8,
    route: DeviceRoute,
    pipe_setup: PipeSetup,
    toggle: Option<bool>,
    start: Start,
    timeout: Option<Duration>,
}

/// Consecutive failed attempts per ED.
///
/// Kept beside the descriptors rather than in them: the controller only owns the ED head word and
/// skip bit.
#[derive(Debug, Default)]
pub(crate) struct FailureLedger {
    counts: Mutex<HashMap<u32, u8>>,
}

impl FailureLedger {
    pub fn record_failure(&self, ed: u32) -> u8 {
        let mut counts = lock(&self.counts);
        let count = counts.entry(ed).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    pub fn clear(&self, ed: u32) {
        lock(&self.counts).remove(&ed);
    }

    pub fn reset(&self) {
        lock(&self.counts).clear();
    }
}

/// Native polling interval for an interrupt pipe with a `cycle`-frame period.
///
/// High-speed links count in microframes with a `2^(n-1)` encoding, so a period of `c` frames
/// becomes exponent `4 + log2(c)`.
pub(crate) fn native_interval(link: LinkSpeed, cycle: u8) -> u8 {
    let cycle = cycle.max(1);
    match link {
        LinkSpeed::High => 4 + cycle.trailing_zeros() as u8,
        LinkSpeed::Full | LinkSpeed::Low => cycle,
    }
}

/// Performs one transfer attempt for `job`, blocking until completion or timeout.
pub(crate) fn execute(
    ctx: &Shared,
    job: &Job,
    record: &WorkerRecord,
) -> Result<Attempt, DescriptorError> {
    let len = job.td.length()?;
    if len > 0 && !ctx.mem.contains(job.td.cbp, len) {
        return Err(MemoryError {
            addr: job.td.cbp,
            len,
        }
        .into());
    }
    let Some(dir) = job.ed.resolve_direction(job.class, &job.td) else {
        warn!(
            td = format_args!("{:#x}", job.td_addr),
            "TD carries a reserved direction code"
        );
        return finish(ctx, job, None, len, PipeId::CONTROL, Outcome::Failed);
    };

    let request = match prepare(ctx, job, dir, len)? {
        Ok(request) => request,
        Err(outcome) => return finish(ctx, job, Some(dir), len, PipeId::CONTROL, outcome),
    };
    let pipe = request.pipe;
    let setup = match request.start {
        Start::Setup(setup) => Some(setup),
        _ => None,
    };
    let outcome = issue(ctx, job, request, record);
    let attempt = finish(ctx, job, Some(dir), len, pipe, outcome)?;

    if let (Some(setup), Attempt::Completed) = (setup, attempt) {
        lock(&ctx.split).observe_setup(job.ed.control.function_address(), setup);
    }
    Ok(attempt)
}

fn route_for(ctx: &Shared, link: LinkSpeed, job: &Job) -> DeviceRoute {
    let address = job.ed.control.function_address();
    match link {
        LinkSpeed::High => lock(&ctx.split).route_for(address),
        LinkSpeed::Full | LinkSpeed::Low => DeviceRoute::direct(if job.ed.control.low_speed() {
            LinkSpeed::Low
        } else {
            LinkSpeed::Full
        }),
    }
}

fn read_buffer(ctx: &Shared, job: &Job, len: usize) -> Result<Vec<u8>, DescriptorError> {
    let mut buf = vec![0u8; len];
    if len > 0 {
        ctx.mem.read_physical(job.td.cbp, &mut buf)?;
    }
    Ok(buf)
}

/// Builds the native request for `job`, or the outcome to record when no request can be made.
fn prepare(
    ctx: &Shared,
    job: &Job,
    dir: TransferDirection,
    len: usize,
) -> Result<Result<Request, Outcome>, DescriptorError> {
    let Some(link) = ctx.link_speed() else {
        return Ok(Err(Outcome::NotResponding));
    };
    let address = job.ed.control.function_address();
    let endpoint = job.ed.control.endpoint_number();
    let max_packet_size = job.ed.control.max_packet_size();
    let route = route_for(ctx, link, job);
    let carried = job
        .td
        .control
        .explicit_toggle()
        .unwrap_or(job.ed.head.toggle_carry);

    if job.class == TransferClass::Control {
        let stage = ControlStage::classify(dir, len);
        trace!(address, endpoint, ?stage, len, "control stage");
        let start = match stage {
            ControlStage::Setup => {
                if len < SETUP_PACKET_LEN {
                    warn!(len, "SETUP TD shorter than a setup packet");
                    return Ok(Err(Outcome::Failed));
                }
                let mut raw = [0u8; SETUP_PACKET_LEN];
                ctx.mem.read_physical(job.td.cbp, &mut raw)?;
                Start::Setup(SetupPacket::from_bytes(raw))
            }
            ControlStage::DataIn | ControlStage::StatusIn => Start::Receive(len),
            ControlStage::DataOut | ControlStage::StatusOut => Start::Send(read_buffer(ctx, job, len)?),
        };
        return Ok(Ok(Request {
            pipe: PipeId::CONTROL,
            address,
            route,
            pipe_setup: PipeSetup {
                kind: PipeKind::Control,
                address,
                endpoint,
                direction: None,
                max_packet_size,
                interval: 0,
            },
            // SETUP always goes out as DATA0; the native side handles that itself.
            toggle: (stage != ControlStage::Setup).then_some(carried),
            start,
            timeout: Some(ctx.config.control_timeout()),
        }));
    }

    let (kind, timeout, interval) = match job.class {
        TransferClass::Bulk => (PipeKind::Bulk, Some(ctx.config.bulk_timeout()), 0),
        _ => (PipeKind::Interrupt, None, native_interval(link, job.cycle)),
    };
    let direction = match dir {
        TransferDirection::In => PipeDirection::In,
        TransferDirection::Out => PipeDirection::Out,
        TransferDirection::Setup => {
            warn!(address, endpoint, ?kind, "SETUP PID on a non-control endpoint");
            return Ok(Err(Outcome::Failed));
        }
    };
    let Some(binding) = ctx.config.resolve_pipe(kind, address, endpoint, direction) else {
        warn!(address, endpoint, ?kind, ?direction, "no native pipe bound for endpoint");
        return Ok(Err(Outcome::Failed));
    };
    let start = match direction {
        PipeDirection::In => Start::Receive(len),
        PipeDirection::Out => Start::Send(read_buffer(ctx, job, len)?),
    };
    Ok(Ok(Request {
        pipe: binding.pipe,
        address,
        route,
        pipe_setup: PipeSetup {
            kind,
            address,
            endpoint,
            direction: Some(direction),
            max_packet_size,
            interval,
        },
        toggle: Some(carried),
        start,
        timeout,
    }))
}

/// Starts the native transfer and waits for its completion.
fn issue(ctx: &Shared, job: &Job, request: Request, record: &WorkerRecord) -> Outcome {
    let pipe = request.pipe;
    // Armed before the transfer starts so that a completion racing the start is not lost.
    let rx = match ctx.completions.arm(pipe, job.class) {
        Ok(rx) => rx,
        Err(status) => return Outcome::from(NativeCompletion::failed(status)),
    };

    let started = {
        let mut native = lock(&ctx.native);
        native.configure_device(request.address, request.route);
        native
            .configure_pipe(pipe, &request.pipe_setup)
            .and_then(|()| {
                if let Some(toggle) = request.toggle {
                    native.set_toggle(pipe, toggle);
                }
                match &request.start {
                    Start::Setup(setup) => native.start_setup(*setup),
                    Start::Send(data) => native.start_send(pipe, data),
                    Start::Receive(len) => native.start_receive(pipe, *len),
                }
            })
    };
    if let Err(err) = started {
        ctx.completions.disarm(pipe);
        warn!(?pipe, %err, "native transfer failed to start");
        return Outcome::Failed;
    }

    record.begin_wait(pipe);
    let result = match request.timeout {
        Some(timeout) => rx.recv_timeout(timeout),
        None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
    };
    record.end_wait();

    match result {
        Ok(completion) => {
            trace!(?pipe, status = ?completion.status, transferred = completion.transferred, "native completion");
            Outcome::from(completion)
        }
        Err(RecvTimeoutError::Timeout) => {
            ctx.completions.disarm(pipe);
            lock(&ctx.native).stop_transfer(pipe);
            debug!(?pipe, class = ?job.class, "native transfer timed out");
            if job.class == TransferClass::Control {
                Outcome::NotResponding
            } else {
                Outcome::Busy
            }
        }
        Err(RecvTimeoutError::Disconnected) => Outcome::Aborted,
    }
}

/// Writes the outcome back into the TD and ED. `pipe` is only consulted on success.
fn finish(
    ctx: &Shared,
    job: &Job,
    dir: Option<TransferDirection>,
    len: usize,
    pipe: PipeId,
    outcome: Outcome,
) -> Result<Attempt, DescriptorError> {
    let mem = &*ctx.mem;
    let mut td = job.td;
    let failed = |td: &mut TransferDescriptor, cc: ConditionCode| {
        td.control = td
            .control
            .with_condition_code(cc)
            .with_error_count(TD_ERROR_COUNT_EXCEEDED);
    };
    let retire = |td: &TransferDescriptor, how: Retire| {
        ctx.with_regs(|regs| done::retire(regs, mem, job.ed_addr, job.td_addr, td, how))
    };
    let halt = Retire {
        halt: true,
        toggle: None,
    };

    match outcome {
        Outcome::Success(completion) => {
            let mut transferred = completion.transferred.min(len);
            if dir == Some(TransferDirection::In) {
                transferred = transferred.min(completion.data.len());
                if transferred > 0 {
                    mem.write_physical(td.cbp, &completion.data[..transferred])?;
                }
                if job.class == TransferClass::Control {
                    lock(&ctx.split).observe_in_data(
                        job.ed.control.function_address(),
                        &completion.data[..transferred],
                    );
                }
            }
            if transferred > 0 {
                td.cbp = td.cbp.wrapping_add(transferred as u32);
            }

            let toggle = lock(&ctx.native).toggle(pipe);
            td.control = td
                .control
                .with_condition_code(ConditionCode::NoError)
                .with_error_count(0)
                .with_toggle(toggle);
            ctx.ledger.clear(job.ed_addr);
            retire(
                &td,
                Retire {
                    halt: false,
                    toggle: Some(toggle),
                },
            )?;
            Ok(Attempt::Completed)
        }
        Outcome::Stall => {
            failed(&mut td, ConditionCode::Stall);
            ctx.ledger.clear(job.ed_addr);
            retire(&td, halt)?;
            Ok(Attempt::Retired)
        }
        Outcome::NotResponding => {
            failed(&mut td, ConditionCode::DeviceNotResponding);
            ctx.ledger.clear(job.ed_addr);
            retire(&td, halt)?;
            Ok(Attempt::Retired)
        }
        Outcome::Failed => {
            failed(&mut td, ConditionCode::DeviceNotResponding);
            let failures = ctx.ledger.record_failure(job.ed_addr);
            if failures > ctx.config.error_halt_threshold {
                debug!(
                    ed = format_args!("{:#x}", job.ed_addr),
                    failures, "error threshold exceeded; halting ED"
                );
                ctx.ledger.clear(job.ed_addr);
                retire(&td, halt)?;
                return Ok(Attempt::Retired);
            }
            td.write(mem, job.td_addr)?;
            Ok(Attempt::Queued)
        }
        Outcome::Busy => {
            failed(&mut td, ConditionCode::DeviceNotResponding);
            td.write(mem, job.td_addr)?;
            Ok(Attempt::Queued)
        }
        Outcome::Aborted => Ok(Attempt::Aborted),
    }
}
