//! The controller handle: owns the worker and dispatcher threads and exposes the MMIO surface.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use tracing::{debug, info};

use crate::config::OhciConfig;
use crate::descriptor::TransferClass;
use crate::dispatch::{self, CompletionRouter};
use crate::error::OhciError;
use crate::facade::{OhciRegs, SideEffect};
use crate::memory::GuestMemory;
use crate::native::{EventSink, LinkSpeed, NativeHost};
use crate::regs::InterruptFlags;
use crate::root_hub::PortState;
use crate::split::SplitTracker;
use crate::transfer::FailureLedger;
use crate::worker::{self, InterruptPool, WorkerGate, WorkerKind, WorkerRecord, WorkerStatus};

/// Receives level changes of the emulated interrupt line.
///
/// Called with controller state locked; implementations must not call back into the controller.
pub trait InterruptLine: Send + Sync {
    fn set_level(&self, level: bool);
}

/// Locks `mutex`, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// State shared by the register facade, the workers and the dispatcher.
pub(crate) struct Shared {
    pub config: OhciConfig,
    pub mem: Arc<dyn GuestMemory>,
    pub native: Mutex<Box<dyn NativeHost>>,
    pub completions: CompletionRouter,
    pub split: Mutex<SplitTracker>,
    pub ledger: FailureLedger,
    regs: Mutex<OhciRegs>,
    irq_line: Option<Arc<dyn InterruptLine>>,
    irq_level: AtomicBool,
}

impl Shared {
    /// Runs `f` in the register critical section, then refreshes the interrupt line.
    pub fn with_regs<R>(&self, f: impl FnOnce(&mut OhciRegs) -> R) -> R {
        let mut regs = lock(&self.regs);
        let out = f(&mut regs);
        let level = regs.irq_level();
        if self.irq_level.swap(level, Ordering::SeqCst) != level {
            if let Some(line) = &self.irq_line {
                line.set_level(level);
            }
        }
        out
    }

    /// Speed transfers run at, or `None` without a device.
    pub fn link_speed(&self) -> Option<LinkSpeed> {
        match self.with_regs(|regs| regs.port().state()) {
            PortState::Detached => None,
            PortState::Attached => Some(LinkSpeed::Full),
            PortState::Operational(speed) => Some(speed),
        }
    }

    /// Probes the native port and reports a connect if a device is present.
    fn probe(&self) {
        let attached = lock(&self.native).probe_attach();
        debug!(attached, "native attach probe");
        if attached {
            dispatch::attach_changed(self, true);
        } else {
            self.completions.set_detached(true);
        }
    }
}

struct WorkerHandle {
    gate: Arc<WorkerGate>,
    record: Arc<WorkerRecord>,
    thread: Option<JoinHandle<()>>,
}

/// OHCI host controller emulated on top of a native USB host peripheral.
pub struct OhciController {
    shared: Arc<Shared>,
    sink: EventSink,
    workers: Vec<WorkerHandle>,
    dispatcher: Option<JoinHandle<()>>,
}

impl OhciController {
    pub fn new(
        config: OhciConfig,
        memory: Arc<dyn GuestMemory>,
        native: Box<dyn NativeHost>,
    ) -> Result<Self, OhciError> {
        Self::build(config, memory, native, None)
    }

    /// Like [`OhciController::new`], additionally driving `line` with the interrupt level.
    pub fn with_interrupt_line(
        config: OhciConfig,
        memory: Arc<dyn GuestMemory>,
        native: Box<dyn NativeHost>,
        line: Arc<dyn InterruptLine>,
    ) -> Result<Self, OhciError> {
        Self::build(config, memory, native, Some(line))
    }

    fn build(
        config: OhciConfig,
        memory: Arc<dyn GuestMemory>,
        mut native: Box<dyn NativeHost>,
        irq_line: Option<Arc<dyn InterruptLine>>,
    ) -> Result<Self, OhciError> {
        config.validate()?;

        let (tx, rx) = mpsc::channel();
        let sink = EventSink::new(tx);
        native.set_event_sink(sink.clone());

        let interrupt_workers = config.interrupt_workers;
        let shared = Arc::new(Shared {
            split: Mutex::new(SplitTracker::new(config.hub_ports)),
            config,
            mem: memory,
            native: Mutex::new(native),
            completions: CompletionRouter::default(),
            ledger: FailureLedger::default(),
            regs: Mutex::new(OhciRegs::new()),
            irq_line,
            irq_level: AtomicBool::new(false),
        });

        let mut controller = Self {
            shared,
            sink,
            workers: Vec::new(),
            dispatcher: None,
        };

        let dispatcher_ctx = controller.shared.clone();
        controller.dispatcher = Some(spawn("ohci-dispatch", move || {
            dispatch::run_dispatcher(dispatcher_ctx, rx)
        })?);

        for (kind, class) in [
            (WorkerKind::Control, TransferClass::Control),
            (WorkerKind::Bulk, TransferClass::Bulk),
        ] {
            let gate = Arc::new(WorkerGate::default());
            let record = Arc::new(WorkerRecord::new(kind));
            let (ctx, g, r) = (controller.shared.clone(), gate.clone(), record.clone());
            let name = format!("ohci-{class:?}").to_lowercase();
            let thread = spawn(&name, move || worker::run_list_worker(ctx, class, g, r))?;
            controller.workers.push(WorkerHandle {
                gate,
                record,
                thread: Some(thread),
            });
        }

        let pool = Arc::new(InterruptPool::new(interrupt_workers));
        for (index, record) in pool.records().iter().enumerate() {
            let gate = Arc::new(WorkerGate::default());
            let (ctx, g, p) = (controller.shared.clone(), gate.clone(), pool.clone());
            let thread = spawn(&format!("ohci-interrupt-{index}"), move || {
                worker::run_interrupt_worker(ctx, index, g, p)
            })?;
            controller.workers.push(WorkerHandle {
                gate,
                record: record.clone(),
                thread: Some(thread),
            });
        }

        Ok(controller)
    }

    /// Brings the register block to its power-on state and probes the native port. Until this
    /// runs, reads return 0 and writes are ignored.
    pub fn init(&self) {
        self.shared.with_regs(|regs| {
            regs.reset();
            regs.set_initialized();
        });
        self.shared.probe();
        info!("OHCI controller initialized");
    }

    pub fn read(&self, offset: u32) -> u32 {
        self.shared.with_regs(|regs| regs.read(offset))
    }

    /// Host-stack register write. May block: disabling a list waits for its workers to park, and
    /// a port reset waits for the native bus reset.
    pub fn write(&self, offset: u32, value: u32) {
        let mem = self.shared.mem.clone();
        let effects = self
            .shared
            .with_regs(|regs| regs.write(&*mem, offset, value));
        for effect in effects {
            self.apply(effect);
        }
    }

    pub fn irq_level(&self) -> bool {
        self.shared.with_regs(|regs| regs.irq_level())
    }

    /// Sink to hand to code that reports native events outside [`NativeHost::set_event_sink`].
    pub fn event_sink(&self) -> EventSink {
        self.sink.clone()
    }

    pub fn worker_states(&self) -> Vec<WorkerStatus> {
        self.workers.iter().map(|w| w.record.status()).collect()
    }

    fn gates(&self, class: TransferClass) -> impl Iterator<Item = &WorkerGate> {
        self.workers
            .iter()
            .filter(move |w| w.record.kind().class() == class)
            .map(|w| &*w.gate)
    }

    fn disable_class(&self, class: TransferClass) {
        for gate in self.gates(class) {
            gate.request_disable();
        }
        // Interrupt waits are unbounded; abort them rather than waiting for the device.
        let aborted = if class == TransferClass::Interrupt {
            self.shared.completions.close_class(class)
        } else {
            Vec::new()
        };
        if !aborted.is_empty() {
            let mut native = lock(&self.shared.native);
            for pipe in aborted {
                native.stop_transfer(pipe);
            }
        }
        for gate in self.gates(class) {
            gate.wait_parked();
        }
        debug!(?class, "class parked");
    }

    fn apply(&self, effect: SideEffect) {
        match effect {
            SideEffect::EnableClass(class) => {
                self.shared.completions.open_class(class);
                if class != TransferClass::Interrupt {
                    self.shared
                        .with_regs(|regs| regs.set_list_filled(class, true));
                }
                for gate in self.gates(class) {
                    gate.enable();
                }
            }
            SideEffect::DisableClass(class) => self.disable_class(class),
            SideEffect::KickClass(class) => {
                for gate in self.gates(class) {
                    gate.kick();
                }
            }
            SideEffect::HostControllerReset => self.reset(),
            SideEffect::PortReset => {
                let speed = lock(&self.shared.native).bus_reset();
                debug!(?speed, "root port reset complete");
                self.shared.with_regs(|regs| {
                    regs.port_mut().complete_reset(speed);
                    if regs.port().has_changes() {
                        regs.raise(InterruptFlags::RHSC);
                    }
                });
            }
        }
    }

    fn reset(&self) {
        info!("host controller reset");
        for class in [
            TransferClass::Control,
            TransferClass::Bulk,
            TransferClass::Interrupt,
        ] {
            for gate in self.gates(class) {
                gate.request_disable();
            }
            let aborted = self.shared.completions.close_class(class);
            let mut native = lock(&self.shared.native);
            for pipe in aborted {
                native.stop_transfer(pipe);
            }
        }
        for worker in &self.workers {
            worker.gate.wait_parked();
        }

        self.shared.with_regs(|regs| {
            regs.reset();
            regs.clear_reset_request();
        });
        lock(&self.shared.split).reset();
        self.shared.ledger.reset();
        self.shared.probe();
    }
}

impl Drop for OhciController {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.gate.shutdown();
        }
        self.shared.completions.close_all();
        self.sink.shutdown();

        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
        if let Some(thread) = self.dispatcher.take() {
            let _ = thread.join();
        }
    }
}

fn spawn<F>(name: &str, f: F) -> Result<JoinHandle<()>, OhciError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|source| OhciError::Spawn {
            name: name.to_string(),
            source,
        })
}
