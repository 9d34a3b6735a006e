#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use ohci_emu::regs::{
    reg_rh_port_status, InterruptFlags, CONTROL_HCFS_OPERATIONAL, PORT_PRSC, PORT_WRITE_SET_RESET,
    REG_CONTROL, REG_HCCA, REG_INTERRUPT_ENABLE,
};
use ohci_emu::{
    DescriptorRam, DeviceRoute, EventSink, GuestMemory, LinkSpeed, NativeCompletion, NativeError,
    NativeHost, NativeStatus, OhciConfig, OhciController, PipeId, PipeSetup, SetupPacket,
};

pub const RAM_BASE: u32 = 0x10000;
pub const RAM_SIZE: usize = 0x10000;

pub const HCCA: u32 = RAM_BASE;
pub const ED_BASE: u32 = RAM_BASE + 0x400;
pub const TD_BASE: u32 = RAM_BASE + 0x1000;
pub const BUF_BASE: u32 = RAM_BASE + 0x4000;

pub const fn ed_addr(i: u32) -> u32 {
    ED_BASE + i * 0x10
}

pub const fn td_addr(i: u32) -> u32 {
    TD_BASE + i * 0x10
}

pub const fn buf_addr(i: u32) -> u32 {
    BUF_BASE + i * 0x1000
}

// ED dword 0 fields.
pub const ED_DIR_OUT: u32 = 0b01 << 11;
pub const ED_DIR_IN: u32 = 0b10 << 11;
pub const ED_LOW_SPEED: u32 = 1 << 13;
pub const ED_SKIP: u32 = 1 << 14;

// ED head pointer flags.
pub const ED_HALTED: u32 = 1 << 0;
pub const ED_TOGGLE_CARRY: u32 = 1 << 1;

// TD dword 0 fields.
pub const TD_DP_SETUP: u32 = 0b00 << 19;
pub const TD_DP_OUT: u32 = 0b01 << 19;
pub const TD_DP_IN: u32 = 0b10 << 19;
pub const TD_T_FROM_TD: u32 = 1 << 25;
pub const TD_T_DATA1: u32 = 1 << 24;
pub const TD_CC_NOT_ACCESSED: u32 = 0xf << 28;

pub const CC_NO_ERROR: u32 = 0;
pub const CC_STALL: u32 = 4;
pub const CC_DEVICE_NOT_RESPONDING: u32 = 5;

pub fn ed_control(address: u8, endpoint: u8, mps: u16, flags: u32) -> u32 {
    u32::from(address) | (u32::from(endpoint) << 7) | (u32::from(mps) << 16) | flags
}

pub fn td_cc(control: u32) -> u32 {
    control >> 28
}

pub fn td_ec(control: u32) -> u32 {
    (control >> 26) & 0b11
}

pub fn td_toggle(control: u32) -> Option<bool> {
    (control & TD_T_FROM_TD != 0).then_some(control & TD_T_DATA1 != 0)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Polls `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

pub const WAIT: Duration = Duration::from_secs(5);

pub fn new_ram() -> Arc<DescriptorRam> {
    Arc::new(DescriptorRam::new(RAM_BASE, RAM_SIZE))
}

pub fn write_ed(mem: &dyn GuestMemory, addr: u32, control: u32, tail: u32, head: u32, next: u32) {
    mem.write_u32(addr, control).unwrap();
    mem.write_u32(addr + 4, tail).unwrap();
    mem.write_u32(addr + 8, head).unwrap();
    mem.write_u32(addr + 12, next).unwrap();
}

pub fn write_td(mem: &dyn GuestMemory, addr: u32, control: u32, cbp: u32, next: u32, be: u32) {
    mem.write_u32(addr, control).unwrap();
    mem.write_u32(addr + 4, cbp).unwrap();
    mem.write_u32(addr + 8, next).unwrap();
    mem.write_u32(addr + 12, be).unwrap();
}

/// Writes a TD over `len` bytes at `buf` (`len == 0` leaves the buffer pointer null).
pub fn write_td_buf(mem: &dyn GuestMemory, addr: u32, control: u32, buf: u32, len: u32, next: u32) {
    if len == 0 {
        write_td(mem, addr, control, 0, next, 0);
    } else {
        write_td(mem, addr, control, buf, next, buf + len - 1);
    }
}

/// Native calls observed by [`MockNative`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    BusReset,
    ConfigureDevice { address: u8, route: DeviceRoute },
    ConfigurePipe { pipe: PipeId, setup: PipeSetup },
    Setup(SetupPacket),
    Send { pipe: PipeId, data: Vec<u8> },
    Receive { pipe: PipeId, len: usize },
    Stop(PipeId),
    SetToggle { pipe: PipeId, toggle: bool },
}

impl Call {
    pub fn is_start(&self) -> bool {
        matches!(self, Call::Setup(_) | Call::Send { .. } | Call::Receive { .. })
    }
}

/// How the mock answers the next started transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    /// Complete successfully: OUT moves everything, IN returns the given data.
    Ack,
    Data(Vec<u8>),
    Status(NativeStatus),
    /// Refuse to start the transfer.
    StartError,
    /// Never complete on its own.
    Hold,
}

#[derive(Debug)]
pub struct MockState {
    pub attached: bool,
    pub speed: LinkSpeed,
    pub sink: Option<EventSink>,
    pub calls: Vec<Call>,
    pub replies: VecDeque<Reply>,
    /// Used when `replies` is empty.
    pub default_reply: Reply,
    pub toggles: HashMap<PipeId, bool>,
    pub max_packet: HashMap<PipeId, u16>,
    pub held: Vec<PipeId>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            attached: true,
            speed: LinkSpeed::Full,
            sink: None,
            calls: Vec::new(),
            replies: VecDeque::new(),
            default_reply: Reply::Ack,
            toggles: HashMap::new(),
            max_packet: HashMap::new(),
            held: Vec::new(),
        }
    }
}

/// Scripted [`NativeHost`]; completions are posted from inside the start call.
#[derive(Clone, Debug, Default)]
pub struct MockNative {
    state: Arc<Mutex<MockState>>,
}

impl MockNative {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn push_reply(&self, reply: Reply) {
        self.state().replies.push_back(reply);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn starts(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_start).collect()
    }

    pub fn count_starts(&self) -> usize {
        self.state().calls.iter().filter(|c| c.is_start()).count()
    }

    pub fn held(&self) -> Vec<PipeId> {
        self.state().held.clone()
    }

    /// Completes a held transfer.
    pub fn release(&self, pipe: PipeId, completion: NativeCompletion) {
        let sink = {
            let mut st = self.state();
            st.held.retain(|p| *p != pipe);
            st.sink.clone().unwrap()
        };
        sink.transfer_complete(pipe, completion);
    }

    /// Reports an attach change through the sink, like a native interrupt would.
    pub fn set_attached(&self, attached: bool) {
        let sink = {
            let mut st = self.state();
            st.attached = attached;
            st.sink.clone().unwrap()
        };
        sink.attach_changed(attached);
    }

    fn start(&mut self, pipe: PipeId, call: Call, out_len: usize) -> Result<(), NativeError> {
        let mut st = self.state();
        let is_setup = matches!(call, Call::Setup(_));
        st.calls.push(call);
        let reply = st
            .replies
            .pop_front()
            .unwrap_or_else(|| st.default_reply.clone());
        let completion = match reply {
            Reply::StartError => return Err(NativeError::Fifo("scripted start failure".into())),
            Reply::Hold => {
                st.held.push(pipe);
                return Ok(());
            }
            Reply::Status(status) => NativeCompletion::failed(status),
            Reply::Ack if is_setup => NativeCompletion::sent(8),
            Reply::Ack => NativeCompletion::sent(out_len),
            Reply::Data(data) => NativeCompletion::received(data),
        };

        if completion.status == NativeStatus::Ok {
            if is_setup {
                st.toggles.insert(pipe, true);
            } else {
                let mps = usize::from(st.max_packet.get(&pipe).copied().unwrap_or(64).max(1));
                let packets = completion.transferred.div_ceil(mps).max(1);
                let toggle = st.toggles.entry(pipe).or_insert(false);
                if packets % 2 == 1 {
                    *toggle = !*toggle;
                }
            }
        }
        let sink = st.sink.clone().unwrap();
        drop(st);
        sink.transfer_complete(pipe, completion);
        Ok(())
    }
}

impl NativeHost for MockNative {
    fn set_event_sink(&mut self, sink: EventSink) {
        self.state().sink = Some(sink);
    }

    fn probe_attach(&mut self) -> bool {
        self.state().attached
    }

    fn bus_reset(&mut self) -> LinkSpeed {
        let mut st = self.state();
        st.calls.push(Call::BusReset);
        st.speed
    }

    fn configure_device(&mut self, address: u8, route: DeviceRoute) {
        self.state()
            .calls
            .push(Call::ConfigureDevice { address, route });
    }

    fn configure_pipe(&mut self, pipe: PipeId, setup: &PipeSetup) -> Result<(), NativeError> {
        let mut st = self.state();
        st.max_packet.insert(pipe, setup.max_packet_size);
        st.calls.push(Call::ConfigurePipe {
            pipe,
            setup: *setup,
        });
        Ok(())
    }

    fn start_setup(&mut self, setup: SetupPacket) -> Result<(), NativeError> {
        self.start(PipeId::CONTROL, Call::Setup(setup), 8)
    }

    fn start_send(&mut self, pipe: PipeId, data: &[u8]) -> Result<(), NativeError> {
        self.start(
            pipe,
            Call::Send {
                pipe,
                data: data.to_vec(),
            },
            data.len(),
        )
    }

    fn start_receive(&mut self, pipe: PipeId, len: usize) -> Result<(), NativeError> {
        self.start(pipe, Call::Receive { pipe, len }, 0)
    }

    fn stop_transfer(&mut self, pipe: PipeId) {
        let mut st = self.state();
        st.held.retain(|p| *p != pipe);
        st.calls.push(Call::Stop(pipe));
    }

    fn toggle(&self, pipe: PipeId) -> bool {
        self.state().toggles.get(&pipe).copied().unwrap_or(false)
    }

    fn set_toggle(&mut self, pipe: PipeId, toggle: bool) {
        let mut st = self.state();
        st.toggles.insert(pipe, toggle);
        st.calls.push(Call::SetToggle { pipe, toggle });
    }
}

/// A controller wired to descriptor RAM and a [`MockNative`].
pub struct Harness {
    pub ctrl: OhciController,
    pub mem: Arc<DescriptorRam>,
    pub native: MockNative,
}

impl Harness {
    pub fn new(config: OhciConfig) -> Self {
        Self::with_native(config, MockNative::new())
    }

    pub fn with_native(config: OhciConfig, native: MockNative) -> Self {
        init_tracing();
        let mem = new_ram();
        let ctrl = OhciController::new(config, mem.clone(), Box::new(native.clone())).unwrap();
        ctrl.init();
        Self { ctrl, mem, native }
    }

    pub fn mem(&self) -> &dyn GuestMemory {
        &*self.mem
    }

    pub fn read_u32(&self, addr: u32) -> u32 {
        self.mem.read_u32(addr).unwrap()
    }

    /// Programs the HCCA, enables every interrupt source and drives a root port reset.
    pub fn bring_up(&self) {
        self.ctrl.write(REG_HCCA, HCCA);
        self.ctrl.write(
            REG_INTERRUPT_ENABLE,
            (InterruptFlags::all() & !InterruptFlags::SF).bits(),
        );
        self.ctrl
            .write(reg_rh_port_status(0), PORT_WRITE_SET_RESET);
        assert_ne!(self.ctrl.read(reg_rh_port_status(0)) & PORT_PRSC, 0);
    }

    /// Sets HcControl to operational with the given list enable bits.
    pub fn set_control(&self, enables: u32) {
        self.ctrl.write(REG_CONTROL, CONTROL_HCFS_OPERATIONAL | enables);
    }

    /// Waits for the TD at `addr` to carry a condition code other than NotAccessed.
    pub fn wait_td_done(&self, addr: u32) -> u32 {
        let mut control = 0;
        assert!(
            wait_until(WAIT, || {
                control = self.read_u32(addr);
                td_cc(control) != td_cc(TD_CC_NOT_ACCESSED)
            }),
            "TD {addr:#x} never completed"
        );
        control
    }

    /// ED head pointer word.
    pub fn ed_head(&self, ed: u32) -> u32 {
        self.read_u32(ed + 8)
    }

    pub fn wait_ed_head(&self, ed: u32, expected: u32) {
        assert!(
            wait_until(WAIT, || self.ed_head(ed) == expected),
            "ED {ed:#x} head is {:#x}, expected {expected:#x}",
            self.ed_head(ed)
        );
    }
}
