use ohci_emu::regs::{CONTROL_PLE, REG_PERIOD_CURRENT_ED};
use ohci_emu::{
    GuestMemory, NativeCompletion, OhciConfig, PipeBinding, PipeDirection, PipeId, PipeKind,
    WorkerKind,
};

mod util;

use util::*;

const INT_IN: PipeId = PipeId(3);

fn interrupt_config() -> OhciConfig {
    OhciConfig {
        pipes: vec![PipeBinding {
            pipe: INT_IN,
            kind: PipeKind::Interrupt,
            endpoint: 1,
            direction: PipeDirection::In,
            address: None,
        }],
        ..OhciConfig::default()
    }
}

/// Links `ed` from every `stride`-th interrupt table slot.
fn link_periodic(h: &Harness, ed: u32, stride: u32) {
    for slot in (0..32).step_by(stride as usize) {
        h.mem.write_u32(HCCA + slot * 4, ed).unwrap();
    }
}

fn queue_interrupt_in(h: &Harness, ed: u32, td: u32, tail: u32, len: u32) {
    write_ed(h.mem(), ed, ed_control(2, 1, 8, ED_DIR_IN), tail, td, 0);
    write_td_buf(h.mem(), td, TD_CC_NOT_ACCESSED, buf_addr(0), len, tail);
}

fn claims(h: &Harness, ed: u32) -> Vec<ohci_emu::WorkerStatus> {
    h.ctrl
        .worker_states()
        .into_iter()
        .filter(|w| matches!(w.kind, WorkerKind::Interrupt(_)) && w.current_ed == ed)
        .collect()
}

#[test]
fn interrupt_ed_is_claimed_once_and_polled_at_tree_rate() {
    let h = Harness::new(interrupt_config());
    h.native.state().default_reply = Reply::Hold;
    h.bring_up();

    let (ed, td, tail) = (ed_addr(0), td_addr(0), td_addr(1));
    queue_interrupt_in(&h, ed, td, tail, 8);
    // Reachable from 8 of 32 slots: polled every 4 frames.
    link_periodic(&h, ed, 4);
    h.set_control(CONTROL_PLE);

    assert!(wait_until(WAIT, || claims(&h, ed).iter().any(|w| w.waiting)));
    assert_eq!(h.native.held(), vec![INT_IN]);
    let holders = claims(&h, ed);
    assert_eq!(holders.len(), 1, "{holders:?}");
    assert_eq!(holders[0].cycle, 4);
    assert_eq!(holders[0].current_td, td);
    assert!(holders[0].waiting);
    assert_eq!(holders[0].pipe, Some(INT_IN));
    assert_eq!(h.ctrl.read(REG_PERIOD_CURRENT_ED), ed);

    let setup = h
        .native
        .calls()
        .into_iter()
        .find_map(|c| match c {
            Call::ConfigurePipe { pipe, setup } if pipe == INT_IN => Some(setup),
            _ => None,
        })
        .unwrap();
    assert_eq!(setup.kind, PipeKind::Interrupt);
    assert_eq!(setup.interval, 4);
    assert_eq!(setup.max_packet_size, 8);

    let report = vec![1, 2, 3, 4, 5, 6, 7, 8];
    h.native.release(INT_IN, NativeCompletion::received(report.clone()));
    let control = h.wait_td_done(td);
    assert_eq!(td_cc(control), CC_NO_ERROR);
    let mut copied = vec![0u8; 8];
    h.mem.read_physical(buf_addr(0), &mut copied).unwrap();
    assert_eq!(copied, report);
    h.wait_ed_head(ed, tail | ED_TOGGLE_CARRY);

    // With nothing left to poll the claim is given up after the idle countdown.
    assert!(wait_until(WAIT, || claims(&h, ed).is_empty()));
    assert_eq!(h.ctrl.read(REG_PERIOD_CURRENT_ED), 0);
}

#[test]
fn disabling_periodic_list_aborts_pending_wait() {
    let h = Harness::new(interrupt_config());
    h.native.state().default_reply = Reply::Hold;
    h.bring_up();

    let (ed, td, tail) = (ed_addr(0), td_addr(0), td_addr(1));
    queue_interrupt_in(&h, ed, td, tail, 8);
    link_periodic(&h, ed, 1);
    h.set_control(CONTROL_PLE);
    assert!(wait_until(WAIT, || h.native.held() == vec![INT_IN]));

    // Interrupt waits have no timeout; the disable must not block on the device.
    h.set_control(0);
    assert!(h.native.calls().contains(&Call::Stop(INT_IN)));
    assert!(claims(&h, ed).is_empty());
    assert_eq!(td_cc(h.read_u32(td)), td_cc(TD_CC_NOT_ACCESSED));
    assert_eq!(h.ed_head(ed), td);

    // Re-enabling resumes polling the same TD.
    h.native.state().default_reply = Reply::Data(vec![9; 8]);
    h.set_control(CONTROL_PLE);
    assert_eq!(td_cc(h.wait_td_done(td)), CC_NO_ERROR);
}

#[test]
fn every_interrupt_ed_gets_its_own_worker() {
    let binding = |pipe, address| PipeBinding {
        pipe: PipeId(pipe),
        kind: PipeKind::Interrupt,
        endpoint: 1,
        direction: PipeDirection::In,
        address: Some(address),
    };
    let h = Harness::new(OhciConfig {
        pipes: vec![binding(3, 2), binding(4, 3)],
        ..OhciConfig::default()
    });
    h.native.state().default_reply = Reply::Hold;
    h.bring_up();

    // Two EDs chained from every slot, one per device.
    let (a, b) = (ed_addr(0), ed_addr(1));
    write_ed(h.mem(), a, ed_control(2, 1, 8, ED_DIR_IN), td_addr(1), td_addr(0), b);
    write_td_buf(h.mem(), td_addr(0), TD_CC_NOT_ACCESSED, buf_addr(0), 8, td_addr(1));
    write_ed(h.mem(), b, ed_control(3, 1, 8, ED_DIR_IN), td_addr(3), td_addr(2), 0);
    write_td_buf(h.mem(), td_addr(2), TD_CC_NOT_ACCESSED, buf_addr(1), 8, td_addr(3));
    link_periodic(&h, a, 1);
    h.set_control(CONTROL_PLE);

    assert!(wait_until(WAIT, || claims(&h, a).len() == 1 && claims(&h, b).len() == 1));
    assert!(wait_until(WAIT, || h.native.held().len() == 2));
    for _ in 0..50 {
        assert!(claims(&h, a).len() <= 1);
        assert!(claims(&h, b).len() <= 1);
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    h.set_control(0);
    let calls = h.native.calls();
    assert!(calls.contains(&Call::Stop(PipeId(3))));
    assert!(calls.contains(&Call::Stop(PipeId(4))));
}
