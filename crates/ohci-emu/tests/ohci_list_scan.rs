use ohci_emu::regs::{
    InterruptFlags, COMMAND_CLF, CONTROL_CLE, REG_COMMAND_STATUS, REG_CONTROL_CURRENT_ED,
    REG_CONTROL_HEAD_ED, REG_INTERRUPT_STATUS,
};
use ohci_emu::{OhciConfig, PipeId};

mod util;

use util::*;

fn ed_words(h: &Harness, ed: u32) -> [u32; 4] {
    [0, 4, 8, 12].map(|off| h.read_u32(ed + off))
}

fn status_out(h: &Harness, td: u32, next: u32) {
    write_td_buf(
        h.mem(),
        td,
        TD_DP_OUT | TD_T_FROM_TD | TD_T_DATA1 | TD_CC_NOT_ACCESSED,
        0,
        0,
        next,
    );
}

fn configured_addresses(h: &Harness) -> Vec<u8> {
    h.native
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::ConfigureDevice { address, .. } => Some(address),
            _ => None,
        })
        .collect()
}

#[test]
fn empty_skipped_and_halted_eds_are_passed_over() {
    let h = Harness::new(OhciConfig::default());
    h.bring_up();

    let (empty, skipped, halted, live) = (ed_addr(0), ed_addr(1), ed_addr(2), ed_addr(3));
    // head == tail
    write_ed(h.mem(), empty, ed_control(1, 0, 64, 0), td_addr(0), td_addr(0), skipped);
    write_ed(h.mem(), skipped, ed_control(2, 0, 64, ED_SKIP), td_addr(2), td_addr(1), halted);
    status_out(&h, td_addr(1), td_addr(2));
    write_ed(h.mem(), halted, ed_control(3, 0, 64, 0), td_addr(4), td_addr(3) | ED_HALTED, live);
    status_out(&h, td_addr(3), td_addr(4));
    write_ed(h.mem(), live, ed_control(4, 0, 64, 0), td_addr(6), td_addr(5), 0);
    status_out(&h, td_addr(5), td_addr(6));

    let before = [empty, skipped, halted].map(|ed| ed_words(&h, ed));

    h.ctrl.write(REG_CONTROL_HEAD_ED, empty);
    h.set_control(CONTROL_CLE);
    let control = h.wait_td_done(td_addr(5));
    assert_eq!(td_cc(control), CC_NO_ERROR);
    h.wait_ed_head(live, td_addr(6));

    // Let a few more passes run over the idle EDs.
    std::thread::sleep(std::time::Duration::from_millis(30));
    assert_eq!([empty, skipped, halted].map(|ed| ed_words(&h, ed)), before);
    assert_eq!(td_cc(h.read_u32(td_addr(1))), td_cc(TD_CC_NOT_ACCESSED));
    assert_eq!(td_cc(h.read_u32(td_addr(3))), td_cc(TD_CC_NOT_ACCESSED));
    assert!(configured_addresses(&h).iter().all(|&a| a == 4));
    assert_eq!(h.native.count_starts(), 1);
}

#[test]
fn disable_then_enable_restarts_from_list_head() {
    let h = Harness::new(OhciConfig::default());
    h.bring_up();

    let (first, second) = (ed_addr(0), ed_addr(1));
    write_ed(h.mem(), first, ed_control(1, 0, 64, 0), td_addr(0), td_addr(0), second);
    write_ed(h.mem(), second, ed_control(2, 0, 64, 0), td_addr(1), td_addr(1), 0);
    h.ctrl.write(REG_CONTROL_HEAD_ED, first);
    h.set_control(CONTROL_CLE);
    std::thread::sleep(std::time::Duration::from_millis(20));

    h.set_control(0);
    // Parking drops the walk position.
    assert_eq!(h.ctrl.read(REG_CONTROL_CURRENT_ED), 0);
    assert!(h
        .ctrl
        .worker_states()
        .iter()
        .all(|w| w.current_ed == 0 && !w.waiting));

    // Queue work on both EDs while the list is parked.
    status_out(&h, td_addr(0), td_addr(2));
    write_ed(h.mem(), first, ed_control(1, 0, 64, 0), td_addr(2), td_addr(0), second);
    status_out(&h, td_addr(1), td_addr(3));
    write_ed(h.mem(), second, ed_control(2, 0, 64, 0), td_addr(3), td_addr(1), 0);

    h.set_control(CONTROL_CLE);
    h.wait_td_done(td_addr(0));
    h.wait_td_done(td_addr(1));
    assert_eq!(configured_addresses(&h), vec![1, 2]);
}

#[test]
fn list_filled_rescans_after_the_list_went_idle() {
    let h = Harness::new(OhciConfig::default());
    h.bring_up();

    let ed = ed_addr(0);
    write_ed(h.mem(), ed, ed_control(1, 0, 64, 0), td_addr(0), td_addr(0), 0);
    h.ctrl.write(REG_CONTROL_HEAD_ED, ed);
    h.set_control(CONTROL_CLE);
    assert!(wait_until(WAIT, || h.ctrl.read(REG_COMMAND_STATUS) & COMMAND_CLF == 0));

    status_out(&h, td_addr(0), td_addr(1));
    write_ed(h.mem(), ed, ed_control(1, 0, 64, 0), td_addr(1), td_addr(0), 0);
    h.ctrl.write(REG_COMMAND_STATUS, COMMAND_CLF);
    assert_eq!(td_cc(h.wait_td_done(td_addr(0))), CC_NO_ERROR);
}

#[test]
fn cyclic_list_raises_unrecoverable_error() {
    let h = Harness::new(OhciConfig::default());
    h.bring_up();
    h.ctrl.write(REG_INTERRUPT_STATUS, u32::MAX);

    let (a, b) = (ed_addr(0), ed_addr(1));
    write_ed(h.mem(), a, ed_control(1, 0, 64, 0), td_addr(0), td_addr(0), b);
    write_ed(h.mem(), b, ed_control(2, 0, 64, 0), td_addr(1), td_addr(1), a);
    h.ctrl.write(REG_CONTROL_HEAD_ED, a);
    h.set_control(CONTROL_CLE);

    assert!(wait_until(WAIT, || h.ctrl.read(REG_INTERRUPT_STATUS)
        & InterruptFlags::UE.bits()
        != 0));
    assert!(wait_until(WAIT, || h.ctrl.read(REG_CONTROL_CURRENT_ED) == 0));
    assert_eq!(ed_words(&h, a)[3], b);
    assert_eq!(h.native.count_starts(), 0);
}

#[test]
fn disable_during_a_pass_does_not_requeue_the_list() {
    let config = OhciConfig {
        control_timeout_ms: 200,
        ..OhciConfig::default()
    };
    let h = Harness::new(config);
    h.native.state().default_reply = Reply::Hold;
    h.bring_up();

    let ed = ed_addr(0);
    status_out(&h, td_addr(0), td_addr(1));
    write_ed(h.mem(), ed, ed_control(1, 0, 64, 0), td_addr(1), td_addr(0), 0);
    h.ctrl.write(REG_CONTROL_HEAD_ED, ed);
    h.set_control(CONTROL_CLE);
    assert!(wait_until(WAIT, || h.native.held() == vec![PipeId::CONTROL]));

    // Returns once the blocked control attempt has timed out and the worker parked.
    h.set_control(0);
    assert_eq!(h.ctrl.read(REG_COMMAND_STATUS) & COMMAND_CLF, 0);
    assert_eq!(h.ctrl.read(REG_CONTROL_CURRENT_ED), 0);
}
