use super::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Light {
    Off,
    On,
    Broken,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Switch {
    Toggle,
    Smash,
    Echo,
}

type Log = Vec<String>;

fn machine() -> Fsm<Light, Switch, u32, Log> {
    let mut fsm = Fsm::new(Light::Off);
    fsm.act(Light::Off, Switch::Toggle, |log: &mut Log, n: &u32, _: &mut Queue<Switch, u32>| {
        log.push(format!("off->on {n}"));
        Light::On
    });
    fsm.act(Light::On, Switch::Toggle, |log: &mut Log, n: &u32, _: &mut Queue<Switch, u32>| {
        log.push(format!("on->off {n}"));
        Light::Off
    });
    fsm
}

#[test]
fn act_transitions_and_passes_argument() {
    let mut fsm = machine();
    let mut log = Log::new();

    fsm.feed(&mut log, Switch::Toggle, 7);
    assert_eq!(fsm.state(), Light::On);
    assert_eq!(log, vec!["off->on 7"]);
}

#[test]
fn unregistered_event_is_a_no_op() {
    let mut fsm = machine();
    let mut log = Log::new();

    fsm.feed(&mut log, Switch::Echo, 0);
    assert_eq!(fsm.state(), Light::Off);
    assert!(log.is_empty());
}

#[test]
fn wildcard_takes_precedence_over_state_transition() {
    let mut fsm = machine();
    fsm.wild_act(Switch::Toggle, |log: &mut Log, _: &u32, _: &mut Queue<Switch, u32>| {
        log.push("wild".into());
        Light::Broken
    });
    let mut log = Log::new();

    fsm.feed(&mut log, Switch::Toggle, 0);
    assert_eq!(fsm.state(), Light::Broken);
    assert_eq!(log, vec!["wild"]);
}

#[test]
fn arrival_handlers_run_in_registration_order_on_entry_only() {
    let mut fsm = machine();
    fsm.on(Light::Off, |log: &mut Log, _: &u32, _: &mut Queue<Switch, u32>| log.push("a".into()));
    fsm.on(Light::Off, |log: &mut Log, n: &u32, _: &mut Queue<Switch, u32>| log.push(format!("b {n}")));
    let mut log = Log::new();

    fsm.feed(&mut log, Switch::Toggle, 1);
    fsm.feed(&mut log, Switch::Toggle, 2);
    assert_eq!(log, vec!["off->on 1", "on->off 2", "a", "b 2"]);
}

#[test]
fn self_transition_reruns_arrival_handlers() {
    let mut fsm = Fsm::new(Light::On);
    fsm.act(Light::On, Switch::Echo, |_: &mut Log, _: &u32, _: &mut Queue<Switch, u32>| Light::On);
    fsm.on(Light::On, |log: &mut Log, _: &u32, _: &mut Queue<Switch, u32>| log.push("enter".into()));
    let mut log = Log::new();

    fsm.feed(&mut log, Switch::Echo, 0);
    fsm.feed(&mut log, Switch::Echo, 0);
    assert_eq!(log, vec!["enter", "enter"]);
}

#[test]
fn queued_events_run_after_current_arrivals() {
    let mut fsm = machine();
    fsm.on(Light::On, |log: &mut Log, _: &u32, queue: &mut Queue<Switch, u32>| {
        log.push("arrive on".into());
        queue.push(Switch::Smash, 9);
    });
    fsm.on(Light::On, |log: &mut Log, _: &u32, _: &mut Queue<Switch, u32>| {
        log.push("second arrival".into());
    });
    fsm.act(Light::On, Switch::Smash, |log: &mut Log, n: &u32, _: &mut Queue<Switch, u32>| {
        log.push(format!("smash {n}"));
        Light::Broken
    });
    let mut log = Log::new();

    fsm.feed(&mut log, Switch::Toggle, 0);
    assert_eq!(fsm.state(), Light::Broken);
    assert_eq!(log, vec!["off->on 0", "arrive on", "second arrival", "smash 9"]);
}

#[test]
fn queue_is_drained_in_fifo_order() {
    let mut fsm = Fsm::new(Light::Off);
    fsm.act(Light::Off, Switch::Smash, |log: &mut Log, _: &u32, queue: &mut Queue<Switch, u32>| {
        log.push("start".into());
        queue.push(Switch::Echo, 1);
        queue.push(Switch::Echo, 2);
        Light::Off
    });
    fsm.act(Light::Off, Switch::Echo, |log: &mut Log, n: &u32, _: &mut Queue<Switch, u32>| {
        log.push(format!("echo {n}"));
        Light::Off
    });
    let mut log = Log::new();

    fsm.feed(&mut log, Switch::Smash, 0);
    assert_eq!(log, vec!["start", "echo 1", "echo 2"]);
}
