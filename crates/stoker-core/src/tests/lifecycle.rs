//! Whole-loop scenarios driven through `Daemon::run`.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use super::MockLifecycle;
use crate::config::DaemonConfig;
use crate::daemon::{Daemon, DaemonState};
use crate::event::{EventName, Flow};
use crate::process::TEST_REAP_LOCK;

fn fast_config(name: &str) -> DaemonConfig {
    DaemonConfig::new(name).with_loop_interval(Duration::from_millis(1))
}

#[test]
fn runs_the_requested_ticks_then_exits() {
    let _serial = TEST_REAP_LOCK.lock().unwrap();
    let mut daemon = Daemon::new(fast_config("three-ticks")).unwrap();
    let mut lifecycle = MockLifecycle::new().exit_after(3);

    daemon.run(&mut lifecycle).unwrap();

    assert_eq!(lifecycle.setup_count(), 1);
    assert_eq!(lifecycle.execute_count(), 3);
    assert_eq!(lifecycle.teardown_count(), 1);
    assert_eq!(daemon.state(), DaemonState::Exited);
    assert!(daemon.is_shutdown());
    assert_eq!(daemon.dispatched_count(EventName::PreExecute), 3);
    assert_eq!(daemon.dispatched_count(EventName::PostExecute), 3);
    assert_eq!(daemon.dispatched_count(EventName::Shutdown), 1);
    assert_eq!(daemon.dispatched_count(EventName::Init), 1);
}

#[test]
fn second_run_after_shutdown_is_a_noop_loop() {
    let _serial = TEST_REAP_LOCK.lock().unwrap();
    let mut daemon = Daemon::new(fast_config("twice")).unwrap();
    let mut lifecycle = MockLifecycle::new().exit_after(1);
    daemon.run(&mut lifecycle).unwrap();
    let executed = lifecycle.execute_count();

    // The latch survives; a second run performs no further ticks.
    daemon.run(&mut lifecycle).unwrap();
    assert_eq!(lifecycle.execute_count(), executed);
}

#[test]
fn setup_failure_aborts_startup() {
    let _serial = TEST_REAP_LOCK.lock().unwrap();
    let mut daemon = Daemon::new(fast_config("bad-setup")).unwrap();
    let mut lifecycle = MockLifecycle::new().fail_setup();
    let err = daemon.run(&mut lifecycle).unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(lifecycle.execute_count(), 0);
    // Teardown still ran so plugins can release resources.
    assert_eq!(lifecycle.teardown_count(), 1);
}

#[test]
fn runtime_errors_keep_the_loop_alive() {
    let _serial = TEST_REAP_LOCK.lock().unwrap();
    let mut daemon = Daemon::new(fast_config("flaky")).unwrap();
    let errors = Rc::new(RefCell::new(0u32));
    {
        let errors = Rc::clone(&errors);
        daemon.subscribe(EventName::Error, 0, move |_, _| {
            *errors.borrow_mut() += 1;
            Flow::Continue
        });
    }
    // Stop externally after a few ticks by latching from a subscriber.
    {
        daemon.subscribe(EventName::PostExecute, 0, move |ctx, event| {
            if let crate::event::Event::PostExecute { iteration } = event {
                if *iteration >= 3 {
                    ctx.request_shutdown();
                }
            }
            Flow::Continue
        });
    }

    let mut lifecycle = MockLifecycle::new().failing();
    daemon.run(&mut lifecycle).unwrap();

    assert_eq!(lifecycle.execute_count(), 3);
    assert_eq!(*errors.borrow(), 3);
}

#[test]
fn fatal_error_tears_down_and_surfaces() {
    let _serial = TEST_REAP_LOCK.lock().unwrap();
    let mut daemon = Daemon::new(fast_config("doomed")).unwrap();
    let mut lifecycle = MockLifecycle::new().fatal();
    let err = daemon.run(&mut lifecycle).unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(lifecycle.execute_count(), 1);
    assert_eq!(lifecycle.teardown_count(), 1);
    assert_eq!(daemon.state(), DaemonState::Exited);
}

#[test]
fn free_running_loop_with_certain_idle() {
    let _serial = TEST_REAP_LOCK.lock().unwrap();
    let config = DaemonConfig::new("always-idle").with_idle_probability(1.0);
    let mut daemon = Daemon::new(config).unwrap();
    let mut lifecycle = MockLifecycle::new().exit_after(5);
    daemon.run(&mut lifecycle).unwrap();
    // idle_probability = 1 idles on every completed tick.
    assert!(daemon.dispatched_count(EventName::Idle) >= 4);
}

#[test]
fn free_running_loop_never_idles_at_zero_probability() {
    let _serial = TEST_REAP_LOCK.lock().unwrap();
    let config = DaemonConfig::new("never-idle").with_idle_probability(0.0);
    let mut daemon = Daemon::new(config).unwrap();
    let mut lifecycle = MockLifecycle::new().exit_after(5);
    daemon.run(&mut lifecycle).unwrap();
    assert_eq!(daemon.dispatched_count(EventName::Idle), 0);
}

#[test]
fn interval_loop_dispatches_idle_when_time_remains() {
    let _serial = TEST_REAP_LOCK.lock().unwrap();
    // 50 ms interval with a trivial execute leaves ample slack.
    let config = DaemonConfig::new("slack").with_loop_interval(Duration::from_millis(50));
    let mut daemon = Daemon::new(config).unwrap();
    let mut lifecycle = MockLifecycle::new().exit_after(2);
    daemon.run(&mut lifecycle).unwrap();
    assert!(daemon.dispatched_count(EventName::Idle) >= 1);
}

#[test]
fn pre_execute_stop_skips_user_hook_entirely() {
    let _serial = TEST_REAP_LOCK.lock().unwrap();
    let mut daemon = Daemon::new(fast_config("vetoed")).unwrap();
    daemon.subscribe(EventName::PreExecute, 10, |_, _| Flow::Stop);
    daemon.subscribe(EventName::PostExecute, 0, |ctx, _| {
        ctx.request_shutdown();
        Flow::Continue
    });
    let mut lifecycle = MockLifecycle::new();
    daemon.run(&mut lifecycle).unwrap();
    assert_eq!(lifecycle.execute_count(), 0);
    assert!(daemon.dispatched_count(EventName::PostExecute) >= 1);
}

#[test]
fn task_children_are_reaped_and_published() {
    let _serial = TEST_REAP_LOCK.lock().unwrap();
    let mut daemon = Daemon::new(fast_config("tasker")).unwrap();
    daemon.init().unwrap();

    let reaped = Rc::new(RefCell::new(Vec::new()));
    {
        let reaped = Rc::clone(&reaped);
        daemon.subscribe(EventName::Reaped, 0, move |_, event| {
            if let crate::event::Event::Reaped { children } = event {
                reaped.borrow_mut().extend(children.iter().map(|c| c.pid));
            }
            Flow::Continue
        });
    }

    let pid = daemon.run_task(Box::new(|| {})).unwrap();
    let Some(pid) = pid else {
        // Early death is a legal outcome; nothing further to assert.
        return;
    };

    // Sweep until the child is collected, then publish like the loop.
    let begun = std::time::Instant::now();
    while daemon.procs().count(None) > 0 && begun.elapsed() < Duration::from_secs(5) {
        daemon.procs_mut().reap();
        std::thread::sleep(Duration::from_millis(10));
    }
    let children = daemon.procs_mut().take_reaped();
    assert!(!children.is_empty());
    daemon.publish(crate::event::Event::Reaped { children });
    assert!(reaped.borrow().contains(&pid));
}
