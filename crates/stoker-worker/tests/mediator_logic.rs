//! Mediator behavior over the in-memory transport: the test plays the
//! child's half of the protocol by hand.

use std::time::Duration;

use serde_json::{json, Value};

use stoker_core::{Daemon, DaemonConfig, Event};
use stoker_ipc::{IpcError, MessageType};
use stoker_worker::testing::MockTransport;
use stoker_worker::{
    Call, CallStatus, ForkStrategy, Mediator, MediatorConfig, Promise, Settled, WorkerRegistry,
};

fn test_daemon(name: &str) -> Daemon {
    // No init: these tests drive events by hand and never fork.
    Daemon::new(DaemonConfig::new(name).with_loop_interval(Duration::from_millis(100))).unwrap()
}

fn echo_registry() -> WorkerRegistry {
    WorkerRegistry::new()
        .operation("echo", |args| {
            Ok(args.first().cloned().unwrap_or(Value::Null))
        })
        .unwrap()
        .operation("boom", |_| Err("handler exploded".to_string()))
        .unwrap()
}

/// Lazy strategy + manual event publishing keeps these tests fork-free:
/// a fork pass only runs on `post_execute`, and by then no calls are
/// active anymore.
fn attach(daemon: &mut Daemon, transport: &MockTransport) -> Mediator {
    let config = MediatorConfig::new("logic")
        .with_strategy(ForkStrategy::Lazy)
        .with_max_processes(1);
    Mediator::attach_with_transport(
        daemon,
        echo_registry(),
        config,
        Box::new(transport.clone()),
        0xBEEF,
    )
    .unwrap()
}

/// Plays the child: dequeues one CALL, acks RUNNING, runs `f` over the
/// decoded call, and sends RETURN.
fn serve_one(transport: &MockTransport, pid: i32, f: impl FnOnce(&Call) -> Option<Value>) {
    let (_, payload) = transport.take_call().expect("a queued call");
    let mut call = Call::from_wire(&payload.expect("call payload")).unwrap();
    call.running(pid).unwrap();
    // Headers stamp the sender pid; impersonate the worker.
    let mut running = call.header(MessageType::Running);
    running.pid = pid;
    transport.inject(running, None);
    let result = f(&call);
    call.returned(result).unwrap();
    let mut done = call.header(MessageType::Return);
    done.pid = pid;
    transport.inject(done, Some(call.to_wire().unwrap()));
}

fn settled_value(promise: &Promise) -> Option<Value> {
    match promise.state() {
        Some(Settled::Fulfilled(v)) => Some(v),
        _ => None,
    }
}

fn rejection(promise: &Promise) -> Option<String> {
    match promise.state() {
        Some(Settled::Rejected(e)) => Some(e.to_string()),
        _ => None,
    }
}

#[test]
fn echo_call_settles_within_a_tick() {
    let mut daemon = test_daemon("echo");
    let transport = MockTransport::new();
    let mediator = attach(&mut daemon, &transport);

    let promise = mediator.call("echo", vec![json!("hi")]);
    assert!(!promise.is_settled());
    assert_eq!(mediator.active_calls(), 1);
    assert_eq!(transport.queue_len(MessageType::Call), 1);

    serve_one(&transport, 4321, |call| {
        assert_eq!(call.method, "echo");
        Some(call.args.first().cloned().unwrap_or(Value::Null))
    });

    daemon.publish(Event::PreExecute { iteration: 1 });
    daemon.publish(Event::PostExecute { iteration: 1 });

    assert_eq!(settled_value(&promise), Some(json!("hi")));
    assert_eq!(mediator.active_calls(), 0);
    let recent = mediator.recent();
    assert_eq!(recent.last().unwrap().method, "echo");
    assert_eq!(recent.last().unwrap().pid, 4321);
    assert_eq!(recent.last().unwrap().status, "returned");
    // The RETURN read removed the payload slot.
    assert_eq!(transport.slot_count(), 0);
}

#[test]
fn handler_errors_reject_cleanly() {
    let mut daemon = test_daemon("boom");
    let transport = MockTransport::new();
    let mediator = attach(&mut daemon, &transport);

    let promise = mediator.call("boom", vec![]);
    serve_one(&transport, 1, |call| {
        match echo_registry().invoke(&call.method, &call.args) {
            Ok(v) => Some(v),
            Err(msg) => Some(json!({"__error__": msg})),
        }
    });
    daemon.publish(Event::PreExecute { iteration: 1 });

    let message = rejection(&promise).expect("rejected");
    assert!(message.contains("handler exploded"));
}

#[test]
fn unknown_operation_rejects_immediately() {
    let mut daemon = test_daemon("unknown");
    let transport = MockTransport::new();
    let mediator = attach(&mut daemon, &transport);

    let promise = mediator.call("nope", vec![]);
    let message = rejection(&promise).expect("rejected");
    assert!(message.contains("no operation"));
    assert_eq!(mediator.active_calls(), 0);
}

#[test]
fn premature_death_rejects_with_call_died() {
    let mut daemon = test_daemon("mortal");
    let transport = MockTransport::new();
    let mediator = attach(&mut daemon, &transport);

    let promise = mediator.call("echo", vec![json!(1)]);
    let worker_pid = 7777;

    // The child acks RUNNING, then dies without returning.
    let (_, payload) = transport.take_call().unwrap();
    let mut call = Call::from_wire(&payload.unwrap()).unwrap();
    call.running(worker_pid).unwrap();
    let mut running = call.header(MessageType::Running);
    running.pid = worker_pid;
    transport.inject(running, None);

    daemon.publish(Event::PreExecute { iteration: 1 });
    daemon.publish(Event::Reaped {
        children: vec![stoker_core::ReapedChild {
            pid: worker_pid,
            group: "logic".into(),
            exit_code: None,
            signal: Some(9),
        }],
    });
    daemon.publish(Event::PostExecute { iteration: 1 });

    let message = rejection(&promise).expect("rejected");
    assert!(message.contains("died"));
    assert_eq!(mediator.active_calls(), 0);
    assert_eq!(mediator.recent().last().unwrap().status, "timeout");
}

#[test]
fn return_beats_reaper_when_both_arrive() {
    let mut daemon = test_daemon("race");
    let transport = MockTransport::new();
    let mediator = attach(&mut daemon, &transport);

    let promise = mediator.call("echo", vec![json!("winner")]);
    let worker_pid = 8888;
    serve_one(&transport, worker_pid, |call| {
        Some(call.args.first().cloned().unwrap())
    });

    // The same tick sees the RETURN (pre_execute) and the exit
    // (reaped + post_execute). The message must win.
    daemon.publish(Event::PreExecute { iteration: 1 });
    daemon.publish(Event::Reaped {
        children: vec![stoker_core::ReapedChild {
            pid: worker_pid,
            group: "logic".into(),
            exit_code: Some(0),
            signal: None,
        }],
    });
    daemon.publish(Event::PostExecute { iteration: 1 });

    assert_eq!(settled_value(&promise), Some(json!("winner")));
}

#[test]
fn transport_failure_rejects_but_keeps_call_for_gc() {
    let mut daemon = test_daemon("putfail");
    let transport = MockTransport::new();
    let mediator = attach(&mut daemon, &transport);

    transport.fail_next_put(IpcError::Transient("queue full".into()));
    let promise = mediator.call("echo", vec![json!(1)]);
    assert!(rejection(&promise).is_some());
    // Per contract the call stays CALLED until GC sweeps it.
    assert_eq!(mediator.active_calls(), 1);
}

#[test]
fn identity_error_triggers_reattach() {
    let mut daemon = test_daemon("identity");
    let transport = MockTransport::new();
    let mediator = attach(&mut daemon, &transport);

    transport.fail_next_get(IpcError::Identity("segment removed".into()));
    daemon.publish(Event::PreExecute { iteration: 1 });

    assert_eq!(transport.reattach_count(), 1);
    assert!(mediator.fatal_error().is_none());
}

#[test]
fn stale_headers_are_dropped() {
    let mut daemon = test_daemon("stale");
    let transport = MockTransport::new();
    let mediator = attach(&mut daemon, &transport);

    // A RETURN for an id nobody is waiting on.
    let mut ghost = Call::create("echo", vec![]);
    ghost.running(1).unwrap();
    ghost.returned(Some(json!(0))).unwrap();
    transport.inject(
        ghost.header(MessageType::Return),
        Some(ghost.to_wire().unwrap()),
    );
    daemon.publish(Event::PreExecute { iteration: 1 });

    assert_eq!(mediator.active_calls(), 0);
    assert_eq!(transport.slot_count(), 0);
}

#[test]
fn cancelled_call_rejects_and_clears_slot() {
    let mut daemon = test_daemon("cancel");
    let transport = MockTransport::new();
    let mediator = attach(&mut daemon, &transport);

    let promise = mediator.call("echo", vec![json!("never")]);
    let id = {
        let (header, _) = transport.take_call().unwrap();
        header.id
    };
    mediator.cancel(id).unwrap();

    assert!(rejection(&promise).unwrap().contains("cancelled"));
    assert_eq!(transport.slot_count(), 0);
    assert_eq!(mediator.active_calls(), 0);
    // A second cancel is an error: the call is gone.
    assert!(mediator.cancel(id).is_err());
}

#[test]
fn running_call_cannot_be_cancelled() {
    let mut daemon = test_daemon("nocancel");
    let transport = MockTransport::new();
    let mediator = attach(&mut daemon, &transport);

    let _promise = mediator.call("echo", vec![json!(1)]);
    let (header, payload) = transport.take_call().unwrap();
    let mut call = Call::from_wire(&payload.unwrap()).unwrap();
    call.running(99).unwrap();
    let mut running = call.header(MessageType::Running);
    running.pid = 99;
    transport.inject(running, None);
    daemon.publish(Event::PreExecute { iteration: 1 });

    assert!(mediator.cancel(header.id).is_err());
}

#[test]
fn timeout_threshold_latches_fatal() {
    let mut daemon = test_daemon("threshold");
    let transport = MockTransport::new();
    let config = MediatorConfig::new("logic")
        .with_strategy(ForkStrategy::Lazy)
        .with_max_processes(1);
    let config = MediatorConfig {
        parent_error_bound: 1,
        ..config
    };
    let mediator = Mediator::attach_with_transport(
        &mut daemon,
        echo_registry(),
        config,
        Box::new(transport.clone()),
        0xBEEF,
    )
    .unwrap();

    for round in 0..2 {
        let promise = mediator.call("echo", vec![json!(round)]);
        let pid = 9000 + round;
        let (_, payload) = transport.take_call().unwrap();
        let mut call = Call::from_wire(&payload.unwrap()).unwrap();
        call.running(pid).unwrap();
        let mut running = call.header(MessageType::Running);
        running.pid = pid;
        transport.inject(running, None);

        daemon.publish(Event::PreExecute { iteration: u64::from(round as u32) + 1 });
        daemon.publish(Event::Reaped {
            children: vec![stoker_core::ReapedChild {
                pid,
                group: "logic".into(),
                exit_code: None,
                signal: Some(9),
            }],
        });
        daemon.publish(Event::PostExecute { iteration: u64::from(round as u32) + 1 });
        assert!(rejection(&promise).is_some());
    }

    // The second death crossed the bound of 1.
    let fatal = mediator.fatal_error().expect("latched");
    assert!(fatal.is_fatal());
    // New calls are refused outright.
    let promise = mediator.call("echo", vec![json!(0)]);
    assert!(rejection(&promise).is_some());
}

#[test]
fn stats_event_exports_snapshot() {
    let mut daemon = test_daemon("stats");
    let transport = MockTransport::new();
    let mediator = attach(&mut daemon, &transport);
    let _promise = mediator.call("echo", vec![json!(1)]);

    let entries = daemon.stats();
    let mediator_entry = entries
        .iter()
        .find(|e| e["alias"] == "logic")
        .expect("mediator snapshot");
    assert_eq!(mediator_entry["active_calls"], 1);
    assert_eq!(mediator_entry["processes"], 0);
}

#[test]
fn shutdown_tears_the_transport_down() {
    let mut daemon = test_daemon("teardown");
    let transport = MockTransport::new();
    let _mediator = attach(&mut daemon, &transport);

    daemon.publish(Event::Shutdown);
    assert_eq!(transport.teardown_count(), 1);

    // Purge happened at attach; setup after purge left a usable
    // channel until the teardown.
    assert!(transport.purge_count() >= 1);
}

#[test]
fn inline_path_bypasses_ipc() {
    let mut daemon = test_daemon("inline");
    let transport = MockTransport::new();
    let mediator = attach(&mut daemon, &transport);

    let value = mediator.inline("echo", &[json!("direct")]).unwrap();
    assert_eq!(value, json!("direct"));
    assert_eq!(transport.queue_len(MessageType::Call), 0);

    let err = mediator.inline("boom", &[]).unwrap_err();
    assert_eq!(err.to_string(), "handler exploded");
}

#[test]
fn retry_keeps_id_and_resubmits() {
    let mut daemon = test_daemon("retry");
    let transport = MockTransport::new();
    let mediator = attach(&mut daemon, &transport);

    let _promise = mediator.call("echo", vec![json!("again")]);
    let (first_header, _) = transport.take_call().unwrap();

    let _promise2 = mediator.retry(first_header.id).unwrap();
    let (second_header, payload) = transport.take_call().unwrap();
    assert_eq!(second_header.id, first_header.id);
    let resubmitted = Call::from_wire(&payload.unwrap()).unwrap();
    assert_eq!(resubmitted.id(), first_header.id);
    // The wire copy is written before the CALLED transition, so a
    // retried record goes out reset to UNCALLED under its old id.
    assert_eq!(resubmitted.status(), CallStatus::Uncalled);
}
