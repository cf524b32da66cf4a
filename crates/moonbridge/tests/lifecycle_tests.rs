//! Integration tests for runtime teardown and proxy lifetimes.

use moonbridge::{Callback, Error, LifecycleError, Runtime, Value};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn close_is_refused_while_proxies_are_alive() {
    let rt = Runtime::new().unwrap();
    let table = rt.eval("{}").unwrap().into_table().unwrap();

    let err = rt.close().unwrap_err();
    assert!(matches!(
        err,
        Error::Lifecycle(LifecycleError::LiveReferences(1))
    ));
    assert!(!rt.is_closed());
    // The runtime is still usable after a refused close.
    table.set("ok", true).unwrap();

    drop(table);
    rt.close().unwrap();
    assert!(rt.is_closed());
}

#[test]
fn close_twice_succeeds() {
    let rt = Runtime::new().unwrap();
    rt.close().unwrap();
    rt.close().unwrap();
}

#[test]
fn operations_after_close_fail() {
    let rt = Runtime::new().unwrap();
    rt.close().unwrap();

    assert!(matches!(
        rt.eval("1"),
        Err(Error::Lifecycle(LifecycleError::Closed))
    ));
    assert!(matches!(
        rt.execute("x = 1"),
        Err(Error::Lifecycle(LifecycleError::Closed))
    ));
    assert!(matches!(
        rt.globals(),
        Err(Error::Lifecycle(LifecycleError::Closed))
    ));
}

#[test]
fn proxies_keep_the_engine_alive_after_runtime_is_dropped() {
    let rt = Runtime::new().unwrap();
    let marker = Arc::new(());
    let held = Arc::clone(&marker);
    rt.set_global(
        "ping",
        Callback::new(move |_, _| {
            let _ = &held;
            Ok(Value::from("pong"))
        }),
    )
    .unwrap();
    let table = rt.eval("{ x = 1 }").unwrap().into_table().unwrap();
    let function = rt
        .eval("function() return ping() end")
        .unwrap()
        .into_function()
        .unwrap();
    drop(rt);

    assert_eq!(table.get("x").unwrap(), Value::Integer(1));
    table.set("y", 2).unwrap();
    assert_eq!(function.call([]).unwrap(), Value::from("pong"));
    assert_eq!(Arc::strong_count(&marker), 2);

    // The last proxy closes the engine, which frees the callback.
    drop(table);
    drop(function);
    assert_eq!(Arc::strong_count(&marker), 1);
}

#[test]
fn live_references_track_distinct_objects() {
    let rt = Runtime::new().unwrap();
    rt.execute("a, b = {}, {}").unwrap();

    let a1 = rt.get_global("a").unwrap();
    let a2 = rt.get_global("a").unwrap();
    let b = rt.get_global("b").unwrap();
    assert_eq!(rt.live_references(), 2);

    drop(a1);
    assert_eq!(rt.live_references(), 2);
    drop(a2);
    assert_eq!(rt.live_references(), 1);
    drop(b);
    assert_eq!(rt.live_references(), 0);
}

#[test]
fn clones_share_one_slot() {
    let rt = Runtime::new().unwrap();
    let table = rt.create_table().unwrap();
    let copy = table.clone();
    drop(table);

    copy.set("still", "alive").unwrap();
    assert_eq!(copy.get("still").unwrap(), Value::from("alive"));
    assert_eq!(rt.live_references(), 1);
}

#[test]
fn released_objects_are_collectable() {
    let rt = Runtime::new().unwrap();
    rt.execute("weak = setmetatable({}, { __mode = 'v' })").unwrap();
    let table = rt.eval("{}").unwrap();
    rt.set_global("held", table.clone()).unwrap();
    rt.execute("weak[1] = held; held = nil").unwrap();

    // Anchored by the registry, so it survives a full collection.
    rt.execute("collectgarbage(); collectgarbage()").unwrap();
    assert_eq!(rt.eval("weak[1] ~= nil").unwrap(), Value::Boolean(true));

    drop(table);
    rt.execute("collectgarbage(); collectgarbage()").unwrap();
    assert_eq!(rt.eval("weak[1] == nil").unwrap(), Value::Boolean(true));
}

#[test]
fn close_during_call_on_another_thread_fails_fast() {
    let rt = Runtime::new().unwrap();
    let entered = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));
    {
        let entered = Arc::clone(&entered);
        let release = Arc::clone(&release);
        rt.set_global(
            "pause",
            Callback::new(move |_, _| {
                entered.wait();
                release.wait();
                Ok(Value::from("resumed"))
            }),
        )
        .unwrap();
    }

    thread::scope(|s| {
        let worker = s.spawn(|| rt.eval("pause()"));

        entered.wait();
        let err = rt.close().unwrap_err();
        assert!(matches!(
            err,
            Error::Lifecycle(LifecycleError::CallInFlight)
        ));
        assert!(err.is_recoverable());
        release.wait();

        assert_eq!(worker.join().unwrap().unwrap(), Value::from("resumed"));
    });

    rt.close().unwrap();
}

#[test]
fn drops_during_a_call_are_deferred() {
    let rt = Runtime::new().unwrap();
    let table = rt.create_table().unwrap();
    let entered = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));
    {
        let entered = Arc::clone(&entered);
        let release = Arc::clone(&release);
        rt.set_global(
            "pause",
            Callback::new(move |_, _| {
                entered.wait();
                release.wait();
                Ok(Value::Nil)
            }),
        )
        .unwrap();
    }

    thread::scope(|s| {
        let worker = s.spawn(|| rt.execute("pause()"));
        entered.wait();
        // The guard is held by the worker; this must not block.
        drop(table);
        release.wait();
        worker.join().unwrap().unwrap();
    });

    assert_eq!(rt.live_references(), 0);
    rt.close().unwrap();
}

#[test]
fn close_from_inside_a_callback_is_refused() {
    let rt = Arc::new(Runtime::new().unwrap());
    let weak = Arc::downgrade(&rt);
    rt.set_global(
        "try_close",
        Callback::new(move |_, _| {
            let rt = weak.upgrade().expect("runtime alive");
            let refused = matches!(
                rt.close(),
                Err(Error::Lifecycle(LifecycleError::CallInFlight))
            );
            Ok(Value::Boolean(refused))
        }),
    )
    .unwrap();

    assert_eq!(rt.eval("try_close()").unwrap(), Value::Boolean(true));
    assert!(!rt.is_closed());
}
