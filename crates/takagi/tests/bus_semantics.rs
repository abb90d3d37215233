// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 takagi contributors

//! Event-bus contract tests: wildcards, round-robin, request-reply
//! deadlines, replay.

use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use takagi::bus::{BusError, EventBus};

fn settle() {
    std::thread::sleep(Duration::from_millis(60));
}

#[test]
fn wildcard_matches_exactly_one_segment() {
    let bus = EventBus::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = Arc::clone(&hits);
    bus.consumer("sensor.*.room1", move |_| {
        h.fetch_add(1, Ordering::SeqCst);
    });

    bus.publish("sensor.temp.room1", json!(1));
    bus.publish("sensor.temp.room2", json!(2));
    bus.publish("sensor.temp.a.room1", json!(3));
    settle();
    bus.shutdown();

    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn round_robin_selects_a_b_a() {
    let bus = EventBus::new();
    let a = Arc::new(AtomicUsize::new(0));
    let b = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&a);
    bus.consumer("q", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let counter = Arc::clone(&b);
    bus.consumer("q", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    bus.send("q", json!(1));
    bus.send("q", json!(2));
    bus.send("q", json!(3));
    settle();
    bus.shutdown();

    // First and third go to the first consumer, second to the other.
    assert_eq!(a.load(Ordering::SeqCst), 2);
    assert_eq!(b.load(Ordering::SeqCst), 1);
}

#[test]
fn send_sync_times_out_within_bounds() {
    let bus = EventBus::new();
    let started = Instant::now();
    let result = bus.send_sync("x", json!({}), Duration::from_millis(100));
    let elapsed = started.elapsed();
    bus.shutdown();

    assert_eq!(result, Err(BusError::Timeout));
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(200), "{:?}", elapsed);
}

#[test]
fn request_reply_roundtrip() {
    let bus = Arc::new(EventBus::new());
    let replier = Arc::downgrade(&bus);
    bus.consumer("svc.echo", move |message| {
        if let Some(bus) = replier.upgrade() {
            bus.reply_to(message, message.body.clone());
        }
    });

    let reply = bus
        .send_sync("svc.echo", json!({ "ping": true }), Duration::from_secs(2))
        .unwrap();
    assert_eq!(reply.body["ping"], true);
    bus.shutdown();
}

#[test]
fn per_handler_delivery_preserves_publish_order() {
    let bus = EventBus::new();
    let seen: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    bus.consumer("ordered", move |message| {
        sink.lock().unwrap().push(message.body.as_i64().unwrap());
    });

    for n in 0..200 {
        bus.publish("ordered", json!(n));
    }
    std::thread::sleep(Duration::from_millis(200));
    bus.shutdown();

    let seen = seen.lock().unwrap();
    assert_eq!(*seen, (0..200).collect::<Vec<i64>>());
}

#[test]
fn replay_returns_buffered_messages_in_order() {
    let bus = EventBus::with_buffering();
    bus.publish("metrics.cpu", json!(1));
    bus.publish("metrics.cpu", json!(2));
    bus.publish("metrics.mem", json!(3));

    let replayed = bus.replay("metrics.cpu", None);
    assert_eq!(replayed.len(), 2);
    assert_eq!(replayed[0].body, json!(1));
    assert_eq!(replayed[1].body, json!(2));

    assert!(bus.replay("metrics.gpu", None).is_empty());
    bus.shutdown();
}

#[test]
fn handler_panic_does_not_reach_publisher() {
    let bus = EventBus::new();
    bus.consumer("fragile", |_| panic!("subscriber bug"));
    let hits = Arc::new(AtomicUsize::new(0));
    let h = Arc::clone(&hits);
    bus.consumer("fragile", move |_| {
        h.fetch_add(1, Ordering::SeqCst);
    });

    bus.publish("fragile", json!(1));
    settle();
    bus.shutdown();

    // The healthy subscriber still got its copy.
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
