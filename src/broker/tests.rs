use super::*;
use crate::utils::BusError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex, mpsc};
use std::thread;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct OrderPlaced {
    order_id: u64,
    customer: String,
}

impl Payload for OrderPlaced {
    const KIND: &'static str = "order_placed";
}

fn attrs(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

fn numbered(n: u64) -> Message {
    Message::new("tick", attrs(json!({ "n": n })))
}

fn n_of(message: &Message) -> u64 {
    message.attribute("n").and_then(Value::as_u64).unwrap()
}

/// Subscribes a handler that records the `n` attribute of every message.
fn record_numbers<S: Service>(service: &S, channel: &str) -> Arc<Mutex<Vec<u64>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    service
        .subscribe(channel, move |message| {
            sink.lock().unwrap().push(n_of(message));
            Ok(())
        })
        .unwrap();
    seen
}

// --- message ---------------------------------------------------------------

#[test]
fn test_message_roundtrip_preserves_everything() {
    let original = Message::new(
        "profile_updated",
        attrs(json!({
            "count": 42,
            "ratio": 0.25,
            "name": "ünïcødé",
            "nested": { "tags": ["a", "b"], "deep": { "flag": true } },
            "list": [1, "two", null],
        })),
    );

    let decoded = Message::decode(&original.encode().unwrap()).unwrap();

    assert_eq!(decoded.id(), original.id());
    assert_eq!(decoded.created_at(), original.created_at());
    assert_eq!(decoded.kind(), "profile_updated");
    assert_eq!(decoded.attributes(), original.attributes());
}

#[test]
fn test_message_equality_is_by_id() {
    let a = numbered(1);
    let b = numbered(1);
    assert_ne!(a, b);
    assert_eq!(a, a.clone());
}

#[test]
fn test_typed_payload() {
    let placed = OrderPlaced {
        order_id: 9,
        customer: "ada".to_string(),
    };
    let message = Message::from_payload(&placed).unwrap();

    assert_eq!(message.kind(), "order_placed");
    assert_eq!(message.attribute("order_id"), Some(&json!(9)));
    assert_eq!(message.payload::<OrderPlaced>().unwrap(), placed);
}

#[test]
fn test_payload_kind_mismatch() {
    let message = numbered(1);
    match message.payload::<OrderPlaced>() {
        Err(BusError::KindMismatch { expected, found }) => {
            assert_eq!(expected, "order_placed");
            assert_eq!(found, "tick");
        }
        other => panic!("expected kind mismatch, got {other:?}"),
    }
}

#[test]
fn test_non_object_payload_is_rejected() {
    #[derive(Serialize, Deserialize)]
    struct Bare(u32);
    impl Payload for Bare {
        const KIND: &'static str = "bare";
    }

    assert!(matches!(
        Message::from_payload(&Bare(3)),
        Err(BusError::NonObjectPayload { .. })
    ));
}

#[test]
fn test_unencodable_payload_is_a_serialization_error() {
    #[derive(Serialize, Deserialize)]
    struct Grid {
        cells: HashMap<(u8, u8), u8>,
    }
    impl Payload for Grid {
        const KIND: &'static str = "grid";
    }

    let grid = Grid {
        cells: HashMap::from([((0, 0), 1)]),
    };
    assert!(matches!(
        Message::from_payload(&grid),
        Err(BusError::Serialization(_))
    ));
}

#[test]
fn test_decode_garbage_fails() {
    assert!(matches!(
        Message::decode(b"not a message"),
        Err(BusError::Serialization(_))
    ));
}

// --- registry --------------------------------------------------------------

#[test]
fn test_registry_creates_one_channel_per_name_under_contention() {
    let registry = Arc::new(Registry::new());
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                registry.channel("shared")
            })
        })
        .collect();

    let channels: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(channels.iter().all(|c| Arc::ptr_eq(c, &channels[0])));
    assert_eq!(registry.names(), vec!["shared".to_string()]);
}

#[test]
fn test_registry_failed_hook_does_not_register() {
    let registry = Registry::new();
    let result = registry.get_or_create("broken", |_| {
        Err(BusError::CorruptRecord("hook refused".to_string()))
    });
    assert!(result.is_err());
    assert!(registry.get("broken").is_none());
}

// --- in-memory service ----------------------------------------------------

#[test]
fn test_publish_does_not_dispatch() {
    let service = InMemoryService::new();
    let seen = record_numbers(&service, "events");

    service.publish("events", &numbered(1)).unwrap();

    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(service.channel_stats("events").unwrap().queue_size, 1);
}

#[test]
fn test_dispatch_delivers_in_publish_order() {
    let service = InMemoryService::new();
    let first = record_numbers(&service, "events");
    let second = record_numbers(&service, "events");

    for n in 0..10 {
        service.publish("events", &numbered(n)).unwrap();
    }
    let counts = service.dispatch(&["events"]).unwrap();

    assert_eq!(counts.get("events"), Some(&10));
    let expected: Vec<u64> = (0..10).collect();
    assert_eq!(*first.lock().unwrap(), expected);
    assert_eq!(*second.lock().unwrap(), expected);
    assert_eq!(service.channel_stats("events").unwrap().queue_size, 0);
}

#[test]
fn test_dispatch_without_names_covers_every_channel() {
    let service = InMemoryService::new();
    let a = record_numbers(&service, "a");
    let b = record_numbers(&service, "b");
    service.publish("a", &numbered(1)).unwrap();
    service.publish("b", &numbered(2)).unwrap();
    service.publish("b", &numbered(3)).unwrap();

    let counts = service.dispatch(&[]).unwrap();

    assert_eq!(counts, HashMap::from([("a".to_string(), 1), ("b".to_string(), 2)]));
    assert_eq!(*a.lock().unwrap(), vec![1]);
    assert_eq!(*b.lock().unwrap(), vec![2, 3]);
}

#[test]
fn test_dispatch_unknown_channel_reports_zero_without_creating_it() {
    let service = InMemoryService::new();
    let counts = service.dispatch(&["ghost"]).unwrap();
    assert_eq!(counts.get("ghost"), Some(&0));
    assert!(service.channel_names().is_empty());
}

#[test]
fn test_messages_published_during_dispatch_join_the_same_pass() {
    let service = Arc::new(InMemoryService::new());
    let seen = record_numbers(&*service, "events");

    let republisher = Arc::downgrade(&service);
    service
        .subscribe("events", move |message| {
            let n = n_of(message);
            if n < 3 {
                if let Some(service) = republisher.upgrade() {
                    service.publish("events", &numbered(n + 1))?;
                }
            }
            Ok(())
        })
        .unwrap();

    service.publish("events", &numbered(0)).unwrap();
    let counts = service.dispatch(&["events"]).unwrap();

    assert_eq!(counts.get("events"), Some(&4));
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
}

#[test]
fn test_concurrent_dispatch_is_single_flight() {
    const MESSAGES: u64 = 400;
    let service = Arc::new(InMemoryService::new());

    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_in_flight = Arc::new(AtomicUsize::new(0));
    let delivered = Arc::new(Mutex::new(Vec::new()));
    {
        let in_flight = Arc::clone(&in_flight);
        let max_in_flight = Arc::clone(&max_in_flight);
        let delivered = Arc::clone(&delivered);
        service
            .subscribe("work", move |message| {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_in_flight.fetch_max(now, Ordering::SeqCst);
                delivered.lock().unwrap().push(n_of(message));
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
    }

    for n in 0..MESSAGES {
        service.publish("work", &numbered(n)).unwrap();
    }

    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let service = Arc::clone(&service);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                service.dispatch(&["work"]).unwrap()["work"]
            })
        })
        .collect();
    let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

    assert_eq!(total, MESSAGES as usize);
    assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    let delivered = delivered.lock().unwrap();
    assert_eq!(*delivered, (0..MESSAGES).collect::<Vec<_>>());
}

#[test]
fn test_subscriber_failure_stops_the_pass_but_keeps_the_rest_queued() {
    let service = InMemoryService::new();
    service
        .subscribe("events", |message| {
            if n_of(message) == 2 {
                return Err("refusing message 2".into());
            }
            Ok(())
        })
        .unwrap();
    let bystander = record_numbers(&service, "events");

    for n in 1..=3 {
        service.publish("events", &numbered(n)).unwrap();
    }

    let err = service.dispatch(&["events"]).unwrap_err();
    assert!(err.is_subscriber_failure());
    match &err {
        BusError::Subscriber { channel, .. } => assert_eq!(channel, "events"),
        other => panic!("unexpected error {other:?}"),
    }
    // the other subscriber still got the failing message
    assert_eq!(*bystander.lock().unwrap(), vec![1, 2]);

    let stats = service.channel_stats("events").unwrap();
    assert_eq!(stats.queue_size, 1);
    assert!(!stats.dispatching);

    let counts = service.dispatch(&["events"]).unwrap();
    assert_eq!(counts.get("events"), Some(&1));
    assert_eq!(*bystander.lock().unwrap(), vec![1, 2, 3]);
}

#[test]
fn test_dispatching_flag_is_visible_during_a_pass() {
    let service = Arc::new(InMemoryService::new());
    let observed = Arc::new(Mutex::new(None));

    let probe = Arc::downgrade(&service);
    let slot = Arc::clone(&observed);
    service
        .subscribe("events", move |_| {
            if let Some(service) = probe.upgrade() {
                *slot.lock().unwrap() = Some(service.channel_stats("events")?.dispatching);
            }
            Ok(())
        })
        .unwrap();

    service.publish("events", &numbered(1)).unwrap();
    service.dispatch(&[]).unwrap();

    assert_eq!(*observed.lock().unwrap(), Some(true));
    assert!(!service.channel_stats("events").unwrap().dispatching);
}

#[test]
fn test_channel_stats_snapshot() {
    let service = InMemoryService::new();
    service.subscribe("events", |_| Ok(())).unwrap();
    service.subscribe("events", |_| Ok(())).unwrap();
    service.publish("events", &numbered(1)).unwrap();

    assert_eq!(
        service.channel_stats("events").unwrap(),
        ChannelStats {
            name: "events".to_string(),
            subscribers_count: 2,
            queue_size: 1,
            dispatching: false,
        }
    );
    // stats create channels lazily
    assert_eq!(service.channel_stats("fresh").unwrap().queue_size, 0);
    assert_eq!(service.channel_names(), vec!["events", "fresh"]);
}

// --- threaded service -----------------------------------------------------

fn forward_numbers<S: Service>(service: &S, channel: &str) -> mpsc::Receiver<u64> {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    service
        .subscribe(channel, move |message| {
            tx.lock().unwrap().send(n_of(message))?;
            Ok(())
        })
        .unwrap();
    rx
}

#[test]
fn test_threaded_delivers_without_dispatch() {
    let service = ThreadedService::new();
    let rx = forward_numbers(&service, "events");

    for n in 0..5 {
        service.publish("events", &numbered(n)).unwrap();
    }

    let received: Vec<u64> = (0..5)
        .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
        .collect();
    assert_eq!(received, vec![0, 1, 2, 3, 4]);
    assert!(service.dispatch(&["events"]).unwrap().is_empty());
}

#[test]
fn test_threaded_shutdown_drains_queued_messages() {
    let service = ThreadedService::new();
    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    service
        .subscribe("slow", move |_| {
            thread::sleep(Duration::from_millis(5));
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    for n in 0..20 {
        service.publish("slow", &numbered(n)).unwrap();
    }
    service.shutdown();

    assert_eq!(count.load(Ordering::SeqCst), 20);
    assert!(service.is_shut_down());
}

#[test]
fn test_threaded_publish_after_shutdown_is_rejected() {
    let service = ThreadedService::new();
    service.subscribe("events", |_| Ok(())).unwrap();
    service.shutdown();
    // idempotent
    service.shutdown();

    assert!(matches!(
        service.publish("events", &numbered(1)),
        Err(BusError::ServiceClosed { .. })
    ));
    assert!(matches!(
        service.publish("never-seen", &numbered(1)),
        Err(BusError::ServiceClosed { .. })
    ));
}

#[test]
fn test_threaded_worker_survives_failing_and_panicking_subscribers() {
    let service = ThreadedService::new();
    service
        .subscribe("events", |message| match n_of(message) {
            0 => Err("first one fails".into()),
            1 => panic!("second one panics"),
            _ => Ok(()),
        })
        .unwrap();
    let rx = forward_numbers(&service, "events");

    for n in 0..3 {
        service.publish("events", &numbered(n)).unwrap();
    }

    // message 0 still reaches the second subscriber; message 1 is lost with
    // the panic; the worker is alive for message 2
    let mut received = Vec::new();
    while let Ok(n) = rx.recv_timeout(Duration::from_secs(5)) {
        received.push(n);
        if n == 2 {
            break;
        }
    }
    assert_eq!(received.first(), Some(&0));
    assert_eq!(received.last(), Some(&2));
    assert!(!received.contains(&1));
}

#[test]
fn test_threaded_drop_joins_workers() {
    let count = Arc::new(AtomicUsize::new(0));
    {
        let service = ThreadedService::new();
        let counter = Arc::clone(&count);
        service
            .subscribe("events", move |_| {
                thread::sleep(Duration::from_millis(2));
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        for n in 0..10 {
            service.publish("events", &numbered(n)).unwrap();
        }
    }
    assert_eq!(count.load(Ordering::SeqCst), 10);
}

// --- bridge ---------------------------------------------------------------

#[derive(Default)]
struct RecordingService {
    published: Mutex<Vec<(String, Message)>>,
}

impl Service for RecordingService {
    fn publish(&self, channel: &str, message: &Message) -> Result<(), BusError> {
        self.published
            .lock()
            .unwrap()
            .push((channel.to_string(), message.clone()));
        Ok(())
    }

    fn subscribe_handler(&self, _channel: &str, _handler: Handler) -> Result<(), BusError> {
        Ok(())
    }

    fn channel_stats(&self, channel: &str) -> Result<ChannelStats, BusError> {
        Ok(ChannelStats {
            name: channel.to_string(),
            subscribers_count: 0,
            queue_size: 0,
            dispatching: false,
        })
    }
}

#[test]
fn test_bridge_republishes_exactly_once_unchanged() {
    let source = InMemoryService::new();
    let target = Arc::new(RecordingService::default());
    bridge(&source, Arc::clone(&target), "ch").unwrap();

    let message = numbered(7);
    source.publish("ch", &message).unwrap();
    assert!(target.published.lock().unwrap().is_empty());

    source.dispatch(&["ch"]).unwrap();

    let published = target.published.lock().unwrap();
    assert_eq!(published.len(), 1);
    let (channel, forwarded) = &published[0];
    assert_eq!(channel, "ch");
    assert_eq!(forwarded.id(), message.id());
    assert_eq!(forwarded.created_at(), message.created_at());
    assert_eq!(forwarded.attributes(), message.attributes());
}

#[test]
fn test_bridge_between_in_memory_services() {
    let source = ThreadedService::new();
    let target = Arc::new(InMemoryService::new());
    let seen = record_numbers(&*target, "ch");
    bridge(&source, Arc::clone(&target), "ch").unwrap();

    source.publish("ch", &numbered(1)).unwrap();
    source.publish("other", &numbered(2)).unwrap();
    source.shutdown();

    target.dispatch(&[]).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![1]);
}
