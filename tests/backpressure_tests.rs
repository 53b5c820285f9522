mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{CollectSink, VecSource};
use streamtab::components::{MemoryBuffer, Sleep};
use streamtab::resilience::RetryPolicy;
use streamtab::{ResourceManager, StreamBuilder};

#[tokio::test(start_paused = true)]
async fn test_slow_output_bounds_in_flight_transactions() {
    let (source, log) = VecSource::numbered(50);
    let (sink, out) = CollectSink::new();

    let mut stream = StreamBuilder::new(Arc::new(ResourceManager::new()))
        .input("vec", Box::new(source))
        .output("slow", Box::new(sink.slow(Duration::from_millis(20))))
        .max_in_flight(2)
        .threads(2)
        .retry(RetryPolicy::none())
        .build()
        .unwrap();
    let limit = stream.in_flight_limit();
    assert_eq!(limit, 4);

    let report = stream.run().await.unwrap();

    assert!(report.high_water <= limit, "high water {} over {limit}", report.high_water);
    assert!(log.lock().unwrap().max_outstanding <= limit);
    assert_eq!(report.acked, 50);
    assert_eq!(out.messages().len(), 50);
}

#[tokio::test(start_paused = true)]
async fn test_buffer_adds_a_boundary_to_the_bound() {
    let (source, log) = VecSource::numbered(30);
    let (sink, _) = CollectSink::new();

    let mut stream = StreamBuilder::new(Arc::new(ResourceManager::new()))
        .input("vec", Box::new(source))
        .buffer("memory", Box::new(MemoryBuffer::new(1, Duration::ZERO)))
        .processor("sleep", Arc::new(Sleep::new(Duration::from_millis(5))))
        .output("slow", Box::new(sink.slow(Duration::from_millis(10))))
        .max_in_flight(3)
        .build()
        .unwrap();
    let limit = stream.in_flight_limit();
    assert_eq!(limit, 9);

    let report = stream.run().await.unwrap();

    assert!(report.high_water <= limit);
    assert!(log.lock().unwrap().max_outstanding <= limit);
    assert_eq!(report.abandoned(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_output_stops_reading() {
    let (source, log) = VecSource::numbered(1_000);
    let (sink, _) = CollectSink::new();

    let mut stream = StreamBuilder::new(Arc::new(ResourceManager::new()))
        .input("vec", Box::new(source))
        .output("stalled", Box::new(sink.slow(Duration::from_secs(3600))))
        .max_in_flight(1)
        .shutdown_timeout(Duration::from_millis(100))
        .retry(RetryPolicy::none())
        .build()
        .unwrap();
    let limit = stream.in_flight_limit();

    stream.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let delivered = log.lock().unwrap().delivered.len();
    assert!(delivered <= limit, "read {delivered} items past a stalled output");
    assert_eq!(stream.health().outstanding, delivered);

    stream.stop();
    let report = stream.join().await.unwrap();
    assert_eq!(report.abandoned(), 0);
    assert_eq!(log.lock().unwrap().outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_output_does_not_hold_back_other_outputs() {
    let (source, log) = VecSource::numbered(3);
    let (stalled, stalled_out) = CollectSink::new();
    let (healthy, healthy_out) = CollectSink::new();

    let mut stream = StreamBuilder::new(Arc::new(ResourceManager::new()))
        .input("vec", Box::new(source))
        .output("stalled", Box::new(stalled.slow(Duration::from_secs(3600))))
        .output("healthy", Box::new(healthy))
        .max_in_flight(1)
        .threads(1)
        .retry(RetryPolicy::none())
        .shutdown_timeout(Duration::from_secs(1))
        .build()
        .unwrap();
    assert_eq!(stream.in_flight_limit(), 3);

    stream.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(healthy_out.messages(), vec!["0", "1", "2"]);
    assert!(stalled_out.messages().is_empty());

    stream.stop();
    let report = stream.join().await.unwrap();
    assert_eq!(report.abandoned(), 0);
    assert!(log.lock().unwrap().acked.is_empty());
}
