// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic event-persister usage example.
//!
//! Demonstrates, entirely in-process:
//! 1. Provisioning a topic and subscription on the in-memory bus
//! 2. Publishing "API key used" events
//! 3. Draining them with a rate-limited, batching persister
//! 4. Coalescing the same events through a write-back cache into SQLite
//! 5. Health checks and the metrics the pipeline emits
//! 6. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! RUST_LOG=info cargo run --example basic_usage
//! ```

use event_persister::sinks::LastUsed;
use event_persister::{
    BusClient, BusConfig, HealthChecker, JsonDecoder, LastUsedSqlSink, MemoryBus, MemorySink, OutgoingMessage,
    Persister, PersisterConfig, PublisherConfig, WriteBackCache,
};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           event-persister: Basic Usage Example                ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Provision
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Provisioning topic and subscription...");
    let client = BusClient::new(Arc::new(MemoryBus::new()), BusConfig::default());
    client.topic("api-key-used").await?;

    let config = PersisterConfig {
        max_mps: 200,
        num_workers: 2,
        flush_size: 10,
        flush_interval_ms: 250,
        ..Default::default()
    };
    let puller = client
        .create_puller("api-key-used-persister", "api-key-used", config.puller_config())
        .await?;
    println!("   ✅ Ready");

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Start the persister
    // ─────────────────────────────────────────────────────────────────────────
    let sink = Arc::new(MemorySink::<LastUsed>::new("last-used-memory"));
    let persister = Arc::new(Persister::new(
        "api-key-used",
        config,
        puller,
        sink.clone(),
        Arc::new(JsonDecoder::new()),
    ));
    let shutdown = CancellationToken::new();
    persister.run(&shutdown)?;

    let health = Arc::new(HealthChecker::new(Duration::from_millis(100)));
    health.add(persister.clone());
    let health_task = {
        let health = health.clone();
        let cancel = shutdown.clone();
        tokio::spawn(async move { health.run(cancel).await })
    };

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Publish
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Publishing 50 usage events for 5 keys...");
    let publisher = client.create_publisher("api-key-used", PublisherConfig::default()).await?;
    let started = Instant::now();
    let mut events = Vec::new();
    for n in 0..50i64 {
        let event = LastUsed {
            id: format!("key-{}", n % 5),
            last_used_at: 1_700_000_000_000 + n,
        };
        events.push(OutgoingMessage::json(&event)?.with_id(format!("evt-{n}")));
    }
    let failed = publisher.publish_multi(events).await;
    println!("   └─ Published in {:?}, {} failures", started.elapsed(), failed.len());

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Wait for the batches
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n⏳ Waiting for batches to flush...");
    for _ in 0..100 {
        if sink.items().len() >= 50 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let batches = sink.batches();
    println!("   └─ {} batches, {} items", batches.len(), sink.items().len());
    for (i, batch) in batches.iter().enumerate().take(5) {
        println!("      batch {i}: {} items", batch.len());
    }
    println!("   🩺 Health: {:?}", health.status());

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Write-back: coalesce into SQLite
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🗃️  Coalescing last-used timestamps through the write-back cache...");
    let dir = tempfile::tempdir()?;
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("demo.db").display());
    let sql = LastUsedSqlSink::connect(&url).await?;

    let cache: WriteBackCache<i64> = WriteBackCache::new("last-used");
    for event in sink.items() {
        cache.stage(event.id.clone(), event.last_used_at, event.last_used_at);
    }
    println!("   └─ {} events staged as {} keys", sink.items().len(), cache.len());
    let report = cache.flush_all(&sql).await;
    println!("   └─ Flush: {} written, {} failed", report.written, report.failed);
    for k in 0..5 {
        let id = format!("key-{k}");
        println!("      {id} → {:?}", sql.last_used(&id).await?);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Metrics and shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    println!("\n🛑 Shutting down...");
    persister.stop().await;
    shutdown.cancel();
    health_task.await?;
    client.close();
    println!("   ✅ State: {}", persister.state());

    Ok(())
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let mut counters = Vec::new();
    let mut gauges = Vec::new();
    let mut histograms = Vec::new();

    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
        let name = format!("{}{}", key.name(), label_str);

        match value {
            DebugValue::Counter(v) => counters.push((name, v)),
            DebugValue::Gauge(v) => gauges.push((name, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                let avg = if count > 0 { sum / count as f64 } else { 0.0 };
                histograms.push((name, count, avg));
            }
        }
    }
    counters.sort();
    gauges.sort_by(|a, b| a.0.cmp(&b.0));
    histograms.sort_by(|a, b| a.0.cmp(&b.0));

    if !counters.is_empty() {
        println!("   ┌─ Counters (cumulative)");
        for (name, value) in &counters {
            println!("   │  └─ {name} = {value}");
        }
    }
    if !gauges.is_empty() {
        println!("   ├─ Gauges (current value)");
        for (name, value) in &gauges {
            println!("   │  └─ {name} = {value:.2}");
        }
    }
    if !histograms.is_empty() {
        println!("   └─ Histograms (count, avg)");
        for (name, count, avg) in &histograms {
            println!("      └─ {name}: n={count} avg={avg:.4}");
        }
    }
}
