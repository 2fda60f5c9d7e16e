//! Loop handshake benchmarks
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use tokio_util::sync::CancellationToken;
use tunwarden::config::DnsSettings;
use tunwarden::loopstate::{LoopState, LoopStatus, SettingsStore};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn bench_apply_status(c: &mut Criterion) {
    let rt = runtime();
    let cancel = CancellationToken::new();
    let (state, mut signals) = LoopState::new("bench", LoopStatus::Stopped);
    let state = std::sync::Arc::new(state);

    // Worker that confirms every request right away
    {
        let state = state.clone();
        let cancel = cancel.clone();
        rt.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    Some(ack) = signals.start.recv() => ack.confirm(&state, LoopStatus::Running),
                    Some(ack) = signals.stop.recv() => ack.confirm(&state, LoopStatus::Stopped),
                }
            }
        });
    }

    let mut group = c.benchmark_group("apply_status");
    group.throughput(Throughput::Elements(2));

    group.bench_function("start_stop_cycle", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(state.apply_status(&cancel, LoopStatus::Running).await.unwrap());
                black_box(state.apply_status(&cancel, LoopStatus::Stopped).await.unwrap());
            })
        })
    });

    group.bench_function("already_stopped", |b| {
        b.iter(|| rt.block_on(async { black_box(state.apply_status(&cancel, LoopStatus::Stopped).await.unwrap()) }))
    });

    group.finish();
    cancel.cancel();
}

fn bench_settings_update(c: &mut Criterion) {
    let store = SettingsStore::new(DnsSettings::default());
    let mut changed = DnsSettings::default();
    changed.update_period = std::time::Duration::from_secs(3600);

    let mut group = c.benchmark_group("settings_update");

    group.bench_function("unchanged", |b| {
        b.iter(|| black_box(store.update(DnsSettings::default())))
    });

    group.bench_function("soft_toggle", |b| {
        b.iter(|| {
            black_box(store.update(changed.clone()));
            black_box(store.update(DnsSettings::default()))
        })
    });

    group.finish();
}

criterion_group!(benches, bench_apply_status, bench_settings_update);
criterion_main!(benches);
