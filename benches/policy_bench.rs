use criterion::{black_box, criterion_group, criterion_main, Criterion};
use malcolm::policy::{Algorithm, DispatchPolicy};
use malcolm::request::{Request, RequestType};
use malcolm::state::WorkerState;

fn fleet(n: usize) -> Vec<WorkerState> {
    (0..n)
        .map(|i| {
            let mut ws = WorkerState::new(i as u8, format!("10.10.1.{}:31850", i + 4));
            ws.load_ema = (i as f64) * 0.7;
            ws.queue_length = (i * 3) as u32;
            ws.avg_service_time_ns = 50_000.0;
            ws.p99_latency_ns = 400_000.0;
            ws
        })
        .collect()
}

fn sample_request() -> Request {
    Request {
        request_id: 1,
        client_send_time: 0,
        deadline: u64::MAX / 2,
        service_time_hint_us: 40,
        request_type: RequestType::Get,
        client_id: 0,
        payload_size: 128,
    }
}

fn bench_policies(c: &mut Criterion) {
    let mut group = c.benchmark_group("schedule");
    let workers = fleet(16);
    let request = sample_request();

    for algorithm in [Algorithm::Po2, Algorithm::Malcolm, Algorithm::MalcolmStrict] {
        group.bench_function(algorithm.to_string(), |b| {
            let mut policy = DispatchPolicy::new(algorithm, 1, None);
            b.iter(|| policy.schedule(black_box(&request), black_box(&workers)));
        });
    }
    group.finish();
}

fn bench_fleet_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("malcolm_strict_by_fleet");
    let request = sample_request();
    for n in [2usize, 4, 8, 16] {
        let workers = fleet(n);
        group.bench_function(format!("{n}_workers"), |b| {
            let mut policy = DispatchPolicy::new(Algorithm::MalcolmStrict, 1, None);
            b.iter(|| policy.schedule(black_box(&request), black_box(&workers)));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_policies, bench_fleet_sizes);
criterion_main!(benches);
