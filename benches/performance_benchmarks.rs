use chrono::{Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use hrrs::{fitting, pipeline, signal, HrSample, HrrConfig, SessionSamples};

/// Performance benchmarks for the HRR pipeline
///
/// Sessions are synthetic interval workouts: rest, then repeated efforts
/// each followed by a 3-minute exponential recovery, with a little
/// deterministic jitter.

fn interval_workout(efforts: usize) -> SessionSamples {
    let mut hr = vec![72.0; 300];
    for effort in 0..efforts {
        let start = *hr.last().unwrap_or(&72.0);
        let peak = 160.0 + (effort % 4) as f64 * 3.0;
        for i in 1..=120 {
            hr.push(start + (peak - start) * (i as f64 / 120.0).sqrt());
        }
        let tau = 30.0 + (effort % 5) as f64 * 4.0;
        for t in 1..=180 {
            hr.push(95.0 + (peak - 95.0) * (-(t as f64) / tau).exp());
        }
    }
    let jittered = hr
        .iter()
        .enumerate()
        .map(|(i, v)| v + ((i * 37) % 7) as f64 * 0.2 - 0.6);

    let start = Utc.with_ymd_and_hms(2024, 1, 1, 6, 0, 0).unwrap();
    SessionSamples {
        session_id: format!("bench-{}", efforts),
        samples: jittered
            .enumerate()
            .map(|(s, bpm)| HrSample::new(start + Duration::seconds(s as i64), bpm))
            .collect(),
        resting_hr: Some(55.0),
    }
}

fn bench_signal_preparation(c: &mut Criterion) {
    let config = HrrConfig::default();
    let mut group = c.benchmark_group("Signal Preparation");

    for &efforts in &[1, 10, 40] {
        let session = interval_workout(efforts);
        group.throughput(Throughput::Elements(session.samples.len() as u64));
        group.bench_with_input(
            BenchmarkId::new("prepare", efforts),
            &session,
            |b, session| b.iter(|| signal::prepare(black_box(&session.samples), &config)),
        );
    }

    group.finish();
}

fn bench_exponential_fit(c: &mut Criterion) {
    let config = HrrConfig::default();
    let mut group = c.benchmark_group("Exponential Fit");

    for &window in &[30usize, 120, 300] {
        let t: Vec<f64> = (0..=window).map(|s| s as f64).collect();
        let y: Vec<f64> = t.iter().map(|s| 95.0 + 65.0 * (-s / 35.0).exp()).collect();
        group.bench_with_input(BenchmarkId::new("fit_exponential", window), &(t, y), |b, (t, y)| {
            b.iter(|| fitting::fit_exponential(black_box(t), black_box(y), &config.bounds, config.max_fit_iterations))
        });
    }

    group.finish();
}

fn bench_detect_session(c: &mut Criterion) {
    let config = HrrConfig::default();
    let mut group = c.benchmark_group("Session Detection");
    group.sample_size(20);

    for &efforts in &[1, 10, 40] {
        let session = interval_workout(efforts);
        group.throughput(Throughput::Elements(efforts as u64));
        group.bench_with_input(
            BenchmarkId::new("detect_session", efforts),
            &session,
            |b, session| b.iter(|| pipeline::detect_session(black_box(session), &config)),
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_signal_preparation,
    bench_exponential_fit,
    bench_detect_session
);
criterion_main!(benches);
