use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pacer::domain::breaker::{BreakerConfig, CircuitBreaker};
use pacer::domain::budget::{BudgetStatus, PacingMode};
use pacer::domain::pacing::algorithm_for;

fn mid_day_status(mode: PacingMode) -> BudgetStatus {
    BudgetStatus {
        campaign_id: "bench-campaign".to_string(),
        daily_budget: 24_000_000,
        daily_spent: 12_000_000,
        hourly_budget: 1_000_000,
        hourly_spent: 500_000,
        remaining_hours: 12,
        current_hour: 12,
        pacing_mode: mode,
        throttle_rate: 0.0,
        circuit_breaker_on: false,
        degraded_mode: false,
    }
}

fn benchmark_throttle_calculation(c: &mut Criterion) {
    let mut group = c.benchmark_group("calculate_throttle");
    for mode in [
        PacingMode::Even,
        PacingMode::Asap,
        PacingMode::FrontLoaded,
        PacingMode::Adaptive,
    ] {
        let algorithm = algorithm_for(mode);
        let status = mid_day_status(mode);
        group.bench_function(format!("{}", mode), |b| {
            b.iter(|| algorithm.calculate_throttle(black_box(&status)))
        });
    }
    group.finish();
}

fn benchmark_admission(c: &mut Criterion) {
    let algorithm = algorithm_for(PacingMode::Even);
    let status = mid_day_status(PacingMode::Even);
    c.bench_function("should_bid_even", |b| {
        b.iter(|| algorithm.should_bid(black_box(&status), black_box(0.42)))
    });
}

fn benchmark_breaker_allow(c: &mut Criterion) {
    let breaker = CircuitBreaker::new(BreakerConfig::default());
    let status = mid_day_status(PacingMode::Even);
    c.bench_function("breaker_allow", |b| {
        b.iter(|| breaker.allow(black_box(&status)))
    });
}

criterion_group!(
    benches,
    benchmark_throttle_calculation,
    benchmark_admission,
    benchmark_breaker_allow
);
criterion_main!(benches);
