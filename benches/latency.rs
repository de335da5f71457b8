//! Latency benchmarks for the per-dispatch decision path.
//!
//! Run with: `cargo bench --bench latency`

use broker_core::api::protocol::{BuyParameters, Request, Response};
use broker_core::types::{
    AttemptResult, ContractSettlement, Direction, DurationUnit, GlobalDefaults, LossPolicy,
    EffectiveParams, Signal, TradeAttempt,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use risk_manager::{StopLedger, StopThresholds};
use rust_decimal::Decimal;
use trading_engine::{MartingaleController, RunBook};

fn settled_attempt(signal: &Signal, sequence: u32, profit: i64) -> TradeAttempt {
    let mut attempt = TradeAttempt::new(signal.id, sequence, Decimal::new(10, 0));
    attempt.settle(&ContractSettlement {
        contract_id: 1000 + sequence as u64,
        profit: Decimal::new(profit, 0),
        payout: Decimal::ZERO,
        buy_price: Some(Decimal::new(10, 0)),
    });
    attempt
}

/// Benchmark effective parameter resolution.
fn bench_param_resolution(c: &mut Criterion) {
    let mut group = c.benchmark_group("param_resolution");
    let globals = GlobalDefaults {
        stake: Decimal::new(5, 0),
        stop_win: Some(Decimal::new(100, 0)),
        stop_loss: Some(Decimal::new(70, 0)),
        martingale_enabled: true,
    };

    let own = Signal::new("EURUSD", Direction::Call, Decimal::new(10, 0))
        .with_stops(Some(Decimal::new(50, 0)), Some(Decimal::ZERO));
    let overridden = own.clone().with_global_override(true);

    group.bench_function("own_values", |b| {
        b.iter(|| EffectiveParams::resolve(black_box(&own), black_box(&globals)))
    });
    group.bench_function("global_override", |b| {
        b.iter(|| EffectiveParams::resolve(black_box(&overridden), black_box(&globals)))
    });

    group.finish();
}

/// Benchmark martingale progression through a losing streak.
fn bench_martingale(c: &mut Criterion) {
    let mut group = c.benchmark_group("martingale");

    for losses in [1u32, 8, 32].iter() {
        group.bench_with_input(BenchmarkId::new("losing_streak", losses), losses, |b, &losses| {
            b.iter(|| {
                let mut run = MartingaleController::new(Decimal::new(10, 0), LossPolicy::ResolveLost);
                for _ in 0..losses {
                    let _ = run.begin_attempt();
                    let _ = run.on_result(&AttemptResult::Lost, true);
                }
                black_box(run.current_stake())
            })
        });
    }

    group.finish();
}

/// Benchmark stop ledger accounting and evaluation.
fn bench_stop_ledger(c: &mut Criterion) {
    let mut group = c.benchmark_group("stop_ledger");
    let signal = Signal::new("R_100", Direction::Put, Decimal::new(10, 0));
    let thresholds = StopThresholds::new(Some(Decimal::new(100, 0)), Some(Decimal::new(70, 0)));

    let mut ledger = StopLedger::new();
    for sequence in 1..=50 {
        let profit = if sequence % 3 == 0 { 9 } else { -10 };
        ledger.record(&settled_attempt(&signal, sequence, profit));
    }

    group.bench_function("record", |b| {
        let attempt = settled_attempt(&signal, 51, -10);
        b.iter(|| {
            let mut ledger = ledger.clone();
            black_box(ledger.record(black_box(&attempt)))
        })
    });
    group.bench_function("evaluate_signal", |b| {
        b.iter(|| ledger.evaluate_signal(black_box(signal.id), black_box(&thresholds)))
    });
    group.bench_function("evaluate_global", |b| {
        b.iter(|| ledger.evaluate_global(black_box(&thresholds)))
    });

    group.finish();
}

/// Benchmark reservation against a populated run book.
fn bench_run_book(c: &mut Criterion) {
    let mut group = c.benchmark_group("run_book");

    for size in [10usize, 100, 1000].iter() {
        let signals: Vec<Signal> = (0..*size)
            .map(|_| Signal::new("EURUSD", Direction::Call, Decimal::new(10, 0)))
            .collect();

        group.bench_with_input(BenchmarkId::new("reserve", size), &signals, |b, signals| {
            b.iter(|| {
                let book = RunBook::new(signals, LossPolicy::ResolveLost);
                for signal in signals {
                    let _ = book.reserve(signal.id, Decimal::new(10, 0));
                }
                black_box(book.in_flight())
            })
        });
    }

    group.finish();
}

/// Benchmark wire encoding and decoding.
fn bench_protocol(c: &mut Criterion) {
    let mut group = c.benchmark_group("protocol");

    let buy = Request::Buy(BuyParameters {
        symbol: "frxEURUSD".to_string(),
        direction: Direction::Call,
        amount: Decimal::new(40, 0),
        currency: "USD".to_string(),
        duration: 5,
        duration_unit: DurationUnit::Ticks,
    });
    group.bench_function("encode_buy", |b| b.iter(|| black_box(&buy).to_frame(black_box(42))));

    let update = r#"{"msg_type":"proposal_open_contract","req_id":7,
        "proposal_open_contract":{"contract_id":1001,"is_sold":1,"profit":"-40.00",
        "payout":"0","buy_price":"40.00","status":"lost"},
        "subscription":{"id":"c0ffee"}}"#;
    group.bench_function("decode_contract_update", |b| {
        b.iter(|| Response::parse(black_box(update)))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_param_resolution,
    bench_martingale,
    bench_stop_ledger,
    bench_run_book,
    bench_protocol,
);
criterion_main!(benches);
