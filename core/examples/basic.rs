//! Breaker, rate limiter and retry working together against a flaky venue

use exchange_resilience::{
    CallError, CircuitBreaker, Classify, ErrorClass, RateLimiter, RateLimiterConfig,
    ResiliencePipeline, RetryConfig, RetryError, WeightTable,
};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

#[derive(Debug)]
enum VenueError {
    Overloaded,
    InsufficientBalance,
}

impl fmt::Display for VenueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VenueError::Overloaded => f.write_str("503 overloaded"),
            VenueError::InsufficientBalance => f.write_str("400 insufficient balance"),
        }
    }
}

impl Classify for VenueError {
    fn error_class(&self) -> ErrorClass {
        match self {
            VenueError::Overloaded => ErrorClass::Transient,
            VenueError::InsufficientBalance => ErrorClass::Terminal,
        }
    }
}

fn describe<T: fmt::Debug>(result: Result<T, RetryError<CallError<VenueError>>>) -> String {
    match result {
        Ok(value) => format!("✓ {value:?}"),
        Err(RetryError::Exhausted { attempts, last }) => {
            format!("✗ gave up after {attempts} attempts: {last}")
        }
        Err(RetryError::Terminal { attempt, error }) if !error.was_attempted() => {
            format!("✗ not attempted (attempt {attempt}): {error}")
        }
        Err(RetryError::Terminal { attempt, error }) => {
            format!("✗ terminal on attempt {attempt}: {error}")
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    println!("=== Exchange Resilience Basic Example ===\n");

    let breaker = CircuitBreaker::builder("demo:orders")
        .failure_threshold(3)
        .minimum_request_volume(3)
        .reset_timeout_ms(2_000)
        .success_threshold(1)
        .on_open(|name| println!("🔴 Circuit '{name}' opened!"))
        .on_half_open(|name| println!("🟡 Circuit '{name}' half-open, probing..."))
        .on_close(|name| println!("🟢 Circuit '{name}' closed!"))
        .build();
    let limiter = Arc::new(RateLimiter::new(
        "demo:rest",
        RateLimiterConfig::new(20, 1_000).with_weights(WeightTable::new().with("order_book", 5)),
    ));
    let pipeline = ResiliencePipeline::new(breaker)
        .with_limiter(Arc::clone(&limiter))
        .with_retry(RetryConfig {
            max_attempts: 3,
            base_delay_ms: 100,
            ..RetryConfig::default()
        });

    println!("--- Flaky call recovers on retry ---");
    let calls = &AtomicU32::new(0);
    let result = pipeline
        .call("place_order", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(VenueError::Overloaded)
            } else {
                Ok("order-1")
            }
        })
        .await;
    println!("{}", describe(result));
    println!("Budget left: {}/20\n", limiter.remaining());

    println!("--- Client errors are never retried ---");
    let result = pipeline
        .call("place_order", || async {
            Err::<&str, _>(VenueError::InsufficientBalance)
        })
        .await;
    println!("{}\n", describe(result));

    println!("--- Weighted endpoint drains the budget faster ---");
    for _ in 0..3 {
        let result = pipeline
            .call("order_book", || async { Ok::<_, VenueError>("snapshot") })
            .await;
        println!("{}  (budget left: {})", describe(result), limiter.remaining());
    }
    println!();

    println!("--- Outage opens the circuit ---");
    let result = pipeline
        .call("place_order", || async { Err::<&str, _>(VenueError::Overloaded) })
        .await;
    println!("{}", describe(result));
    println!("State: {}\n", pipeline.breaker().state());

    println!("--- Calls while open are rejected without reaching the venue ---");
    let result = pipeline
        .call("place_order", || async { Ok::<_, VenueError>("never sent") })
        .await;
    println!("{}\n", describe(result));

    println!("--- Waiting out the reset timeout ---");
    tokio::time::sleep(Duration::from_millis(2_100)).await;
    let result = pipeline
        .call("place_order", || async { Ok::<_, VenueError>("order-2") })
        .await;
    println!("{}", describe(result));
    println!("State: {}\n", pipeline.breaker().state());

    let metrics = pipeline.breaker().metrics();
    println!("--- Metrics ---");
    println!("Total calls: {}", metrics.total_calls);
    println!("Failed calls: {}", metrics.failed_calls);
    println!("Rejected calls: {}", metrics.rejected_calls);
    println!("Retry stats: {:?}", pipeline.retry_stats());
}
