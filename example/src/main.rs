//! A small service under heap checking.
//!
//! Build: cargo build --release --manifest-path example/Cargo.toml
//! Run:   HEAPCHECK=normal ./example/target/release/example_app
//! Leak:  HEAPCHECK=strict ./example/target/release/example_app --leak
//!
//! With `--leak` the cache loses a copy of every key it looks up; the batch
//! check and the exit-time check both report it.

mod cache;
mod checkout;

use cache::DataCache;
use checkout::CheckoutEngine;
use heapcheck::{LeakChecker, Strictness};
use std::sync::{LazyLock, Mutex};

heapcheck::heap_checked!();

static CACHE: LazyLock<Mutex<DataCache>> = LazyLock::new(|| {
    let leak = std::env::args().any(|a| a == "--leak");
    Mutex::new(DataCache::new(leak))
});

#[inline(never)]
fn serve(engine: &CheckoutEngine, request: u64) -> usize {
    let key = format!("cart-{}", request % 100);
    let mut cache = CACHE.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(body) = cache.get(&key) {
        return body.len();
    }
    let body = engine.handle(request, (request % 4) as u8);
    let len = body.len();
    cache.put(key, body);
    len
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let running = heapcheck::start_from_main(Strictness::Normal);
    println!("=== heapcheck demo ===");
    println!("PID: {}", std::process::id());
    println!("Exit-time check: {}", if running { "on" } else { "off" });

    // Lives for the whole run on purpose.
    let engine: &'static CheckoutEngine = heapcheck::leak(Box::new(CheckoutEngine::new()));

    // Warm the cache so later batches only hit it.
    for request in 0..100 {
        serve(engine, request);
    }
    heapcheck::register_cleanup(|| {
        CACHE.lock().unwrap_or_else(|e| e.into_inner()).clear();
    });

    let mut checker = LeakChecker::new("request_batch");
    let mut served = 0;
    for request in 0..1_000 {
        served += serve(engine, request * 7);
    }
    let clean = checker.no_leaks();

    println!(
        "served {} bytes, cache holds {} entries, batch {}",
        served,
        CACHE.lock().unwrap_or_else(|e| e.into_inner()).len(),
        if clean { "clean" } else { "leaked" }
    );
}
