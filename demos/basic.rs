//! Basic usage of pools, work threads and futures

use courier_core::{
    thread_pool, BaseFuture, ErrorAwareFactory, FnFactory, ObjectPool, PoolConfiguration,
    PoolError, PoolExecutor,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== courier_core - Basic Examples ===\n");

    // Example 1: Growing pool with a hard capacity
    capped_pool();

    // Example 2: Connections that retire after repeated errors
    error_aware_pool();

    // Example 3: Executor on a pool of work threads
    executor();

    // Example 4: Futures and listeners
    futures();
}

fn capped_pool() {
    println!("1. Capped Pool:");
    let counter = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&counter);
    let config = PoolConfiguration::new().with_capacity(2, 2, Some(5));
    let pool = ObjectPool::new("numbers", FnFactory::new(move || Ok(c.fetch_add(1, Ordering::SeqCst))), config)
        .unwrap();
    pool.start().unwrap();

    let held: Vec<_> = (0..5).map(|_| pool.get_object().unwrap()).collect();
    println!("   Size: {}, in use: {}", pool.size(), pool.in_use_count());
    match pool.get_object() {
        Err(PoolError::CapacityExceeded { max, .. }) => println!("   Capacity of {max} reached"),
        other => println!("   Unexpected: {other:?}"),
    }
    drop(held);

    println!("   Health: {:?}", pool.get_health_status().warnings);
    for (name, value) in pool.get_metrics().export() {
        println!("   {name} = {value}");
    }
    pool.close().unwrap();
    println!();
}

fn error_aware_pool() {
    println!("2. Error-aware Pool:");
    let factory = ErrorAwareFactory::new(FnFactory::new(|| Ok(String::from("conn"))), 2);
    let pool = ObjectPool::new("connections", factory, PoolConfiguration::new().with_capacity(1, 1, Some(1)))
        .unwrap();
    pool.start().unwrap();

    {
        let mut conn = pool.get_object().unwrap();
        for _ in 0..2 {
            let res: Result<(), &str> = conn.call(|_| Err("broken pipe"));
            println!("   Call failed: {res:?}, usable: {}", conn.is_usable());
        }
    }
    let conn = pool.get_object().unwrap();
    println!("   Fresh connection, errors: {}", conn.error_count());
    drop(conn);
    pool.close().unwrap();
    println!();
}

fn executor() {
    println!("3. Executor:");
    let executor = PoolExecutor::new(thread_pool("demo", PoolConfiguration::default()).unwrap());
    let finished = executor
        .sync_exec(
            Box::new(|| println!("   Running on {:?}", thread::current().name())),
            Some(Duration::from_secs(1)),
        )
        .unwrap();
    println!("   Finished: {finished}");
    println!("   Idle threads: {}\n", executor.threads().free_count());
}

fn futures() {
    println!("4. Futures:");
    let future = BaseFuture::new();
    future.add_listener(|f: &BaseFuture<u64>| println!("   Listener saw {:?}", f.try_get()));
    let producer = future.clone();
    thread::spawn(move || producer.set_value(42));
    println!("   Value: {:?}", future.get_timeout(Duration::from_secs(1)));
}
