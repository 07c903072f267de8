//! Buffers and target processing against a pool of connections

use courier_core::{
    thread_pool, AsyncBuffer, AsynchProcessing, BoxError, BufferConfig, FnFactory, ObjectPool,
    PoolConfiguration, PoolExecutor, PooledObject, ProcessingConfig, Processor, Receiver,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

type Connections = ObjectPool<FnFactory<Box<dyn Fn() -> Result<String, BoxError> + Send + Sync>>>;

struct Printer;

impl Receiver<String> for Printer {
    fn handle_data(&self, part: Vec<String>) -> Result<(), BoxError> {
        println!("   Batch of {}: {:?}", part.len(), part);
        Ok(())
    }
}

/// Sends targets over connections borrowed from a pool
struct Sender {
    connections: Connections,
    sent: AtomicUsize,
}

impl Processor for Sender {
    type Resource = PooledObject<FnFactory<Box<dyn Fn() -> Result<String, BoxError> + Send + Sync>>>;
    type Target = u32;

    fn find_resource(&self, _token: &CancellationToken) -> Result<Option<Self::Resource>, BoxError> {
        Ok(Some(self.connections.get_object()?))
    }

    fn release_resource(&self, resource: Self::Resource) {
        drop(resource);
    }

    fn process(&self, conn: &mut Self::Resource, target: &u32, _token: &CancellationToken) -> Result<(), BoxError> {
        thread::sleep(Duration::from_millis(5));
        self.sent.fetch_add(1, Ordering::SeqCst);
        if target % 25 == 0 {
            println!("   {} sent target {target}", **conn);
        }
        Ok(())
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== courier_core - Processing Examples ===\n");

    buffer();
    processing();
}

fn buffer() {
    println!("1. Async Buffer:");
    let executor = PoolExecutor::new(thread_pool("buffer", PoolConfiguration::default()).unwrap());
    let config = BufferConfig::new().with_part_size(4).with_max_thread_count(2);
    let buffer = AsyncBuffer::<String>::new("lines", Arc::new(Printer), executor, config).unwrap();
    buffer.add_all((0..10).map(|i| format!("line-{i}"))).unwrap();
    buffer.flush();
    buffer.close();
    println!();
}

fn processing() {
    println!("2. Target Processing:");
    let counter = Arc::new(AtomicUsize::new(0));
    let alloc: Box<dyn Fn() -> Result<String, BoxError> + Send + Sync> =
        Box::new(move || Ok(format!("conn-{}", counter.fetch_add(1, Ordering::SeqCst))));
    let connections: Connections =
        ObjectPool::new("connections", FnFactory::new(alloc), PoolConfiguration::new().with_max_capacity(3)).unwrap();
    connections.start().unwrap();

    let executor = PoolExecutor::new(thread_pool("senders", PoolConfiguration::default()).unwrap());
    let config = ProcessingConfig::new(3).with_check_interval(Some(Duration::from_millis(20)));
    let engine = AsynchProcessing::named(
        "sender",
        Sender {
            connections: connections.clone(),
            sent: AtomicUsize::new(0),
        },
        executor,
        config,
    )
    .unwrap();
    engine.add_state_listener(|state| println!("   Engine is {state}"));
    engine.start().unwrap();

    for target in 0..100 {
        engine.add_target(target, true).unwrap();
    }
    while engine.processor().sent.load(Ordering::SeqCst) < 100 {
        thread::sleep(Duration::from_millis(10));
    }
    println!("   {}", engine.debug_string());
    println!("   Connections allocated: {}", connections.size());
    engine.close(Some(Duration::from_secs(5))).unwrap();
    connections.close().unwrap();
}
