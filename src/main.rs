// courier_core - concurrency core of the courier server
// Run the demos with: cargo run --example basic

use courier_core::{FnFactory, ObjectPool, PoolConfiguration};

fn main() {
    println!("=== courier_core ===");
    println!("See demos/ directory for usage examples");
    println!("Run: cargo run --example basic");
    println!();

    println!("Quick Demo:");
    let config = PoolConfiguration::new().with_capacity(2, 1, Some(4));
    let pool = match ObjectPool::new("demo", FnFactory::new(|| Ok(String::from("connection"))), config) {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("  Cannot create pool: {e}");
            return;
        }
    };
    if let Err(e) = pool.start() {
        eprintln!("  Cannot start pool: {e}");
        return;
    }

    match pool.get_object() {
        Ok(obj) => println!("  Got object: {}", *obj),
        Err(e) => eprintln!("  Checkout failed: {e}"),
    }

    println!("  Free after return: {}", pool.free_count());
    println!("  {pool}");
    let _ = pool.close();
}
