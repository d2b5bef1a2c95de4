//! Run a shell in fresh mount and PID namespaces
//!
//! Run with: sudo cargo run --example namespace_demo

use nsgate_namespace::{IsolationMode, NamespaceExecutor};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_writer(std::io::stderr)
        .init();

    println!("Host PID: {}", std::process::id());

    let executor = NamespaceExecutor::new(IsolationMode::Namespaces);
    println!("Namespaces: {}", executor.request().enabled_namespaces().join(", "));

    // The shell runs as PID 2 under the namespace init, and /proc only shows that tree.
    let outcome = executor.execute(&["sh", "-c", "echo \"PID inside: $$\"; ls /proc | grep -c '^[0-9]'"])?;

    println!("Command {outcome}");

    Ok(())
}
