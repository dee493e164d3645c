//! Ephemera perception console.
//!
//! Loads a world fixture into an in-memory store and answers perception
//! requests line by line. Each input line is handled as one inbound request
//! with its own cache hierarchy.
//!
//! ```bash
//! cargo run -p ephemera -- --world ephemera/fixtures/tavern.json --character CHARACTER#wren
//! ```
//!
//! Set `RUST_LOG=ephemera_core=debug` to watch fetches, coalescing and
//! invalidation.

mod headless;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    let config = headless::parse_config_from_args(&args);
    headless::run_headless(config).await.map_err(|e| e.into())
}

fn print_help() {
    println!("Ephemera - perception console for a layered text world");
    println!();
    println!("USAGE:");
    println!("  ephemera [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("  -h, --help              Show this help message");
    println!("  --world <PATH>          World fixture (default: {})", headless::DEFAULT_WORLD);
    println!("  --character <ID>        Perceiving character (default: first in the fixture)");
    println!();
    println!("ENVIRONMENT:");
    println!("  EPHEMERA_CANON_ASSETS   Comma separated canon assets, overriding the fixture");
    println!("  RUST_LOG                Log filter, e.g. ephemera_core=debug");
    println!();
    println!("EXAMPLES:");
    println!("  ephemera --world ephemera/fixtures/tavern.json");
    println!("  ephemera --character CHARACTER#wren");
}
