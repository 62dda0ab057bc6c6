use clap::Parser;

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "novora-limits")]
#[command(about = "Rate limiting and usage metering gateway for the Novora API")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    // Redis URL for the shared store, e.g. "redis://127.0.0.1:6379".
    // Falls back to the in-process store when absent (single instance only).
    #[arg(long)]
    pub redis_url: Option<String>,

    // Budget for each backing-store call, in milliseconds. A slower call is
    // treated as a store outage.
    #[arg(long, default_value_t = 250)]
    pub store_timeout_ms: u64,

    // Interval for sweeping idle window entries, in seconds
    #[arg(long, default_value_t = 60)]
    pub sweep_interval: u64,

    // Tier applied to tenants without a subscription record
    #[arg(long, default_value = "basic")]
    pub default_tier: String,
}
