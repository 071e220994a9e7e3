// Load-generating client binary.

use malcolm::client::{self, ClientConfig};
use malcolm::config::{parse_or_exit, ClientArgs, EXIT_TRANSPORT};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn main() -> ExitCode {
    env_logger::init();
    let args: ClientArgs = match parse_or_exit() {
        Ok(args) => args,
        Err(code) => return code,
    };

    let running = Arc::new(AtomicBool::new(true));
    let ctrlc_flag = Arc::clone(&running);
    if let Err(e) = ctrlc::set_handler(move || ctrlc_flag.store(false, Ordering::Relaxed)) {
        log::warn!("[client] signal handler unavailable: {e}");
    }

    let config = ClientConfig::from_args(&args);
    match client::run(config, running) {
        Ok(stats) => {
            println!("Total Requests:  {}", stats.sent_requests);
            println!("Completed:       {}", stats.completed_requests);
            println!("Deadline Misses: {}", stats.deadline_misses);
            println!("Actual RPS:      {:.0}", stats.actual_rps);
            println!("P50 Latency:     {:.2} us", stats.p50_latency_us);
            println!("P99 Latency:     {:.2} us", stats.p99_latency_us);
            println!("P99.9 Latency:   {:.2} us", stats.p999_latency_us);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("client failed: {e}");
            ExitCode::from(EXIT_TRANSPORT)
        }
    }
}
