// Load balancer binary.

use malcolm::config::{parse_or_exit, LbArgs, EXIT_BAD_ARGS, EXIT_TRANSPORT};
use malcolm::lb::{self, LbConfig};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn main() -> ExitCode {
    env_logger::init();
    let args: LbArgs = match parse_or_exit() {
        Ok(args) => args,
        Err(code) => return code,
    };
    let config = match LbConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("lb configuration error: {e}");
            return ExitCode::from(EXIT_BAD_ARGS);
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    let ctrlc_flag = Arc::clone(&running);
    if let Err(e) = ctrlc::set_handler(move || ctrlc_flag.store(false, Ordering::Relaxed)) {
        log::warn!("[lb] signal handler unavailable: {e}");
    }

    match lb::spawn(config, running) {
        Ok(handle) => {
            let stats = handle.join();
            println!(
                "lb done: total={} orphans={} dropped={}",
                stats.total_requests, stats.orphan_responses, stats.dropped_requests
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("lb failed to start: {e}");
            ExitCode::from(EXIT_TRANSPORT)
        }
    }
}
