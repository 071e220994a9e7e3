// Worker node binary.

use malcolm::config::{parse_or_exit, WorkerArgs, EXIT_BAD_ARGS, EXIT_TRANSPORT};
use malcolm::worker::{self, WorkerConfig};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn main() -> ExitCode {
    env_logger::init();
    let args: WorkerArgs = match parse_or_exit() {
        Ok(args) => args,
        Err(code) => return code,
    };
    let config = match WorkerConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("worker configuration error: {e}");
            return ExitCode::from(EXIT_BAD_ARGS);
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    let ctrlc_flag = Arc::clone(&running);
    if let Err(e) = ctrlc::set_handler(move || ctrlc_flag.store(false, Ordering::Relaxed)) {
        log::warn!("[worker] signal handler unavailable: {e}");
    }

    match worker::spawn(config, running) {
        Ok(handle) => {
            let stats = handle.join();
            println!(
                "worker done: completed={} misses={}",
                stats.completed_requests, stats.deadline_misses
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("worker failed to start: {e}");
            ExitCode::from(EXIT_TRANSPORT)
        }
    }
}
