#![allow(clippy::result_large_err)]
#![allow(clippy::uninlined_format_args)]

pub mod admission;
pub mod args;
pub mod config;
pub mod connections;
pub mod connectors;
pub mod dispatcher; // where we have the high-level dispatcher
pub mod enqueue;
pub mod health;
pub mod http;
pub mod repo;
pub mod subsystems; // subsystems: queue, trigger, executor, and timers
pub mod supervisor;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use config::Config;
use dispatcher::Dispatcher;

// This section is called from both main and end-to-end tests
use std::sync::Arc;
use utils::context::AppContext;
use utils::telemetry::HttpMetrics;

pub use utils::init_tracing_tests;

/// Entry point to start up the whole server
/// Called from main and end-to-end tests
pub fn run_server(
    ctx: AppContext,
    config: Config,
    dispatcher: Arc<Dispatcher>,
    metrics: HttpMetrics,
) {
    let _ = ctrlc::set_handler({
        let ctx = ctx.clone();
        move || {
            ctx.kill();
        }
    });

    // start the http server in its own thread
    let server_handle = std::thread::spawn({
        let dispatcher = dispatcher.clone();
        let ctx = ctx.clone();
        let config = config.clone();
        move || {
            http::server::start(ctx, config, dispatcher, metrics).unwrap();
        }
    });

    let dispatcher_handle = std::thread::spawn(move || {
        dispatcher.start(ctx).unwrap();
    });

    // wait for all threads to finish

    server_handle.join().unwrap();
    dispatcher_handle.join().unwrap();
}
