use std::sync::Arc;

use clap::Parser;
use opentelemetry::global;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utils::{
    context::AppContext,
    telemetry::{setup_metrics, setup_tracing, Metrics},
};

use flowline::{
    args::CliArgs,
    config::{Config, ConfigBuilder, Secrets},
    connectors::NullInvoker,
    dispatcher::Dispatcher,
    supervisor,
};

fn main() {
    let args = CliArgs::parse();
    let config: Config = match ConfigBuilder::new(args).build() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {:#}", err);
            std::process::exit(2);
        }
    };

    let ctx = AppContext::new();

    // setup tracing
    let filters = config.tracing_env_filter().unwrap();
    let tracer_provider = if let Some(collector) = config.jaeger.as_ref() {
        // the otlp exporter wants a runtime while it builds
        Some(ctx.rt.block_on({
            let collector = collector.clone();
            async move { setup_tracing(&collector, "flowline", filters) }
        }))
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .without_time()
                    .with_target(false),
            )
            .with(filters)
            .try_init()
            .unwrap();
        None
    };

    let meter_provider = config
        .prometheus
        .as_ref()
        .map(|collector| setup_metrics(collector, "flowline_metrics"));
    let meter = global::meter("flowline_metrics");
    let metrics = Metrics::init(&meter);

    let secrets = Secrets::from_env();

    let dispatcher = match Dispatcher::new(&config, &secrets, Arc::new(NullInvoker), metrics.core) {
        Ok(dispatcher) => Arc::new(dispatcher),
        Err(err) => {
            tracing::error!("failed to construct dispatcher: {:#}", err);
            std::process::exit(1);
        }
    };

    if let Err(err) = supervisor::startup_checks(&config, &secrets, &dispatcher) {
        tracing::error!("{}", err);
        std::process::exit(err.exit_code());
    }

    flowline::run_server(ctx, config, dispatcher, metrics.http);

    if let Some(tracer) = tracer_provider {
        let _ = tracer.shutdown();
    }
    if let Some(meter) = meter_provider {
        let _ = meter.shutdown();
    }
}
