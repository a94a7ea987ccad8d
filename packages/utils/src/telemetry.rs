use opentelemetry::{global, trace::TracerProvider as _};
use opentelemetry_otlp::{Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::SdkMeterProvider,
    resource::Resource,
    trace::{self, Sampler, SdkTracerProvider},
};
use tracing_subscriber::layer::SubscriberExt;

pub fn setup_tracing(
    collector: &str,
    service_name: &str,
    filters: tracing_subscriber::EnvFilter,
) -> SdkTracerProvider {
    global::set_text_map_propagator(opentelemetry_jaeger_propagator::Propagator::new());
    let endpoint = format!("{}/v1/traces", collector);
    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .expect("Failed to build OTLP exporter");

    let batch_processor = trace::BatchSpanProcessor::builder(exporter).build();

    let provider = SdkTracerProvider::builder()
        .with_span_processor(batch_processor)
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(
            Resource::builder()
                .with_service_name(service_name.to_owned())
                .build(),
        )
        .build();
    global::set_tracer_provider(provider.clone());
    let tracer = provider.tracer(format!("{}-tracer", service_name));
    let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);

    let subscriber = tracing_subscriber::Registry::default()
        .with(filters)
        .with(tracing_subscriber::fmt::layer()) // console logging layer
        .with(telemetry);

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set global default subscriber");

    tracing::info!("Jaeger tracing enabled");
    provider
}

pub fn setup_metrics(collector: &str, service_name: &str) -> SdkMeterProvider {
    let endpoint = format!("{}/api/v1/otlp/v1/metrics", collector);

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .expect("Failed to build OTLP exporter!");

    let meter_provider = SdkMeterProvider::builder()
        .with_resource(
            Resource::builder()
                .with_service_name(service_name.to_owned())
                .build(),
        )
        .with_periodic_exporter(exporter)
        .build();

    global::set_meter_provider(meter_provider.clone());

    tracing::info!("Metrics enabled and exporting to {}", collector);

    meter_provider
}

use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
use opentelemetry::KeyValue;

pub struct Metrics {
    pub http: HttpMetrics,
    pub core: CoreMetrics,
}

impl Metrics {
    pub fn init(meter: &Meter) -> Self {
        Self {
            http: HttpMetrics::init(meter),
            core: CoreMetrics::init(meter),
        }
    }
}

#[derive(Clone, Debug)]
pub struct HttpMetrics {
    pub requests: Counter<u64>,
}

impl HttpMetrics {
    pub const LABEL: &'static str = "http";

    pub fn init(meter: &Meter) -> Self {
        HttpMetrics {
            requests: meter
                .u64_counter(format!("{}_requests", Self::LABEL))
                .with_description("Number of http requests handled")
                .build(),
        }
    }

    pub fn record_request(&self, route: &'static str) {
        self.requests.add(1, &[KeyValue::new("route", route)]);
    }
}

#[derive(Clone, Debug)]
pub struct CoreMetrics {
    pub dispatcher: DispatcherMetrics,
    pub trigger: TriggerMetrics,
    pub queue: QueueMetrics,
    pub executor: ExecutorMetrics,
}

impl CoreMetrics {
    pub fn init(meter: &Meter) -> Self {
        Self {
            dispatcher: DispatcherMetrics::init(meter),
            trigger: TriggerMetrics::init(meter),
            queue: QueueMetrics::init(meter),
            executor: ExecutorMetrics::init(meter),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DispatcherMetrics {
    pub total_errors: Counter<u64>,
}

impl DispatcherMetrics {
    pub const LABEL: &'static str = "dispatcher";

    pub fn init(meter: &Meter) -> Self {
        Self {
            total_errors: meter
                .u64_counter(format!("{}_total_errors", Self::LABEL))
                .with_description("Errors surfaced at the dispatcher level")
                .build(),
        }
    }

    pub fn increment_total_errors(&self, reason: &'static str) {
        self.total_errors.add(1, &[KeyValue::new("reason", reason)]);
    }
}

#[derive(Clone, Debug)]
pub struct TriggerMetrics {
    pub webhooks_received: Counter<u64>,
    pub verification_failures: Counter<u64>,
    pub dedupe_hits: Counter<u64>,
    pub polls_run: Counter<u64>,
    pub poll_errors: Counter<u64>,
    pub triggers_fired: Counter<u64>,
}

impl TriggerMetrics {
    pub const LABEL: &'static str = "trigger";

    pub fn init(meter: &Meter) -> Self {
        Self {
            webhooks_received: meter
                .u64_counter(format!("{}_webhooks_received", Self::LABEL))
                .with_description("Webhook deliveries received")
                .build(),
            verification_failures: meter
                .u64_counter(format!("{}_verification_failures", Self::LABEL))
                .with_description("Webhook signature verification failures")
                .build(),
            dedupe_hits: meter
                .u64_counter(format!("{}_dedupe_hits", Self::LABEL))
                .with_description("Deliveries suppressed as duplicates")
                .build(),
            polls_run: meter
                .u64_counter(format!("{}_polls_run", Self::LABEL))
                .with_description("Polling trigger invocations")
                .build(),
            poll_errors: meter
                .u64_counter(format!("{}_poll_errors", Self::LABEL))
                .with_description("Polling trigger failures")
                .build(),
            triggers_fired: meter
                .u64_counter(format!("{}_fired", Self::LABEL))
                .with_description("Trigger occurrences that produced an execution job")
                .build(),
        }
    }

    pub fn record_trigger_fired(&self, trigger_type: &'static str) {
        self.triggers_fired
            .add(1, &[KeyValue::new("trigger_type", trigger_type)]);
    }

    pub fn record_verification_failure(&self, provider: &str) {
        self.verification_failures
            .add(1, &[KeyValue::new("provider", provider.to_string())]);
    }
}

#[derive(Clone, Debug)]
pub struct QueueMetrics {
    pub enqueued: Counter<u64>,
    pub dequeued: Counter<u64>,
    pub acked: Counter<u64>,
    pub nacked: Counter<u64>,
    pub backlog: UpDownCounter<i64>,
    pub admission_rejections: Counter<u64>,
}

impl QueueMetrics {
    pub const LABEL: &'static str = "queue";

    pub fn init(meter: &Meter) -> Self {
        Self {
            enqueued: meter
                .u64_counter(format!("{}_enqueued", Self::LABEL))
                .with_description("Jobs enqueued")
                .build(),
            dequeued: meter
                .u64_counter(format!("{}_dequeued", Self::LABEL))
                .with_description("Jobs leased by workers")
                .build(),
            acked: meter
                .u64_counter(format!("{}_acked", Self::LABEL))
                .with_description("Jobs acknowledged")
                .build(),
            nacked: meter
                .u64_counter(format!("{}_nacked", Self::LABEL))
                .with_description("Jobs returned for redelivery")
                .build(),
            backlog: meter
                .i64_up_down_counter(format!("{}_backlog", Self::LABEL))
                .with_description("Jobs waiting or in flight")
                .build(),
            admission_rejections: meter
                .u64_counter(format!("{}_admission_rejections", Self::LABEL))
                .with_description("Executions rejected by org admission")
                .build(),
        }
    }

    pub fn record_admission_rejection(&self, event_type: &'static str) {
        self.admission_rejections
            .add(1, &[KeyValue::new("event_type", event_type)]);
    }
}

#[derive(Clone, Debug)]
pub struct ExecutorMetrics {
    pub nodes_invoked: Counter<u64>,
    pub node_retries: Counter<u64>,
    pub idempotent_reuses: Counter<u64>,
    pub executions_completed: Counter<u64>,
    pub executions_failed: Counter<u64>,
    pub execution_seconds: Histogram<f64>,
}

impl ExecutorMetrics {
    pub const LABEL: &'static str = "executor";

    pub fn init(meter: &Meter) -> Self {
        Self {
            nodes_invoked: meter
                .u64_counter(format!("{}_nodes_invoked", Self::LABEL))
                .with_description("Connector invocations")
                .build(),
            node_retries: meter
                .u64_counter(format!("{}_node_retries", Self::LABEL))
                .with_description("Node attempts beyond the first")
                .build(),
            idempotent_reuses: meter
                .u64_counter(format!("{}_idempotent_reuses", Self::LABEL))
                .with_description("Node invocations answered from the result cache")
                .build(),
            executions_completed: meter
                .u64_counter(format!("{}_executions_completed", Self::LABEL))
                .with_description("Runs that reached completed")
                .build(),
            executions_failed: meter
                .u64_counter(format!("{}_executions_failed", Self::LABEL))
                .with_description("Runs that reached failed")
                .build(),
            execution_seconds: meter
                .f64_histogram(format!("{}_execution_seconds", Self::LABEL))
                .with_description("Wall-clock run duration")
                .build(),
        }
    }
}
