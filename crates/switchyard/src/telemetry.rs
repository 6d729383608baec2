//! Telemetry: OTLP export for traces and logs, plus OTLP metrics backed by
//! the runtime's own counters.
//!
//! The metrics side is observable-instrument based: nothing in the hot
//! paths touches OpenTelemetry. Sessions and the relay engine keep their
//! plain counters ([`SessionStats`], rule counters) and
//! [`instrument_session`] / [`instrument_relay`] register callbacks that
//! snapshot them at each export interval.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use opentelemetry::metrics::Meter;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Per-exporter timeout so an unreachable collector cannot wedge shutdown.
const OTLP_EXPORT_TIMEOUT: Duration = Duration::from_secs(5);

/// Install the tracing subscriber (fmt + OTLP traces/logs) and the global
/// meter provider that [`instrument_session`]/[`instrument_relay`] hang
/// their instruments on.
pub fn init(otlp_endpoint: &str) -> Result<()> {
    let resource = service_resource();
    let endpoint = format!("http://{}", otlp_endpoint);

    let tracer_provider = build_tracer_provider(&endpoint, resource.clone())?;
    let logger_provider = build_logger_provider(&endpoint, resource.clone())?;
    let meter_provider = build_meter_provider(&endpoint, resource)?;

    let tracer = tracer_provider.tracer("switchyard");
    global::set_tracer_provider(tracer_provider);
    global::set_meter_provider(meter_provider);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .with(opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(
            &logger_provider,
        ))
        .init();

    tracing::info!("telemetry online, OTLP endpoint {}", otlp_endpoint);
    Ok(())
}

/// Flush any buffered telemetry. The providers flush on drop, and the
/// export timeout bounds how long that can take.
pub fn shutdown() -> Result<()> {
    tracing::info!("telemetry shutting down");
    Ok(())
}

fn service_resource() -> Resource {
    Resource::builder_empty()
        .with_service_name("switchyard")
        .with_attributes(vec![KeyValue::new(
            "service.version",
            env!("CARGO_PKG_VERSION"),
        )])
        .build()
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,switchyard=debug"))
}

fn build_tracer_provider(endpoint: &str, resource: Resource) -> Result<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.to_string())
        .with_timeout(OTLP_EXPORT_TIMEOUT)
        .build()
        .context("OTLP span exporter")?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource)
        .build())
}

fn build_logger_provider(endpoint: &str, resource: Resource) -> Result<SdkLoggerProvider> {
    let exporter = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.to_string())
        .with_timeout(OTLP_EXPORT_TIMEOUT)
        .build()
        .context("OTLP log exporter")?;

    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource)
        .build())
}

fn build_meter_provider(endpoint: &str, resource: Resource) -> Result<SdkMeterProvider> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.to_string())
        .with_timeout(OTLP_EXPORT_TIMEOUT)
        .build()
        .context("OTLP metric exporter")?;

    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(resource)
        .build())
}

// === domain metrics ===

use crate::relay::{RelayEngine, RuleStats};
use crate::session::{BrokerSession, SessionStats};

/// Expose a session's counters as OTLP instruments, attributed by
/// client id. Safe to call before [`init`] or without a collector: the
/// default meter provider makes these no-ops.
pub fn instrument_session(session: &Arc<BrokerSession>) {
    let meter = global::meter("switchyard");

    session_counter(
        &meter,
        session,
        "switchyard.session.messages_sent",
        "Messages published on this session",
        |s| s.messages_sent,
    );
    session_counter(
        &meter,
        session,
        "switchyard.session.messages_received",
        "Messages delivered by the broker on this session",
        |s| s.messages_received,
    );
    session_counter(
        &meter,
        session,
        "switchyard.session.requests_sent",
        "RPC requests dispatched",
        |s| s.requests_sent,
    );
    session_counter(
        &meter,
        session,
        "switchyard.session.responses_received",
        "RPC responses matched to a pending request",
        |s| s.responses_received,
    );
    session_counter(
        &meter,
        session,
        "switchyard.session.notifications_sent",
        "Fire-and-forget notifications published",
        |s| s.notifications_sent,
    );
    session_counter(
        &meter,
        session,
        "switchyard.session.errors",
        "Transport and publish errors",
        |s| s.errors,
    );
    session_counter(
        &meter,
        session,
        "switchyard.session.connections",
        "Successful (re)connects",
        |s| s.connection_count,
    );

    let uptime_session = session.clone();
    let uptime_attrs = [KeyValue::new(
        "client_id",
        session.client_id().to_string(),
    )];
    meter
        .u64_observable_gauge("switchyard.session.uptime_seconds")
        .with_description("Seconds since the session handle was created")
        .with_callback(move |observer| {
            observer.observe(uptime_session.statistics().uptime_seconds, &uptime_attrs);
        })
        .build();
}

fn session_counter(
    meter: &Meter,
    session: &Arc<BrokerSession>,
    name: &'static str,
    description: &'static str,
    select: fn(&SessionStats) -> u64,
) {
    let session = session.clone();
    let attrs = [KeyValue::new(
        "client_id",
        session.client_id().to_string(),
    )];
    meter
        .u64_observable_counter(name)
        .with_description(description)
        .with_callback(move |observer| {
            observer.observe(select(&session.statistics()), &attrs);
        })
        .build();
}

/// Expose the relay engine's per-rule counters as OTLP instruments,
/// attributed by source/destination/pattern. Rules added or removed at
/// runtime show up automatically: the callbacks walk the live rule table.
pub fn instrument_relay(engine: &Arc<RelayEngine>) {
    let meter = global::meter("switchyard");

    let per_rule: [(&'static str, &'static str, fn(&RuleStats) -> u64); 3] = [
        (
            "switchyard.relay.forwarded",
            "Messages forwarded to a destination broker",
            |r| r.forwarded,
        ),
        (
            "switchyard.relay.dropped",
            "Messages dropped by the filter chain or readiness gate",
            |r| r.dropped,
        ),
        (
            "switchyard.relay.errors",
            "Per-message forward failures",
            |r| r.errors,
        ),
    ];

    for (name, description, select) in per_rule {
        let engine = engine.clone();
        meter
            .u64_observable_counter(name)
            .with_description(description)
            .with_callback(move |observer| {
                for rule in engine.rule_stats() {
                    observer.observe(
                        select(&rule),
                        &[
                            KeyValue::new("source", rule.source.clone()),
                            KeyValue::new("destination", rule.destination.clone()),
                            KeyValue::new("pattern", rule.pattern.clone()),
                        ],
                    );
                }
            })
            .build();
    }
}
