//! Tracing bootstrap: console logs always, OTLP export when sampling is on.

use std::env;

use anyhow::Result;
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    runtime::Tokio,
    trace::{self, Sampler},
    Resource,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Flushes the OTLP pipeline on drop when one was installed.
#[derive(Debug)]
pub struct TelemetryGuard {
    tracer_installed: bool,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if self.tracer_installed {
            global::shutdown_tracer_provider();
        }
    }
}

pub fn init(service_name: &str) -> Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (sampling_rate, sampling_warning) =
        parse_sampling_rate(env::var("SPOOL_OTEL_SAMPLING_RATE").ok().as_deref());

    let mut tracer_installed = false;
    match build_tracer(service_name, sampling_rate) {
        Ok(Some(tracer)) => {
            tracing_subscriber::registry()
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            tracer_installed = true;
        }
        Ok(None) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
        Err(error) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            warn!(%error, "OTLP exporter unavailable; console logs only");
        }
    }

    if let Some(message) = sampling_warning {
        warn!("{message}");
    }
    info!(sampling_rate, "telemetry configured");

    Ok(TelemetryGuard { tracer_installed })
}

fn build_tracer(service_name: &str, sampling_rate: f64) -> Result<Option<trace::Tracer>> {
    if sampling_rate <= 0.0 {
        return Ok(None);
    }

    global::set_text_map_propagator(TraceContextPropagator::new());

    let exporter = opentelemetry_otlp::new_exporter().tonic();
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(
            trace::Config::default()
                .with_sampler(Sampler::TraceIdRatioBased(sampling_rate))
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    service_name.to_string(),
                )])),
        )
        .with_exporter(exporter)
        .install_batch(Tokio)?;

    Ok(Some(tracer))
}

/// Parses `SPOOL_OTEL_SAMPLING_RATE`, clamping to `0.0..=1.0` and defaulting
/// to 1.0. The second element carries a human-readable warning when the raw
/// value was unusable.
pub fn parse_sampling_rate(raw: Option<&str>) -> (f64, Option<String>) {
    let Some(value) = raw else {
        return (1.0, None);
    };

    let trimmed = value.trim();
    if trimmed.is_empty() {
        return (
            1.0,
            Some("SPOOL_OTEL_SAMPLING_RATE is empty; defaulting to 1.0".to_string()),
        );
    }

    match trimmed.parse::<f64>() {
        Ok(parsed) if (0.0..=1.0).contains(&parsed) => (parsed, None),
        Ok(parsed) => {
            let clamped = parsed.clamp(0.0, 1.0);
            (
                clamped,
                Some(format!(
                    "SPOOL_OTEL_SAMPLING_RATE={trimmed} outside 0.0..=1.0; clamped to {clamped}"
                )),
            )
        }
        Err(_) => (
            1.0,
            Some(format!(
                "SPOOL_OTEL_SAMPLING_RATE='{trimmed}' is not a valid float; defaulting to 1.0"
            )),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::parse_sampling_rate;

    #[test]
    fn valid_rates_pass_through() {
        assert_eq!(parse_sampling_rate(Some("0.25")), (0.25, None));
        assert_eq!(parse_sampling_rate(Some("0")), (0.0, None));
        assert_eq!(parse_sampling_rate(None), (1.0, None));
    }

    #[test]
    fn out_of_bounds_rates_clamp_with_a_warning() {
        let (rate, warning) = parse_sampling_rate(Some("2.5"));
        assert_eq!(rate, 1.0);
        assert!(warning.unwrap().contains("outside 0.0..=1.0"));
    }

    #[test]
    fn garbage_rates_default_with_a_warning() {
        let (rate, warning) = parse_sampling_rate(Some("lots"));
        assert_eq!(rate, 1.0);
        assert!(warning.unwrap().contains("not a valid float"));

        let (rate, warning) = parse_sampling_rate(Some("  "));
        assert_eq!(rate, 1.0);
        assert!(warning.unwrap().contains("is empty"));
    }
}
