use std::{env, time::Duration};

use anyhow::Result;
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::{
    metrics::MeterProvider as SdkMeterProvider,
    propagation::TraceContextPropagator,
    resource::Resource,
    runtime::Tokio,
    trace::{self, Sampler},
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const OTLP_ENDPOINT_VAR: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
const SAMPLING_RATE_VAR: &str = "STASH_OTEL_SAMPLING_RATE";
const METRIC_PERIOD_VAR: &str = "STASH_OTEL_METRIC_PERIOD_SECS";

pub const DEFAULT_METRIC_PERIOD: Duration = Duration::from_secs(30);

/// OTLP export settings. Without a collector endpoint the worker logs to the
/// console only and counters stay local.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySettings {
    pub export: bool,
    /// Share of traces kept; `0.0` turns trace export off but keeps metrics.
    pub sampling_rate: f64,
    pub metric_period: Duration,
}

impl TelemetrySettings {
    /// Reads the settings, returning a warning for every value that was
    /// unusable and replaced.
    pub fn from_lookup<F>(lookup: F) -> (Self, Vec<String>)
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut warnings = Vec::new();
        let value = |key: &str| {
            lookup(key)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };

        let export = value(OTLP_ENDPOINT_VAR).is_some();

        let sampling_rate = match value(SAMPLING_RATE_VAR).map(|raw| (raw.parse::<f64>(), raw)) {
            None => 1.0,
            Some((Ok(rate), _)) if (0.0..=1.0).contains(&rate) => rate,
            Some((Ok(rate), raw)) => {
                let clamped = rate.clamp(0.0, 1.0);
                warnings.push(format!(
                    "{SAMPLING_RATE_VAR}={raw} is not a ratio; using {clamped}"
                ));
                clamped
            }
            Some((Err(_), raw)) => {
                warnings.push(format!(
                    "{SAMPLING_RATE_VAR}='{raw}' is not a number; sampling every trace"
                ));
                1.0
            }
        };

        let metric_period = match value(METRIC_PERIOD_VAR).map(|raw| (raw.parse::<u64>(), raw)) {
            None => DEFAULT_METRIC_PERIOD,
            Some((Ok(secs), _)) if secs > 0 => Duration::from_secs(secs),
            Some((_, raw)) => {
                warnings.push(format!(
                    "{METRIC_PERIOD_VAR}='{raw}' must be a positive number of seconds; using {}",
                    DEFAULT_METRIC_PERIOD.as_secs()
                ));
                DEFAULT_METRIC_PERIOD
            }
        };

        (
            Self {
                export,
                sampling_rate,
                metric_period,
            },
            warnings,
        )
    }

    pub fn traces_enabled(&self) -> bool {
        self.export && self.sampling_rate > 0.0
    }
}

/// Flushes the OTLP exporters when dropped.
#[derive(Debug)]
pub struct TelemetryGuard {
    tracer_installed: bool,
    meter_provider: Option<SdkMeterProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.meter_provider.take() {
            if let Err(error) = provider.shutdown() {
                warn!(%error, "failed to flush metrics on shutdown");
            }
        }
        if self.tracer_installed {
            global::shutdown_tracer_provider();
        }
    }
}

pub fn init(service_name: &str) -> Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (settings, warnings) = TelemetrySettings::from_lookup(|key| env::var(key).ok());

    let mut failures = Vec::new();
    let tracer = if settings.traces_enabled() {
        build_tracer(service_name, settings.sampling_rate)
            .map_err(|error| failures.push(("traces", error)))
            .ok()
    } else {
        None
    };
    let meter_provider = if settings.export {
        build_meter_provider(service_name, settings.metric_period)
            .map_err(|error| failures.push(("metrics", error)))
            .ok()
    } else {
        None
    };
    let tracer_installed = tracer.is_some();

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(tracer.map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer)))
        .init();

    for message in warnings {
        warn!("{message}");
    }
    for (signal, error) in failures {
        warn!(signal, %error, "failed to initialize OTLP exporter; continuing without it");
    }

    info!(
        export = settings.export,
        sampling_rate = settings.sampling_rate,
        metric_period_secs = settings.metric_period.as_secs(),
        "telemetry configured"
    );

    Ok(TelemetryGuard {
        tracer_installed,
        meter_provider,
    })
}

fn resource(service_name: &str) -> Resource {
    Resource::new(vec![KeyValue::new("service.name", service_name.to_string())])
}

fn build_tracer(service_name: &str, sampling_rate: f64) -> Result<trace::Tracer> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(
            trace::Config::default()
                .with_sampler(Sampler::TraceIdRatioBased(sampling_rate))
                .with_resource(resource(service_name)),
        )
        .with_exporter(opentelemetry_otlp::new_exporter().tonic())
        .install_batch(Tokio)?;

    Ok(tracer)
}

/// Installs the global meter provider that `WorkerMetrics` records on.
fn build_meter_provider(service_name: &str, period: Duration) -> Result<SdkMeterProvider> {
    let provider = opentelemetry_otlp::new_pipeline()
        .metrics(Tokio)
        .with_exporter(opentelemetry_otlp::new_exporter().tonic())
        .with_resource(resource(service_name))
        .with_period(period)
        .build()?;

    global::set_meter_provider(provider.clone());
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn settings(vars: &[(&str, &str)]) -> (TelemetrySettings, Vec<String>) {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        TelemetrySettings::from_lookup(|key: &str| vars.get(key).cloned())
    }

    #[test]
    fn no_collector_means_console_only() {
        let (settings, warnings) = settings(&[(SAMPLING_RATE_VAR, "0.5")]);
        assert!(!settings.export);
        assert!(!settings.traces_enabled());
        assert_eq!(settings.sampling_rate, 0.5);
        assert_eq!(settings.metric_period, DEFAULT_METRIC_PERIOD);
        assert!(warnings.is_empty());
    }

    #[test]
    fn zero_sampling_keeps_metrics_export() {
        let (settings, _) = settings(&[
            (OTLP_ENDPOINT_VAR, "http://collector:4317"),
            (SAMPLING_RATE_VAR, "0"),
            (METRIC_PERIOD_VAR, "5"),
        ]);
        assert!(settings.export);
        assert!(!settings.traces_enabled());
        assert_eq!(settings.metric_period, Duration::from_secs(5));
    }

    #[test]
    fn unusable_values_fall_back_with_a_warning_each() {
        let (settings, warnings) = settings(&[
            (OTLP_ENDPOINT_VAR, "http://collector:4317"),
            (SAMPLING_RATE_VAR, "1.5"),
            (METRIC_PERIOD_VAR, "0"),
        ]);
        assert_eq!(settings.sampling_rate, 1.0);
        assert_eq!(settings.metric_period, DEFAULT_METRIC_PERIOD);
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("is not a ratio"), "{warnings:?}");
        assert!(warnings[1].contains(METRIC_PERIOD_VAR), "{warnings:?}");
    }

    #[test]
    fn blank_collector_endpoint_does_not_enable_export() {
        let (settings, warnings) = settings(&[
            (OTLP_ENDPOINT_VAR, "  "),
            (SAMPLING_RATE_VAR, "most"),
        ]);
        assert!(!settings.export);
        assert_eq!(settings.sampling_rate, 1.0);
        assert!(warnings[0].contains("'most' is not a number"));
    }
}
