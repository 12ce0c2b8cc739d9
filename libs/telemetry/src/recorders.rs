use metrics::Label;
use tracing::Span;

/// Span shared by relay stages; `token` is the visitor correlation token.
pub fn relay_span(stage: &'static str, token: &str) -> Span {
    tracing::info_span!("relay", stage, token = %token)
}

pub fn record_counter(name: &'static str, labels: &[(&'static str, &str)]) {
    let labels: Vec<Label> = labels
        .iter()
        .map(|(key, value)| Label::new(*key, value.to_string()))
        .collect();
    metrics::counter!(name, labels).increment(1);
}

pub fn record_gauge(name: &'static str, value: f64) {
    metrics::gauge!(name).set(value);
}
