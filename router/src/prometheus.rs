use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};

pub(crate) fn prometheus_builder(
    addr: SocketAddr,
    n_pf_cands: usize,
) -> Result<PrometheusBuilder, BuildError> {
    // Duration buckets
    let duration_matcher = Matcher::Suffix(String::from("duration"));
    let n_duration_buckets = 35;
    let mut duration_buckets = Vec::with_capacity(n_duration_buckets);
    // Minimum duration in seconds
    let mut value = 0.00001;
    for _ in 0..n_duration_buckets {
        // geometric sequence
        value *= 1.5;
        duration_buckets.push(value);
    }

    // Candidates per event, the last bucket catches overflowing events
    let candidates_matcher = Matcher::Full(String::from("abc_event_candidates"));
    let mut candidates_buckets: Vec<f64> = (0..20)
        .map(|x| 2.0_f64.powi(x))
        .filter(|x| (*x as usize) < n_pf_cands)
        .collect();
    candidates_buckets.push(n_pf_cands as f64);

    // Prometheus handler
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(duration_matcher, &duration_buckets)?
        .set_buckets_for_metric(candidates_matcher, &candidates_buckets)
}
