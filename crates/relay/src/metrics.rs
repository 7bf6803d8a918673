use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
    time::Instant,
};

use notesync_common::protocol::CloseReason;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

pub struct RelayMetrics {
    started_at: Instant,
    active_connections: AtomicU64,
    total_connections: AtomicU64,
    auth_successes: AtomicU64,
    auth_failures: AtomicU64,
    backend_errors: AtomicU64,
    auth_failures_by_reason: Mutex<HashMap<&'static str, u64>>,
    connections_by_document: Mutex<HashMap<String, u64>>,
    frames_relayed_total: Mutex<HashMap<String, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
}

/// Point-in-time view served as JSON from `/metrics`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub active_connections: u64,
    pub total_connections: u64,
    pub auth_successes: u64,
    pub auth_failures: u64,
    pub backend_errors: u64,
    pub active_documents: usize,
    pub connections_by_document: BTreeMap<String, u64>,
    pub uptime_seconds: u64,
}

static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

impl Default for RelayMetrics {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            active_connections: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            auth_successes: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            backend_errors: AtomicU64::new(0),
            auth_failures_by_reason: Mutex::new(HashMap::new()),
            connections_by_document: Mutex::new(HashMap::new()),
            frames_relayed_total: Mutex::new(HashMap::new()),
            request_rate_total: Mutex::new(HashMap::new()),
            request_errors_total: Mutex::new(HashMap::new()),
        }
    }
}

/// Process-wide metrics, created on first use.
pub fn global_metrics() -> Arc<RelayMetrics> {
    GLOBAL_METRICS.get_or_init(|| Arc::new(RelayMetrics::default())).clone()
}

pub fn record_connection_opened(document: &str) {
    global_metrics().record_connection_opened(document);
}

pub fn record_connection_closed(document: &str) {
    global_metrics().record_connection_closed(document);
}

pub fn record_auth_success() {
    global_metrics().record_auth_success();
}

pub fn record_auth_failure(reason: CloseReason) {
    global_metrics().record_auth_failure(reason);
}

pub fn record_frame_relayed(kind: &str) {
    global_metrics().record_frame_relayed(kind);
}

impl RelayMetrics {
    pub fn record_connection_opened(&self, document: &str) {
        self.active_connections.fetch_add(1, Ordering::SeqCst);
        self.total_connections.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.connections_by_document.lock().expect("metrics map lock poisoned");
        let value = guard.entry(document.to_string()).or_insert(0);
        *value = value.saturating_add(1);
    }

    pub fn record_connection_closed(&self, document: &str) {
        let _ = self.active_connections.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
            Some(v.saturating_sub(1))
        });
        let mut guard = self.connections_by_document.lock().expect("metrics map lock poisoned");
        if let Some(value) = guard.get_mut(document) {
            *value = value.saturating_sub(1);
            if *value == 0 {
                guard.remove(document);
            }
        }
    }

    pub fn record_auth_success(&self) {
        self.auth_successes.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_auth_failure(&self, reason: CloseReason) {
        self.auth_failures.fetch_add(1, Ordering::SeqCst);
        if reason.is_backend_failure() {
            self.backend_errors.fetch_add(1, Ordering::SeqCst);
        }
        let mut guard = self.auth_failures_by_reason.lock().expect("metrics map lock poisoned");
        let value = guard.entry(reason.as_str()).or_insert(0);
        *value = value.saturating_add(1);
    }

    pub fn record_frame_relayed(&self, kind: &str) {
        increment_label_counter(&self.frames_relayed_total, &normalize_label(kind), 1);
    }

    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16) {
        let key = EndpointMetricKey {
            endpoint: normalize_endpoint(path),
            method: method.to_ascii_uppercase(),
        };

        increment_counter(&self.request_rate_total, &key, 1);
        if status_code >= 400 {
            increment_counter(&self.request_errors_total, &key, 1);
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let connections_by_document: BTreeMap<String, u64> = self
            .connections_by_document
            .lock()
            .expect("metrics map lock poisoned")
            .iter()
            .map(|(document, count)| (document.clone(), *count))
            .collect();

        MetricsSnapshot {
            active_connections: self.active_connections.load(Ordering::SeqCst),
            total_connections: self.total_connections.load(Ordering::SeqCst),
            auth_successes: self.auth_successes.load(Ordering::SeqCst),
            auth_failures: self.auth_failures.load(Ordering::SeqCst),
            backend_errors: self.backend_errors.load(Ordering::SeqCst),
            active_documents: connections_by_document.len(),
            connections_by_document,
            uptime_seconds: self.uptime_seconds(),
        }
    }

    pub fn render_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut output = String::new();

        for (name, help, kind, value) in [
            ("relay_active_connections", "Currently attached connections.", "gauge", snapshot.active_connections),
            ("relay_connections_total", "Connections accepted since start.", "counter", snapshot.total_connections),
            ("relay_auth_successes_total", "Successful access checks.", "counter", snapshot.auth_successes),
            ("relay_auth_failures_total", "Rejected or failed access checks.", "counter", snapshot.auth_failures),
            ("relay_backend_errors_total", "Access checks that failed on the notes store.", "counter", snapshot.backend_errors),
            ("relay_active_documents", "Documents with at least one connection.", "gauge", snapshot.active_documents as u64),
            ("relay_uptime_seconds", "Seconds since the relay started.", "gauge", snapshot.uptime_seconds),
        ] {
            output.push_str(&format!("# HELP {name} {help}\n"));
            output.push_str(&format!("# TYPE {name} {kind}\n"));
            output.push_str(&format!("{name} {value}\n"));
        }

        output.push_str(
            "# HELP relay_document_connections Attached connections per document.\n",
        );
        output.push_str("# TYPE relay_document_connections gauge\n");
        for (document, count) in &snapshot.connections_by_document {
            output.push_str(&format!(
                "relay_document_connections{{document=\"{}\"}} {count}\n",
                escape_label_value(document),
            ));
        }

        output.push_str(
            "# HELP relay_auth_failures_by_reason_total Access check failures by close reason.\n",
        );
        output.push_str("# TYPE relay_auth_failures_by_reason_total counter\n");
        {
            let guard = self.auth_failures_by_reason.lock().expect("metrics map lock poisoned");
            let mut entries: Vec<_> = guard.iter().collect();
            entries.sort_by(|(left, _), (right, _)| left.cmp(right));
            for (reason, value) in entries {
                output.push_str(&format!(
                    "relay_auth_failures_by_reason_total{{reason=\"{reason}\"}} {value}\n"
                ));
            }
        }

        output.push_str("# HELP relay_frames_relayed_total Frames forwarded to peers by kind.\n");
        output.push_str("# TYPE relay_frames_relayed_total counter\n");
        append_label_counter_lines(&mut output, "relay_frames_relayed_total", "kind", &self.frames_relayed_total);

        output.push_str("# HELP relay_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE relay_request_rate_total counter\n");
        append_counter_lines(&mut output, "relay_request_rate_total", &self.request_rate_total);

        output.push_str(
            "# HELP relay_request_errors_total Total HTTP error responses by endpoint.\n",
        );
        output.push_str("# TYPE relay_request_errors_total counter\n");
        append_counter_lines(&mut output, "relay_request_errors_total", &self.request_errors_total);

        output
    }
}

fn normalize_endpoint(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let mut normalized_segments = Vec::new();
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        if segment.starts_with(notesync_common::document::DOCUMENT_PREFIX) {
            normalized_segments.push("{document}".to_string());
            continue;
        }
        if uuid::Uuid::parse_str(segment).is_ok() {
            normalized_segments.push("{uuid}".to_string());
            continue;
        }
        normalized_segments.push(segment.to_string());
    }

    if normalized_segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", normalized_segments.join("/"))
    }
}

fn normalize_label(label: &str) -> String {
    let normalized = label.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_key, _), (right_key, _)| {
        left_key
            .method
            .cmp(&right_key.method)
            .then_with(|| left_key.endpoint.cmp(&right_key.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn append_label_counter_lines(
    output: &mut String,
    metric_name: &str,
    label_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{{label_name}=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use notesync_common::protocol::CloseReason;

    use super::{escape_label_value, RelayMetrics};

    #[test]
    fn connection_counters_track_documents() {
        let metrics = RelayMetrics::default();
        metrics.record_connection_opened("note-a");
        metrics.record_connection_opened("note-a");
        metrics.record_connection_opened("note-b");
        metrics.record_connection_closed("note-b");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_connections, 2);
        assert_eq!(snapshot.total_connections, 3);
        assert_eq!(snapshot.active_documents, 1);
        assert_eq!(snapshot.connections_by_document.get("note-a"), Some(&2));
        assert!(!snapshot.connections_by_document.contains_key("note-b"));
    }

    #[test]
    fn closing_unknown_document_does_not_underflow() {
        let metrics = RelayMetrics::default();
        metrics.record_connection_closed("note-missing");
        assert_eq!(metrics.snapshot().active_connections, 0);
    }

    #[test]
    fn backend_failures_count_as_backend_errors() {
        let metrics = RelayMetrics::default();
        metrics.record_auth_success();
        metrics.record_auth_failure(CloseReason::Unauthorized);
        metrics.record_auth_failure(CloseReason::BackendTimeout);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.auth_successes, 1);
        assert_eq!(snapshot.auth_failures, 2);
        assert_eq!(snapshot.backend_errors, 1);
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let metrics = RelayMetrics::default();
        metrics.record_connection_opened("note-a");
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["activeConnections"], 1);
        assert_eq!(json["connectionsByDocument"]["note-a"], 1);
        assert!(json.get("uptimeSeconds").is_some());
    }

    #[test]
    fn render_prometheus_includes_connection_and_auth_metrics() {
        let metrics = RelayMetrics::default();
        metrics.record_connection_opened("note-a");
        metrics.record_auth_success();
        metrics.record_auth_failure(CloseReason::InvalidTokenFormat);
        metrics.record_frame_relayed("update");
        metrics.record_frame_relayed("update");
        metrics.record_frame_relayed("awareness");
        metrics.record_http_request("get", "/metrics", 200);
        metrics.record_http_request("GET", "/nope", 404);

        let rendered = metrics.render_prometheus();

        assert!(rendered.contains("relay_active_connections 1"));
        assert!(rendered.contains("relay_connections_total 1"));
        assert!(rendered.contains("relay_auth_successes_total 1"));
        assert!(rendered.contains("relay_auth_failures_total 1"));
        assert!(rendered.contains("relay_document_connections{document=\"note-a\"} 1"));
        assert!(rendered
            .contains("relay_auth_failures_by_reason_total{reason=\"INVALID_TOKEN_FORMAT\"} 1"));
        assert!(rendered.contains("relay_frames_relayed_total{kind=\"update\"} 2"));
        assert!(rendered.contains("relay_frames_relayed_total{kind=\"awareness\"} 1"));
        assert!(rendered.contains("relay_request_rate_total{method=\"GET\",endpoint=\"/metrics\"} 1"));
        assert!(rendered.contains("relay_request_errors_total{method=\"GET\",endpoint=\"/nope\"} 1"));
    }

    #[test]
    fn label_values_are_escaped() {
        assert_eq!(escape_label_value("a\"b\\c\nd"), "a\\\"b\\\\c\\nd");
    }
}
