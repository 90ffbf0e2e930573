use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use uuid::Uuid;

/// In-process request counters, keyed by method × normalized path × status,
/// rendered in Prometheus text format on `/metrics`.
pub struct Metrics {
    requests: Mutex<HashMap<(String, String, u16), Stat>>,
}

#[derive(Default, Clone, Copy)]
struct Stat {
    count: u64,
    total_seconds: f64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, method: &str, path: &str, status: u16, elapsed: Duration) {
        let key = (method.to_string(), normalize_path(path), status);
        let mut requests = self.requests.lock().unwrap();
        let stat = requests.entry(key).or_default();
        stat.count += 1;
        stat.total_seconds += elapsed.as_secs_f64();
    }

    /// Prometheus text exposition.
    pub fn render(&self) -> String {
        let requests = self.requests.lock().unwrap();
        let mut entries: Vec<_> = requests.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        let mut out = String::new();
        out.push_str("# TYPE tollgate_http_requests_total counter\n");
        for ((method, path, status), stat) in &entries {
            out.push_str(&format!(
                "tollgate_http_requests_total{{method=\"{method}\",path=\"{path}\",status=\"{status}\"}} {}\n",
                stat.count
            ));
        }
        out.push_str("# TYPE tollgate_http_request_duration_seconds summary\n");
        for ((method, path, status), stat) in &entries {
            out.push_str(&format!(
                "tollgate_http_request_duration_seconds_sum{{method=\"{method}\",path=\"{path}\",status=\"{status}\"}} {:.6}\n",
                stat.total_seconds
            ));
            out.push_str(&format!(
                "tollgate_http_request_duration_seconds_count{{method=\"{method}\",path=\"{path}\",status=\"{status}\"}} {}\n",
                stat.count
            ));
        }
        out
    }
}

/// Collapse identifier segments so every dialog/user lands in one series.
fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if segment.parse::<u64>().is_ok() || Uuid::parse_str(segment).is_ok() {
                "{id}"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_collapse_into_one_series() {
        assert_eq!(
            normalize_path("/api/v1/dialogs/0193a1c2-7b9e-4ad7-a2f1-111111111111/messages"),
            "/api/v1/dialogs/{id}/messages"
        );
        assert_eq!(
            normalize_path("/api/v1/admin/users/100001/tokens"),
            "/api/v1/admin/users/{id}/tokens"
        );
        assert_eq!(normalize_path("/api/v1/models"), "/api/v1/models");
    }

    #[test]
    fn render_includes_counts_and_latency() {
        let metrics = Metrics::new();
        metrics.record("GET", "/api/v1/models", 200, Duration::from_millis(12));
        metrics.record("GET", "/api/v1/models", 200, Duration::from_millis(8));
        metrics.record("POST", "/api/v1/dialogs/42/messages", 402, Duration::from_millis(3));

        let text = metrics.render();
        assert!(text.contains(
            "tollgate_http_requests_total{method=\"GET\",path=\"/api/v1/models\",status=\"200\"} 2"
        ));
        assert!(text.contains("path=\"/api/v1/dialogs/{id}/messages\",status=\"402\"} 1"));
        assert!(text.contains("tollgate_http_request_duration_seconds_count"));
    }
}
