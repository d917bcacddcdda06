//! Object key layout.

use chrono::{DateTime, Utc};

pub fn status(request_id: &str) -> String {
    format!("status/{request_id}-status.json")
}

pub fn request(request_id: &str) -> String {
    format!("requests/{request_id}.json")
}

/// The orchestrator's own configuration, secrets redacted.
pub fn orchestrator_config(request_id: &str) -> String {
    format!("config/{request_id}-config-bluesky-aws.json")
}

pub fn bluesky_config(request_id: &str) -> String {
    format!("config/{request_id}-config-bluesky.json")
}

pub fn request_index(date: DateTime<Utc>, request_id: &str) -> String {
    format!("request-index/{}/{request_id}", date.format("%Y%m%d"))
}

pub fn run_input(request_id: &str, run_id: &str) -> String {
    format!("input/{request_id}/{run_id}-input.json")
}

pub fn run_log(request_id: &str, run_id: &str) -> String {
    format!("log/{request_id}/{run_id}.log")
}

pub fn run_output(output_path: &str, request_id: &str, run_id: &str) -> String {
    format!(
        "{}/{request_id}/{run_id}.tar.gz",
        output_path.trim_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_layout() {
        assert_eq!(status("r1"), "status/r1-status.json");
        assert_eq!(run_log("r1", "f1"), "log/r1/f1.log");
        assert_eq!(run_input("r1", "f1"), "input/r1/f1-input.json");
        assert_eq!(run_output("/output/", "r1", "f1"), "output/r1/f1.tar.gz");
        let date = Utc.with_ymd_and_hms(2024, 2, 3, 4, 5, 6).unwrap();
        assert_eq!(request_index(date, "r1"), "request-index/20240203/r1");
    }
}
