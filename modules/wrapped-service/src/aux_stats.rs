//! Best-effort read-only clients for the auxiliary stats services.
//!
//! Neither service is load-bearing: every failure degrades to zero or empty
//! and is logged, never surfaced to the caller.

use serde_json::Value;

pub struct AuxClients {
    client: reqwest::Client,
    hackatime_base: String,
    ysws_base: Option<String>,
}

impl AuxClients {
    pub fn new(hackatime_base: String, ysws_base: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            hackatime_base,
            ysws_base,
        }
    }

    /// Hours tracked this year for a user, 0 on any failure.
    pub async fn tracked_hours(&self, user_id: &str) -> u64 {
        if self.hackatime_base.is_empty() {
            return 0;
        }
        let url = format!(
            "{}/api/v1/users/{}/stats?features=projects",
            self.hackatime_base, user_id
        );
        match self.fetch_json(&url).await {
            Some(body) => {
                let seconds = body
                    .pointer("/data/total_seconds")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0);
                (seconds / 3600.0).round() as u64
            }
            None => 0,
        }
    }

    /// Project submissions for a github handle: (count, de-duplicated names).
    pub async fn project_submissions(&self, github_handle: &str) -> (u64, Vec<String>) {
        let Some(base) = &self.ysws_base else {
            return (0, Vec::new());
        };
        let url = format!("{}/api/projects?github_username={}", base, github_handle);
        let Some(body) = self.fetch_json(&url).await else {
            return (0, Vec::new());
        };

        let total = body.get("total").and_then(Value::as_u64).unwrap_or(0);
        let mut names: Vec<String> = Vec::new();
        if let Some(projects) = body.get("projects").and_then(Value::as_array) {
            for project in projects {
                let raw = project
                    .get("ysws_name")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let name = clean_project_name(raw);
                if !name.is_empty() && !names.iter().any(|n| n == &name) {
                    names.push(name);
                }
            }
        }
        (total, names)
    }

    async fn fetch_json(&self, url: &str) -> Option<Value> {
        match self.client.get(url).send().await {
            Ok(resp) if resp.status().is_success() => resp.json().await.ok(),
            Ok(resp) => {
                log::warn!("[AUX_STATS] {} returned {}", url, resp.status());
                None
            }
            Err(e) => {
                log::warn!("[AUX_STATS] Request to {} failed: {}", url, e);
                None
            }
        }
    }
}

/// Submission names arrive wrapped in stray JSON quoting, e.g. `["Sprig"]`.
fn clean_project_name(raw: &str) -> String {
    raw.trim()
        .trim_start_matches("[\"")
        .trim_end_matches("\"]")
        .replace('"', "")
}
