//! HTTP client for the beads daemon.
//!
//! The daemon speaks JSON over HTTP on a small set of RPC-style
//! endpoints under `/bd.v1.BeadsService/`. All calls carry an optional
//! bearer token and a 10 second timeout.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::error::{BeadsError, Result};
use crate::types::{AgentBead, Issue, RigRecord};

/// Trait for control-plane communication.
///
/// This abstracts the daemon client so reconciler and reporter logic
/// can be tested against a mock control plane.
#[async_trait]
pub trait BeadsApi: Send + Sync {
    /// List the desired agent beads targeted at this backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon is unreachable or answers with a
    /// non-success status.
    async fn list_agents(&self) -> Result<Vec<AgentBead>>;

    /// List the known rigs.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon is unreachable or answers with a
    /// non-success status.
    async fn list_rigs(&self) -> Result<Vec<RigRecord>>;

    /// Replace the notes of a bead.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon is unreachable or answers with a
    /// non-success status.
    async fn update_notes(&self, id: &str, notes: &str) -> Result<()>;

    /// File a bug bead describing a failed pod.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon is unreachable or answers with a
    /// non-success status.
    async fn create_bug(&self, title: &str, description: &str) -> Result<()>;
}

/// JSON-over-HTTP client for the beads daemon.
#[derive(Debug, Clone)]
pub struct BeadsClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    town: String,
}

impl BeadsClient {
    /// Create a new client for the daemon at `base_url`.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be created (should never
    /// happen with default TLS).
    #[must_use]
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        town: impl Into<String>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to create HTTP client");

        Self {
            http,
            base_url: base_url.into(),
            token,
            town: town.into(),
        }
    }

    /// The daemon base URL this client talks to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post(&self, method: &str, body: &serde_json::Value) -> Result<reqwest::Response> {
        let url = format!("{}/bd.v1.BeadsService/{method}", self.base_url);
        let mut req = self.http.post(&url).json(body);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let response = req.send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let message = response.text().await.unwrap_or_default();
            Err(BeadsError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }

    async fn list(&self, body: &serde_json::Value) -> Result<Vec<Issue>> {
        let response = self.post("List", body).await?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl BeadsApi for BeadsClient {
    async fn list_agents(&self) -> Result<Vec<AgentBead>> {
        let issues = self
            .list(&json!({
                "exclude_status": ["closed"],
                "labels": ["gt:agent", "execution_target:k8s"],
            }))
            .await?;

        Ok(issues
            .iter()
            .filter_map(|issue| AgentBead::from_issue(issue, &self.town))
            .collect())
    }

    async fn list_rigs(&self) -> Result<Vec<RigRecord>> {
        let issues = self
            .list(&json!({
                "exclude_status": ["closed"],
                "issue_type": "rig",
            }))
            .await?;

        Ok(issues.iter().map(RigRecord::from_issue).collect())
    }

    async fn update_notes(&self, id: &str, notes: &str) -> Result<()> {
        self.post("Update", &json!({ "id": id, "notes": notes }))
            .await?;
        tracing::debug!(bead = %id, "updated bead notes");
        Ok(())
    }

    async fn create_bug(&self, title: &str, description: &str) -> Result<()> {
        self.post(
            "Create",
            &json!({
                "issue_type": "bug",
                "title": title,
                "description": description,
                "labels": ["gt:bug"],
            }),
        )
        .await?;
        tracing::info!(title, "filed bug bead");
        Ok(())
    }
}

/// A mock control plane for testing without a running daemon.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::{AgentBead, BeadsApi, BeadsError, Result, RigRecord};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// An in-memory [`BeadsApi`] implementation that records writes
    /// and can simulate control-plane outages.
    #[derive(Default)]
    pub struct MockBeads {
        agents: Mutex<Vec<AgentBead>>,
        rigs: Mutex<Vec<RigRecord>>,
        notes: Mutex<Vec<(String, String)>>,
        bugs: Mutex<Vec<(String, String)>>,
        fail_lists: Mutex<bool>,
    }

    impl MockBeads {
        /// Create an empty mock control plane.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Replace the desired agent set.
        pub fn set_agents(&self, agents: Vec<AgentBead>) {
            *self.agents.lock() = agents;
        }

        /// Replace the rig list.
        pub fn set_rigs(&self, rigs: Vec<RigRecord>) {
            *self.rigs.lock() = rigs;
        }

        /// Make subsequent list calls fail, simulating an outage.
        pub fn set_fail_lists(&self, fail: bool) {
            *self.fail_lists.lock() = fail;
        }

        /// All `update_notes` calls made so far, in order.
        #[must_use]
        pub fn notes_log(&self) -> Vec<(String, String)> {
            self.notes.lock().clone()
        }

        /// All bug beads filed so far.
        #[must_use]
        pub fn bugs_filed(&self) -> Vec<(String, String)> {
            self.bugs.lock().clone()
        }
    }

    #[async_trait]
    impl BeadsApi for MockBeads {
        async fn list_agents(&self) -> Result<Vec<AgentBead>> {
            if *self.fail_lists.lock() {
                return Err(BeadsError::Api {
                    status: 503,
                    message: "simulated outage".to_string(),
                });
            }
            Ok(self.agents.lock().clone())
        }

        async fn list_rigs(&self) -> Result<Vec<RigRecord>> {
            if *self.fail_lists.lock() {
                return Err(BeadsError::Api {
                    status: 503,
                    message: "simulated outage".to_string(),
                });
            }
            Ok(self.rigs.lock().clone())
        }

        async fn update_notes(&self, id: &str, notes: &str) -> Result<()> {
            self.notes.lock().push((id.to_string(), notes.to_string()));
            Ok(())
        }

        async fn create_bug(&self, title: &str, description: &str) -> Result<()> {
            self.bugs
                .lock()
                .push((title.to_string(), description.to_string()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn list_agents_filters_and_parses() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bd.v1.BeadsService/List"))
            .and(body_partial_json(json!({
                "labels": ["gt:agent", "execution_target:k8s"],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {
                    "id": "gastown-polecat-furiosa",
                    "title": "war rig",
                    "status": "open",
                    "labels": ["gt:agent", "execution_target:k8s"],
                    "notes": "daemon_host: bd.example\n",
                },
                {
                    "id": "gastown-polecat-local",
                    "title": "local only",
                    "status": "open",
                    "labels": ["gt:agent"],
                    "notes": "",
                },
            ])))
            .mount(&server)
            .await;

        let client = BeadsClient::new(server.uri(), None, "gastown");
        let agents = client.list_agents().await.unwrap();

        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].id, "gastown-polecat-furiosa");
        assert_eq!(
            agents[0].meta.get("daemon_host").map(String::as_str),
            Some("bd.example")
        );
    }

    #[tokio::test]
    async fn list_rigs_builds_records() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bd.v1.BeadsService/List"))
            .and(body_partial_json(json!({ "issue_type": "rig" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {
                    "id": "rig-gastown",
                    "title": "gastown",
                    "status": "open",
                    "labels": ["git_url:https://example.com/g.git"],
                    "notes": "",
                },
            ])))
            .mount(&server)
            .await;

        let client = BeadsClient::new(server.uri(), None, "gastown");
        let rigs = client.list_rigs().await.unwrap();

        assert_eq!(rigs.len(), 1);
        assert_eq!(rigs[0].name, "gastown");
        assert_eq!(rigs[0].git_url.as_deref(), Some("https://example.com/g.git"));
    }

    #[tokio::test]
    async fn update_notes_posts_id_and_notes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bd.v1.BeadsService/Update"))
            .and(body_partial_json(json!({
                "id": "hq-mayor",
                "notes": "state: working\n",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let client = BeadsClient::new(server.uri(), None, "gastown");
        client.update_notes("hq-mayor", "state: working\n").await.unwrap();
    }

    #[tokio::test]
    async fn bearer_token_is_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bd.v1.BeadsService/List"))
            .and(header("authorization", "Bearer sekrit"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let client = BeadsClient::new(server.uri(), Some("sekrit".to_string()), "gastown");
        client.list_agents().await.unwrap();
    }

    #[tokio::test]
    async fn non_success_status_is_an_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bd.v1.BeadsService/List"))
            .respond_with(ResponseTemplate::new(503).set_body_string("daemon melting"))
            .mount(&server)
            .await;

        let client = BeadsClient::new(server.uri(), None, "gastown");
        let err = client.list_agents().await.unwrap_err();
        match err {
            BeadsError::Api { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "daemon melting");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_bug_posts_issue() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bd.v1.BeadsService/Create"))
            .and(body_partial_json(json!({ "issue_type": "bug" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let client = BeadsClient::new(server.uri(), None, "gastown");
        client
            .create_bug("pod failed", "gt-a-crew-b failed in ns gastown")
            .await
            .unwrap();
    }
}
