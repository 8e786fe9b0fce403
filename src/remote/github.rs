//! Station document stored as a file in a GitHub repository, via the contents API.
//!
//! A write is a conditional read-modify-write: GET the file (content + blob sha),
//! merge, then PUT with the sha. If someone else wrote in between GitHub answers
//! 409 (or 422 when the file did not exist at read time) and the caller retries from
//! a fresh read. Writes from this process are serialized, so only other writers can
//! cause that conflict.

use super::{
    CommitOutcome, Heartbeat, RemoteError, RemoteStore, StationDocument, StationIdentity,
};
use crate::error::{AppResult, BhangError};
use crate::event::EventRecord;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;

/// Where the station document lives.
#[derive(Clone)]
pub struct GitHubTarget {
    /// API root, normally `https://api.github.com`.
    pub api_base: String,
    /// Repository owner.
    pub owner: String,
    /// Repository name.
    pub repo: String,
    /// Path of the document inside the repository.
    pub path: String,
    /// Branch to commit to.
    pub branch: String,
    /// Pre-provisioned access token.
    pub token: String,
}

impl fmt::Debug for GitHubTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitHubTarget")
            .field("api_base", &self.api_base)
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .field("path", &self.path)
            .field("branch", &self.branch)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl GitHubTarget {
    fn contents_url(&self) -> String {
        format!(
            "{}/repos/{}/{}/contents/{}",
            self.api_base.trim_end_matches('/'),
            self.owner,
            self.repo,
            self.path
        )
    }
}

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    sha: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct PutRequest<'a> {
    message: String,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
}

/// Which contents API call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// GET of the document.
    Read,
    /// PUT replacing an existing blob (sha supplied).
    Update,
    /// PUT creating the file (no sha).
    Create,
}

/// [`super::RemoteStore`] backed by the GitHub contents API.
#[derive(Debug)]
pub struct GitHubContentStore {
    client: Client,
    target: GitHubTarget,
    identity: StationIdentity,
    // Held across each read-modify-write so commits and heartbeats do not race.
    write_lock: Mutex<()>,
}

impl GitHubContentStore {
    /// Build the HTTP client. `timeout` bounds every request.
    pub fn new(target: GitHubTarget, identity: StationIdentity, timeout: Duration) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("BhangmeterV2.{}", identity.name))
            .build()
            .map_err(|e| BhangError::Configuration(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            target,
            identity,
            write_lock: Mutex::new(()),
        })
    }

    /// Current document and its blob sha; a missing file is an empty document.
    async fn fetch(&self) -> Result<(Option<String>, StationDocument), RemoteError> {
        let response = self
            .client
            .get(self.target.contents_url())
            .query(&[("ref", self.target.branch.as_str())])
            .bearer_auth(&self.target.token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            tracing::info!(path = %self.target.path, "Station document missing, will create");
            return Ok((None, StationDocument::default()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body, RequestKind::Read));
        }

        let contents: ContentsResponse = response.json().await.map_err(transport_error)?;
        let document = decode_document(&contents.content)?;
        Ok((Some(contents.sha), document))
    }

    async fn store(
        &self,
        sha: Option<&str>,
        document: &StationDocument,
        what: &str,
    ) -> Result<(), RemoteError> {
        let json = serde_json::to_vec(document).map_err(|e| RemoteError::Rejected {
            status: 0,
            message: format!("cannot encode document: {e}"),
        })?;
        let body = PutRequest {
            message: StationDocument::commit_message(&self.identity.name, what),
            content: STANDARD.encode(json),
            branch: &self.target.branch,
            sha,
        };

        let response = self
            .client
            .put(self.target.contents_url())
            .bearer_auth(&self.target.token)
            .header("Accept", "application/vnd.github+json")
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        let kind = if sha.is_some() {
            RequestKind::Update
        } else {
            RequestKind::Create
        };
        Err(classify_status(status.as_u16(), &text, kind))
    }
}

#[async_trait]
impl RemoteStore for GitHubContentStore {
    async fn commit(&self, record: &EventRecord) -> Result<CommitOutcome, RemoteError> {
        let _guard = self.write_lock.lock().await;
        let (sha, mut document) = self.fetch().await?;
        if !document.append_event(record) {
            tracing::info!(event_id = %record.event_id, "Event already in remote document");
            return Ok(CommitOutcome::AlreadyPresent);
        }
        self.store(sha.as_deref(), &document, &format!("event {}", record.event_id))
            .await?;
        Ok(CommitOutcome::Created)
    }

    async fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<(), RemoteError> {
        let _guard = self.write_lock.lock().await;
        let (sha, mut document) = self.fetch().await?;
        document.apply_heartbeat(heartbeat, &self.identity);
        let what = format!("heartbeat at {}", heartbeat.at.format("%Y-%m-%d %H:%M:%S"));
        self.store(sha.as_deref(), &document, &what).await
    }
}

/// Map an HTTP failure status to retryable or rejected.
///
/// On a PUT, 404 means the repository or token scope is wrong; on a GET it just
/// means the document does not exist yet. A 422 on a create means the file
/// appeared after it was read, which a fresh read resolves.
pub fn classify_status(status: u16, body: &str, kind: RequestKind) -> RemoteError {
    let message = summarize_body(status, body);
    match (status, kind) {
        (409 | 429, _) => RemoteError::Retryable(message),
        (500..=599, _) => RemoteError::Retryable(message),
        (404, RequestKind::Read) => RemoteError::Retryable(message),
        (422, RequestKind::Create) => RemoteError::Retryable(message),
        (400..=499, _) => RemoteError::Rejected { status, message },
        _ => RemoteError::Retryable(message),
    }
}

fn summarize_body(status: u16, body: &str) -> String {
    #[derive(Deserialize)]
    struct ApiMessage {
        message: String,
    }
    match serde_json::from_str::<ApiMessage>(body) {
        Ok(api) => format!("HTTP {status}: {}", api.message),
        Err(_) if body.is_empty() => format!("HTTP {status}"),
        Err(_) => format!("HTTP {status}: {}", body.chars().take(200).collect::<String>()),
    }
}

fn transport_error(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Unreachable("request timed out".to_string())
    } else {
        RemoteError::Unreachable(format!("transport: {e}"))
    }
}

/// GitHub wraps base64 content at 60 columns.
fn decode_document(content: &str) -> Result<StationDocument, RemoteError> {
    let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = STANDARD.decode(compact).map_err(|e| RemoteError::Rejected {
        status: 0,
        message: format!("undecodable remote document: {e}"),
    })?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(StationDocument::default());
    }
    serde_json::from_slice(&bytes).map_err(|e| RemoteError::Rejected {
        status: 0,
        message: format!("undecodable remote document: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    /// One-file stand-in for the contents API: sha-checked PUTs and slow GETs.
    #[derive(Default)]
    struct FakeRepo {
        sha: Option<String>,
        content: String,
        revision: u32,
        read_delay: Duration,
    }

    type SharedRepo = Arc<parking_lot::Mutex<FakeRepo>>;

    async fn serve(repo: SharedRepo) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(handle_connection(stream, repo.clone()));
            }
        });
        format!("http://{addr}")
    }

    async fn handle_connection(stream: TcpStream, repo: SharedRepo) {
        let mut reader = BufReader::new(stream);
        loop {
            let mut request_line = String::new();
            if reader.read_line(&mut request_line).await.unwrap_or(0) == 0 {
                return;
            }
            let mut content_length = 0;
            loop {
                let mut header = String::new();
                reader.read_line(&mut header).await.unwrap();
                let header = header.trim_end();
                if header.is_empty() {
                    break;
                }
                if let Some((name, value)) = header.split_once(':') {
                    if name.eq_ignore_ascii_case("content-length") {
                        content_length = value.trim().parse().unwrap();
                    }
                }
            }
            let mut body = vec![0; content_length];
            reader.read_exact(&mut body).await.unwrap();

            let (status, reply) = if request_line.starts_with("GET") {
                let delay = repo.lock().read_delay;
                tokio::time::sleep(delay).await;
                let state = repo.lock();
                let reply = match &state.sha {
                    Some(sha) => (200, json!({ "sha": sha, "content": state.content })),
                    None => (404, json!({ "message": "Not Found" })),
                };
                reply
            } else {
                let put: serde_json::Value = serde_json::from_slice(&body).unwrap();
                let supplied = put["sha"].as_str();
                let mut state = repo.lock();
                if state.sha.is_some() && supplied.is_none() {
                    (422, json!({ "message": "Invalid request.\n\n\"sha\" wasn't supplied." }))
                } else if state.sha.as_deref() != supplied {
                    (409, json!({ "message": "conflict" }))
                } else {
                    state.revision += 1;
                    state.sha = Some(format!("blob{}", state.revision));
                    state.content = put["content"].as_str().unwrap_or_default().to_string();
                    (201, json!({ "content": { "sha": state.sha } }))
                }
            };

            let payload = reply.to_string();
            let response = format!(
                "HTTP/1.1 {status} OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{payload}",
                payload.len()
            );
            reader.get_mut().write_all(response.as_bytes()).await.unwrap();
        }
    }

    fn record() -> EventRecord {
        EventRecord {
            event_id: "kx1-ned-00000001-000003e8".into(),
            kind: EventKind::Ned,
            sequence: 1,
            detected_at: "2024-05-06T07:08:09.000Z".into(),
        }
    }

    fn identity() -> StationIdentity {
        StationIdentity {
            name: "kx1".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn commit_and_heartbeat_on_new_document_both_land() {
        let repo = SharedRepo::new(parking_lot::Mutex::new(FakeRepo {
            read_delay: Duration::from_millis(50),
            ..Default::default()
        }));
        let api_base = serve(repo.clone()).await;
        let store = GitHubContentStore::new(target(&api_base), identity(), Duration::from_secs(5)).unwrap();
        let heartbeat = Heartbeat {
            at: Utc::now(),
            ned_seen: true,
        };

        let record = record();
        let (committed, beat) = tokio::join!(store.commit(&record), store.heartbeat(&heartbeat));
        assert_eq!(committed.unwrap(), CommitOutcome::Created);
        beat.unwrap();

        let (sha, document) = store.fetch().await.unwrap();
        assert_eq!(sha.as_deref(), Some("blob2"));
        assert_eq!(document.events.len(), 1);
        assert_eq!(document.total_minutes_monitored, 1);
        assert_eq!(document.station.as_deref(), Some("kx1"));
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let store =
            GitHubContentStore::new(target(&format!("http://{addr}")), identity(), Duration::from_secs(2)).unwrap();
        let err = store.commit(&record()).await.unwrap_err();
        assert!(matches!(err, RemoteError::Unreachable(_)), "{err:?}");
    }

    fn rejected(err: &RemoteError) -> bool {
        matches!(err, RemoteError::Rejected { .. })
    }

    #[test]
    fn status_mapping() {
        use RequestKind::*;
        assert!(rejected(&classify_status(401, "", Update)));
        assert!(rejected(&classify_status(403, "", Read)));
        assert!(rejected(&classify_status(404, "", Update)));
        assert!(rejected(&classify_status(404, "", Create)));
        assert!(rejected(&classify_status(422, "", Update)));
        assert!(!rejected(&classify_status(404, "", Read)));
        assert!(!rejected(&classify_status(409, "", Update)));
        assert!(!rejected(&classify_status(429, "", Create)));
        assert!(!rejected(&classify_status(502, "", Update)));
    }

    #[test]
    fn create_losing_a_race_is_retryable() {
        let body = r#"{"message":"Invalid request.\n\n\"sha\" wasn't supplied."}"#;
        assert!(matches!(
            classify_status(422, body, RequestKind::Create),
            RemoteError::Retryable(_)
        ));
    }

    #[test]
    fn api_message_is_extracted() {
        let err = classify_status(401, r#"{"message":"Bad credentials"}"#, RequestKind::Update);
        assert_eq!(
            err,
            RemoteError::Rejected {
                status: 401,
                message: "HTTP 401: Bad credentials".into()
            }
        );
    }

    #[test]
    fn wrapped_base64_decodes() {
        let json = br#"{"station":"kx1","total minutes monitored":3}"#;
        let encoded = STANDARD.encode(json);
        let (a, b) = encoded.split_at(20);
        let doc = decode_document(&format!("{a}\n{b}\n")).unwrap();
        assert_eq!(doc.total_minutes_monitored, 3);
        assert_eq!(doc.station.as_deref(), Some("kx1"));
    }

    #[test]
    fn garbage_document_is_rejected() {
        let encoded = STANDARD.encode(b"not json");
        assert!(rejected(&decode_document(&encoded).unwrap_err()));
    }

    fn target(api_base: &str) -> GitHubTarget {
        GitHubTarget {
            api_base: api_base.into(),
            owner: "o".into(),
            repo: "r".into(),
            path: "station.json".into(),
            branch: "main".into(),
            token: "ghp_secret".into(),
        }
    }

    #[test]
    fn token_is_not_debug_printed() {
        let target = target("https://api.github.com");
        assert!(!format!("{target:?}").contains("ghp_secret"));
        assert_eq!(
            target.contents_url(),
            "https://api.github.com/repos/o/r/contents/station.json"
        );
    }
}
