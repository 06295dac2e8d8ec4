//! OCI registry client: manifest fetch, authentication, ranged blob reads.
//!
//! The registry protocol needed here is small: `GET /v2/{repo}/manifests/{tag}`
//! for the manifest and `GET /v2/{repo}/blobs/{digest}` with a `Range` header
//! for blob bytes. Both share one blocking HTTP agent and one authentication
//! session per [`RegistryClient`].
//!
//! # Authentication
//!
//! The session is a small state machine: requests start anonymous (even when
//! credentials are configured, so the server drives scheme negotiation). On a
//! `401`, the `WWW-Authenticate` challenge selects the transition:
//!
//! - `Bearer realm=…, service=…, scope=…` - a token is fetched from the
//!   realm (with Basic auth on the token request when credentials exist) and
//!   the original request is retried once with `Authorization: Bearer`.
//! - `Basic realm=…` - requires configured credentials; the request is
//!   retried once with `Authorization: Basic`.
//! - anything else fails with `AUTH_FAILED`.
//!
//! Once acquired, the state applies preemptively to every later request on
//! the session, including ranged blob reads. Tokens and passwords are never
//! logged; only the token length is.

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex};

use base64::prelude::*;
use serde::{Deserialize, Serialize};

use crate::digest::ContentDigest;
use crate::error::{message, BoxedError, Result, StargzError};
use crate::reference::ImageReference;
use crate::storage::{BlobDescriptor, BlobStorage};

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.oci.image.index.v1+json";

/// An OCI image manifest (or index, before resolution).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Manifest {
    pub schema_version: i32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub media_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<Descriptor>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub layers: Vec<Descriptor>,
    /// Non-empty only for an OCI index.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub manifests: Vec<Descriptor>,
}

/// An OCI content descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
}

/// Registry credential for Basic auth and token requests.
#[derive(Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    fn basic_header(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!("Basic {}", BASE64_STANDARD.encode(raw))
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose the password, not even in debug output.
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug)]
enum AuthState {
    Anonymous,
    Basic,
    Bearer(String),
}

#[derive(Debug)]
struct AuthSession {
    credential: Option<Credential>,
    state: Mutex<AuthState>,
}

impl AuthSession {
    fn new(credential: Option<Credential>) -> Self {
        AuthSession {
            credential,
            state: Mutex::new(AuthState::Anonymous),
        }
    }

    fn apply(&self, req: ureq::Request) -> ureq::Request {
        match &*self.state.lock().unwrap() {
            AuthState::Anonymous => req,
            AuthState::Basic => match &self.credential {
                Some(credential) => req.set("Authorization", &credential.basic_header()),
                None => req,
            },
            AuthState::Bearer(token) => req.set("Authorization", &format!("Bearer {token}")),
        }
    }

    /// Drive a state transition from a `WWW-Authenticate` challenge.
    fn handle_challenge(&self, agent: &ureq::Agent, challenge: &str) -> Result<()> {
        let challenge = challenge.trim();
        if challenge.is_empty() {
            return Err(StargzError::AuthFailed {
                source: message("no WWW-Authenticate header in 401 response"),
            });
        }

        if let Some(params) = challenge.strip_prefix("Bearer ") {
            let token = self.fetch_bearer_token(agent, &parse_challenge_params(params))?;
            tracing::debug!(length = token.len(), "acquired bearer token");
            *self.state.lock().unwrap() = AuthState::Bearer(token);
            return Ok(());
        }

        if challenge.starts_with("Basic") {
            if self.credential.is_none() {
                return Err(StargzError::AuthRequired);
            }
            tracing::info!("using basic authentication");
            *self.state.lock().unwrap() = AuthState::Basic;
            return Ok(());
        }

        Err(StargzError::AuthUnsupported {
            scheme: challenge
                .split_whitespace()
                .next()
                .unwrap_or(challenge)
                .to_string(),
        })
    }

    fn fetch_bearer_token(
        &self,
        agent: &ureq::Agent,
        params: &HashMap<String, String>,
    ) -> Result<String> {
        let realm = params
            .get("realm")
            .filter(|r| !r.is_empty())
            .ok_or_else(|| StargzError::AuthFailed {
                source: message("no realm in WWW-Authenticate header"),
            })?;

        let mut token_url = realm.clone();
        let mut sep = if token_url.contains('?') { '&' } else { '?' };
        if let Some(service) = params.get("service").filter(|s| !s.is_empty()) {
            token_url.push(sep);
            token_url.push_str(&format!("service={service}"));
            sep = '&';
        }
        if let Some(scope) = params.get("scope").filter(|s| !s.is_empty()) {
            token_url.push(sep);
            token_url.push_str(&format!("scope={scope}"));
        }

        let mut req = agent.get(&token_url);
        if let Some(credential) = &self.credential {
            req = req.set("Authorization", &credential.basic_header());
        }

        let resp = match req.call() {
            Ok(resp) => resp,
            Err(ureq::Error::Status(code, resp)) => {
                let body = resp.into_string().unwrap_or_default();
                return Err(StargzError::AuthFailed {
                    source: message(format!("token endpoint returned {code}: {body}")),
                });
            }
            Err(e) => {
                return Err(StargzError::AuthFailed {
                    source: Box::new(e),
                });
            }
        };

        let token_resp: TokenResponse =
            serde_json::from_reader(resp.into_reader()).map_err(|e| StargzError::AuthFailed {
                source: Box::new(e),
            })?;

        token_resp
            .token
            .filter(|t| !t.is_empty())
            .or(token_resp.access_token.filter(|t| !t.is_empty()))
            .ok_or_else(|| StargzError::AuthFailed {
                source: message("no token in auth response"),
            })
    }
}

#[derive(Debug, Default, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Parse `key="value"` pairs from a challenge parameter list.
fn parse_challenge_params(params: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for part in params.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            out.insert(key.to_string(), value.trim_matches('"').to_string());
        }
    }
    out
}

/// `http` for loopback registries, `https` everywhere else.
fn scheme_for(registry: &str) -> &'static str {
    let host = registry.split(':').next().unwrap_or(registry);
    if host == "localhost" || host == "127.0.0.1" {
        "http"
    } else {
        "https"
    }
}

/// Failure of an authenticated GET, before domain-specific wrapping.
enum RequestError {
    /// 401 carrying the `WWW-Authenticate` challenge.
    Unauthorized(String),
    /// Any other non-2xx status, with the response body for diagnostics.
    Status(u16, String),
    /// Transport-level failure.
    Transport(BoxedError),
    /// Authentication handshake failure (already a domain error).
    Auth(StargzError),
}

fn send(
    agent: &ureq::Agent,
    auth: &AuthSession,
    url: &str,
    headers: &[(&str, &str)],
) -> std::result::Result<ureq::Response, RequestError> {
    let mut req = agent.get(url);
    for (name, value) in headers {
        req = req.set(name, value);
    }
    req = auth.apply(req);

    match req.call() {
        Ok(resp) => Ok(resp),
        Err(ureq::Error::Status(401, resp)) => {
            let challenge = resp.header("WWW-Authenticate").unwrap_or("").to_string();
            Err(RequestError::Unauthorized(challenge))
        }
        Err(ureq::Error::Status(code, resp)) => {
            let body = resp.into_string().unwrap_or_default();
            Err(RequestError::Status(code, body))
        }
        Err(e) => Err(RequestError::Transport(Box::new(e))),
    }
}

/// GET with the session's auth applied; on a 401, run the challenge
/// handshake and retry exactly once.
fn authorized_get(
    agent: &ureq::Agent,
    auth: &AuthSession,
    url: &str,
    headers: &[(&str, &str)],
) -> std::result::Result<ureq::Response, RequestError> {
    match send(agent, auth, url, headers) {
        Ok(resp) => Ok(resp),
        Err(RequestError::Unauthorized(challenge)) => {
            auth.handle_challenge(agent, &challenge)
                .map_err(RequestError::Auth)?;
            match send(agent, auth, url, headers) {
                Ok(resp) => Ok(resp),
                Err(RequestError::Unauthorized(_)) => Err(RequestError::Auth(
                    StargzError::AuthFailed {
                        source: message("credentials rejected by registry"),
                    },
                )),
                Err(other) => Err(other),
            }
        }
        Err(other) => Err(other),
    }
}

/// Client for one registry session: shared HTTP agent plus auth state.
#[derive(Clone)]
pub struct RegistryClient {
    agent: ureq::Agent,
    auth: Arc<AuthSession>,
}

impl RegistryClient {
    /// Anonymous client.
    pub fn new() -> Self {
        let agent = ureq::AgentBuilder::new().redirects(10).build();
        RegistryClient {
            agent,
            auth: Arc::new(AuthSession::new(None)),
        }
    }

    /// A client that will answer Basic challenges (and authenticate token
    /// requests) with the given credential. The first request still goes out
    /// anonymously.
    pub fn with_credential(
        self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        RegistryClient {
            agent: self.agent,
            auth: Arc::new(AuthSession::new(Some(Credential {
                username: username.into(),
                password: password.into(),
            }))),
        }
    }

    /// Fetch the single-platform manifest for an image reference.
    ///
    /// If the registry answers with an index (non-empty `manifests`), the
    /// first descriptor is followed and re-fetched by digest.
    pub fn fetch_manifest(&self, reference: &ImageReference) -> Result<Manifest> {
        tracing::info!(image = %reference, "fetching manifest");

        let scheme = scheme_for(&reference.registry);
        let url = format!(
            "{scheme}://{}/v2/{}/manifests/{}",
            reference.registry, reference.repository, reference.tag
        );

        let manifest = self
            .fetch_manifest_url(&url)
            .map_err(|source| manifest_fetch(reference, source))?;

        if manifest.manifests.is_empty() {
            return Ok(manifest);
        }

        let digest = manifest.manifests[0].digest.clone();
        tracing::info!(%digest, "image is an index; selecting first manifest");
        let url = format!(
            "{scheme}://{}/v2/{}/manifests/{}",
            reference.registry, reference.repository, digest
        );
        self.fetch_manifest_url(&url)
            .map_err(|source| manifest_fetch(reference, source))
    }

    fn fetch_manifest_url(&self, url: &str) -> std::result::Result<Manifest, BoxedError> {
        tracing::debug!(url, "manifest request");
        let resp = authorized_get(&self.agent, &self.auth, url, &[("Accept", MANIFEST_ACCEPT)])
            .map_err(|e| match e {
                RequestError::Status(code, body) => {
                    message(format!("registry returned {code}: {body}"))
                }
                RequestError::Transport(source) => source,
                RequestError::Auth(err) => Box::new(err) as BoxedError,
                RequestError::Unauthorized(_) => message("authentication required"),
            })?;
        serde_json::from_reader(resp.into_reader()).map_err(|e| Box::new(e) as BoxedError)
    }

    /// Blob storage for this image, sharing this client's agent and auth
    /// session (tokens acquired during the manifest fetch are reused).
    pub fn storage(&self, reference: &ImageReference, manifest: &Manifest) -> RegistryStorage {
        RegistryStorage {
            agent: self.agent.clone(),
            auth: Arc::clone(&self.auth),
            registry: reference.registry.clone(),
            repository: reference.repository.clone(),
            manifest: manifest.clone(),
        }
    }
}

impl Default for RegistryClient {
    fn default() -> Self {
        Self::new()
    }
}

fn manifest_fetch(reference: &ImageReference, source: BoxedError) -> StargzError {
    StargzError::ManifestFetch {
        image_ref: reference.to_string(),
        source,
    }
}

/// [`BlobStorage`] backed by a remote registry.
pub struct RegistryStorage {
    agent: ureq::Agent,
    auth: Arc<AuthSession>,
    registry: String,
    repository: String,
    manifest: Manifest,
}

impl BlobStorage for RegistryStorage {
    fn list_blobs(&self) -> Result<Vec<BlobDescriptor>> {
        let mut blobs = Vec::with_capacity(self.manifest.layers.len());
        for layer in &self.manifest.layers {
            let digest = match ContentDigest::parse(&layer.digest) {
                Ok(digest) => digest,
                Err(_) => {
                    tracing::warn!(digest = %layer.digest, "skipping layer with invalid digest");
                    continue;
                }
            };
            blobs.push(BlobDescriptor {
                digest,
                size: layer.size,
                media_type: layer.media_type.clone(),
            });
        }
        Ok(blobs)
    }

    fn read_blob(
        &self,
        digest: &ContentDigest,
        offset: u64,
        length: u64,
    ) -> Result<Box<dyn Read + Send>> {
        let scheme = scheme_for(&self.registry);
        let url = format!(
            "{scheme}://{}/v2/{}/blobs/{}",
            self.registry, self.repository, digest
        );
        let range = if length > 0 {
            format!("bytes={}-{}", offset, offset + length - 1)
        } else {
            format!("bytes={offset}-")
        };
        tracing::debug!(blob = digest.short(), %range, "blob range request");

        let resp = authorized_get(&self.agent, &self.auth, &url, &[("Range", range.as_str())])
            .map_err(|e| match e {
                RequestError::Status(code, _) => StargzError::RangeRequest { status: code },
                RequestError::Transport(source) => StargzError::Network { source },
                RequestError::Auth(err) => err,
                RequestError::Unauthorized(_) => StargzError::AuthFailed {
                    source: message("authentication required"),
                },
            })?;

        let reader = resp.into_reader();
        Ok(Box::new(reader))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_for_loopback_is_http() {
        assert_eq!(scheme_for("localhost"), "http");
        assert_eq!(scheme_for("localhost:5000"), "http");
        assert_eq!(scheme_for("127.0.0.1:8080"), "http");
        assert_eq!(scheme_for("ghcr.io"), "https");
        assert_eq!(scheme_for("registry.example.com:443"), "https");
    }

    #[test]
    fn test_parse_challenge_params() {
        let params = parse_challenge_params(
            r#"realm="https://auth.example.com/token", service="registry.example.com", scope="repository:foo/bar:pull""#,
        );
        assert_eq!(params["realm"], "https://auth.example.com/token");
        assert_eq!(params["service"], "registry.example.com");
        assert_eq!(params["scope"], "repository:foo/bar:pull");
    }

    #[test]
    fn test_parse_challenge_params_without_quotes() {
        let params = parse_challenge_params("realm=https://auth.example.com/token, service=reg");
        assert_eq!(params["realm"], "https://auth.example.com/token");
        assert_eq!(params["service"], "reg");
    }

    #[test]
    fn test_empty_challenge_is_auth_failure() {
        let agent = ureq::AgentBuilder::new().build();
        let session = AuthSession::new(None);
        let err = session.handle_challenge(&agent, "").unwrap_err();
        assert_eq!(err.code(), "AUTH_FAILED");
    }

    #[test]
    fn test_bearer_challenge_without_realm_fails() {
        let agent = ureq::AgentBuilder::new().build();
        let session = AuthSession::new(None);
        let err = session
            .handle_challenge(&agent, r#"Bearer service="reg", scope="pull""#)
            .unwrap_err();
        assert!(matches!(err, StargzError::AuthFailed { .. }));
    }

    #[test]
    fn test_manifest_deserializes_image_and_index() {
        let image_json = r#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "layers": [
                {"mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                 "digest": "sha256:aaaa", "size": 123}
            ]
        }"#;
        let manifest: Manifest = serde_json::from_str(image_json).unwrap();
        assert_eq!(manifest.layers.len(), 1);
        assert!(manifest.manifests.is_empty());
        assert_eq!(manifest.layers[0].size, 123);

        let index_json = r#"{
            "schemaVersion": 2,
            "manifests": [
                {"mediaType": "application/vnd.oci.image.manifest.v1+json",
                 "digest": "sha256:bbbb", "size": 7}
            ]
        }"#;
        let index: Manifest = serde_json::from_str(index_json).unwrap();
        assert_eq!(index.manifests.len(), 1);
        assert!(index.layers.is_empty());
    }

    #[test]
    fn test_basic_challenge_requires_credentials() {
        let agent = ureq::AgentBuilder::new().build();
        let session = AuthSession::new(None);
        let err = session
            .handle_challenge(&agent, r#"Basic realm="registry""#)
            .unwrap_err();
        assert_eq!(err.code(), "AUTH_FAILED");
        assert!(matches!(err, StargzError::AuthRequired));
    }

    #[test]
    fn test_basic_challenge_transitions_state() {
        let agent = ureq::AgentBuilder::new().build();
        let session = AuthSession::new(Some(Credential {
            username: "user".into(),
            password: "pass".into(),
        }));
        session
            .handle_challenge(&agent, r#"Basic realm="registry""#)
            .unwrap();
        assert!(matches!(*session.state.lock().unwrap(), AuthState::Basic));
    }

    #[test]
    fn test_unsupported_scheme_is_rejected() {
        let agent = ureq::AgentBuilder::new().build();
        let session = AuthSession::new(None);
        let err = session
            .handle_challenge(&agent, r#"Negotiate realm="registry""#)
            .unwrap_err();
        assert!(matches!(err, StargzError::AuthUnsupported { .. }));
    }

    #[test]
    fn test_credential_debug_redacts_password() {
        let credential = Credential {
            username: "user".into(),
            password: "hunter2".into(),
        };
        let debug = format!("{credential:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("redacted"));
    }

    #[test]
    fn test_list_blobs_skips_invalid_digests() {
        let manifest = Manifest {
            schema_version: 2,
            layers: vec![
                Descriptor {
                    media_type: "application/vnd.oci.image.layer.v1.tar+gzip".into(),
                    digest: format!("sha256:{}", "a".repeat(64)),
                    size: 10,
                },
                Descriptor {
                    media_type: "application/vnd.oci.image.layer.v1.tar+gzip".into(),
                    digest: "not-a-digest".into(),
                    size: 20,
                },
            ],
            ..Manifest::default()
        };

        let storage = RegistryStorage {
            agent: ureq::AgentBuilder::new().build(),
            auth: Arc::new(AuthSession::new(None)),
            registry: "example.com".into(),
            repository: "repo".into(),
            manifest,
        };

        let blobs = storage.list_blobs().unwrap();
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].size, 10);
    }
}
