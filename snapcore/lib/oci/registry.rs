use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use moka::future::Cache;
use oci_spec::image::Digest;
use reqwest::{header, Client, Response, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::Deserialize;

use crate::{
    oci::{BlobFetcher, FetchedBlob, Reference},
    SnapshotterError, SnapshotterResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Manifest media types accepted when fetching by digest.
const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
application/vnd.docker.distribution.manifest.v2+json";

/// Tokens are cached for less than the shortest lifetime registries commonly hand out.
const TOKEN_CACHE_TTL: Duration = Duration::from_secs(60);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A client for the registry HTTP API v2 that fetches manifests and blobs by digest.
///
/// Pull tokens are negotiated anonymously from the realm a registry names in its
/// `WWW-Authenticate` challenge. With `insecure` set, a request that fails at the transport
/// level is retried once over plain HTTP.
pub struct RegistryFetcher {
    client: ClientWithMiddleware,
    insecure: bool,
    tokens: Cache<String, String>,
}

/// The parameters of a `Bearer` authentication challenge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BearerChallenge {
    /// Where tokens are issued.
    pub realm: String,

    /// The service the token is for.
    pub service: Option<String>,

    /// The scope requested by the registry.
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: String,

    #[serde(default)]
    access_token: String,
}

#[derive(Debug, Clone, Copy)]
enum Scheme {
    Https,
    Http,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RegistryFetcher {
    /// Creates a new fetcher.
    pub fn new(insecure: bool) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = ClientBuilder::new(Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self {
            client,
            insecure,
            tokens: Cache::builder()
                .max_capacity(256)
                .time_to_live(TOKEN_CACHE_TTL)
                .build(),
        }
    }

    async fn fetch(
        &self,
        reference: &Reference,
        kind: &str,
        digest: &Digest,
        accept: Option<&str>,
    ) -> SnapshotterResult<FetchedBlob> {
        let response = match self
            .fetch_with_scheme(Scheme::Https, reference, kind, digest, accept)
            .await
        {
            Err(e) if self.retry_with_plain_http(&e) => {
                tracing::warn!(reference = %reference, error = %e, "retrying registry request over plain http");
                self.fetch_with_scheme(Scheme::Http, reference, kind, digest, accept)
                    .await?
            }
            result => result?,
        };

        let size = response.content_length();
        let stream = response
            .bytes_stream()
            .map(|item| item.map_err(SnapshotterError::from))
            .boxed();

        Ok(FetchedBlob { size, stream })
    }

    async fn fetch_with_scheme(
        &self,
        scheme: Scheme,
        reference: &Reference,
        kind: &str,
        digest: &Digest,
        accept: Option<&str>,
    ) -> SnapshotterResult<Response> {
        let url = format!(
            "{}://{}/v2/{}/{}/{}",
            scheme.as_str(),
            reference.api_host(),
            reference.get_repository(),
            kind,
            digest
        );
        let token_key = format!("{}/{}", reference.api_host(), reference.get_repository());

        tracing::debug!(url = %url, "fetching from registry");

        let token = self.tokens.get(&token_key).await;
        let mut response = self.send(&url, accept, token.as_deref()).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_bearer_challenge);

            if let Some(challenge) = challenge {
                let token = self
                    .get_access_token(&challenge, reference.get_repository())
                    .await?;
                self.tokens.insert(token_key, token.clone()).await;
                response = self.send(&url, accept, Some(&token)).await?;
            }
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SnapshotterError::Upstream(format!(
                "{url} returned {status}: {body}"
            )));
        }

        Ok(response)
    }

    async fn send(
        &self,
        url: &str,
        accept: Option<&str>,
        token: Option<&str>,
    ) -> SnapshotterResult<Response> {
        let mut request = self.client.get(url);
        if let Some(accept) = accept {
            request = request.header(header::ACCEPT, accept);
        }
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        Ok(request.send().await?)
    }

    /// Gets an anonymous pull token for `repository`.
    async fn get_access_token(
        &self,
        challenge: &BearerChallenge,
        repository: &str,
    ) -> SnapshotterResult<String> {
        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{repository}:pull"));

        let mut query = vec![("scope", scope)];
        if let Some(service) = &challenge.service {
            query.push(("service", service.clone()));
        }

        let response = self
            .client
            .get(&challenge.realm)
            .query(&query)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SnapshotterError::Upstream(format!(
                "token request to {} returned {}",
                challenge.realm,
                response.status()
            )));
        }

        let token = response.json::<TokenResponse>().await?;
        if !token.token.is_empty() {
            Ok(token.token)
        } else if !token.access_token.is_empty() {
            Ok(token.access_token)
        } else {
            Err(SnapshotterError::Upstream(format!(
                "no token returned by {}",
                challenge.realm
            )))
        }
    }

    fn retry_with_plain_http(&self, error: &SnapshotterError) -> bool {
        if !self.insecure {
            return false;
        }

        match error {
            SnapshotterError::HttpMiddleware(e) => e.is_connect() || e.is_request(),
            SnapshotterError::HttpRequest(e) => e.is_connect() || e.is_request(),
            _ => false,
        }
    }
}

impl Scheme {
    fn as_str(&self) -> &'static str {
        match self {
            Scheme::Https => "https",
            Scheme::Http => "http",
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Parses a `WWW-Authenticate: Bearer realm="...",service="...",scope="..."` header value.
pub fn parse_bearer_challenge(value: &str) -> Option<BearerChallenge> {
    let params = value.trim().strip_prefix("Bearer ")?;
    let mut challenge = BearerChallenge::default();

    let mut rest = params.trim();
    while !rest.is_empty() {
        let (key, after_key) = rest.split_once('=')?;
        let after_key = after_key.trim_start();
        let (value, remainder) = match after_key.strip_prefix('"') {
            Some(quoted) => {
                let end = quoted.find('"')?;
                (&quoted[..end], &quoted[end + 1..])
            }
            None => match after_key.find(',') {
                Some(end) => (&after_key[..end], &after_key[end..]),
                None => (after_key, ""),
            },
        };

        match key.trim() {
            "realm" => challenge.realm = value.to_string(),
            "service" => challenge.service = Some(value.to_string()),
            "scope" => challenge.scope = Some(value.to_string()),
            _ => {}
        }

        rest = remainder.trim_start().trim_start_matches(',').trim_start();
    }

    if challenge.realm.is_empty() {
        None
    } else {
        Some(challenge)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl BlobFetcher for RegistryFetcher {
    async fn fetch_manifest(
        &self,
        reference: &Reference,
        digest: &Digest,
    ) -> SnapshotterResult<FetchedBlob> {
        self.fetch(reference, "manifests", digest, Some(MANIFEST_ACCEPT))
            .await
    }

    async fn fetch_blob(
        &self,
        reference: &Reference,
        digest: &Digest,
    ) -> SnapshotterResult<FetchedBlob> {
        self.fetch(reference, "blobs", digest, None).await
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bearer_challenge() {
        let challenge = parse_bearer_challenge(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/alpine:pull""#,
        )
        .unwrap();

        assert_eq!(challenge.realm, "https://auth.docker.io/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(
            challenge.scope.as_deref(),
            Some("repository:library/alpine:pull")
        );
    }

    #[test]
    fn test_parse_bearer_challenge_rejects_other_schemes() {
        assert!(parse_bearer_challenge(r#"Basic realm="registry""#).is_none());
        assert!(parse_bearer_challenge(r#"Bearer service="x""#).is_none());
    }

    #[test]
    fn test_plain_http_retry_requires_insecure() {
        let fetcher = RegistryFetcher::new(false);
        let error = SnapshotterError::Upstream("boom".into());
        assert!(!fetcher.retry_with_plain_http(&error));
    }
}
