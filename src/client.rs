use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{StatusCode, Url};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::{
    auth::{self, AuthMaterial, SshKeygenSigner, SshSigner},
    cookies::CookieStore,
    wire::{Challenge, SetCookie},
    ApiRequest, ApiResponse, ClientConfig, ClientOptions, ObsError, Payload, Result,
};

/// Route prefix of the unauthenticated API.
pub const PUBLIC_PREFIX: &str = "/public";

const ACCEPT_XML: &str = "application/xml; charset=utf-8";

struct AuthCell {
    material: AuthMaterial,
    /// Bumped each time a challenge replaces `material`.
    generation: u64,
}

/// Authenticated client for the build service API.
///
/// Clones share the authorization state and the cookie jar. Negotiation
/// after a `401` is serialized per client: a request that was challenged
/// under material another request has since replaced reuses the newer
/// material instead of signing again.
#[derive(Clone)]
pub struct ObsClient {
    http: reqwest::Client,
    config: Arc<ClientConfig>,
    options: ClientOptions,
    base_url: Url,
    cookies: Arc<CookieStore>,
    auth: Arc<Mutex<AuthCell>>,
    negotiation: Arc<tokio::sync::Mutex<()>>,
    signer: Arc<dyn SshSigner>,
}

impl fmt::Debug for ObsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObsClient")
            .field("config", &self.config)
            .field("options", &self.options)
            .field("auth", &self.lock_auth().material.scheme())
            .finish_non_exhaustive()
    }
}

impl ObsClient {
    /// Creates a client from a validated configuration.
    ///
    /// Fails with [`ObsError::Config`] when the API URL cannot be parsed.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let base_url = Url::parse(config.api_url()).map_err(|err| {
            ObsError::Config(format!("invalid API URL {:?}: {err}", config.api_url()))
        })?;
        if base_url.host_str().is_none() {
            return Err(ObsError::Config(format!(
                "API URL {:?} has no host",
                config.api_url()
            )));
        }

        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static(ACCEPT_XML));
        headers.extend(config.headers().clone());

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|err| ObsError::Config(format!("cannot build HTTP client: {err}")))?;

        Ok(Self {
            http,
            cookies: Arc::new(CookieStore::new(config.cookie_jar())),
            auth: Arc::new(Mutex::new(AuthCell {
                material: AuthMaterial::initial(&config),
                generation: 0,
            })),
            negotiation: Arc::new(tokio::sync::Mutex::new(())),
            signer: Arc::new(SshKeygenSigner::default()),
            options: ClientOptions::default(),
            base_url,
            config: Arc::new(config),
        })
    }

    /// Creates an unauthenticated client using the public routes.
    pub fn public(api_url: impl Into<String>) -> Result<Self> {
        Self::new(ClientConfig::public(api_url))
    }

    /// Creates a client from `OSC_USER`, `OSC_PASSWORD`, `OSC_SSH_PUBKEY`
    /// and `OSC_APIURL`.
    pub fn from_env() -> Result<Self> {
        Self::new(ClientConfig::from_env()?)
    }

    /// Creates a client from an oscrc file, optionally for a specific API URL.
    pub fn from_oscrc(path: impl AsRef<Path>, api_url: Option<&str>) -> Result<Self> {
        Self::new(ClientConfig::from_oscrc(path, api_url)?)
    }

    /// Creates a client from the user's oscrc.
    pub fn from_default_oscrc(api_url: Option<&str>) -> Result<Self> {
        Self::new(ClientConfig::from_default_oscrc(api_url)?)
    }

    /// Applies client options such as timeout and retry behavior.
    pub fn with_options(mut self, opts: ClientOptions) -> Self {
        self.options = opts;
        self
    }

    /// Replaces the `ssh-keygen` based signer.
    pub fn with_signer(mut self, signer: impl SshSigner + 'static) -> Self {
        self.signer = Arc::new(signer);
        self
    }

    /// The configuration this client was built from.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The session cookie jar shared by all clones of this client.
    pub fn cookie_store(&self) -> &CookieStore {
        &self.cookies
    }

    /// The authorization material currently attached to requests.
    pub fn auth_material(&self) -> AuthMaterial {
        self.lock_auth().material.clone()
    }

    /// Sends a `GET` with the client's default backoff.
    pub async fn get(&self, route: &str) -> Result<ApiResponse> {
        self.request(ApiRequest::get(route)).await
    }

    /// Sends a `POST`, with an optional body.
    ///
    /// Build an [`ApiRequest`] and call [`ObsClient::request`] when query
    /// parameters are needed, e.g. `?cmd=branch`.
    pub async fn post(&self, route: &str, payload: Option<Payload>) -> Result<ApiResponse> {
        self.request(with_payload(ApiRequest::new(reqwest::Method::POST, route), payload))
            .await
    }

    /// Sends a `PUT` carrying `payload`, typically an XML document.
    pub async fn put(&self, route: &str, payload: impl Into<Payload>) -> Result<ApiResponse> {
        self.request(ApiRequest::new(reqwest::Method::PUT, route).payload(payload))
            .await
    }

    /// Sends a `DELETE`.
    pub async fn delete(&self, route: &str) -> Result<ApiResponse> {
        self.request(ApiRequest::new(reqwest::Method::DELETE, route))
            .await
    }

    /// Performs one logical API call.
    ///
    /// Retryable server errors (500, 502, 503, 504) and timeouts are retried
    /// within the request's [`BackOff`](crate::BackOff) budget. A `401`
    /// triggers one negotiation against the offered challenges and a single
    /// reissue of the request. Any remaining 4xx/5xx status becomes
    /// [`ObsError::Http`].
    pub async fn request(&self, request: ApiRequest) -> Result<ApiResponse> {
        let url = self.url_for(&request.route)?;
        let (generation, authorization) = if self.config.is_public() {
            (0, None)
        } else {
            let cell = self.lock_auth();
            (cell.generation, cell.material.header_value())
        };

        let response = self
            .send_with_retry(&request, &url, authorization.as_deref())
            .await?;

        if response.status == StatusCode::UNAUTHORIZED && !self.config.is_public() {
            if let Some(authorization) = self.renegotiate(generation, &response).await? {
                debug!(method = %request.method, route = %request.route, "reissuing after authentication");
                let response = self
                    .attempt(&request, &url, Some(&authorization))
                    .await?
                    .ok_or_else(|| self.timeout_error(&request, 1))?;
                return self.outcome(&request, response);
            }
        }

        self.outcome(&request, response)
    }

    async fn send_with_retry(
        &self,
        request: &ApiRequest,
        url: &Url,
        authorization: Option<&str>,
    ) -> Result<ApiResponse> {
        let backoff = request.backoff.unwrap_or(self.options.backoff);
        let mut attempt = 0usize;
        loop {
            let last = attempt + 1 >= backoff.retries();
            match self.attempt(request, url, authorization).await? {
                None if last => return Err(self.timeout_error(request, attempt + 1)),
                None => {
                    debug!(method = %request.method, route = %request.route, attempt, "attempt timed out, retrying");
                }
                Some(response) if is_retryable(response.status) && !last => {
                    let delay = backoff.delay_after(attempt);
                    debug!(
                        method = %request.method,
                        route = %request.route,
                        status = response.status.as_u16(),
                        delay_ms = delay.as_millis() as u64,
                        "retrying after server error"
                    );
                    sleep(delay).await;
                }
                Some(response) => return Ok(response),
            }
            attempt += 1;
        }
    }

    /// Sends the request once. `Ok(None)` means the attempt timed out.
    async fn attempt(
        &self,
        request: &ApiRequest,
        url: &Url,
        authorization: Option<&str>,
    ) -> Result<Option<ApiResponse>> {
        let mut builder = self
            .http
            .request(request.method.clone(), url.clone())
            .timeout(Duration::from_millis(self.options.timeout_ms));

        let query = request.query_pairs();
        if !query.is_empty() {
            builder = builder.query(&query);
        }
        if let Some(cookie) = self.cookie_header() {
            builder = builder.header(header::COOKIE, cookie);
        }
        if let Some(authorization) = authorization {
            let mut value = HeaderValue::from_str(authorization).map_err(|_| {
                ObsError::InvalidRequest("credentials contain characters not allowed in a header".to_owned())
            })?;
            value.set_sensitive(true);
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder = builder.headers(request.headers.clone());
        if let Some(payload) = &request.payload {
            builder = builder.body(payload.to_body());
        }

        debug!(method = %request.method, route = %request.route, "sending request");
        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) if err.is_timeout() => return Ok(None),
            Err(err) => return Err(self.transport_error(request, err)),
        };

        let status = response.status();
        let headers = response.headers().clone();
        self.store_cookies(&headers, url);

        match response.bytes().await {
            Ok(body) => Ok(Some(ApiResponse {
                status,
                headers,
                body: body.to_vec(),
            })),
            Err(err) if err.is_timeout() => Ok(None),
            Err(err) => Err(self.transport_error(request, err)),
        }
    }

    /// Answers the challenges of a `401`; returns the header to retry with.
    async fn renegotiate(
        &self,
        generation: u64,
        response: &ApiResponse,
    ) -> Result<Option<String>> {
        let challenges: Vec<Challenge> = response
            .www_authenticate()
            .into_iter()
            .flat_map(Challenge::parse_all)
            .collect();

        let _serialized = self.negotiation.lock().await;

        let superseded = {
            let cell = self.lock_auth();
            (cell.generation != generation).then(|| cell.material.header_value())
        };
        if let Some(authorization) = superseded {
            debug!("authorization was renegotiated concurrently, reusing it");
            return Ok(authorization);
        }

        let Some(material) =
            auth::negotiate(&challenges, &self.config, self.signer.as_ref()).await?
        else {
            return Ok(None);
        };

        let authorization = material.header_value();
        let mut cell = self.lock_auth();
        debug!(scheme = material.scheme(), "authorization negotiated");
        cell.material = material;
        cell.generation += 1;
        Ok(authorization)
    }

    fn outcome(&self, request: &ApiRequest, response: ApiResponse) -> Result<ApiResponse> {
        let status = response.status;
        if !(status.is_client_error() || status.is_server_error()) {
            return Ok(response);
        }

        let reason = status.canonical_reason().unwrap_or("unknown status");
        let body = response.text();
        let body = body.trim();
        Err(ObsError::Http {
            status: status.as_u16(),
            message: if body.is_empty() {
                reason.to_owned()
            } else {
                format!("{reason}: {body}")
            },
            method: request.method.clone(),
            route: request.route.clone(),
        })
    }

    fn url_for(&self, route: &str) -> Result<Url> {
        let base = self.base_url.as_str().trim_end_matches('/');
        let prefix = if self.config.is_public() { PUBLIC_PREFIX } else { "" };
        let separator = if route.starts_with('/') { "" } else { "/" };
        let raw = format!("{base}{prefix}{separator}{route}");
        Url::parse(&raw).map_err(|err| ObsError::InvalidRequest(format!("route {route:?}: {err}")))
    }

    fn cookie_header(&self) -> Option<String> {
        self.cookies.header_for(self.base_url.host_str()?)
    }

    fn store_cookies(&self, headers: &HeaderMap, url: &Url) {
        let incoming: Vec<SetCookie> = headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(SetCookie::parse)
            .collect();
        if let Err(err) = self.cookies.update(&incoming, url) {
            warn!(path = %self.cookies.path().display(), error = %err, "cannot persist cookies");
        }
    }

    fn lock_auth(&self) -> MutexGuard<'_, AuthCell> {
        self.auth.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn timeout_error(&self, request: &ApiRequest, attempts: usize) -> ObsError {
        ObsError::Timeout {
            method: request.method.clone(),
            route: request.route.clone(),
            attempts,
        }
    }

    fn transport_error(&self, request: &ApiRequest, source: reqwest::Error) -> ObsError {
        ObsError::Transport {
            method: request.method.clone(),
            route: request.route.clone(),
            source,
        }
    }
}

fn with_payload(request: ApiRequest, payload: Option<Payload>) -> ApiRequest {
    match payload {
        Some(payload) => request.payload(payload),
        None => request,
    }
}

fn is_retryable(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}
