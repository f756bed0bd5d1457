use reqwest::Method;
use reqwest::header::HeaderMap;
use std::future::Future;
use tracing::{debug, error};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not construct the HTTP client")]
    CreateReqwest(#[source] reqwest::Error),
    #[error("request to `{1}` failed")]
    Transport(#[source] BoxError, String),
    #[error("`{url}` responded with HTTP {status} {reason}: {body}")]
    Status { url: String, status: u16, reason: String, body: String },
}

impl Error {
    /// HTTP status of the failure, if the controller got far enough to respond.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Status { status, .. } => Some(*status),
            Error::CreateReqwest(_) | Error::Transport(..) => None,
        }
    }
}

/// The error and all of its sources, joined by `: `.
pub fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut cause = error.source();
    while let Some(e) = cause {
        message.push_str(": ");
        message.push_str(&e.to_string());
        cause = e.source();
    }
    message
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "connection::Args")]
pub struct Args {
    /// Base URL of the pool controller, e.g. `http://192.168.2.3`.
    #[arg(long, short = 'u')]
    pub url: String,

    /// HTTP basic auth user name. Enables basic auth.
    #[arg(long)]
    pub username: Option<String>,

    /// HTTP basic auth password.
    #[arg(long, requires = "username")]
    pub password: Option<String>,

    /// Consider a request failed if it has not completed in this amount of time.
    #[arg(long, default_value = "5s")]
    pub timeout: humantime::Duration,
}

#[derive(Clone, Debug)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub body: String,
}

impl Response {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

/// The HTTP capability everything else is built on.
///
/// Non-200 responses are *not* errors at this level.
pub trait Transport: Send + Sync {
    fn send(&self, request: Request) -> impl Future<Output = Result<Response, Error>> + Send;
}

pub struct HttpTransport {
    client: reqwest::Client,
    credentials: Option<(String, Option<String>)>,
}

impl HttpTransport {
    pub fn new(args: &Args) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(*args.timeout)
            .build()
            .map_err(Error::CreateReqwest)?;
        let credentials = args.username.clone().map(|u| (u, args.password.clone()));
        Ok(Self { client, credentials })
    }
}

impl Transport for HttpTransport {
    async fn send(&self, request: Request) -> Result<Response, Error> {
        let Request { method, url, headers, body } = request;
        let mut builder = self.client.request(method.clone(), &url).headers(headers);
        if let Some((username, password)) = &self.credentials {
            builder = builder.basic_auth(username, password.as_ref());
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }
        debug!(message = "sending request", %method, url = %url);
        let response = builder.send().await.map_err(|e| Error::Transport(Box::new(e), url.clone()))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| Error::Transport(Box::new(e), url.clone()))?;
        Ok(Response {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or_default().to_string(),
            body,
        })
    }
}

/// Join the controller base URL and an endpoint path.
///
/// If the result is not a valid URL the error is logged and the bare endpoint is used instead,
/// which will then fail at request time.
pub fn endpoint_url(base: &str, endpoint: &str) -> String {
    let base = base.strip_suffix('/').unwrap_or(base);
    let endpoint = endpoint.strip_prefix('/').unwrap_or(endpoint);
    match reqwest::Url::parse(&format!("{base}/{endpoint}")) {
        Ok(url) => url.to_string(),
        Err(e) => {
            error!(
                message = "could not construct the endpoint URL",
                base,
                endpoint,
                error = (&e as &dyn std::error::Error)
            );
            format!("/{endpoint}")
        }
    }
}

/// The failure of every attempt of a retried request.
#[derive(thiserror::Error, Debug)]
#[error("giving up after {attempts} attempts")]
pub struct RetriesExhausted<E: std::error::Error + 'static> {
    pub attempts: u32,
    #[source]
    pub last: E,
}

/// Run `attempt` until it succeeds, at most `attempts` times.
pub async fn retrying<T, E, F, Fut>(attempts: u32, mut attempt: F) -> Result<T, RetriesExhausted<E>>
where
    E: std::error::Error + 'static,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut number = 1;
    loop {
        match attempt(number).await {
            Ok(value) => return Ok(value),
            Err(e) if number >= attempts => {
                return Err(RetriesExhausted { attempts: number, last: e });
            }
            Err(e) => {
                debug!(
                    message = "attempt failed, retrying",
                    attempt = number,
                    attempts,
                    error = (&e as &dyn std::error::Error)
                );
                number += 1;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned responses and records every request it receives.
    #[derive(Default)]
    pub(crate) struct ScriptedTransport {
        pub(crate) responses: Mutex<VecDeque<Result<Response, Error>>>,
        pub(crate) requests: Mutex<Vec<Request>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new(responses: impl IntoIterator<Item = Result<Response, Error>>) -> Self {
            Self { responses: Mutex::new(responses.into_iter().collect()), requests: Default::default() }
        }

        pub(crate) fn requests(&self) -> Vec<Request> {
            self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }
    }

    pub(crate) fn ok(body: &str) -> Result<Response, Error> {
        Ok(Response { status: 200, reason: "OK".into(), body: body.into() })
    }

    pub(crate) fn status(status: u16) -> Result<Response, Error> {
        Ok(Response { status, reason: "Nope".into(), body: String::new() })
    }

    pub(crate) fn refused(url: &str) -> Result<Response, Error> {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused");
        Err(Error::Transport(Box::new(io), url.into()))
    }

    impl Transport for ScriptedTransport {
        async fn send(&self, request: Request) -> Result<Response, Error> {
            self.requests.lock().unwrap_or_else(|e| e.into_inner()).push(request.clone());
            let next = self.responses.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
            next.unwrap_or_else(|| refused(&request.url))
        }
    }

    #[test]
    fn joins_urls() {
        assert_eq!(endpoint_url("http://pool.local", "/GetState.csv"), "http://pool.local/GetState.csv");
        assert_eq!(endpoint_url("http://pool.local/", "GetState.csv"), "http://pool.local/GetState.csv");
        assert_eq!(endpoint_url("http://10.0.0.2/api/", "/usrcfg.cgi"), "http://10.0.0.2/api/usrcfg.cgi");
    }

    #[test]
    fn malformed_base_degrades_to_endpoint() {
        assert_eq!(endpoint_url("pool.local", "/GetState.csv"), "/GetState.csv");
    }

    #[test]
    fn status_of_errors() {
        let e = Error::Status { url: "x".into(), status: 503, reason: "".into(), body: "".into() };
        assert_eq!(e.status(), Some(503));
        assert_eq!(refused("x").unwrap_err().status(), None);
        assert_eq!(error_chain(&refused("x").unwrap_err()), "request to `x` failed: connection refused");
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let mut calls = 0;
        let result: Result<(), _> = retrying(3, |_| {
            calls += 1;
            async { Err(std::io::Error::other("boom")) }
        })
        .await;
        let exhausted = result.unwrap_err();
        assert_eq!(exhausted.attempts, 3);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn retries_stop_on_success() {
        let result = retrying(3, |n| async move {
            if n < 2 { Err(std::io::Error::other("boom")) } else { Ok(n) }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }
}
