use crate::connection::{self, Request, Transport, endpoint_url, error_chain};
use crate::frame::{self, Frame};
use reqwest::Method;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, warn};

pub const ENDPOINT: &str = "/GetState.csv";

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "poll::Args")]
pub struct Args {
    /// Time to wait after a state request completes before sending the next one.
    ///
    /// The effective period is this plus however long the controller takes to respond.
    #[arg(long, default_value = "5s")]
    pub update_interval: humantime::Duration,

    /// Report an error once this many consecutive requests failed the same way.
    #[arg(long, default_value = "3")]
    pub error_tolerance: u32,
}

impl Default for Args {
    fn default() -> Self {
        Self { update_interval: Duration::from_secs(5).into(), error_tolerance: 3 }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not fetch the controller state")]
    Fetch(#[source] connection::Error),
    #[error("could not parse the controller state")]
    Parse(#[source] frame::Error),
}

impl Error {
    /// What makes two failures "the same": the HTTP status if there is one, the message otherwise.
    pub fn key(&self) -> FailureKey {
        match self {
            Error::Fetch(e) => match e.status() {
                Some(status) => FailureKey::Status(status),
                None => FailureKey::Message(error_chain(self)),
            },
            Error::Parse(_) => FailureKey::Message(error_chain(self)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureKey {
    Status(u16),
    Message(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Differs from the previous failure; the streak restarts at 1.
    New,
    /// Same as before, tolerance not reached yet.
    Repeated,
    /// Same as before, and the streak just hit a multiple of the tolerance.
    Persistent,
}

/// Tells a new failure from a repeat of the previous one.
#[derive(Debug)]
pub struct FailureTracker {
    tolerance: u32,
    consecutive: u32,
    recent: Option<FailureKey>,
}

impl FailureTracker {
    pub fn new(tolerance: u32) -> Self {
        Self { tolerance: tolerance.max(1), consecutive: 0, recent: None }
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
        self.recent = None;
    }

    pub fn record_failure(&mut self, key: FailureKey) -> Verdict {
        self.consecutive += 1;
        if self.recent.as_ref() != Some(&key) {
            self.consecutive = 1;
            self.recent = Some(key);
            return Verdict::New;
        }
        if self.consecutive % self.tolerance == 0 {
            Verdict::Persistent
        } else {
            Verdict::Repeated
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum PollerState {
    Idle,
    Scheduled,
    Fetching,
    Stopped,
}

pub type SuccessCallback = Box<dyn FnMut(&Arc<Frame>) + Send>;
pub type ErrorCallback = Box<dyn FnMut(&Error) + Send>;

#[derive(Default)]
pub struct Callbacks {
    on_success: Option<SuccessCallback>,
    on_error: Option<ErrorCallback>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success(mut self, f: impl FnMut(&Arc<Frame>) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnMut(&Error) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

struct Shared {
    state: PollerState,
    frame: Arc<Frame>,
    has_data: bool,
    update_interval: Duration,
    failures: FailureTracker,
    callbacks: Option<Callbacks>,
    stop_on_persistent_error: bool,
    cancel: CancellationToken,
}

struct Inner<T> {
    transport: Arc<T>,
    url: String,
    shared: Mutex<Shared>,
    /// Held for the duration of a fetch so that scheduled and one-shot cycles never overlap.
    cycle: tokio::sync::Mutex<()>,
}

enum Outcome {
    Data(Arc<Frame>),
    Failed(Error, Verdict),
}

/// Periodically fetches `/GetState.csv` and hands the parsed frames to a callback.
///
/// Cycles never overlap: the next request is only scheduled once the previous one and its
/// callback have completed. Dropping the poller aborts its task.
pub struct Poller<T> {
    inner: Arc<Inner<T>>,
    task: Mutex<Option<AbortOnDropHandle<()>>>,
}

impl<T: Transport + 'static> Poller<T> {
    pub fn new(transport: Arc<T>, base_url: &str, args: &Args) -> Self {
        let shared = Shared {
            state: PollerState::Idle,
            frame: Arc::new(Frame::default()),
            has_data: false,
            update_interval: *args.update_interval,
            failures: FailureTracker::new(args.error_tolerance),
            callbacks: None,
            stop_on_persistent_error: false,
            cancel: CancellationToken::new(),
        };
        let inner = Inner {
            transport,
            url: endpoint_url(base_url, ENDPOINT),
            shared: Mutex::new(shared),
            cycle: tokio::sync::Mutex::new(()),
        };
        Self { inner: Arc::new(inner), task: Mutex::new(None) }
    }

    /// Start polling, beginning with an immediate request.
    ///
    /// When already running only the callbacks are replaced. Must be called within a tokio
    /// runtime.
    pub fn start(&self, callbacks: Callbacks, stop_on_persistent_error: bool) {
        let mut shared = self.inner.lock();
        shared.callbacks = Some(callbacks);
        shared.stop_on_persistent_error = stop_on_persistent_error;
        if matches!(shared.state, PollerState::Scheduled | PollerState::Fetching) {
            return;
        }
        shared.state = PollerState::Scheduled;
        shared.cancel = CancellationToken::new();
        let cancel = shared.cancel.clone();
        let inner = Arc::clone(&self.inner);
        let task = AbortOnDropHandle::new(tokio::spawn(inner.run(cancel)));
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    }

    /// Stop polling and drop the callbacks.
    ///
    /// A request already in flight still completes, but nothing is scheduled after it.
    pub fn stop(&self) {
        let mut shared = self.inner.lock();
        shared.cancel.cancel();
        shared.callbacks = None;
        if shared.state != PollerState::Idle {
            shared.state = PollerState::Stopped;
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), PollerState::Scheduled | PollerState::Fetching)
    }

    pub fn state(&self) -> PollerState {
        self.inner.lock().state
    }

    /// `false` until the first successful request, and again after a persistent failure.
    pub fn has_data(&self) -> bool {
        self.inner.lock().has_data
    }

    /// The most recent frame. Empty until [`Self::has_data`] first becomes `true`.
    pub fn frame(&self) -> Arc<Frame> {
        Arc::clone(&self.inner.lock().frame)
    }

    pub fn update_interval(&self) -> Duration {
        self.inner.lock().update_interval
    }

    pub fn set_update_interval(&self, interval: Duration) {
        self.inner.lock().update_interval = interval;
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Fetch the state once, outside of the schedule. Callbacks are not invoked.
    ///
    /// While polling is running this waits for any scheduled request in flight to complete first.
    pub async fn update(&self) -> Result<Arc<Frame>, Error> {
        match self.inner.cycle().await {
            Outcome::Data(frame) => Ok(frame),
            Outcome::Failed(e, _) => Err(e),
        }
    }
}

impl<T: Transport + 'static> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn fetch(&self) -> Result<Frame, Error> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("text/csv,text/plain"));
        let request = Request { method: Method::GET, url: self.url.clone(), headers, body: None };
        let response = self.transport.send(request).await.map_err(Error::Fetch)?;
        if !response.is_ok() {
            return Err(Error::Fetch(connection::Error::Status {
                url: self.url.clone(),
                status: response.status,
                reason: response.reason,
                body: response.body,
            }));
        }
        Frame::from_csv(&response.body).map_err(Error::Parse)
    }

    async fn cycle(&self) -> Outcome {
        let _cycle = self.cycle.lock().await;
        let result = self.fetch().await;
        let mut shared = self.lock();
        match result {
            Ok(frame) => {
                shared.failures.record_success();
                shared.frame = Arc::new(frame);
                shared.has_data = true;
                Outcome::Data(Arc::clone(&shared.frame))
            }
            Err(e) => {
                let verdict = shared.failures.record_failure(e.key());
                let consecutive = shared.failures.consecutive();
                match verdict {
                    Verdict::Persistent => {
                        warn!(
                            message = "state requests keep failing",
                            consecutive,
                            error = (&e as &dyn std::error::Error)
                        );
                        shared.has_data = false;
                    }
                    Verdict::Repeated => debug!(
                        message = "state request failed again",
                        consecutive,
                        error = (&e as &dyn std::error::Error)
                    ),
                    Verdict::New => info!(
                        message = "state request failed",
                        consecutive,
                        error = (&e as &dyn std::error::Error)
                    ),
                }
                Outcome::Failed(e, verdict)
            }
        }
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            {
                let mut shared = self.lock();
                if cancel.is_cancelled() {
                    break;
                }
                shared.state = PollerState::Fetching;
            }
            let outcome = self.cycle().await;
            if cancel.is_cancelled() {
                break;
            }
            let (mut callbacks, stop_on_persistent_error) = {
                let mut shared = self.lock();
                (shared.callbacks.take(), shared.stop_on_persistent_error)
            };
            let mut stop = false;
            if let Some(callbacks) = &mut callbacks {
                match &outcome {
                    Outcome::Data(frame) => {
                        if let Some(f) = &mut callbacks.on_success {
                            f(frame);
                        }
                    }
                    Outcome::Failed(e, Verdict::Persistent) => {
                        if let Some(f) = &mut callbacks.on_error {
                            f(e);
                        }
                        stop = stop_on_persistent_error;
                    }
                    Outcome::Failed(..) => {}
                }
            }
            let interval = {
                let mut shared = self.lock();
                if cancel.is_cancelled() {
                    break;
                }
                if stop {
                    info!(message = "stopping after a persistent failure", url = %self.url);
                    cancel.cancel();
                    shared.state = PollerState::Stopped;
                    break;
                }
                if shared.callbacks.is_none() {
                    shared.callbacks = callbacks;
                }
                shared.state = PollerState::Scheduled;
                shared.update_interval
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}
