//! Write endpoints of the controller.
//!
//! Every command is attempted up to [`ATTEMPTS`] times before giving up.

use crate::column::Column;
use crate::connection::{self, Request, Response, RetriesExhausted, Transport, endpoint_url, retrying};
use crate::frame::{DosageTarget, Frame};
use crate::relay::{self, RelayInterpreter, RelayMasks, RelayState, desired_raw_value};
use reqwest::Method;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub const ATTEMPTS: u32 = 3;

pub const COMMAND_ENDPOINT: &str = "/Command.htm";
pub const SET_STATE_ENDPOINT: &str = "/SetState.pl";
pub const USRCFG_ENDPOINT: &str = "/usrcfg.cgi";

/// Failure of a single attempt.
#[derive(thiserror::Error, Debug)]
pub enum RequestError {
    #[error("could not send the {0} command")]
    Send(&'static str, #[source] connection::Error),
    #[error("{command} command rejected with HTTP {status} {reason}: {body}")]
    Rejected { command: &'static str, status: u16, reason: String, body: String },
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("cannot determine the relay masks to send")]
    Relay(#[source] relay::Error),
    #[error(transparent)]
    Request(RetriesExhausted<RequestError>),
}

struct Endpoint<T> {
    transport: Arc<T>,
    url: String,
    command: &'static str,
}

impl<T: Transport> Endpoint<T> {
    fn new(transport: Arc<T>, base_url: &str, endpoint: &'static str, command: &'static str) -> Self {
        Self { transport, url: endpoint_url(base_url, endpoint), command }
    }

    async fn send(&self, request: Request) -> Result<Response, RequestError> {
        let response = self
            .transport
            .send(request)
            .await
            .map_err(|e| RequestError::Send(self.command, e))?;
        info!(
            message = "controller responded",
            command = self.command,
            status = response.status,
            body = %response.body
        );
        if !response.is_ok() {
            return Err(RequestError::Rejected {
                command: self.command,
                status: response.status,
                reason: response.reason,
                body: response.body,
            });
        }
        Ok(response)
    }

    async fn get(&self, query: &str) -> Result<(), Error> {
        let url = format!("{}?{query}", self.url);
        retrying(ATTEMPTS, move |_| {
            let request = Request { method: Method::GET, url: url.clone(), headers: HeaderMap::new(), body: None };
            self.send(request)
        })
        .await
        .map(drop)
        .map_err(Error::Request)
    }
}

/// Manual dosage via `/Command.htm`.
pub struct CommandService<T> {
    endpoint: Endpoint<T>,
}

impl<T: Transport> CommandService<T> {
    pub fn new(transport: Arc<T>, base_url: &str) -> Self {
        Self { endpoint: Endpoint::new(transport, base_url, COMMAND_ENDPOINT, "dosage") }
    }

    /// Run the given dosage for `duration`, truncated to whole seconds.
    ///
    /// Returns the duration actually requested.
    pub async fn set_dosage(&self, target: DosageTarget, duration: Duration) -> Result<Duration, Error> {
        let seconds = duration.as_secs();
        self.endpoint.get(&format!("MAN_DOSAGE={},{seconds}", target as u8)).await?;
        Ok(Duration::from_secs(seconds))
    }

    pub async fn set_chlorine_dosage(&self, duration: Duration) -> Result<Duration, Error> {
        self.set_dosage(DosageTarget::Chlorine, duration).await
    }

    pub async fn set_ph_minus_dosage(&self, duration: Duration) -> Result<Duration, Error> {
        self.set_dosage(DosageTarget::PhMinus, duration).await
    }

    pub async fn set_ph_plus_dosage(&self, duration: Duration) -> Result<Duration, Error> {
        self.set_dosage(DosageTarget::PhPlus, duration).await
    }
}

/// Relay on-timers via `/SetState.pl`.
pub struct SetStateService<T> {
    endpoint: Endpoint<T>,
}

impl<T: Transport> SetStateService<T> {
    pub fn new(transport: Arc<T>, base_url: &str) -> Self {
        Self { endpoint: Endpoint::new(transport, base_url, SET_STATE_ENDPOINT, "relay timer") }
    }

    /// Switch relay `relay_no` (counting from 1) on for `duration`, truncated to whole seconds.
    pub async fn set_timer(&self, relay_no: u32, duration: Duration) -> Result<Duration, Error> {
        let seconds = duration.as_secs();
        let millis = seconds * 1000;
        self.endpoint.get(&format!("R{relay_no}=1&RT{relay_no}={millis}")).await?;
        Ok(Duration::from_secs(seconds))
    }
}

/// What a successful relay switch sent, and what the relay should read afterwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub struct RelayStateChange {
    pub desired_raw_value: u16,
    pub masks: RelayMasks,
}

/// Relay switching via `/usrcfg.cgi`.
pub struct UsrcfgService<T> {
    endpoint: Endpoint<T>,
}

impl<T: Transport> UsrcfgService<T> {
    pub fn new(transport: Arc<T>, base_url: &str) -> Self {
        Self { endpoint: Endpoint::new(transport, base_url, USRCFG_ENDPOINT, "relay switch") }
    }

    /// Switch `relay`, keeping every other relay as it is in `frame`.
    ///
    /// `frame` should be as fresh as possible. Relays that changed since it was fetched are
    /// reverted to their state in it.
    pub async fn set_state(&self, frame: &Frame, relay: &Column, state: RelayState) -> Result<RelayStateChange, Error> {
        let masks = RelayInterpreter::new().evaluate(frame).set(relay, state).map_err(Error::Relay)?;
        info!(
            message = "switching relay",
            relay.id = relay.id,
            relay.label = %relay.label,
            %state,
            ena = %masks.ena_value()
        );
        let body = form_urlencoded::Serializer::new(String::new())
            .append_pair("ENA", &masks.ena_value())
            .append_pair("MANUAL", "1")
            .finish();
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/x-www-form-urlencoded; charset=UTF-8"));
        retrying(ATTEMPTS, move |_| {
            let request = Request {
                method: Method::POST,
                url: self.endpoint.url.clone(),
                headers: headers.clone(),
                body: Some(body.clone()),
            };
            self.endpoint.send(request)
        })
        .await
        .map_err(Error::Request)?;
        Ok(RelayStateChange { desired_raw_value: desired_raw_value(relay, state), masks })
    }

    pub async fn set_on(&self, frame: &Frame, relay: &Column) -> Result<RelayStateChange, Error> {
        self.set_state(frame, relay, RelayState::On).await
    }

    pub async fn set_off(&self, frame: &Frame, relay: &Column) -> Result<RelayStateChange, Error> {
        self.set_state(frame, relay, RelayState::Off).await
    }

    pub async fn set_auto(&self, frame: &Frame, relay: &Column) -> Result<RelayStateChange, Error> {
        self.set_state(frame, relay, RelayState::Auto).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::{ScriptedTransport, ok, refused, status};
    use crate::frame::tests::sample_csv;

    const BASE: &str = "http://pool.local/";

    #[tokio::test]
    async fn dosage_query() {
        let transport = Arc::new(ScriptedTransport::new([ok("")]));
        let service = CommandService::new(Arc::clone(&transport), BASE);
        let sent = service.set_ph_minus_dosage(Duration::from_millis(90_700)).await.unwrap();
        assert_eq!(sent, Duration::from_secs(90));
        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, Method::GET);
        assert_eq!(requests[0].url, "http://pool.local/Command.htm?MAN_DOSAGE=1,90");
    }

    #[tokio::test]
    async fn dosage_targets() {
        let transport = Arc::new(ScriptedTransport::new([ok(""), ok("")]));
        let service = CommandService::new(Arc::clone(&transport), BASE);
        service.set_chlorine_dosage(Duration::from_secs(5)).await.unwrap();
        service.set_ph_plus_dosage(Duration::from_secs(7)).await.unwrap();
        let urls: Vec<_> = transport.requests().into_iter().map(|r| r.url).collect();
        assert_eq!(urls, [
            "http://pool.local/Command.htm?MAN_DOSAGE=0,5",
            "http://pool.local/Command.htm?MAN_DOSAGE=2,7",
        ]);
    }

    #[tokio::test]
    async fn timer_query() {
        let transport = Arc::new(ScriptedTransport::new([ok("")]));
        let service = SetStateService::new(Arc::clone(&transport), BASE);
        service.set_timer(3, Duration::from_secs(60)).await.unwrap();
        assert_eq!(transport.requests()[0].url, "http://pool.local/SetState.pl?R3=1&RT3=60000");
    }

    #[tokio::test]
    async fn commands_are_retried() {
        let transport = Arc::new(ScriptedTransport::new([status(500), refused("x"), ok("")]));
        let service = SetStateService::new(Arc::clone(&transport), BASE);
        service.set_timer(1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(transport.requests().len(), 3);
    }

    #[tokio::test]
    async fn commands_give_up() {
        let transport = Arc::new(ScriptedTransport::new([status(500), status(500), status(503), ok("")]));
        let service = CommandService::new(Arc::clone(&transport), BASE);
        let err = service.set_chlorine_dosage(Duration::from_secs(1)).await.unwrap_err();
        let exhausted = match err {
            Error::Request(exhausted) => exhausted,
            other => panic!("unexpected error: {other}"),
        };
        assert_eq!(exhausted.attempts, ATTEMPTS);
        assert!(matches!(exhausted.last, RequestError::Rejected { status: 503, .. }));
        assert_eq!(transport.requests().len(), 3);
    }

    #[tokio::test]
    async fn relay_switch_posts_masks() {
        let frame = Frame::from_csv(&sample_csv(0, [3, 1, 2, 0, 0, 0, 0, 0], [0; 8])).unwrap();
        let transport = Arc::new(ScriptedTransport::new([ok("done")]));
        let service = UsrcfgService::new(Arc::clone(&transport), BASE);
        let change = service.set_on(&frame, &frame.object(19)).await.unwrap();
        assert_eq!(change.desired_raw_value, 3);
        assert_eq!((change.masks.mode, change.masks.state), (0b1101, 0b1011));
        let request = &transport.requests()[0];
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.url, "http://pool.local/usrcfg.cgi");
        assert_eq!(request.headers[CONTENT_TYPE], "application/x-www-form-urlencoded; charset=UTF-8");
        assert_eq!(request.body.as_deref(), Some("ENA=13%2C11&MANUAL=1"));
    }

    #[tokio::test]
    async fn relay_auto_keeps_on_bit() {
        let frame = Frame::from_csv(&sample_csv(0, [3, 0, 0, 0, 0, 0, 0, 0], [0; 8])).unwrap();
        let transport = Arc::new(ScriptedTransport::new([ok("")]));
        let service = UsrcfgService::new(Arc::clone(&transport), BASE);
        let change = service.set_auto(&frame, &frame.object(16)).await.unwrap();
        assert_eq!(change.desired_raw_value, 1);
        assert_eq!(transport.requests()[0].body.as_deref(), Some("ENA=0%2C0&MANUAL=1"));
    }

    #[tokio::test]
    async fn non_relays_are_not_sent() {
        let frame = Frame::from_csv(&sample_csv(0, [0; 8], [0; 8])).unwrap();
        let transport = Arc::new(ScriptedTransport::new([]));
        let service = UsrcfgService::new(Arc::clone(&transport), BASE);
        let err = service.set_off(&frame, &frame.object(8)).await.unwrap_err();
        assert!(matches!(err, Error::Relay(relay::Error::NotARelay(8))));
        assert!(transport.requests().is_empty());
    }
}
