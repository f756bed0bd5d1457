use std::sync::Arc;

use crate::connection::{self, HttpTransport};
use crate::output::{self, KeyValue};
use crate::poll::{self, Poller};

fn runtime() -> Result<tokio::runtime::Runtime, std::io::Error> {
    tokio::runtime::Builder::new_current_thread().enable_all().build()
}

fn poller(args: &connection::Args, poll: &poll::Args) -> Result<(Arc<HttpTransport>, Poller<HttpTransport>), connection::Error> {
    let transport = Arc::new(HttpTransport::new(args)?);
    let poller = Poller::new(Arc::clone(&transport), &args.url, poll);
    Ok((transport, poller))
}

pub mod read {
    use super::*;
    use crate::category::Category;
    use crate::frame::Frame;
    use std::pin::pin;
    use tracing::{debug, error};

    /// Read the current state of the controller.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        poll: poll::Args,
        #[clap(flatten)]
        output: output::Args,
        /// Only print the columns of this category.
        #[arg(long, short = 'c')]
        category: Option<Category>,
        /// Skip columns labelled `n.a.`.
        #[arg(long, short = 'a')]
        active_only: bool,
        /// Keep polling and print every frame until interrupted.
        #[arg(long, short = 'w')]
        watch: bool,
        /// Print the system info record instead of the columns.
        #[arg(long)]
        sys_info: bool,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not connect to the controller")]
        Connection(#[source] connection::Error),
        #[error(transparent)]
        Output(output::Error),
        #[error("could not read the controller state")]
        Poll(#[source] poll::Error),
        #[error("could not listen for the interrupt signal")]
        Signal(#[source] std::io::Error),
    }

    fn print(args: &Args, output: &mut output::Output, frame: &Frame) -> Result<(), Error> {
        if args.sys_info {
            let pairs = frame.sys_info.to_key_values();
            for (key, value) in pairs {
                output.record(&KeyValue::new(key, value)).map_err(Error::Output)?;
            }
        } else {
            let columns = match args.category {
                Some(category) => frame.objects_by_category(category, args.active_only),
                None if args.active_only => frame.objects(&frame.active, true),
                None => frame.objects.iter().collect(),
            };
            output.records(columns).map_err(Error::Output)?;
        }
        output.flush().map_err(Error::Output)
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let mut output = args.output.clone().to_output().map_err(Error::Output)?;
        let (_, poller) = poller(&args.connection, &args.poll).map_err(Error::Connection)?;
        runtime().map_err(Error::Runtime)?.block_on(async {
            if !args.watch {
                let frame = poller.update().await.map_err(Error::Poll)?;
                return print(&args, &mut output, &frame);
            }
            let (frames, mut received) = tokio::sync::mpsc::unbounded_channel();
            let callbacks = poll::Callbacks::new()
                .on_success(move |frame| {
                    if frames.send(Arc::clone(frame)).is_err() {
                        debug!(message = "frame receiver is gone, dropping frame");
                    }
                })
                .on_error(|e| {
                    error!(
                        message = "controller state is unavailable",
                        error = (e as &dyn std::error::Error)
                    )
                });
            poller.start(callbacks, false);
            let mut interrupt = pin!(tokio::signal::ctrl_c());
            let result = loop {
                tokio::select! {
                    frame = received.recv() => {
                        let Some(frame) = frame else { break Ok(()) };
                        if let Err(e) = print(&args, &mut output, &frame) {
                            break Err(e);
                        }
                    }
                    signal = &mut interrupt => break signal.map_err(Error::Signal),
                }
            };
            poller.stop();
            result
        })
    }
}

pub mod relay {
    use super::*;
    use crate::relay::{RelayColumn as _, RelayState};
    use crate::services::{self, UsrcfgService};
    use tracing::warn;

    /// Switch a relay on, off, or back to automatic control.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        output: output::Args,
        /// Column id or label of the relay.
        relay: String,
        /// One of `on`, `off` or `auto`.
        state: RelayState,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not connect to the controller")]
        Connection(#[source] connection::Error),
        #[error(transparent)]
        Output(output::Error),
        #[error("could not read the controller state")]
        Poll(#[source] poll::Error),
        #[error("no relay matches {0:?}")]
        UnknownRelay(String),
        #[error("could not switch relay {1}")]
        Switch(#[source] services::Error, usize),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let mut output = args.output.clone().to_output().map_err(Error::Output)?;
        let (transport, poller) =
            poller(&args.connection, &poll::Args::default()).map_err(Error::Connection)?;
        let usrcfg = UsrcfgService::new(transport, &args.connection.url);
        runtime().map_err(Error::Runtime)?.block_on(async {
            let frame = poller.update().await.map_err(Error::Poll)?;
            let relay = match args.relay.parse::<usize>() {
                Ok(id) => frame.objects.get(id),
                Err(_) => frame.object_by_label(&args.relay),
            }
            .ok_or_else(|| Error::UnknownRelay(args.relay.clone()))?;
            let change = usrcfg
                .set_state(&frame, relay, args.state)
                .await
                .map_err(|e| Error::Switch(e, relay.id))?;
            let read_back = match poller.update().await {
                Ok(fresh) => fresh.object(relay.id).raw_bits().to_string(),
                Err(e) => {
                    warn!(
                        message = "could not read the relay back",
                        error = (&e as &dyn std::error::Error)
                    );
                    "unknown".to_string()
                }
            };
            output
                .records(&[
                    KeyValue::new("relay", relay.id),
                    KeyValue::new("label", &relay.label),
                    KeyValue::new("state", args.state),
                    KeyValue::new("ena", change.masks.ena_value()),
                    KeyValue::new("desiredRawValue", change.desired_raw_value),
                    KeyValue::new("rawValue", read_back),
                ])
                .map_err(Error::Output)?;
            output.flush().map_err(Error::Output)
        })
    }
}

pub mod dosage {
    use super::*;
    use crate::frame::DosageTarget;
    use crate::services::{self, CommandService};

    /// Run a manual dosage for a while.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        output: output::Args,
        /// One of `chlorine`, `ph-minus` or `ph-plus`.
        target: DosageTarget,
        /// How long to dose for, in whole seconds.
        duration: humantime::Duration,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not connect to the controller")]
        Connection(#[source] connection::Error),
        #[error(transparent)]
        Output(output::Error),
        #[error("could not start the {1} dosage")]
        Dosage(#[source] services::Error, DosageTarget),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let mut output = args.output.clone().to_output().map_err(Error::Output)?;
        let transport = Arc::new(HttpTransport::new(&args.connection).map_err(Error::Connection)?);
        let service = CommandService::new(transport, &args.connection.url);
        runtime().map_err(Error::Runtime)?.block_on(async {
            let duration = service
                .set_dosage(args.target, *args.duration)
                .await
                .map_err(|e| Error::Dosage(e, args.target))?;
            output
                .records(&[
                    KeyValue::new("target", args.target),
                    KeyValue::new("duration", humantime::format_duration(duration)),
                ])
                .map_err(Error::Output)?;
            output.flush().map_err(Error::Output)
        })
    }
}

pub mod timer {
    use super::*;
    use crate::services::{self, SetStateService};

    /// Switch a relay on for a while.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        output: output::Args,
        /// Relay number, counting from 1.
        #[arg(value_parser = clap::value_parser!(u32).range(1..))]
        relay_no: u32,
        /// How long to keep the relay on, in whole seconds.
        duration: humantime::Duration,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not connect to the controller")]
        Connection(#[source] connection::Error),
        #[error(transparent)]
        Output(output::Error),
        #[error("could not set the timer of relay {1}")]
        Timer(#[source] services::Error, u32),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let mut output = args.output.clone().to_output().map_err(Error::Output)?;
        let transport = Arc::new(HttpTransport::new(&args.connection).map_err(Error::Connection)?);
        let service = SetStateService::new(transport, &args.connection.url);
        runtime().map_err(Error::Runtime)?.block_on(async {
            let duration = service
                .set_timer(args.relay_no, *args.duration)
                .await
                .map_err(|e| Error::Timer(e, args.relay_no))?;
            output
                .records(&[
                    KeyValue::new("relay", args.relay_no),
                    KeyValue::new("duration", humantime::format_duration(duration)),
                ])
                .map_err(Error::Output)?;
            output.flush().map_err(Error::Output)
        })
    }
}
