//! Periodically polled metric values.
//!
//! A [`PollingValue`] pairs a [`Poller`], which produces the current value of something, with a [`MetricSink`], which
//! publishes it. Once spawned, the poller is run on a fixed schedule and every result is pushed into the sink. A failed
//! poll or a rejected update is logged, and the next cycle runs as normal.
#![deny(warnings)]
#![deny(missing_docs)]

use std::{any::Any, fmt, marker::PhantomData, sync::Arc, time::Duration};

use mmv_writer::{MetricFormat, MetricName, MetricWriter, MmvFormat, WriterError};
use snafu::{ensure, Report, ResultExt as _, Snafu};
use tokio::{
    task::JoinHandle,
    time::{interval_at, Instant},
};
use tracing::{debug, error};

/// A generic error.
pub type GenericError = anyhow::Error;

/// Shortest interval at which a value may be polled.
pub const MIN_UPDATE_INTERVAL: Duration = Duration::from_millis(250);

/// A polling error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum PollingError {
    /// The polling interval is shorter than [`MIN_UPDATE_INTERVAL`].
    #[snafu(display(
        "polling interval of {:?} for '{}' is shorter than the minimum of {:?}",
        interval,
        name,
        MIN_UPDATE_INTERVAL
    ))]
    IntervalTooShort {
        /// Name of the polled value.
        name: String,

        /// Requested interval.
        interval: Duration,
    },

    /// The poller failed to produce a value.
    #[snafu(display("failed to poll '{}'", name))]
    Poll {
        /// Name of the polled value.
        name: String,

        /// Error source.
        source: GenericError,
    },

    /// The sink rejected a polled value.
    #[snafu(display("failed to publish polled value for '{}'", name))]
    Publish {
        /// Name of the polled value.
        name: String,

        /// Error source.
        source: WriterError,
    },
}

/// A source of values.
pub trait Poller<T>: Send + 'static {
    /// Returns the current value.
    ///
    /// # Errors
    ///
    /// If the value cannot be determined, an error is returned.
    fn poll(&mut self) -> Result<T, GenericError>;
}

impl<T, F> Poller<T> for F
where
    F: FnMut() -> Result<T, GenericError> + Send + 'static,
{
    fn poll(&mut self) -> Result<T, GenericError> {
        self()
    }
}

/// Somewhere to publish values.
///
/// Setting a value overwrites whatever was there before. No history is kept.
pub trait MetricSink<T>: Send + Sync + 'static {
    /// Publishes `value`.
    ///
    /// # Errors
    ///
    /// If the value cannot be published, an error is returned.
    fn set(&self, value: T) -> Result<(), WriterError>;
}

/// A [`MetricSink`] that updates one metric of a started [`MetricWriter`].
pub struct WriterSink<F: MetricFormat = MmvFormat> {
    writer: Arc<MetricWriter<F>>,
    name: MetricName,
}

impl<F: MetricFormat> WriterSink<F> {
    /// Creates a new `WriterSink` that updates `name` in `writer`.
    pub fn new(writer: Arc<MetricWriter<F>>, name: MetricName) -> Self {
        Self { writer, name }
    }

    /// Returns the name of the metric this sink updates.
    pub fn name(&self) -> &MetricName {
        &self.name
    }
}

impl<T, F> MetricSink<T> for WriterSink<F>
where
    T: Any,
    F: MetricFormat,
{
    fn set(&self, value: T) -> Result<(), WriterError> {
        self.writer.update_metric(&self.name, &value)
    }
}

impl<F: MetricFormat> fmt::Debug for WriterSink<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterSink")
            .field("writer", &self.writer)
            .field("name", &self.name)
            .finish()
    }
}

/// A value that is polled on a fixed schedule and published to a sink.
pub struct PollingValue<T, P, S> {
    name: String,
    interval: Duration,
    poller: P,
    sink: S,
    _value: PhantomData<fn() -> T>,
}

impl<T, P, S> PollingValue<T, P, S>
where
    T: Send + 'static,
    P: Poller<T>,
    S: MetricSink<T>,
{
    /// Creates a new `PollingValue`.
    ///
    /// # Errors
    ///
    /// If `interval` is shorter than [`MIN_UPDATE_INTERVAL`], an error is returned.
    pub fn new<N: Into<String>>(name: N, interval: Duration, poller: P, sink: S) -> Result<Self, PollingError> {
        let name = name.into();
        ensure!(interval >= MIN_UPDATE_INTERVAL, IntervalTooShort { name, interval });

        Ok(Self {
            name,
            interval,
            poller,
            sink,
            _value: PhantomData,
        })
    }

    /// Returns the name of the polled value.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the polling interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Polls once and publishes the result.
    ///
    /// # Errors
    ///
    /// If polling fails, or the sink rejects the value, an error is returned.
    pub fn run_once(&mut self) -> Result<(), PollingError> {
        let value = self.poller.poll().context(Poll { name: &self.name })?;
        self.sink.set(value).context(Publish { name: &self.name })
    }

    fn run_logged(&mut self) {
        if let Err(e) = self.run_once() {
            error!(error = %Report::from_error(e), "Failed to update polled value. Will retry next cycle.");
        }
    }

    /// Spawns a task that polls immediately and then once every interval, at a fixed rate.
    ///
    /// Errors are logged and do not stop the schedule. The task runs until the returned handle is stopped or dropped.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn spawn(mut self) -> PollingHandle {
        let name = self.name.clone();
        let interval = self.interval;
        let task = tokio::spawn(async move {
            self.run_logged();

            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            loop {
                ticker.tick().await;
                self.run_logged();
            }
        });

        debug!(name = %name, interval = ?interval, "Spawned polling task.");
        PollingHandle { name, task }
    }
}

impl<T, P, S> fmt::Debug for PollingValue<T, P, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingValue")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

/// Handle to a spawned [`PollingValue`].
///
/// Dropping the handle stops the polling task.
#[derive(Debug)]
pub struct PollingHandle {
    name: String,
    task: JoinHandle<()>,
}

impl PollingHandle {
    /// Returns the name of the polled value.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops the polling task.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for PollingHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
