//! Emergency reporting over a hub actor.
//!
//! A call connects the actor and, once the hub has registered it, emits an
//! `emergency` event every report interval. Each registration takes a new
//! report id, which every report until the next registration carries.

use crate::error_sink::ErrorSink;
use crate::settings::{Location, Settings, SettingsError};
use chrono::{DateTime, Local, TimeZone};
use hub_actor::{ActorConnection, ChannelOpener};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::*;

pub const EMERGENCY_EVENT: &str = "emergency";

const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%:z";

#[derive(Debug, Error)]
pub enum ReporterError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Connection(#[from] hub_actor::Error),
    #[error("Cannot reach hub at {address}")]
    Unreachable { address: String },
}

/// Report ids: increasing, never negative, wrapping back to zero.
#[derive(Debug, Clone)]
pub struct ReportIdSequence {
    next: i32,
}

impl ReportIdSequence {
    pub fn starting_at(next: i32) -> Self {
        Self { next }
    }

    pub fn random() -> Self {
        Self::starting_at(rand::thread_rng().gen_range(0..=i32::MAX))
    }

    pub fn next_id(&mut self) -> i32 {
        if self.next < 0 {
            self.next = 0;
        }
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        id
    }
}

pub fn format_date<Tz>(date: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    date.format(DATE_FORMAT).to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub id: i32,
    pub date: String,
    pub location: Option<[f64; 3]>,
    pub phone_number: Option<String>,
}

impl Report {
    pub fn to_data(&self) -> Result<Map<String, Value>, serde_json::Error> {
        serde_json::from_value(serde_json::to_value(self)?)
    }
}

struct ActiveCall {
    connection: Arc<ActorConnection>,
    reports: JoinHandle<()>,
    idle: watch::Receiver<bool>,
}

pub struct Reporter {
    settings: Settings,
    opener: Arc<dyn ChannelOpener>,
    errors: ErrorSink,
    report_ids: Arc<Mutex<ReportIdSequence>>,
    location: Arc<Mutex<Option<Location>>>,
    active: Mutex<Option<ActiveCall>>,
}

impl Reporter {
    pub fn new(settings: Settings, opener: Arc<dyn ChannelOpener>, errors: ErrorSink) -> Self {
        let location = settings.location;
        Self {
            settings,
            opener,
            errors,
            report_ids: Arc::new(Mutex::new(ReportIdSequence::random())),
            location: Arc::new(Mutex::new(location)),
            active: Mutex::new(None),
        }
    }

    pub fn with_report_ids(self, report_ids: ReportIdSequence) -> Self {
        *self.report_ids.lock() = report_ids;
        self
    }

    pub fn errors(&self) -> &ErrorSink {
        &self.errors
    }

    pub fn is_calling(&self) -> bool {
        self.active.lock().is_some()
    }

    pub fn connection(&self) -> Option<Arc<ActorConnection>> {
        self.active
            .lock()
            .as_ref()
            .map(|call| call.connection.clone())
    }

    /// Replaces the position attached to the following reports.
    pub fn update_location(&self, location: Option<Location>) {
        *self.location.lock() = location;
    }

    /// Starts reporting. Must be called from within a tokio runtime.
    ///
    /// Failures are also reported to the error sink.
    pub fn call(&self) -> Result<(), ReporterError> {
        let mut active = self.active.lock();
        if active.is_some() {
            info!("Already calling");
            return Ok(());
        }

        let identity = self.settings.identity().map_err(|err| {
            self.errors.report(err.to_string());
            err
        })?;
        if self.settings.phone_number.is_none() {
            self.errors
                .report("No destination configured: phone number is missing");
        }

        let connection = Arc::new(ActorConnection::new(identity, self.opener.clone())?);
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        connection.set_on_connection(move || {
            let _ = ready_tx.send(());
        });
        let (idle_tx, idle_rx) = watch::channel(false);
        connection.set_on_idle(move || {
            let _ = idle_tx.send(true);
        });

        connection.connect();
        if !connection.is_connecting() {
            let err = ReporterError::Unreachable {
                address: connection.identity().address.clone(),
            };
            self.errors.report(err.to_string());
            return Err(err);
        }

        let reports = tokio::spawn(
            ReportLoop {
                connection: connection.clone(),
                ready: ready_rx,
                report_ids: self.report_ids.clone(),
                location: self.location.clone(),
                phone_number: self.settings.phone_number.clone(),
                interval: Duration::from_secs(self.settings.report_interval_secs),
            }
            .run(),
        );
        info!(key = %connection.identity().key, "Calling");
        *active = Some(ActiveCall {
            connection,
            reports,
            idle: idle_rx,
        });
        Ok(())
    }

    /// Stops reporting and leaves the hub. `call` may be used again after.
    pub fn reset(&self) {
        self.stop();
    }

    /// Like [`Reporter::reset`], then waits up to `grace` for the hub to
    /// acknowledge the leave.
    pub async fn shutdown(&self, grace: Duration) {
        let Some(mut call) = self.stop() else {
            return;
        };
        match tokio::time::timeout(grace, call.idle.wait_for(|idle| *idle)).await {
            Ok(Ok(_)) => debug!("Left hub"),
            // the connection went away with its callback
            Ok(Err(_)) => {}
            Err(_) => {
                warn!(state = %call.connection.state(), "Hub did not acknowledge the leave")
            }
        };
    }

    fn stop(&self) -> Option<ActiveCall> {
        let Some(call) = self.active.lock().take() else {
            debug!("Not calling");
            return None;
        };
        call.reports.abort();
        call.connection.disconnect();
        info!("Reset");
        Some(call)
    }
}

impl Drop for Reporter {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ReportLoop {
    connection: Arc<ActorConnection>,
    ready: UnboundedReceiver<()>,
    report_ids: Arc<Mutex<ReportIdSequence>>,
    location: Arc<Mutex<Option<Location>>>,
    phone_number: Option<String>,
    interval: Duration,
}

impl ReportLoop {
    async fn run(mut self) {
        if self.ready.recv().await.is_none() {
            return;
        }
        let mut id = self.report_ids.lock().next_id();
        info!(id, "Registered with hub, reporting");

        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.connection.is_connecting() {
                        info!(id, "Actor gone, reports stopped");
                        return;
                    }
                    self.send(id);
                }
                notified = self.ready.recv() => match notified {
                    Some(()) => {
                        id = self.report_ids.lock().next_id();
                        info!(id, "Registered again, reporting");
                        ticker = tokio::time::interval(self.interval);
                    }
                    None => return,
                },
            }
        }
    }

    fn send(&self, id: i32) {
        let report = Report {
            id,
            date: format_date(&Local::now()),
            location: self.location.lock().map(|location| location.as_array()),
            phone_number: self.phone_number.clone(),
        };
        match report.to_data() {
            Ok(data) => {
                self.connection.emit(EMERGENCY_EVENT, Some(data));
                debug!(id, date = %report.date, "Sent report");
            }
            Err(err) => warn!(id, "Failed to encode report: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;
    use hub_actor::protocol::{greeting_events, remote_events};
    use hub_actor::testing::{MockChannel, MockOpener};
    use hub_actor::ConnectionState;
    use serde_json::json;

    const INTERVAL: Duration = Duration::from_secs(10);

    fn settings() -> Settings {
        Settings {
            server: Some("loopback://hub".to_string()),
            actor_suffix: Some("42".to_string()),
            phone_number: Some("+1-555-0100".to_string()),
            location: Some(Location {
                latitude: 35.5,
                longitude: 139.25,
                altitude: 12.0,
            }),
            ..Settings::default()
        }
    }

    fn reporter(settings: Settings, opener: &Arc<MockOpener>) -> Reporter {
        Reporter::new(settings, opener.clone(), ErrorSink::new())
            .with_report_ids(ReportIdSequence::starting_at(7))
    }

    fn register(channel: &MockChannel) {
        channel.fire_connect();
        assert_eq!(channel.ack_next().as_deref(), Some(greeting_events::HI));
        assert_eq!(channel.ack_next().as_deref(), Some(remote_events::SPEC));
    }

    fn reports(channel: &MockChannel) -> Vec<Value> {
        channel
            .sent()
            .into_iter()
            .filter(|message| message.event == remote_events::PIPE)
            .map(|message| message.payload)
            .collect()
    }

    /// Lets the report loop pick up whatever is ready without moving time
    /// past the next tick.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[test]
    fn test_report_id_sequence_wraps_to_zero() {
        let mut ids = ReportIdSequence::starting_at(i32::MAX - 1);
        assert_eq!(ids.next_id(), i32::MAX - 1);
        assert_eq!(ids.next_id(), i32::MAX);
        assert_eq!(ids.next_id(), 0);
        assert_eq!(ids.next_id(), 1);

        let mut ids = ReportIdSequence::starting_at(-3);
        assert_eq!(ids.next_id(), 0);

        assert!(ReportIdSequence::random().next_id() >= 0);
    }

    #[test]
    fn test_format_date() {
        let date = FixedOffset::east_opt(9 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 7, 8, 5, 9)
            .unwrap()
            + chrono::Duration::milliseconds(42);
        assert_eq!(format_date(&date), "2024-03-07T08:05:09.042+09:00");
    }

    #[test]
    fn test_report_payload_keeps_nulls() {
        let report = Report {
            id: 3,
            date: "2024-03-07T08:05:09.042+09:00".to_string(),
            location: None,
            phone_number: None,
        };
        assert_eq!(
            Value::Object(report.to_data().unwrap()),
            json!({
                "id": 3,
                "date": "2024-03-07T08:05:09.042+09:00",
                "location": null,
                "phoneNumber": null,
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_after_registration() {
        let opener = MockOpener::new();
        let reporter = reporter(settings(), &opener);
        reporter.call().unwrap();
        assert!(reporter.is_calling());
        assert!(reporter.errors().is_empty());

        let channel = opener.last().unwrap();
        settle().await;
        assert!(reports(&channel).is_empty());

        register(&channel);
        settle().await;
        assert_eq!(reports(&channel).len(), 1);

        tokio::time::sleep(INTERVAL * 3).await;
        let sent = reports(&channel);
        assert_eq!(sent.len(), 4);
        for payload in &sent {
            assert_eq!(payload["key"], "reporter:42");
            assert_eq!(payload["module"], "reporter");
            assert_eq!(payload["event"], EMERGENCY_EVENT);
            assert_eq!(payload["data"]["id"], 7);
            assert_eq!(payload["data"]["location"], json!([35.5, 139.25, 12.0]));
            assert_eq!(payload["data"]["phoneNumber"], "+1-555-0100");
            assert!(payload["data"]["date"].is_string());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_stops_reports_and_leaves() {
        let opener = MockOpener::new();
        let reporter = reporter(settings(), &opener);
        reporter.call().unwrap();
        let channel = opener.last().unwrap();
        register(&channel);
        settle().await;

        reporter.reset();
        assert!(!reporter.is_calling());
        assert_eq!(
            channel.sent_events().last().map(String::as_str),
            Some(greeting_events::BYE)
        );

        tokio::time::sleep(INTERVAL * 3).await;
        assert_eq!(reports(&channel).len(), 1);

        assert_eq!(channel.ack_next().as_deref(), Some(greeting_events::BYE));
        assert_eq!(channel.disconnect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_again_takes_next_id() {
        let opener = MockOpener::new();
        let reporter = reporter(settings(), &opener);

        reporter.call().unwrap();
        let first = opener.last().unwrap();
        register(&first);
        settle().await;
        reporter.reset();
        first.ack_next();

        reporter.call().unwrap();
        assert_eq!(opener.open_count(), 2);
        let second = opener.last().unwrap();
        register(&second);
        settle().await;

        assert_eq!(reports(&first)[0]["data"]["id"], 7);
        assert_eq!(reports(&second)[0]["data"]["id"], 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_call_is_ignored() {
        let opener = MockOpener::new();
        let reporter = reporter(settings(), &opener);
        reporter.call().unwrap();
        reporter.call().unwrap();
        assert_eq!(opener.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_reconnect_takes_next_report_id() {
        let opener = MockOpener::new();
        let reporter = reporter(settings(), &opener);
        reporter.call().unwrap();
        let channel = opener.last().unwrap();
        register(&channel);
        settle().await;

        register(&channel);
        settle().await;
        tokio::time::sleep(INTERVAL).await;

        register(&channel);
        settle().await;

        let ids = reports(&channel)
            .iter()
            .map(|payload| payload["data"]["id"].clone())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![json!(7), json!(8), json!(8), json!(9)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_server_is_reported() {
        let opener = MockOpener::new();
        let reporter = reporter(
            Settings {
                server: None,
                ..settings()
            },
            &opener,
        );

        assert!(matches!(
            reporter.call(),
            Err(ReporterError::Settings(SettingsError::MissingServer))
        ));
        assert_eq!(
            reporter.errors().latest().as_deref(),
            Some("No hub address configured")
        );
        assert!(!reporter.is_calling());
        assert_eq!(opener.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_hub_is_reported() {
        let opener = MockOpener::new();
        opener.refuse_with(Some("offline"));
        let reporter = reporter(settings(), &opener);

        assert!(matches!(
            reporter.call(),
            Err(ReporterError::Unreachable { .. })
        ));
        assert_eq!(
            reporter.errors().latest().as_deref(),
            Some("Cannot reach hub at loopback://hub")
        );
        assert!(!reporter.is_calling());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_phone_number_still_reports() {
        let opener = MockOpener::new();
        let reporter = reporter(
            Settings {
                phone_number: None,
                ..settings()
            },
            &opener,
        );
        reporter.call().unwrap();
        assert!(reporter
            .errors()
            .latest()
            .unwrap()
            .starts_with("No destination configured"));

        let channel = opener.last().unwrap();
        register(&channel);
        settle().await;
        assert_eq!(reports(&channel)[0]["data"]["phoneNumber"], Value::Null);
    }

    #[tokio::test(start_paused = true)]
    async fn test_location_updates_apply_to_next_report() {
        let opener = MockOpener::new();
        let reporter = reporter(settings(), &opener);
        reporter.call().unwrap();
        let channel = opener.last().unwrap();
        register(&channel);
        settle().await;

        reporter.update_location(None);
        tokio::time::sleep(INTERVAL).await;

        let sent = reports(&channel);
        assert_eq!(sent.len(), 2);
        assert!(sent[0]["data"]["location"].is_array());
        assert_eq!(sent[1]["data"]["location"], Value::Null);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_stop_when_actor_leaves() {
        let opener = MockOpener::new();
        let reporter = reporter(settings(), &opener);
        reporter.call().unwrap();
        let channel = opener.last().unwrap();
        register(&channel);
        settle().await;

        reporter.connection().unwrap().disconnect();
        tokio::time::sleep(INTERVAL * 2).await;
        assert_eq!(reports(&channel).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_leave() {
        let opener = MockOpener::new();
        let reporter = reporter(settings(), &opener);
        reporter.call().unwrap();
        let channel = opener.last().unwrap();
        register(&channel);
        let connection = reporter.connection().unwrap();

        // the hub never answers
        reporter.shutdown(Duration::from_millis(100)).await;
        assert_eq!(connection.state(), ConnectionState::Disconnecting);
        assert_eq!(channel.discard_pending_acks(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_returns_on_leave_ack() {
        let opener = MockOpener::new();
        let reporter = reporter(settings(), &opener);
        reporter.call().unwrap();
        let channel = opener.last().unwrap();
        register(&channel);
        let connection = reporter.connection().unwrap();

        let hub = channel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            hub.ack_next();
        });

        let started = tokio::time::Instant::now();
        reporter.shutdown(Duration::from_secs(5)).await;
        assert_eq!(connection.state(), ConnectionState::Idle);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(channel.disconnect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_before_greeting_returns_at_once() {
        let opener = MockOpener::new();
        let reporter = reporter(settings(), &opener);
        reporter.call().unwrap();
        let connection = reporter.connection().unwrap();

        let started = tokio::time::Instant::now();
        reporter.shutdown(Duration::from_secs(5)).await;
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(connection.state(), ConnectionState::Idle);
    }
}
