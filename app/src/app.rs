use crate::error_sink::ErrorSink;
use crate::loopback::LoopbackHub;
use crate::reporter::Reporter;
use crate::settings::{Location, Settings, SuffixStore, Validate, DEFAULT_SUFFIX_FILE};
use clap::Parser;
use eyre::Result;
use futures::pin_mut;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use std::{future::Future, sync::Arc};
use tracing::*;
use tracing_subscriber::{prelude::*, EnvFilter};

const LEAVE_GRACE: Duration = Duration::from_secs(2);

#[inline]
pub fn run() -> Result<()> {
    App::parse().run()
}

#[derive(Parser)]
#[command(author, about = "Hub actor emergency reporter", long_about = None)]
pub struct App {
    #[arg(long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "HUB_SERVER", help = "Hub address, e.g. loopback://hub")]
    pub server: Option<String>,

    #[arg(long, env = "ACTOR_PREFIX")]
    pub actor_prefix: Option<String>,

    #[arg(long, env = "ACTOR_SUFFIX")]
    pub actor_suffix: Option<String>,

    #[arg(long, value_name = "PATH", default_value = DEFAULT_SUFFIX_FILE)]
    pub suffix_file: PathBuf,

    #[arg(long = "report-interval", env = "REPORT_INTERVAL_SECS", value_name = "SECS")]
    pub report_interval_secs: Option<u64>,

    #[arg(long, env = "PHONE_NUMBER")]
    pub phone_number: Option<String>,

    #[arg(long, value_name = "LAT,LON[,ALT]", value_parser = Location::from_str)]
    pub location: Option<Location>,

    #[arg(long = "full-log-context", env = "FULL_LOG_CONTEXT", default_value_t = false)]
    pub full_log_context: bool,
}

impl App {
    pub fn run(self) -> Result<()> {
        self.init_tracing();
        let tokio_runtime = tokio_runtime()?;
        tokio_runtime.block_on(self.execute())?;
        Ok(())
    }

    fn init_tracing(&self) {
        let rust_log_level = std::env::var("RUST_LOG")
            .ok()
            .and_then(|level| Level::from_str(&level).ok())
            .unwrap_or(Level::INFO);

        let filter = if self.full_log_context {
            EnvFilter::builder().parse_lossy(rust_log_level.as_str())
        } else {
            let filter_tag = format!("app={rust_log_level},hub_actor={rust_log_level}");
            EnvFilter::builder().parse_lossy(filter_tag.as_str())
        };

        let main_layer = tracing_subscriber::fmt::layer().with_target(true);

        let layers = if rust_log_level == Level::DEBUG || rust_log_level == Level::TRACE {
            vec![main_layer
                .with_file(true)
                .with_line_number(true)
                .with_filter(filter)
                .boxed()]
        } else {
            vec![main_layer.with_filter(filter).boxed()]
        };

        tracing_subscriber::registry().with(layers).init();
    }

    /// File settings first, then anything given on the command line or in
    /// the environment.
    fn settings(&self) -> Result<Settings> {
        let mut settings = Settings::load(self.config.as_deref())?;
        if let Some(server) = &self.server {
            settings.server = Some(server.clone());
        }
        if let Some(prefix) = &self.actor_prefix {
            settings.actor_prefix = prefix.clone();
        }
        if let Some(suffix) = &self.actor_suffix {
            settings.actor_suffix = Some(suffix.clone());
        }
        if let Some(interval) = self.report_interval_secs {
            settings.report_interval_secs = interval;
        }
        if let Some(phone_number) = &self.phone_number {
            settings.phone_number = Some(phone_number.clone());
        }
        if self.location.is_some() {
            settings.location = self.location;
        }
        settings.validate()?;
        settings.resolve_suffix(&SuffixStore::new(&self.suffix_file))?;
        Ok(settings)
    }

    /// Same as [`App::settings`], with failures also reported to `errors`.
    fn reported_settings(&self, errors: &ErrorSink) -> Result<Settings> {
        self.settings().map_err(|err| {
            errors.report(format!("Invalid settings: {err}"));
            err
        })
    }

    async fn execute(self) -> Result<()> {
        let errors = ErrorSink::new();
        let settings = self.reported_settings(&errors)?;
        info!(
            server = ?settings.server,
            key = %settings.actor_key()?,
            interval_secs = settings.report_interval_secs,
            "Starting reporter"
        );

        let hub = Arc::new(LoopbackHub::new(tokio::runtime::Handle::current()));
        let reporter = Reporter::new(settings, hub.clone(), errors.clone());

        let outcome = match reporter.call() {
            Ok(()) => run_until_ctrl_c(futures::future::pending::<Result<()>>()).await,
            Err(err) => Err(err.into()),
        };

        reporter.shutdown(LEAVE_GRACE).await;
        if let Some(err) = errors.latest() {
            info!(%err, "Last reported error");
        }
        debug!(actors = hub.actors().len(), piped = hub.piped_total(), "Hub state at exit");
        info!("Metrics:\n{}", hub_actor::metrics::gather_text());
        outcome
    }
}

pub fn tokio_runtime() -> Result<tokio::runtime::Runtime, std::io::Error> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
}

async fn run_until_ctrl_c<F, E>(fut: F) -> Result<(), E>
where
    F: Future<Output = Result<(), E>>,
    E: Send + Sync + 'static + From<std::io::Error>,
{
    let ctrl_c = tokio::signal::ctrl_c();

    let mut stream = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let sigterm = stream.recv();
    pin_mut!(sigterm, ctrl_c, fut);

    tokio::select! {
        _ = ctrl_c => {
            info!("Received ctrl-c");
        },
        _ = sigterm => {
            info!("Received SIGTERM");
        },
        res = fut => res?,
    }

    Ok(())
}
