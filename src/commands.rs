use std::path::PathBuf;

use crate::b524::{EchoHeader, RegisterOpcode};
use crate::schema::{LeafNames, Schema};
use crate::transport::ebusd::{self, EbusdTransport};
use crate::transport::fixture::{self, FixtureTransport};
use crate::transport::{self, Transport};

fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread().enable_all().build()
}

/// Where requests go: an ebusd daemon, or a JSON fixture replayed offline.
#[derive(clap::Parser, Clone, Debug)]
#[group(id = "commands::TransportArgs")]
pub struct TransportArgs {
    #[clap(flatten)]
    ebusd: ebusd::Args,

    /// Answer requests from this fixture (e.g. an earlier scan artifact) instead of ebusd.
    #[arg(long)]
    fixture: Option<PathBuf>,
}

impl TransportArgs {
    async fn connect(self) -> Result<Backend, fixture::LoadError> {
        Ok(match self.fixture {
            Some(path) => Backend::Fixture(FixtureTransport::load(&path).await?),
            None => Backend::Ebusd(EbusdTransport::new(self.ebusd.into())),
        })
    }
}

enum Backend {
    Ebusd(EbusdTransport),
    Fixture(FixtureTransport),
}

impl Transport for Backend {
    async fn send_proto(
        &mut self,
        destination: u8,
        primary: u8,
        secondary: u8,
        payload: &[u8],
    ) -> Result<Vec<u8>, transport::Error> {
        match self {
            Self::Ebusd(t) => t.send_proto(destination, primary, secondary, payload).await,
            Self::Fixture(t) => t.send_proto(destination, primary, secondary, payload).await,
        }
    }

    fn echo_header(&self, opcode: RegisterOpcode) -> EchoHeader {
        match self {
            Self::Ebusd(t) => t.echo_header(opcode),
            Self::Fixture(t) => t.echo_header(opcode),
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum Opcode {
    Local,
    Remote,
}

impl From<Opcode> for RegisterOpcode {
    fn from(opcode: Opcode) -> Self {
        match opcode {
            Opcode::Local => Self::Local,
            Opcode::Remote => Self::Remote,
        }
    }
}

/// The address of one register, as given on the command line.
#[derive(clap::Parser, Clone, Debug)]
#[group(id = "commands::RegisterArgs")]
pub struct RegisterArgs {
    /// The eBUS address of the regulator.
    #[arg(long, default_value = "0x15", value_parser = crate::plan::parse_id::<u8>)]
    dst: u8,
    #[arg(long, value_parser = crate::plan::parse_id::<u8>)]
    group: u8,
    #[arg(long, default_value = "0", value_parser = crate::plan::parse_id::<u8>)]
    instance: u8,
    #[arg(long, value_parser = crate::plan::parse_id::<u16>)]
    register: u16,
    /// The register family. Defaults to the one the known-groups table lists for the group.
    #[arg(long, value_enum)]
    opcode: Option<Opcode>,
    #[clap(flatten)]
    schema: SchemaArgs,
}

impl RegisterArgs {
    fn opcode(&self) -> RegisterOpcode {
        self.opcode
            .map(RegisterOpcode::from)
            .unwrap_or_else(|| crate::groups::GroupProfile::lookup(self.group).opcode)
    }
}

/// Register metadata sources.
#[derive(clap::Parser, Clone, Debug)]
#[group(id = "commands::SchemaArgs")]
pub struct SchemaArgs {
    /// A CSV schema naming and typing the registers.
    #[arg(long)]
    schema: Option<PathBuf>,

    /// A `group,instance,register,leaf` CSV mapping registers to myVaillant names. An instance
    /// of `*` matches every instance.
    #[arg(long)]
    myvaillant_map: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum SchemaError {
    #[error("could not load the schema")]
    Schema(#[source] crate::schema::Error),
    #[error("could not load the myVaillant map")]
    LeafNames(#[source] crate::schema::leaf_names::Error),
}

impl SchemaArgs {
    async fn load(&self) -> Result<Schema, SchemaError> {
        let schema = match &self.schema {
            Some(path) => Schema::load(path).await.map_err(SchemaError::Schema)?,
            None => Schema::empty(),
        };
        Ok(match &self.myvaillant_map {
            Some(path) => {
                let leaf_names = LeafNames::load(path).await.map_err(SchemaError::LeafNames)?;
                schema.with_leaf_names(leaf_names)
            }
            None => schema,
        })
    }
}

pub mod scan {
    use std::io::Write as _;
    use std::path::PathBuf;
    use std::sync::Arc;

    use futures::StreamExt as _;
    use tokio::sync::broadcast;
    use tokio_stream::wrappers::BroadcastStream;
    use tokio_util::sync::CancellationToken;
    use tokio_util::task::AbortOnDropHandle;
    use tracing::{info, warn};

    use crate::discovery::{self, Engine};
    use crate::progress::{self, ProgressEvent, StatusLine};
    use crate::schema;
    use crate::session::ScanSession;
    use crate::transport::{Transport, fixture};

    /// Discover the register map of a regulator and save it as JSON.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        transport: super::TransportArgs,

        #[clap(flatten)]
        discovery: discovery::Args,

        #[clap(flatten)]
        schema: super::SchemaArgs,

        /// Where to save the scan. Defaults to `b524_scan_0x<dst>_<timestamp>.json`.
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,

        /// Do not render the live status line.
        #[arg(long, short = 'q')]
        quiet: bool,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error(transparent)]
        Schema(super::SchemaError),
        #[error("could not load the fixture")]
        Fixture(#[source] fixture::LoadError),
        #[error("the scan was aborted, a partial result was saved to {1:?}")]
        Scan(#[source] discovery::Error, PathBuf),
        #[error("could not serialize the scan")]
        SerializeJson(#[source] serde_json::Error),
        #[error("could not save the scan to {1:?}")]
        Save(#[source] std::io::Error, PathBuf),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        super::runtime().map_err(Error::Runtime)?.block_on(async move {
            let Args { transport, discovery, schema, output, quiet } = args;
            let schema = schema.load().await.map_err(Error::Schema)?;
            let transport = transport.connect().await.map_err(Error::Fixture)?;
            scan(transport, schema, discovery.into(), output, quiet).await
        })
    }

    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Signal {
        Interrupt,
        Terminate,
    }

    struct Signals {
        #[cfg(unix)]
        terminate: Option<tokio::signal::unix::Signal>,
    }

    impl Signals {
        fn new() -> Self {
            Self {
                #[cfg(unix)]
                terminate: tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate(),
                )
                .ok(),
            }
        }

        async fn next(&mut self) -> Signal {
            #[cfg(unix)]
            if let Some(terminate) = &mut self.terminate {
                return tokio::select! {
                    _ = interrupted() => Signal::Interrupt,
                    _ = terminate.recv() => Signal::Terminate,
                };
            }
            interrupted().await;
            Signal::Interrupt
        }
    }

    async fn interrupted() {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    async fn show_status(receiver: broadcast::Receiver<ProgressEvent>) {
        let mut events = BroadcastStream::new(receiver);
        let mut status = StatusLine::default();
        let mut stderr = std::io::stderr();
        while let Some(event) = events.next().await {
            // Lagging behind only costs intermediate renderings.
            let Ok(event) = event else { continue };
            status.apply(&event);
            let _ = write!(stderr, "\r{}\x1b[K", status.render());
            let _ = stderr.flush();
        }
        let _ = writeln!(stderr);
    }

    pub fn default_path(destination: u8, started_at: jiff::Timestamp) -> PathBuf {
        let stamp = started_at.strftime("%Y%m%dT%H%M%SZ");
        PathBuf::from(format!("b524_scan_0x{destination:02x}_{stamp}.json"))
    }

    async fn save(session: &ScanSession, path: &PathBuf) -> Result<(), Error> {
        let artifact = session.artifact();
        let json = serde_json::to_vec_pretty(&artifact).map_err(Error::SerializeJson)?;
        tokio::fs::write(path, json).await.map_err(|e| Error::Save(e, path.clone()))?;
        info!(
            message = "saved scan",
            path = ?path,
            incomplete = artifact.meta.incomplete,
            registers = session.registers.len(),
        );
        Ok(())
    }

    async fn scan<T: Transport>(
        transport: T,
        schema: schema::Schema,
        config: discovery::Config,
        output: Option<PathBuf>,
        quiet: bool,
    ) -> Result<(), Error> {
        let destination = config.destination;
        let (events, receiver) = progress::channel();
        let status = if quiet {
            drop(receiver);
            None
        } else {
            Some(AbortOnDropHandle::new(tokio::spawn(show_status(receiver))))
        };
        let mut engine = Engine::new(transport, Arc::new(schema), config, events);
        let mut session = ScanSession::new(destination);
        let cancel = CancellationToken::new();
        let mut signals = Signals::new();

        let result = {
            let run = engine.run(&mut session, &cancel);
            tokio::pin!(run);
            loop {
                tokio::select! {
                    result = &mut run => break Some(result),
                    signal = signals.next() => {
                        if signal == Signal::Terminate || cancel.is_cancelled() {
                            break None;
                        }
                        warn!(
                            message = "interrupted, stopping after the current probe; \
                                       interrupt again to save and exit immediately"
                        );
                        cancel.cancel();
                    }
                }
            }
        };
        // Closes the progress channel so the status line finishes.
        drop(engine);
        if let Some(status) = status {
            let _ = status.await;
        }

        let path = output.unwrap_or_else(|| default_path(destination, session.started_at));
        match result {
            Some(Ok(_)) => save(&session, &path).await,
            Some(Err(error)) => {
                session.finalize_forced(format!("aborted: {error}"));
                save(&session, &path).await?;
                Err(Error::Scan(error, path))
            }
            None => {
                warn!(message = "terminated, saving what was collected so far");
                session.finalize_forced("terminated by signal".to_string());
                save(&session, &path).await
            }
        }
    }
}

pub mod read {
    use std::sync::Arc;

    use crate::discovery::{self, Engine};
    use crate::output;
    use crate::session::ScanSession;
    use crate::transport::fixture;

    /// Read a single register.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        transport: super::TransportArgs,
        #[clap(flatten)]
        register: super::RegisterArgs,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error(transparent)]
        Schema(super::SchemaError),
        #[error("could not load the fixture")]
        Fixture(#[source] fixture::LoadError),
        #[error("could not read the register")]
        Read(#[source] discovery::Error),
        #[error("could not output the register")]
        Output(#[source] output::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        super::runtime().map_err(Error::Runtime)?.block_on(async move {
            let Args { transport, register, output } = args;
            let schema = register.schema.load().await.map_err(Error::Schema)?;
            let transport = transport.connect().await.map_err(Error::Fixture)?;
            let (events, _) = crate::progress::channel();
            let config = discovery::Config::new(register.dst);
            let mut engine = Engine::new(transport, Arc::new(schema), config, events);
            let mut session = ScanSession::new(register.dst);
            let record = engine
                .read_register(
                    &mut session,
                    register.opcode(),
                    register.group,
                    register.instance,
                    register.register,
                )
                .await
                .map_err(Error::Read)?;
            let mut output = output.into_output().map_err(Error::Output)?;
            output.table_headers(&output::RECORD_HEADERS);
            output.record(&record).map_err(Error::Output)?;
            output.commit().map_err(Error::Output)
        })
    }
}

pub mod write {
    use std::sync::Arc;

    use crate::b524;
    use crate::discovery::{self, Engine};
    use crate::output;
    use crate::session::ScanSession;
    use crate::transport::fixture;
    use crate::value::WireType;

    /// Write a single register and verify the write by reading it back.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        transport: super::TransportArgs,
        #[clap(flatten)]
        register: super::RegisterArgs,
        /// The wire type of the register, e.g. `UIN` or `EXP`. Defaults to the schema's.
        #[arg(long = "type")]
        wire_type: Option<WireType>,
        #[clap(flatten)]
        output: output::Args,
        /// The value to write, e.g. `21.5`, `0x1234`, `on`, `2025-12-24` or `06:30:00`.
        value: String,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error(transparent)]
        Schema(super::SchemaError),
        #[error("could not load the fixture")]
        Fixture(#[source] fixture::LoadError),
        #[error("could not write the register")]
        Write(#[source] discovery::Error),
        #[error("the register reads back as {1} instead of the written {0}")]
        NotVerified(String, String),
        #[error("could not output the register")]
        Output(#[source] output::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        super::runtime().map_err(Error::Runtime)?.block_on(async move {
            let Args { transport, register, wire_type, output, value } = args;
            let schema = register.schema.load().await.map_err(Error::Schema)?;
            let transport = transport.connect().await.map_err(Error::Fixture)?;
            let (events, _) = crate::progress::channel();
            let config = discovery::Config::new(register.dst);
            let mut engine = Engine::new(transport, Arc::new(schema), config, events);
            let mut session = ScanSession::new(register.dst);
            let report = engine
                .write_register(
                    &mut session,
                    register.opcode(),
                    register.group,
                    register.instance,
                    register.register,
                    wire_type,
                    &value,
                )
                .await
                .map_err(Error::Write)?;
            let mut output = output.into_output().map_err(Error::Output)?;
            output.table_headers(&output::RECORD_HEADERS);
            output.record(&report.readback).map_err(Error::Output)?;
            output.commit().map_err(Error::Output)?;
            if !report.verified() {
                return Err(Error::NotVerified(
                    b524::encode_hex(&report.written),
                    b524::encode_hex(&report.readback.raw_bytes),
                ));
            }
            Ok(())
        })
    }
}

pub mod schema {
    use std::path::PathBuf;

    use crate::output;
    use crate::schema::{self, SchemaEntry};

    /// List the registers described by a schema.
    #[derive(clap::Parser)]
    pub struct Args {
        /// The CSV schema to load.
        schema: PathBuf,
        /// Only list registers whose name contains this text.
        filter: Option<String>,
        /// Only list registers of this group.
        #[arg(long, value_parser = crate::plan::parse_id::<u8>)]
        group: Option<u8>,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not load the schema")]
        Schema(#[source] schema::Error),
        #[error("could not output the schema")]
        Output(#[source] output::Error),
    }

    fn is_match(entry: &SchemaEntry, group: Option<u8>, pattern: Option<&str>) -> bool {
        if group.is_some_and(|g| g != entry.group) {
            return false;
        }
        match pattern {
            None => true,
            Some(pattern) => {
                entry.semantic_path.to_uppercase().contains(&pattern.to_uppercase())
            }
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let schema = super::runtime()
            .map_err(Error::Runtime)?
            .block_on(schema::Schema::load(&args.schema))
            .map_err(Error::Schema)?;
        tracing::info!(message = "loaded schema", stats = ?schema.stats());
        let mut output = args.output.into_output().map_err(Error::Output)?;
        output.table_headers(&output::SCHEMA_HEADERS);
        for entry in schema.entries() {
            if !is_match(entry, args.group, args.filter.as_deref()) {
                continue;
            }
            output.schema_entry(entry).map_err(Error::Output)?;
        }
        output.commit().map_err(Error::Output)
    }
}
