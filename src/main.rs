use anyhow::Context;
use clap::Parser;
use grove_rest::logging::LogConfig;
use grove_rest::request::EncodingDefaults;
use grove_rest::rest::RestContext;
use grove_rest::rpc::RpcRegistry;
use grove_rest::schema::SchemaInstance;
use grove_rest::server::{self, AppState, ServerConfig};
use grove_rest::store::Store;
use grove_rest::watch::WatchRegistry;
use grove_rest::yang_library;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// HTTP/RESTCONF gateway for the grove hierarchical datastore.
#[derive(Debug, Parser)]
#[command(name = "grove-rest", version)]
struct Args {
    /// Background mode: write the pidfile (daemonisation is left to the
    /// service manager).
    #[arg(short = 'b')]
    background: bool,

    /// Enable debug logging.
    #[arg(short = 'd')]
    debug: bool,

    /// Enable verbose debug logging.
    #[arg(short = 'v')]
    verbose: bool,

    /// Default data encoding ("application/json" or
    /// "application/yang-data+json").
    #[arg(short = 'e', value_name = "ENCODING")]
    encoding: Option<String>,

    /// Format lists as JSON arrays.
    #[arg(short = 'a')]
    use_arrays: bool,

    /// Encode values as JSON types where possible.
    #[arg(short = 't')]
    use_types: bool,

    /// Colon-separated directories to search for schema modules.
    #[arg(short = 'm', value_name = "PATH", default_value = "./models")]
    models: String,

    /// File naming the supported models (one per line).
    #[arg(short = 'n', value_name = "FILE")]
    supported: Option<PathBuf>,

    /// Pidfile written in background mode.
    #[arg(short = 'p', value_name = "PIDFILE", default_value = "/var/run/grove-rest.pid")]
    pidfile: PathBuf,

    /// Listener socket path (":port" binds TCP instead).
    #[arg(short = 's', value_name = "SOCKET", default_value = "/var/run/grove-rest.sock")]
    socket: String,

    /// Method-logging flag file, reloaded on change.
    #[arg(short = 'l', value_name = "FILE")]
    logging: Option<PathBuf>,

    /// Directory of Lua RPC handler scripts.
    #[arg(short = 'r', value_name = "DIR")]
    rpc_scripts: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Init logging
    let default_level = if args.verbose {
        "trace"
    } else if args.debug {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .expect("log filter");
    fmt().with_env_filter(filter).init();

    let defaults = match args.encoding.as_deref() {
        None | Some("application/json") => EncodingDefaults {
            restconf: false,
            use_arrays: args.use_arrays,
            use_types: args.use_types,
        },
        Some("application/yang-data+json") => EncodingDefaults {
            restconf: true,
            use_arrays: args.use_arrays,
            use_types: args.use_types,
        },
        Some(other) => {
            anyhow::bail!(
                "expected one of \"application/json\", \"application/yang-data+json\", got \"{}\"",
                other
            );
        }
    };

    // Load the data models.
    let supported = match &args.supported {
        Some(file) => {
            let text = std::fs::read_to_string(file)
                .with_context(|| format!("while reading supported models from {}", file.display()))?;
            Some(
                text.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect::<HashSet<String>>(),
            )
        }
        None => None,
    };
    let schema = SchemaInstance::load(
        &args.models,
        supported.as_ref(),
        &yang_library::BUILTIN_MODULES,
    )
    .with_context(|| format!("failed to load modules at path \"{}\"", args.models))?;
    let schema = Arc::new(schema);
    info!(
        "loaded {} models from \"{}\"",
        schema.loaded_models().len(),
        args.models
    );

    let store = Store::new();

    // RPC handler scripts.
    let rpcs = match &args.rpc_scripts {
        Some(dir) => Arc::new(
            RpcRegistry::load(dir)
                .with_context(|| format!("while loading rpc scripts from {}", dir.display()))?,
        ),
        None => Arc::new(RpcRegistry::empty()),
    };
    if !rpcs.is_empty() {
        info!("registered {} rpc handlers", rpcs.len());
    }

    let log = match &args.logging {
        Some(file) => LogConfig::init(file),
        None => LogConfig::disabled(),
    };

    let ctx = RestContext::new(schema.clone(), store.clone(), rpcs, log);

    // Publish the YANG library and RESTCONF capabilities.
    yang_library::publish(&schema, &store, ctx.boot_epoch);

    // Pidfile for the service manager.
    if args.background {
        std::fs::write(&args.pidfile, format!("{}\n", std::process::id()))
            .with_context(|| format!("failed to create pid file {}", args.pidfile.display()))?;
    }

    let state = AppState {
        ctx,
        watches: WatchRegistry::new(),
        config: Arc::new(ServerConfig {
            listen: args.socket.clone(),
            defaults,
            ..ServerConfig::default()
        }),
    };
    let result = server::run(state).await;

    if args.background {
        let _ = std::fs::remove_file(&args.pidfile);
    }
    result
}
