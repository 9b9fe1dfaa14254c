//! confmgrd - Configuration Backend Daemon
//!
//! Entry point for the confmgrd daemon.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, Level};

use confmgr_common::{BackendError, BackendOptions, LogDest, NacmMode};
use confmgr_types::parse_xml;
use confmgrd::pidfile;
use confmgrd::server::{BackendServer, ServerListener};
use confmgrd::Backend;

/// Configuration backend daemon
#[derive(Parser, Debug)]
#[command(name = "confmgrd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Debug level (0 = info, 1 = debug, 2+ = trace)
    #[arg(short = 'D', default_value = "0")]
    debug: u8,

    /// XML configuration file
    #[arg(short = 'f')]
    config_file: Option<PathBuf>,

    /// Log destination: s(yslog), e(stderr), o(stdout), f<file>
    #[arg(short = 'l', default_value = "e")]
    log_dest: String,

    /// Backend plugin directory
    #[arg(short = 'd')]
    plugin_dir: Option<PathBuf>,

    /// YANG module directory path
    #[arg(short = 'p')]
    yang_dir: Option<PathBuf>,

    /// Datastore directory
    #[arg(short = 'b')]
    db_dir: Option<PathBuf>,

    /// Run in foreground
    #[arg(short = 'F')]
    foreground: bool,

    /// Kill the running daemon and exit
    #[arg(short = 'z')]
    zap: bool,

    /// Control socket family: UNIX, IPv4 or IPv6
    #[arg(short = 'a')]
    sock_family: Option<String>,

    /// Control socket path (UNIX) or address (IP)
    #[arg(short = 'u')]
    sock: Option<String>,

    /// Pidfile path
    #[arg(short = 'P')]
    pidfile: Option<PathBuf>,

    /// Initialize and quit without serving
    #[arg(short = '1')]
    once: bool,

    /// Startup mode: none|startup|running|init
    #[arg(short = 's')]
    startup_mode: Option<String>,

    /// Extra XML merged after startup, without commit
    #[arg(short = 'c')]
    extra_config: Option<PathBuf>,

    /// Group required for clients on the unix socket
    #[arg(short = 'g')]
    sock_group: Option<String>,

    /// Main YANG module file override
    #[arg(short = 'y')]
    yang_main_file: Option<PathBuf>,

    /// Datastore plugin name
    #[arg(short = 'x')]
    datastore_plugin: Option<String>,

    /// Option override as key=value; may repeat
    #[arg(short = 'o')]
    overrides: Vec<String>,
}

fn init_logging(dest: &LogDest, debug: u8) {
    let level = match debug {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let builder = tracing_subscriber::fmt().with_max_level(level).with_target(true);
    match dest {
        LogDest::Stdout => builder.init(),
        LogDest::File(path) => match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
        {
            Ok(file) => builder.with_writer(Arc::new(file)).with_ansi(false).init(),
            Err(e) => {
                eprintln!("cannot open log file {}: {e}", path.display());
                builder.with_writer(std::io::stderr).init();
            }
        },
        // No syslog sink is wired up; syslog selection falls back to stderr.
        LogDest::Syslog | LogDest::Stderr => builder.with_writer(std::io::stderr).init(),
    }
}

fn build_options(args: &Args) -> Result<BackendOptions, BackendError> {
    let mut opts = match &args.config_file {
        Some(path) => BackendOptions::from_file(path)?,
        None => BackendOptions::default(),
    };
    if let Some(dir) = &args.plugin_dir {
        opts.plugin_dir = Some(dir.clone());
    }
    if let Some(dir) = &args.yang_dir {
        opts.yang_dir = Some(dir.clone());
    }
    if let Some(dir) = &args.db_dir {
        opts.db_dir = dir.clone();
    }
    if let Some(family) = &args.sock_family {
        opts.sock_family = family.parse()?;
    }
    if let Some(sock) = &args.sock {
        opts.sock = sock.clone();
    }
    if let Some(pidfile) = &args.pidfile {
        opts.pidfile = pidfile.clone();
    }
    if let Some(mode) = &args.startup_mode {
        opts.startup_mode = mode.parse()?;
    }
    if let Some(extra) = &args.extra_config {
        opts.extra_config = Some(extra.clone());
    }
    if let Some(group) = &args.sock_group {
        opts.sock_group = group.clone();
    }
    if let Some(file) = &args.yang_main_file {
        opts.yang_main_file = Some(file.clone());
    }
    if let Some(plugin) = &args.datastore_plugin {
        opts.datastore_plugin = Some(plugin.clone());
    }
    for pair in &args.overrides {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| BackendError::config(pair.clone(), "expected key=value"))?;
        opts.set(key, value)?;
    }
    Ok(opts)
}

/// The unix socket group must exist before we serve on it.
fn group_exists(name: &str) -> bool {
    match std::fs::read_to_string("/etc/group") {
        Ok(groups) => groups
            .lines()
            .any(|line| line.split(':').next() == Some(name)),
        Err(_) => false,
    }
}

fn load_external_nacm(opts: &BackendOptions) -> Result<Option<confmgr_types::XmlNode>, BackendError> {
    if opts.nacm_mode != NacmMode::External {
        return Ok(None);
    }
    let Some(path) = &opts.nacm_file else {
        return Err(BackendError::config(
            "nacm-file",
            "nacm-file must be set in external NACM mode",
        ));
    };
    let text = std::fs::read_to_string(path)
        .map_err(|e| BackendError::io(format!("reading NACM file {}", path.display()), e))?;
    let tree = parse_xml(&text)?;
    // Accept either <nacm> directly or a wrapper with <nacm> inside.
    let nacm = if tree.name() == "nacm" {
        tree
    } else {
        tree.find("nacm")
            .cloned()
            .ok_or_else(|| BackendError::config("nacm-file", "no <nacm> element found"))?
    };
    Ok(Some(nacm))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let log_dest = match LogDest::parse_flag(&args.log_dest) {
        Ok(dest) => dest,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(&log_dest, args.debug);

    let opts = match build_options(&args) {
        Ok(opts) => opts,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if args.zap {
        let sock = PathBuf::from(&opts.sock);
        return match pidfile::zap(&opts.pidfile, &sock).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("{e}");
                ExitCode::FAILURE
            }
        };
    }

    match pidfile::check(&opts.pidfile) {
        Ok(None) => {}
        Ok(Some(pid)) => {
            error!("{}", BackendError::AlreadyRunning { pid });
            return ExitCode::FAILURE;
        }
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    }

    if opts.sock_family == confmgr_common::SockFamily::Unix && !group_exists(&opts.sock_group) {
        error!(
            "'{}' is not a valid group; set sock-group or create the group",
            opts.sock_group
        );
        return ExitCode::FAILURE;
    }

    let nacm_tree = match load_external_nacm(&opts) {
        Ok(tree) => tree,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    info!("--- Starting confmgrd ---");
    if !args.foreground {
        // Process supervision is left to the init system; confmgrd does not
        // fork itself.
        info!("running attached; use a supervisor for background operation");
    }
    if let Some(dir) = &opts.plugin_dir {
        // Plugins are compiled in and registered by the embedding binary;
        // the directory option is accepted for config compatibility.
        info!(dir = %dir.display(), "plugin directory configured");
    }

    let (mut backend, event_rx) = match Backend::new(opts.clone()) {
        Ok(pair) => pair,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(tree) = nacm_tree {
        backend.datastores().set_nacm_tree(Some(tree));
    }

    if let Err(e) = backend.init().await {
        error!("startup failed: {e}");
        return ExitCode::FAILURE;
    }

    if args.once {
        info!("one-shot mode: initialization complete");
        backend.terminate().await;
        return ExitCode::SUCCESS;
    }

    let listener = match ServerListener::bind(&opts).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = pidfile::write(&opts.pidfile) {
        error!("{e}");
        return ExitCode::FAILURE;
    }
    info!(pid = std::process::id(), "confmgrd started");

    let result = BackendServer::new(backend, event_rx).run(listener).await;

    pidfile::remove(&opts.pidfile);
    if opts.sock_family == confmgr_common::SockFamily::Unix {
        let _ = std::fs::remove_file(&opts.sock);
    }

    match result {
        Ok(_) => {
            info!("confmgrd terminated");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
