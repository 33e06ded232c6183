//! Entry point: CLI, password helper modes, and master startup.

use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use xvp::context::ProxyContext;
use xvp::logging;
use xvp::supervisor::Supervisor;
use xvp_backend::XapiFactory;
use xvp_config::parser;

#[derive(Parser)]
#[command(
    name = "xvp",
    version,
    about = "Multiplexing VNC proxy for the consoles of pool-hosted virtual machines",
    after_help = "Ports may be given as a TCP port number (1024-65535) or as a VNC \
                  display (:0 to :99, :0 = port 5900).  Config files may be nested \
                  using INCLUDE \"filename\"."
)]
struct Cli {
    /// Configuration file
    #[arg(short = 'c', long = "configfile", default_value = "/etc/xvp.conf")]
    configfile: PathBuf,

    /// Log file ("-" = stdout)
    #[arg(short = 'l', long = "logfile", default_value = "/var/log/xvp.log")]
    logfile: String,

    /// PID file
    #[arg(short = 'p', long = "pidfile", default_value = "/var/run/xvp.pid")]
    pidfile: PathBuf,

    /// Reconnect delay after console loss, in seconds; non-positive
    /// means wait that long and then give up
    #[arg(short = 'r', long = "reconnect", default_value_t = 20)]
    reconnect: i64,

    /// Run in the foreground (always the case; kept for compatibility)
    #[arg(short = 'n', long = "nodaemon")]
    nodaemon: bool,

    /// Increase logging detail
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Enable some packet trace logging (with --verbose)
    #[arg(short = 't', long = "trace")]
    trace: bool,

    /// Encrypt a VNC password read from stdin and exit
    #[arg(short = 'e', long = "encrypt", conflicts_with = "xencrypt")]
    encrypt: bool,

    /// Encrypt a pool-manager password read from stdin and exit
    #[arg(short = 'x', long = "xencrypt")]
    xencrypt: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.encrypt || cli.xencrypt {
        return password_helper(cli.xencrypt);
    }

    if let Err(e) = logging::init(&cli.logfile, cli.verbose) {
        eprintln!("xvp: {}", e);
        return ExitCode::FAILURE;
    }

    log::info!("Starting as master");
    if !cli.nodaemon {
        log::debug!("Daemonizing is left to the service manager; running in the foreground");
    }

    let config = match parser::load(&cli.configfile) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    config.log_summary();

    if let Err(e) = std::fs::write(&cli.pidfile, format!("{}\n", std::process::id())) {
        log::error!("{}: {}", cli.pidfile.display(), e);
        return ExitCode::FAILURE;
    }

    let ctx = Arc::new(ProxyContext {
        config: Arc::new(config),
        reconnect_delay: cli.reconnect,
        trace: cli.trace,
        factory: Arc::new(XapiFactory),
    });

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Unable to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let code = runtime.block_on(async {
        let mut supervisor = Supervisor::new(ctx, cli.configfile.clone());
        supervisor.run().await
    });

    if std::fs::metadata(&cli.pidfile).map(|m| m.is_file()).unwrap_or(false) {
        let _ = std::fs::remove_file(&cli.pidfile);
    }

    if code == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// `-e` / `-x`: read a password on stdin, print its encrypted hex form.
fn password_helper(manager: bool) -> ExitCode {
    let max = if manager {
        xvp_auth::MANAGER_PASSWORD_LEN
    } else {
        xvp_auth::VNC_PASSWORD_LEN
    };

    if std::io::stdin().is_terminal() {
        print!("Password: ");
        let _ = std::io::stdout().flush();
    }

    let mut text = String::new();
    if std::io::stdin().read_line(&mut text).is_err() {
        eprintln!("xvp: Unable to read password");
        return ExitCode::FAILURE;
    }
    let text = text.trim_end_matches(['\r', '\n']);

    if text.is_empty() {
        eprintln!("xvp: Empty passwords not supported");
        return ExitCode::FAILURE;
    }
    if text.len() > max {
        eprintln!("xvp: Password too long: maximum {} characters", max);
        return ExitCode::FAILURE;
    }

    let hex = if manager {
        xvp_auth::to_hex(&xvp_auth::encrypt_manager(text))
    } else {
        xvp_auth::to_hex(&xvp_auth::encrypt_vnc(text))
    };
    println!("{}", hex);
    ExitCode::SUCCESS
}
