use std::path::PathBuf;
use std::rc::Rc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ember_core::config::Config;
use ember_http::dynpage::DynRoutes;
use ember_http::embfs::EmbFs;
use ember_server::{Flow, Server};

#[derive(Parser)]
#[command(name = "ember", about = "embedded web server", version)]
struct Cli {
    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serve iteratively in the foreground (no worker processes)
    #[arg(short = 'F', long)]
    foreground: bool,

    /// Where to write the parent pid
    #[arg(short, long)]
    pid_file: Option<PathBuf>,

    /// Dump the parsed configuration and exit
    #[arg(long)]
    check_config: bool,
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ember")
        .join("ember.conf")
}

/// The resources baked into this build. A real site generates this
/// registration from its source tree; the bare server ships a landing
/// page so a fresh install answers something.
fn builtin_resources() -> EmbFs {
    const WELCOME: &[u8] = b"<!DOCTYPE html><html><head><title>ember</title></head>\
        <body><h1>It glows.</h1>\
        <p>The ember server is up; point it at your own resources.</p>\
        </body></html>";
    // release date of this revision, so conditional GET works
    const BUILT: u64 = 1_753_920_000;

    let mut fs = EmbFs::new();
    fs.register_file("/index.html", WELCOME, BUILT);
    fs
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let path = cli.config.unwrap_or_else(default_config_path);
    let config = Config::load_file(&path)
        .with_context(|| format!("cannot load configuration from {}", path.display()))?;

    if cli.check_config {
        print!("{config}");
        return Ok(());
    }

    let embfs = Rc::new(builtin_resources());
    let routes = Rc::new(DynRoutes::new());

    let mut server = Server::create(&config, embfs, routes, cli.foreground)
        .context("server init error (config error?)")?;

    // invoked by another web server as a CGI?
    if std::env::var("GATEWAY_INTERFACE").is_ok() {
        return server.serve_cgi().context("cgi serve error");
    }

    if let Some(pid_file) = &cli.pid_file {
        std::fs::write(pid_file, format!("{}\n", std::process::id()))
            .with_context(|| format!("cannot write pid file {}", pid_file.display()))?;
    }

    info!("ember starting");
    match server.run()? {
        Flow::Parent => {
            if let Some(pid_file) = &cli.pid_file {
                let _ = std::fs::remove_file(pid_file);
            }
            info!("ember stopped");
        }
        Flow::ChildDone => {
            // a worker that served its share; nothing left to clean up
        }
    }
    Ok(())
}
