use crate::config::Config;
use crate::config::DEFAULT_PORT;
use crate::errors::generic_error;
use crate::errors::unwrap_or_exit;
use crate::executor;
use crate::logger;
use crate::logger::LogFormat;
use crate::registry::AppRegistry;
use crate::repl;
use crate::runtime::AppOptions;
use crate::runtime::Host;
use crate::server::Server;
use crate::server::ServerMode;
use clap::ArgGroup;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use clap::ValueHint;
use colored::*;
use path_absolutize::*;
use std::env;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "nano", author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(
        about = "Serve one or more apps over HTTP",
        arg_required_else_help = true
    )]
    Serve(ServeArgs),
    #[command(
        about = "Evaluate a JavaScript file without HTTP",
        arg_required_else_help = true
    )]
    Run(RunArgs),
    #[command(about = "Start the REPL (read, eval, print, loop)")]
    Repl,
}

#[derive(Debug, Args)]
#[command(group = ArgGroup::new("source").required(true).args(["app", "config"]))]
struct ServeArgs {
    #[arg(
        help = "Port to listen on (falls back to NANO_PORT, then 3000)",
        long,
        value_name = "NUMBER"
    )]
    port: Option<u16>,
    #[arg(
        help = "Serve a single app from this directory",
        long,
        value_name = "PATH",
        value_hint = ValueHint::DirPath
    )]
    app: Option<PathBuf>,
    #[arg(
        help = "Serve the apps listed in a JSON config file",
        long,
        value_name = "FILE",
        value_hint = ValueHint::FilePath
    )]
    config: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(help = "The script that will run", required = true)]
    script: String,
}

fn env_port() -> Option<u16> {
    env::var("NANO_PORT").ok().and_then(|value| value.parse().ok())
}

fn serve_command(args: &ServeArgs) {
    logger::init(LogFormat::from_env());

    let host = Host::new();
    let mut registry = AppRegistry::new(host);

    // Single-app mode: one handler answers for every hostname.
    if let Some(app_path) = args.app.as_ref() {
        let name = app_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "app".into());

        let options = AppOptions {
            name,
            hostname: "localhost".into(),
            ..Default::default()
        };

        if let Err(e) = registry.add_app(&app_path.to_string_lossy(), options) {
            eprintln!("{}", generic_error(e.to_string()));
            std::process::exit(1);
        }

        let port = args.port.or_else(env_port).unwrap_or(DEFAULT_PORT);
        let mut server = Server::new(registry, port, ServerMode::SingleApp, None, LogFormat::from_env());

        if let Err(e) = server.run() {
            eprintln!("{}", generic_error(e.to_string()));
            std::process::exit(1);
        }
        return;
    }

    // Multi-app mode: hostname routing, admin API and hot reload.
    let config_path = args.config.as_ref().unwrap();
    let config = unwrap_or_exit(Config::from_file(config_path));

    for app in &config.apps {
        let options = config.resolve_options(app);
        if let Err(e) = registry.add_app(&app.path, options) {
            tracing::error!(app = %app.name, "failed to load: {e}");
        }
    }

    if registry.is_empty() {
        eprintln!("{}", generic_error("No apps could be loaded from the config"));
        std::process::exit(1);
    }

    let port = args.port.or(config.port).or_else(env_port).unwrap_or(DEFAULT_PORT);
    let mut server = Server::new(
        registry,
        port,
        ServerMode::MultiApp,
        Some(config_path.clone()),
        LogFormat::from_env(),
    );

    if let Err(e) = server.run() {
        eprintln!("{}", generic_error(e.to_string()));
        std::process::exit(1);
    }
}

fn run_command(args: &RunArgs) {
    logger::init(LogFormat::from_env());

    // NOTE: Resolve the given filename to an absolute path so error
    // locations point somewhere useful.
    let filename = Path::new(&args.script);
    let filename = match filename.absolutize() {
        Ok(path) => path.to_path_buf(),
        Err(_) => filename.to_path_buf(),
    };

    let source = match fs::read_to_string(&filename) {
        Ok(source) => source,
        Err(e) => {
            eprintln!(
                "{}",
                generic_error(format!("Failed to read \"{}\": {e}", filename.display()))
            );
            std::process::exit(1);
        }
    };

    let host = Host::new();
    let mut runtime = host.eval_instance(true);

    match runtime.execute_script(&filename.to_string_lossy(), &source) {
        Ok(_) => executor::run_to_completion(&mut runtime),
        Err(e) => {
            eprintln!("{e:?}");
            std::process::exit(1);
        }
    }
}

fn repl_command() {
    println!(
        "Welcome to {} v{}",
        "nano".cyan().bold(),
        env!("CARGO_PKG_VERSION")
    );

    let host = Host::new();
    let runtime = host.eval_instance(false);
    repl::start(runtime);
}

pub fn process_cli_arguments() {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Serve(args)) => serve_command(&args),
        Some(Command::Run(args)) => run_command(&args),
        Some(Command::Repl) => repl_command(),
        None => repl_command(),
    };
}
