use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, bail, anyhow};
use clap::Parser as ClapParser;
use arbiter::apachelog::Logs;
use arbiter::config::Config;
use arbiter::handler::Handler;
use arbiter::hostrouter::HostsRouter;
use arbiter::processor::Processors;
use arbiter::rouille_runner::{listeners, RouilleRunner};
use arbiter::script::value::map_value;
use arbiter::template::compiler::{compile_page, generate_page};
use arbiter::template::layout::RenderError;
use arbiter::template::Engine;
use arbiter::util::{getenv, log_basedir};
use arbiter::warn::set_verbose;
use arbiter::{info, warn};

const DEFAULT_CONFIG_DIR: &str = "/etc/arbiter/";
const LOCAL_CONFIG_DIR: &str = "./cfg/";

#[derive(clap::Parser, Debug)]
/// Serve virtual hosts with pages compiled from HTML templates.
struct Args {
    /// Directory with arbiter.cfg, mime.cfg, sites.cfg and optionally
    /// ahtml.cfg (default: $ARBITER_CONFIG_DIR, or /etc/arbiter/)
    #[clap(long)]
    config_dir: Option<PathBuf>,

    /// Use ./cfg/ as the configuration directory
    #[clap(long)]
    local_config: bool,

    /// Print informational messages to stderr
    #[clap(long, short)]
    verbose: bool,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Run the server (the default)
    Serve,
    /// Print the program generated for a template, and its
    /// diagnostics
    Compile {
        file: PathBuf,
    },
    /// Render a template to stdout, with an empty request; layouts
    /// are looked up from the template's directory
    Render {
        file: PathBuf,
    },
}

fn config_dir(args: &Args) -> Result<PathBuf> {
    if let Some(dir) = &args.config_dir {
        return Ok(dir.clone())
    }
    if args.local_config {
        return Ok(LOCAL_CONFIG_DIR.into())
    }
    Ok(getenv("ARBITER_CONFIG_DIR")?.unwrap_or_else(|| DEFAULT_CONFIG_DIR.into()).into())
}

fn serve(config_dir: &Path) -> Result<()> {
    let config = Config::load(config_dir)?;
    let engine = Engine::new(&config.engine);
    // Without a watcher the engine checks files on each request
    for site in &config.sites {
        let _ = engine.watch(&site.root);
    }
    for library in &config.engine.libraries {
        if let Some(dir) = library.parent() {
            let _ = engine.watch(dir);
        }
    }

    let logdir = match &config.logdir {
        Some(dir) => dir.clone(),
        None => log_basedir()?,
    };
    let hosts = HostsRouter::from_sites(
        &config.sites,
        |name| Logs::open_in_basedir(&logdir, name))?;
    let processors = Processors::new(engine.clone());
    let handler = Arc::new(Handler::new(&config, Arc::new(hosts), processors, engine)?);

    let runner = RouilleRunner::new();
    let mut threads = Vec::new();
    for listener in listeners(&config)? {
        threads.push(runner.run_server(listener, handler.clone())?);
    }
    if threads.is_empty() {
        bail!("no site is bound to anything, nothing to listen on")
    }
    info!("{} sites, {} listeners", config.sites.len(), threads.len());
    for thread in threads {
        match thread.join() {
            Ok(result) => result?,
            Err(_) => bail!("server thread panicked"),
        }
    }
    Ok(())
}

fn compile(config_dir: &Path, file: &Path) -> Result<()> {
    let config = Config::load_engine(config_dir)?;
    let engine = Engine::new(&config.engine);
    let template = std::fs::read(file)
        .map_err(|e| anyhow!("reading {:?}: {e}", file))?;
    let name = file.to_string_lossy();
    let mut outp = std::io::stdout().lock();
    match generate_page(&name, &template) {
        Ok(page) => write!(&mut outp, "{}", page.to_source())?,
        Err(d) => writeln!(&mut outp, "// {d}")?,
    }
    let unit = compile_page(&name, &template, &engine.libraries());
    for d in &unit.diagnostics {
        writeln!(&mut outp, "// {d}")?;
    }
    outp.flush()?;
    if !unit.success {
        bail!("{name} failed to compile")
    }
    Ok(())
}

fn render(config_dir: &Path, file: &Path) -> Result<()> {
    let config = Config::load_engine(config_dir)?;
    let engine = Engine::new(&config.engine);
    let root = file.parent().unwrap_or(Path::new("."));
    let site_path = format!("/{}", file.file_name()
                            .ok_or_else(|| anyhow!("not a file: {:?}", file))?
                            .to_string_lossy());
    let empty = || map_value(std::iter::empty());
    match engine.render(root, &site_path, empty(), empty()) {
        Ok(page) => {
            let mut outp = std::io::stdout().lock();
            outp.write_all(&page.body)?;
            outp.flush()?;
            Ok(())
        }
        Err(RenderError::Compile { path, diagnostics }) => {
            for d in &diagnostics {
                warn!("{path}: {d}");
            }
            bail!("{path} failed to compile")
        }
        Err(e) => Err(e.into()),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    set_verbose(args.verbose);
    let config_dir = config_dir(&args)?;
    match &args.command {
        None | Some(Command::Serve) => serve(&config_dir),
        Some(Command::Compile { file }) => compile(&config_dir, file),
        Some(Command::Render { file }) => render(&config_dir, file),
    }
}
