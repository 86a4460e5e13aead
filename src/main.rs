use std::net::SocketAddr;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};

use tunsplit::capture::HostRecorder;
use tunsplit::classifier::Classifier;
use tunsplit::config::Config;
use tunsplit::listener;
use tunsplit::packet::Framing;
use tunsplit::resolver::Resolver;
use tunsplit::tunnel::{Session, TunDevice};

mod logging;

#[derive(Parser)]
#[command(name = "tunsplit", version)]
#[command(about = "Rule-based traffic splitter for tunnel-mode proxies", long_about = None)]
pub struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "TUNSPLIT_CONFIG")]
    config: Option<PathBuf>,

    /// Rule line, e.g. "DOMAIN-SUFFIX,example.com,proxyA"; placed before configured rules
    #[arg(short, long = "rule")]
    rules: Vec<String>,

    /// DNS listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Upstream DNS server (host[:port]); replaces configured servers
    #[arg(short, long = "upstream")]
    upstreams: Vec<String>,

    /// SOCKS5 proxy for upstream queries
    #[arg(long)]
    socks5: Option<SocketAddr>,

    /// Do not start the DNS listener
    #[arg(long)]
    no_dns: bool,

    /// Tunnel descriptor inherited from the parent process
    #[arg(long)]
    tun_fd: Option<RawFd>,

    /// Tunnel packet framing
    #[arg(long, value_enum)]
    framing: Option<FramingArg>,

    /// Tunnel MTU
    #[arg(long)]
    mtu: Option<usize>,

    /// Record seen hosts to this JSON file
    #[arg(long)]
    hosts_file: Option<PathBuf>,

    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
    Compact,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FramingArg {
    Raw,
    AfPrefix,
    Auto,
}

impl From<FramingArg> for Framing {
    fn from(arg: FramingArg) -> Self {
        match arg {
            FramingArg::Raw => Framing::Raw,
            FramingArg::AfPrefix => Framing::AfPrefix,
            FramingArg::Auto => Framing::Auto,
        }
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    if !args.rules.is_empty() {
        let mut rules = args.rules.clone();
        rules.append(&mut config.rules);
        config.rules = rules;
    }
    if let Some(listen) = args.listen {
        config.dns.listen = listen;
    }
    if !args.upstreams.is_empty() {
        config.dns.servers = args.upstreams.clone();
    }
    if args.socks5.is_some() {
        config.dns.socks5 = args.socks5;
    }
    if args.no_dns {
        config.dns.enabled = false;
    }
    if let Some(framing) = args.framing {
        config.tunnel.framing = framing.into();
    }
    if let Some(mtu) = args.mtu {
        config.tunnel.mtu = mtu;
    }
    if args.hosts_file.is_some() {
        config.capture.hosts_file = args.hosts_file.clone();
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(&args)?;

    let config = load_config(&args).context("invalid configuration")?;
    let rules = config.load_rules().context("invalid rules")?;
    info!(rules = rules.len(), "loaded rules");
    if rules.is_empty() {
        warn!("no rules configured, every packet goes to the default channel");
    }

    let classifier = Arc::new(Classifier::with_answer_cache(
        rules,
        config.dns.answer_cache(),
        config.dns.cache_interval(),
    ));

    let _listener = if config.dns.enabled {
        let resolver = Arc::new(Resolver::from_config(classifier.clone(), &config.dns)?);
        Some(listener::start(&config.dns, resolver).await?)
    } else {
        None
    };

    let mut session = None;
    if let Some(fd) = args.tun_fd {
        // SAFETY: the parent hands this descriptor over and nothing else in
        // this process owns it.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let tun = TunDevice::from_fd(fd).context("tunnel descriptor is unusable")?;

        let mut s = Session::new(classifier.clone());
        if let Some(path) = &config.capture.hosts_file {
            s = s.with_capture(Arc::new(HostRecorder::new(path, config.tunnel.framing)));
        }
        let map = s.configure(&classifier.target_names())?;
        println!("{}", map.to_json());
        s.run(tun, config.tunnel.mtu, config.tunnel.framing)?;
        session = Some(s);
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");

    if let Some(mut s) = session {
        s.close();
    }
    Ok(())
}
