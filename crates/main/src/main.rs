//! `postsrsd`: binds the configured endpoints, drops privileges, optionally
//! daemonizes, and serves the socketmap and milter protocols until
//! terminated. The startup sequence follows the reference implementation's
//! ordering exactly; see the comments below for why each step has to happen
//! where it does.

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use config::Config;
use server::listen::Protocol;
use server::Context;
use srs::{DomainTrie, Secrets, Srs};
use utils::endpoint::Listener;

#[derive(Parser)]
#[command(name = "postsrsd", version, about = "Sender Rewriting Scheme daemon")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'C', long = "config")]
    config: Option<PathBuf>,
    #[arg(short = 'c', long = "chroot-dir")]
    chroot_dir: Option<String>,
    #[arg(short = 'D', long = "daemonize")]
    daemonize: bool,
    #[arg(short = 'p', long = "pid-file")]
    pid_file: Option<String>,
    #[arg(short = 'u', long = "unprivileged-user")]
    unprivileged_user: Option<String>,
    /// Parse and validate the configuration, then exit without binding
    /// anything or dropping privileges.
    #[arg(long = "test-config")]
    test_config: bool,
}

fn main() -> anyhow::Result<()> {
    // Step 1: close every inherited fd >= 3 before anything else is opened.
    utils::privilege::close_inherited_fds();

    let cli = Cli::parse();

    // Step 2: parse CLI arguments and the configuration file.
    let mut cfg = match config::resolve_config_path(cli.config.as_deref()) {
        Some(path) => Config::from_file(&path)?,
        None => Config::default(),
    };
    if let Some(pid_file) = &cli.pid_file {
        cfg.pid_file = Some(pid_file.clone());
    }
    if let Some(user) = &cli.unprivileged_user {
        cfg.unprivileged_user = user.clone();
    }
    if let Some(dir) = &cli.chroot_dir {
        cfg.chroot_dir = dir.clone();
    }
    if cli.daemonize {
        cfg.daemonize = true;
    }
    cfg.validate()?;

    if cli.test_config {
        println!("configuration OK");
        return Ok(());
    }

    trc::init(false, cfg.syslog);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let srs_domain = cfg
        .srs_domain
        .clone()
        .expect("validated non-empty by Config::validate");

    // Step 3: load secrets and construct the SRS codec.
    let secrets = Secrets::from_file(&cfg.secrets_file)?;
    if secrets.is_empty() {
        anyhow::bail!("secrets file '{}' is empty", cfg.secrets_file);
    }
    let mut srs_codec = Srs::new(secrets);
    srs_codec.separator = cfg.separator_char();
    srs_codec.hash_length = cfg.hash_length;
    srs_codec.hash_minimum = cfg.hash_minimum;
    srs_codec.always_rewrite = cfg.always_rewrite;

    // Step 4: build the local-domain trie from `domains` and `domains-file`.
    let mut local_domains = DomainTrie::new();
    for domain in &cfg.domains {
        local_domains.insert(domain);
    }
    if let Some(path) = &cfg.domains_file {
        for line in std::fs::read_to_string(path)?.lines() {
            let line = line.trim();
            if !line.is_empty() && !line.starts_with('#') {
                local_domains.insert(line);
            }
        }
    }

    // Step 5: bind every configured endpoint while still privileged.
    let mut bound: Vec<(Listener, Protocol)> = Vec::new();
    if !cfg.socketmap.is_empty() {
        for listener in utils::endpoint::bind(&cfg.socketmap, 2)? {
            bound.push((listener, Protocol::Socketmap));
        }
    }
    if let Some(milter_endpoint) = cfg.milter.as_deref().filter(|s| !s.is_empty()) {
        for listener in utils::endpoint::bind(milter_endpoint, 1)? {
            bound.push((listener, Protocol::Milter));
        }
    }
    for (_, protocol) in &bound {
        trc::log(
            trc::Level::Info,
            trc::Event::ListenerBound {
                endpoint: format!("{protocol:?}"),
            },
        );
    }

    // Step 6: open the PID file path now, while still privileged enough to
    // create it, but don't write to it until the final daemon PID is known.
    let pid_file = match &cfg.pid_file {
        Some(path) if !path.is_empty() => Some(std::fs::File::create(path)?),
        _ => None,
    };

    // Step 7: chroot and drop privileges. Group id before user id - the only
    // order that leaves `setgid` permitted.
    let chroot_dir = (!cfg.chroot_dir.is_empty()).then(|| Path::new(&cfg.chroot_dir));
    utils::privilege::drop_privileges(&cfg.unprivileged_user, chroot_dir)?;
    trc::log(
        trc::Level::Info,
        trc::Event::PrivilegeDropped {
            user: cfg.unprivileged_user.clone(),
            chroot: cfg.chroot_dir.clone(),
        },
    );

    // Step 8: one-shot expiry sweep for the database-backed alias store.
    let store_uri = match cfg.original_envelope {
        config::OriginalEnvelope::Database => Some(Arc::<str>::from(cfg.envelope_database.as_str())),
        config::OriginalEnvelope::Embedded => None,
    };
    if let Some(uri) = &store_uri {
        match store::connect(uri).await {
            Ok(store) => {
                if let Err(e) = store.expire().await {
                    tracing::warn!("alias store expiry sweep failed: {e}");
                }
            }
            Err(e) => tracing::warn!("could not open alias store for expiry sweep: {e}"),
        }
    }

    // Step 9: daemonize, if configured.
    if cfg.daemonize {
        utils::privilege::daemonize()?;
        trc::log(
            trc::Level::Info,
            trc::Event::Daemonized {
                pid: std::process::id(),
            },
        );
    }

    // Step 10: write the PID file, now holding the final daemon's PID.
    if let Some(mut file) = pid_file {
        use std::io::Write;
        write!(file, "{}", std::process::id())?;
    }

    // Step 11: enter the accept loops.
    let ctx = Context {
        srs: Arc::new(srs_codec),
        srs_domain: Arc::from(srs_domain.as_str()),
        local_domains: Arc::new(local_domains),
        store_uri,
    };
    let keep_alive = Duration::from_secs(cfg.keep_alive);

    let mut tasks = Vec::new();
    for (listener, protocol) in bound {
        let listener = listener.into_tokio()?;
        let ctx = ctx.clone();
        tasks.push(tokio::spawn(async move {
            server::listen::run(listener, protocol, ctx, keep_alive).await;
        }));
    }

    tokio::signal::ctrl_c().await?;
    trc::log(trc::Level::Info, trc::Event::ShuttingDown);
    for task in tasks {
        task.abort();
    }
    Ok(())
}
