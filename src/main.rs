//! Foreshell: predictive terminal emulation for SSH.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::info;

use foreshell::filter::{predictive_filter, FilterOptions};
use foreshell::proxy::auth::discover_identities;
use foreshell::proxy::server::generate_host_key;
use foreshell::proxy::{
    run_proxy, AuthConfig, HostKeyCheck, ProxyConfig, DEFAULT_DIAL_TIMEOUT,
};
use foreshell::term;

#[derive(Debug, Parser)]
#[command(
    name = "foreshell",
    about = "Transparent SSH proxy adding speculative local echo to interactive sessions",
    disable_version_flag = true
)]
struct Args {
    /// Proxy listen port
    #[arg(long, required_unless_present = "version")]
    port: Option<u16>,

    /// Target SSH host (host:port)
    #[arg(long, required_unless_present = "version")]
    target: Option<String>,

    /// Display predictive backend version
    #[arg(long)]
    version: bool,

    /// Disable the predictive backend
    #[arg(long)]
    nopredict: bool,

    /// Artificial roundtrip latency added to sessions (e.g. "250ms")
    #[arg(long = "fakeDelay", value_parser = humantime::parse_duration, default_value = "0s")]
    fake_delay: Duration,

    /// Print epoch synchronization timing messages
    #[arg(long = "printTiming")]
    print_timing: bool,

    /// Disable the Foreshell proxy banner
    #[arg(long = "noBanner")]
    no_banner: bool,

    /// Proxy SSH client options (repeatable, K=V; honours
    /// UserKnownHostsFile and StrictHostKeyChecking)
    #[arg(short = 'o', value_name = "OPTION")]
    options: Vec<String>,

    /// Proxy SSH client identity file paths (repeatable; a single
    /// /dev/null disables identities)
    #[arg(short = 'i', value_name = "IDENTITY")]
    identities: Vec<PathBuf>,

    /// Allow proxy SSH client to forward agent
    #[arg(short = 'A')]
    agent_forward: bool,

    /// Disable use of SSH agent for key based authentication
    #[arg(short = 'a')]
    no_agent: bool,

    /// Use 'dumb' authentication (send blank password)
    #[arg(long)]
    dumbauth: bool,

    /// Show details on authentication errors with target
    #[arg(long = "authErr")]
    auth_err: bool,
}

fn truthy(s: &str) -> bool {
    matches!(s.to_ascii_lowercase().as_str(), "yes" | "1" | "true")
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    if args.version {
        if args.nopredict {
            println!("Predictive Backend *DISABLED*");
        } else {
            println!("Predictive Backend Version: {}", term::backend_version());
        }
        if args.fake_delay > Duration::ZERO {
            println!("Artificial Added Latency: {:?}", args.fake_delay);
        }
        let (Some(_), Some(_)) = (args.port, &args.target) else {
            return;
        };
    }
    let (port, target) = match (args.port, args.target) {
        (Some(port), Some(target)) => (port, target),
        _ => return,
    };

    let client_options: HashMap<String, String> = args
        .options
        .iter()
        .filter_map(|option| {
            option
                .split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect();

    // default to checking known hosts from $HOME/.ssh/known_hosts,
    // unless overridden
    let mut known_hosts = std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".ssh").join("known_hosts"));
    if let Some(specified) = client_options.get("UserKnownHostsFile") {
        known_hosts = Some(PathBuf::from(specified));
    }

    let strict_host_checking = client_options
        .get("StrictHostKeyChecking")
        .map(|v| truthy(v))
        .unwrap_or(true);

    let host_key_check = if strict_host_checking {
        match known_hosts {
            Some(path) => HostKeyCheck::KnownHosts(path),
            None => panic!("Strict host key checking enabled, but no known_hosts provided"),
        }
    } else {
        HostKeyCheck::AcceptAll
    };

    let (target_host, target_port) = match target.rsplit_once(':') {
        Some((host, port_str)) => match port_str.parse::<u16>() {
            Ok(p) => (host.to_string(), p),
            Err(_) => panic!("invalid target port in '{target}'"),
        },
        None => (target.clone(), 22),
    };

    let resolved: SocketAddr = match tokio::net::lookup_host((target_host.as_str(), target_port))
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
    {
        Some(addr) => addr,
        None => panic!("cannot resolve target '{target}'"),
    };

    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(err) => panic!("cannot listen on port {port}: {err}"),
    };

    let host_key = match generate_host_key() {
        Ok(key) => key,
        Err(err) => panic!("host key generation failed: {err}"),
    };
    let server_config = Arc::new(russh::server::Config {
        keys: vec![host_key],
        ..Default::default()
    });

    let channel_filter = if !args.nopredict || args.fake_delay > Duration::ZERO {
        Some(predictive_filter(FilterOptions {
            predict: !args.nopredict,
            fake_delay: args.fake_delay,
            print_timing: args.print_timing,
            interposer: Default::default(),
        }))
    } else {
        None
    };

    let config = Arc::new(ProxyConfig {
        target: resolved,
        target_host,
        target_port,
        host_key_check,
        channel_filter,
        auth: AuthConfig {
            identities: discover_identities(&args.identities),
            use_agent: !args.no_agent && !args.dumbauth,
            dumb_auth: args.dumbauth,
        },
        banner: (!args.no_banner).then(|| target.clone()),
        report_auth_err: args.auth_err,
        block_agent: !args.agent_forward,
        dial_timeout: DEFAULT_DIAL_TIMEOUT,
    });

    info!("foreshell listening on :{port}, proxying to {target}");
    if let Err(err) = run_proxy(listener, server_config, config).await {
        panic!("proxy terminated: {err}");
    }
}
