#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod conf;
mod driver;
mod effector;
mod error;
mod pods;

pub use self::error::Error;

use self::{
    conf::{Command, Invocation, NetConf, PLACEHOLDER_CNI_VERSION},
    driver::Driver,
    effector::Nsenter,
    pods::KubePods,
};
use clap::Parser;
use serde_json::Value;
use std::process::exit;
use tokio::io::AsyncReadExt;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

/// The runtime passes everything but the network config through the environment.
#[derive(Parser)]
#[clap(version, about = "Chained CNI plugin that redirects pod traffic to the Consul proxy")]
struct Env {
    #[clap(long, env = "CNI_COMMAND")]
    command: String,

    #[clap(long, env = "CNI_CONTAINERID", default_value = "")]
    container_id: String,

    #[clap(long, env = "CNI_NETNS", default_value = "")]
    netns: String,

    #[clap(long, env = "CNI_IFNAME", default_value = "")]
    ifname: String,

    #[clap(long, env = "CNI_ARGS", default_value = "")]
    args: String,

    /// Also program `ip6tables` in the pod's namespace.
    #[clap(long, env = "CNI_DUAL_STACK")]
    dual_stack: bool,

    /// Overrides the `log_level` from the network config.
    #[clap(long, env = "CONSUL_CNI_LOG")]
    log_level: Option<String>,

    #[clap(long, env = "CONSUL_CNI_LOG_FORMAT", default_value = "plain")]
    log_format: LogFormat,
}

#[derive(Copy, Clone, Debug, clap::ValueEnum)]
enum LogFormat {
    Plain,
    Json,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let env = Env::parse();

    let mut stdin = Vec::new();
    if let Err(error) = tokio::io::stdin().read_to_end(&mut stdin).await {
        eprintln!("failed to read network configuration: {error}");
        exit(1);
    }
    let conf = match NetConf::parse(&stdin) {
        Ok(conf) => conf,
        Err(error) => fail(&error, PLACEHOLDER_CNI_VERSION),
    };

    init_tracing(&env, &conf);

    let version = conf.version().to_string();
    let inv = match invocation(
        env.command,
        env.container_id,
        env.netns,
        env.ifname,
        &env.args,
        conf,
    ) {
        Ok(inv) => inv,
        Err(error) => fail(&error, &version),
    };
    debug!(
        command = ?inv.command,
        container = %inv.container_id,
        netns = %inv.netns,
        ifname = %inv.ifname,
        network = %inv.conf.name,
        plugin = %inv.conf.type_,
        bin_dir = %inv.conf.cni_bin_dir,
        multus = inv.conf.multus,
        "Invoked"
    );

    let driver = Driver::new(Nsenter::new(env.dual_stack));
    match driver.run(&inv, KubePods::connect(&inv.conf)).await {
        Ok(Value::Null) => {}
        Ok(result) => println!("{result}"),
        Err(error) => fail(&error, &version),
    }
}

fn invocation(
    command: String,
    container_id: String,
    netns: String,
    ifname: String,
    args: &str,
    conf: NetConf,
) -> Result<Invocation, Error> {
    let command = command.parse::<Command>()?;
    Ok(Invocation {
        command,
        container_id,
        netns,
        ifname,
        args: args.parse()?,
        conf,
    })
}

/// Logs go to stderr since stdout carries the plugin's result.
fn init_tracing(env: &Env, conf: &NetConf) {
    let directive = env
        .log_level
        .clone()
        .filter(|l| !l.is_empty())
        .or_else(|| Some(conf.log_level.clone()).filter(|l| !l.is_empty()))
        .unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let res = match env.log_format {
        LogFormat::Plain => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if let Err(error) = res {
        eprintln!("failed to initialize logging: {error}");
    }
}

fn fail(error: &Error, version: &str) -> ! {
    error!(%error, "consul-cni failed");
    match serde_json::to_string(&error.to_cni(version)) {
        Ok(doc) => println!("{doc}"),
        Err(_) => eprintln!("{error}"),
    }
    exit(1)
}
