use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ipnetwork::{Ipv4Network, Ipv6Network};
use rtnetlink::packet_route::rule::RuleMessage;
use rtnetlink::IpVersion;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use eni_veth::config::{DEFAULT_MTU, NetConf};
use eni_veth::datapath::rule::{rule_dst, rule_iif, rule_priority, rule_src, rule_table};
use eni_veth::datapath::{
    checked_route_table_id, DatapathDriver, PriorityRuleManager, SetupConfig, TeardownConfig,
    FROM_CONTAINER_PRIORITY, MAX_ENI_INDEX, PRIMARY_ENI_INDEX, TO_CONTAINER_PRIORITY,
};
use eni_veth::netns::{self, NetNs};
use eni_veth::types::{IpNetSet, IpSet};

/// Inspect and drive pod veth datapaths by hand
#[derive(Parser)]
#[command(name = "eni-veth-ctl", author, version, about)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the route table used by an ENI
    TableId {
        #[arg(long, value_parser = clap::value_parser!(u32).range(..=MAX_ENI_INDEX as i64))]
        eni_index: u32,
    },

    /// Build a pod datapath
    Setup(PodArgs),

    /// Remove a pod datapath
    Teardown(PodArgs),

    /// Verify a pod datapath
    Check(PodArgs),

    /// List the pod policy rules installed on this host
    Rules,

    /// Parse a network configuration and print the setup it describes
    Validate {
        #[arg(long)]
        config: PathBuf,

        /// Host veth name to plan for
        #[arg(long, default_value = "cali0000000000")]
        host_link: String,

        #[arg(long, default_value = "eth0")]
        ifname: String,
    },
}

#[derive(Args)]
struct PodArgs {
    /// Pod network namespace, e.g. /var/run/netns/pod
    #[arg(long)]
    netns: Option<PathBuf>,

    /// Host end of the veth pair
    #[arg(long)]
    host_link: String,

    /// Interface name inside the pod
    #[arg(long, default_value = "eth0")]
    ifname: String,

    #[arg(long)]
    ipv4: Option<Ipv4Network>,

    #[arg(long)]
    ipv6: Option<Ipv6Network>,

    #[arg(long)]
    gateway_ipv4: Option<Ipv4Addr>,

    #[arg(long)]
    gateway_ipv6: Option<Ipv6Addr>,

    /// Address of the ENI itself
    #[arg(long)]
    host_ipv4: Option<Ipv4Network>,

    /// ENI ifindex, 0 for the primary ENI
    #[arg(long, default_value_t = PRIMARY_ENI_INDEX)]
    eni_index: u32,

    #[arg(long, default_value_t = DEFAULT_MTU)]
    mtu: u32,

    #[arg(long)]
    trunk: bool,
}

impl PodArgs {
    fn container_addresses(&self) -> IpNetSet {
        IpNetSet::new(self.ipv4, self.ipv6)
    }

    fn setup_config(&self) -> SetupConfig {
        SetupConfig {
            host_link_name: self.host_link.clone(),
            container_if_name: self.ifname.clone(),
            container_addresses: self.container_addresses(),
            gateway_addresses: IpSet::new(self.gateway_ipv4, self.gateway_ipv6),
            mtu: self.mtu,
            eni_index: self.eni_index,
            trunk: self.trunk,
            extra_routes: Vec::new(),
            service_cidrs: Vec::new(),
            host_stack_cidrs: Vec::new(),
            host_addresses: self.host_ipv4.map(|v4| IpNetSet::new(Some(v4), None)),
            ingress_limit: 0,
            egress_limit: 0,
        }
    }

    fn teardown_config(&self) -> TeardownConfig {
        let addrs = self.container_addresses();
        TeardownConfig {
            host_link_name: self.host_link.clone(),
            container_if_name: self.ifname.clone(),
            container_addresses: (!addrs.is_empty()).then_some(addrs),
        }
    }

    fn open_netns(&self) -> Result<NetNs> {
        let path = self.netns.as_ref().context("--netns is required")?;
        Ok(NetNs::open(path)?)
    }
}

fn describe_rule(msg: &RuleMessage) -> String {
    let src = rule_src(msg).map_or_else(|| "all".to_string(), |n| n.to_string());
    let mut line = format!("{}: from {}", rule_priority(msg), src);
    if let Some(dst) = rule_dst(msg) {
        line.push_str(&format!(" to {dst}"));
    }
    if let Some(iif) = rule_iif(msg) {
        line.push_str(&format!(" iif {iif}"));
    }
    line.push_str(&format!(" lookup {}", rule_table(msg)));
    line
}

async fn list_rules() -> Result<()> {
    let rules = PriorityRuleManager::new(netns::connect_current()?);
    for version in [IpVersion::V4, IpVersion::V6] {
        let mut msgs: Vec<RuleMessage> = rules
            .list(version)
            .await?
            .into_iter()
            .filter(|msg| {
                let priority = rule_priority(msg);
                priority == TO_CONTAINER_PRIORITY || priority == FROM_CONTAINER_PRIORITY
            })
            .collect();
        msgs.sort_by_key(rule_priority);
        for msg in &msgs {
            println!("{}", describe_rule(msg));
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set default subscriber")?;

    let driver = DatapathDriver::default();

    match cli.command {
        Commands::TableId { eni_index } => {
            let table = checked_route_table_id(eni_index)
                .with_context(|| format!("eni index {eni_index} out of range"))?;
            println!("{table}");
        }

        Commands::Setup(pod) => {
            let ns = pod.open_netns()?;
            driver.setup(&pod.setup_config(), &ns).await?;
            println!("Datapath for {} ready", pod.host_link);
        }

        Commands::Teardown(pod) => {
            let ns = match &pod.netns {
                Some(path) => Some(NetNs::open(path)?),
                None => None,
            };
            driver.teardown(&pod.teardown_config(), ns.as_ref()).await?;
            println!("Datapath for {} removed", pod.host_link);
        }

        Commands::Check(pod) => {
            let ns = pod.open_netns()?;
            driver.check(&pod.setup_config(), &ns).await?;
            println!("Datapath for {} is consistent", pod.host_link);
        }

        Commands::Rules => list_rules().await?,

        Commands::Validate {
            config,
            host_link,
            ifname,
        } => {
            let conf = NetConf::load(&config)?;
            let alloc = conf.allocation()?;
            let eni_index = alloc.eni_index.unwrap_or(PRIMARY_ENI_INDEX);
            let setup = conf.to_setup_config(&host_link, &ifname, eni_index)?;
            setup.validate()?;
            println!("{setup:#?}");
            if let Some(table) = setup.route_table() {
                println!("route table {table}");
            } else if alloc.eni_mac.is_some() {
                println!("eni given by MAC, resolved on the node at ADD time");
            }
        }
    }

    Ok(())
}
