use anyhow::{Context, Result};
use std::collections::HashMap;
use std::env;
use std::io::{self, Read};
use tokio::runtime::Runtime;

use crate::config::{ConfigError, NetConf};
use crate::datapath::{DatapathError, ErrorKind};
use crate::plugin::VethPlugin;
use crate::types::{CmdArgs, ErrorReply};

/// CNI version reported when the request carried none
pub const DEFAULT_CNI_VERSION: &str = "1.0.0";
/// Versions this plugin can speak
pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

/// Invalid network configuration
pub const CODE_INVALID_CONFIG: u32 = 7;
/// Transient failure, the runtime may retry
pub const CODE_TRY_AGAIN_LATER: u32 = 11;
/// Any other plugin failure
pub const CODE_INTERNAL: u32 = 100;

/// Parse command arguments from environment
pub fn parse_args() -> Result<CmdArgs> {
    // Get required environment variables
    let container_id = env::var("CNI_CONTAINERID")
        .context("CNI_CONTAINERID not found in environment")?;

    // May be empty on DEL once the sandbox is gone
    let netns = env::var("CNI_NETNS").unwrap_or_default();

    let ifname = env::var("CNI_IFNAME")
        .context("CNI_IFNAME not found in environment")?;

    let path = env::var("CNI_PATH").unwrap_or_default();

    let args_str = env::var("CNI_ARGS").unwrap_or_default();
    let args = parse_cni_args(&args_str);

    let mut stdin_data = Vec::new();
    io::stdin().read_to_end(&mut stdin_data)
        .context("Failed to read from stdin")?;

    Ok(CmdArgs {
        container_id,
        netns,
        ifname,
        args,
        path,
        stdin_data,
    })
}

/// Parse CNI_ARGS string into key-value pairs
pub fn parse_cni_args(args_str: &str) -> HashMap<String, String> {
    args_str
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

fn plugin_from_env() -> Result<VethPlugin> {
    let args = parse_args()?;
    let conf = NetConf::parse(&args.stdin_data)?;
    Ok(VethPlugin::new(conf, args))
}

/// Execute the add command
pub fn cmd_add() -> Result<()> {
    let plugin = plugin_from_env()?;

    let runtime = Runtime::new().context("Failed to create Tokio runtime")?;
    let result = runtime.block_on(plugin.add_network())?;

    result.print()?;
    Ok(())
}

/// Execute the delete command
pub fn cmd_del() -> Result<()> {
    let plugin = plugin_from_env()?;

    let runtime = Runtime::new().context("Failed to create Tokio runtime")?;
    runtime.block_on(plugin.del_network())?;
    Ok(())
}

/// Execute the check command
pub fn cmd_check() -> Result<()> {
    let plugin = plugin_from_env()?;

    let runtime = Runtime::new().context("Failed to create Tokio runtime")?;
    runtime.block_on(plugin.check_network())?;
    Ok(())
}

/// Reply to the VERSION command
pub fn version_reply() -> String {
    serde_json::json!({
        "cniVersion": DEFAULT_CNI_VERSION,
        "supportedVersions": SUPPORTED_VERSIONS,
    })
    .to_string()
}

/// Main entry point for the CNI plugin
pub fn run_cni() -> Result<()> {
    let cmd = env::var("CNI_COMMAND")
        .context("CNI_COMMAND not found in environment")?;

    match cmd.as_str() {
        "ADD" => cmd_add(),
        "DEL" => cmd_del(),
        "CHECK" => cmd_check(),
        "VERSION" => {
            println!("{}", version_reply());
            Ok(())
        }
        _ => Err(ConfigError(format!("Unknown CNI command: {cmd}")).into()),
    }
}

/// CNI error code for a failed command
pub fn error_code(err: &anyhow::Error) -> u32 {
    for cause in err.chain() {
        if cause.is::<ConfigError>() || cause.is::<serde_json::Error>() {
            return CODE_INVALID_CONFIG;
        }
        if let Some(err) = cause.downcast_ref::<DatapathError>() {
            return match err.kind() {
                ErrorKind::ValidationFailure => CODE_INVALID_CONFIG,
                ErrorKind::KernelOperationFailure => CODE_TRY_AGAIN_LATER,
                ErrorKind::NotFound | ErrorKind::Conflict => CODE_INTERNAL,
            };
        }
    }
    CODE_INTERNAL
}

/// CNI error object for a failed command
pub fn error_reply(err: &anyhow::Error) -> ErrorReply {
    let details = err
        .chain()
        .skip(1)
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(": ");
    ErrorReply {
        cni_version: DEFAULT_CNI_VERSION.to_string(),
        code: error_code(err),
        msg: err.to_string(),
        details,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cni_args_split() {
        let args = parse_cni_args("IgnoreUnknown=1;K8S_POD_NAMESPACE=default;K8S_POD_NAME=web-0");
        assert_eq!(args.len(), 3);
        assert_eq!(args["K8S_POD_NAME"], "web-0");
        assert!(parse_cni_args("").is_empty());
        assert!(parse_cni_args("novalue;=x").is_empty());
    }

    #[test]
    fn codes_follow_error_kind() {
        let invalid = anyhow::Error::new(DatapathError::Validation("mtu".into()))
            .context("Failed to set up datapath");
        assert_eq!(error_code(&invalid), CODE_INVALID_CONFIG);

        let busy = anyhow::Error::new(DatapathError::Io {
            op: "add route".into(),
            reason: io::Error::new(io::ErrorKind::TimedOut, "timeout"),
        });
        assert_eq!(error_code(&busy), CODE_TRY_AGAIN_LATER);

        let conflict = anyhow::Error::new(DatapathError::conflict("link veth1"));
        assert_eq!(error_code(&conflict), CODE_INTERNAL);

        let config: anyhow::Error = ConfigError("allocation is required".into()).into();
        assert_eq!(error_code(&config), CODE_INVALID_CONFIG);

        assert_eq!(error_code(&anyhow::anyhow!("boom")), CODE_INTERNAL);
    }

    #[test]
    fn reply_carries_context_chain() {
        let err = anyhow::Error::new(DatapathError::not_found("link eth0"))
            .context("Check failed for cali0123456789a");
        let reply = error_reply(&err);
        assert_eq!(reply.msg, "Check failed for cali0123456789a");
        assert_eq!(reply.details, "link eth0 not found");
        assert_eq!(reply.code, CODE_INTERNAL);
    }

    #[test]
    fn version_lists_supported() {
        let reply: serde_json::Value = serde_json::from_str(&version_reply()).unwrap();
        assert_eq!(reply["cniVersion"], "1.0.0");
        assert_eq!(reply["supportedVersions"].as_array().unwrap().len(), 4);
    }
}
