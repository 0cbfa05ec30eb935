use eni_veth::config::{EniRef, NetConf, DEFAULT_MTU};
use eni_veth::datapath::{route_table_id, PRIMARY_ENI_INDEX};
use tempfile::TempDir;

const POLICY_CONF: &str = r#"{
  "cniVersion": "1.0.0",
  "name": "eni",
  "type": "eni-veth",
  "mtu": 9001,
  "serviceCidrs": ["10.96.0.0/12"],
  "allocation": {
    "eniIndex": 3,
    "trunk": false,
    "ipv4": "169.10.0.10/24",
    "gatewayIpv4": "169.10.0.253",
    "hostIpv4": "169.20.20.10/32",
    "extraRoutes": [{"dst": "192.168.0.0/16"}],
    "ingress": 1000000,
    "egress": 2000000
  }
}"#;

#[test]
fn test_parse_policy_allocation() -> anyhow::Result<()> {
    let conf = NetConf::parse(POLICY_CONF.as_bytes())?;
    assert_eq!(conf.mtu, 9001);
    assert_eq!(conf.host_veth_prefix, "cali");

    let alloc = conf.allocation()?;
    assert_eq!(alloc.eni(), EniRef::Index(3));

    let setup = conf.to_setup_config("cali0123456789a", "eth0", 3)?;
    setup.validate()?;
    assert_eq!(setup.route_table(), Some(route_table_id(3)));
    assert_eq!(setup.extra_routes.len(), 1);
    assert_eq!(setup.service_cidrs.len(), 1);
    assert_eq!(setup.ingress_limit, 1_000_000);
    assert_eq!(setup.egress_limit, 2_000_000);
    assert!(setup.host_addresses.is_some());
    Ok(())
}

#[test]
fn test_defaults_apply() -> anyhow::Result<()> {
    let conf = NetConf::parse(
        br#"{"cniVersion":"1.0.0","name":"eni","type":"eni-veth",
             "allocation":{"ipv6":"fd00::10/64"}}"#,
    )?;
    assert_eq!(conf.mtu, DEFAULT_MTU);
    assert!(conf.enable_ipv4 && conf.enable_ipv6);
    assert_eq!(conf.allocation()?.eni(), EniRef::Primary);

    let setup = conf.to_setup_config("cali0123456789a", "eth0", PRIMARY_ENI_INDEX)?;
    assert_eq!(setup.route_table(), None);
    Ok(())
}

#[test]
fn test_invalid_configs_rejected() {
    let cases = [
        r#"{"cniVersion":"1.0.0","name":"n","type":"t","mtu":0,"allocation":{"ipv4":"10.0.0.2/24"}}"#,
        r#"{"cniVersion":"1.0.0","name":"n","type":"t","allocation":{}}"#,
        r#"{"cniVersion":"1.0.0","name":"n","type":"t","hostVethPrefix":"toolong","allocation":{"ipv4":"10.0.0.2/24"}}"#,
        r#"{"cniVersion":"1.0.0","name":"n","type":"t","allocation":{"ipv4":"10.0.0.2/24","eniIndex":2,"eniMac":"02:00:00:00:00:01"}}"#,
        r#"{"cniVersion":"1.0.0","name":"n","type":"t","allocation":{"ipv4":"10.0.0.2/24","eniMac":"nope"}}"#,
        r#"{"cniVersion":"1.0.0","name":"n","type":"t","allocation":{"ipv4":"not-an-address"}}"#,
    ];
    for case in cases {
        assert!(NetConf::parse(case.as_bytes()).is_err(), "accepted: {case}");
    }
}

#[test]
fn test_delete_without_allocation() -> anyhow::Result<()> {
    let conf = NetConf::parse(br#"{"cniVersion":"1.0.0","name":"eni","type":"eni-veth"}"#)?;
    assert!(conf.allocation().is_err());

    let teardown = conf.to_teardown_config("cali0123456789a", "eth0");
    assert_eq!(teardown.host_link_name, "cali0123456789a");
    assert!(teardown.container_addresses.is_none());
    Ok(())
}

#[test]
fn test_policy_without_gateway_fails_validation() -> anyhow::Result<()> {
    let conf = NetConf::parse(
        br#"{"cniVersion":"1.0.0","name":"eni","type":"eni-veth",
             "allocation":{"eniIndex":4,"ipv4":"169.10.0.10/24"}}"#,
    )?;
    let setup = conf.to_setup_config("cali0123456789a", "eth0", 4)?;
    assert!(setup.validate().is_err());
    Ok(())
}

#[test]
fn test_save_and_load() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("10-eni-veth.conf");

    let conf = NetConf::parse(POLICY_CONF.as_bytes())?;
    conf.save(&path)?;
    let loaded = NetConf::load(&path)?;

    assert_eq!(loaded.mtu, conf.mtu);
    assert_eq!(loaded.service_cidrs, conf.service_cidrs);
    assert_eq!(loaded.allocation()?.ipv4, conf.allocation()?.ipv4);
    assert_eq!(loaded.allocation()?.extra_routes, conf.allocation()?.extra_routes);

    assert!(NetConf::load(dir.path().join("missing.conf")).is_err());
    Ok(())
}
