// Integration tests for domain XML rewriting
use serde_json::json;
use std::sync::Arc;
use vmigrate::fake::{DomainCall, FakeDomain};
use vmigrate::xml_patch::*;
use vmigrate::{Guest, Result};

const DOMAIN: &str = r#"<domain type='kvm'>
  <name>web-1</name>
  <perf>
    <event name='cmt' enabled='yes'/>
    <event name='mbml' enabled='yes'/>
  </perf>
  <devices>
    <disk type='block' device='disk'>
      <driver name='qemu' type='raw' cache='none'/>
      <source dev='/dev/disk/by-path/ip-10.0.0.1:3260-iscsi-iqn.src-lun-1'/>
      <target dev='vdb' bus='virtio'/>
      <serial>vol-1</serial>
    </disk>
    <disk type='file' device='disk'>
      <source file='/var/lib/instances/web-1/disk'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <graphics type='vnc' port='-1' autoport='yes' listen='127.0.0.1'>
      <listen type='address' address='127.0.0.1'/>
    </graphics>
    <graphics type='spice' autoport='yes'>
      <listen type='address' address='127.0.0.1'/>
    </graphics>
    <serial type='tcp'>
      <source mode='bind' host='127.0.0.1' service='10000'/>
      <protocol type='raw'/>
    </serial>
    <console type='tcp'>
      <source mode='bind' host='127.0.0.1' service='10001'/>
    </console>
    <serial type='pty'>
      <source path='/dev/pts/3'/>
    </serial>
  </devices>
</domain>"#;

fn patch(data: &LiveMigrateData) -> Result<String> {
    update_guest_xml(DOMAIN, data, &ConnectionInfoResolver)
}

fn perf_block(xml: &str) -> &str {
    let start = xml.find("<perf").expect("perf element present");
    let end = xml[start..]
        .find("</perf>")
        .map(|i| start + i)
        .unwrap_or_else(|| start + xml[start..].find("/>").unwrap());
    &xml[start..end]
}

fn iscsi_bdm(dev: &str, serial: &str, path: &str) -> BdmInfo {
    BdmInfo {
        serial: serial.to_string(),
        dev: dev.to_string(),
        connection_info: json!({
            "driver_volume_type": "iscsi",
            "data": {"device_path": path}
        }),
        ..BdmInfo::default()
    }
}

#[test]
fn test_empty_data_only_clears_perf_events() {
    let xml = patch(&LiveMigrateData::default()).unwrap();

    assert_eq!(xml.matches("127.0.0.1").count(), 5);
    assert!(xml.contains("<perf>"));
    assert_eq!(perf_block(&xml).matches("<event").count(), 0);
    assert!(xml.contains("<serial>vol-1</serial>"));
}

#[test]
fn test_vnc_listen_address_only() {
    let data = LiveMigrateData {
        graphics_listen_addr_vnc: Some("10.0.0.5".to_string()),
        ..LiveMigrateData::default()
    };
    let xml = patch(&data).unwrap();

    assert!(xml.contains(
        r#"<graphics type="vnc" port="-1" autoport="yes" listen="10.0.0.5">"#
    ));
    assert_eq!(xml.matches(r#"address="10.0.0.5""#).count(), 1);
    // spice keeps its address
    assert_eq!(xml.matches(r#"address="127.0.0.1""#).count(), 1);
}

#[test]
fn test_both_graphics_listen_addresses() {
    let data = LiveMigrateData {
        graphics_listen_addr_vnc: Some("10.0.0.5".to_string()),
        graphics_listen_addr_spice: Some("10.0.0.6".to_string()),
        ..LiveMigrateData::default()
    };
    let xml = patch(&data).unwrap();

    assert!(xml.contains(r#"address="10.0.0.5""#));
    assert!(xml.contains(r#"address="10.0.0.6""#));
    assert!(!xml.contains(r#"address="127.0.0.1""#));
}

#[test]
fn test_serial_and_console_tcp_sources() {
    let data = LiveMigrateData {
        serial_listen_addr: Some("10.0.0.7".to_string()),
        ..LiveMigrateData::default()
    };
    let xml = patch(&data).unwrap();

    assert!(xml.contains(r#"<source mode="bind" host="10.0.0.7" service="10000"/>"#));
    assert!(xml.contains(r#"<source mode="bind" host="10.0.0.7" service="10001"/>"#));
    assert!(xml.contains(r#"<source path="/dev/pts/3"/>"#));
    // graphics untouched
    assert_eq!(xml.matches("127.0.0.1").count(), 3);
}

#[test]
fn test_perf_events_synced_to_supported_list() {
    let data = LiveMigrateData {
        supported_perf_events: vec!["cmt".to_string()],
        ..LiveMigrateData::default()
    };
    let xml = patch(&data).unwrap();
    let perf = perf_block(&xml);

    assert_eq!(perf.matches("<event").count(), 1);
    assert!(perf.contains(r#"<event name="cmt" enabled="yes"/>"#));
    assert!(!perf.contains("mbml"));
}

#[test]
fn test_perf_events_added_when_missing() {
    let data = LiveMigrateData {
        supported_perf_events: vec!["cmt".to_string(), "mbmt".to_string()],
        ..LiveMigrateData::default()
    };
    let xml = patch(&data).unwrap();
    let perf = perf_block(&xml);

    assert_eq!(perf.matches("<event").count(), 2);
    assert!(perf.contains(r#"<event name="mbmt" enabled="yes"/>"#));
}

#[test]
fn test_perf_element_created_when_absent() {
    let xml = "<domain type='kvm'><name>x</name><devices/></domain>";
    let data = LiveMigrateData {
        supported_perf_events: vec!["cmt".to_string()],
        ..LiveMigrateData::default()
    };
    let patched = update_guest_xml(xml, &data, &ConnectionInfoResolver).unwrap();
    assert!(patched.contains(r#"<perf><event name="cmt" enabled="yes"/></perf></domain>"#));

    let untouched =
        update_guest_xml(xml, &LiveMigrateData::default(), &ConnectionInfoResolver).unwrap();
    assert!(!untouched.contains("<perf"));
}

#[test]
fn test_volume_source_replaced() {
    let data = LiveMigrateData {
        bdms: vec![iscsi_bdm("vdb", "vol-1", "/dev/disk/by-path/dest-lun-1")],
        ..LiveMigrateData::default()
    };
    let xml = patch(&data).unwrap();

    assert!(xml.contains(r#"<source dev="/dev/disk/by-path/dest-lun-1"/>"#));
    assert!(!xml.contains("iqn.src-lun-1"));
    // local disk untouched
    assert!(xml.contains(r#"<source file="/var/lib/instances/web-1/disk"/>"#));
}

#[test]
fn test_volume_type_and_format_follow_destination() {
    let mut bdm = iscsi_bdm("vdb", "vol-1", "");
    bdm.format = Some("qcow2".to_string());
    bdm.connection_info = json!({
        "driver_volume_type": "nfs",
        "data": {"device_path": "/mnt/nfs/volume-vol-1"}
    });
    let data = LiveMigrateData {
        bdms: vec![bdm],
        ..LiveMigrateData::default()
    };
    let xml = patch(&data).unwrap();

    assert!(xml.contains(r#"<disk type="file" device="disk">"#));
    assert!(xml.contains(r#"<source file="/mnt/nfs/volume-vol-1"/>"#));
    assert!(xml.contains(r#"<driver name="qemu" type="qcow2" cache="none"/>"#));
}

#[test]
fn test_volume_with_mismatched_serial_is_left_alone() {
    let data = LiveMigrateData {
        bdms: vec![iscsi_bdm("vdb", "vol-other", "/dev/sdz")],
        supported_perf_events: vec!["cmt".to_string()],
        ..LiveMigrateData::default()
    };
    let xml = patch(&data).unwrap();

    assert!(!xml.contains("/dev/sdz"));
    assert!(xml.contains("iqn.src-lun-1"));
    assert!(xml.contains("<serial>vol-1</serial>"));
    // the rest of the document is still rewritten
    assert!(perf_block(&xml).contains(r#"name="cmt""#));
}

const RBD_DOMAIN: &str = r#"<domain type='kvm'>
  <devices>
    <disk type='network' device='disk'>
      <driver name='qemu' type='raw'/>
      <source protocol='rbd' name='volumes/vol-1'>
        <host name='10.0.1.1' port='6789'/>
        <host name='10.0.1.2' port='6789'/>
      </source>
      <target dev='vdb' bus='virtio'/>
      <serial>vol-1</serial>
    </disk>
  </devices>
</domain>"#;

fn rbd_bdm(data: serde_json::Value) -> BdmInfo {
    BdmInfo {
        serial: "vol-1".to_string(),
        dev: "vdb".to_string(),
        connection_info: json!({"driver_volume_type": "rbd", "data": data}),
        ..BdmInfo::default()
    }
}

#[test]
fn test_network_volume_keeps_hosts() {
    let data = LiveMigrateData {
        bdms: vec![rbd_bdm(json!({"name": "volumes/vol-1-dest"}))],
        ..LiveMigrateData::default()
    };
    let xml = update_guest_xml(RBD_DOMAIN, &data, &ConnectionInfoResolver).unwrap();

    assert!(xml.contains(r#"<source protocol="rbd" name="volumes/vol-1-dest">"#));
    assert!(xml.contains(r#"<host name="10.0.1.1" port="6789"/>"#));
    assert!(xml.contains(r#"<host name="10.0.1.2" port="6789"/>"#));
}

#[test]
fn test_network_volume_hosts_from_connection_info() {
    let data = LiveMigrateData {
        bdms: vec![rbd_bdm(json!({
            "name": "volumes/vol-1",
            "hosts": ["10.0.2.1", "10.0.2.2", "10.0.2.3"],
            "ports": ["6789", "6789", "6789"]
        }))],
        ..LiveMigrateData::default()
    };
    let xml = update_guest_xml(RBD_DOMAIN, &data, &ConnectionInfoResolver).unwrap();

    assert_eq!(xml.matches("<host ").count(), 3);
    assert!(xml.contains(r#"<host name="10.0.2.3" port="6789"/>"#));
    assert!(!xml.contains("10.0.1.1"));
}

#[test]
fn test_volume_for_unknown_device_is_skipped() {
    let mut bdm = iscsi_bdm("vdz", "vol-9", "/dev/sdz");
    bdm.connection_info = json!({"driver_volume_type": "quobyte"});
    let data = LiveMigrateData {
        bdms: vec![bdm],
        ..LiveMigrateData::default()
    };

    let xml = patch(&data).unwrap();
    assert!(!xml.contains("/dev/sdz"));
}

struct FixedResolver;

impl VolumeConfigResolver for FixedResolver {
    fn resolve(&self, bdm: &BdmInfo) -> Result<DiskConfig> {
        Ok(DiskConfig {
            source_type: DiskSourceType::Network {
                protocol: "rbd".to_string(),
                hosts: Vec::new(),
            },
            source_path: format!("volumes/{}", bdm.serial),
            serial: None,
            format: None,
        })
    }
}

#[test]
fn test_custom_resolver() {
    let data = LiveMigrateData {
        bdms: vec![iscsi_bdm("vdb", "vol-1", "/unused")],
        ..LiveMigrateData::default()
    };
    let xml = update_guest_xml(DOMAIN, &data, &FixedResolver).unwrap();

    assert!(xml.contains(r#"<disk type="network" device="disk">"#));
    assert!(xml.contains(r#"<source protocol="rbd" name="volumes/vol-1"/>"#));
}

#[tokio::test]
async fn test_updated_xml_uses_migratable_description() {
    let domain = Arc::new(FakeDomain::new("web-1"));
    domain.set_xml(DOMAIN);
    let guest = Guest::new(domain.clone());

    let data = LiveMigrateData {
        graphics_listen_addr_spice: Some("10.0.0.6".to_string()),
        supported_perf_events: vec!["cmt".to_string(), "mbml".to_string()],
        ..LiveMigrateData::default()
    };
    let xml = get_updated_guest_xml(&guest, &data, &ConnectionInfoResolver)
        .await
        .unwrap();

    assert_eq!(domain.count(DomainCall::XmlDesc), 1);
    assert!(xml.contains(r#"address="10.0.0.6""#));
    assert_eq!(perf_block(&xml).matches("<event").count(), 2);
}
