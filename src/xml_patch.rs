//! Pre-migration rewrites of a guest's domain XML.
//!
//! The document is parsed once into a small element tree, patched in place
//! and written back. Attribute quoting is normalised to double quotes;
//! text, comments and declarations are passed through untouched.

use crate::guest::Guest;
use crate::hypervisor::XmlFlags;
use crate::{MigrationError, Result, log_debug, log_warn};
use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

/// Destination-side facts needed to rewrite the domain XML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LiveMigrateData {
    #[serde(default)]
    pub graphics_listen_addr_vnc: Option<String>,
    #[serde(default)]
    pub graphics_listen_addr_spice: Option<String>,
    #[serde(default)]
    pub serial_listen_addr: Option<String>,
    #[serde(default)]
    pub supported_perf_events: Vec<String>,
    #[serde(default)]
    pub bdms: Vec<BdmInfo>,
    /// Overrides the destination host in the migration URI.
    #[serde(default)]
    pub target_connect_addr: Option<String>,
    #[serde(default)]
    pub block_migration: bool,
}

/// One attached volume as seen on the destination.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BdmInfo {
    pub serial: String,
    pub dev: String,
    #[serde(default)]
    pub bus: Option<String>,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub boot_index: Option<i32>,
    #[serde(default)]
    pub connection_info: Value,
}

/// A monitor or server a network disk connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkHost {
    pub name: String,
    pub port: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskSourceType {
    Block,
    File,
    /// An empty `hosts` leaves the existing `<host>` children in place.
    Network {
        protocol: String,
        hosts: Vec<NetworkHost>,
    },
}

const SOURCE_PATH_ATTRS: [&str; 4] = ["dev", "file", "protocol", "name"];

impl DiskSourceType {
    fn disk_type(&self) -> &'static str {
        match self {
            DiskSourceType::Block => "block",
            DiskSourceType::File => "file",
            DiskSourceType::Network { .. } => "network",
        }
    }

    /// Point `source` at `path`, keeping unrelated attributes and children.
    fn apply_to(&self, source: &mut Element, path: &str) {
        source
            .attrs
            .retain(|(key, _)| !SOURCE_PATH_ATTRS.contains(&key.as_str()));

        match self {
            DiskSourceType::Block => {
                source.set_attr("dev", path);
                source.retain_elements(|el| el.name != "host");
            }
            DiskSourceType::File => {
                source.set_attr("file", path);
                source.retain_elements(|el| el.name != "host");
            }
            DiskSourceType::Network { protocol, hosts } => {
                source.set_attr("protocol", protocol);
                source.set_attr("name", path);
                if !hosts.is_empty() {
                    source.retain_elements(|el| el.name != "host");
                    for host in hosts {
                        let mut el = Element::new("host").with_attr("name", &host.name);
                        if let Some(port) = host.port.as_deref() {
                            el.set_attr("port", port);
                        }
                        source.push_child(el);
                    }
                }
            }
        }
    }
}

/// Disk source as resolved for the destination host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskConfig {
    pub source_type: DiskSourceType,
    pub source_path: String,
    pub serial: Option<String>,
    pub format: Option<String>,
}

pub trait VolumeConfigResolver: Send + Sync {
    fn resolve(&self, bdm: &BdmInfo) -> Result<DiskConfig>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VolumeDriver {
    Iscsi,
    FibreChannel,
    Local,
    Block,
    Nfs,
    Glusterfs,
    Scality,
    File,
    Rbd,
    Sheepdog,
    Network,
}

impl FromStr for VolumeDriver {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "iscsi" => Ok(VolumeDriver::Iscsi),
            "fibre_channel" => Ok(VolumeDriver::FibreChannel),
            "local" => Ok(VolumeDriver::Local),
            "block" => Ok(VolumeDriver::Block),
            "nfs" => Ok(VolumeDriver::Nfs),
            "glusterfs" => Ok(VolumeDriver::Glusterfs),
            "scality" => Ok(VolumeDriver::Scality),
            "file" => Ok(VolumeDriver::File),
            "rbd" => Ok(VolumeDriver::Rbd),
            "sheepdog" => Ok(VolumeDriver::Sheepdog),
            "network" => Ok(VolumeDriver::Network),
            other => Err(MigrationError::UnsupportedVolumeDriver(other.to_string())),
        }
    }
}

/// Resolves disk sources from a volume's `connection_info` blob.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionInfoResolver;

impl VolumeConfigResolver for ConnectionInfoResolver {
    fn resolve(&self, bdm: &BdmInfo) -> Result<DiskConfig> {
        let info = &bdm.connection_info;
        let driver_type = info
            .get("driver_volume_type")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                MigrationError::InvalidConnectionInfo(format!(
                    "no driver_volume_type for '{}'",
                    bdm.dev
                ))
            })?;
        let driver: VolumeDriver = driver_type.parse()?;

        let field = |key: &str| -> Result<String> {
            info.get("data")
                .and_then(|data| data.get(key))
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    MigrationError::InvalidConnectionInfo(format!(
                        "{} volume for '{}' has no '{}'",
                        driver_type, bdm.dev, key
                    ))
                })
        };

        let (source_type, source_path) = match driver {
            VolumeDriver::Iscsi
            | VolumeDriver::FibreChannel
            | VolumeDriver::Local
            | VolumeDriver::Block => (DiskSourceType::Block, field("device_path")?),
            VolumeDriver::Nfs
            | VolumeDriver::Glusterfs
            | VolumeDriver::Scality
            | VolumeDriver::File => (DiskSourceType::File, field("device_path")?),
            VolumeDriver::Rbd | VolumeDriver::Sheepdog => (
                DiskSourceType::Network {
                    protocol: driver_type.to_string(),
                    hosts: network_hosts(info),
                },
                field("name")?,
            ),
            VolumeDriver::Network => (
                DiskSourceType::Network {
                    protocol: field("protocol")?,
                    hosts: network_hosts(info),
                },
                field("name")?,
            ),
        };

        Ok(DiskConfig {
            source_type,
            source_path,
            serial: (!bdm.serial.is_empty()).then(|| bdm.serial.clone()),
            format: bdm.format.clone(),
        })
    }
}

/// Pair `data.hosts` with `data.ports`; ports may be strings or numbers.
fn network_hosts(info: &Value) -> Vec<NetworkHost> {
    let list = |key: &str| -> Vec<Value> {
        info.get("data")
            .and_then(|data| data.get(key))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    };
    let ports = list("ports");

    list("hosts")
        .iter()
        .enumerate()
        .filter_map(|(i, host)| {
            let name = host.as_str()?.to_string();
            let port = ports.get(i).and_then(|port| match port {
                Value::String(p) => Some(p.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            });
            Some(NetworkHost { name, port })
        })
        .collect()
}

#[derive(Debug, Clone)]
enum Node {
    Element(Element),
    Other(Event<'static>),
}

#[derive(Debug, Clone)]
struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    fn from_start(start: &BytesStart<'_>) -> Result<Self> {
        let mut element = Element::new(&String::from_utf8_lossy(start.name().as_ref()));
        for attr in start.attributes() {
            let attr = attr?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value()?.into_owned();
            element.attrs.push((key, value));
        }
        Ok(element)
    }

    fn with_attr(mut self, key: &str, value: &str) -> Self {
        self.set_attr(key, value);
        self
    }

    fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn set_attr(&mut self, key: &str, value: &str) {
        match self.attrs.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value.to_string(),
            None => self.attrs.push((key.to_string(), value.to_string())),
        }
    }

    fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(el) => Some(el),
            Node::Other(_) => None,
        })
    }

    fn elements_mut(&mut self) -> impl Iterator<Item = &mut Element> {
        self.children.iter_mut().filter_map(|node| match node {
            Node::Element(el) => Some(el),
            Node::Other(_) => None,
        })
    }

    fn child(&self, name: &str) -> Option<&Element> {
        self.elements().find(|el| el.name == name)
    }

    fn child_mut(&mut self, name: &str) -> Option<&mut Element> {
        self.elements_mut().find(|el| el.name == name)
    }

    fn push_child(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    fn retain_elements<F: FnMut(&Element) -> bool>(&mut self, mut keep: F) {
        self.children.retain(|node| match node {
            Node::Element(el) => keep(el),
            Node::Other(_) => true,
        });
    }

    fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Other(Event::Text(text)) => Some(String::from_utf8_lossy(text).into_owned()),
                _ => None,
            })
            .collect()
    }

    /// Depth-first, parents before children.
    fn visit_mut<F>(&mut self, f: &mut F) -> Result<()>
    where
        F: FnMut(&mut Element) -> Result<()>,
    {
        f(self)?;
        for child in self.elements_mut() {
            child.visit_mut(f)?;
        }
        Ok(())
    }
}

struct Document {
    nodes: Vec<Node>,
}

impl Document {
    fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        let mut stack: Vec<Element> = Vec::new();
        let mut nodes = Vec::new();

        loop {
            match reader.read_event()? {
                Event::Start(start) => stack.push(Element::from_start(&start)?),
                Event::Empty(start) => {
                    let element = Element::from_start(&start)?;
                    append(&mut stack, &mut nodes, Node::Element(element));
                }
                Event::End(_) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| MigrationError::Xml("unexpected closing tag".to_string()))?;
                    append(&mut stack, &mut nodes, Node::Element(element));
                }
                Event::Eof => break,
                other => append(&mut stack, &mut nodes, Node::Other(other.into_owned())),
            }
        }

        if let Some(open) = stack.last() {
            return Err(MigrationError::Xml(format!("unclosed element <{}>", open.name)));
        }
        Ok(Self { nodes })
    }

    fn domain_mut(&mut self) -> Result<&mut Element> {
        let root = self
            .nodes
            .iter_mut()
            .find_map(|node| match node {
                Node::Element(el) => Some(el),
                Node::Other(_) => None,
            })
            .ok_or_else(|| MigrationError::Xml("document has no root element".to_string()))?;

        if root.name != "domain" {
            return Err(MigrationError::Xml(format!(
                "expected <domain> root, found <{}>",
                root.name
            )));
        }
        Ok(root)
    }

    fn serialize(&self) -> Result<String> {
        let mut writer = Writer::new(Vec::new());
        for node in &self.nodes {
            write_node(&mut writer, node)?;
        }
        String::from_utf8(writer.into_inner()).map_err(|e| MigrationError::Xml(e.to_string()))
    }
}

fn append(stack: &mut [Element], nodes: &mut Vec<Node>, node: Node) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None => nodes.push(node),
    }
}

fn write_event(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<()> {
    writer
        .write_event(event)
        .map_err(|e| MigrationError::Xml(e.to_string()))
}

fn write_node(writer: &mut Writer<Vec<u8>>, node: &Node) -> Result<()> {
    match node {
        Node::Element(el) => {
            let mut start = BytesStart::new(el.name.as_str());
            for (key, value) in &el.attrs {
                start.push_attribute((key.as_str(), value.as_str()));
            }
            if el.children.is_empty() {
                write_event(writer, Event::Empty(start))
            } else {
                write_event(writer, Event::Start(start))?;
                for child in &el.children {
                    write_node(writer, child)?;
                }
                write_event(writer, Event::End(BytesEnd::new(el.name.as_str())))
            }
        }
        Node::Other(event) => write_event(writer, event.clone()),
    }
}

fn update_graphics(domain: &mut Element, data: &LiveMigrateData) -> Result<()> {
    domain.visit_mut(&mut |el: &mut Element| {
        if el.name != "graphics" {
            return Ok(());
        }
        let addr = match el.attr("type") {
            Some("vnc") => data.graphics_listen_addr_vnc.as_deref(),
            Some("spice") => data.graphics_listen_addr_spice.as_deref(),
            _ => None,
        };
        let Some(addr) = addr else {
            return Ok(());
        };

        if el.attr("listen").is_some() {
            el.set_attr("listen", addr);
        }
        for listen in el
            .elements_mut()
            .filter(|child| child.name == "listen" && child.attr("type") == Some("address"))
        {
            listen.set_attr("address", addr);
        }
        Ok(())
    })
}

fn update_serial(domain: &mut Element, data: &LiveMigrateData) -> Result<()> {
    let Some(addr) = data.serial_listen_addr.as_deref() else {
        return Ok(());
    };

    domain.visit_mut(&mut |el: &mut Element| {
        if (el.name == "serial" || el.name == "console") && el.attr("type") == Some("tcp") {
            for source in el.elements_mut().filter(|child| child.name == "source") {
                source.set_attr("host", addr);
            }
        }
        Ok(())
    })
}

fn update_perf_events(domain: &mut Element, events: &[String]) {
    if domain.child("perf").is_none() {
        if events.is_empty() {
            return;
        }
        domain.push_child(Element::new("perf"));
    }
    let Some(perf) = domain.child_mut("perf") else {
        return;
    };

    perf.retain_elements(|el| {
        el.name != "event"
            || el
                .attr("name")
                .is_some_and(|name| events.iter().any(|e| e == name))
    });

    let present: Vec<String> = perf
        .elements()
        .filter(|el| el.name == "event")
        .filter_map(|el| el.attr("name").map(str::to_string))
        .collect();

    for name in events {
        if !present.contains(name) {
            perf.push_child(
                Element::new("event")
                    .with_attr("name", name)
                    .with_attr("enabled", "yes"),
            );
        }
    }
}

fn find_disk_mut<'a>(domain: &'a mut Element, dev: &str) -> Option<&'a mut Element> {
    domain.child_mut("devices")?.elements_mut().find(|el| {
        el.name == "disk" && el.child("target").and_then(|t| t.attr("dev")) == Some(dev)
    })
}

fn apply_disk_config(disk: &mut Element, config: &DiskConfig) {
    disk.set_attr("type", config.source_type.disk_type());

    match disk.child_mut("source") {
        Some(source) => config.source_type.apply_to(source, &config.source_path),
        None => {
            let mut source = Element::new("source");
            config.source_type.apply_to(&mut source, &config.source_path);
            disk.children.insert(0, Node::Element(source));
        }
    }

    if let Some(format) = config.format.as_deref() {
        if let Some(driver) = disk.child_mut("driver") {
            driver.set_attr("type", format);
        }
    }
}

fn update_volumes(
    domain: &mut Element,
    bdms: &[BdmInfo],
    resolver: &dyn VolumeConfigResolver,
) -> Result<()> {
    for bdm in bdms {
        let Some(disk) = find_disk_mut(domain, &bdm.dev) else {
            log_debug!("No disk with target '{}' in domain XML, skipping", bdm.dev);
            continue;
        };
        let config = resolver.resolve(bdm)?;

        let existing = disk.child("serial").map(|el| el.text().trim().to_string());
        if let (Some(found), Some(expected)) = (config.serial.as_deref(), existing.as_deref()) {
            if expected != found {
                log_warn!(
                    "Disk '{}' has serial '{}' but volume serial is '{}', leaving it unchanged",
                    bdm.dev,
                    expected,
                    found
                );
                continue;
            }
        }

        apply_disk_config(disk, &config);
    }
    Ok(())
}

/// Apply every destination rewrite to `xml` and return the new document.
pub fn update_guest_xml(
    xml: &str,
    data: &LiveMigrateData,
    resolver: &dyn VolumeConfigResolver,
) -> Result<String> {
    let mut doc = Document::parse(xml)?;
    let domain = doc.domain_mut()?;

    update_graphics(domain, data)?;
    update_serial(domain, data)?;
    update_volumes(domain, &data.bdms, resolver)?;
    update_perf_events(domain, &data.supported_perf_events);

    doc.serialize()
}

/// Fetch the guest's migratable XML and rewrite it for the destination.
pub async fn get_updated_guest_xml(
    guest: &Guest,
    data: &LiveMigrateData,
    resolver: &dyn VolumeConfigResolver,
) -> Result<String> {
    let xml = guest.get_xml_desc(XmlFlags::migratable()).await?;
    update_guest_xml(&xml, data, resolver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bdm(dev: &str, serial: &str, connection_info: Value) -> BdmInfo {
        BdmInfo {
            serial: serial.to_string(),
            dev: dev.to_string(),
            connection_info,
            ..BdmInfo::default()
        }
    }

    #[test]
    fn resolver_maps_driver_types() {
        let resolver = ConnectionInfoResolver;

        let iscsi = bdm(
            "vdb",
            "vol-1",
            json!({"driver_volume_type": "iscsi", "data": {"device_path": "/dev/sdc"}}),
        );
        let config = resolver.resolve(&iscsi).unwrap();
        assert_eq!(config.source_type, DiskSourceType::Block);
        assert_eq!(config.source_path, "/dev/sdc");
        assert_eq!(config.serial.as_deref(), Some("vol-1"));

        let nfs = bdm(
            "vdc",
            "",
            json!({"driver_volume_type": "nfs", "data": {"device_path": "/mnt/nfs/vol"}}),
        );
        let config = resolver.resolve(&nfs).unwrap();
        assert_eq!(config.source_type, DiskSourceType::File);
        assert_eq!(config.serial, None);

        let rbd = bdm(
            "vdd",
            "vol-3",
            json!({"driver_volume_type": "rbd", "data": {"name": "volumes/vol-3"}}),
        );
        let config = resolver.resolve(&rbd).unwrap();
        assert_eq!(
            config.source_type,
            DiskSourceType::Network {
                protocol: "rbd".to_string(),
                hosts: Vec::new(),
            }
        );
        assert_eq!(config.source_path, "volumes/vol-3");
    }

    #[test]
    fn resolver_pairs_hosts_with_ports() {
        let rbd = bdm(
            "vdd",
            "vol-3",
            json!({
                "driver_volume_type": "rbd",
                "data": {
                    "name": "volumes/vol-3",
                    "hosts": ["10.0.1.1", "10.0.1.2"],
                    "ports": ["6789", 6790]
                }
            }),
        );
        let config = ConnectionInfoResolver.resolve(&rbd).unwrap();
        assert_eq!(
            config.source_type,
            DiskSourceType::Network {
                protocol: "rbd".to_string(),
                hosts: vec![
                    NetworkHost {
                        name: "10.0.1.1".to_string(),
                        port: Some("6789".to_string()),
                    },
                    NetworkHost {
                        name: "10.0.1.2".to_string(),
                        port: Some("6790".to_string()),
                    },
                ],
            }
        );
    }

    #[test]
    fn resolver_rejects_unknown_driver() {
        let volume = bdm("vdb", "vol-1", json!({"driver_volume_type": "quobyte"}));
        let err = ConnectionInfoResolver.resolve(&volume).unwrap_err();
        assert!(matches!(err, MigrationError::UnsupportedVolumeDriver(t) if t == "quobyte"));
    }

    #[test]
    fn resolver_requires_device_path() {
        let volume = bdm("vdb", "vol-1", json!({"driver_volume_type": "iscsi", "data": {}}));
        let err = ConnectionInfoResolver.resolve(&volume).unwrap_err();
        assert!(matches!(err, MigrationError::InvalidConnectionInfo(_)));
    }

    #[test]
    fn element_tree_round_trips_untouched_content() {
        let xml = "<?xml version=\"1.0\"?><!-- keep --><domain type=\"kvm\"><name>a &amp; b</name><devices/></domain>";
        let doc = Document::parse(xml).unwrap();
        assert_eq!(doc.serialize().unwrap(), xml);
    }

    #[test]
    fn rejects_unbalanced_documents() {
        assert!(Document::parse("<domain><devices></domain>").is_err());
        assert!(Document::parse("<domain>").is_err());
    }

    #[test]
    fn rejects_non_domain_root() {
        let err = update_guest_xml(
            "<network/>",
            &LiveMigrateData::default(),
            &ConnectionInfoResolver,
        )
        .unwrap_err();
        assert!(matches!(err, MigrationError::Xml(_)));
    }
}
