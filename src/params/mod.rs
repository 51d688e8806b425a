//! Deployment parameters: the immutable configuration tree for one VM.
//!
//! The parameter file is YAML. It is kept as a [`serde_json::Value`] tree so
//! templates can address any leaf by dotted path, and it is also discovered
//! once into typed, ordered records. Numbered groups (`user1`, `user2`,
//! `net1`, ...) are found in a single pass over the top-level keys; the block
//! generators only ever see the resulting lists.

mod datastore;
mod error;

use std::collections::BTreeMap;

use camino::Utf8Path;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Number, Value};

use crate::files;

pub use datastore::DatastorePath;
pub use error::ParamsError;

const USER_PREFIX: &str = "user";
const INTERFACE_PREFIX: &str = "net";

/// VM identity, sizing and placement.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct VmSpec {
    /// Name of the VM in the control plane inventory.
    pub name: String,
    /// Template (or source VM) to clone from.
    pub template: Option<String>,
    /// Number of virtual CPUs.
    pub cpus: Option<u32>,
    /// Memory size in MiB.
    pub memory_mb: Option<u64>,
    /// Datacenter used to scope inventory paths.
    pub datacenter: Option<String>,
    /// Resource pool receiving the clone.
    pub resource_pool: Option<String>,
    /// Datastore holding the clone's disks.
    pub datastore: Option<String>,
    /// Inventory folder for the clone.
    pub folder: Option<String>,
    /// Host to place the clone on.
    pub host: Option<String>,
}

/// One virtual disk of the clone.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct DiskSpec {
    /// Device label in the control plane (defaults to `disk-1000-<index>`).
    pub name: Option<String>,
    /// Requested size in GiB; the disk is grown when set.
    pub size_gb: Option<u64>,
    /// Mount point whose filesystem is grown on first boot.
    pub resize_target: Option<String>,
}

impl DiskSpec {
    /// Control-plane label for the disk at `index` in declared order.
    #[must_use]
    pub fn label(&self, index: usize) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("disk-1000-{index}"))
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawUser {
    #[serde(default)]
    name: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    groups: Vec<String>,
    #[serde(default)]
    ssh_keys: Option<Vec<String>>,
    #[serde(default)]
    primary: bool,
}

/// A declared guest user (`userN` section).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UserRecord {
    /// Numeric suffix of the section key.
    pub number: u32,
    /// Login name.
    pub name: String,
    /// Credential material (plain or pre-hashed, passed through verbatim).
    pub password: String,
    /// Supplementary groups.
    pub groups: Vec<String>,
    /// Authorised SSH public keys.
    pub ssh_keys: Vec<String>,
    /// Whether this user is the primary (legacy) account.
    pub primary: bool,
}

impl UserRecord {
    /// Top-level key this record was discovered under.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{USER_PREFIX}{}", self.number)
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawInterface {
    #[serde(default)]
    device: String,
    address: Option<String>,
    prefix: Option<u8>,
    gateway: Option<String>,
    #[serde(default)]
    nameservers: Option<Vec<String>>,
    #[serde(default)]
    disable_auto_routes: bool,
    #[serde(default)]
    disable_auto_dns: bool,
    #[serde(default)]
    disable_ipv6: bool,
}

/// A declared network interface (`netN` section).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InterfaceSpec {
    /// Numeric suffix of the section key.
    pub number: u32,
    /// Guest device name (for example `ens192`).
    pub device: String,
    /// Static IPv4 address.
    pub address: Option<String>,
    /// Prefix length for [`Self::address`].
    pub prefix: Option<u8>,
    /// Default gateway.
    pub gateway: Option<String>,
    /// DNS servers, in declared order.
    pub nameservers: Vec<String>,
    /// Ignore routes learned from DHCP/RA.
    pub disable_auto_routes: bool,
    /// Ignore DNS servers learned from DHCP/RA.
    pub disable_auto_dns: bool,
    /// Disable IPv6 on the interface.
    pub disable_ipv6: bool,
}

impl InterfaceSpec {
    /// Top-level key this record was discovered under.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{INTERFACE_PREFIX}{}", self.number)
    }
}

/// One entry of the `swaps` mapping.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SwapDevice {
    /// Key as written in the parameter file.
    pub key: String,
    /// Guest block device.
    pub device: String,
}

/// Per-deployment timing overrides (`timeouts` section), in seconds.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TimeoutOverrides {
    /// Total wait for a power transition.
    pub power_wait_secs: Option<u64>,
    /// Wait for the guest command channel after power-on.
    pub channel_ready_secs: Option<u64>,
    /// Completion poll ceiling for strong evidence.
    pub completion_ceiling_secs: Option<u64>,
    /// Interval between completion probes.
    pub completion_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSeed {
    iso_path: Option<String>,
    instance_id: Option<String>,
}

/// Immutable, parsed deployment parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct DeploymentParameters {
    tree: Value,
    vm: VmSpec,
    disks: Vec<DiskSpec>,
    users: Vec<UserRecord>,
    interfaces: Vec<InterfaceSpec>,
    swaps: Vec<SwapDevice>,
    timeouts: TimeoutOverrides,
    seed_iso: Option<DatastorePath>,
    instance_id: Option<String>,
}

impl DeploymentParameters {
    /// Reads and parses a YAML parameter file.
    ///
    /// # Errors
    ///
    /// Returns [`ParamsError::Read`] when the file cannot be read and any
    /// error from [`Self::from_yaml_str`].
    pub fn load(path: &Utf8Path) -> Result<Self, ParamsError> {
        let content = files::read_to_string(path).map_err(|message| ParamsError::Read {
            path: path.to_string(),
            message,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parses a YAML document.
    ///
    /// # Errors
    ///
    /// Returns [`ParamsError::Syntax`] for malformed YAML and any error from
    /// [`Self::from_tree`].
    pub fn from_yaml_str(content: &str) -> Result<Self, ParamsError> {
        let yaml: serde_yaml::Value =
            serde_yaml::from_str(content).map_err(|err| ParamsError::Syntax(err.to_string()))?;
        Self::from_tree(yaml_to_json(yaml))
    }

    /// Discovers typed records from an already parsed tree.
    ///
    /// # Errors
    ///
    /// Returns [`ParamsError`] when the root is not a mapping, a section has
    /// the wrong shape, more than one user is primary, or the seed path is
    /// malformed.
    pub fn from_tree(tree: Value) -> Result<Self, ParamsError> {
        let root = tree.as_object().ok_or(ParamsError::NotAMapping)?;

        let vm: VmSpec = section(root, "vm")?.unwrap_or_default();
        if vm.name.trim().is_empty() {
            return Err(ParamsError::Invalid {
                key: String::from("vm"),
                message: String::from("`name` is required"),
            });
        }
        let disks: Vec<DiskSpec> = section(root, "disks")?.unwrap_or_default();
        let timeouts: TimeoutOverrides = section(root, "timeouts")?.unwrap_or_default();
        let seed: RawSeed = section(root, "seed")?.unwrap_or_default();
        let swaps = discover_swaps(root)?;

        let mut users = BTreeMap::new();
        let mut interfaces = BTreeMap::new();
        for (key, value) in root {
            if let Some(number) = numbered(key, USER_PREFIX) {
                let raw: RawUser = decode(key, value)?;
                users.insert(number, user_record(number, raw));
            } else if let Some(number) = numbered(key, INTERFACE_PREFIX) {
                let raw: RawInterface = decode(key, value)?;
                if raw.device.trim().is_empty() {
                    return Err(ParamsError::Invalid {
                        key: key.clone(),
                        message: String::from("`device` is required"),
                    });
                }
                interfaces.insert(number, interface_spec(number, raw));
            }
        }
        let users: Vec<UserRecord> = users.into_values().collect();
        let interfaces: Vec<InterfaceSpec> = interfaces.into_values().collect();

        let primaries: Vec<String> = users
            .iter()
            .filter(|user| user.primary)
            .map(UserRecord::key)
            .collect();
        if primaries.len() > 1 {
            return Err(ParamsError::MultiplePrimary { users: primaries });
        }

        let seed_iso = seed
            .iso_path
            .as_deref()
            .map(str::parse::<DatastorePath>)
            .transpose()?;

        Ok(Self {
            tree,
            vm,
            disks,
            users,
            interfaces,
            swaps,
            timeouts,
            seed_iso,
            instance_id: seed.instance_id,
        })
    }

    /// The raw configuration tree, used for generic placeholder lookups.
    #[must_use]
    pub const fn tree(&self) -> &Value {
        &self.tree
    }

    /// VM identity and sizing.
    #[must_use]
    pub const fn vm(&self) -> &VmSpec {
        &self.vm
    }

    /// Disk specs in declared order.
    #[must_use]
    pub fn disks(&self) -> &[DiskSpec] {
        &self.disks
    }

    /// Declared users in ascending numeric order.
    #[must_use]
    pub fn users(&self) -> &[UserRecord] {
        &self.users
    }

    /// Declared interfaces in ascending numeric order.
    #[must_use]
    pub fn interfaces(&self) -> &[InterfaceSpec] {
        &self.interfaces
    }

    /// Swap devices ordered by numeric key (non-numeric keys last).
    #[must_use]
    pub fn swaps(&self) -> &[SwapDevice] {
        &self.swaps
    }

    /// Timing overrides.
    #[must_use]
    pub const fn timeouts(&self) -> &TimeoutOverrides {
        &self.timeouts
    }

    /// Datastore location of the packaged seed medium, when configured.
    #[must_use]
    pub const fn seed_iso(&self) -> Option<&DatastorePath> {
        self.seed_iso.as_ref()
    }

    /// Explicit instance identifier from `seed.instance_id`, when present.
    #[must_use]
    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }
}

fn numbered(key: &str, prefix: &str) -> Option<u32> {
    let digits = key.strip_prefix(prefix)?;
    if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn decode<T: DeserializeOwned>(key: &str, value: &Value) -> Result<T, ParamsError> {
    serde_json::from_value(value.clone()).map_err(|err| ParamsError::Invalid {
        key: key.to_owned(),
        message: err.to_string(),
    })
}

fn section<T: DeserializeOwned>(
    root: &Map<String, Value>,
    key: &str,
) -> Result<Option<T>, ParamsError> {
    match root.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => decode(key, value).map(Some),
    }
}

fn user_record(number: u32, raw: RawUser) -> UserRecord {
    UserRecord {
        number,
        name: raw.name.trim().to_owned(),
        password: raw.password,
        groups: raw.groups,
        ssh_keys: raw.ssh_keys.unwrap_or_default(),
        primary: raw.primary,
    }
}

fn interface_spec(number: u32, raw: RawInterface) -> InterfaceSpec {
    InterfaceSpec {
        number,
        device: raw.device.trim().to_owned(),
        address: raw.address,
        prefix: raw.prefix,
        gateway: raw.gateway,
        nameservers: raw.nameservers.unwrap_or_default(),
        disable_auto_routes: raw.disable_auto_routes,
        disable_auto_dns: raw.disable_auto_dns,
        disable_ipv6: raw.disable_ipv6,
    }
}

fn discover_swaps(root: &Map<String, Value>) -> Result<Vec<SwapDevice>, ParamsError> {
    let Some(mapping) = section::<BTreeMap<String, String>>(root, "swaps")? else {
        return Ok(Vec::new());
    };
    let mut swaps: Vec<SwapDevice> = mapping
        .into_iter()
        .map(|(key, device)| SwapDevice { key, device })
        .collect();
    swaps.sort_by(|lhs, rhs| swap_order(&lhs.key).cmp(&swap_order(&rhs.key)));
    Ok(swaps)
}

fn swap_order(key: &str) -> (u8, u64, &str) {
    key.trim()
        .parse::<u64>()
        .map_or((1, 0, key), |number| (0, number, ""))
}

/// Converts a YAML tree into JSON, stringifying scalar mapping keys so
/// `swaps: {1: /dev/sdb1}` and `swaps: {"1": /dev/sdb1}` are equivalent.
fn yaml_to_json(value: serde_yaml::Value) -> Value {
    match value {
        serde_yaml::Value::Null => Value::Null,
        serde_yaml::Value::Bool(flag) => Value::Bool(flag),
        serde_yaml::Value::Number(number) => yaml_number(&number),
        serde_yaml::Value::String(text) => Value::String(text),
        serde_yaml::Value::Sequence(items) => {
            Value::Array(items.into_iter().map(yaml_to_json).collect())
        }
        serde_yaml::Value::Mapping(mapping) => Value::Object(
            mapping
                .into_iter()
                .map(|(key, entry)| (yaml_key(key), yaml_to_json(entry)))
                .collect(),
        ),
        serde_yaml::Value::Tagged(tagged) => yaml_to_json(tagged.value),
    }
}

fn yaml_number(number: &serde_yaml::Number) -> Value {
    if let Some(unsigned) = number.as_u64() {
        return Value::Number(Number::from(unsigned));
    }
    if let Some(signed) = number.as_i64() {
        return Value::Number(Number::from(signed));
    }
    number
        .as_f64()
        .and_then(Number::from_f64)
        .map_or(Value::Null, Value::Number)
}

fn yaml_key(key: serde_yaml::Value) -> String {
    match key {
        serde_yaml::Value::String(text) => text,
        serde_yaml::Value::Bool(flag) => flag.to_string(),
        serde_yaml::Value::Number(number) => number.to_string(),
        serde_yaml::Value::Null => String::from("null"),
        other => serde_yaml::to_string(&other)
            .map(|rendered| rendered.trim().to_owned())
            .unwrap_or_default(),
    }
}
