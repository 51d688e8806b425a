//! First-boot command list composition.
//!
//! Entries are produced in a fixed order: filesystem resizes, swap
//! re-initialisation, then per-interface network tuning. Swap preparation is
//! a single here-document entry so the script body travels inside user-data.

use std::borrow::Cow;

use shell_escape::unix::escape;

use super::blocks::{EMPTY_SEQUENCE, yaml_quote};
use crate::params::{DeploymentParameters, DiskSpec, InterfaceSpec, SwapDevice};

/// File name of the generated swap script inside the guest script directory.
pub const SWAP_SCRIPT_NAME: &str = "swap-reinit.sh";
const SWAP_SCRIPT_TEMPLATE: &str = include_str!("../scripts/swap-reinit.sh");
const SWAP_DEVICES_PLACEHOLDER: &str = "swap_devices";
const HEREDOC_DELIMITER: &str = "CLONEKIT_EOF";

/// One item of the cloud-config `runcmd` list.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RuncmdEntry {
    /// Single shell command line.
    Command(String),
    /// Multi-line script written to `path` through a here-document.
    Script {
        /// Destination path inside the guest.
        path: String,
        /// Script body.
        body: String,
    },
}

impl RuncmdEntry {
    /// Shell text executed for this entry.
    #[must_use]
    pub fn shell_text(&self) -> String {
        match self {
            Self::Command(line) => line.clone(),
            Self::Script { path, body } => {
                let trimmed = body.trim_end_matches('\n');
                format!(
                    "cat > {} <<'{HEREDOC_DELIMITER}'\n{trimmed}\n{HEREDOC_DELIMITER}",
                    escape(Cow::from(path.as_str()))
                )
            }
        }
    }
}

/// Renders the swap re-initialisation script for `swaps` in the given order.
#[must_use]
pub fn swap_script(swaps: &[SwapDevice]) -> String {
    let devices: Vec<String> = swaps
        .iter()
        .map(|swap| escape(Cow::from(swap.device.as_str())).into_owned())
        .collect();
    super::placeholder::replace_placeholder(
        SWAP_SCRIPT_TEMPLATE,
        SWAP_DEVICES_PLACEHOLDER,
        |_| devices.join(" "),
    )
}

/// Composes the ordered `runcmd` entries for a deployment.
///
/// `script_dir` is the guest directory receiving generated first-boot
/// scripts.
#[must_use]
pub fn compose_runcmd(params: &DeploymentParameters, script_dir: &str) -> Vec<RuncmdEntry> {
    let mut entries: Vec<RuncmdEntry> = params.disks().iter().filter_map(resize_entry).collect();
    entries.extend(swap_entries(params.swaps(), script_dir));
    for interface in params.interfaces() {
        entries.extend(interface_entries(interface));
    }
    entries
}

fn resize_entry(disk: &DiskSpec) -> Option<RuncmdEntry> {
    let raw = disk.resize_target.as_deref()?.trim();
    if raw.is_empty() {
        return None;
    }
    let target = escape(Cow::from(raw));
    Some(RuncmdEntry::Command(format!(
        "if [ \"$(findmnt -n -o FSTYPE --target {target})\" = xfs ]; then xfs_growfs {target}; \
         else resize2fs \"$(findmnt -n -o SOURCE --target {target})\"; fi"
    )))
}

fn swap_entries(swaps: &[SwapDevice], script_dir: &str) -> Vec<RuncmdEntry> {
    if swaps.is_empty() {
        return Vec::new();
    }
    let dir = script_dir.trim_end_matches('/');
    let script_path = format!("{dir}/{SWAP_SCRIPT_NAME}");
    let quoted_dir = escape(Cow::from(dir));
    let quoted_script = escape(Cow::from(script_path.as_str())).into_owned();
    vec![
        RuncmdEntry::Command(format!("mkdir -p {quoted_dir}")),
        RuncmdEntry::Command(format!("chown root:root {quoted_dir} && chmod 0700 {quoted_dir}")),
        RuncmdEntry::Script {
            path: script_path,
            body: swap_script(swaps),
        },
        RuncmdEntry::Command(format!("bash {quoted_script}")),
    ]
}

fn interface_entries(interface: &InterfaceSpec) -> Vec<RuncmdEntry> {
    let device = escape(Cow::from(interface.device.as_str()));
    let connection = format!("\"$(nmcli -g GENERAL.CONNECTION device show {device})\"");
    let settings = [
        (
            interface.disable_auto_routes,
            "ipv4.ignore-auto-routes yes ipv6.ignore-auto-routes yes",
        ),
        (
            interface.disable_auto_dns,
            "ipv4.ignore-auto-dns yes ipv6.ignore-auto-dns yes",
        ),
        (interface.disable_ipv6, "ipv6.method disabled"),
    ];
    let mut entries: Vec<RuncmdEntry> = settings
        .iter()
        .filter(|(enabled, _)| *enabled)
        .map(|(_, setting)| {
            RuncmdEntry::Command(format!("nmcli connection modify {connection} {setting}"))
        })
        .collect();
    if !entries.is_empty() {
        entries.push(RuncmdEntry::Command(format!("nmcli device reapply {device}")));
    }
    entries
}

/// Serialises `entries` as a YAML block sequence nested under a key at
/// `indent`, or `[]` when there are none.
#[must_use]
pub fn runcmd_block(entries: &[RuncmdEntry], indent: usize) -> String {
    if entries.is_empty() {
        return String::from(EMPTY_SEQUENCE);
    }
    let item_pad = " ".repeat(indent + 2);
    let body_pad = " ".repeat(indent + 4);
    let mut block = String::new();
    for entry in entries {
        match entry {
            RuncmdEntry::Command(line) => {
                block.push_str(&format!("\n{item_pad}- {}", yaml_quote(line)));
            }
            RuncmdEntry::Script { .. } => {
                block.push_str(&format!("\n{item_pad}- |"));
                for line in entry.shell_text().lines() {
                    if line.is_empty() {
                        block.push('\n');
                    } else {
                        block.push_str(&format!("\n{body_pad}{line}"));
                    }
                }
            }
        }
    }
    block
}
