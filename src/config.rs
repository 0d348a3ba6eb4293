// ABOUTME: Neutral command configuration shared by both backends.
// ABOUTME: Includes the neutral mount shape and its per-backend translations.

use std::time::Duration;

use bollard::models::{Mount as DaemonMount, MountTypeEnum};

use crate::backend::containerd::spec::OciMount;

/// Backend-neutral configuration consumed by the factory.
///
/// The factory translates this into the default strategy options for
/// whichever backend the client belongs to.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Namespace hint; the containerd backend uses the client's default
    /// namespace, this field is informational.
    pub namespace: String,
    pub container: ContainerConfig,
    pub network: NetworkConfig,
    pub task: TaskConfig,
    pub command_details: CommandDetails,
}

/// Container image and identity settings.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    /// Image reference; must already be present for the containerd backend.
    pub image: String,
    /// User to run as ("uid", "uid:gid", or a name the image resolves).
    pub user: String,
    /// Environment in KEY=VALUE form.
    pub env: Vec<String>,
    /// Mounts in the neutral shape.
    pub mounts: Vec<Mount>,
}

/// DNS settings, applied on the daemon backend only.
#[derive(Debug, Clone, Default)]
pub struct NetworkConfig {
    pub dns: Vec<String>,
    pub dns_search: Vec<String>,
    pub dns_options: Vec<String>,
}

/// The command to run and how long to let it run.
#[derive(Debug, Clone, Default)]
pub struct TaskConfig {
    pub executable: String,
    pub args: Vec<String>,
    /// Zero means no caller-imposed timeout; the containerd lease still
    /// receives the garbage-collection grace period.
    pub timeout: Duration,
    pub working_dir: String,
}

/// Caller identity tuple used to synthesize container names and labels.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandDetails {
    pub executor_id: i64,
    pub chain_executor_id: i64,
    pub result_id: i64,
}

/// Backend-neutral mount.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mount {
    /// Mount type ("bind", "volume", "tmpfs", ...).
    pub typ: String,
    pub source: String,
    pub destination: String,
    /// Mount options; only the OCI shape preserves these.
    pub options: Vec<String>,
}

/// Translate neutral mounts to the daemon's mount shape.
///
/// Mounts targeting resolv.conf are dropped: the containerd path sources
/// resolv.conf from the host inside the OCI spec, and the daemon manages its
/// own copy.
pub(crate) fn daemon_mounts(mounts: &[Mount]) -> Vec<DaemonMount> {
    mounts
        .iter()
        .filter(|m| !m.destination.contains("resolv.conf"))
        .map(|m| DaemonMount {
            typ: Some(daemon_mount_type(&m.typ)),
            source: Some(m.source.clone()),
            target: Some(m.destination.clone()),
            ..Default::default()
        })
        .collect()
}

fn daemon_mount_type(typ: &str) -> MountTypeEnum {
    match typ {
        "volume" => MountTypeEnum::VOLUME,
        "tmpfs" => MountTypeEnum::TMPFS,
        _ => MountTypeEnum::BIND,
    }
}

/// Translate neutral mounts to the OCI mount shape.
pub(crate) fn oci_mounts(mounts: &[Mount]) -> Vec<OciMount> {
    mounts
        .iter()
        .map(|m| OciMount {
            destination: m.destination.clone(),
            typ: m.typ.clone(),
            source: m.source.clone(),
            options: m.options.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bind_mount() -> Mount {
        Mount {
            typ: "bind".to_string(),
            source: "/local/path".to_string(),
            destination: "/work/src".to_string(),
            options: vec!["bind".to_string(), "ro".to_string()],
        }
    }

    #[test]
    fn daemon_translation_drops_options() {
        let mounts = daemon_mounts(&[bind_mount()]);
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].typ, Some(MountTypeEnum::BIND));
        assert_eq!(mounts[0].source.as_deref(), Some("/local/path"));
        assert_eq!(mounts[0].target.as_deref(), Some("/work/src"));
    }

    #[test]
    fn daemon_translation_filters_resolv_conf() {
        let mut resolv = bind_mount();
        resolv.destination = "/etc/resolv.conf".to_string();
        let mounts = daemon_mounts(&[bind_mount(), resolv]);
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].target.as_deref(), Some("/work/src"));
    }

    #[test]
    fn oci_translation_preserves_all_fields() {
        let mounts = oci_mounts(&[bind_mount()]);
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].destination, "/work/src");
        assert_eq!(mounts[0].typ, "bind");
        assert_eq!(mounts[0].source, "/local/path");
        assert_eq!(mounts[0].options, vec!["bind", "ro"]);
    }

    #[test]
    fn oci_translation_keeps_resolv_conf() {
        let mut resolv = bind_mount();
        resolv.destination = "/etc/resolv.conf".to_string();
        let mounts = oci_mounts(&[resolv]);
        assert_eq!(mounts.len(), 1);
    }
}
