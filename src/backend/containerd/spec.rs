// ABOUTME: Minimal serde model of the OCI runtime spec, JSON-encoded into the
// ABOUTME: protobuf Any payloads containerd expects for containers and exec'd processes.

use oci_spec::image::ImageConfiguration;
use prost_types::Any;
use serde::{Deserialize, Serialize};

use super::ApiError;

const OCI_VERSION: &str = "1.1.0";
const SPEC_TYPE_URL: &str = "types.containerd.io/opencontainers/runtime-spec/1.0.0/Spec";
const PROCESS_TYPE_URL: &str = "types.containerd.io/opencontainers/runtime-spec/1.0.0/Process";

const DEFAULT_PATH: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Runtime spec stored on the container record. Only the fields this library
/// reads or writes are modeled; unknown fields from specs written by other
/// tools survive a round trip through `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Spec {
    #[serde(rename = "ociVersion")]
    pub oci_version: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<Process>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<Root>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<OciMount>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub linux: Option<Linux>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Process {
    #[serde(default)]
    pub terminal: bool,

    #[serde(default)]
    pub user: User,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    #[serde(default)]
    pub cwd: String,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct User {
    #[serde(default)]
    pub uid: u32,

    #[serde(default)]
    pub gid: u32,

    #[serde(
        default,
        rename = "additionalGids",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub additional_gids: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Root {
    pub path: String,

    #[serde(default)]
    pub readonly: bool,
}

/// Mount entry in the OCI runtime shape. This is also the mount form carried
/// by [`CreateTaskOptions`](crate::execution::CreateTaskOptions).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciMount {
    pub destination: String,

    #[serde(rename = "type")]
    pub typ: String,

    pub source: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Linux {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<LinuxNamespace>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct LinuxNamespace {
    #[serde(rename = "type")]
    pub typ: String,
}

fn mount(destination: &str, typ: &str, source: &str, options: &[&str]) -> OciMount {
    OciMount {
        destination: destination.to_string(),
        typ: typ.to_string(),
        source: source.to_string(),
        options: options.iter().map(|o| o.to_string()).collect(),
    }
}

fn default_mounts() -> Vec<OciMount> {
    vec![
        mount("/proc", "proc", "proc", &[]),
        mount(
            "/dev",
            "tmpfs",
            "tmpfs",
            &["nosuid", "strictatime", "mode=755", "size=65536k"],
        ),
        mount(
            "/dev/pts",
            "devpts",
            "devpts",
            &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620", "gid=5"],
        ),
        mount(
            "/dev/shm",
            "tmpfs",
            "shm",
            &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"],
        ),
        mount(
            "/dev/mqueue",
            "mqueue",
            "mqueue",
            &["nosuid", "noexec", "nodev"],
        ),
        mount("/sys", "sysfs", "sysfs", &["nosuid", "noexec", "nodev", "ro"]),
        mount(
            "/sys/fs/cgroup",
            "cgroup",
            "cgroup",
            &["nosuid", "noexec", "nodev", "relatime", "ro"],
        ),
    ]
}

/// Read-only bind of the host resolver configuration, the namespaced-task
/// counterpart of the daemon's DNS settings.
fn resolv_conf_mount() -> OciMount {
    mount(
        "/etc/resolv.conf",
        "bind",
        "/etc/resolv.conf",
        &["rbind", "ro"],
    )
}

/// Parse a "uid" or "uid:gid" user string. Non-numeric users resolve inside
/// the image at runtime and are left for the runtime to map.
pub(crate) fn parse_numeric_user(user: &str) -> Option<(u32, u32)> {
    let mut parts = user.splitn(2, ':');
    let uid = parts.next()?.parse::<u32>().ok()?;
    let gid = match parts.next() {
        Some(g) => g.parse::<u32>().ok()?,
        None => uid,
    };
    Some((uid, gid))
}

/// Assemble the container's runtime spec: image config defaults, caller
/// environment and user, caller mounts, and host resolv.conf.
pub(crate) fn runtime_spec(
    image_config: &ImageConfiguration,
    env: &[String],
    user: &str,
    extra_mounts: &[OciMount],
) -> Spec {
    let config = image_config.config().as_ref();

    let mut args = Vec::new();
    if let Some(entrypoint) = config.and_then(|c| c.entrypoint().as_ref()) {
        args.extend(entrypoint.iter().cloned());
    }
    if let Some(cmd) = config.and_then(|c| c.cmd().as_ref()) {
        args.extend(cmd.iter().cloned());
    }
    if args.is_empty() {
        args.push("/bin/sh".to_string());
    }

    let mut merged_env = vec![DEFAULT_PATH.to_string()];
    if let Some(image_env) = config.and_then(|c| c.env().as_ref()) {
        merged_env.extend(image_env.iter().cloned());
    }
    merged_env.extend(env.iter().cloned());

    let cwd = config
        .and_then(|c| c.working_dir().as_ref())
        .filter(|d| !d.is_empty())
        .cloned()
        .unwrap_or_else(|| "/".to_string());

    let mut process_user = User::default();
    if !user.is_empty() {
        if let Some((uid, gid)) = parse_numeric_user(user) {
            process_user = User {
                uid,
                gid,
                additional_gids: vec![gid],
            };
        }
    }

    let mut mounts = default_mounts();
    mounts.push(resolv_conf_mount());
    mounts.extend(extra_mounts.iter().cloned());

    Spec {
        oci_version: OCI_VERSION.to_string(),
        process: Some(Process {
            terminal: false,
            user: process_user,
            args,
            env: merged_env,
            cwd,
            extra: serde_json::Map::new(),
        }),
        root: Some(Root {
            path: "rootfs".to_string(),
            readonly: false,
        }),
        mounts,
        linux: Some(Linux {
            namespaces: ["pid", "ipc", "uts", "mount", "network"]
                .iter()
                .map(|t| LinuxNamespace { typ: t.to_string() })
                .collect(),
            extra: serde_json::Map::new(),
        }),
        extra: serde_json::Map::new(),
    }
}

pub(crate) fn spec_to_any(spec: &Spec) -> Result<Any, ApiError> {
    Ok(Any {
        type_url: SPEC_TYPE_URL.to_string(),
        value: serde_json::to_vec(spec)
            .map_err(|e| ApiError::Other(format!("encoding runtime spec: {e}")))?,
    })
}

pub(crate) fn spec_from_any(any: &Any) -> Result<Spec, ApiError> {
    serde_json::from_slice(&any.value)
        .map_err(|e| ApiError::Other(format!("decoding runtime spec: {e}")))
}

pub(crate) fn process_to_any(process: &Process) -> Result<Any, ApiError> {
    Ok(Any {
        type_url: PROCESS_TYPE_URL.to_string(),
        value: serde_json::to_vec(process)
            .map_err(|e| ApiError::Other(format!("encoding process spec: {e}")))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_user_parsing() {
        assert_eq!(parse_numeric_user("61000"), Some((61000, 61000)));
        assert_eq!(parse_numeric_user("1000:2000"), Some((1000, 2000)));
        assert_eq!(parse_numeric_user("worker"), None);
        assert_eq!(parse_numeric_user(""), None);
    }

    #[test]
    fn spec_round_trips_through_any() {
        let spec = runtime_spec(&ImageConfiguration::default(), &[], "", &[]);
        let any = spec_to_any(&spec).unwrap();
        assert_eq!(any.type_url, SPEC_TYPE_URL);

        let decoded = spec_from_any(&any).unwrap();
        let process = decoded.process.unwrap();
        assert_eq!(process.args, vec!["/bin/sh"]);
        assert_eq!(process.cwd, "/");
    }

    #[test]
    fn caller_env_is_appended_after_image_env() {
        let spec = runtime_spec(
            &ImageConfiguration::default(),
            &["FOO=bar".to_string()],
            "",
            &[],
        );
        let env = spec.process.unwrap().env;
        assert_eq!(env.last().map(String::as_str), Some("FOO=bar"));
    }

    #[test]
    fn user_sets_uid_gid_and_additional_gids() {
        let spec = runtime_spec(&ImageConfiguration::default(), &[], "61000", &[]);
        let user = spec.process.unwrap().user;
        assert_eq!(user.uid, 61000);
        assert_eq!(user.gid, 61000);
        assert_eq!(user.additional_gids, vec![61000]);
    }

    #[test]
    fn resolv_conf_is_always_mounted() {
        let spec = runtime_spec(&ImageConfiguration::default(), &[], "", &[]);
        assert!(spec
            .mounts
            .iter()
            .any(|m| m.destination == "/etc/resolv.conf" && m.options.contains(&"ro".to_string())));
    }
}
