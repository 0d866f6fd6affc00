//! Pod networking through CNI plugins.
//!
//! Network configuration lists are loaded from the configured directory on
//! first use; the first list (by sorted file name) is the default network.
//! If the default chain carries no loopback plugin, an internal
//! `sycri-loopback` list is synthesized and executed before the default for
//! every setup, so a pod always has `lo` up.
//!
//! Plugins are executed the CNI way: the plugin binary named by `type` runs
//! with `CNI_*` parameters in a clean environment and the network
//! configuration on standard input, chained through `prevResult`. Errors
//! come back on standard output.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::cri::PortMapping;
use crate::error::{Error, Result};

/// CNI spec version written into synthesized and injected configs.
const CNI_VERSION: &str = "1.0.0";
/// Name of the loopback list synthesized when the default lacks one.
const LOOPBACK_NET_NAME: &str = "sycri-loopback";
/// Interface names inside the pod network namespace.
const DEFAULT_IFNAME: &str = "eth0";
const LOOPBACK_IFNAME: &str = "lo";

/// One network configuration list, as loaded from disk or synthesized.
#[derive(Debug, Clone)]
pub struct NetList {
    name: String,
    cni_version: String,
    plugins: Vec<Value>,
}

/// Raw `.conflist` file form.
#[derive(Debug, Deserialize)]
struct ConfList {
    name: String,
    #[serde(rename = "cniVersion", default)]
    cni_version: String,
    #[serde(default)]
    plugins: Vec<Value>,
}

/// Everything the manager needs to attach one pod.
#[derive(Debug, Clone)]
pub struct PodNetworkConfig {
    pub id: String,
    pub namespace: String,
    pub name: String,
    /// Bind path of the pod's network namespace.
    pub ns_path: PathBuf,
    pub port_mappings: Vec<PortMapping>,
}

/// Opaque attachment handle: everything teardown and IP queries need.
#[derive(Debug)]
pub struct PodNetwork {
    config: PodNetworkConfig,
    args: String,
    /// `(list, final prevResult)` in setup order, loopback first.
    attachments: Vec<(NetList, Value)>,
}

/// Manager over the configured plugin and configuration directories.
#[derive(Debug)]
pub struct NetworkManager {
    bin_dir: PathBuf,
    conf_dir: PathBuf,
    /// Loaded lazily on first setup; reloadable is a non-goal.
    loaded: RwLock<Option<Arc<Loaded>>>,
    pod_cidr: RwLock<Option<String>>,
}

#[derive(Debug)]
struct Loaded {
    default_list: NetList,
    /// Present iff the default chain lacks a loopback plugin.
    loopback: Option<NetList>,
}

impl NetworkManager {
    pub fn new(bin_dir: impl Into<PathBuf>, conf_dir: impl Into<PathBuf>) -> Self {
        NetworkManager {
            bin_dir: bin_dir.into(),
            conf_dir: conf_dir.into(),
            loaded: RwLock::new(None),
            pod_cidr: RwLock::new(None),
        }
    }

    /// Record the pod CIDR handed down by the kubelet. First non-empty
    /// value wins; later calls are ignored.
    pub fn set_pod_cidr(&self, cidr: &str) {
        if cidr.is_empty() {
            return;
        }
        let mut slot = self.pod_cidr.write().unwrap();
        if slot.is_none() {
            *slot = Some(cidr.to_string());
        }
    }

    fn ensure_loaded(&self) -> Result<Arc<Loaded>> {
        if let Some(loaded) = self.loaded.read().unwrap().as_ref() {
            return Ok(loaded.clone());
        }
        let mut slot = self.loaded.write().unwrap();
        if let Some(loaded) = slot.as_ref() {
            return Ok(loaded.clone());
        }
        let lists = load_lists(&self.conf_dir)?;
        let default_list = lists
            .into_iter()
            .next()
            .ok_or_else(|| Error::transient(format!(
                "no CNI network lists in {}",
                self.conf_dir.display()
            )))?;
        let loopback = if has_plugin(&default_list, "loopback") {
            None
        } else {
            Some(loopback_list())
        };
        let loaded = Arc::new(Loaded {
            default_list,
            loopback,
        });
        *slot = Some(loaded.clone());
        Ok(loaded)
    }

    /// Attach a pod to the default network (and loopback when synthesized).
    pub async fn setup(&self, config: PodNetworkConfig) -> Result<PodNetwork> {
        let loaded = self.ensure_loaded()?;
        let args = self.build_args(&config, &loaded.default_list);

        let runtime_config = port_mappings_runtime_config(&config.port_mappings);
        let mut attachments = Vec::with_capacity(2);
        if let Some(loopback) = &loaded.loopback {
            let result = self
                .execute_list("ADD", loopback, &config, LOOPBACK_IFNAME, &args, None, None)
                .await?;
            attachments.push((loopback.clone(), result));
        }
        match self
            .execute_list(
                "ADD",
                &loaded.default_list,
                &config,
                DEFAULT_IFNAME,
                &args,
                runtime_config.as_ref(),
                None,
            )
            .await
        {
            Ok(result) => attachments.push((loaded.default_list.clone(), result)),
            Err(e) => {
                // Unwind the loopback attachment; its failure is secondary.
                for (list, result) in attachments.iter().rev() {
                    let _ = self
                        .execute_list("DEL", list, &config, LOOPBACK_IFNAME, &args, None, Some(result))
                        .await;
                }
                return Err(e);
            }
        }

        Ok(PodNetwork {
            config,
            args,
            attachments,
        })
    }

    /// Detach a pod: DEL on the default list, then loopback if synthesized.
    pub async fn teardown(&self, network: &PodNetwork) -> Result<()> {
        let mut first_error = None;
        for (list, result) in network.attachments.iter().rev() {
            let ifname = if list.name == LOOPBACK_NET_NAME {
                LOOPBACK_IFNAME
            } else {
                DEFAULT_IFNAME
            };
            if let Err(e) = self
                .execute_list(
                    "DEL",
                    list,
                    &network.config,
                    ifname,
                    &network.args,
                    None,
                    Some(result),
                )
                .await
            {
                warn!(pod = %network.config.id, list = %list.name, error = %e, "CNI DEL failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// The pod IP from the default attachment: IPv4 first, then IPv6.
    pub fn get_ip(&self, network: &PodNetwork) -> Result<IpAddr> {
        let result = network
            .attachments
            .iter()
            .rev()
            .map(|(_, result)| result)
            .next()
            .ok_or_else(|| Error::not_found("pod network attachment"))?;
        let addresses: Vec<IpAddr> = result
            .get("ips")
            .and_then(Value::as_array)
            .map(|ips| {
                ips.iter()
                    .filter_map(|ip| ip.get("address").and_then(Value::as_str))
                    .filter_map(|cidr| cidr.split('/').next())
                    .filter_map(|addr| addr.parse().ok())
                    .collect()
            })
            .unwrap_or_default();
        addresses
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| addresses.iter().find(|addr| addr.is_ipv6()))
            .copied()
            .ok_or_else(|| Error::not_found("pod IP"))
    }

    /// `CNI_ARGS` for one pod, with the CIDR range appended only when a
    /// plugin in the default chain can honor it.
    fn build_args(&self, config: &PodNetworkConfig, default_list: &NetList) -> String {
        let mut args = format!(
            "IgnoreUnknown=1;K8S_POD_NAMESPACE={};K8S_POD_NAME={};K8S_POD_INFRA_CONTAINER_ID={}",
            config.namespace, config.name, config.id
        );
        let cidr = self.pod_cidr.read().unwrap().clone();
        if let Some(cidr) = cidr {
            if supports_capability(default_list, "ipRanges") {
                args.push_str(&format!(";ipRange={cidr}"));
            } else {
                warn!(%cidr, "no CNI plugin supports ipRanges, clearing pod CIDR");
                self.pod_cidr.write().unwrap().take();
            }
        }
        args
    }

    /// Run every plugin of a list in order (reversed for DEL), chaining
    /// `prevResult`, and return the final result.
    #[allow(clippy::too_many_arguments)]
    async fn execute_list(
        &self,
        command: &str,
        list: &NetList,
        config: &PodNetworkConfig,
        ifname: &str,
        args: &str,
        runtime_config: Option<&Value>,
        prev_result: Option<&Value>,
    ) -> Result<Value> {
        let mut prev = prev_result.cloned();
        let plugins: Vec<&Value> = if command == "DEL" {
            list.plugins.iter().rev().collect()
        } else {
            list.plugins.iter().collect()
        };
        for plugin in plugins {
            let stdin = plugin_stdin(list, plugin, runtime_config, prev.as_ref());
            let output = self
                .execute_plugin(command, plugin, config, ifname, args, &stdin)
                .await?;
            if command != "DEL" {
                prev = Some(output);
            }
        }
        Ok(prev.unwrap_or(Value::Null))
    }

    /// One plugin invocation, the CNI parameter protocol.
    async fn execute_plugin(
        &self,
        command: &str,
        plugin: &Value,
        config: &PodNetworkConfig,
        ifname: &str,
        args: &str,
        stdin: &Value,
    ) -> Result<Value> {
        let plugin_type = plugin
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::transient("CNI plugin config without a type"))?;
        let binary = self.bin_dir.join(plugin_type);

        let mut child = Command::new(&binary)
            .env_clear()
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", &config.id)
            .env("CNI_NETNS", &config.ns_path)
            .env("CNI_IFNAME", ifname)
            .env("CNI_PATH", &self.bin_dir)
            .env("CNI_ARGS", args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::transient(format!("spawning CNI plugin {plugin_type}: {e}")))?;
        child
            .stdin
            .take()
            .expect("stdin was piped")
            .write_all(stdin.to_string().as_bytes())
            .await?;
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::transient(format!("CNI plugin {plugin_type}: {e}")))?;

        if !output.status.success() {
            // Plugins report structured errors on standard output.
            return Err(Error::transient(format!(
                "CNI {command} via {plugin_type}: {}",
                String::from_utf8_lossy(&output.stdout).trim()
            )));
        }
        debug!(plugin = plugin_type, command, pod = %config.id, "CNI plugin succeeded");
        if output.stdout.is_empty() {
            Ok(Value::Null)
        } else {
            serde_json::from_slice(&output.stdout)
                .map_err(|e| Error::transient(format!("CNI result from {plugin_type}: {e}")))
        }
    }
}

/// Load and sort all network lists from a configuration directory.
fn load_lists(conf_dir: &Path) -> Result<Vec<NetList>> {
    let mut paths: Vec<PathBuf> = match std::fs::read_dir(conf_dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("conflist") | Some("conf") | Some("json")
                )
            })
            .collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    paths.sort();

    let mut lists = Vec::with_capacity(paths.len());
    for path in paths {
        let raw = std::fs::read_to_string(&path)?;
        let list = if path.extension().and_then(|e| e.to_str()) == Some("conflist") {
            let conf: ConfList = serde_json::from_str(&raw)
                .map_err(|e| Error::transient(format!("{}: {e}", path.display())))?;
            NetList {
                name: conf.name,
                cni_version: or_default_version(conf.cni_version),
                plugins: conf.plugins,
            }
        } else {
            // A plain `.conf` holds a single plugin configuration.
            let plugin: Value = serde_json::from_str(&raw)
                .map_err(|e| Error::transient(format!("{}: {e}", path.display())))?;
            NetList {
                name: plugin
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                cni_version: plugin
                    .get("cniVersion")
                    .and_then(Value::as_str)
                    .map(|v| or_default_version(v.to_string()))
                    .unwrap_or_else(|| CNI_VERSION.to_string()),
                plugins: vec![plugin],
            }
        };
        lists.push(list);
    }
    Ok(lists)
}

fn or_default_version(version: String) -> String {
    if version.is_empty() {
        CNI_VERSION.to_string()
    } else {
        version
    }
}

fn loopback_list() -> NetList {
    NetList {
        name: LOOPBACK_NET_NAME.to_string(),
        cni_version: CNI_VERSION.to_string(),
        plugins: vec![json!({"type": "loopback"})],
    }
}

fn has_plugin(list: &NetList, plugin_type: &str) -> bool {
    list.plugins
        .iter()
        .any(|plugin| plugin.get("type").and_then(Value::as_str) == Some(plugin_type))
}

/// True when any plugin in the chain advertises the given capability.
fn supports_capability(list: &NetList, capability: &str) -> bool {
    list.plugins.iter().any(|plugin| {
        plugin
            .get("capabilities")
            .and_then(|caps| caps.get(capability))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    })
}

/// `portMappings` runtime configuration, host port defaulting to the
/// container port when unset.
fn port_mappings_runtime_config(mappings: &[PortMapping]) -> Option<Value> {
    if mappings.is_empty() {
        return None;
    }
    let entries: Vec<Value> = mappings
        .iter()
        .map(|mapping| {
            let host_port = if mapping.host_port > 0 {
                mapping.host_port
            } else {
                mapping.container_port
            };
            json!({
                "hostPort": host_port,
                "containerPort": mapping.container_port,
                "protocol": mapping.protocol.as_cni(),
            })
        })
        .collect();
    Some(json!({"portMappings": entries}))
}

/// The JSON handed to one plugin invocation: its own configuration plus the
/// injected list fields, runtime capabilities, and chained result.
fn plugin_stdin(
    list: &NetList,
    plugin: &Value,
    runtime_config: Option<&Value>,
    prev_result: Option<&Value>,
) -> Value {
    let mut conf = plugin.clone();
    if let Some(object) = conf.as_object_mut() {
        object.insert("cniVersion".into(), Value::String(list.cni_version.clone()));
        object.insert("name".into(), Value::String(list.name.clone()));
        if let Some(runtime_config) = runtime_config {
            // Only a plugin that declared the capability receives it.
            if plugin.get("capabilities").is_some() {
                object.insert("runtimeConfig".into(), runtime_config.clone());
            }
        }
        if let Some(prev) = prev_result {
            if !prev.is_null() {
                object.insert("prevResult".into(), prev.clone());
            }
        }
    }
    conf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cri::Protocol;

    fn write_conflist(dir: &Path, file: &str, body: &Value) {
        std::fs::write(dir.join(file), serde_json::to_string(body).unwrap()).unwrap();
    }

    #[test]
    fn first_sorted_list_is_default_and_loopback_is_synthesized() {
        let dir = tempfile::tempdir().unwrap();
        write_conflist(
            dir.path(),
            "20-bridge.conflist",
            &json!({"name": "bridge-net", "cniVersion": "1.0.0",
                    "plugins": [{"type": "bridge"}]}),
        );
        write_conflist(
            dir.path(),
            "10-flannel.conflist",
            &json!({"name": "flannel-net", "cniVersion": "1.0.0",
                    "plugins": [{"type": "flannel"}]}),
        );

        let manager = NetworkManager::new("/opt/cni/bin", dir.path());
        let loaded = manager.ensure_loaded().unwrap();
        assert_eq!(loaded.default_list.name, "flannel-net");
        let loopback = loaded.loopback.as_ref().unwrap();
        assert_eq!(loopback.name, LOOPBACK_NET_NAME);
        assert!(has_plugin(loopback, "loopback"));
    }

    #[test]
    fn existing_loopback_plugin_suppresses_synthesis() {
        let dir = tempfile::tempdir().unwrap();
        write_conflist(
            dir.path(),
            "net.conflist",
            &json!({"name": "net", "cniVersion": "1.0.0",
                    "plugins": [{"type": "loopback"}, {"type": "bridge"}]}),
        );

        let manager = NetworkManager::new("/opt/cni/bin", dir.path());
        assert!(manager.ensure_loaded().unwrap().loopback.is_none());
    }

    #[test]
    fn single_conf_file_wraps_into_a_list() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("99-bridge.conf"),
            serde_json::to_string(&json!({"name": "solo", "type": "bridge"})).unwrap(),
        )
        .unwrap();

        let lists = load_lists(dir.path()).unwrap();
        assert_eq!(lists.len(), 1);
        assert_eq!(lists[0].name, "solo");
        assert!(has_plugin(&lists[0], "bridge"));
    }

    #[test]
    fn args_carry_pod_identity_and_conditional_ip_range() {
        let with_cap = NetList {
            name: "n".into(),
            cni_version: CNI_VERSION.into(),
            plugins: vec![json!({"type": "ptp", "capabilities": {"ipRanges": true}})],
        };
        let without_cap = NetList {
            name: "n".into(),
            cni_version: CNI_VERSION.into(),
            plugins: vec![json!({"type": "ptp"})],
        };
        let config = PodNetworkConfig {
            id: "pod-1".into(),
            namespace: "default".into(),
            name: "netpod".into(),
            ns_path: PathBuf::from("/run/ns/net"),
            port_mappings: vec![],
        };

        let manager = NetworkManager::new("/bin", "/conf");
        manager.set_pod_cidr("10.42.0.0/16");
        manager.set_pod_cidr("10.99.0.0/16"); // loses: first non-empty wins
        let args = manager.build_args(&config, &with_cap);
        assert_eq!(
            args,
            "IgnoreUnknown=1;K8S_POD_NAMESPACE=default;K8S_POD_NAME=netpod;\
             K8S_POD_INFRA_CONTAINER_ID=pod-1;ipRange=10.42.0.0/16"
        );

        // No capability: the CIDR is dropped with a warning and stays gone.
        manager.set_pod_cidr("10.42.0.0/16");
        let args = manager.build_args(&config, &without_cap);
        assert!(!args.contains("ipRange"));
        assert!(manager.pod_cidr.read().unwrap().is_none());
    }

    #[test]
    fn port_mappings_default_host_port() {
        let runtime_config = port_mappings_runtime_config(&[
            PortMapping {
                protocol: Protocol::Tcp,
                container_port: 8080,
                host_port: 0,
                host_ip: String::new(),
            },
            PortMapping {
                protocol: Protocol::Udp,
                container_port: 53,
                host_port: 5353,
                host_ip: String::new(),
            },
        ])
        .unwrap();
        let entries = runtime_config["portMappings"].as_array().unwrap();
        assert_eq!(entries[0]["hostPort"], 8080);
        assert_eq!(entries[0]["protocol"], "tcp");
        assert_eq!(entries[1]["hostPort"], 5353);
        assert_eq!(entries[1]["protocol"], "udp");
    }

    #[test]
    fn get_ip_prefers_ipv4() {
        let network = PodNetwork {
            config: PodNetworkConfig {
                id: "p".into(),
                namespace: "ns".into(),
                name: "n".into(),
                ns_path: PathBuf::new(),
                port_mappings: vec![],
            },
            args: String::new(),
            attachments: vec![(
                loopback_list(),
                json!({"ips": [
                    {"address": "fd00::5/64"},
                    {"address": "10.1.2.3/16"},
                ]}),
            )],
        };
        let manager = NetworkManager::new("/bin", "/conf");
        assert_eq!(manager.get_ip(&network).unwrap().to_string(), "10.1.2.3");
    }

    #[test]
    fn get_ip_without_addresses_is_not_found() {
        let network = PodNetwork {
            config: PodNetworkConfig {
                id: "p".into(),
                namespace: "ns".into(),
                name: "n".into(),
                ns_path: PathBuf::new(),
                port_mappings: vec![],
            },
            args: String::new(),
            attachments: vec![(loopback_list(), json!({}))],
        };
        let manager = NetworkManager::new("/bin", "/conf");
        assert!(manager.get_ip(&network).unwrap_err().is_not_found());
    }

    #[test]
    fn plugin_stdin_injects_list_fields_and_chained_result() {
        let list = NetList {
            name: "net".into(),
            cni_version: "1.0.0".into(),
            plugins: vec![],
        };
        let plugin = json!({"type": "portmap", "capabilities": {"portMappings": true}});
        let runtime_config = json!({"portMappings": []});
        let prev = json!({"ips": []});

        let stdin = plugin_stdin(&list, &plugin, Some(&runtime_config), Some(&prev));
        assert_eq!(stdin["name"], "net");
        assert_eq!(stdin["cniVersion"], "1.0.0");
        assert_eq!(stdin["runtimeConfig"], runtime_config);
        assert_eq!(stdin["prevResult"], prev);

        // A capability-less plugin gets no runtime config.
        let plain = json!({"type": "bridge"});
        let stdin = plugin_stdin(&list, &plain, Some(&runtime_config), None);
        assert!(stdin.get("runtimeConfig").is_none());
    }
}
