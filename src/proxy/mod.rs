//! The managed proxy service.
//!
//! This is where the generic broker meets the concrete thing it brokers:
//! an HTTP/SOCKS proxy process, one per submit host, configured from the
//! user's own template with the listening port swapped for a freshly
//! allocated one.

use crate::broker::{ReleaseOutcome, ServiceBroker, ServiceEndpoint};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::port::PortAllocator;
use crate::process::{self, HostProcessControl};
use crate::provision::Provisioner;
use crate::queue::Squeue;
use crate::registry::{HostKey, Registry, ServiceFlavor};
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Keys a user template may carry that fight with the allocated port.
const PORT_KEYS: &[&str] = &[
    "port",
    "socks-port",
    "redir-port",
    "tproxy-port",
    "mixed-port",
    "external-controller",
];

/// Render the proxy config for `port`: the user template (or a minimal
/// default) with every port-related key stripped and the allocated port
/// installed as `mixed-port`, listening on all interfaces so srun jobs on
/// nearby nodes can reach it directly.
pub fn prepare_config(template: Option<&Path>, port: u16, out_path: &Path) -> Result<()> {
    let mut document: Mapping = match template {
        Some(path) => {
            let text = fs::read_to_string(path).map_err(|e| {
                Error::Config(format!(
                    "Failed to read proxy template {}: {}",
                    path.display(),
                    e
                ))
            })?;
            serde_yaml::from_str(&text)?
        }
        None => Mapping::new(),
    };

    for key in PORT_KEYS {
        document.remove(*key);
    }
    document.insert(Value::from("mixed-port"), Value::from(u64::from(port)));
    document.insert(Value::from("bind-address"), Value::from("*"));
    document.insert(Value::from("allow-lan"), Value::from(true));

    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(out_path, serde_yaml::to_string(&document)?)?;
    Ok(())
}

/// Facade tying broker, allocator, launcher and provisioner together into
/// the two calls the submission flow needs.
pub struct ProxyService {
    settings: Settings,
    broker: ServiceBroker,
    provisioner: Provisioner,
}

impl ProxyService {
    pub fn from_settings(settings: Settings) -> Result<Self> {
        let state_dir = Settings::state_dir()?;
        let broker = ServiceBroker::new(
            Registry::open(&state_dir),
            Arc::new(Squeue),
            Arc::new(HostProcessControl),
        );
        let provisioner = Provisioner::new(Settings::bin_dir()?)?;
        Ok(Self {
            settings,
            broker,
            provisioner,
        })
    }

    fn flavor(&self) -> ServiceFlavor {
        if self.settings.custom_port.is_some() {
            ServiceFlavor::Custom
        } else {
            ServiceFlavor::Managed
        }
    }

    /// Register `consumer` against this host's proxy, starting one if
    /// needed. Network work (asset download) happens before the registry
    /// lock is taken; the start closure itself is purely local.
    pub async fn acquire(&self, consumer: &str) -> Result<ServiceEndpoint> {
        let key = HostKey::local(self.flavor())?;

        if let Some(port) = self.settings.custom_port {
            return self
                .broker
                .acquire(&key, consumer, || Ok(ServiceEndpoint { pid: None, port }));
        }

        self.provisioner.ensure_all(&self.settings).await?;

        let allocator = PortAllocator::new(self.settings.scratch_dir.clone());
        let (low, high) = self.settings.port_range;
        let binary = self.provisioner.proxy_binary_path();
        let data_dir = self.provisioner.data_dir().to_path_buf();
        let template = self.settings.proxy_template.clone();

        self.broker.acquire(&key, consumer, move || {
            let reservation = allocator.allocate(low, high)?;
            let port = reservation.port();

            let config_path = Settings::proxy_dir()?.join(format!("config-{}.yaml", port));
            prepare_config(template.as_deref(), port, &config_path)?;

            let argv = vec![
                binary.display().to_string(),
                "-f".to_string(),
                config_path.display().to_string(),
                "-d".to_string(),
                data_dir.display().to_string(),
            ];
            let pid = process::launch_detached(&argv)?;

            // The proxy owns the port now; drop the reservation lock.
            reservation.confirm();
            Ok(ServiceEndpoint {
                pid: Some(pid),
                port,
            })
        })
    }

    /// Drop `consumer`; tears the proxy down when it was the last one and
    /// the queue agrees.
    pub fn release(&self, consumer: &str) -> Result<ReleaseOutcome> {
        let key = HostKey::local(self.flavor())?;
        self.broker.release(&key, consumer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn read_yaml(path: &Path) -> Mapping {
        serde_yaml::from_str(&fs::read_to_string(path).unwrap()).unwrap()
    }

    #[test]
    fn default_config_carries_allocated_port() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("config.yaml");
        prepare_config(None, 21042, &out).unwrap();

        let doc = read_yaml(&out);
        assert_eq!(doc["mixed-port"], Value::from(21042u64));
        assert_eq!(doc["allow-lan"], Value::from(true));
    }

    #[test]
    fn template_port_keys_are_replaced() {
        let dir = TempDir::new().unwrap();
        let template = dir.path().join("template.yaml");
        fs::write(
            &template,
            "port: 7890\nsocks-port: 7891\nmixed-port: 7892\nexternal-controller: 127.0.0.1:9090\nmode: rule\nproxies:\n  - name: upstream\n    type: http\n    server: proxy.example.com\n    port: 3128\n",
        )
        .unwrap();

        let out = dir.path().join("config.yaml");
        prepare_config(Some(&template), 21042, &out).unwrap();

        let doc = read_yaml(&out);
        assert_eq!(doc["mixed-port"], Value::from(21042u64));
        assert!(!doc.contains_key("port"));
        assert!(!doc.contains_key("socks-port"));
        assert!(!doc.contains_key("external-controller"));
        // Everything else from the template survives, including nested
        // port fields that belong to upstream definitions.
        assert_eq!(doc["mode"], Value::from("rule"));
        let proxies = doc["proxies"].as_sequence().unwrap();
        assert_eq!(proxies[0]["port"], Value::from(3128u64));
    }

    #[test]
    fn missing_template_is_config_error() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("config.yaml");
        let missing = dir.path().join("nope.yaml");
        assert!(matches!(
            prepare_config(Some(&missing), 21042, &out),
            Err(Error::Config(_))
        ));
    }
}
