//! Hypervisor backend that runs configured command templates on the SUT.
//!
//! Templates use `{placeholder}` substitution (see
//! [`HypervisorTemplates`](crate::config::HypervisorTemplates)). Device
//! descriptors are rendered from their own templates, written to the SUT with
//! a heredoc, applied, and removed again.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info};

use super::{CreateRequest, CreationHandle, DeviceDescriptor, HypervisorControl};
use crate::config::HypervisorTemplates;
use crate::error::{Advisory, AdvisoryError, Error, Result};
use crate::remote::CommandExecutor;
use crate::vm::{DeviceLocator, NetworkAttachment};

/// Unattended guest installs can run for 45 minutes.
const DEFAULT_CREATE_TIMEOUT: Duration = Duration::from_secs(2700);

const HEREDOC_TAG: &str = "VIRT_PROVISION_EOF";

fn ipv4_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})\b").expect("valid regex"))
}

/// Substitute every `{key}` in `template`.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

/// First non-loopback IPv4 address in `text`.
pub fn first_guest_ipv4(text: &str) -> Option<IpAddr> {
    ipv4_regex()
        .captures_iter(text)
        .filter_map(|c| c[1].parse::<Ipv4Addr>().ok())
        .find(|ip| !ip.is_loopback() && !ip.is_unspecified())
        .map(IpAddr::V4)
}

pub struct CommandHypervisor {
    executor: CommandExecutor,
    templates: HypervisorTemplates,
    create_timeout: Duration,
}

impl CommandHypervisor {
    pub fn new(executor: CommandExecutor, templates: HypervisorTemplates) -> Self {
        Self {
            executor,
            templates,
            create_timeout: DEFAULT_CREATE_TIMEOUT,
        }
    }

    pub fn with_create_timeout(mut self, timeout: Duration) -> Self {
        self.create_timeout = timeout;
        self
    }

    fn timeout(&self) -> Duration {
        self.executor.default_timeout()
    }

    fn render_descriptor(&self, locator: &DeviceLocator) -> String {
        match locator {
            DeviceLocator::Pci {
                domain,
                bus,
                slot,
                function,
            } => {
                let domain = format!("{domain:04x}");
                let bus = format!("{bus:02x}");
                let slot = format!("{slot:02x}");
                let function = format!("{function:x}");
                render(
                    &self.templates.pci_descriptor,
                    &[
                        ("domain", domain.as_str()),
                        ("bus", bus.as_str()),
                        ("slot", slot.as_str()),
                        ("function", function.as_str()),
                    ],
                )
            }
            DeviceLocator::Mediated(uuid) => {
                let uuid = uuid.to_string();
                render(&self.templates.mdev_descriptor, &[("uuid", uuid.as_str())])
            }
        }
    }

    fn descriptor_path(&self, descriptor: &DeviceDescriptor) -> String {
        let dir = if self.templates.descriptor_dir.is_empty() {
            "/tmp"
        } else {
            self.templates.descriptor_dir.trim_end_matches('/')
        };
        let device: String = descriptor
            .locator
            .to_string()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        format!("{dir}/{}-{device}.xml", descriptor.vm_name)
    }

    /// Write the descriptor, run `template` against it, then remove it.
    async fn apply_descriptor(&self, template: &str, descriptor: &DeviceDescriptor) -> Result<()> {
        let path = self.descriptor_path(descriptor);
        let body = self.render_descriptor(&descriptor.locator);
        let write = format!("cat > {path} <<'{HEREDOC_TAG}'\n{body}\n{HEREDOC_TAG}");
        self.executor.execute(&write, self.timeout()).await?;

        let cmd = render(
            template,
            &[
                ("name", descriptor.vm_name.as_str()),
                ("descriptor_file", path.as_str()),
            ],
        );
        let applied = self.executor.execute(&cmd, self.timeout()).await;

        if let Err(e) = self
            .executor
            .execute_best_effort(&format!("rm -f {path}"), self.timeout())
            .await
        {
            debug!(path = %path, error = %e, "descriptor cleanup failed");
        }
        applied.map(|_| ())
    }

    async fn run_simple(&self, template: &str, vars: &[(&str, &str)]) -> Result<()> {
        self.executor.execute(&render(template, vars), self.timeout()).await?;
        Ok(())
    }

    /// Exit 0 means yes, a command-level failure means no.
    async fn query(&self, template: &str, vars: &[(&str, &str)]) -> Result<Option<String>> {
        let command = render(template, vars);
        match self.executor.execute_quiet(&command, self.timeout()).await {
            Ok(out) => Ok(Some(out.stdout)),
            Err(Error::CommandFailed { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl HypervisorControl for CommandHypervisor {
    async fn create(&self, request: &CreateRequest) -> Result<CreationHandle> {
        let spec = &request.spec;
        let network = match &spec.network {
            NetworkAttachment::Default => "default".to_string(),
            NetworkAttachment::Bridge(br) => format!("bridge={br}"),
            NetworkAttachment::Macvtap(dev) => format!("type=direct,source={dev}"),
        };
        let cpuset = spec
            .cpu_affinity
            .as_ref()
            .map(|a| a.as_str().to_string())
            .unwrap_or_else(|| "auto".to_string());

        let os_family = format!("{:?}", spec.os_family).to_lowercase();
        let cpus = request.cpu_count.to_string();
        let memory_mb = spec.memory_mb.to_string();
        let disk_gb = request.disk_gb.to_string();

        let cmd = render(
            &self.templates.create,
            &[
                ("name", spec.name.as_str()),
                ("os_family", os_family.as_str()),
                ("cpus", cpus.as_str()),
                ("memory_mb", memory_mb.as_str()),
                ("disk_gb", disk_gb.as_str()),
                ("network", network.as_str()),
                ("mac", spec.mac_address.as_deref().unwrap_or("")),
                ("cpuset", cpuset.as_str()),
                ("pool", request.pool_id.as_deref().unwrap_or("default")),
                ("volume", request.volume_id.as_deref().unwrap_or("")),
                ("nested", if spec.nested { "1" } else { "0" }),
            ],
        );

        info!(vm = %spec.name, "issuing hypervisor create");
        self.executor.execute(&cmd, self.create_timeout).await?;

        let marker = self.templates.creation_process_marker.trim();
        Ok(CreationHandle {
            vm_name: spec.name.clone(),
            process_marker: (!marker.is_empty()).then(|| marker.to_string()),
        })
    }

    async fn get_ip(&self, vm_name: &str) -> Advisory<IpAddr> {
        let cmd = render(&self.templates.get_ip, &[("name", vm_name)]);
        let output = self.executor.execute_best_effort(&cmd, self.timeout()).await?;
        first_guest_ipv4(&output.stdout)
            .ok_or_else(|| AdvisoryError::with_output(format!("IP of {vm_name} not yet available"), output))
    }

    async fn power_off(&self, vm_name: &str) -> Result<()> {
        self.run_simple(&self.templates.power_off, &[("name", vm_name)]).await
    }

    async fn power_on(&self, vm_name: &str) -> Result<()> {
        self.run_simple(&self.templates.power_on, &[("name", vm_name)]).await
    }

    async fn reboot(&self, vm_name: &str) -> Result<()> {
        self.run_simple(&self.templates.reboot, &[("name", vm_name)]).await
    }

    async fn destroy(&self, vm_name: &str) -> Result<()> {
        self.run_simple(&self.templates.destroy, &[("name", vm_name)]).await
    }

    async fn attach_device_descriptor(&self, descriptor: &DeviceDescriptor) -> Result<()> {
        self.apply_descriptor(&self.templates.attach_device, descriptor).await
    }

    async fn detach_device_descriptor(&self, descriptor: &DeviceDescriptor) -> Result<()> {
        self.apply_descriptor(&self.templates.detach_device, descriptor).await
    }

    async fn device_present(&self, vm_name: &str, locator: &DeviceLocator) -> Result<bool> {
        let device = locator.to_string();
        let out = self
            .query(
                &self.templates.device_present,
                &[("name", vm_name), ("device", device.as_str())],
            )
            .await?;
        Ok(out.is_some_and(|stdout| !stdout.trim().is_empty()))
    }

    async fn define_pool(&self, pool_id: &str, backing_path: &str) -> Result<()> {
        self.run_simple(&self.templates.define_pool, &[("pool", pool_id), ("path", backing_path)])
            .await
    }

    async fn undefine_pool(&self, pool_id: &str) -> Result<()> {
        self.run_simple(&self.templates.undefine_pool, &[("pool", pool_id)]).await
    }

    async fn pool_exists(&self, pool_id: &str) -> Result<bool> {
        Ok(self
            .query(&self.templates.pool_exists, &[("pool", pool_id)])
            .await?
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{CommandOutput, RemoteShell, RetryPolicy, ShellError};
    use crate::vm::{GuestOsFamily, VmSpec};
    use std::sync::{Arc, Mutex};

    /// Records commands; replies with `stdout` and exit code from a closure.
    struct RecordingShell {
        commands: Mutex<Vec<String>>,
        reply: Box<dyn Fn(&str) -> (String, i32) + Send + Sync>,
    }

    #[async_trait]
    impl RemoteShell for RecordingShell {
        fn host(&self) -> &str {
            "sut"
        }

        async fn reconnect(&self) -> std::result::Result<(), ShellError> {
            Ok(())
        }

        async fn run(
            &self,
            command: &str,
            _timeout: Duration,
        ) -> std::result::Result<CommandOutput, ShellError> {
            self.commands.lock().unwrap().push(command.to_string());
            let (stdout, exit_code) = (self.reply)(command);
            Ok(CommandOutput {
                stdout,
                stderr: String::new(),
                exit_code,
            })
        }
    }

    fn backend(
        reply: impl Fn(&str) -> (String, i32) + Send + Sync + 'static,
    ) -> (CommandHypervisor, Arc<RecordingShell>) {
        let shell = Arc::new(RecordingShell {
            commands: Mutex::new(Vec::new()),
            reply: Box::new(reply),
        });
        let executor = CommandExecutor::new(shell.clone(), RetryPolicy::default(), Duration::from_secs(30));
        let templates = HypervisorTemplates {
            create: "mkvm --name {name} --vcpus {cpus} --disk pool={pool},size={disk_gb} --cpuset {cpuset}".into(),
            creation_process_marker: "mkvm".into(),
            get_ip: "lookup {name}".into(),
            attach_device: "attach {name} {descriptor_file} --config".into(),
            detach_device: "detach {name} {descriptor_file}".into(),
            device_present: "has {name} {device}".into(),
            pci_descriptor: "pci {domain}:{bus}:{slot}.{function}".into(),
            mdev_descriptor: "mdev {uuid}".into(),
            descriptor_dir: "/root".into(),
            pool_exists: "pool-info {pool}".into(),
            ..HypervisorTemplates::default()
        };
        (CommandHypervisor::new(executor, templates), shell)
    }

    #[test]
    fn render_replaces_all_occurrences() {
        assert_eq!(render("{a}-{b}-{a}", &[("a", "x"), ("b", "y")]), "x-y-x");
    }

    #[test]
    fn ipv4_scrape_skips_loopback() {
        let text = "lo 127.0.0.1/8\neth0 192.168.122.45/24 brd 192.168.122.255";
        assert_eq!(first_guest_ipv4(text), Some("192.168.122.45".parse().unwrap()));
        assert_eq!(first_guest_ipv4("nothing here"), None);
    }

    #[tokio::test]
    async fn create_renders_request_fields() {
        let (hv, shell) = backend(|_| (String::new(), 0));
        let request = CreateRequest {
            spec: VmSpec::new("RHEL_0", GuestOsFamily::Rhel),
            cpu_count: 4,
            disk_gb: 50,
            pool_id: Some("Storage_0".into()),
            volume_id: None,
        };
        let handle = hv.create(&request).await.unwrap();
        assert_eq!(handle.process_marker.as_deref(), Some("mkvm"));
        let cmds = shell.commands.lock().unwrap();
        assert_eq!(
            cmds[0],
            "mkvm --name RHEL_0 --vcpus 4 --disk pool=Storage_0,size=50 --cpuset auto"
        );
    }

    #[tokio::test]
    async fn get_ip_not_yet_available_is_advisory() {
        let (hv, _) = backend(|_| ("no lease yet".into(), 0));
        assert!(hv.get_ip("vm").await.is_err());

        let (hv, _) = backend(|_| ("ipv4 10.1.2.3/24".into(), 0));
        assert_eq!(hv.get_ip("vm").await.unwrap(), "10.1.2.3".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn attach_writes_descriptor_then_applies_and_cleans_up() {
        let (hv, shell) = backend(|_| (String::new(), 0));
        let descriptor = DeviceDescriptor {
            vm_name: "vm1".into(),
            locator: DeviceLocator::parse("0000:6b:02.1").unwrap(),
            present: true,
        };
        hv.attach_device_descriptor(&descriptor).await.unwrap();
        let cmds = shell.commands.lock().unwrap();
        assert_eq!(cmds.len(), 3);
        assert!(cmds[0].starts_with("cat > /root/vm1-0000_6b_02_1.xml"));
        assert!(cmds[0].contains("pci 0000:6b:02.1"));
        assert_eq!(cmds[1], "attach vm1 /root/vm1-0000_6b_02_1.xml --config");
        assert_eq!(cmds[2], "rm -f /root/vm1-0000_6b_02_1.xml");
    }

    #[tokio::test]
    async fn presence_queries_map_exit_codes() {
        let (hv, _) = backend(|cmd| {
            if cmd.starts_with("has") {
                (String::new(), 1)
            } else {
                ("Name: Storage_0".into(), 0)
            }
        });
        let loc = DeviceLocator::parse("0000:6b:02.0").unwrap();
        assert!(!hv.device_present("vm", &loc).await.unwrap());
        assert!(hv.pool_exists("Storage_0").await.unwrap());
    }
}
