//! QEMU command construction and launch.

use crate::boot;
use crate::config::{Config, VmSettings};
use crate::exec::{Invocation, ToolRunner};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const QEMU_BINARY: &str = "qemu-system-x86_64";

/// A read-only virtio disk backed by a raw image file.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Drive {
    path: PathBuf,
}

/// A directory exported to the guest over 9p.
#[derive(Clone, Debug, PartialEq, Eq)]
struct HostShare {
    path: PathBuf,
    tag: String,
}

/// QEMU command builder with fluent API
#[derive(Clone, Debug)]
pub struct QemuBuilder {
    vm: VmSettings,
    kernel: Option<PathBuf>,
    cmdline: Option<String>,
    nographic: bool,
    user_net: bool,
    drives: Vec<Drive>,
    share: Option<HostShare>,
    extra_args: Vec<String>,
}

impl QemuBuilder {
    pub fn new(vm: VmSettings) -> Self {
        Self {
            vm,
            kernel: None,
            cmdline: None,
            nographic: true,
            user_net: true,
            drives: Vec::new(),
            share: None,
            extra_args: Vec::new(),
        }
    }

    /// Everything a provisioned VM boots with.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.vm.clone())
            .kernel(&config.kernel_image(), &boot::kernel_cmdline(&config.boot))
            .readonly_drive(&config.init_image())
            .readonly_drive(&config.base_image())
            .share_dir(&config.host_share, &config.boot.mount_tag)
            .extra_args(&config.hypervisor_args)
    }

    /// Direct kernel boot with the given command line.
    #[must_use]
    pub fn kernel(mut self, image: &Path, cmdline: &str) -> Self {
        self.kernel = Some(image.to_path_buf());
        self.cmdline = Some(cmdline.to_string());
        self
    }

    /// Attach a disk; drives appear to the guest in the order added
    /// (`/dev/vda`, `/dev/vdb`, ...).
    #[must_use]
    pub fn readonly_drive(mut self, path: &Path) -> Self {
        self.drives.push(Drive {
            path: path.to_path_buf(),
        });
        self
    }

    #[must_use]
    pub fn share_dir(mut self, path: &Path, tag: &str) -> Self {
        self.share = Some(HostShare {
            path: path.to_path_buf(),
            tag: tag.to_string(),
        });
        self
    }

    /// Serial console on stdio, no display window.
    #[must_use]
    pub fn nographic(mut self, enabled: bool) -> Self {
        self.nographic = enabled;
        self
    }

    /// User-mode networking on a virtio NIC.
    #[must_use]
    pub fn user_net(mut self, enabled: bool) -> Self {
        self.user_net = enabled;
        self
    }

    /// Appended after every generated argument, unmodified.
    #[must_use]
    pub fn extra_args(mut self, args: &[String]) -> Self {
        self.extra_args.extend(args.iter().cloned());
        self
    }

    /// Build the QEMU command
    pub fn build(self) -> Invocation {
        let mut cmd = Invocation::new(QEMU_BINARY);

        // Boot
        if let Some(kernel) = &self.kernel {
            cmd = cmd.arg("-kernel").arg(kernel);
        }
        if let Some(cmdline) = &self.cmdline {
            cmd = cmd.args(["-append", cmdline.as_str()]);
        }

        // Machine and CPU
        cmd = cmd
            .args(["-machine", self.vm.machine.as_str()])
            .args(["-accel", self.vm.accel.as_str()])
            .args(["-m", self.vm.memory.as_str()])
            .args(["-cpu", self.vm.cpu.as_str()])
            .arg("-smp")
            .arg(self.vm.smp.to_string());

        if self.nographic {
            cmd = cmd.arg("-nographic");
        }

        for drive in &self.drives {
            let spec = format!(
                "file={},if=virtio,format=raw,readonly=on",
                escape_opt(&drive.path)
            );
            cmd = cmd.arg("-drive").arg(spec);
        }

        if self.user_net {
            cmd = cmd.args(["-nic", "user,model=virtio-net-pci"]);
        }

        if let Some(share) = &self.share {
            let tag = &share.tag;
            let spec = format!(
                "local,path={},mount_tag={tag},security_model=none,id={tag}",
                escape_opt(&share.path)
            );
            cmd = cmd.arg("-virtfs").arg(spec);
        }

        cmd.args(&self.extra_args)
    }
}

/// QEMU option values separate on ',' and take ',,' as a literal comma.
fn escape_opt(path: &Path) -> String {
    path.display().to_string().replace(',', ",,")
}

/// Boot the VM on the terminal and return QEMU's exit code.
pub fn launch(config: &Config, runner: &mut dyn ToolRunner) -> Result<Option<i32>> {
    let cmd = QemuBuilder::from_config(config).build();
    info!(share = %config.host_share.display(), "booting VM, quit with Ctrl-a x");
    debug!(command = %cmd, "qemu");
    let code = runner.status(&cmd).context("Failed to start QEMU")?;
    info!(?code, "VM exited");
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> VmSettings {
        VmSettings {
            machine: "q35".to_string(),
            accel: "kvm".to_string(),
            memory: "2G".to_string(),
            cpu: "host".to_string(),
            smp: 4,
        }
    }

    fn value_after(args: &[String], flag: &str) -> Vec<String> {
        args.windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].clone())
            .collect()
    }

    #[test]
    fn test_builder_basic() {
        let cmd = QemuBuilder::new(settings())
            .kernel(Path::new("/k/bzImage"), "console=ttyS0")
            .build();
        let args = cmd.args_lossy();

        assert_eq!(cmd.program(), "qemu-system-x86_64");
        assert_eq!(value_after(&args, "-machine"), vec!["q35"]);
        assert_eq!(value_after(&args, "-accel"), vec!["kvm"]);
        assert_eq!(value_after(&args, "-cpu"), vec!["host"]);
        assert_eq!(value_after(&args, "-m"), vec!["2G"]);
        assert_eq!(value_after(&args, "-smp"), vec!["4"]);
        assert_eq!(value_after(&args, "-append"), vec!["console=ttyS0"]);
        assert!(args.contains(&"-nographic".to_string()));
    }

    #[test]
    fn test_drives_keep_order() {
        let cmd = QemuBuilder::new(settings())
            .readonly_drive(Path::new("/a/init.sqfs"))
            .readonly_drive(Path::new("/a/rootfs.sqfs"))
            .build();
        assert_eq!(
            value_after(&cmd.args_lossy(), "-drive"),
            vec![
                "file=/a/init.sqfs,if=virtio,format=raw,readonly=on",
                "file=/a/rootfs.sqfs,if=virtio,format=raw,readonly=on",
            ]
        );
    }

    #[test]
    fn test_share_escapes_commas() {
        let cmd = QemuBuilder::new(settings())
            .share_dir(Path::new("/home/me/a,b"), "host")
            .build();
        assert_eq!(
            value_after(&cmd.args_lossy(), "-virtfs"),
            vec!["local,path=/home/me/a,,b,mount_tag=host,security_model=none,id=host"]
        );
    }

    #[test]
    fn test_extra_args_last_and_verbatim() {
        let extra = vec![
            "-s".to_string(),
            "-S".to_string(),
            "-m".to_string(),
            "4G".to_string(),
        ];
        let cmd = QemuBuilder::new(settings())
            .share_dir(Path::new("/src"), "host")
            .extra_args(&extra)
            .build();
        let args = cmd.args_lossy();
        assert_eq!(&args[args.len() - 4..], extra.as_slice());
    }

    #[test]
    fn test_optional_devices_can_be_disabled() {
        let args = QemuBuilder::new(settings())
            .nographic(false)
            .user_net(false)
            .build()
            .args_lossy();
        assert!(!args.contains(&"-nographic".to_string()));
        assert!(!args.contains(&"-nic".to_string()));
    }
}
