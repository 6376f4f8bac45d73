//! Boot-stage script generation.
//!
//! Stage 1 runs from the init image as the kernel's `init=`. It assembles the
//! real root (read-only base image + tmpfs overlay + host share), moves the
//! early mounts across, installs stage 2 as `/init` and pivots into it.
//! Stage 2 does all guest-specific setup and then supervises the serial
//! login forever.
//!
//! Both scripts are rendered from [`BootParams`]; stage 1 is rendered from an
//! ordered list of [`MountStep`]s whose ordering is checked before rendering.

use std::fmt::Write as _;
use thiserror::Error;

/// Inputs shared by both boot stages and the kernel command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootParams {
    pub hostname: String,
    /// 9p mount tag exported by the hypervisor.
    pub mount_tag: String,
    /// Where the host directory appears inside the guest.
    pub host_mount_point: String,
    /// First virtio disk: the init image, mounted by the kernel as `/`.
    pub init_device: String,
    /// Second virtio disk: the base rootfs image.
    pub base_device: String,
    pub net_interface: String,
    pub console: String,
    pub lower_dir: String,
    pub scratch_dir: String,
    pub new_root: String,
    pub stage1_path: String,
    pub stage2_path: String,
    /// Path of stage 2 inside the assembled root.
    pub init_path: String,
}

impl Default for BootParams {
    fn default() -> Self {
        Self {
            hostname: "devvm".to_string(),
            mount_tag: "host".to_string(),
            host_mount_point: "/mnt/host".to_string(),
            init_device: "/dev/vda".to_string(),
            base_device: "/dev/vdb".to_string(),
            net_interface: "eth0".to_string(),
            console: "ttyS0".to_string(),
            lower_dir: "/mnt/lower".to_string(),
            scratch_dir: "/mnt/rw".to_string(),
            new_root: "/mnt/root".to_string(),
            stage1_path: "/stage1".to_string(),
            stage2_path: "/stage2".to_string(),
            init_path: "/init".to_string(),
        }
    }
}

impl BootParams {
    /// Directories that must already exist in the read-only init image.
    pub fn init_image_dirs(&self) -> Vec<String> {
        [
            "/dev",
            "/proc",
            "/sys",
            self.lower_dir.as_str(),
            self.scratch_dir.as_str(),
            self.new_root.as_str(),
        ]
        .iter()
        .map(|d| d.trim_start_matches('/').to_string())
        .collect()
    }

    fn in_new_root(&self, path: &str) -> String {
        format!("{}{}", self.new_root, path)
    }
}

const NINE_P_OPTIONS: &str = "trans=virtio,version=9p2000.L,msize=524288";

/// Where `pivot_root` parks the init image, relative to the new root.
const OLD_ROOT: &str = ".oldroot";

/// One step of the stage 1 handoff.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MountStep {
    /// devtmpfs/proc/sysfs for the init environment itself.
    EarlyMounts,
    /// Base squashfs, read-only.
    MountLower,
    /// Private tmpfs for the overlay's writable half.
    MountScratch,
    MakeOverlayDirs,
    MountOverlay,
    /// 9p host directory under the new root.
    MountHostShare,
    /// `mount --move` of /dev, /proc, /sys into the new root.
    RelocateMounts,
    InstallStage2,
    PivotRoot,
    ExecStage2,
}

impl MountStep {
    /// Steps that must have run before this one.
    pub fn prerequisites(self) -> &'static [MountStep] {
        match self {
            MountStep::EarlyMounts => &[],
            MountStep::MountLower | MountStep::MountScratch => &[MountStep::EarlyMounts],
            MountStep::MakeOverlayDirs => &[MountStep::MountScratch],
            MountStep::MountOverlay => &[MountStep::MountLower, MountStep::MakeOverlayDirs],
            MountStep::MountHostShare | MountStep::InstallStage2 => &[MountStep::MountOverlay],
            MountStep::RelocateMounts => &[MountStep::MountOverlay, MountStep::MountHostShare],
            MountStep::PivotRoot => &[
                MountStep::MountHostShare,
                MountStep::RelocateMounts,
                MountStep::InstallStage2,
            ],
            MountStep::ExecStage2 => &[MountStep::PivotRoot],
        }
    }

    fn render(self, p: &BootParams, out: &mut String) {
        let lines: Vec<String> = match self {
            MountStep::EarlyMounts => vec![
                "busybox mountpoint -q /dev || busybox mount -t devtmpfs devtmpfs /dev".into(),
                "busybox mount -t proc proc /proc".into(),
                "busybox mount -t sysfs sysfs /sys".into(),
            ],
            MountStep::MountLower => vec![format!(
                "busybox mount -t squashfs -o ro {} {}",
                p.base_device, p.lower_dir
            )],
            MountStep::MountScratch => vec![format!(
                "busybox mount -t tmpfs -o mode=0755 tmpfs {}",
                p.scratch_dir
            )],
            MountStep::MakeOverlayDirs => vec![format!(
                "busybox mkdir -p {0}/upper {0}/work",
                p.scratch_dir
            )],
            MountStep::MountOverlay => {
                let options = format!(
                    "lowerdir={},upperdir={1}/upper,workdir={1}/work",
                    p.lower_dir, p.scratch_dir
                );
                vec![format!(
                    "busybox mount -t overlay overlay -o {options} {}",
                    p.new_root
                )]
            }
            MountStep::MountHostShare => {
                let target = p.in_new_root(&p.host_mount_point);
                let tag = &p.mount_tag;
                vec![
                    format!("busybox mkdir -p {target}"),
                    format!("busybox mount -t 9p -o {NINE_P_OPTIONS} {tag} {target}"),
                ]
            }
            MountStep::RelocateMounts => ["/dev", "/proc", "/sys"]
                .iter()
                .map(|m| format!("busybox mount --move {m} {}", p.in_new_root(m)))
                .collect(),
            MountStep::InstallStage2 => {
                let init = p.in_new_root(&p.init_path);
                vec![
                    format!("busybox cp {} {init}", p.stage2_path),
                    format!("busybox chmod 0755 {init}"),
                ]
            }
            MountStep::PivotRoot => vec![
                format!("cd {}", p.new_root),
                format!("busybox mkdir -p {OLD_ROOT}"),
                format!("busybox pivot_root . {OLD_ROOT}"),
            ],
            MountStep::ExecStage2 => vec![format!(
                "exec busybox chroot . {} <dev/console >dev/console 2>&1",
                p.init_path
            )],
        };
        for line in lines {
            out.push_str(&line);
            out.push('\n');
        }
    }
}

/// The stage 1 sequence.
pub const STAGE1_STEPS: &[MountStep] = &[
    MountStep::EarlyMounts,
    MountStep::MountLower,
    MountStep::MountScratch,
    MountStep::MakeOverlayDirs,
    MountStep::MountOverlay,
    MountStep::MountHostShare,
    MountStep::RelocateMounts,
    MountStep::InstallStage2,
    MountStep::PivotRoot,
    MountStep::ExecStage2,
];

pub fn stage1_steps() -> Vec<MountStep> {
    STAGE1_STEPS.to_vec()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OrderError {
    #[error("{step:?} must come after {requires:?}")]
    OutOfOrder {
        step: MountStep,
        requires: MountStep,
    },
    #[error("{0:?} appears more than once")]
    Duplicate(MountStep),
}

/// Reject sequences in which a step runs before something it mounts onto.
pub fn validate_order(steps: &[MountStep]) -> Result<(), OrderError> {
    for (i, step) in steps.iter().enumerate() {
        let earlier = &steps[..i];
        if earlier.contains(step) {
            return Err(OrderError::Duplicate(*step));
        }
        if let Some(&requires) = step
            .prerequisites()
            .iter()
            .find(|req| !earlier.contains(req))
        {
            return Err(OrderError::OutOfOrder {
                step: *step,
                requires,
            });
        }
    }
    Ok(())
}

/// Render stage 1 from an explicit step sequence.
pub fn render_stage1_steps(
    params: &BootParams,
    steps: &[MountStep],
) -> Result<String, OrderError> {
    validate_order(steps)?;

    let mut script = String::from(
        "#!/bin/sh\n\
         # stage 1: assemble the overlay root and hand off to stage 2\n\
         set -e\n\
         export PATH=/bin\n",
    );
    for step in steps {
        step.render(params, &mut script);
    }
    Ok(script)
}

/// Render stage 1 using [`STAGE1_STEPS`].
pub fn render_stage1(params: &BootParams) -> Result<String, OrderError> {
    render_stage1_steps(params, STAGE1_STEPS)
}

/// States of the serial login supervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoginState {
    /// First login prompt.
    Spawn,
    /// A session is running on the console.
    Wait,
    /// The session ended; start a fresh prompt immediately.
    Respawn,
}

/// Keeps a login prompt on the serial console for the life of the VM.
///
/// There is no terminal state: the VM is torn down from outside by closing
/// the hypervisor. As an [`Iterator`] it never returns `None`.
#[derive(Clone, Debug)]
pub struct LoginSupervisor {
    console: String,
    baud: u32,
    term: String,
    state: LoginState,
}

impl LoginSupervisor {
    pub fn new(console: &str) -> Self {
        Self {
            console: console.to_string(),
            baud: 115_200,
            term: "vt100".to_string(),
            state: LoginState::Spawn,
        }
    }

    pub fn state(&self) -> LoginState {
        self.state
    }

    /// Command that holds the console while a session is alive.
    pub fn login_command(&self) -> String {
        format!("getty -L {} {} {}", self.baud, self.console, self.term)
    }

    /// Shell text for `state`. Respawn jumps back to the login command.
    fn fragment(&self, state: LoginState) -> String {
        match state {
            LoginState::Spawn => "while :; do".to_string(),
            LoginState::Wait => format!("    {}", self.login_command()),
            LoginState::Respawn => "done".to_string(),
        }
    }

    /// Render one pass through the states, from Spawn to Respawn, as a
    /// shell loop.
    pub fn render(&self, out: &mut String) {
        let mut machine = Self {
            state: LoginState::Spawn,
            ..self.clone()
        };
        let mut state = machine.state();
        loop {
            out.push_str(&self.fragment(state));
            out.push('\n');
            if state == LoginState::Respawn {
                break;
            }
            match machine.next() {
                Some(next) => state = next,
                None => break,
            }
        }
    }
}

impl Iterator for LoginSupervisor {
    type Item = LoginState;

    fn next(&mut self) -> Option<LoginState> {
        self.state = match self.state {
            LoginState::Spawn | LoginState::Respawn => LoginState::Wait,
            LoginState::Wait => LoginState::Respawn,
        };
        Some(self.state)
    }
}

/// Render stage 2: guest setup followed by the login supervisor.
pub fn render_stage2(params: &BootParams) -> String {
    let mut script = String::from(
        "#!/bin/sh\n\
         # stage 2: guest setup, then keep a login prompt on the console\n\
         export PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin\n",
    );
    let p = params;
    let _ = writeln!(
        script,
        "umount -l /{OLD_ROOT} 2>/dev/null && rmdir /{OLD_ROOT}"
    );
    let _ = writeln!(script, "hostname {}", p.hostname);
    let _ = writeln!(script, "echo {} > /etc/hostname", p.hostname);
    let _ = writeln!(script, "ip link set lo up");
    let _ = writeln!(script, "ip link set {} up", p.net_interface);
    let _ = writeln!(
        script,
        "udhcpc -i {0} -q -n || echo \"dhcp on {0} failed, continuing without network\"",
        p.net_interface
    );
    let _ = writeln!(script, "passwd -d root >/dev/null 2>&1");
    let _ = writeln!(script, "cat <<'EOF'");
    script.push_str(&banner(p));
    let _ = writeln!(script, "EOF");

    LoginSupervisor::new(&p.console).render(&mut script);
    script
}

fn banner(p: &BootParams) -> String {
    format!(
        "\n\
         Welcome to {host}.\n\
         \n\
           Log in as root, no password.\n\
           The host directory is mounted at {share}.\n\
           Changes outside {share} live in RAM and vanish on exit.\n\
           Install packages with: apk add <name>\n\
           Quit QEMU with: Ctrl-a x\n\
         \n",
        host = p.hostname,
        share = p.host_mount_point,
    )
}

/// Kernel command line that boots the init image into stage 1.
pub fn kernel_cmdline(params: &BootParams) -> String {
    format!(
        "console={} root={} rootfstype=squashfs ro init={} nokaslr",
        params.console, params.init_device, params.stage1_path
    )
}
