//! Integration tests for init image assembly and the boot scripts it carries.

mod common;

use common::{config_text_without, tar_entry_names, tar_file, TestEnv};
use devvm::{Stage, StageOutcome};

/// Run without launching and return the tar stream fed to the init image pack.
fn init_image_input(env: &TestEnv) -> Vec<u8> {
    env.seed_workspace(&config_text_without(&[]));
    let mut runner = env.runner();
    env.run_without_launch(&mut runner).unwrap();

    let init_image = env.config.init_image().display().to_string();
    runner
        .calls_to("sqfstar")
        .into_iter()
        .find(|c| c.args().last().is_some_and(|a| a.starts_with(&init_image)))
        .and_then(|c| c.input.clone())
        .unwrap()
}

#[test]
fn test_init_image_holds_only_allowed_members() {
    let env = TestEnv::new();
    let names = tar_entry_names(&init_image_input(&env));

    for expected in [
        "bin/busybox",
        "bin/sh",
        "lib/ld-musl-x86_64.so.1",
        "lib/libc.musl-x86_64.so.1",
        "stage1",
        "stage2",
        "dev",
        "proc",
        "sys",
        "mnt/lower",
        "mnt/rw",
        "mnt/root",
    ] {
        assert!(
            names.iter().any(|n| n == expected),
            "{expected} missing from {names:?}"
        );
    }
    assert!(!names.iter().any(|n| n.starts_with("etc")));
}

#[test]
fn test_stage1_assembles_root_before_handoff() {
    let env = TestEnv::new();
    let stage1 = tar_file(&init_image_input(&env), "stage1").unwrap();

    let at = |needle: &str| {
        stage1
            .find(needle)
            .unwrap_or_else(|| unreachable!("{needle:?} not in stage1:\n{stage1}"))
    };
    let lower = at("-t squashfs -o ro /dev/vdb /mnt/lower");
    let overlay = at("-t overlay overlay");
    let share = at("-t 9p");
    let moved = at("mount --move /dev /mnt/root/dev");
    let pivot = at("pivot_root");
    let exec = at("exec busybox chroot . /init");

    assert!(lower < overlay);
    assert!(overlay < share);
    assert!(share < moved);
    assert!(moved < pivot);
    assert!(pivot < exec);
}

#[test]
fn test_stage2_keeps_console_login_alive() {
    let env = TestEnv::new();
    let stage2 = tar_file(&init_image_input(&env), "stage2").unwrap();

    assert!(stage2.contains("udhcpc -i eth0"));
    assert!(stage2.contains("passwd -d root"));
    assert!(stage2.contains("/mnt/host"));
    assert!(stage2.contains("while :; do"));
    assert!(stage2.contains("getty -L 115200 ttyS0 vt100"));
}

#[test]
fn test_stale_init_tar_is_removed_before_writing() {
    let env = TestEnv::new();
    env.seed_workspace(&config_text_without(&[]));
    std::fs::create_dir_all(&env.config.artifacts_dir).unwrap();
    // Writing through a leftover link would clobber its target.
    let outside = env.path("outside.tar");
    std::fs::write(&outside, b"left over from a killed run").unwrap();
    std::os::unix::fs::symlink(&outside, env.config.init_tar()).unwrap();

    let report = env.run_without_launch(&mut env.runner()).unwrap();

    assert_eq!(
        report.outcome(Stage::AssembleInitImage),
        Some(StageOutcome::Ran)
    );
    let untouched = std::fs::read(&outside).unwrap();
    assert_eq!(untouched, b"left over from a killed run");
    assert!(std::fs::symlink_metadata(env.config.init_tar()).is_err());
    assert!(env.config.init_image().exists());
}

#[test]
fn test_staging_directory_is_cleaned_up_on_failure() {
    let env = TestEnv::new();
    env.seed_workspace(&config_text_without(&[]));
    let mut runner = env.runner();
    env.run_without_launch(&mut runner).unwrap();

    std::fs::remove_file(env.config.init_image()).unwrap();
    let mut runner = env.runner().failing("sqfstar");
    assert!(env.run_without_launch(&mut runner).is_err());

    assert_eq!(
        env.artifact_names(),
        vec!["alpine-minirootfs.tar.gz", "rootfs.sqfs"]
    );
}
