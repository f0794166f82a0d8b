//! Build script for fwmgr
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! used by `fwmgr --version`.

fn main() {
    // Packagers may pin the enforcement tool locations at build time
    println!("cargo:rerun-if-env-changed=FWMGR_SYSTEM_RESTORE_PATH");
    println!("cargo:rerun-if-env-changed=FWMGR_SYSTEM_SAVE_PATH");

    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
