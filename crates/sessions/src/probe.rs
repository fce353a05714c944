//! Binary-type probe for host launch flags.
//!
//! Universal (fat) Mach-O binaries with an ARM64 slice need an explicit
//! slice-selection flag when handed to the disassembly host; everything
//! else auto-detects. Probe failures mean "no flag", never an error.

use std::process::Command;

/// Extra host flag for the given binary, if any.
pub fn detect_type_flag(binary_path: &str) -> Option<String> {
    let file_output = run_lowercase("file", &[binary_path])?;
    let is_fat_macho = (file_output.contains("universal") || file_output.contains("fat"))
        && file_output.contains("mach-o");
    if !is_fat_macho {
        return None;
    }

    let archs = run_lowercase("lipo", &["-archs", binary_path])?;
    if archs.contains("arm64") {
        return Some("-TFat Mach-O file, 2. ARM64".to_owned());
    }
    None
}

fn run_lowercase(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).to_lowercase())
}
