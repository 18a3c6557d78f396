//! Goblin-based inspection of the target executable.
//!
//! Tracing only needs two facts before forking: that the target really is a
//! runnable program, and which x86 flavor to decode.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use goblin::elf::header::{EM_386, EM_X86_64};
use goblin::Object;

use crate::{Address, Architecture, TraceError};

/// What the tracer needs to know about a target binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetInfo {
    pub architecture: Architecture,
    /// Static entry point from the ELF header, for diagnostics.
    pub entry_point: Address,
}

/// Verify that `path` is a regular, executable ELF binary for an
/// architecture we can trace, and report it.
pub fn inspect_executable(path: &Path) -> Result<TargetInfo, TraceError> {
    let meta = fs::metadata(path)?;
    if !meta.is_file() {
        return Err(TraceError::ParsingError(format!(
            "'{}' is not a regular file",
            path.display()
        )));
    }
    if meta.permissions().mode() & 0o111 == 0 {
        return Err(TraceError::ParsingError(format!(
            "'{}' is not an executable file",
            path.display()
        )));
    }

    let data = fs::read(path)?;
    match Object::parse(&data) {
        Ok(Object::Elf(elf)) => {
            let architecture = match elf.header.e_machine {
                EM_386 => Architecture::X86_32,
                EM_X86_64 => Architecture::X86_64,
                machine => return Err(TraceError::UnsupportedArchitecture { machine }),
            };
            log::debug!(
                "{}: {} ELF, entry point 0x{:x}",
                path.display(),
                architecture,
                elf.entry
            );
            Ok(TargetInfo {
                architecture,
                entry_point: elf.entry,
            })
        }
        Ok(_) => Err(TraceError::ParsingError(format!(
            "'{}' is not an ELF binary",
            path.display()
        ))),
        Err(e) => Err(TraceError::ParsingError(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_missing_file() {
        let err = inspect_executable(Path::new("/nonexistent/cloud-chamber-target")).unwrap_err();
        assert!(matches!(err, TraceError::Io(_)));
    }

    #[test]
    fn test_rejects_non_elf() {
        let path = std::env::temp_dir().join("cloud_chamber_not_an_elf");
        fs::write(&path, b"#!/bin/sh\nexit 0\n").unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();

        let err = inspect_executable(&path).unwrap_err();
        assert!(matches!(err, TraceError::ParsingError(_)));
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_rejects_non_executable() {
        let path = std::env::temp_dir().join("cloud_chamber_not_executable");
        fs::write(&path, b"data").unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o644);
        fs::set_permissions(&path, perms).unwrap();

        let err = inspect_executable(&path).unwrap_err();
        assert!(matches!(err, TraceError::ParsingError(_)));
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_inspect_system_binary() {
        let path = PathBuf::from("/bin/ls");
        if !path.exists() {
            eprintln!("skip: file not found: {:?}", path);
            return;
        }
        // On a non-x86 host the binary is still a valid ELF, just untraceable.
        match inspect_executable(&path) {
            Ok(info) => assert!(info.entry_point > 0),
            Err(TraceError::UnsupportedArchitecture { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}
