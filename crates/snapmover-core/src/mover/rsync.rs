use super::{MoveOutcome, MoveRequest, MoveResult, SkipReason, Transfer};
use crate::config::AppConfig;
use crate::error::MoveError;
use crate::hasher;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, error, trace, warn};

/// rsync's "some files vanished before they could be transferred".
const RSYNC_VANISHED: i32 = 24;

/// Moves files with rsync. rsync copies data and attributes; the source is
/// removed here, and only after the destination has been checked.
#[derive(Debug, Clone)]
pub struct RsyncTransfer {
    program: PathBuf,
    args: Vec<String>,
    verify_checksum: bool,
}

impl RsyncTransfer {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            verify_checksum: false,
        }
    }

    /// Program, arguments and checksum verification as configured.
    pub fn from_config(app: &AppConfig) -> Self {
        Self::new(&app.rsync_path, app.rsync_args.clone()).with_verify_checksum(app.verify_checksum)
    }

    /// Also compare content hashes of source and destination before deleting.
    pub fn with_verify_checksum(mut self, verify: bool) -> Self {
        self.verify_checksum = verify;
        self
    }

    /// `<cache>/./<relative>` so `--relative` recreates only the part after `/./`.
    fn source_arg(request: &MoveRequest) -> OsString {
        let mut arg = request.cache_root.as_os_str().to_owned();
        arg.push("/./");
        arg.push(request.relative_path.as_os_str());
        arg
    }

    fn destination_arg(request: &MoveRequest) -> OsString {
        let mut arg = request.backing_root.as_os_str().to_owned();
        arg.push("/");
        arg
    }

    fn verify(&self, destination: &Path, size: u64, source_hash: Option<u64>) -> Result<(), String> {
        let metadata = fs::metadata(destination)
            .map_err(|e| format!("destination {} unreadable: {}", destination.display(), e))?;
        if !metadata.is_file() {
            return Err(format!("destination {} is not a file", destination.display()));
        }
        if metadata.len() != size {
            return Err(format!(
                "destination is {} bytes, source is {} bytes",
                metadata.len(),
                size
            ));
        }
        if let Some(expected) = source_hash {
            let actual = hasher::hash_file(destination)
                .map_err(|e| format!("cannot hash destination: {}", e))?;
            if actual != expected {
                return Err(format!(
                    "content hash mismatch ({:016x} != {:016x})",
                    actual, expected
                ));
            }
        }
        Ok(())
    }
}

impl Transfer for RsyncTransfer {
    fn copy_verify_delete(&self, request: &MoveRequest) -> MoveResult {
        let source = request.source();
        let destination = request.destination();
        let relative = &request.relative_path;

        let size = match fs::metadata(&source) {
            Ok(metadata) => metadata.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(MoveOutcome::Skipped(SkipReason::Vanished))
            }
            Err(err) => {
                return Err(MoveError::Transfer {
                    path: relative.clone(),
                    reason: format!("cannot stat source: {}", err),
                })
            }
        };
        let source_hash = if self.verify_checksum {
            Some(hasher::hash_file(&source).map_err(|e| MoveError::Transfer {
                path: relative.clone(),
                reason: format!("cannot hash source: {}", e),
            })?)
        } else {
            None
        };

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("--relative")
            .arg(Self::source_arg(request))
            .arg(Self::destination_arg(request))
            .stdin(Stdio::null());
        debug!("Running {:?}", command);

        let status = command.status().map_err(|e| MoveError::Transfer {
            path: relative.clone(),
            reason: format!("failed to run {}: {}", self.program.display(), e),
        })?;
        if status.code() == Some(RSYNC_VANISHED) {
            warn!("{} vanished during transfer", source.display());
            return Ok(MoveOutcome::Skipped(SkipReason::Vanished));
        }
        if !status.success() {
            return Err(MoveError::Transfer {
                path: relative.clone(),
                reason: format!("{} exited with {}", self.program.display(), status),
            });
        }

        if let Err(reason) = self.verify(&destination, size, source_hash) {
            if let Err(e) = fs::remove_file(&destination) {
                if e.kind() != io::ErrorKind::NotFound {
                    error!(
                        "Could not remove mismatched destination {}: {}",
                        destination.display(),
                        e
                    );
                }
            }
            return Err(MoveError::Verify {
                path: relative.clone(),
                reason,
            });
        }
        trace!("Verified {}", destination.display());

        fs::remove_file(&source).map_err(|source_err| MoveError::SourceDelete {
            path: relative.clone(),
            source: source_err,
        })?;

        Ok(MoveOutcome::Moved { bytes: size })
    }
}
