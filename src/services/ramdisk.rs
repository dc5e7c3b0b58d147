//! Unpacking and repacking of initial ramdisks, used to inject kernel
//! modules before a kernel is booted.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use log::info;

use super::CommandRunner;
use crate::{error::Result, utils::quote};

/// Ramdisk manipulation needed by the kernel deploy path.
pub trait RamdiskTool: Send + Sync {
    /// Unpack `ramdisk` into a new directory below `work_dir`.
    fn extract(&self, ramdisk: &Path, work_dir: &Path) -> Result<PathBuf>;
    /// Unpack the `modules` tarball into the extracted ramdisk tree.
    fn inject_modules(&self, modules: &Path, extracted: &Path) -> Result<()>;
    /// Pack `extracted` into a new ramdisk below `work_dir`.
    fn repack(&self, extracted: &Path, work_dir: &Path) -> Result<PathBuf>;
}

/// [`RamdiskTool`] for gzip'ed `newc` cpio archives, driven through the
/// host's `gzip`, `cpio` and `tar`.
pub struct CpioRamdisk {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}
impl CpioRamdisk {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        CpioRamdisk {
            runner,
            timeout: Duration::from_secs(600),
        }
    }
}
impl RamdiskTool for CpioRamdisk {
    fn extract(&self, ramdisk: &Path, work_dir: &Path) -> Result<PathBuf> {
        let dir = work_dir.join("ramdisk");
        fs::create_dir_all(&dir)?;
        info!("extracting {} into {}", ramdisk.display(), dir.display());
        let command = format!(
            "cd {} && gzip -dc {} | cpio -i -d -m -H newc",
            quote(&dir.to_string_lossy()),
            quote(&ramdisk.to_string_lossy())
        );
        self.runner.run(&command, false, self.timeout)?;
        Ok(dir)
    }

    fn inject_modules(&self, modules: &Path, extracted: &Path) -> Result<()> {
        info!("injecting {} into the ramdisk", modules.display());
        let command = format!(
            "tar -C {} -xaf {}",
            quote(&extracted.to_string_lossy()),
            quote(&modules.to_string_lossy())
        );
        self.runner.run(&command, false, self.timeout)?;
        Ok(())
    }

    fn repack(&self, extracted: &Path, work_dir: &Path) -> Result<PathBuf> {
        let ramdisk = work_dir.join("ramdisk.cpio.gz");
        info!("repacking the ramdisk into {}", ramdisk.display());
        let command = format!(
            "cd {} && find . | cpio --quiet -o -H newc | gzip > {}",
            quote(&extracted.to_string_lossy()),
            quote(&ramdisk.to_string_lossy())
        );
        self.runner.run(&command, false, self.timeout)?;
        Ok(ramdisk)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn repack_writes_next_to_the_extracted_tree() {
    use crate::testing::RecordingRunner;

    let work = tempfile::tempdir().unwrap();
    let runner = RecordingRunner::new();
    let tool = CpioRamdisk::new(runner.clone());

    let extracted = tool
        .extract(&work.path().join("initrd.img"), work.path())
        .unwrap();
    assert_eq!(extracted, work.path().join("ramdisk"));
    assert!(extracted.is_dir());

    tool.inject_modules(&work.path().join("modules.tgz"), &extracted)
        .unwrap();
    let ramdisk = tool.repack(&extracted, work.path()).unwrap();
    assert_eq!(ramdisk, work.path().join("ramdisk.cpio.gz"));

    let commands = runner.commands();
    assert_eq!(commands.len(), 3);
    assert!(commands[0].contains("cpio -i -d -m -H newc"));
    assert!(commands[1].starts_with("tar -C "));
    assert!(commands[2].ends_with("ramdisk.cpio.gz"));
}
