//! Unpacking an image's file tree onto a freshly formatted partition.
use crate::error::{Error, Result};
use crate::process::{Invocation, Launcher, Privilege};
use log::{debug, error, info, warn};
use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;

/// Archive tools that can read an ISO 9660/UDF image, most preferred first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveTool {
    Xorriso,
    Bsdtar,
    SevenZip,
}

impl ArchiveTool {
    pub const PREFERENCE: [ArchiveTool; 3] =
        [ArchiveTool::Xorriso, ArchiveTool::Bsdtar, ArchiveTool::SevenZip];

    pub fn program(self) -> &'static str {
        match self {
            ArchiveTool::Xorriso => "xorriso",
            ArchiveTool::Bsdtar => "bsdtar",
            ArchiveTool::SevenZip => "7z",
        }
    }

    pub fn extract_invocation(self, archive: &Path, target: &Path) -> Invocation {
        let inv = Invocation::new(self.program());
        match self {
            ArchiveTool::Xorriso => inv
                .args(["-osirrox", "on", "-indev"])
                .arg(archive)
                .args(["-extract", "/"])
                .arg(target),
            ArchiveTool::Bsdtar => inv.arg("-C").arg(target).arg("-xf").arg(archive),
            ArchiveTool::SevenZip => {
                let mut output = OsString::from("-o");
                output.push(target);
                inv.args(["x", "-y"]).arg(output).arg(archive)
            }
        }
    }
}

pub struct FilesystemExtractor {
    launcher: Arc<dyn Launcher>,
    privilege: Privilege,
}

impl FilesystemExtractor {
    pub fn new(launcher: Arc<dyn Launcher>, privilege: Privilege) -> Self {
        Self {
            launcher,
            privilege,
        }
    }

    pub fn available_tool(&self) -> Option<ArchiveTool> {
        ArchiveTool::PREFERENCE
            .into_iter()
            .find(|tool| self.launcher.resolve(tool.program()).is_some())
    }

    fn run(&self, invocation: Invocation) -> Result<()> {
        let program = invocation.program_name();
        let invocation = self.privilege.wrap(invocation)?;
        debug!("Running: {invocation}");
        self.launcher.output(&invocation)?.check(&program)?;
        Ok(())
    }

    /// Mounts `partition` on a private directory, unpacks `archive` into it
    /// and unmounts again, whatever happened in between.
    ///
    /// `on_progress` gets one pulse at the start and one at the end.
    pub fn extract<F>(&self, archive: &Path, partition: &Path, mut on_progress: F) -> Result<()>
    where
        F: FnMut(f64, &str),
    {
        let tool = self.available_tool().ok_or_else(|| {
            Error::Configuration("no extraction tool found (xorriso, bsdtar or 7z)".to_string())
        })?;

        on_progress(0.0, "Extracting files");
        let result = self.extract_with(tool, archive, partition);
        on_progress(
            1.0,
            if result.is_ok() { "Extraction complete" } else { "Extraction failed" },
        );
        result
    }

    fn extract_with(&self, tool: ArchiveTool, archive: &Path, partition: &Path) -> Result<()> {
        let mount_dir = tempfile::Builder::new()
            .prefix("bootstick-mount-")
            .tempdir()
            .map_err(|e| Error::io(std::env::temp_dir(), e))?;
        let target = mount_dir.path().to_path_buf();

        self.run(Invocation::new("mount").arg(partition).arg(&target))?;
        info!(
            "Extracting {} onto {} with {}",
            archive.display(),
            partition.display(),
            tool.program()
        );

        let extracted = self.run(tool.extract_invocation(archive, &target));
        #[cfg(unix)]
        if extracted.is_ok() {
            nix::unistd::sync();
        }

        let unmounted = self.run(Invocation::new("umount").arg(&target));
        if let Err(e) = &unmounted {
            error!("Failed to unmount {}: {e}", target.display());
            // Never remove a directory that may still have a filesystem on it.
            let kept = mount_dir.keep();
            warn!("Leaving mount directory {} in place", kept.display());
        }

        extracted.and(unmounted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeLauncher;
    use std::path::PathBuf;

    fn extractor(launcher: &Arc<FakeLauncher>) -> FilesystemExtractor {
        FilesystemExtractor::new(launcher.clone(), Privilege::unprivileged(Some("/usr/bin/pkexec".into())))
    }

    fn last_arg(inv: &Invocation) -> PathBuf {
        PathBuf::from(inv.args.last().unwrap())
    }

    #[test]
    fn tool_specific_extract_syntax() {
        let iso = Path::new("/isos/distro.iso");
        let dir = Path::new("/tmp/bootstick-mount-x");
        assert_eq!(
            ArchiveTool::Xorriso.extract_invocation(iso, dir).to_string(),
            "xorriso -osirrox on -indev /isos/distro.iso -extract / /tmp/bootstick-mount-x"
        );
        assert_eq!(
            ArchiveTool::Bsdtar.extract_invocation(iso, dir).to_string(),
            "bsdtar -C /tmp/bootstick-mount-x -xf /isos/distro.iso"
        );
        assert_eq!(
            ArchiveTool::SevenZip.extract_invocation(iso, dir).to_string(),
            "7z x -y -o/tmp/bootstick-mount-x /isos/distro.iso"
        );
    }

    #[test]
    fn tools_are_picked_in_preference_order() {
        let launcher = Arc::new(FakeLauncher::new(1 << 30));
        assert_eq!(extractor(&launcher).available_tool(), Some(ArchiveTool::Xorriso));
        launcher.remove_tool("xorriso");
        assert_eq!(extractor(&launcher).available_tool(), Some(ArchiveTool::Bsdtar));
        launcher.remove_tool("bsdtar");
        assert_eq!(extractor(&launcher).available_tool(), Some(ArchiveTool::SevenZip));
        launcher.remove_tool("7z");
        let err = extractor(&launcher)
            .extract(Path::new("a.iso"), Path::new("/dev/sdb1"), |_, _| {})
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn mounts_extracts_and_unmounts() {
        let launcher = Arc::new(FakeLauncher::new(1 << 30));
        let mut pulses = Vec::new();
        extractor(&launcher)
            .extract(Path::new("/isos/distro.iso"), Path::new("/dev/sdb1"), |f, _| pulses.push(f))
            .unwrap();

        let programs: Vec<String> = launcher.calls().iter().map(|c| c.program_name()).collect();
        assert_eq!(programs, ["mount", "xorriso", "umount"]);
        let mount_dir = last_arg(&launcher.calls_to("mount")[0]);
        assert_eq!(last_arg(&launcher.calls_to("umount")[0]), mount_dir);
        assert!(!mount_dir.exists());
        assert_eq!(pulses, [0.0, 1.0]);
    }

    #[test]
    fn failed_extraction_still_unmounts() {
        let launcher = Arc::new(FakeLauncher::new(1 << 30));
        launcher.fail_program("xorriso");
        let err = extractor(&launcher)
            .extract(Path::new("/isos/distro.iso"), Path::new("/dev/sdb1"), |_, _| {})
            .unwrap_err();
        assert!(matches!(err, Error::Process { ref program, .. } if program == "xorriso"));
        assert_eq!(launcher.calls_to("umount").len(), 1);
    }

    #[test]
    fn failed_unmount_keeps_the_directory() {
        let launcher = Arc::new(FakeLauncher::new(1 << 30));
        launcher.fail_program("umount");
        let err = extractor(&launcher)
            .extract(Path::new("/isos/distro.iso"), Path::new("/dev/sdb1"), |_, _| {})
            .unwrap_err();
        assert!(matches!(err, Error::Process { ref program, .. } if program == "umount"));
        let mount_dir = last_arg(&launcher.calls_to("mount")[0]);
        assert!(mount_dir.is_dir());
        std::fs::remove_dir(mount_dir).unwrap();
    }

    #[test]
    fn failed_mount_skips_extraction() {
        let launcher = Arc::new(FakeLauncher::new(1 << 30));
        launcher.fail_program("mount");
        assert!(extractor(&launcher)
            .extract(Path::new("/isos/distro.iso"), Path::new("/dev/sdb1"), |_, _| {})
            .is_err());
        assert!(launcher.calls_to("xorriso").is_empty());
        assert!(launcher.calls_to("umount").is_empty());
    }
}
