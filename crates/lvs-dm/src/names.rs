//! Snapshot path to device-mapper name resolution.

use lvs_error::{LvsError, Result};
use std::path::{Path, PathBuf};

/// Directory device-mapper exposes its nodes under.
pub const DM_DIR: &str = "/dev/mapper";

/// Device names derived from one snapshot path.
///
/// For `/dev/vg0/my-snap` the dm name is `vg0-my--snap`, the COW device
/// `vg0-my--snap-cow`, and the zero device `vg0-my--snap-cow-zero`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotNames {
    pub snapshot: PathBuf,
    pub dm_name: String,
    pub cow: String,
    pub zero: String,
}

impl SnapshotNames {
    /// Resolve an existing snapshot device path.
    pub fn resolve(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(LvsError::Precondition(format!(
                "snapshot {} does not exist",
                path.display()
            )));
        }
        Self::from_path(path)
    }

    /// Derive names from `/dev/<vg>/<lv>` or `/dev/mapper/<name>` without
    /// touching the filesystem.
    pub fn from_path(path: &Path) -> Result<Self> {
        let unusable = || {
            LvsError::Precondition(format!(
                "cannot derive a device-mapper name from {}",
                path.display()
            ))
        };
        let leaf = path.file_name().and_then(|s| s.to_str()).ok_or_else(unusable)?;
        let parent = path
            .parent()
            .filter(|p| p != &Path::new(DM_DIR))
            .map(|p| p.file_name().and_then(|s| s.to_str()).ok_or_else(unusable))
            .transpose()?;

        let dm_name = match parent {
            None => leaf.to_owned(),
            Some(vg) => format!("{}-{}", escape(vg), escape(leaf)),
        };
        Ok(Self::from_dm_name(path, dm_name))
    }

    #[must_use]
    pub fn from_dm_name(snapshot: &Path, dm_name: impl Into<String>) -> Self {
        let dm_name = dm_name.into();
        let cow = format!("{dm_name}-cow");
        let zero = format!("{cow}-zero");
        Self {
            snapshot: snapshot.to_path_buf(),
            dm_name,
            cow,
            zero,
        }
    }

    /// Node the scrubber opens once the zero device exists.
    #[must_use]
    pub fn zero_path(&self) -> PathBuf {
        Path::new(DM_DIR).join(&self.zero)
    }
}

fn escape(component: &str) -> String {
    component.replace('-', "--")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vg_lv_path_doubles_dashes() {
        let names = SnapshotNames::from_path(Path::new("/dev/vg-data/home-snap")).expect("names");
        assert_eq!(names.dm_name, "vg--data-home--snap");
        assert_eq!(names.cow, "vg--data-home--snap-cow");
        assert_eq!(names.zero, "vg--data-home--snap-cow-zero");
        assert_eq!(
            names.zero_path(),
            PathBuf::from("/dev/mapper/vg--data-home--snap-cow-zero")
        );
    }

    #[test]
    fn mapper_path_is_used_verbatim() {
        let names =
            SnapshotNames::from_path(Path::new("/dev/mapper/vg0-snap1")).expect("names");
        assert_eq!(names.dm_name, "vg0-snap1");
        assert_eq!(names.cow, "vg0-snap1-cow");
    }

    #[test]
    fn root_path_is_rejected() {
        let err = SnapshotNames::from_path(Path::new("/")).expect_err("no leaf");
        assert!(matches!(err, LvsError::Precondition(_)));
    }

    #[test]
    fn resolve_requires_existing_path() {
        let err = SnapshotNames::resolve(Path::new("/dev/lvscrub-none/snap"))
            .expect_err("missing");
        assert!(err.to_string().contains("does not exist"));
    }
}
