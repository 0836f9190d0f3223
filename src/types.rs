use core::{fmt, str::FromStr};
use std::{io, path::PathBuf};

/// Our Error Type
#[derive(thiserror::Error, Debug)]
pub(crate) enum Error {
    /// The disk backend couldn't be initialized
    #[error("Disk Backend Unavailable: {0}")]
    BackendUnavailable(String),

    /// A required source or destination image file is absent
    #[error("Image File Missing: {}", .0.display())]
    ImageMissing(PathBuf),

    /// Partition discovery on the destination device came up empty
    #[error("No Partition Found on the Destination Device")]
    NoPartitionFound,

    /// A device or mount required by the current operation is absent
    #[error("Required Resource Unavailable: {0}")]
    ResourceUnavailable(&'static str),

    /// A file operation source doesn't exist
    #[error("Source File Not Found: {}", .0.display())]
    SourceNotFound(PathBuf),

    /// A file operation target doesn't exist
    #[error("Target File Not Found: {}", .0.display())]
    TargetNotFound(PathBuf),

    /// The backend lacks an optional feature we need
    #[error("Backend Feature Not Available: {0}")]
    UnsupportedBackend(&'static str),

    /// The requested phase can't start in the current state
    #[error("Precondition Violated: {0}")]
    PreconditionViolated(String),

    /// A pipeline action reported failure without raising
    #[error("Action Failed: {0}")]
    ActionFailed(String),

    /// An error has occurred when accessing the local filesystem or files
    #[error("I/O Error")]
    Io(#[from] io::Error),

    /// An error has occurred when parsing JSON data
    #[error("JSON Parsing Failure")]
    Json(#[from] serde_json::Error),

    /// An invalid line-match pattern was supplied
    #[error("Invalid Line Pattern")]
    Pattern(#[from] regex::Error),

    /// An unknown error occurred
    #[error("Error: {0}")]
    Custom(String),
}

/// Filesystem kind for the destination partition
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum FsKind {
    /// FAT family, the default. Volume labels are limited to 11 characters.
    Vfat,

    /// Linux ext4
    Ext4,

    /// Anything else `mkfs.<name>` knows about
    Other(String),
}

impl FsKind {
    pub(crate) fn is_fat(&self) -> bool {
        matches!(self, FsKind::Vfat)
    }

    pub(crate) fn as_str(&self) -> &str {
        match self {
            FsKind::Vfat => "vfat",
            FsKind::Ext4 => "ext4",
            FsKind::Other(name) => name,
        }
    }
}

impl Default for FsKind {
    fn default() -> Self {
        FsKind::Vfat
    }
}

impl FromStr for FsKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "vfat" | "fat" | "fat32" => FsKind::Vfat,
            "ext4" => FsKind::Ext4,
            _ => FsKind::Other(s.to_owned()),
        })
    }
}

impl fmt::Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use core::str::FromStr;

    use test_log::test;

    use super::FsKind;

    #[test]
    fn fs_kind_parses_fat_aliases() {
        assert_eq!(FsKind::from_str("vfat").unwrap(), FsKind::Vfat);
        assert_eq!(FsKind::from_str("fat").unwrap(), FsKind::Vfat);
        assert_eq!(FsKind::from_str("fat32").unwrap(), FsKind::Vfat);
        assert!(FsKind::from_str("vfat").unwrap().is_fat());
    }

    #[test]
    fn fs_kind_keeps_unknown_names() {
        let fs = FsKind::from_str("btrfs").unwrap();
        assert_eq!(fs, FsKind::Other("btrfs".to_owned()));
        assert_eq!(fs.as_str(), "btrfs");
        assert!(!fs.is_fat());
    }
}
