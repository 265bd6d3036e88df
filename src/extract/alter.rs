//! Tar header alterations applied while extracting

use std::path::{Component, Path, PathBuf};
use tar::{EntryType, Header};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Alteration {
    /// Files become 0640, everything else 0755
    StripPermissions,
    /// Owner and group become root, names are cleared
    StripOwnership,
    /// Keep only entries under `from`, relocated to `to`
    RebasePath { from: PathBuf, to: PathBuf },
    /// Keep only regular files and directories
    FilesOnly,
}

impl Alteration {
    /// Parse a `FROM:TO` path mapping
    pub fn rebase(mapping: &str) -> Option<Self> {
        let (from, to) = mapping.split_once(':')?;
        Some(Alteration::RebasePath {
            from: relative(Path::new(from))?,
            to: relative(Path::new(to)).unwrap_or_default(),
        })
    }

    /// Alter `header` and return the new path, or `None` to skip the entry
    fn apply(&self, header: &mut Header, path: PathBuf) -> Option<PathBuf> {
        match self {
            Alteration::StripPermissions => {
                let mode = match header.entry_type() {
                    EntryType::Regular | EntryType::Continuous => 0o640,
                    _ => 0o755,
                };
                header.set_mode(mode);
                Some(path)
            }
            Alteration::StripOwnership => {
                header.set_uid(0);
                header.set_gid(0);
                let _ = header.set_username("");
                let _ = header.set_groupname("");
                Some(path)
            }
            Alteration::RebasePath { from, to } => {
                let rest = path.strip_prefix(from).ok()?;
                Some(to.join(rest))
            }
            Alteration::FilesOnly => matches!(
                header.entry_type(),
                EntryType::Regular | EntryType::Continuous | EntryType::Directory
            )
            .then_some(path),
        }
    }
}

/// Ordered list of alterations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Alterations(pub Vec<Alteration>);

impl Alterations {
    pub fn push(&mut self, alteration: Alteration) {
        self.0.push(alteration);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Apply every alteration in order. `None` means the entry is dropped.
    pub fn apply(&self, header: &mut Header, path: PathBuf) -> Option<PathBuf> {
        self.0
            .iter()
            .try_fold(path, |path, alteration| alteration.apply(header, path))
    }
}

/// Normalize an archive path to a relative one. Paths escaping the root
/// yield `None`.
pub fn relative(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => return None,
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(kind: EntryType, mode: u32) -> Header {
        let mut header = Header::new_gnu();
        header.set_entry_type(kind);
        header.set_mode(mode);
        header.set_uid(1000);
        header.set_gid(1000);
        header
    }

    #[test]
    fn rebases_and_filters() {
        let mut alterations = Alterations::default();
        alterations.push(Alteration::rebase("/usr/share:docs").unwrap());
        alterations.push(Alteration::FilesOnly);

        let mut file = header(EntryType::Regular, 0o755);
        assert_eq!(
            alterations.apply(&mut file, PathBuf::from("usr/share/doc/README")),
            Some(PathBuf::from("docs/doc/README"))
        );
        assert_eq!(alterations.apply(&mut file, PathBuf::from("etc/passwd")), None);

        let mut link = header(EntryType::Symlink, 0o777);
        assert_eq!(alterations.apply(&mut link, PathBuf::from("usr/share/link")), None);
    }

    #[test]
    fn strips_permissions_and_ownership() {
        let alterations = Alterations(vec![Alteration::StripPermissions, Alteration::StripOwnership]);
        let mut file = header(EntryType::Regular, 0o4755);
        alterations.apply(&mut file, PathBuf::from("bin/tool")).unwrap();
        assert_eq!(file.mode().unwrap(), 0o640);
        assert_eq!(file.uid().unwrap(), 0);

        let mut dir = header(EntryType::Directory, 0o700);
        alterations.apply(&mut dir, PathBuf::from("bin")).unwrap();
        assert_eq!(dir.mode().unwrap(), 0o755);
    }

    #[test]
    fn relative_rejects_escapes() {
        assert_eq!(relative(Path::new("/./etc/hosts")), Some(PathBuf::from("etc/hosts")));
        assert_eq!(relative(Path::new("../etc/hosts")), None);
    }
}
