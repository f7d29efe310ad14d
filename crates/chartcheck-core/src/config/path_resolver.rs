use std::path::{Component, Path, PathBuf};

/// Resolves paths in a config file relative to the file's directory.
#[derive(Debug, Clone)]
pub struct PathResolver {
    base_dir: PathBuf,
}

impl PathResolver {
    pub fn new(config_path: &Path) -> Self {
        let base_dir = config_path
            .parent()
            .unwrap_or(Path::new("."))
            .to_path_buf();
        Self { base_dir }
    }

    /// Absolute and empty paths are left untouched.
    pub fn resolve(&self, p: &mut PathBuf) {
        if p.as_os_str().is_empty() || p.is_absolute() {
            return;
        }
        *p = self.join_clean(p);
    }

    pub fn resolve_opt_str(&self, p: &mut Option<String>) {
        let Some(s) = p.as_mut() else { return };
        if s.trim().is_empty() {
            return;
        }
        let mut pb = PathBuf::from(&*s);
        self.resolve(&mut pb);
        *s = pb.to_string_lossy().to_string();
    }

    fn join_clean(&self, rel: &Path) -> PathBuf {
        let mut out = PathBuf::new();
        for c in self.base_dir.join(rel).components() {
            match c {
                Component::CurDir => {}
                Component::ParentDir => {
                    if !out.pop() {
                        out.push("..");
                    }
                }
                other => out.push(other.as_os_str()),
            }
        }
        if out.as_os_str().is_empty() {
            out.push(".");
        }
        out
    }
}
