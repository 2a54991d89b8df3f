use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Append a suffix to a path's final component (`foo.txt` + `.salt` →
/// `foo.txt.salt`). Avoids `with_extension`, which would replace an existing
/// extension.
pub(crate) fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os: OsString = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

/// Write a file atomically: write the full contents to a sibling temp file,
/// fsync, then rename over the target. The rename is atomic on the hosting
/// filesystem, so readers observe either the old or the new document.
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = path_with_suffix(path, ".tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

pub(crate) fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".into())
}
