// Final assembly — stitches sorted temp files into the destination artifact.
//
// Runs synchronously: assembly is the terminal phase of a download, after
// every connection has reported its writes complete.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::TempFileStore;
use crate::error::EngineError;

/// Concatenate the store's temp files, in byte order, into
/// `base_save_dir/file_name`.
///
/// An existing file of the same name is never overwritten; the name is
/// disambiguated with a ` (n)` suffix. If the file cannot be created at all,
/// a `{uid}{ext}` fallback name is tried. Succeeds only when the assembled
/// length equals `content_length`, and only then deletes the temp directory.
pub fn assemble(
    store: &TempFileStore,
    base_save_dir: &Path,
    file_name: &str,
    uid: &str,
    content_length: u64,
) -> Result<PathBuf, EngineError> {
    fs::create_dir_all(base_save_dir)?;

    let (dest_path, dest_file) = match create_destination(base_save_dir, file_name) {
        Ok(created) => created,
        Err(e) => {
            warn!(
                "cannot create {:?} in {:?} ({}), falling back to uid naming",
                file_name, base_save_dir, e
            );
            let fallback = format!("{}{}", uid, extension_of(file_name));
            create_destination(base_save_dir, &fallback)?
        }
    };

    let mut writer = BufWriter::new(dest_file);
    for temp in store.sorted_temp_files()? {
        let mut reader = File::open(&temp.path)?;
        io::copy(&mut reader, &mut writer)?;
    }
    let dest_file = writer.into_inner().map_err(|e| e.into_error())?;
    dest_file.sync_all()?;

    let actual = dest_file.metadata()?.len();
    if actual != content_length {
        // Temp files are kept so the download can be repaired and retried.
        return Err(EngineError::AssembleLengthMismatch {
            expected: content_length,
            actual,
        });
    }

    store.remove()?;
    info!("assembled {:?} ({} bytes)", dest_path, actual);
    Ok(dest_path)
}

/// Create `dir/name`, suffixing ` (1)`, ` (2)`, … before the extension while
/// the name is taken.
fn create_destination(dir: &Path, name: &str) -> Result<(PathBuf, File), EngineError> {
    let (stem, ext) = split_name(name);
    for attempt in 0..100u32 {
        let candidate = if attempt == 0 {
            name.to_string()
        } else {
            format!("{} ({}){}", stem, attempt, ext)
        };
        let path = dir.join(&candidate);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(EngineError::Io(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("no free name for {:?} in {:?}", name, dir),
    )))
}

fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(dot) if dot > 0 => name.split_at(dot),
        _ => (name, ""),
    }
}

fn extension_of(name: &str) -> &str {
    split_name(name).1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_name() {
        assert_eq!(split_name("video.mp4"), ("video", ".mp4"));
        assert_eq!(split_name("archive.tar.gz"), ("archive.tar", ".gz"));
        assert_eq!(split_name("noext"), ("noext", ""));
        assert_eq!(split_name(".hidden"), (".hidden", ""));
    }
}
