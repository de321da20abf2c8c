// Per-range temp-file store — names, lists, validates, and gap-scans the
// partial files a download's connections have written.
//
// Each temp file covers exactly the inclusive byte range its name declares
// ("{start}-{end}"), so the whole on-disk state of a download can be
// reconstructed from a directory listing.

pub mod assemble;

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::EngineError;
use crate::segment::Segment;

/// File name for a flushed byte range.
pub fn temp_file_name(segment: &Segment) -> String {
    format!("{}-{}", segment.start, segment.end)
}

/// Recover the byte range a temp file covers from its name.
pub fn segment_from_file_name(name: &str) -> Option<Segment> {
    let (start, end) = name.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end: u64 = end.parse().ok()?;
    if start > end {
        return None;
    }
    Some(Segment::new(start, end))
}

/// A temp file and the range its name declares.
#[derive(Debug, Clone)]
pub struct TempFile {
    pub path: PathBuf,
    pub segment: Segment,
}

/// Result of an integrity pass over a download's temp directory.
#[derive(Debug, Default)]
pub struct IntegrityReport {
    /// Files whose on-disk length or range is wrong, or that overlap another.
    pub corrupted: Vec<PathBuf>,
    /// Gaps still to download. Populated only when requested.
    pub missing: Vec<Segment>,
}

/// Handle on one download's temp directory (`base_temp_dir/{uid}`).
#[derive(Debug, Clone)]
pub struct TempFileStore {
    dir: PathBuf,
}

impl TempFileStore {
    pub fn new(base_temp_dir: &Path, uid: &str) -> Self {
        Self {
            dir: base_temp_dir.join(uid),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All parseable temp files, ordered by start byte. A missing directory
    /// reads as empty.
    pub fn sorted_temp_files(&self) -> Result<Vec<TempFile>, EngineError> {
        let mut files = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            match segment_from_file_name(name) {
                Some(segment) => files.push(TempFile {
                    path: entry.path(),
                    segment,
                }),
                None => debug!("ignoring unparseable temp file {:?}", name),
            }
        }
        files.sort_by_key(|f| f.segment.start);
        Ok(files)
    }

    /// Byte ranges of `[0, content_length)` not covered by any temp file,
    /// ordered by start byte.
    pub fn find_missing_byte_ranges(
        &self,
        content_length: u64,
    ) -> Result<Vec<Segment>, EngineError> {
        if content_length == 0 {
            return Ok(Vec::new());
        }
        let files = self.sorted_temp_files()?;
        let mut missing = Vec::new();
        let mut next_expected: u64 = 0;
        for file in &files {
            if file.segment.start > next_expected {
                missing.push(Segment::new(next_expected, file.segment.start - 1));
            }
            next_expected = next_expected.max(file.segment.end + 1);
        }
        if next_expected < content_length {
            missing.push(Segment::new(next_expected, content_length - 1));
        }
        Ok(missing)
    }

    /// Flag temp files whose on-disk length does not match their declared
    /// range, whose range overflows the content, or whose range overlaps
    /// another file's. Flagged files are unlinked when `delete_corrupted`;
    /// missing ranges are reported when `check_for_missing`.
    ///
    /// Idempotent on a clean directory.
    pub fn validate_integrity(
        &self,
        content_length: u64,
        delete_corrupted: bool,
        check_for_missing: bool,
    ) -> Result<IntegrityReport, EngineError> {
        let files = self.sorted_temp_files()?;
        let mut report = IntegrityReport::default();

        for (i, file) in files.iter().enumerate() {
            let on_disk = fs::metadata(&file.path)?.len();
            let declared = file.segment.length();
            let mut bad = false;

            if on_disk != declared {
                warn!(
                    "temp file {:?} has {} bytes, name declares {}",
                    file.path, on_disk, declared
                );
                bad = true;
            }
            if file.segment.end >= content_length {
                warn!(
                    "temp file {:?} range exceeds content length {}",
                    file.path, content_length
                );
                bad = true;
            }
            // Files are sorted by start; overlap can only involve a neighbor.
            if let Some(prev) = i.checked_sub(1).map(|p| &files[p]) {
                if prev.segment.overlaps(&file.segment) {
                    warn!(
                        "temp files {:?} and {:?} overlap",
                        prev.path, file.path
                    );
                    bad = true;
                }
            }

            if bad {
                report.corrupted.push(file.path.clone());
            }
        }

        if delete_corrupted {
            for path in &report.corrupted {
                if let Err(e) = fs::remove_file(path) {
                    warn!("failed to delete corrupted temp file {:?}: {}", path, e);
                }
            }
        }
        if check_for_missing {
            report.missing = self.find_missing_byte_ranges(content_length)?;
        }
        Ok(report)
    }

    /// Delete the whole temp directory. Called after a successful assembly.
    pub fn remove(&self) -> Result<(), EngineError> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
