//! Filesystem-backed load driver.
//!
//! Fills the pool by writing random data files into a directory on the
//! filesystem the thin pool backs. Random data defeats compression and
//! deduplication, so logical bytes written translate to physical pool usage.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rand::RngCore;

use crate::core::errors::{CapError, Result};
use crate::load::driver::{FillCompletion, FillOptions, FillRequest, IoPattern, LoadDriver};

/// [`LoadDriver`] that writes `fill-<label>.dat` files under a target
/// directory. One file per request; files accumulate across steps so the
/// pool's occupancy only ever grows during a run.
#[derive(Debug, Clone)]
pub struct FileLoadDriver {
    target_dir: PathBuf,
}

impl FileLoadDriver {
    /// Create the driver, making the target directory if needed.
    pub fn new(target_dir: impl Into<PathBuf>) -> Result<Self> {
        let target_dir = target_dir.into();
        fs::create_dir_all(&target_dir).map_err(|e| CapError::io(&target_dir, e))?;
        Ok(Self { target_dir })
    }

    /// Directory the artifacts land in.
    #[must_use]
    pub fn target_dir(&self) -> &Path {
        &self.target_dir
    }

    /// Delete every `fill-*.dat` artifact. Returns the bytes reclaimed.
    pub fn remove_artifacts(&self) -> Result<u64> {
        let mut reclaimed = 0u64;
        let entries = match fs::read_dir(&self.target_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(CapError::io(&self.target_dir, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| CapError::io(&self.target_dir, e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !(name.starts_with("fill-") && name.ends_with(".dat")) {
                continue;
            }
            let path = entry.path();
            let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            fs::remove_file(&path).map_err(|e| CapError::io(&path, e))?;
            reclaimed = reclaimed.saturating_add(size);
        }
        Ok(reclaimed)
    }

    fn artifact_path(&self, label: &str) -> PathBuf {
        let safe: String = label
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        self.target_dir.join(format!("fill-{safe}.dat"))
    }
}

impl LoadDriver for FileLoadDriver {
    fn fill(&self, request: &FillRequest) -> Result<FillCompletion> {
        request.options.validate()?;
        let path = self.artifact_path(&request.label);
        let started = Instant::now();

        let result = write_artifact(&path, request);
        if result.is_err() {
            // Partial artifacts would skew later steps.
            let _ = fs::remove_file(&path);
        }
        result?;

        let written = fs::metadata(&path)
            .map_err(|e| CapError::io(&path, e))?
            .len();
        if written != request.target_bytes {
            let _ = fs::remove_file(&path);
            return Err(CapError::load_failed(
                &request.label,
                format!(
                    "short write: {written} of {} bytes landed in {}",
                    request.target_bytes,
                    path.display()
                ),
            ));
        }

        Ok(FillCompletion {
            bytes_written: written,
            duration: started.elapsed(),
        })
    }
}

fn write_artifact(path: &Path, request: &FillRequest) -> Result<()> {
    let file = {
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt as _;
            opts.mode(0o600);
        }
        opts.open(path).map_err(|e| CapError::io(path, e))?
    };

    if request.target_bytes == 0 {
        file.sync_all().map_err(|e| CapError::io(path, e))?;
        return Ok(());
    }

    let extents = plan_extents(request.target_bytes, &request.options);
    let sync_tracker = AtomicU64::new(0);

    let lanes = usize::try_from(request.options.queue_depth).unwrap_or(1).max(1);
    if lanes == 1 || extents.len() == 1 {
        write_extents(&file, path, &extents, request, 1, &sync_tracker)?;
    } else {
        run_lanes(&file, path, &extents, request, lanes, &sync_tracker)?;
    }

    file.sync_all().map_err(|e| CapError::io(path, e))?;
    Ok(())
}

/// `(offset, len)` for every block, in write order.
fn plan_extents(target: u64, options: &FillOptions) -> Vec<(u64, u64)> {
    let bs = options.block_size_bytes;
    let mut extents = Vec::new();
    let mut offset = 0u64;
    while offset < target {
        let len = bs.min(target - offset);
        extents.push((offset, len));
        offset += len;
    }
    if options.io_pattern == IoPattern::Random {
        use rand::seq::SliceRandom;
        extents.shuffle(&mut rand::rng());
    }
    extents
}

#[cfg(unix)]
fn run_lanes(
    file: &File,
    path: &Path,
    extents: &[(u64, u64)],
    request: &FillRequest,
    lanes: usize,
    sync_tracker: &AtomicU64,
) -> Result<()> {
    let failure = parking_lot::Mutex::new(None::<std::io::Error>);
    std::thread::scope(|scope| {
        for lane in 0..lanes {
            let lane_extents: Vec<(u64, u64)> = extents
                .iter()
                .skip(lane)
                .step_by(lanes)
                .copied()
                .collect();
            let failure = &failure;
            scope.spawn(move || {
                if let Err(e) =
                    write_extents(file, path, &lane_extents, request, lanes, sync_tracker)
                {
                    let mut slot = failure.lock();
                    if slot.is_none() {
                        *slot = Some(std::io::Error::other(e.to_string()));
                    }
                }
            });
        }
    });
    match failure.into_inner() {
        Some(e) => Err(CapError::io(path, e)),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn run_lanes(
    file: &File,
    path: &Path,
    extents: &[(u64, u64)],
    request: &FillRequest,
    _lanes: usize,
    sync_tracker: &AtomicU64,
) -> Result<()> {
    write_extents(file, path, extents, request, 1, sync_tracker)
}

#[allow(clippy::cast_precision_loss)]
fn write_extents(
    file: &File,
    path: &Path,
    extents: &[(u64, u64)],
    request: &FillRequest,
    lanes: usize,
    sync_tracker: &AtomicU64,
) -> Result<()> {
    let options = &request.options;
    let mut rng = rand::rng();
    let block = usize::try_from(options.block_size_bytes.min(16 * 1024 * 1024))
        .unwrap_or(usize::MAX)
        .max(1);
    let mut chunk = vec![0u8; block];
    let mut read_debt = 0.0f64;
    let mut written = 0u64;
    let started = Instant::now();
    // Each lane paces its share of the global ceiling.
    let lane_rate = options
        .rate_limit_bytes_per_sec
        .map(|rate| (rate / lanes as u64).max(1));

    for &(offset, len) in extents {
        let mut done = 0u64;
        while done < len {
            let take = chunk.len().min(usize::try_from(len - done).unwrap_or(chunk.len()));
            rng.fill_bytes(&mut chunk[..take]);
            write_chunk(file, path, &chunk[..take], offset + done)?;
            done += take as u64;
        }
        written += len;

        if options.fsync_every_bytes > 0 {
            let before = sync_tracker.fetch_add(len, Ordering::AcqRel);
            if before + len >= options.fsync_every_bytes {
                sync_tracker.store(0, Ordering::Release);
                file.sync_all().map_err(|e| CapError::io(path, e))?;
            }
        }

        read_debt += options.read_write_ratio;
        while read_debt >= 1.0 {
            read_debt -= 1.0;
            read_back(file, path, &mut chunk, offset, len)?;
        }

        if let Some(rate) = lane_rate {
            let expected = Duration::from_secs_f64(written as f64 / rate as f64);
            let actual = started.elapsed();
            if expected > actual {
                std::thread::sleep(expected - actual);
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
fn write_chunk(file: &File, path: &Path, chunk: &[u8], offset: u64) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(chunk, offset)
        .map_err(|e| CapError::io(path, e))
}

#[cfg(not(unix))]
fn write_chunk(file: &File, path: &Path, chunk: &[u8], offset: u64) -> Result<()> {
    use std::io::Seek;
    let mut f = file;
    f.seek(std::io::SeekFrom::Start(offset))
        .map_err(|e| CapError::io(path, e))?;
    f.write_all(chunk).map_err(|e| CapError::io(path, e))
}

/// Re-read a just-written extent. Models the read share of a mixed workload.
#[cfg(unix)]
fn read_back(file: &File, path: &Path, chunk: &mut [u8], offset: u64, len: u64) -> Result<()> {
    use std::os::unix::fs::FileExt;
    let take = chunk.len().min(usize::try_from(len).unwrap_or(chunk.len()));
    file.read_exact_at(&mut chunk[..take], offset)
        .map_err(|e| CapError::io(path, e))
}

#[cfg(not(unix))]
fn read_back(_file: &File, _path: &Path, _chunk: &mut [u8], _offset: u64, _len: u64) -> Result<()> {
    Ok(())
}
