//! POSIX shared-memory backing for reference grids.
//!
//! One named segment per resource identity holds a fixed header followed by
//! the grid cells, so sibling worker processes map the same physical pages
//! read-only instead of each loading a multi-gigabyte grid. The creator
//! publishes the segment by storing the header magic last; attachers wait
//! for the magic before trusting any other field. A cross-process reference
//! count lives in the mapped header and the last release unlinks the
//! segment name.

use std::ffi::CString;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::geo::{PolarStereo, Projection};
use crate::types::{GeoTransform, GridReal, Hemisphere, ResourceError, ResourceResult};

use super::grid::RawGrid;

/// "FLOEGRID" in ASCII; stored last by the creator to publish the segment
const SEGMENT_MAGIC: u64 = 0x464c_4f45_4752_4944;

/// Header is padded to a cache line; cell data starts here
const DATA_OFFSET: usize = 128;

/// How long an attacher waits for a sibling creator to publish
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(30);

const PROJ_GEOGRAPHIC: f64 = 0.0;
const PROJ_POLAR_NORTH: f64 = 1.0;
const PROJ_POLAR_SOUTH: f64 = 2.0;

/// On-segment header; immutable after publish except for the refcount
#[repr(C)]
struct SegmentHeader {
    magic: AtomicU64,
    rows: u64,
    cols: u64,
    void_value: f32,
    _reserved: u32,
    /// top_left_x, pixel_width, top_left_y, pixel_height
    transform: [f64; 4],
    /// tag, standard parallel, central meridian, unused
    projection: [f64; 4],
    refcount: AtomicU32,
}

fn last_os_error(what: &str) -> ResourceError {
    ResourceError::SharedMemory(format!("{}: {}", what, std::io::Error::last_os_error()))
}

/// A mapped shared-memory grid segment
///
/// The mapping is read-only in spirit: cell data is never written after the
/// creator publishes, and attachers only touch the atomic refcount. Dropping
/// unmaps; [`SharedSegment::release`] additionally decrements the refcount
/// and unlinks the segment name when it reaches zero.
pub struct SharedSegment {
    ptr: *mut u8,
    len: usize,
    os_name: CString,
}

// Cell data is immutable after publish and the refcount is atomic, so the
// mapping can be shared freely between threads.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Create the segment for `os_name`, loading grid content with `load`,
    /// or attach to it if a sibling process (or an earlier acquire) already
    /// created it. Returns the segment and whether this call created it.
    ///
    /// "Segment already exists" is attach, never an error; a create/create
    /// race resolves with exactly one caller loading the grid.
    pub fn create_or_attach<F>(os_name: &str, load: F) -> ResourceResult<(Self, bool)>
    where
        F: FnOnce() -> ResourceResult<RawGrid>,
    {
        let cname = CString::new(os_name)
            .map_err(|_| ResourceError::SharedMemory(format!("bad segment name {os_name:?}")))?;

        loop {
            // O_EXCL makes creation the atomic arbiter between racing workers
            let fd = unsafe {
                libc::shm_open(
                    cname.as_ptr(),
                    libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                    0o600 as libc::mode_t,
                )
            };
            if fd >= 0 {
                let segment = Self::create(fd, cname, load)?;
                return Ok((segment, true));
            }

            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno != libc::EEXIST {
                return Err(last_os_error("shm_open(create)"));
            }

            let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0) };
            if fd >= 0 {
                let segment = Self::attach(fd, cname)?;
                return Ok((segment, false));
            }
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno == libc::ENOENT {
                // Lost a race with the final release of the previous
                // generation; go back and create it ourselves
                continue;
            }
            return Err(last_os_error("shm_open(attach)"));
        }
    }

    fn create<F>(fd: libc::c_int, cname: CString, load: F) -> ResourceResult<Self>
    where
        F: FnOnce() -> ResourceResult<RawGrid>,
    {
        let result = Self::create_inner(fd, &cname, load);
        unsafe { libc::close(fd) };
        if result.is_err() {
            // Never leave a half-built segment published under the name
            unsafe { libc::shm_unlink(cname.as_ptr()) };
        }
        result
    }

    fn create_inner<F>(fd: libc::c_int, cname: &CString, load: F) -> ResourceResult<Self>
    where
        F: FnOnce() -> ResourceResult<RawGrid>,
    {
        let raw = load()?;
        let (rows, cols) = raw.data.dim();
        let len = DATA_OFFSET + rows * cols * std::mem::size_of::<GridReal>();

        if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
            return Err(last_os_error("ftruncate"));
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(last_os_error("mmap"));
        }
        let ptr = ptr as *mut u8;

        let (proj_tag, lat_ts, lon0) = match raw.projection {
            Projection::Geographic => (PROJ_GEOGRAPHIC, 0.0, 0.0),
            Projection::PolarStereo(ps) => match ps.pole {
                Hemisphere::North => (PROJ_POLAR_NORTH, ps.lat_ts_deg, ps.lon0_deg),
                Hemisphere::South => (PROJ_POLAR_SOUTH, ps.lat_ts_deg, ps.lon0_deg),
            },
        };

        unsafe {
            let header = &mut *(ptr as *mut SegmentHeader);
            header.rows = rows as u64;
            header.cols = cols as u64;
            header.void_value = raw.void_value;
            header.transform = [
                raw.transform.top_left_x,
                raw.transform.pixel_width,
                raw.transform.top_left_y,
                raw.transform.pixel_height,
            ];
            header.projection = [proj_tag, lat_ts, lon0, 0.0];
            header.refcount.store(1, Ordering::Relaxed);

            let dst =
                std::slice::from_raw_parts_mut(ptr.add(DATA_OFFSET) as *mut GridReal, rows * cols);
            for (d, s) in dst.iter_mut().zip(raw.data.iter()) {
                *d = *s;
            }

            // Publish: every store above must be visible before the magic
            fence(Ordering::Release);
            header.magic.store(SEGMENT_MAGIC, Ordering::Release);
        }

        log::info!(
            "created shared grid segment {} ({}x{}, {} MB)",
            cname.to_string_lossy(),
            rows,
            cols,
            len / (1024 * 1024)
        );

        Ok(Self {
            ptr,
            len,
            os_name: cname.clone(),
        })
    }

    fn attach(fd: libc::c_int, cname: CString) -> ResourceResult<Self> {
        let result = Self::attach_inner(fd, &cname);
        unsafe { libc::close(fd) };
        result
    }

    fn attach_inner(fd: libc::c_int, cname: &CString) -> ResourceResult<Self> {
        // The creator sizes the segment before filling it; wait for that
        let deadline = Instant::now() + PUBLISH_TIMEOUT;
        let size = loop {
            let mut st: libc::stat = unsafe { std::mem::zeroed() };
            if unsafe { libc::fstat(fd, &mut st) } != 0 {
                return Err(last_os_error("fstat"));
            }
            if st.st_size as usize >= DATA_OFFSET {
                break st.st_size as usize;
            }
            if Instant::now() > deadline {
                return Err(ResourceError::SharedMemory(format!(
                    "segment {} never sized by its creator",
                    cname.to_string_lossy()
                )));
            }
            std::thread::sleep(Duration::from_millis(5));
        };

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(last_os_error("mmap"));
        }
        let ptr = ptr as *mut u8;

        let segment = Self {
            ptr,
            len: size,
            os_name: cname.clone(),
        };

        // Wait until the creator publishes the header
        loop {
            if segment.header().magic.load(Ordering::Acquire) == SEGMENT_MAGIC {
                break;
            }
            if Instant::now() > deadline {
                return Err(ResourceError::SharedMemory(format!(
                    "segment {} never published by its creator",
                    cname.to_string_lossy()
                )));
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        let expected = DATA_OFFSET
            + segment.rows() * segment.cols() * std::mem::size_of::<GridReal>();
        if expected > segment.len {
            return Err(ResourceError::SharedMemory(format!(
                "segment {} truncated: {} bytes mapped, {} expected",
                cname.to_string_lossy(),
                segment.len,
                expected
            )));
        }

        segment.header().refcount.fetch_add(1, Ordering::AcqRel);
        log::info!(
            "attached shared grid segment {} ({}x{})",
            cname.to_string_lossy(),
            segment.rows(),
            segment.cols()
        );
        Ok(segment)
    }

    fn header(&self) -> &SegmentHeader {
        unsafe { &*(self.ptr as *const SegmentHeader) }
    }

    pub fn rows(&self) -> usize {
        self.header().rows as usize
    }

    pub fn cols(&self) -> usize {
        self.header().cols as usize
    }

    pub fn void_value(&self) -> GridReal {
        self.header().void_value
    }

    pub fn transform(&self) -> GeoTransform {
        let t = self.header().transform;
        GeoTransform {
            top_left_x: t[0],
            pixel_width: t[1],
            top_left_y: t[2],
            pixel_height: t[3],
        }
    }

    pub fn projection(&self) -> ResourceResult<Projection> {
        let p = self.header().projection;
        let ps = |pole| {
            Projection::PolarStereo(PolarStereo {
                pole,
                lat_ts_deg: p[1],
                lon0_deg: p[2],
            })
        };
        if p[0] == PROJ_GEOGRAPHIC {
            Ok(Projection::Geographic)
        } else if p[0] == PROJ_POLAR_NORTH {
            Ok(ps(Hemisphere::North))
        } else if p[0] == PROJ_POLAR_SOUTH {
            Ok(ps(Hemisphere::South))
        } else {
            Err(ResourceError::SharedMemory(format!(
                "segment {} carries unknown projection tag {}",
                self.os_name.to_string_lossy(),
                p[0]
            )))
        }
    }

    /// Cell data as a flat row-major slice
    pub fn data(&self) -> &[GridReal] {
        unsafe {
            std::slice::from_raw_parts(
                self.ptr.add(DATA_OFFSET) as *const GridReal,
                self.rows() * self.cols(),
            )
        }
    }

    /// Drop this process's claim on the segment; the last claim unlinks the
    /// segment name.
    ///
    /// `shm_unlink` removes only the name: a sibling that already opened the
    /// segment keeps a valid mapping, and the next acquire simply recreates
    /// the segment.
    pub fn release(self) {
        let remaining = self.header().refcount.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 {
            log::info!(
                "unlinking shared grid segment {}",
                self.os_name.to_string_lossy()
            );
            if unsafe { libc::shm_unlink(self.os_name.as_ptr()) } != 0 {
                log::warn!(
                    "shm_unlink {} failed: {}",
                    self.os_name.to_string_lossy(),
                    std::io::Error::last_os_error()
                );
            }
        } else {
            log::debug!(
                "released shared grid segment {} ({} claims remain)",
                self.os_name.to_string_lossy(),
                remaining
            );
        }
        // Drop unmaps
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

impl std::fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSegment")
            .field("os_name", &self.os_name)
            .field("rows", &self.rows())
            .field("cols", &self.cols())
            .finish()
    }
}
