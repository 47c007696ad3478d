//! Hardware-decoded frame descriptors.
//!
//! A decoded frame reaches the video output either as an opaque GPU surface
//! handle (the decoder's driver can export it on demand) or with a DRM PRIME
//! descriptor already attached. The descriptor layout mirrors the kernel's
//! multi-plane model: a set of buffer objects (one fd each, with a layout
//! modifier) referenced by the planes of one or more layers.

use std::os::fd::{AsRawFd, OwnedFd};

/// A dmabuf-backed buffer object.
#[derive(Debug)]
pub struct DrmObject {
    pub fd: OwnedFd,
    /// 64-bit layout modifier (tiling/compression) for this object.
    pub modifier: u64,
}

/// One plane of a layer, referencing an object by index.
#[derive(Debug, Clone, Copy)]
pub struct DrmPlane {
    pub object_index: usize,
    pub offset: u32,
    pub stride: u32,
}

/// A displayable layer with a DRM fourcc and its planes.
#[derive(Debug, Clone)]
pub struct DrmLayer {
    /// DRM fourcc of the layer.
    pub format: u32,
    pub planes: Vec<DrmPlane>,
}

/// Complete multi-plane description of one frame.
///
/// Owns its fds; dropping the descriptor closes them. Exporters return a
/// fresh descriptor per call, so the fds live exactly as long as the import
/// needs them.
#[derive(Debug)]
pub struct DrmFrameDescriptor {
    pub objects: Vec<DrmObject>,
    pub layers: Vec<DrmLayer>,
}

impl DrmFrameDescriptor {
    /// Stable identity of the frame backing this descriptor.
    pub fn key(&self) -> Option<u64> {
        self.objects.first().map(|o| o.fd.as_raw_fd() as u64)
    }
}

/// Why a surface export did not produce a descriptor.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// The driver cannot express this surface as a composed descriptor.
    /// Expected for some surface layouts; the caller falls back or skips.
    #[error("surface layout is not exportable")]
    NotExportable,
    #[error("surface export failed: {0}")]
    Failed(String),
}

/// Exports a GPU surface handle as a dmabuf descriptor.
///
/// Implemented by the hardware-decode layer (e.g. on top of a VA display).
/// Exports are read-only and composed (single layer) when possible.
pub trait SurfaceExporter: Send {
    fn export(&self, surface: u64) -> Result<DrmFrameDescriptor, ExportError>;
}

/// How a decoded frame is handed to the video output.
#[derive(Debug)]
pub enum HwHandle {
    /// Opaque driver surface id; needs a [`SurfaceExporter`].
    GpuSurface(u64),
    /// Descriptor attached to the frame; fds owned by the frame.
    DrmPrime(DrmFrameDescriptor),
}

/// A hardware-decoded video frame as seen by the video output.
#[derive(Debug)]
pub struct HwFrame {
    pub width: u32,
    pub height: u32,
    pub handle: HwHandle,
}

impl HwFrame {
    /// Stable per-frame key used for buffer-pool deduplication.
    pub fn pool_key(&self) -> Option<u64> {
        match &self.handle {
            HwHandle::GpuSurface(id) => Some(*id),
            HwHandle::DrmPrime(desc) => desc.key(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::IntoRawFd;

    fn any_fd() -> OwnedFd {
        // Any real fd works for identity tests.
        OwnedFd::from(std::fs::File::open("/dev/null").unwrap())
    }

    #[test]
    fn gpu_surface_key_is_the_handle() {
        let frame = HwFrame {
            width: 1920,
            height: 1080,
            handle: HwHandle::GpuSurface(0x17),
        };
        assert_eq!(frame.pool_key(), Some(0x17));
    }

    #[test]
    fn drm_key_is_first_object_fd() {
        let fd = any_fd();
        let raw = fd.as_raw_fd();
        let frame = HwFrame {
            width: 1280,
            height: 720,
            handle: HwHandle::DrmPrime(DrmFrameDescriptor {
                objects: vec![DrmObject { fd, modifier: 0 }],
                layers: vec![DrmLayer {
                    format: 0x3231564e, // NV12
                    planes: vec![
                        DrmPlane {
                            object_index: 0,
                            offset: 0,
                            stride: 1280,
                        },
                        DrmPlane {
                            object_index: 0,
                            offset: 1280 * 720,
                            stride: 1280,
                        },
                    ],
                }],
            }),
        };
        assert_eq!(frame.pool_key(), Some(raw as u64));
        // Dropping the frame closes the fd; re-wrapping it must not be done.
        let HwHandle::DrmPrime(desc) = frame.handle else {
            unreachable!()
        };
        let taken = desc.objects.into_iter().next().unwrap().fd;
        assert_eq!(taken.into_raw_fd(), raw);
    }
}
