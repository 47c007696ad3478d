//! Zero-copy import of hardware-decoded frames as `wl_buffer`s.
//!
//! Frames are deduplicated by a stable key derived from their hardware
//! handle: while an entry for a key is live, the pool hands back the same
//! buffer without issuing a new import. Entries become reusable only when
//! the compositor sends the buffer release; a bounded flush after a seek
//! drops free entries so stale frames cannot cause visible stutter.

use std::collections::HashMap;
use std::os::fd::AsFd;

use memmap2::Mmap;
use smithay_client_toolkit::reexports::client::protocol::wl_buffer::{self, WlBuffer};
use smithay_client_toolkit::reexports::client::{Connection, Dispatch, QueueHandle};
use smithay_client_toolkit::reexports::protocols::wp::linux_dmabuf::zv1::client::{
    zwp_linux_buffer_params_v1::{self, ZwpLinuxBufferParamsV1},
    zwp_linux_dmabuf_feedback_v1::{self, ZwpLinuxDmabufFeedbackV1},
    zwp_linux_dmabuf_v1::{self, ZwpLinuxDmabufV1},
};
use tracing::{debug, trace};

use playercore::{DrmFrameDescriptor, ExportError, HwFrame, HwHandle};

use crate::state::State;

/// How many draws after a reset signal still flush free entries. The
/// original backend used exactly two; kept as a named constant.
pub const RESET_FLUSH_DRAWS: u64 = 2;

/// Upper bound on live pool entries; free entries are evicted beyond it.
pub const POOL_MAX_ENTRIES: usize = 32;

/// The v4 feedback format table: 16-byte entries of fourcc, padding and a
/// 64-bit modifier, mapped read-only for the lifetime of the session.
pub struct FormatTable {
    map: Mmap,
}

impl FormatTable {
    pub fn entries(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        parse_format_table(&self.map)
    }

    pub fn supports(&self, format: u32, modifier: u64) -> bool {
        format_table_supports(&self.map, format, modifier)
    }
}

fn parse_format_table(bytes: &[u8]) -> impl Iterator<Item = (u32, u64)> + '_ {
    bytes.chunks_exact(16).map(|entry| {
        let format = u32::from_ne_bytes(entry[0..4].try_into().unwrap());
        let modifier = u64::from_ne_bytes(entry[8..16].try_into().unwrap());
        (format, modifier)
    })
}

fn format_table_supports(bytes: &[u8], format: u32, modifier: u64) -> bool {
    parse_format_table(bytes).any(|(f, m)| f == format && m == modifier)
}

/// Importer strategy, chosen at first use and cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImporterKind {
    /// Export a composed descriptor from the GPU surface handle.
    SurfaceExport,
    /// Read the descriptor already attached to the frame.
    RawDescriptor,
}

struct Entry<B> {
    buffer: B,
    in_use: bool,
}

/// Keyed buffer ledger; generic so the reuse/flush rules are testable
/// without a compositor.
struct Ledger<B> {
    entries: HashMap<u64, Entry<B>>,
    max_entries: usize,
}

impl<B: Clone> Ledger<B> {
    fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_entries,
        }
    }

    /// Returns the live buffer for `key`, marking it in flight again.
    fn reuse(&mut self, key: u64) -> Option<B> {
        let entry = self.entries.get_mut(&key)?;
        entry.in_use = true;
        Some(entry.buffer.clone())
    }

    /// Registers a freshly imported buffer, evicting free entries beyond
    /// the bound.
    fn insert(&mut self, key: u64, buffer: B, mut destroy: impl FnMut(B)) {
        if self.entries.len() >= self.max_entries {
            let free: Vec<u64> = self
                .entries
                .iter()
                .filter(|(_, e)| !e.in_use)
                .map(|(&k, _)| k)
                .collect();
            for key in free {
                if let Some(entry) = self.entries.remove(&key) {
                    destroy(entry.buffer);
                }
            }
        }
        self.entries.insert(
            key,
            Entry {
                buffer,
                in_use: true,
            },
        );
    }

    /// Compositor acknowledged the buffer; the entry may be reused or
    /// flushed from now on.
    fn release(&mut self, key: u64) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.in_use = false;
        }
    }

    /// Drops every entry the compositor is not holding.
    fn flush_free(&mut self, mut destroy: impl FnMut(B)) {
        let free: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.in_use)
            .map(|(&k, _)| k)
            .collect();
        for key in free {
            if let Some(entry) = self.entries.remove(&key) {
                destroy(entry.buffer);
            }
        }
    }

    fn drain(&mut self, mut destroy: impl FnMut(B)) {
        for (_, entry) in self.entries.drain() {
            destroy(entry.buffer);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// The dmabuf buffer pool and negotiated format state.
pub struct BufferPool {
    dmabuf: Option<ZwpLinuxDmabufV1>,
    version: u32,
    format_table: Option<FormatTable>,
    pending_table: Option<FormatTable>,
    /// Formats from v2/v3 format events (no modifiers).
    formats_v3: Vec<u32>,
    ledger: Ledger<WlBuffer>,
    importer: Option<ImporterKind>,
    want_reset: bool,
    reset_count: u64,
}

impl BufferPool {
    pub fn new(dmabuf: Option<(ZwpLinuxDmabufV1, u32)>) -> Self {
        let (dmabuf, version) = match dmabuf {
            Some((proxy, version)) => (Some(proxy), version),
            None => (None, 0),
        };
        Self {
            dmabuf,
            version,
            format_table: None,
            pending_table: None,
            formats_v3: Vec::new(),
            ledger: Ledger::new(POOL_MAX_ENTRIES),
            importer: None,
            want_reset: false,
            reset_count: 0,
        }
    }

    /// Requests the default feedback object (v4 only).
    pub fn request_feedback(&self, qh: &QueueHandle<State>) {
        if self.version >= 4 {
            if let Some(dmabuf) = &self.dmabuf {
                dmabuf.get_default_feedback(qh, ());
            }
        }
    }

    /// Whether the compositor accepts this exact (format, modifier) pair.
    pub fn supported_format(&self, format: u32, modifier: u64) -> bool {
        if let Some(table) = &self.format_table {
            if table.supports(format, modifier) {
                return true;
            }
        }
        self.formats_v3.contains(&format)
    }

    /// Every advertised (format, modifier) pair.
    pub fn supported_formats(&self) -> Vec<(u32, u64)> {
        let mut formats: Vec<(u32, u64)> = self
            .format_table
            .iter()
            .flat_map(|table| table.entries())
            .collect();
        // Pre-feedback formats carry no modifier information.
        formats.extend(self.formats_v3.iter().map(|&f| (f, 0)));
        formats
    }

    /// Seek/reset signal: flush free entries on the next few draws.
    pub fn request_reset(&mut self) {
        self.want_reset = true;
        self.reset_count = 0;
    }

    /// Per-draw bookkeeping for the bounded post-reset flush.
    fn note_draw(&mut self) {
        self.reset_count += 1;
        if self.want_reset && self.reset_count <= RESET_FLUSH_DRAWS {
            self.ledger.flush_free(destroy_buffer);
            if self.reset_count == RESET_FLUSH_DRAWS {
                self.want_reset = false;
            }
        }
    }

    pub fn teardown(&mut self) {
        self.ledger.drain(destroy_buffer);
        self.format_table = None;
        self.pending_table = None;
        if let Some(dmabuf) = self.dmabuf.take() {
            dmabuf.destroy();
        }
    }
}

fn destroy_buffer(buffer: WlBuffer) {
    buffer.destroy();
}

impl State {
    /// Imports a decoded frame as a `wl_buffer`, reusing the pool entry for
    /// its key when one is live. Returns `None` for frames that cannot be
    /// imported; that is expected for some surface layouts and never fatal.
    pub(crate) fn import_frame(&mut self, frame: &HwFrame) -> Option<WlBuffer> {
        self.pool.note_draw();

        let Some(key) = frame.pool_key() else {
            debug!("frame has no usable pool key");
            return None;
        };
        if let Some(buffer) = self.pool.ledger.reuse(key) {
            trace!(key, "reusing pool entry");
            return Some(buffer);
        }

        let dmabuf = self.pool.dmabuf.clone()?;

        // First use decides the importer; frames are homogeneous per file.
        let importer = *self.pool.importer.get_or_insert(match frame.handle {
            HwHandle::GpuSurface(_) if self.exporter.is_some() => ImporterKind::SurfaceExport,
            _ => ImporterKind::RawDescriptor,
        });

        let exported;
        let descriptor: &DrmFrameDescriptor = match (&frame.handle, importer) {
            (HwHandle::GpuSurface(surface), ImporterKind::SurfaceExport) => {
                let exporter = self.exporter.as_ref()?;
                match exporter.export(*surface) {
                    Ok(desc) => {
                        exported = desc;
                        &exported
                    }
                    Err(ExportError::NotExportable) => {
                        debug!("export to composed layers not supported");
                        return None;
                    }
                    Err(ExportError::Failed(reason)) => {
                        debug!(%reason, "surface export failed");
                        return None;
                    }
                }
            }
            (HwHandle::DrmPrime(desc), _) => desc,
            (HwHandle::GpuSurface(_), _) => {
                debug!("GPU surface frame without an exporter");
                return None;
            }
        };

        let layer = descriptor.layers.first()?;
        let modifier = descriptor.objects.first().map(|o| o.modifier).unwrap_or(0);
        if !self.pool.supported_format(layer.format, modifier) {
            debug!(
                format = format_args!("{:#010x}", layer.format),
                modifier = format_args!("{:#018x}", modifier),
                "format is not supported by the compositor"
            );
            return None;
        }

        let params = dmabuf.create_params(&self.qh, ());
        let mut format = layer.format;
        for layer in &descriptor.layers {
            format = layer.format;
            for (plane_index, plane) in layer.planes.iter().enumerate() {
                let object = descriptor.objects.get(plane.object_index)?;
                params.add(
                    object.fd.as_fd(),
                    plane_index as u32,
                    plane.offset,
                    plane.stride,
                    (object.modifier >> 32) as u32,
                    (object.modifier & 0xffff_ffff) as u32,
                );
            }
        }
        let buffer = params.create_immed(
            frame.width as i32,
            frame.height as i32,
            format,
            zwp_linux_buffer_params_v1::Flags::empty(),
            &self.qh,
            key,
        );
        params.destroy();
        // An exported descriptor drops here, closing its fds; the request
        // already carries duplicates.

        trace!(key, "imported new pool entry");
        self.pool
            .ledger
            .insert(key, buffer.clone(), destroy_buffer);
        Some(buffer)
    }
}

impl Dispatch<ZwpLinuxDmabufV1, ()> for State {
    fn event(
        state: &mut State,
        _dmabuf: &ZwpLinuxDmabufV1,
        event: zwp_linux_dmabuf_v1::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<State>,
    ) {
        match event {
            zwp_linux_dmabuf_v1::Event::Format { format } => {
                trace!(format = format_args!("{format:#010x}"), "compositor format");
                state.pool.formats_v3.push(format);
            }
            zwp_linux_dmabuf_v1::Event::Modifier { format, .. } => {
                // Pre-feedback modifier events; remember the format.
                if !state.pool.formats_v3.contains(&format) {
                    state.pool.formats_v3.push(format);
                }
            }
            _ => {}
        }
    }
}

impl Dispatch<ZwpLinuxDmabufFeedbackV1, ()> for State {
    fn event(
        state: &mut State,
        _feedback: &ZwpLinuxDmabufFeedbackV1,
        event: zwp_linux_dmabuf_feedback_v1::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<State>,
    ) {
        match event {
            zwp_linux_dmabuf_feedback_v1::Event::FormatTable { fd, size } => {
                let file = std::fs::File::from(fd);
                match unsafe { memmap2::MmapOptions::new().len(size as usize).map(&file) } {
                    Ok(map) => state.pool.pending_table = Some(FormatTable { map }),
                    Err(err) => debug!(error = %err, "failed to map dmabuf format table"),
                }
            }
            zwp_linux_dmabuf_feedback_v1::Event::Done => {
                // A new feedback round supersedes the previous table; the
                // old mapping is unmapped on drop.
                if let Some(table) = state.pool.pending_table.take() {
                    state.pool.format_table = Some(table);
                }
            }
            _ => {}
        }
    }
}

impl Dispatch<ZwpLinuxBufferParamsV1, ()> for State {
    fn event(
        _state: &mut State,
        _params: &ZwpLinuxBufferParamsV1,
        event: zwp_linux_buffer_params_v1::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<State>,
    ) {
        if let zwp_linux_buffer_params_v1::Event::Failed = event {
            debug!("dmabuf import failed");
        }
    }
}

impl Dispatch<WlBuffer, u64> for State {
    fn event(
        state: &mut State,
        _buffer: &WlBuffer,
        event: wl_buffer::Event,
        key: &u64,
        _conn: &Connection,
        _qh: &QueueHandle<State>,
    ) {
        if let wl_buffer::Event::Release = event {
            trace!(key = *key, "buffer released by compositor");
            state.pool.ledger.release(*key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_bytes(entries: &[(u32, u64)]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for &(format, modifier) in entries {
            bytes.extend_from_slice(&format.to_ne_bytes());
            bytes.extend_from_slice(&0u32.to_ne_bytes());
            bytes.extend_from_slice(&modifier.to_ne_bytes());
        }
        bytes
    }

    const NV12: u32 = 0x3231_564e;
    const XR24: u32 = 0x3432_5258;

    #[test]
    fn format_table_layout() {
        let bytes = table_bytes(&[(NV12, 0), (XR24, 0x0100_0000_0000_0002)]);
        assert!(format_table_supports(&bytes, NV12, 0));
        assert!(format_table_supports(&bytes, XR24, 0x0100_0000_0000_0002));
        // Same format, different modifier: not supported.
        assert!(!format_table_supports(&bytes, NV12, 1));
        assert!(!format_table_supports(&bytes, 0x1234_5678, 0));
    }

    #[test]
    fn truncated_table_ignores_partial_entry() {
        let mut bytes = table_bytes(&[(NV12, 7)]);
        bytes.extend_from_slice(&[0u8; 5]);
        assert_eq!(parse_format_table(&bytes).count(), 1);
        assert!(format_table_supports(&bytes, NV12, 7));
    }

    #[test]
    fn ledger_reuses_live_entries_without_reimport() {
        let mut ledger: Ledger<u32> = Ledger::new(8);
        assert!(ledger.reuse(1).is_none());
        ledger.insert(1, 100, |_| {});
        // Live entry: same buffer, no new import.
        assert_eq!(ledger.reuse(1), Some(100));
        ledger.release(1);
        // Released entries are still reusable under the same key.
        assert_eq!(ledger.reuse(1), Some(100));
    }

    #[test]
    fn flush_only_drops_free_entries() {
        let mut ledger: Ledger<u32> = Ledger::new(8);
        ledger.insert(1, 100, |_| {});
        ledger.insert(2, 200, |_| {});
        ledger.release(2);

        let mut destroyed = Vec::new();
        ledger.flush_free(|b| destroyed.push(b));
        assert_eq!(destroyed, vec![200]);
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.reuse(1), Some(100));
    }

    #[test]
    fn insert_beyond_bound_evicts_free_entries() {
        let mut ledger: Ledger<u32> = Ledger::new(2);
        ledger.insert(1, 100, |_| {});
        ledger.insert(2, 200, |_| {});
        ledger.release(1);

        let mut destroyed = Vec::new();
        ledger.insert(3, 300, |b| destroyed.push(b));
        assert_eq!(destroyed, vec![100]);
        assert_eq!(ledger.reuse(2), Some(200));
        assert_eq!(ledger.reuse(3), Some(300));
    }

    #[test]
    fn reset_flushes_for_exactly_two_draws() {
        let mut pool = BufferPool::new(None);
        pool.request_reset();
        assert!(pool.want_reset);
        pool.note_draw();
        assert!(pool.want_reset);
        pool.note_draw();
        assert!(!pool.want_reset);
        pool.note_draw();
        assert_eq!(pool.reset_count, 3);
    }
}
