//! Window options and their change-notification plumbing.
//!
//! Option storage and validation live in the player core; a backend only
//! needs a consistent snapshot plus a way to learn which fields changed
//! since it last looked. [`OptionStore`] is the shared store,
//! [`OptionCache`] a per-consumer view that diffs snapshots on demand.
//! Backends also write a few fields back (the compositor is authoritative
//! for fullscreen/maximized/border state); write-backs go through
//! [`OptionCache::write`] so the writer is not re-notified of its own
//! change.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Player-wide window options observed by video-output backends.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowOptions {
    pub fullscreen: bool,
    pub maximized: bool,
    pub minimized: bool,
    /// Server-side decorations requested.
    pub border: bool,
    pub title: String,
    pub app_id: String,
    /// Scale the window by the output scale factor.
    pub hidpi_window_scale: bool,
    /// Preserve the video aspect ratio during interactive resizes.
    pub keep_aspect_window: bool,
    /// Explicit window size request, logical pixels.
    pub geometry: Option<(u32, u32)>,
    /// Fullscreen target screen by index.
    pub fs_screen_id: Option<usize>,
    /// Fullscreen target screen by connector name or model.
    pub fs_screen_name: Option<String>,
    /// Honor compositor-provided key repeat rate/delay.
    pub native_keyrepeat: bool,
}

impl Default for WindowOptions {
    fn default() -> Self {
        Self {
            fullscreen: false,
            maximized: false,
            minimized: false,
            border: true,
            title: String::new(),
            app_id: "fathom".to_string(),
            hidpi_window_scale: true,
            keep_aspect_window: true,
            geometry: None,
            fs_screen_id: None,
            fs_screen_name: None,
            native_keyrepeat: false,
        }
    }
}

/// Identifies a changed [`WindowOptions`] field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WinOpt {
    Fullscreen,
    Maximized,
    Minimized,
    Border,
    Title,
    AppId,
    HidpiWindowScale,
    KeepAspectWindow,
    Geometry,
    FsScreen,
    NativeKeyrepeat,
}

fn changed_fields(old: &WindowOptions, new: &WindowOptions) -> Vec<WinOpt> {
    let mut changed = Vec::new();
    if old.fullscreen != new.fullscreen {
        changed.push(WinOpt::Fullscreen);
    }
    if old.maximized != new.maximized {
        changed.push(WinOpt::Maximized);
    }
    if old.minimized != new.minimized {
        changed.push(WinOpt::Minimized);
    }
    if old.border != new.border {
        changed.push(WinOpt::Border);
    }
    if old.title != new.title {
        changed.push(WinOpt::Title);
    }
    if old.app_id != new.app_id {
        changed.push(WinOpt::AppId);
    }
    if old.hidpi_window_scale != new.hidpi_window_scale {
        changed.push(WinOpt::HidpiWindowScale);
    }
    if old.keep_aspect_window != new.keep_aspect_window {
        changed.push(WinOpt::KeepAspectWindow);
    }
    if old.geometry != new.geometry {
        changed.push(WinOpt::Geometry);
    }
    if old.fs_screen_id != new.fs_screen_id || old.fs_screen_name != new.fs_screen_name {
        changed.push(WinOpt::FsScreen);
    }
    if old.native_keyrepeat != new.native_keyrepeat {
        changed.push(WinOpt::NativeKeyrepeat);
    }
    changed
}

/// Shared window-option store.
#[derive(Debug, Clone, Default)]
pub struct OptionStore(Arc<Mutex<WindowOptions>>);

impl OptionStore {
    pub fn new(opts: WindowOptions) -> Self {
        Self(Arc::new(Mutex::new(opts)))
    }

    /// Applies a mutation; consumers observe it on their next drain.
    pub fn update(&self, f: impl FnOnce(&mut WindowOptions)) {
        f(&mut self.0.lock().unwrap());
    }

    pub fn snapshot(&self) -> WindowOptions {
        self.0.lock().unwrap().clone()
    }

    /// Creates a consumer view seeded with the current state.
    pub fn cache(&self) -> OptionCache {
        OptionCache {
            seen: self.snapshot(),
            store: self.clone(),
        }
    }
}

/// Per-consumer option view with change detection.
#[derive(Debug)]
pub struct OptionCache {
    store: OptionStore,
    seen: WindowOptions,
}

impl OptionCache {
    /// Returns the fields that changed since the last drain and advances the
    /// snapshot.
    pub fn drain_changed(&mut self) -> Vec<WinOpt> {
        let current = self.store.snapshot();
        let changed = changed_fields(&self.seen, &current);
        self.seen = current;
        changed
    }

    /// The consumer's current snapshot (valid as of the last drain).
    pub fn opts(&self) -> &WindowOptions {
        &self.seen
    }

    /// Writes back into the store without notifying this consumer.
    pub fn write(&mut self, f: impl Fn(&mut WindowOptions)) {
        self.store.update(&f);
        f(&mut self.seen);
    }
}

fn default_edge_pixels_pointer() -> u32 {
    10
}

fn default_edge_pixels_touch() -> u32 {
    32
}

fn default_configure_bounds() -> bool {
    true
}

/// Backend-specific options, loadable from the player's TOML config.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VoOptions {
    /// Clamp the initial window size to compositor-advertised bounds.
    #[serde(default = "default_configure_bounds")]
    pub configure_bounds: bool,
    /// Skip frame-callback pacing entirely.
    #[serde(default)]
    pub disable_vsync: bool,
    /// Edge-resize margin for pointer input, pixels.
    #[serde(default = "default_edge_pixels_pointer")]
    pub edge_pixels_pointer: u32,
    /// Edge-resize margin for touch input, pixels.
    #[serde(default = "default_edge_pixels_touch")]
    pub edge_pixels_touch: u32,
}

impl Default for VoOptions {
    fn default() -> Self {
        Self {
            configure_bounds: true,
            disable_vsync: false,
            edge_pixels_pointer: default_edge_pixels_pointer(),
            edge_pixels_touch: default_edge_pixels_touch(),
        }
    }
}

impl VoOptions {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(input)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_reports_only_changed_fields() {
        let store = OptionStore::default();
        let mut cache = store.cache();
        assert!(cache.drain_changed().is_empty());

        store.update(|o| {
            o.fullscreen = true;
            o.title = "file.mkv".to_string();
        });
        let changed = cache.drain_changed();
        assert_eq!(changed, vec![WinOpt::Fullscreen, WinOpt::Title]);
        assert!(cache.opts().fullscreen);

        // Nothing new on the second drain.
        assert!(cache.drain_changed().is_empty());
    }

    #[test]
    fn write_back_does_not_self_notify() {
        let store = OptionStore::default();
        let mut cache = store.cache();
        cache.write(|o| o.maximized = true);
        assert!(cache.drain_changed().is_empty());
        // Other consumers still see it.
        let mut other = store.cache();
        other.seen.maximized = false;
        assert_eq!(other.drain_changed(), vec![WinOpt::Maximized]);
    }

    #[test]
    fn vo_options_defaults() {
        let opts = VoOptions::from_toml_str("").unwrap();
        assert!(opts.configure_bounds);
        assert!(!opts.disable_vsync);
        assert_eq!(opts.edge_pixels_pointer, 10);
        assert_eq!(opts.edge_pixels_touch, 32);
    }

    #[test]
    fn vo_options_overrides() {
        let opts = VoOptions::from_toml_str(
            r#"
disable_vsync = true
edge_pixels_touch = 48
"#,
        )
        .unwrap();
        assert!(opts.disable_vsync);
        assert_eq!(opts.edge_pixels_touch, 48);
        assert_eq!(opts.edge_pixels_pointer, 10);
    }
}
