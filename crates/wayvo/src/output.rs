//! Output (monitor) tracking and hot-plug handling.

use smithay_client_toolkit::delegate_output;
use smithay_client_toolkit::output::{OutputHandler, OutputInfo, OutputState};
use smithay_client_toolkit::reexports::client::protocol::wl_output::WlOutput;
use smithay_client_toolkit::reexports::client::{Connection, Proxy, QueueHandle};
use tracing::{debug, warn};

use playercore::{DisplayInfo, VoEvents};

use crate::state::State;

/// Wraps the toolkit's output tracking with the backend's own view: which
/// outputs currently carry the surface, and which one is "current".
///
/// Outputs are owned by the toolkit registry; the window only ever holds a
/// protocol reference to the current one.
pub struct OutputRegistry {
    pub state: OutputState,
    /// Outputs our surface currently spans.
    spanned: Vec<WlOutput>,
    pub current: Option<WlOutput>,
}

impl OutputRegistry {
    pub fn new(state: OutputState) -> Self {
        Self {
            state,
            spanned: Vec::new(),
            current: None,
        }
    }

    pub fn info(&self, output: &WlOutput) -> Option<OutputInfo> {
        self.state.info(output)
    }

    pub fn current_info(&self) -> Option<OutputInfo> {
        self.current.as_ref().and_then(|o| self.state.info(o))
    }

    pub fn mark_spanned(&mut self, output: &WlOutput) {
        if !self.spanned.contains(output) {
            self.spanned.push(output.clone());
        }
    }

    pub fn unmark_spanned(&mut self, output: &WlOutput) {
        self.spanned.retain(|o| o != output);
    }

    /// Human-readable names of the outputs the surface spans.
    pub fn displays_spanned(&self) -> Vec<String> {
        self.spanned
            .iter()
            .filter_map(|o| self.state.info(o))
            .map(display_name)
            .collect()
    }

    /// All known displays with geometry and refresh.
    pub fn enumerate(&self) -> Vec<DisplayInfo> {
        self.state
            .outputs()
            .filter_map(|o| self.state.info(&o))
            .map(|info| DisplayInfo {
                refresh_hz: current_refresh_hz(&info),
                resolution: current_resolution(&info),
                name: display_name(info),
            })
            .collect()
    }

    /// Picks the fullscreen target: explicit index, explicit name/model,
    /// else the first output, warning when the request cannot be satisfied.
    pub fn find_output(&self, id: Option<usize>, name: Option<&str>) -> Option<WlOutput> {
        let mut fallback = None;
        for (index, output) in self.state.outputs().enumerate() {
            if index == 0 {
                fallback = Some(output.clone());
            }
            let Some(info) = self.state.info(&output) else {
                continue;
            };
            match (id, name) {
                (None, None) => return Some(output),
                (Some(wanted), _) if wanted == index => return Some(output),
                (None, Some(wanted)) => {
                    if info.name.as_deref() == Some(wanted) || info.model == wanted {
                        return Some(output);
                    }
                }
                _ => {}
            }
        }
        if fallback.is_none() {
            warn!("no outputs could be found");
        } else if let Some(id) = id {
            warn!(id, "screen index not found; falling back to screen 0");
        } else if let Some(name) = name {
            warn!(name, "screen name not found; falling back to screen 0");
        }
        fallback
    }

    pub fn refresh_hz(&self) -> Option<f64> {
        self.current_info().map(|info| current_refresh_hz(&info))
    }

    pub fn resolution(&self) -> Option<(i32, i32)> {
        self.current_info().map(|info| current_resolution(&info))
    }

    pub fn scale(&self) -> i32 {
        self.current_info().map(|info| info.scale_factor).unwrap_or(1)
    }
}

fn display_name(info: OutputInfo) -> String {
    info.name.unwrap_or(info.model)
}

fn current_refresh_hz(info: &OutputInfo) -> f64 {
    info.modes
        .iter()
        .find(|mode| mode.current)
        .map(|mode| mode.refresh_rate as f64 / 1000.0)
        .unwrap_or(0.0)
}

fn current_resolution(info: &OutputInfo) -> (i32, i32) {
    info.modes
        .iter()
        .find(|mode| mode.current)
        .map(|mode| mode.dimensions)
        .unwrap_or((0, 0))
}

impl OutputHandler for State {
    fn output_state(&mut self) -> &mut OutputState {
        &mut self.outputs.state
    }

    fn new_output(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, output: WlOutput) {
        if let Some(info) = self.outputs.info(&output) {
            debug!(
                id = info.id,
                name = info.name.as_deref().unwrap_or(""),
                model = %info.model,
                scale = info.scale_factor,
                "registered output"
            );
        }
        self.events |= VoEvents::WIN_STATE;
    }

    fn update_output(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, output: WlOutput) {
        // Something about the output changed (mode, scale, geometry). If it
        // is the one we sit on, window geometry and scaling are stale now.
        if self.outputs.current.as_ref() == Some(&output) {
            self.set_surface_scaling();
            self.spawn_cursor();
            self.set_geometry();
            self.events |= VoEvents::DPI | VoEvents::RESIZE;
        }
        self.events |= VoEvents::WIN_STATE;
    }

    fn output_destroyed(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, output: WlOutput) {
        debug!(id = output.id().protocol_id(), "output removed");
        self.outputs.unmark_spanned(&output);
        if self.outputs.current.as_ref() == Some(&output) {
            self.outputs.current = None;
        }
        self.events |= VoEvents::WIN_STATE;
    }
}

delegate_output!(State);
