//! Protocol discovery and capability negotiation.
//!
//! Everything optional is recorded in [`Caps`]; downstream code checks the
//! capability instead of assuming the protocol object exists. Missing
//! optional protocols degrade features and are logged once, never retried.

use anyhow::{Context as _, Result};
use smithay_client_toolkit::compositor::CompositorState;
use smithay_client_toolkit::reexports::client::globals::GlobalList;
use smithay_client_toolkit::reexports::client::protocol::wl_data_device_manager::WlDataDeviceManager;
use smithay_client_toolkit::reexports::client::{Connection, Dispatch, QueueHandle};
use smithay_client_toolkit::reexports::protocols::wp::idle_inhibit::zv1::client::{
    zwp_idle_inhibit_manager_v1::ZwpIdleInhibitManagerV1, zwp_idle_inhibitor_v1::ZwpIdleInhibitorV1,
};
use smithay_client_toolkit::reexports::protocols::wp::linux_dmabuf::zv1::client::zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1;
use smithay_client_toolkit::reexports::protocols::wp::presentation_time::client::wp_presentation::WpPresentation;
use smithay_client_toolkit::reexports::protocols::wp::viewporter::client::{
    wp_viewport::WpViewport, wp_viewporter::WpViewporter,
};
use smithay_client_toolkit::registry::RegistryState;
use smithay_client_toolkit::shell::xdg::XdgShell;
use smithay_client_toolkit::shm::Shm;
use smithay_client_toolkit::subcompositor::SubcompositorState;
use tracing::debug;

use crate::state::State;

/// Which optional protocol extensions the compositor advertised.
#[derive(Debug, Clone, Copy, Default)]
pub struct Caps {
    pub viewporter: bool,
    pub presentation: bool,
    pub idle_inhibit: bool,
    pub data_device: bool,
    pub decoration: bool,
    /// Bound linux-dmabuf version; v4 adds the feedback format table.
    pub dmabuf_version: Option<u32>,
}

/// Bound globals shared by every component.
pub struct Protocols {
    pub registry: RegistryState,
    pub compositor: CompositorState,
    pub subcompositor: SubcompositorState,
    pub xdg_shell: XdgShell,
    pub shm: Shm,
    pub viewporter: Option<WpViewporter>,
    pub presentation: Option<WpPresentation>,
    pub idle_inhibit: Option<ZwpIdleInhibitManagerV1>,
    pub data_device_manager: Option<WlDataDeviceManager>,
}

impl Protocols {
    /// Binds required globals (failing hard) and probes the optional ones.
    pub fn bind(
        globals: &GlobalList,
        qh: &QueueHandle<State>,
    ) -> Result<(Self, Caps, Option<(ZwpLinuxDmabufV1, u32)>)> {
        let registry = RegistryState::new(globals);
        let compositor =
            CompositorState::bind(globals, qh).context("wl_compositor is not available")?;
        let subcompositor =
            SubcompositorState::bind(compositor.wl_compositor().clone(), globals, qh)
                .context("wl_subcompositor is not available")?;
        let xdg_shell = XdgShell::bind(globals, qh).context("xdg_wm_base is not available")?;
        let shm = Shm::bind(globals, qh).context("wl_shm is not available")?;

        let viewporter = bind_optional::<WpViewporter>(globals, qh, 1..=1, "wp_viewporter");
        let presentation = bind_optional::<WpPresentation>(globals, qh, 1..=1, "wp_presentation");
        let idle_inhibit = bind_optional::<ZwpIdleInhibitManagerV1>(
            globals,
            qh,
            1..=1,
            "zwp_idle_inhibit_manager_v1",
        );
        let data_device_manager =
            bind_optional::<WlDataDeviceManager>(globals, qh, 3..=3, "wl_data_device_manager");

        // Prefer v4 for the feedback-driven format table; v2/v3 still send
        // plain format events. Cap at 4 regardless of what is advertised.
        let dmabuf = match globals.bind::<ZwpLinuxDmabufV1, State, _>(qh, 4..=4, ()) {
            Ok(proxy) => Some((proxy, 4)),
            Err(_) => globals
                .bind::<ZwpLinuxDmabufV1, State, _>(qh, 2..=3, ())
                .ok()
                .map(|proxy| (proxy, 3)),
        };
        if dmabuf.is_none() {
            debug!("compositor doesn't support zwp_linux_dmabuf_v1 (ver. 2)");
        }

        let decoration = globals.contents().with_list(|list| {
            list.iter()
                .any(|global| global.interface == "zxdg_decoration_manager_v1")
        });
        if !decoration {
            debug!("compositor doesn't support zxdg_decoration_manager_v1");
        }

        let caps = Caps {
            viewporter: viewporter.is_some(),
            presentation: presentation.is_some(),
            idle_inhibit: idle_inhibit.is_some(),
            data_device: data_device_manager.is_some(),
            decoration,
            dmabuf_version: dmabuf.as_ref().map(|(_, version)| *version),
        };

        Ok((
            Self {
                registry,
                compositor,
                subcompositor,
                xdg_shell,
                shm,
                viewporter,
                presentation,
                idle_inhibit,
                data_device_manager,
            },
            caps,
            dmabuf,
        ))
    }
}

fn bind_optional<I>(
    globals: &GlobalList,
    qh: &QueueHandle<State>,
    versions: std::ops::RangeInclusive<u32>,
    name: &str,
) -> Option<I>
where
    I: smithay_client_toolkit::reexports::client::Proxy + 'static,
    State: Dispatch<I, ()>,
{
    match globals.bind::<I, State, _>(qh, versions, ()) {
        Ok(proxy) => {
            debug!(protocol = name, "registered optional protocol");
            Some(proxy)
        }
        Err(_) => {
            debug!(protocol = name, "compositor doesn't support this protocol");
            None
        }
    }
}

impl Dispatch<WpViewporter, ()> for State {
    fn event(
        _state: &mut State,
        _proxy: &WpViewporter,
        _event: <WpViewporter as smithay_client_toolkit::reexports::client::Proxy>::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<State>,
    ) {
        // No events.
    }
}

impl Dispatch<WpViewport, ()> for State {
    fn event(
        _state: &mut State,
        _proxy: &WpViewport,
        _event: <WpViewport as smithay_client_toolkit::reexports::client::Proxy>::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<State>,
    ) {
        // No events.
    }
}

impl Dispatch<ZwpIdleInhibitManagerV1, ()> for State {
    fn event(
        _state: &mut State,
        _proxy: &ZwpIdleInhibitManagerV1,
        _event: <ZwpIdleInhibitManagerV1 as smithay_client_toolkit::reexports::client::Proxy>::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<State>,
    ) {
        // No events.
    }
}

impl Dispatch<ZwpIdleInhibitorV1, ()> for State {
    fn event(
        _state: &mut State,
        _proxy: &ZwpIdleInhibitorV1,
        _event: <ZwpIdleInhibitorV1 as smithay_client_toolkit::reexports::client::Proxy>::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<State>,
    ) {
        // No events.
    }
}
