//! The shared dispatch state: one struct per component, all driven by the
//! single event loop thread.

use smithay_client_toolkit::reexports::client::{Connection, QueueHandle};
use smithay_client_toolkit::registry::{ProvidesRegistryState, RegistryState};
use smithay_client_toolkit::registry_handlers;
use smithay_client_toolkit::output::OutputState;
use smithay_client_toolkit::seat::SeatState;
use smithay_client_toolkit::shm::slot::{Buffer, SlotPool};
use smithay_client_toolkit::shm::{Shm, ShmHandler};
use smithay_client_toolkit::{delegate_registry, delegate_shm, delegate_subcompositor};

use playercore::{
    InputSender, MimeScorer, OptionCache, SurfaceExporter, VideoParams, VoEvents, VoOptions,
};

use crate::cursor::CursorState;
use crate::dmabuf::BufferPool;
use crate::dnd::Dnd;
use crate::globals::{Caps, Protocols};
use crate::input::InputState;
use crate::output::OutputRegistry;
use crate::present::{FrameClock, PresentClock};
use crate::window::Window;

/// Everything the protocol listeners mutate. Ownership is partitioned per
/// component; no component reaches into another's fields except through the
/// methods on `State`.
pub struct State {
    pub conn: Connection,
    pub qh: QueueHandle<State>,

    pub caps: Caps,
    pub protocols: Protocols,
    pub outputs: OutputRegistry,
    pub window: Window,
    pub input: InputState,
    pub dnd: Dnd,
    pub cursor: CursorState,
    pub clock: PresentClock,
    pub pacer: FrameClock,
    pub pool: BufferPool,

    /// Pending events for the player's control loop.
    pub events: VoEvents,
    pub input_tx: InputSender,
    pub scorer: Box<dyn MimeScorer>,
    pub exporter: Option<Box<dyn SurfaceExporter>>,
    pub opt_cache: OptionCache,
    pub vo_opts: VoOptions,

    /// Source video dimensions, set by reconfigure.
    pub video: Option<VideoParams>,
    /// Keeps the 1x1 solid backing of the toplevel surface alive.
    pub solid: Option<(SlotPool, Buffer)>,
    /// The connection died; reported once, then everything is inert.
    pub display_dead: bool,
}

impl State {
    pub(crate) fn take_events(&mut self) -> VoEvents {
        std::mem::take(&mut self.events)
    }
}

impl ProvidesRegistryState for State {
    fn registry(&mut self) -> &mut RegistryState {
        &mut self.protocols.registry
    }

    registry_handlers![OutputState, SeatState];
}

impl ShmHandler for State {
    fn shm_state(&mut self) -> &mut Shm {
        &mut self.protocols.shm
    }
}

delegate_registry!(State);
delegate_shm!(State);
delegate_subcompositor!(State);
