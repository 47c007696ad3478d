//! Drag-and-drop: one offer at a time, mime scoring, pipe-driven payload
//! transfer.
//!
//! The payload fd is owned here exclusively from `receive` until EOF or
//! cancellation; the write end is closed as soon as the request is issued
//! since the compositor duplicates what it needs.

use std::os::fd::{AsFd, AsRawFd, OwnedFd};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::{pipe2, read};
use smithay_client_toolkit::reexports::client::event_created_child;
use smithay_client_toolkit::reexports::client::protocol::wl_data_device::{self, WlDataDevice};
use smithay_client_toolkit::reexports::client::protocol::wl_data_device_manager::{
    self, DndAction, WlDataDeviceManager,
};
use smithay_client_toolkit::reexports::client::protocol::wl_data_offer::{self, WlDataOffer};
use smithay_client_toolkit::reexports::client::{Connection, Dispatch, QueueHandle, WEnum};
use tracing::{debug, error, trace};

use playercore::{DropAction, InputEvent};

use crate::state::State;

struct DndPipe {
    fd: OwnedFd,
    buf: Vec<u8>,
}

/// Drag-and-drop session state. At most one offer is live; a new offer
/// destroys and replaces the previous one.
#[derive(Default)]
pub struct Dnd {
    pub device: Option<WlDataDevice>,
    offer: Option<WlDataOffer>,
    mime_type: Option<String>,
    mime_score: i32,
    action: Option<DropAction>,
    pipe: Option<DndPipe>,
}

impl Dnd {
    /// Forgets everything about the previous offer; a new offer always
    /// wins, regardless of how its types score.
    fn reset_offer_state(&mut self) {
        self.mime_type = None;
        self.mime_score = 0;
        self.action = None;
    }

    /// Tracks the best-scoring mime type of the current offer.
    fn consider_mime(&mut self, mime_type: String, score: i32) -> bool {
        if score > self.mime_score {
            self.mime_score = score;
            self.mime_type = Some(mime_type);
            return true;
        }
        false
    }
}

impl State {
    /// Drains the payload pipe without blocking; on EOF the payload and the
    /// negotiated action are delivered to the input layer.
    pub(crate) fn check_dnd_pipe(&mut self) {
        let Some(pipe) = &mut self.dnd.pipe else {
            return;
        };

        let revents = {
            let mut fds = [PollFd::new(pipe.fd.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::ZERO) {
                Ok(n) if n > 0 => fds[0].revents().unwrap_or(PollFlags::empty()),
                _ => return,
            }
        };

        if revents.contains(PollFlags::POLLIN) {
            let mut chunk = [0u8; 4096];
            loop {
                match read(pipe.fd.as_raw_fd(), &mut chunk) {
                    Ok(0) => {
                        self.finish_dnd();
                        return;
                    }
                    Ok(n) => pipe.buf.extend_from_slice(&chunk[..n]),
                    Err(nix::errno::Errno::EAGAIN) => return,
                    Err(err) => {
                        debug!(error = %err, "DND pipe read failed");
                        self.abort_dnd();
                        return;
                    }
                }
            }
        }

        if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP) {
            self.finish_dnd();
        }
    }

    fn finish_dnd(&mut self) {
        let Some(pipe) = self.dnd.pipe.take() else {
            return;
        };
        let mime_type = self.dnd.mime_type.take().unwrap_or_default();
        debug!(bytes = pipe.buf.len(), mime = %mime_type, "read DND payload");

        let action_negotiated = self.dnd.action.is_some();
        let action = self.dnd.action.take().unwrap_or(DropAction::Replace);
        self.input_tx.put(InputEvent::Drop {
            mime_type,
            data: pipe.buf,
            action,
        });

        if let Some(offer) = self.dnd.offer.take() {
            if action_negotiated {
                offer.finish();
            }
            offer.destroy();
        }
        self.dnd.mime_score = 0;
    }

    fn abort_dnd(&mut self) {
        self.dnd.pipe = None;
        if let Some(offer) = self.dnd.offer.take() {
            offer.destroy();
        }
        self.dnd.mime_type = None;
        self.dnd.mime_score = 0;
        self.dnd.action = None;
    }
}

impl Dispatch<WlDataDeviceManager, ()> for State {
    fn event(
        _state: &mut State,
        _manager: &WlDataDeviceManager,
        _event: wl_data_device_manager::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<State>,
    ) {
        // No events.
    }
}

impl Dispatch<WlDataDevice, ()> for State {
    fn event(
        state: &mut State,
        _device: &WlDataDevice,
        event: wl_data_device::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<State>,
    ) {
        match event {
            wl_data_device::Event::DataOffer { id } => {
                // New offer always replaces the previous one.
                if let Some(old) = state.dnd.offer.take() {
                    old.destroy();
                    trace!("released previous DND offer");
                }
                state.dnd.reset_offer_state();
                state.dnd.offer = Some(id);
            }
            wl_data_device::Event::Enter { serial, id, .. } => {
                if state.dnd.offer != id {
                    error!("DND offer id mismatch");
                    return;
                }
                let Some(offer) = &state.dnd.offer else {
                    return;
                };
                offer.set_actions(DndAction::Copy | DndAction::Move, DndAction::Copy);
                offer.accept(serial, state.dnd.mime_type.clone());
                debug!(mime = ?state.dnd.mime_type, "accepting DND offer");
            }
            wl_data_device::Event::Leave => {
                if state.dnd.pipe.is_some() {
                    // Transfer already running; keep the offer until EOF.
                    return;
                }
                if let Some(offer) = state.dnd.offer.take() {
                    offer.destroy();
                }
                debug!(mime = ?state.dnd.mime_type, "releasing DND offer");
                state.dnd.reset_offer_state();
            }
            wl_data_device::Event::Motion { time, .. } => {
                if let Some(offer) = &state.dnd.offer {
                    offer.accept(time, state.dnd.mime_type.clone());
                }
            }
            wl_data_device::Event::Drop => {
                let Some(offer) = &state.dnd.offer else {
                    return;
                };
                let Some(mime_type) = state.dnd.mime_type.clone() else {
                    debug!("drop without a usable mime type");
                    return;
                };
                let (read_end, write_end) = match pipe2(OFlag::O_CLOEXEC) {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!(error = %err, "failed to create DND pipe");
                        return;
                    }
                };
                if let Err(err) =
                    fcntl(read_end.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
                {
                    error!(error = %err, "failed to make DND pipe non-blocking");
                    return;
                }
                debug!(mime = %mime_type, "receiving DND offer");
                offer.receive(mime_type, write_end.as_fd());
                // write_end drops here; the compositor holds its own copy.
                state.dnd.pipe = Some(DndPipe {
                    fd: read_end,
                    buf: Vec::new(),
                });
            }
            wl_data_device::Event::Selection { id } => {
                // Selection transfers are not used; drop the offer.
                if let Some(offer) = id {
                    offer.destroy();
                }
            }
            _ => {}
        }
    }

    event_created_child!(State, WlDataDevice, [
        wl_data_device::EVT_DATA_OFFER_OPCODE => (WlDataOffer, ()),
    ]);
}

impl Dispatch<WlDataOffer, ()> for State {
    fn event(
        state: &mut State,
        offer: &WlDataOffer,
        event: wl_data_offer::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<State>,
    ) {
        if state.dnd.offer.as_ref() != Some(offer) {
            return;
        }
        match event {
            wl_data_offer::Event::Offer { mime_type } => {
                let score = state.scorer.score(&mime_type);
                if state.dnd.consider_mime(mime_type, score) {
                    debug!(mime = ?state.dnd.mime_type, score, "preferring DND mime type");
                }
            }
            wl_data_offer::Event::Action { dnd_action } => {
                let action = match dnd_action {
                    WEnum::Value(action) if action.contains(DndAction::Copy) => DropAction::Replace,
                    _ => DropAction::Append,
                };
                debug!(?action, "DND action negotiated");
                state.dnd.action = Some(action);
            }
            wl_data_offer::Event::SourceActions { .. } => {}
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highest_scoring_mime_type_wins() {
        let mut dnd = Dnd::default();
        assert!(dnd.consider_mime("text/plain".into(), 10));
        assert!(dnd.consider_mime("text/uri-list".into(), 30));
        assert!(!dnd.consider_mime("text/html".into(), 20));
        assert_eq!(dnd.mime_type.as_deref(), Some("text/uri-list"));
    }

    #[test]
    fn new_offer_replaces_the_old_one_regardless_of_score() {
        let mut dnd = Dnd::default();
        dnd.consider_mime("text/uri-list".into(), 30);

        // A fresh offer arrives: prior scoring is gone and even a weaker
        // candidate is accepted.
        dnd.reset_offer_state();
        assert_eq!(dnd.mime_type, None);
        assert!(dnd.consider_mime("text/plain".into(), 5));
        assert_eq!(dnd.mime_type.as_deref(), Some("text/plain"));
    }

    #[test]
    fn non_positive_scores_are_never_accepted() {
        let mut dnd = Dnd::default();
        assert!(!dnd.consider_mime("application/octet-stream".into(), 0));
        assert_eq!(dnd.mime_type, None);
    }
}
