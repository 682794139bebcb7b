use anyhow::anyhow;
use uuid::Uuid;

/// Handle for deregistering a listener.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct ListenerId(Uuid);

/// A per-event observer registry. Listeners are invoked synchronously from
///  within `tick()` in registration order; they receive the event mutably so
///  they can consume an embedded message's read cursor.
///
/// Registration and deregistration must happen outside `tick()` - listeners
///  must not call back into the peer's mutating API (the borrow checker
///  enforces this for the owning peer itself).
pub struct EventListeners<E> {
    listeners: Vec<(ListenerId, Box<dyn FnMut(&mut E) + Send>)>,
}

impl<E> EventListeners<E> {
    pub fn new() -> EventListeners<E> {
        EventListeners {
            listeners: Vec::new(),
        }
    }

    pub fn add_listener(&mut self, listener: Box<dyn FnMut(&mut E) + Send>) -> ListenerId {
        let id = ListenerId(Uuid::new_v4());
        self.listeners.push((id, listener));
        id
    }

    pub fn try_remove_listener(&mut self, listener_id: ListenerId) -> anyhow::Result<()> {
        match self.listeners.iter().position(|(id, _)| *id == listener_id) {
            None => Err(anyhow!(
                "tried to remove a listener that was not (no longer?) registered"
            )),
            Some(index) => {
                self.listeners.remove(index);
                Ok(())
            }
        }
    }

    pub fn emit(&mut self, event: &mut E) {
        for (_, listener) in self.listeners.iter_mut() {
            listener(event);
        }
    }
}

impl<E> Default for EventListeners<E> {
    fn default() -> Self {
        Self::new()
    }
}
