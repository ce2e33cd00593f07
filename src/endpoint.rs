//! State shared by senders and receivers.

/// Name, enable flag, size and backend-resource flag of an endpoint.
///
/// `initialized` is only ever true while `enabled` is true; endpoints tear
/// the backend resource down on the first render pass after a disable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointState {
    pub(crate) name: String,
    pub(crate) enabled: bool,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) initialized: bool,
}

impl EndpointState {
    pub(crate) fn new(name: &str, width: u32, height: u32, enabled: bool) -> Self {
        Self {
            name: name.to_string(),
            enabled,
            width,
            height,
            initialized: false,
        }
    }

    /// Both dimensions are non-zero.
    pub(crate) fn has_size(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

/// Read access common to [`Sender`](crate::Sender) and [`Receiver`](crate::Receiver).
pub trait Endpoint {
    fn state(&self) -> &EndpointState;

    fn name(&self) -> &str {
        &self.state().name
    }

    fn is_enabled(&self) -> bool {
        self.state().enabled
    }

    fn width(&self) -> u32 {
        self.state().width
    }

    fn height(&self) -> u32 {
        self.state().height
    }

    /// True while a backend resource exists for this endpoint.
    fn is_initialized(&self) -> bool {
        self.state().initialized
    }
}

/// Handle returned when registering a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Ordered registry of boxed listeners.
pub(crate) struct ListenerList<L: ?Sized> {
    next_id: u64,
    entries: Vec<(ListenerId, Box<L>)>,
}

impl<L: ?Sized> Default for ListenerList<L> {
    fn default() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }
}

impl<L: ?Sized> ListenerList<L> {
    pub(crate) fn add(&mut self, listener: Box<L>) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.entries.push((id, listener));
        id
    }

    pub(crate) fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        self.entries.len() != before
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut L> {
        self.entries.iter_mut().map(|(_, listener)| listener.as_mut())
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
