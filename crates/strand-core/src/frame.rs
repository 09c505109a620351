//! Captured frames and the state chain
//!
//! While a task is unwound, each suspended call frame is represented by a
//! [`Frame`]: the resume point inside its procedure plus the locals needed
//! to continue from there. The frames of one suspended call chain live in a
//! [`StateChain`], indexed by call depth with the root procedure at depth 0.

use std::any::{type_name, Any};
use std::fmt;

/// Resume point inside a transformed procedure. 0 is the fresh entry.
pub type Pc = u32;

/// Resume point recorded by pause leaves.
pub const PAUSE_POINT_PC: Pc = 1;

enum Payload {
    /// Marker left by a pause leaf
    PausePoint,
    /// Locals saved by a procedure frame
    Locals(Box<dyn Any + Send>),
}

/// One suspended call frame.
pub struct Frame {
    pc: Pc,
    payload: Payload,
    locals_type: &'static str,
}

impl Frame {
    /// Capture a procedure frame that resumes at `pc` with `locals`
    pub fn new<L: Any + Send>(pc: Pc, locals: L) -> Self {
        Self {
            pc,
            payload: Payload::Locals(Box::new(locals)),
            locals_type: type_name::<L>(),
        }
    }

    /// The marker a pause leaf leaves in its own slot
    pub(crate) fn pause_point() -> Self {
        Self {
            pc: PAUSE_POINT_PC,
            payload: Payload::PausePoint,
            locals_type: "<pause point>",
        }
    }

    /// Resume point of this frame
    pub fn pc(&self) -> Pc {
        self.pc
    }

    /// Whether this frame was left by a pause leaf
    pub fn is_pause_point(&self) -> bool {
        matches!(self.payload, Payload::PausePoint)
    }

    /// Borrow the saved locals, if they are of type `L`
    pub fn locals<L: Any>(&self) -> Option<&L> {
        match &self.payload {
            Payload::Locals(locals) => locals.downcast_ref::<L>(),
            Payload::PausePoint => None,
        }
    }

    /// Type name of the saved locals (for diagnostics)
    pub fn locals_type(&self) -> &'static str {
        self.locals_type
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("pc", &self.pc)
            .field("locals", &self.locals_type)
            .finish()
    }
}

/// Captured frames of one suspended call chain, root first.
///
/// Each slot is exclusively owned by the chain. Frames are written while a
/// suspension propagates outward and removed as the replay walks past them.
#[derive(Debug, Default)]
pub struct StateChain {
    slots: Vec<Option<Frame>>,
    captured: usize,
}

impl StateChain {
    /// Create an empty chain with room for `capacity` levels
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            captured: 0,
        }
    }

    /// Frame captured at `depth`, if any
    pub fn get(&self, depth: usize) -> Option<&Frame> {
        self.slots.get(depth).and_then(Option::as_ref)
    }

    /// Store `frame` at `depth`, returning whatever was there
    pub(crate) fn put(&mut self, depth: usize, frame: Frame) -> Option<Frame> {
        if depth >= self.slots.len() {
            self.slots.resize_with(depth + 1, || None);
        }
        let old = self.slots[depth].replace(frame);
        if old.is_none() {
            self.captured += 1;
        }
        old
    }

    /// Remove and return the frame at `depth`
    pub(crate) fn take(&mut self, depth: usize) -> Option<Frame> {
        let frame = self.slots.get_mut(depth).and_then(Option::take);
        if frame.is_some() {
            self.captured -= 1;
        }
        frame
    }

    /// Drop every captured frame
    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.captured = 0;
    }

    /// Number of captured frames
    pub fn len(&self) -> usize {
        self.captured
    }

    /// Whether no frame is captured
    pub fn is_empty(&self) -> bool {
        self.captured == 0
    }

    /// Captured frames with their depth, root first
    pub fn frames(&self) -> impl Iterator<Item = (usize, &Frame)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(depth, slot)| slot.as_ref().map(|frame| (depth, frame)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_locals_downcast() {
        let frame = Frame::new(3, (7u64, String::from("acc")));
        assert_eq!(frame.pc(), 3);
        assert!(!frame.is_pause_point());
        assert_eq!(
            frame.locals::<(u64, String)>(),
            Some(&(7u64, String::from("acc")))
        );
        assert!(frame.locals::<u64>().is_none());
        assert!(frame.locals_type().contains("String"));
    }

    #[test]
    fn test_pause_point_has_no_locals() {
        let frame = Frame::pause_point();
        assert!(frame.is_pause_point());
        assert_eq!(frame.pc(), PAUSE_POINT_PC);
        assert!(frame.locals::<()>().is_none());
    }

    #[test]
    fn test_chain_put_take() {
        let mut chain = StateChain::with_capacity(2);
        assert!(chain.is_empty());

        assert!(chain.put(0, Frame::new(1, 10i32)).is_none());
        assert!(chain.put(4, Frame::pause_point()).is_none());
        assert_eq!(chain.len(), 2);
        assert!(chain.get(2).is_none());
        assert_eq!(chain.get(0).map(Frame::pc), Some(1));

        let depths: Vec<usize> = chain.frames().map(|(d, _)| d).collect();
        assert_eq!(depths, vec![0, 4]);

        assert!(chain.take(0).is_some());
        assert!(chain.take(0).is_none());
        assert_eq!(chain.len(), 1);

        chain.clear();
        assert!(chain.is_empty());
        assert!(chain.get(4).is_none());
    }

    #[test]
    fn test_chain_replace_keeps_count() {
        let mut chain = StateChain::default();
        chain.put(1, Frame::new(1, 'a'));
        let old = chain.put(1, Frame::new(2, 'b'));
        assert_eq!(old.map(|f| f.pc()), Some(1));
        assert_eq!(chain.len(), 1);
    }
}
