//! Continuation manager
//!
//! A [`Fiber`] stands in for the native call stack of a task while the task
//! is suspended. Every call from one transformed procedure into another
//! suspendable procedure is bracketed by [`Fiber::down`] and [`Fiber::up`]:
//!
//! ```text
//! fiber.down();
//! let step = callee(cx, args)?;
//! match fiber.up()? {
//!     Up::Normal | Up::Retired => { /* use step */ }
//!     Up::Capture => { /* save locals at this call site, then return Step::Unwind */ }
//!     Up::Propagate => { /* return Step::Unwind */ }
//! }
//! ```
//!
//! On suspension the chain of captured frames is built from the innermost
//! frame outward, exactly once. On the next drive the procedure is entered
//! again from the root; each level finds its frame in the chain, restores its
//! locals, jumps to the saved call site and calls down again, until the pause
//! leaf is reached and forward execution continues.
//!
//! The fiber tracks call depth with an explicit counter; it never looks at
//! the native stack.

use crate::defaults::DEFAULT_CHAIN_CAPACITY;
use crate::error::ProtocolError;
use crate::frame::{Frame, Pc, StateChain};

/// Outcome of [`Fiber::up`]; the caller must branch on it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Up {
    /// Not suspending and nothing was saved for this call site: an ordinary return
    Normal,

    /// Not suspending; this call site was being replayed and its saved frame
    /// has now been retired
    Retired,

    /// Suspending and this call site has no saved frame: capture locals with
    /// `set_state` and unwind
    Capture,

    /// Suspending and this call site already has a saved frame: unwind
    /// without capturing again
    Propagate,
}

impl Up {
    /// Whether the caller must unwind
    pub fn is_pausing(self) -> bool {
        matches!(self, Up::Capture | Up::Propagate)
    }
}

/// Value produced by a transformed procedure.
///
/// While a suspension propagates outward, procedures return [`Step::Unwind`]
/// instead of a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<T> {
    /// The procedure returned normally
    Ready(T),
    /// The procedure is unwinding
    Unwind,
}

impl<T> Step<T> {
    /// Whether this step is an unwind
    pub fn is_unwind(&self) -> bool {
        matches!(self, Step::Unwind)
    }

    /// The returned value, if any
    pub fn ready(self) -> Option<T> {
        match self {
            Step::Ready(value) => Some(value),
            Step::Unwind => None,
        }
    }

    /// Map the returned value
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Step<U> {
        match self {
            Step::Ready(value) => Step::Ready(f(value)),
            Step::Unwind => Step::Unwind,
        }
    }
}

/// Captures and replays the frames of one task.
#[derive(Debug)]
pub struct Fiber {
    /// Resume point of the frame at the current depth (0 = fresh entry)
    pc: Pc,

    /// Number of active levels; 0 outside a drive
    active: usize,

    /// A suspension is propagating outward
    pausing: bool,

    /// The task requested termination; frames are no longer captured
    exiting: bool,

    /// Captured frames, root first
    chain: StateChain,

    /// First protocol violation seen during the current drive
    fault: Option<ProtocolError>,
}

impl Fiber {
    /// Create an idle fiber with an empty chain
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHAIN_CAPACITY)
    }

    /// Create an idle fiber with room for `capacity` levels
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pc: 0,
            active: 0,
            pausing: false,
            exiting: false,
            chain: StateChain::with_capacity(capacity),
            fault: None,
        }
    }

    /// Resume point of the frame at the current depth
    pub fn pc(&self) -> Pc {
        self.pc
    }

    /// Current depth (root = 0), or `None` outside a drive
    pub fn depth(&self) -> Option<usize> {
        self.active.checked_sub(1)
    }

    /// Whether a suspension is propagating outward
    pub fn is_pausing(&self) -> bool {
        self.pausing
    }

    /// Whether termination was requested during this drive
    pub fn is_exiting(&self) -> bool {
        self.exiting
    }

    /// The captured frames
    pub fn chain(&self) -> &StateChain {
        &self.chain
    }

    /// Frame saved for the current depth, if this level is being replayed
    pub fn state(&self) -> Option<&Frame> {
        self.depth().and_then(|depth| self.chain.get(depth))
    }

    // =========================================================================
    // Drive bracket
    // =========================================================================

    /// Start a drive: position the fiber at the root level and expose the
    /// root frame of any saved chain
    pub fn begin(&mut self) {
        self.active = 1;
        self.pausing = false;
        self.exiting = false;
        self.fault = None;
        self.pc = self.chain.get(0).map_or(0, Frame::pc);
    }

    /// Finish a drive.
    ///
    /// Returns `true` when the procedure ran to completion (the chain fully
    /// unwound) and `false` when it stopped at a suspension.
    pub fn end(&mut self) -> Result<bool, ProtocolError> {
        if let Some(fault) = self.fault.take() {
            self.reset();
            return Err(fault);
        }
        if self.active != 1 {
            let depth = self.active.saturating_sub(1);
            self.reset();
            return Err(ProtocolError::UnbalancedEnd { depth });
        }

        let unwound = !self.pausing;
        let exiting = self.exiting;
        self.active = 0;
        self.pc = 0;
        self.pausing = false;
        self.exiting = false;

        if exiting {
            self.chain.clear();
            return Ok(false);
        }
        if unwound && !self.chain.is_empty() {
            let count = self.chain.len();
            self.chain.clear();
            return Err(ProtocolError::StaleFrames { count });
        }
        if !unwound && self.chain.get(0).is_none() {
            self.chain.clear();
            return Err(ProtocolError::MissingCapture { depth: 0 });
        }
        Ok(unwound)
    }

    // =========================================================================
    // Call boundary
    // =========================================================================

    /// Enter a callee that may suspend
    pub fn down(&mut self) {
        let depth = self.active;
        if depth == 0 {
            self.record(ProtocolError::NotDriving);
        } else if self.pausing {
            self.record(ProtocolError::BoundaryWhileUnwinding { depth });
        }
        self.active += 1;
        self.pc = self.chain.get(depth).map_or(0, Frame::pc);
    }

    /// Return from a callee; the caller must branch on the outcome
    pub fn up(&mut self) -> Result<Up, ProtocolError> {
        if self.active < 2 {
            return Err(self.record(ProtocolError::UnbalancedUp {
                active: self.active,
            }));
        }
        self.active -= 1;
        let callee = self.active;
        let caller = callee - 1;
        self.pc = 0;

        if self.pausing {
            if self.exiting {
                return Ok(Up::Propagate);
            }
            if self.chain.get(callee).is_none() {
                return Err(self.record(ProtocolError::MissingCapture { depth: callee }));
            }
            return Ok(if self.chain.get(caller).is_some() {
                Up::Propagate
            } else {
                Up::Capture
            });
        }

        if self.chain.get(callee).is_some() {
            let count = self.chain.len();
            return Err(self.record(ProtocolError::StaleFrames { count }));
        }
        Ok(match self.chain.take(caller) {
            Some(_) => Up::Retired,
            None => Up::Normal,
        })
    }

    /// Save the frame of the current level and start unwinding
    pub fn set_state(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        let depth = self.require_depth()?;
        if frame.pc() == 0 {
            return Err(self.record(ProtocolError::ZeroResumePoint { depth }));
        }
        if self.chain.get(depth).is_some() {
            return Err(self.record(ProtocolError::DuplicateCapture { depth }));
        }
        self.chain.put(depth, frame);
        self.pausing = true;
        Ok(())
    }

    /// The pause leaf.
    ///
    /// On a fresh pass this marks the current level as a pause point and
    /// starts unwinding; when replayed it clears the marker and lets forward
    /// execution continue.
    pub fn toggle_pause(&mut self) -> Result<(), ProtocolError> {
        let depth = self.require_leaf_depth()?;
        match self.chain.get(depth) {
            None => {
                self.chain.put(depth, Frame::pause_point());
                self.pausing = true;
            }
            Some(frame) if frame.is_pause_point() => {
                self.chain.take(depth);
                self.pausing = false;
            }
            Some(_) => return Err(self.record(ProtocolError::ForeignPauseSlot { depth })),
        }
        Ok(())
    }

    /// Start an unwind that is never replayed
    pub(crate) fn request_exit(&mut self) -> Result<(), ProtocolError> {
        self.require_leaf_depth()?;
        if self.pc != 0 {
            return Err(self.record(ProtocolError::ExitDuringReplay { pc: self.pc }));
        }
        self.exiting = true;
        self.pausing = true;
        Ok(())
    }

    // =========================================================================
    // Faults
    // =========================================================================

    /// Take the first protocol violation recorded during this drive
    pub fn take_fault(&mut self) -> Option<ProtocolError> {
        self.fault.take()
    }

    /// Drop all captured state and return to idle
    pub(crate) fn reset(&mut self) {
        self.pc = 0;
        self.active = 0;
        self.pausing = false;
        self.exiting = false;
        self.fault = None;
        self.chain.clear();
    }

    pub(crate) fn record(&mut self, err: ProtocolError) -> ProtocolError {
        if self.fault.is_none() {
            self.fault = Some(err.clone());
        }
        err
    }

    fn require_depth(&mut self) -> Result<usize, ProtocolError> {
        match self.depth() {
            Some(depth) => Ok(depth),
            None => Err(self.record(ProtocolError::NotDriving)),
        }
    }

    fn require_leaf_depth(&mut self) -> Result<usize, ProtocolError> {
        match self.require_depth()? {
            0 => Err(self.record(ProtocolError::UnbracketedLeaf)),
            depth if self.pausing => {
                Err(self.record(ProtocolError::BoundaryWhileUnwinding { depth }))
            }
            depth => Ok(depth),
        }
    }
}

impl Default for Fiber {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// root -> pause, driven by hand
    fn drive_root_pause(fiber: &mut Fiber, saved: &mut Vec<i32>, local: i32) -> bool {
        fiber.begin();
        let local = fiber
            .state()
            .and_then(|f| f.locals::<i32>().copied())
            .unwrap_or(local);
        fiber.down();
        fiber.toggle_pause().unwrap();
        match fiber.up().unwrap() {
            Up::Capture => fiber.set_state(Frame::new(1, local)).unwrap(),
            Up::Propagate => {}
            Up::Normal | Up::Retired => saved.push(local),
        }
        fiber.end().unwrap()
    }

    #[test]
    fn test_fresh_fiber_is_idle() {
        let fiber = Fiber::new();
        assert_eq!(fiber.pc(), 0);
        assert_eq!(fiber.depth(), None);
        assert!(fiber.chain().is_empty());
    }

    #[test]
    fn test_drive_without_calls_completes() {
        let mut fiber = Fiber::new();
        fiber.begin();
        assert_eq!(fiber.depth(), Some(0));
        assert_eq!(fiber.end(), Ok(true));
        assert_eq!(fiber.depth(), None);
    }

    #[test]
    fn test_ordinary_call_is_normal() {
        let mut fiber = Fiber::new();
        fiber.begin();
        fiber.down();
        assert_eq!(fiber.depth(), Some(1));
        assert_eq!(fiber.up(), Ok(Up::Normal));
        assert_eq!(fiber.end(), Ok(true));
    }

    #[test]
    fn test_pause_then_replay() {
        let mut fiber = Fiber::new();
        let mut seen = Vec::new();

        assert!(!drive_root_pause(&mut fiber, &mut seen, 42));
        assert_eq!(fiber.chain().len(), 2);
        assert!(seen.is_empty());

        assert!(drive_root_pause(&mut fiber, &mut seen, 0));
        assert_eq!(seen, vec![42]);
        assert!(fiber.chain().is_empty());
    }

    #[test]
    fn test_up_without_down() {
        let mut fiber = Fiber::new();
        fiber.begin();
        assert_eq!(
            fiber.up(),
            Err(ProtocolError::UnbalancedUp { active: 1 })
        );
        assert_eq!(
            fiber.end(),
            Err(ProtocolError::UnbalancedUp { active: 1 })
        );
    }

    #[test]
    fn test_end_with_open_level() {
        let mut fiber = Fiber::new();
        fiber.begin();
        fiber.down();
        assert_eq!(fiber.end(), Err(ProtocolError::UnbalancedEnd { depth: 1 }));
    }

    #[test]
    fn test_suspension_without_capture() {
        let mut fiber = Fiber::new();
        fiber.begin();
        fiber.down();
        fiber.down();
        fiber.toggle_pause().unwrap();
        assert_eq!(fiber.up(), Ok(Up::Capture));
        // depth 1 ignores the Capture outcome and returns
        assert_eq!(
            fiber.up(),
            Err(ProtocolError::MissingCapture { depth: 1 })
        );
    }

    #[test]
    fn test_root_suspension_without_capture() {
        let mut fiber = Fiber::new();
        fiber.begin();
        fiber.down();
        fiber.toggle_pause().unwrap();
        assert_eq!(fiber.up(), Ok(Up::Capture));
        assert_eq!(fiber.end(), Err(ProtocolError::MissingCapture { depth: 0 }));
        assert!(fiber.chain().is_empty());
    }

    #[test]
    fn test_unreplayed_root_frame_is_stale() {
        let mut fiber = Fiber::new();
        assert!(!drive_root_pause(&mut fiber, &mut Vec::new(), 1));

        // A second drive that ignores the saved frame and returns at once
        fiber.begin();
        assert_eq!(fiber.pc(), 1);
        assert_eq!(fiber.end(), Err(ProtocolError::StaleFrames { count: 2 }));
    }

    #[test]
    fn test_zero_resume_point_rejected() {
        let mut fiber = Fiber::new();
        fiber.begin();
        assert_eq!(
            fiber.set_state(Frame::new(0, ())),
            Err(ProtocolError::ZeroResumePoint { depth: 0 })
        );
    }

    #[test]
    fn test_leaf_at_root_rejected() {
        let mut fiber = Fiber::new();
        fiber.begin();
        assert_eq!(fiber.toggle_pause(), Err(ProtocolError::UnbracketedLeaf));
    }

    #[test]
    fn test_boundary_outside_drive() {
        let mut fiber = Fiber::new();
        fiber.down();
        assert_eq!(fiber.take_fault(), Some(ProtocolError::NotDriving));
    }

    #[test]
    fn test_exit_propagates_without_capture() {
        let mut fiber = Fiber::new();
        fiber.begin();
        fiber.down();
        fiber.down();
        fiber.request_exit().unwrap();
        assert_eq!(fiber.up(), Ok(Up::Propagate));
        assert_eq!(fiber.up(), Ok(Up::Propagate));
        assert_eq!(fiber.end(), Ok(false));
        assert!(fiber.chain().is_empty());
    }

    #[test]
    fn test_boundary_while_unwinding() {
        let mut fiber = Fiber::new();
        fiber.begin();
        fiber.down();
        fiber.toggle_pause().unwrap();
        assert_eq!(fiber.up(), Ok(Up::Capture));

        // The root ignores the Capture outcome and calls again
        fiber.down();
        assert_eq!(
            fiber.take_fault(),
            Some(ProtocolError::BoundaryWhileUnwinding { depth: 1 })
        );
    }

    #[test]
    fn test_second_leaf_in_one_bracket() {
        let mut fiber = Fiber::new();
        fiber.begin();
        fiber.down();
        fiber.toggle_pause().unwrap();
        assert_eq!(
            fiber.toggle_pause(),
            Err(ProtocolError::BoundaryWhileUnwinding { depth: 1 })
        );
        assert_eq!(
            fiber.request_exit(),
            Err(ProtocolError::BoundaryWhileUnwinding { depth: 1 })
        );
        // the pause point from the first leaf is still in place
        assert!(fiber.chain().get(1).is_some_and(Frame::is_pause_point));
    }

    #[test]
    fn test_step_helpers() {
        assert_eq!(Step::Ready(2).map(|v| v * 2), Step::Ready(4));
        assert!(Step::<u8>::Unwind.is_unwind());
        assert_eq!(Step::<u8>::Unwind.ready(), None);
        assert!(Up::Capture.is_pausing());
        assert!(!Up::Retired.is_pausing());
    }
}
