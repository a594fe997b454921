//! Tri-color marking over the arenas' bytemaps.
//!
//! Colors only ever move WHITE -> GREY -> BLACK within a mark phase. The one
//! exception is the write barrier, which turns a BLACK parent back to GREY so
//! it is rescanned.

use crate::arena::{mark_byte, Color};
use crate::gc::mark_stack::MarkStack;
use crate::object::ObjectRef;

/// Current color of `obj`.
///
/// # Safety
///
/// `obj` must be an allocated object, and the caller must hold whatever
/// lock serializes mark-byte access.
#[must_use]
pub unsafe fn color_of(obj: ObjectRef) -> Color {
    Color::from_byte(unsafe { mark_byte(obj.as_byte_ptr()).read() })
}

unsafe fn set_color(obj: ObjectRef, color: Color) {
    unsafe { mark_byte(obj.as_byte_ptr()).write(color as u8) };
}

/// Result of a bounded drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The stack ran empty.
    Empty,
    /// The budget ran out with work left.
    BudgetExhausted,
    /// The interrupt callback asked to stop.
    Interrupted,
}

/// The marker's working state: the GREY worklist plus a blackening counter.
///
/// Always accessed under the [`MarkShared`](crate::gc::marker::MarkShared)
/// lock, which is what serializes mark-byte writes between the mutator and
/// the background marker.
#[derive(Debug)]
pub struct MarkState {
    pub(crate) stack: MarkStack,
    marked: usize,
}

impl MarkState {
    pub(crate) const fn new(stack: MarkStack) -> Self {
        Self { stack, marked: 0 }
    }

    /// Greys `obj` if it is WHITE. Returns whether it was pushed.
    ///
    /// # Safety
    ///
    /// `obj` must be an allocated object.
    pub unsafe fn shade(&mut self, obj: ObjectRef) -> bool {
        if unsafe { color_of(obj) } != Color::White {
            return false;
        }
        unsafe { set_color(obj, Color::Grey) };
        self.stack.push(obj);
        true
    }

    /// Scans one object popped from the stack.
    unsafe fn scan(&mut self, obj: ObjectRef) {
        let color = unsafe { color_of(obj) };
        debug_assert_ne!(color, Color::White, "{obj:?} on the mark stack is WHITE");
        // Pushed twice: the first pop already scanned it.
        if color == Color::Black {
            return;
        }
        for i in 0..obj.length() {
            let child = unsafe { obj.slot_unchecked(i) };
            unsafe { self.shade(child) };
        }
        obj.set_old();
        unsafe { set_color(obj, Color::Black) };
        self.marked += 1;
    }

    /// Pops and scans until the stack is empty.
    ///
    /// # Safety
    ///
    /// Every object on the stack, and everything reachable from it, must be
    /// allocated.
    pub unsafe fn drain(&mut self) {
        while let Some(obj) = self.stack.pop() {
            unsafe { self.scan(obj) };
        }
    }

    /// Scans at most `budget` objects, checking `interrupt` before each one.
    ///
    /// # Safety
    ///
    /// Same as [`MarkState::drain`].
    pub unsafe fn drain_bounded(
        &mut self,
        budget: usize,
        mut interrupt: impl FnMut() -> bool,
    ) -> DrainOutcome {
        for _ in 0..budget {
            if interrupt() {
                return DrainOutcome::Interrupted;
            }
            let Some(obj) = self.stack.pop() else {
                return DrainOutcome::Empty;
            };
            unsafe { self.scan(obj) };
        }
        if self.stack.is_empty() {
            DrainOutcome::Empty
        } else {
            DrainOutcome::BudgetExhausted
        }
    }

    /// Restores "no BLACK object points to a WHITE one" after `child` was
    /// stored into `parent`: a BLACK parent with a WHITE child goes back to
    /// GREY and onto the stack. Returns whether it was pushed.
    ///
    /// # Safety
    ///
    /// Both objects must be allocated.
    pub unsafe fn write_barrier(&mut self, parent: ObjectRef, child: ObjectRef) -> bool {
        if unsafe { color_of(parent) } == Color::Black && unsafe { color_of(child) } == Color::White
        {
            unsafe { set_color(parent, Color::Grey) };
            self.stack.push(parent);
            return true;
        }
        false
    }

    /// Objects blackened since the last call.
    pub fn take_marked(&mut self) -> usize {
        std::mem::take(&mut self.marked)
    }
}
