//! Heap invariant checks.

use std::fmt;
use std::ptr::NonNull;

use crate::arena::{chunk_from_ptr, Color};
use crate::gc::mark::color_of;
use crate::heap::SizeClassHeap;
use crate::object::{ObjectHeader, ObjectRef};

/// First heap invariant violation found by [`verify_heap`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    /// Masking the object's address does not lead back to its arena.
    Misplaced {
        /// Object address.
        object: usize,
    },
    /// A BLACK object without the `old` bit.
    YoungBlack {
        /// Object address.
        object: usize,
    },
    /// A reached object holds a pointer outside every live arena.
    DanglingChild {
        /// Parent address.
        parent: usize,
        /// Slot index.
        slot: usize,
        /// The stray pointer.
        child: usize,
    },
    /// A BLACK object points to a WHITE one.
    BlackToWhite {
        /// Parent address.
        parent: usize,
        /// Slot index.
        slot: usize,
        /// Child address.
        child: usize,
    },
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Misplaced { object } => {
                write!(f, "object {object:#x} does not resolve to its own arena")
            }
            Self::YoungBlack { object } => write!(f, "BLACK object {object:#x} is not old"),
            Self::DanglingChild {
                parent,
                slot,
                child,
            } => write!(
                f,
                "slot {slot} of {parent:#x} points outside the heap ({child:#x})"
            ),
            Self::BlackToWhite {
                parent,
                slot,
                child,
            } => write!(
                f,
                "BLACK object {parent:#x} points to WHITE {child:#x} in slot {slot}"
            ),
        }
    }
}

impl std::error::Error for VerifyError {}

/// Walks every arena up to its bump frontier and checks that each object
/// resolves to its arena, every BLACK object is old and has no WHITE
/// children, and every child of a reached object lives in an arena with
/// allocated objects.
///
/// # Safety
///
/// The caller must hold the mark lock, and every non-WHITE object must be
/// an initialised object.
pub unsafe fn verify_heap(heap: &SizeClassHeap) -> Result<(), VerifyError> {
    for arena in heap.arenas() {
        let header = arena.header_ptr();
        for (index, addr) in arena.objects().enumerate() {
            if chunk_from_ptr(addr as *const u8) != header {
                return Err(VerifyError::Misplaced { object: addr });
            }
            let color = arena.mark_at(index);
            if color == Color::White {
                continue;
            }

            let Some(ptr) = NonNull::new(addr as *mut ObjectHeader) else {
                continue;
            };
            let obj = unsafe { ObjectRef::from_raw(ptr) };
            if color == Color::Black && !obj.is_old() {
                return Err(VerifyError::YoungBlack { object: addr });
            }

            for slot in 0..obj.length() {
                let child = unsafe { obj.slot_unchecked(slot) };
                let live_arena = heap
                    .arena_of(child.addr())
                    .is_some_and(|id| heap.arena(id).num_alloc() > 0);
                if !live_arena {
                    return Err(VerifyError::DanglingChild {
                        parent: addr,
                        slot,
                        child: child.addr(),
                    });
                }
                if color == Color::Black && unsafe { color_of(child) } == Color::White {
                    return Err(VerifyError::BlackToWhite {
                        parent: addr,
                        slot,
                        child: child.addr(),
                    });
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::mark_byte;
    use crate::object::object_length_to_size;

    fn object(heap: &mut SizeClassHeap, length: usize, nil: Option<ObjectRef>) -> ObjectRef {
        let class = heap.class_for_length(length);
        let raw = heap
            .alloc_in_class(class, object_length_to_size(length), true)
            .unwrap();
        unsafe { ObjectRef::init(raw, length, nil) }
    }

    fn paint(obj: ObjectRef, color: Color) {
        unsafe { mark_byte(obj.as_byte_ptr()).write(color as u8) };
    }

    #[test]
    fn clean_heap_verifies() {
        let mut heap = SizeClassHeap::new(4);
        let nil = object(&mut heap, 0, None);
        let a = object(&mut heap, 3, Some(nil));
        for obj in [nil, a] {
            obj.set_old();
            paint(obj, Color::Black);
        }
        assert_eq!(unsafe { verify_heap(&heap) }, Ok(()));
    }

    #[test]
    fn detects_black_to_white_edge() {
        let mut heap = SizeClassHeap::new(4);
        let nil = object(&mut heap, 0, None);
        let a = object(&mut heap, 1, Some(nil));
        a.set_old();
        paint(a, Color::Black);
        assert_eq!(
            unsafe { verify_heap(&heap) },
            Err(VerifyError::BlackToWhite {
                parent: a.addr(),
                slot: 0,
                child: nil.addr()
            })
        );
    }

    #[test]
    fn detects_young_black_object() {
        let mut heap = SizeClassHeap::new(4);
        let a = object(&mut heap, 0, None);
        paint(a, Color::Black);
        assert_eq!(
            unsafe { verify_heap(&heap) },
            Err(VerifyError::YoungBlack { object: a.addr() })
        );
    }

    #[test]
    fn detects_pointer_into_released_arena() {
        let mut heap = SizeClassHeap::new(4);
        let stray = object(&mut heap, 40, None);
        let a = object(&mut heap, 1, Some(stray));
        let id = heap.arena_of(stray.addr()).unwrap();
        let class = heap.arena(id).header().class();
        heap.class_mut(class).free.retain(|&other| other != id);
        heap.release(id);

        paint(a, Color::Grey);
        let err = unsafe { verify_heap(&heap) }.unwrap_err();
        assert!(matches!(err, VerifyError::DanglingChild { slot: 0, .. }));
        assert!(err.to_string().contains("points outside the heap"));
    }
}
